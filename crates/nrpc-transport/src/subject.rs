// Subject validation and wildcard matching.
//
// Subjects are dot-separated tokens. Patterns may use `*` for exactly one
// token and a trailing `>` for one or more remaining tokens.
use crate::{Result, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

/// Compiled subscription pattern.
///
/// ```
/// use nrpc_transport::SubjectPattern;
///
/// let pattern = SubjectPattern::parse("app.echo.>").expect("pattern");
/// assert!(pattern.matches("app.echo.upper"));
/// assert!(!pattern.matches("app.echo"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(TransportError::InvalidSubject(pattern.to_string()));
        }
        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut tokens = Vec::with_capacity(parts.len());
        for (idx, part) in parts.into_iter().enumerate() {
            let token = match part {
                "" => return Err(TransportError::InvalidSubject(pattern.to_string())),
                "*" => Token::Single,
                ">" if idx == last => Token::Tail,
                ">" => return Err(TransportError::InvalidSubject(pattern.to_string())),
                literal if literal.contains(char::is_whitespace) => {
                    return Err(TransportError::InvalidSubject(pattern.to_string()));
                }
                literal => Token::Literal(literal.to_string()),
            };
            tokens.push(token);
        }
        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, subject: &str) -> bool {
        let mut parts = subject.split('.');
        for token in &self.tokens {
            match token {
                Token::Tail => return parts.next().is_some(),
                Token::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Token::Literal(literal) => match parts.next() {
                    Some(part) if part == literal => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

/// Reject publish subjects that are empty, contain empty tokens or wildcards.
pub fn validate_subject(subject: &str) -> Result<()> {
    let valid = !subject.is_empty()
        && subject.split('.').all(|token| {
            !token.is_empty()
                && token != "*"
                && token != ">"
                && !token.contains(char::is_whitespace)
        });
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidSubject(subject.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exactly() {
        let pattern = SubjectPattern::parse("ns.control.ping").expect("pattern");
        assert!(pattern.matches("ns.control.ping"));
        assert!(!pattern.matches("ns.control.ping.extra"));
        assert!(!pattern.matches("ns.control"));
        assert!(!pattern.matches("ns.control.info"));
    }

    #[test]
    fn tail_wildcard_needs_at_least_one_token() {
        let pattern = SubjectPattern::parse("ns.orders.>").expect("pattern");
        assert!(pattern.matches("ns.orders.created"));
        assert!(pattern.matches("ns.orders.eu.created"));
        assert!(!pattern.matches("ns.orders"));
        assert!(!pattern.matches("ns.other.created"));
    }

    #[test]
    fn single_wildcard_matches_one_token() {
        let pattern = SubjectPattern::parse("ns.*.ping").expect("pattern");
        assert!(pattern.matches("ns.control.ping"));
        assert!(!pattern.matches("ns.a.b.ping"));
    }

    #[test]
    fn parse_rejects_malformed_patterns() {
        for bad in ["", "ns..x", "ns.>.x", ".ns", "ns.", "ns.a b"] {
            assert!(
                matches!(SubjectPattern::parse(bad), Err(TransportError::InvalidSubject(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn validate_subject_rejects_wildcards() {
        validate_subject("ns.echo.upper").expect("valid");
        assert!(validate_subject("ns.echo.>").is_err());
        assert!(validate_subject("ns.*.upper").is_err());
        assert!(validate_subject("ns..upper").is_err());
        assert!(validate_subject("").is_err());
    }
}
