// Subject naming shared by clients and servers.
//
// Four families live under a namespace:
//   <ns>.<service>.<method>      request routing
//   <ns>.reply.<id>              per-call reply inbox
//   <ns>.stream.<id>             per-stream inbox
//   <ns>.control.<command>       ping/info/health
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const CONTROL_SERVICE: &str = "control";
const REPLY_TOKEN: &str = "reply";
const STREAM_TOKEN: &str = "stream";

/// Service names that collide with inbox or control subjects.
pub const RESERVED_SERVICE_NAMES: [&str; 3] = [CONTROL_SERVICE, REPLY_TOKEN, STREAM_TOKEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    Ping,
    Info,
    Health,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 3] = [
        ControlCommand::Ping,
        ControlCommand::Info,
        ControlCommand::Health,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Ping => "ping",
            ControlCommand::Info => "info",
            ControlCommand::Health => "health",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "ping" => Ok(ControlCommand::Ping),
            "info" => Ok(ControlCommand::Info),
            "health" => Ok(ControlCommand::Health),
            other => Err(format!("unknown control command: {other}")),
        }
    }
}

/// Builds subjects for one namespace.
///
/// ```
/// use nrpc_wire::Subjects;
///
/// let subjects = Subjects::new("app");
/// assert_eq!(subjects.request("echo", "upper"), "app.echo.upper");
/// assert_eq!(subjects.service_wildcard("echo"), "app.echo.>");
/// assert_eq!(subjects.reply("abc"), "app.reply.abc");
/// assert!(subjects.is_stream_inbox(&subjects.stream("abc")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    namespace: Arc<str>,
}

impl Subjects {
    pub fn new(namespace: impl Into<Arc<str>>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn request(&self, service: &str, method: &str) -> String {
        format!("{}.{service}.{method}", self.namespace)
    }

    pub fn service_wildcard(&self, service: &str) -> String {
        format!("{}.{service}.>", self.namespace)
    }

    pub fn reply(&self, request_id: &str) -> String {
        format!("{}.{REPLY_TOKEN}.{request_id}", self.namespace)
    }

    pub fn stream(&self, request_id: &str) -> String {
        format!("{}.{STREAM_TOKEN}.{request_id}", self.namespace)
    }

    pub fn control(&self, command: ControlCommand) -> String {
        format!("{}.{CONTROL_SERVICE}.{command}", self.namespace)
    }

    pub fn event(&self, subject: &str) -> String {
        format!("{}.{subject}", self.namespace)
    }

    pub fn event_children(&self, subject: &str) -> String {
        format!("{}.{subject}.>", self.namespace)
    }

    pub fn is_stream_inbox(&self, subject: &str) -> bool {
        self.inbox_id(subject, STREAM_TOKEN).is_some()
    }

    pub fn is_reply_inbox(&self, subject: &str) -> bool {
        self.inbox_id(subject, REPLY_TOKEN).is_some()
    }

    // Returns the id token of `<ns>.<family>.<id>`.
    fn inbox_id<'a>(&self, subject: &'a str, family: &str) -> Option<&'a str> {
        let rest = subject.strip_prefix(self.namespace.as_ref())?;
        let rest = rest.strip_prefix('.')?;
        let id = rest.strip_prefix(family)?.strip_prefix('.')?;
        (!id.is_empty() && !id.contains('.')).then_some(id)
    }
}
