// nrpc daemon entry point.
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    nrpcd::run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
