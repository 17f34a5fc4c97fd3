//! Queue Daemon - Entry Point
//!
//! Exits with the worker's status so a supervisor can tell a clean stop (0)
//! from an error (1), the memory ceiling (12) and the time budget (13).

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    let code = queue_daemon::run().await?;
    std::process::exit(code)
}
