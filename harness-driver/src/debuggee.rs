// Debuggee binary
//
// Connects back to the debugger that launched it, announces the session on
// the link, then interprets commands from stdin until quit. Worker threads
// created on request generate the monitor events the debugger observes.

use anyhow::{bail, Context, Result};
use harness_core::debuggee::{run_command_loop, serve_link, DebuggeeState};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr; stdout carries command replies.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut connect = None;
    let mut workers: u32 = 1;
    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("-connect=") {
            connect = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("-threadsNumber=") {
            workers = value.parse().context("bad -threadsNumber value")?;
            if workers == 0 {
                bail!("-threadsNumber must be positive");
            }
        } else {
            bail!("unrecognized option {:?}", arg);
        }
    }
    let connect = connect.context("-connect=host:port is required")?;

    info!(%connect, workers, "debuggee starting");
    let stream = TcpStream::connect(&connect)
        .await
        .with_context(|| format!("cannot connect to debugger at {}", connect))?;
    let (read_half, write_half) = stream.into_split();

    let (state, outgoing) = DebuggeeState::new(workers);
    state.post_vm_start();

    let link_state = state.clone();
    let link_task =
        tokio::spawn(async move { serve_link(read_half, write_half, link_state, outgoing).await });

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let result = run_command_loop(stdin, stdout, state).await;

    match link_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("link serving failed: {}", e),
        Err(e) => warn!("link task panicked: {}", e),
    }

    result.context("command loop failed")?;
    info!("debuggee exiting");
    Ok(())
}
