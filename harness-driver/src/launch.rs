// Debuggee launching
//
// Launching-connector equivalent: bind an ephemeral port, spawn the
// debuggee child pointed back at it, and accept its connection. Launching
// is retried a fixed number of times; on each failure the child's captured
// output is logged so a broken debuggee is diagnosable from the test log.

use harness_core::{HarnessError, HarnessOptions, HarnessResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{info, warn};

pub const LAUNCH_ATTEMPTS: usize = 3;
const LAUNCH_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct LaunchedDebuggee {
    pub child: Child,
    pub stream: TcpStream,
}

pub async fn launch_debuggee(
    options: &HarnessOptions,
    accept_timeout: Duration,
) -> HarnessResult<LaunchedDebuggee> {
    let mut last_reason = String::new();

    for attempt in 1..=LAUNCH_ATTEMPTS {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!(attempt, %addr, debuggee = %options.debuggee_path, "launching debuggee");

        let mut child = match Command::new(&options.debuggee_path)
            .arg(format!("-connect={}", addr))
            .arg(format!("-threadsNumber={}", options.threads_number))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                last_reason = format!("spawn failed: {}", e);
                warn!(attempt, "debuggee launch failed: {}", last_reason);
                tokio::time::sleep(LAUNCH_RETRY_DELAY).await;
                continue;
            }
        };

        match tokio::time::timeout(accept_timeout, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!(%peer, "debuggee connected");
                return Ok(LaunchedDebuggee { child, stream });
            }
            Ok(Err(e)) => last_reason = format!("accept failed: {}", e),
            Err(_) => {
                last_reason = format!("no connection within {:?}", accept_timeout);
            }
        }

        warn!(attempt, "debuggee launch failed: {}", last_reason);
        child.kill().await.ok();
        if let Ok(output) = child.wait_with_output().await {
            log_captured_output("stdout", &output.stdout);
            log_captured_output("stderr", &output.stderr);
        }
        tokio::time::sleep(LAUNCH_RETRY_DELAY).await;
    }

    Err(HarnessError::Launch {
        attempts: LAUNCH_ATTEMPTS,
        reason: last_reason,
    })
}

fn log_captured_output(stream: &str, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    for line in String::from_utf8_lossy(bytes).lines() {
        warn!("debuggee {}: {}", stream, line);
    }
}
