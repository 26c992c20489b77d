// Debugger driver
//
// Launches the debuggee, monitors the configured event types while the
// debuggee generates them, correlates both sides, and exits with a
// JCK-style status.

use harness_core::{
    exit_status, CommandChannel, DebuggeeCommand, EventHandler, EventsScenario, HarnessError,
    HarnessOptions, HarnessResult, ScenarioConfig, TraceLevel,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

mod launch;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = HarnessOptions::parse(&args);

    // Tracing to stderr; stdout stays quiet for the surrounding framework.
    let trace_level = options
        .as_ref()
        .map(|o| o.trace_level)
        .unwrap_or(TraceLevel::None);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(trace_level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    let passed = match options {
        Ok(options) => match run(options).await {
            Ok(passed) => passed,
            Err(e) if e.is_test_bug() => {
                error!("TEST BUG: {}", e);
                false
            }
            Err(e) => {
                error!("test run failed: {}", e);
                false
            }
        },
        Err(e) => {
            error!("TEST BUG: {}", e);
            false
        }
    };

    if passed {
        info!("TEST PASSED");
    } else {
        error!("TEST FAILED");
    }
    std::process::exit(exit_status(passed));
}

async fn run(options: HarnessOptions) -> HarnessResult<bool> {
    if options.debuggee_path.is_empty() {
        return Err(HarnessError::Config(
            "-debuggeeClassName is required".to_string(),
        ));
    }
    if options.event_tags.is_empty() {
        return Err(HarnessError::Config("-eventType is required".to_string()));
    }

    let mut launched = launch::launch_debuggee(&options, options.wait_time).await?;

    // Keep the debuggee's own log visible in ours.
    if let Some(stderr) = launched.child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("debuggee: {}", line);
            }
        });
    }

    let stdout = launched
        .child
        .stdout
        .take()
        .ok_or_else(|| HarnessError::Protocol("debuggee stdout not captured".to_string()))?;
    let stdin = launched
        .child
        .stdin
        .take()
        .ok_or_else(|| HarnessError::Protocol("debuggee stdin not captured".to_string()))?;
    let mut channel = CommandChannel::new(stdout, stdin);

    let (read_half, write_half) = launched.stream.into_split();
    let link = harness_core::spawn_link(read_half, write_half);
    let handler = EventHandler::new(link.clone());
    handler.start_listening()?;

    wait_for_vm_start(&handler, options.wait_time).await?;

    let config = ScenarioConfig {
        event_tags: options.event_tags.clone(),
        events_per_worker: options.events_number,
        workers: options.threads_number,
        filters: Vec::new(),
        allow_extra: options.allow_extra.clone(),
        allow_missed: options.allow_missed.clone(),
        wait_time: options.wait_time,
    };
    let report = EventsScenario::new(&handler, &link, &mut channel, config)?
        .run()
        .await?;

    if let Err(e) = channel.execute(&DebuggeeCommand::Quit).await {
        warn!("quit command failed: {}", e);
    }
    handler.stop().await;

    match tokio::time::timeout(Duration::from_secs(10), launched.child.wait()).await {
        Ok(Ok(status)) => info!(%status, "debuggee exited"),
        Ok(Err(e)) => warn!("failed to reap debuggee: {}", e),
        Err(_) => {
            warn!("debuggee did not exit after quit, killing it");
            launched.child.kill().await.ok();
        }
    }

    let mut passed = report.passed;
    if handler.unexpected_events_seen() {
        error!("unexpected events were delivered during the run");
        passed = false;
    }
    if handler.abnormal_termination() {
        error!("event dispatching terminated abnormally");
        passed = false;
    }
    Ok(passed)
}

/// The debuggee announces itself right after connecting; a session without
/// that announcement is broken and not worth driving.
async fn wait_for_vm_start(handler: &EventHandler, timeout: Duration) -> HarnessResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if handler.state().vm_start_seen() {
            return Ok(());
        }
        if handler.terminated().is_cancelled() {
            return Err(HarnessError::Disconnected);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err(HarnessError::Protocol(
        "debuggee never announced vm start".to_string(),
    ))
}
