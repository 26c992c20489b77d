// End-to-end correlation scenarios over in-memory transports: the real
// debuggee runtime on one side of a duplex pair, the real handler and
// correlator on the other, plus a second pair for the command channel.

use harness_core::debuggee::{run_command_loop, serve_link, DebuggeeState, THREAD_ID_BASE};
use harness_core::{
    spawn_link, CommandChannel, DebuggeeCommand, EventFilter, EventHandler, EventTag,
    EventsScenario, ScenarioConfig, ScenarioReport,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::BufReader;

struct ScenarioRun {
    report: ScenarioReport,
    unexpected_events: bool,
    abnormal_termination: bool,
}

async fn run_scenario(
    workers: u32,
    events_per_worker: u32,
    tags: Vec<EventTag>,
    filters: Vec<EventFilter>,
) -> ScenarioRun {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (debugger_link_io, debuggee_link_io) = tokio::io::duplex(64 * 1024);
    let (debugger_command_io, debuggee_command_io) = tokio::io::duplex(4096);

    // Debuggee side.
    let (state, outgoing) = DebuggeeState::new(workers);
    state.post_vm_start();
    let (link_read, link_write) = tokio::io::split(debuggee_link_io);
    let serve_state = state.clone();
    let serving =
        tokio::spawn(
            async move { serve_link(link_read, link_write, serve_state, outgoing).await },
        );
    let (command_read, command_write) = tokio::io::split(debuggee_command_io);
    let interpreting = tokio::spawn(async move {
        run_command_loop(BufReader::new(command_read), command_write, state).await
    });

    // Debugger side.
    let (read_half, write_half) = tokio::io::split(debugger_link_io);
    let link = spawn_link(read_half, write_half);
    let handler = EventHandler::new(link.clone());
    handler.start_listening().unwrap();
    let (channel_read, channel_write) = tokio::io::split(debugger_command_io);
    let mut channel = CommandChannel::new(channel_read, channel_write);

    let config = ScenarioConfig {
        event_tags: tags,
        events_per_worker,
        workers,
        filters,
        allow_extra: HashSet::new(),
        allow_missed: HashSet::new(),
        wait_time: Duration::from_secs(30),
    };
    let report = EventsScenario::new(&handler, &link, &mut channel, config)
        .unwrap()
        .run()
        .await
        .unwrap();

    channel.execute(&DebuggeeCommand::Quit).await.unwrap();
    interpreting.await.unwrap().unwrap();
    serving.await.unwrap().unwrap();

    let unexpected_events = handler.unexpected_events_seen();
    let abnormal_termination = handler.abnormal_termination();
    handler.stop().await;

    ScenarioRun {
        report,
        unexpected_events,
        abnormal_termination,
    }
}

#[tokio::test]
async fn three_workers_produce_six_correlated_enter_events() {
    let run = run_scenario(
        3,
        1,
        vec![
            EventTag::MonitorContendedEnter,
            EventTag::MonitorContendedEntered,
        ],
        Vec::new(),
    )
    .await;

    // 3 workers x 1 action x 2 event types, every one matched by monitor
    // and thread identity.
    assert!(run.report.passed);
    assert_eq!(run.report.attempts, 1);
    assert_eq!(run.report.matched, 6);
    assert!(run.report.missed.is_empty());
    assert!(run.report.extra.is_empty());
    assert!(!run.unexpected_events);
    assert!(!run.abnormal_termination);
}

#[tokio::test]
async fn wait_and_waited_correlate_across_workers() {
    let run = run_scenario(
        2,
        2,
        vec![EventTag::MonitorWait, EventTag::MonitorWaited],
        Vec::new(),
    )
    .await;

    assert!(run.report.passed);
    assert_eq!(run.report.matched, 8);
    assert!(!run.unexpected_events);
}

#[tokio::test]
async fn thread_filter_narrows_both_sides_consistently() {
    let run = run_scenario(
        3,
        1,
        vec![EventTag::MonitorContendedEntered],
        vec![EventFilter::ThreadOnly(THREAD_ID_BASE + 2)],
    )
    .await;

    // Delivery is filtered on the debuggee side and the matching save
    // flags keep the recorded list in step, so correlation stays clean.
    assert!(run.report.passed);
    assert_eq!(run.report.matched, 1);
    assert!(run.report.missed.is_empty());
    assert!(run.report.extra.is_empty());
    assert!(!run.unexpected_events);
}
