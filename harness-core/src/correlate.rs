// Cross-process event correlator
//
// Verifies that actions performed in the debuggee generated exactly the
// expected events. Generation and delivery are unordered across processes,
// so correlation is post-hoc: collect everything, fetch the debuggee's
// records through introspection, then match the two sides.

use crate::command::{CommandChannel, DebuggeeCommand};
use crate::error::{HarnessError, HarnessResult};
use crate::event::{Event, EventTag, ObjectId, RequestId, ThreadId};
use crate::handler::{EventHandler, EventListener};
use crate::link::LinkHandle;
use crate::recorded::RecordedEvent;
use crate::request::{EventFilter, EventRequestSpec};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on transparent scenario reruns when no events arrived at
/// all. Total absence is treated as a scheduling flake; any partial result
/// is a hard failure and is never retried.
pub const MAX_RERUNS: usize = 10;

/// How long the received-event stream must stay quiet after the debuggee
/// signals completion before the correlator considers delivery finished.
const QUIESCENCE: Duration = Duration::from_secs(1);

/// Granularity of the quiescence poll.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Debugger-side mirror of one debuggee event record, built from fetched
/// state by an explicit per-tag constructor. Carries the type-specific
/// equality predicate used to claim received events.
#[derive(Debug, Clone, PartialEq)]
pub enum DebuggerEventData {
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    MonitorContendedEnter {
        thread: ThreadId,
        monitor: ObjectId,
    },
    MonitorContendedEntered {
        thread: ThreadId,
        monitor: ObjectId,
    },
    MonitorWait {
        thread: ThreadId,
        monitor: ObjectId,
        timeout_ms: u64,
    },
    MonitorWaited {
        thread: ThreadId,
        monitor: ObjectId,
        timed_out: bool,
    },
}

impl DebuggerEventData {
    pub fn from_recorded(record: &RecordedEvent) -> HarnessResult<Self> {
        let missing = |field: &str| {
            HarnessError::Protocol(format!(
                "recorded {} event is missing field {:?}",
                record.tag, field
            ))
        };
        match record.tag {
            EventTag::ThreadStart => Ok(DebuggerEventData::ThreadStart {
                thread: record.thread,
            }),
            EventTag::ThreadDeath => Ok(DebuggerEventData::ThreadDeath {
                thread: record.thread,
            }),
            EventTag::MonitorContendedEnter => Ok(DebuggerEventData::MonitorContendedEnter {
                thread: record.thread,
                monitor: record.monitor.ok_or_else(|| missing("monitor"))?,
            }),
            EventTag::MonitorContendedEntered => Ok(DebuggerEventData::MonitorContendedEntered {
                thread: record.thread,
                monitor: record.monitor.ok_or_else(|| missing("monitor"))?,
            }),
            EventTag::MonitorWait => Ok(DebuggerEventData::MonitorWait {
                thread: record.thread,
                monitor: record.monitor.ok_or_else(|| missing("monitor"))?,
                timeout_ms: record.timeout_ms.ok_or_else(|| missing("timeout_ms"))?,
            }),
            EventTag::MonitorWaited => Ok(DebuggerEventData::MonitorWaited {
                thread: record.thread,
                monitor: record.monitor.ok_or_else(|| missing("monitor"))?,
                timed_out: record.timed_out.ok_or_else(|| missing("timed_out"))?,
            }),
            tag => Err(HarnessError::Protocol(format!(
                "recorded event has non-correlatable tag {}",
                tag
            ))),
        }
    }

    pub fn tag(&self) -> EventTag {
        match self {
            DebuggerEventData::ThreadStart { .. } => EventTag::ThreadStart,
            DebuggerEventData::ThreadDeath { .. } => EventTag::ThreadDeath,
            DebuggerEventData::MonitorContendedEnter { .. } => EventTag::MonitorContendedEnter,
            DebuggerEventData::MonitorContendedEntered { .. } => {
                EventTag::MonitorContendedEntered
            }
            DebuggerEventData::MonitorWait { .. } => EventTag::MonitorWait,
            DebuggerEventData::MonitorWaited { .. } => EventTag::MonitorWaited,
        }
    }

    /// Protocol-level identity check against a live event: thread equality,
    /// monitor equality, and the type-specific fields.
    pub fn matches(&self, event: &Event) -> bool {
        use crate::event::EventKind;

        match (self, &event.kind) {
            (DebuggerEventData::ThreadStart { thread }, EventKind::ThreadStart)
            | (DebuggerEventData::ThreadDeath { thread }, EventKind::ThreadDeath) => {
                event.thread == Some(*thread)
            }
            (
                DebuggerEventData::MonitorContendedEnter { thread, monitor },
                EventKind::MonitorContendedEnter { monitor: seen },
            )
            | (
                DebuggerEventData::MonitorContendedEntered { thread, monitor },
                EventKind::MonitorContendedEntered { monitor: seen },
            ) => event.thread == Some(*thread) && seen == monitor,
            (
                DebuggerEventData::MonitorWait {
                    thread,
                    monitor,
                    timeout_ms,
                },
                EventKind::MonitorWait {
                    monitor: seen,
                    timeout_ms: seen_timeout,
                },
            ) => event.thread == Some(*thread) && seen == monitor && seen_timeout == timeout_ms,
            (
                DebuggerEventData::MonitorWaited {
                    thread,
                    monitor,
                    timed_out,
                },
                EventKind::MonitorWaited {
                    monitor: seen,
                    timed_out: seen_flag,
                },
            ) => event.thread == Some(*thread) && seen == monitor && seen_flag == timed_out,
            _ => false,
        }
    }
}

/// Result of the two-sided matching pass. Every input event lands in
/// exactly one of the three buckets.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub matched: Vec<(DebuggerEventData, Event)>,
    /// Expected entries no received event claimed.
    pub missed: Vec<DebuggerEventData>,
    /// Received events no expected entry claimed.
    pub extra: Vec<Event>,
}

/// Match received events against expected records, tag by tag. An expected
/// entry claims at most one received event; claimed pairs leave both sides.
pub fn match_events(expected: Vec<DebuggerEventData>, received: Vec<Event>) -> MatchOutcome {
    let mut remaining: HashMap<EventTag, Vec<DebuggerEventData>> = HashMap::new();
    for entry in expected {
        remaining.entry(entry.tag()).or_default().push(entry);
    }

    let mut outcome = MatchOutcome::default();
    for event in received {
        let claimed = remaining
            .get_mut(&event.tag())
            .and_then(|entries| {
                entries
                    .iter()
                    .position(|entry| entry.matches(&event))
                    .map(|index| entries.remove(index))
            });
        match claimed {
            Some(entry) => outcome.matched.push((entry, event)),
            None => outcome.extra.push(event),
        }
    }

    for (_, mut entries) in remaining {
        outcome.missed.append(&mut entries);
    }
    outcome
}

/// Decide whether a finished attempt should be transparently rerun.
/// Only total absence of received events qualifies, only while the attempt
/// budget lasts, and never once the session has already failed for another
/// reason.
pub fn should_rerun(
    attempt: usize,
    expected: &[DebuggerEventData],
    received: &[Event],
    already_failed: bool,
) -> bool {
    !already_failed && received.is_empty() && !expected.is_empty() && attempt < MAX_RERUNS
}

/// Scenario configuration, mostly straight from the CLI.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub event_tags: Vec<EventTag>,
    /// Actions per worker (`-eventsNumber`).
    pub events_per_worker: u32,
    /// Worker thread count (`-threadsNumber`).
    pub workers: u32,
    pub filters: Vec<EventFilter>,
    pub allow_extra: HashSet<EventTag>,
    pub allow_missed: HashSet<EventTag>,
    /// Overall cap on waiting for event delivery per attempt.
    pub wait_time: Duration,
}

impl ScenarioConfig {
    pub fn validate(&self) -> HarnessResult<()> {
        if self.event_tags.is_empty() {
            return Err(HarnessError::Config("no event types to monitor".to_string()));
        }
        if let Some(tag) = self.event_tags.iter().find(|t| !t.is_correlatable()) {
            return Err(HarnessError::Config(format!(
                "event type {} cannot be generated by debuggee actions",
                tag
            )));
        }
        if self.workers == 0 || self.events_per_worker == 0 {
            return Err(HarnessError::Config(
                "workers and events per worker must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a full scenario run.
#[derive(Debug)]
pub struct ScenarioReport {
    pub attempts: usize,
    pub matched: usize,
    pub missed: Vec<DebuggerEventData>,
    pub extra: Vec<Event>,
    pub passed: bool,
}

/// Drives one correlation scenario end to end: request setup, debuggee
/// commands, event collection, introspection fetch, matching, and the
/// bounded zero-events rerun.
pub struct EventsScenario<'a> {
    handler: &'a EventHandler,
    link: &'a LinkHandle,
    channel: &'a mut CommandChannel,
    config: ScenarioConfig,
}

impl<'a> EventsScenario<'a> {
    pub fn new(
        handler: &'a EventHandler,
        link: &'a LinkHandle,
        channel: &'a mut CommandChannel,
        config: ScenarioConfig,
    ) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self {
            handler,
            link,
            channel,
            config,
        })
    }

    pub async fn run(&mut self) -> HarnessResult<ScenarioReport> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (expected, received) = self.run_once().await?;

            let already_failed = self.handler.unexpected_events_seen()
                || self.handler.abnormal_termination();
            if should_rerun(attempt, &expected, &received, already_failed) {
                warn!(
                    attempt,
                    "no events received, rerunning scenario (possible scheduling flake)"
                );
                continue;
            }

            let outcome = match_events(expected, received);
            let hard_missed: Vec<DebuggerEventData> = outcome
                .missed
                .into_iter()
                .filter(|entry| !self.config.allow_missed.contains(&entry.tag()))
                .collect();
            let hard_extra: Vec<Event> = outcome
                .extra
                .into_iter()
                .filter(|event| !self.config.allow_extra.contains(&event.tag()))
                .collect();

            let passed = hard_missed.is_empty() && hard_extra.is_empty();
            if !passed {
                for entry in &hard_missed {
                    warn!(expected = ?entry, "missed event");
                }
                for event in &hard_extra {
                    warn!(received = ?event, "extra event");
                }
            }
            info!(
                attempt,
                matched = outcome.matched.len(),
                missed = hard_missed.len(),
                extra = hard_extra.len(),
                passed,
                "scenario attempt complete"
            );
            return Ok(ScenarioReport {
                attempts: attempt,
                matched: outcome.matched.len(),
                missed: hard_missed,
                extra: hard_extra,
                passed,
            });
        }
    }

    /// One attempt: returns (expected, received) for matching.
    async fn run_once(&mut self) -> HarnessResult<(Vec<DebuggerEventData>, Vec<Event>)> {
        // Non-intrusive monitoring requests, one per event type.
        let mut requests: Vec<RequestId> = Vec::with_capacity(self.config.event_tags.len());
        for tag in &self.config.event_tags {
            let spec =
                EventRequestSpec::monitoring(*tag).with_filters(&self.config.filters);
            requests.push(self.link.set_request(spec).await?);
        }

        let sink: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let collector = self.handler.add_listener(Box::new(CollectingListener {
            requests: requests.iter().copied().collect(),
            sink: Arc::clone(&sink),
        }));

        let attempt_result = self.drive_debuggee(&sink).await;

        // Collector and requests must not leak into the next attempt.
        self.handler.remove_listener(collector);
        for request in &requests {
            if let Err(e) = self.link.clear_request(*request).await {
                warn!(request = *request, "failed to clear request: {}", e);
            }
        }

        let expected = attempt_result?;
        let received = std::mem::take(
            &mut *sink.lock().unwrap_or_else(PoisonError::into_inner),
        );
        Ok((expected, received))
    }

    async fn drive_debuggee(
        &mut self,
        sink: &Arc<Mutex<Vec<Event>>>,
    ) -> HarnessResult<Vec<DebuggerEventData>> {
        self.channel
            .execute(&DebuggeeCommand::CreateActionsExecutors {
                events_count: self.config.events_per_worker,
                tags: self.config.event_tags.clone(),
            })
            .await?;

        // Evaluate every active filter against each worker's identity to
        // decide which workers save event data, before generation starts.
        let workers = self.link.fetch_workers().await?;
        if workers.len() != self.config.workers as usize {
            return Err(HarnessError::Protocol(format!(
                "debuggee created {} workers, expected {}",
                workers.len(),
                self.config.workers
            )));
        }
        let flags: Vec<(u64, bool)> = workers
            .iter()
            .map(|worker| {
                let save = self.config.filters.iter().all(|f| f.accepts(worker));
                (worker.thread, save)
            })
            .collect();
        self.link.set_save_flags(flags).await?;

        self.channel.execute(&DebuggeeCommand::StartExecution).await?;
        self.channel
            .execute(&DebuggeeCommand::WaitExecutionCompletion)
            .await?;

        // Completion of the actions does not order event delivery; wait for
        // the collected stream to go quiet before reading anything back.
        self.await_quiescence(sink).await;

        let records = self.link.fetch_recorded().await?;
        records.iter().map(DebuggerEventData::from_recorded).collect()
    }

    /// Wait until the collector saw no new events for a full quiescence
    /// window, or until the per-attempt wait budget runs out.
    async fn await_quiescence(&self, sink: &Arc<Mutex<Vec<Event>>>) {
        let deadline = Instant::now() + self.config.wait_time;
        let mut idle = Duration::ZERO;
        let mut seen = sink.lock().unwrap_or_else(PoisonError::into_inner).len();
        while idle < QUIESCENCE && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            let len = sink.lock().unwrap_or_else(PoisonError::into_inner).len();
            if len == seen {
                idle += POLL_INTERVAL;
            } else {
                seen = len;
                idle = Duration::ZERO;
            }
        }
        debug!(events = seen, "event stream quiescent");
    }
}

/// Listener collecting every event produced by the scenario's requests.
struct CollectingListener {
    requests: HashSet<RequestId>,
    sink: Arc<Mutex<Vec<Event>>>,
}

impl EventListener for CollectingListener {
    fn handle_event(&mut self, event: &Event) -> bool {
        let Some(request_id) = event.request_id else {
            return false;
        };
        if !self.requests.contains(&request_id) {
            return false;
        }
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        true
    }
}
