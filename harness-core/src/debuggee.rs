// Debuggee runtime
//
// The observed process. Serves debugger commands over the link, interprets
// the textual command channel, and runs worker threads whose monitor
// actions generate the protocol events under test.
//
// Workers append to the recorded-event list concurrently; the debugger only
// reads it after waitExecutionCompletion returned, so the completion reply
// is the barrier that makes the fetch safe.

use crate::command::{DebuggeeCommand, ERROR_PREFIX, READY};
use crate::error::{HarnessError, HarnessResult};
use crate::event::{Event, EventKind, EventSet, EventTag, ObjectId, SuspendPolicy, ThreadId};
use crate::link::{read_frame, write_frame, Command, Frame, Reply};
use crate::recorded::{EventRecorder, RecordedEvent, WorkerIdentity};
use crate::request::EventRequestSpec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Synthetic ids assigned to worker threads and their monitor objects.
pub const THREAD_ID_BASE: ThreadId = 0x100;
pub const MONITOR_ID_BASE: ObjectId = 0x1000;

/// Timeout used by the monitor-wait action. Nothing ever notifies the
/// monitor, so the wait always times out and the waited event is
/// deterministic.
const MONITOR_WAIT_TIMEOUT_MS: u64 = 10;

struct RequestEntry {
    spec: EventRequestSpec,
    enabled: bool,
}

struct WorkerPlan {
    identity: WorkerIdentity,
    tags: Vec<EventTag>,
    events_count: u32,
    /// Staggers the acquisition-path rotation so concurrent workers start
    /// on different paths.
    path_offset: u32,
    save_event_data: Arc<AtomicBool>,
}

struct ExecutorSet {
    identities: Vec<WorkerIdentity>,
    plans: Vec<WorkerPlan>,
    handles: Vec<std::thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    started: bool,
}

struct Inner {
    workers: u32,
    requests: Mutex<HashMap<i32, RequestEntry>>,
    next_request_id: AtomicI32,
    recorder: EventRecorder,
    save_flags: Mutex<HashMap<ThreadId, Arc<AtomicBool>>>,
    executors: Mutex<Option<ExecutorSet>>,
    sink: Mutex<Option<mpsc::UnboundedSender<EventSet>>>,
}

/// Shared debuggee state. Clones are cheap handles onto one runtime.
#[derive(Clone)]
pub struct DebuggeeState {
    inner: Arc<Inner>,
}

impl DebuggeeState {
    /// `workers` is the number of action-executing threads each
    /// createActionsExecutors command creates (`-threadsNumber`).
    pub fn new(workers: u32) -> (Self, mpsc::UnboundedReceiver<EventSet>) {
        let (sink, outgoing) = mpsc::unbounded_channel();
        let state = Self {
            inner: Arc::new(Inner {
                workers,
                requests: Mutex::new(HashMap::new()),
                next_request_id: AtomicI32::new(1),
                recorder: EventRecorder::new(),
                save_flags: Mutex::new(HashMap::new()),
                executors: Mutex::new(None),
                sink: Mutex::new(Some(sink)),
            }),
        };
        (state, outgoing)
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.inner.recorder
    }

    /// Announce the session: the first thing on the wire after connect.
    pub fn post_vm_start(&self) {
        self.post(EventSet {
            suspend_policy: SuspendPolicy::None,
            events: vec![Event {
                request_id: None,
                thread: None,
                kind: EventKind::VmStart,
            }],
        });
    }

    /// Final lifecycle events, delivered as one set.
    pub fn post_shutdown(&self) {
        self.post(EventSet {
            suspend_policy: SuspendPolicy::None,
            events: vec![
                Event {
                    request_id: None,
                    thread: None,
                    kind: EventKind::VmDeath,
                },
                Event {
                    request_id: None,
                    thread: None,
                    kind: EventKind::VmDisconnect,
                },
            ],
        });
    }

    /// Stop accepting outgoing events; lets the serving loop drain and end.
    pub fn close(&self) {
        lock(&self.inner.sink).take();
    }

    fn post(&self, set: EventSet) {
        let sender = lock(&self.inner.sink).clone();
        match sender {
            Some(sender) => {
                sender.send(set).ok();
            }
            None => debug!("event sink closed, dropping event set"),
        }
    }

    /// Execute one introspection/control command from the debugger.
    pub fn handle_command(&self, command: Command) -> Reply {
        match command {
            Command::SetRequest(spec) => {
                let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
                lock(&self.inner.requests).insert(id, RequestEntry { spec, enabled: true });
                Reply::RequestSet(id)
            }
            Command::ClearRequest(request) => {
                match lock(&self.inner.requests).remove(&request) {
                    Some(_) => Reply::Ok,
                    None => Reply::Error(format!("unknown request {}", request)),
                }
            }
            Command::SetRequestEnabled { request, enabled } => {
                match lock(&self.inner.requests).get_mut(&request) {
                    Some(entry) => {
                        entry.enabled = enabled;
                        Reply::Ok
                    }
                    None => Reply::Error(format!("unknown request {}", request)),
                }
            }
            Command::Resume => Reply::Ok,
            Command::FetchRecorded => Reply::Recorded(self.inner.recorder.drain()),
            Command::FetchWorkers => {
                let identities = lock(&self.inner.executors)
                    .as_ref()
                    .map(|set| set.identities.clone())
                    .unwrap_or_default();
                Reply::Workers(identities)
            }
            Command::SetSaveFlags(flags) => {
                let map = lock(&self.inner.save_flags);
                for (thread, save) in flags {
                    match map.get(&thread) {
                        Some(flag) => flag.store(save, Ordering::SeqCst),
                        None => {
                            return Reply::Error(format!("unknown worker thread {:#x}", thread))
                        }
                    }
                }
                Reply::Ok
            }
        }
    }

    /// Build the worker plans for one run. Threads are spawned later, by
    /// startExecution, so the debugger can set save flags in between.
    pub fn create_executors(&self, events_count: u32, tags: Vec<EventTag>) -> HarnessResult<()> {
        let mut executors = lock(&self.inner.executors);
        if let Some(set) = executors.as_ref() {
            if set.started && !set.handles.is_empty() {
                return Err(HarnessError::Protocol(
                    "previous action executors still running".to_string(),
                ));
            }
        }

        let mut flags = lock(&self.inner.save_flags);
        flags.clear();

        let mut identities = Vec::with_capacity(self.inner.workers as usize);
        let mut plans = Vec::with_capacity(self.inner.workers as usize);
        for n in 0..self.inner.workers as u64 {
            let identity = WorkerIdentity {
                thread: THREAD_ID_BASE + n,
                monitor: MONITOR_ID_BASE + n,
            };
            let save_event_data = Arc::new(AtomicBool::new(true));
            flags.insert(identity.thread, Arc::clone(&save_event_data));
            identities.push(identity);
            plans.push(WorkerPlan {
                identity,
                tags: tags.clone(),
                events_count,
                path_offset: n as u32,
                save_event_data,
            });
        }

        info!(
            workers = identities.len(),
            events_count,
            tags = ?tags,
            "action executors created"
        );
        *executors = Some(ExecutorSet {
            identities,
            plans,
            handles: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            started: false,
        });
        Ok(())
    }

    pub fn start_execution(&self) -> HarnessResult<()> {
        let mut executors = lock(&self.inner.executors);
        let set = executors
            .as_mut()
            .ok_or_else(|| HarnessError::Protocol("no action executors created".to_string()))?;
        if set.started {
            return Err(HarnessError::Protocol("execution already started".to_string()));
        }
        set.started = true;

        for plan in set.plans.drain(..) {
            let state = self.clone();
            let stop = Arc::clone(&set.stop);
            let thread = plan.identity.thread;
            let handle = std::thread::Builder::new()
                .name(format!("action-executor-{:#x}", thread))
                .spawn(move || run_worker(state, plan, stop))
                .map_err(HarnessError::Io)?;
            set.handles.push(handle);
        }
        info!(workers = set.handles.len(), "execution started");
        Ok(())
    }

    /// Join every worker. Blocking; callers on the async side go through
    /// spawn_blocking.
    pub fn wait_completion(&self) -> HarnessResult<()> {
        let handles = {
            let mut executors = lock(&self.inner.executors);
            let set = executors.as_mut().ok_or_else(|| {
                HarnessError::Protocol("no action executors created".to_string())
            })?;
            if !set.started {
                return Err(HarnessError::Protocol("execution not started".to_string()));
            }
            std::mem::take(&mut set.handles)
        };

        for handle in handles {
            if handle.join().is_err() {
                return Err(HarnessError::Protocol("worker thread panicked".to_string()));
            }
        }
        info!("all action executors completed");
        Ok(())
    }

    /// Ask running workers to stop between actions.
    pub fn stop_execution(&self) {
        if let Some(set) = lock(&self.inner.executors).as_ref() {
            set.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Deliver one generated occurrence: every enabled request of the same
    /// tag whose filters accept the worker produces one event; the events
    /// are pushed as a single set.
    fn emit(&self, identity: WorkerIdentity, kind: EventKind) {
        let requests = lock(&self.inner.requests);
        let mut policy = SuspendPolicy::None;
        let mut events = Vec::new();
        for (id, entry) in requests.iter() {
            if !entry.enabled || entry.spec.tag != kind.tag() || !entry.spec.accepts(&identity) {
                continue;
            }
            if policy_rank(entry.spec.suspend_policy) > policy_rank(policy) {
                policy = entry.spec.suspend_policy;
            }
            events.push(Event {
                request_id: Some(*id),
                thread: Some(identity.thread),
                kind: kind.clone(),
            });
        }
        drop(requests);

        if !events.is_empty() {
            self.post(EventSet {
                suspend_policy: policy,
                events,
            });
        }
    }
}

fn policy_rank(policy: SuspendPolicy) -> u8 {
    match policy {
        SuspendPolicy::None => 0,
        SuspendPolicy::EventThread => 1,
        SuspendPolicy::All => 2,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The monitor object a worker operates on.
struct WorkerMonitor {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WorkerMonitor {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

fn run_worker(state: DebuggeeState, plan: WorkerPlan, stop: Arc<AtomicBool>) {
    let identity = plan.identity;
    let monitor = WorkerMonitor::new();
    let wants = |tag: EventTag| plan.tags.contains(&tag);
    debug!(thread = identity.thread, "worker starting");

    if wants(EventTag::ThreadStart) {
        if plan.save_event_data.load(Ordering::SeqCst) {
            state
                .recorder()
                .record(RecordedEvent::thread_start(identity.thread));
        }
        state.emit(identity, EventKind::ThreadStart);
    }

    for index in 0..plan.events_count {
        if stop.load(Ordering::SeqCst) {
            debug!(thread = identity.thread, "worker stopping early");
            break;
        }
        if wants(EventTag::MonitorContendedEnter) || wants(EventTag::MonitorContendedEntered) {
            perform_enter(&state, &plan, &monitor, index);
        }
        if wants(EventTag::MonitorWait) || wants(EventTag::MonitorWaited) {
            perform_wait(&state, &plan, &monitor);
        }
    }

    if wants(EventTag::ThreadDeath) {
        if plan.save_event_data.load(Ordering::SeqCst) {
            state
                .recorder()
                .record(RecordedEvent::thread_death(identity.thread));
        }
        state.emit(identity, EventKind::ThreadDeath);
    }
    debug!(thread = identity.thread, "worker done");
}

/// One monitor acquisition, rotating through three distinct code paths so
/// every acquisition source is exercised: an inline block, a method call,
/// and a generic closure runner.
fn perform_enter(state: &DebuggeeState, plan: &WorkerPlan, monitor: &WorkerMonitor, index: u32) {
    let identity = plan.identity;
    let save = plan.save_event_data.load(Ordering::SeqCst);

    if plan.tags.contains(&EventTag::MonitorContendedEnter) {
        if save {
            state
                .recorder()
                .record(RecordedEvent::contended_enter(identity.thread, identity.monitor));
        }
        state.emit(
            identity,
            EventKind::MonitorContendedEnter {
                monitor: identity.monitor,
            },
        );
    }

    let on_acquired = || {
        if plan.tags.contains(&EventTag::MonitorContendedEntered) {
            if save {
                state.recorder().record(RecordedEvent::contended_entered(
                    identity.thread,
                    identity.monitor,
                ));
            }
            state.emit(
                identity,
                EventKind::MonitorContendedEntered {
                    monitor: identity.monitor,
                },
            );
        }
    };

    match (plan.path_offset + index) % 3 {
        0 => {
            let _guard = lock(&monitor.lock);
            on_acquired();
        }
        1 => enter_via_method(monitor, on_acquired),
        _ => enter_with(monitor, on_acquired),
    }
}

fn enter_via_method(monitor: &WorkerMonitor, on_acquired: impl FnOnce()) {
    let _guard = lock(&monitor.lock);
    on_acquired();
}

fn enter_with<F: FnOnce()>(monitor: &WorkerMonitor, body: F) {
    let _guard = lock(&monitor.lock);
    body();
}

/// One timed monitor wait. Nothing notifies, so the wait reliably times
/// out.
fn perform_wait(state: &DebuggeeState, plan: &WorkerPlan, monitor: &WorkerMonitor) {
    let identity = plan.identity;
    let save = plan.save_event_data.load(Ordering::SeqCst);

    if plan.tags.contains(&EventTag::MonitorWait) {
        if save {
            state.recorder().record(RecordedEvent::monitor_wait(
                identity.thread,
                identity.monitor,
                MONITOR_WAIT_TIMEOUT_MS,
            ));
        }
        state.emit(
            identity,
            EventKind::MonitorWait {
                monitor: identity.monitor,
                timeout_ms: MONITOR_WAIT_TIMEOUT_MS,
            },
        );
    }

    let guard = lock(&monitor.lock);
    let (guard, result) = monitor
        .cond
        .wait_timeout(guard, Duration::from_millis(MONITOR_WAIT_TIMEOUT_MS))
        .unwrap_or_else(PoisonError::into_inner);
    let timed_out = result.timed_out();
    drop(guard);

    if plan.tags.contains(&EventTag::MonitorWaited) {
        if save {
            state.recorder().record(RecordedEvent::monitor_waited(
                identity.thread,
                identity.monitor,
                timed_out,
            ));
        }
        state.emit(
            identity,
            EventKind::MonitorWaited {
                monitor: identity.monitor,
                timed_out,
            },
        );
    }
}

/// Serve the debugger side of the link: answer command frames, forward
/// queued event sets. Ends when the sink is closed and drained or the peer
/// goes away.
pub async fn serve_link<R, W>(
    reader: R,
    writer: W,
    state: DebuggeeState,
    mut outgoing: mpsc::UnboundedReceiver<EventSet>,
) -> HarnessResult<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = reader;
    let mut writer = writer;
    info!("serving debug link");

    loop {
        tokio::select! {
            maybe_set = outgoing.recv() => match maybe_set {
                Some(set) => write_frame(&mut writer, &Frame::Events(set)).await?,
                None => {
                    info!("event sink closed, link serving done");
                    break;
                }
            },
            result = read_frame(&mut reader) => match result? {
                Some(Frame::Command { id, command }) => {
                    debug!(id, command = ?command, "debugger command");
                    let reply = state.handle_command(command);
                    write_frame(&mut writer, &Frame::Reply { id, reply }).await?;
                }
                Some(frame) => warn!(frame = ?frame, "unexpected frame from debugger"),
                None => {
                    info!("debugger closed the link");
                    break;
                }
            },
        }
    }
    Ok(())
}

/// Interpret the textual command channel until quit or EOF. A malformed
/// command or a failing action is answered with an error line and aborts
/// the loop: the debugger treats any non-READY reply as a protocol
/// violation, so there is no point continuing.
pub async fn run_command_loop<R, W>(
    mut reader: R,
    mut writer: W,
    state: DebuggeeState,
) -> HarnessResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            info!("command channel closed");
            state.close();
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let command = match DebuggeeCommand::parse(trimmed) {
            Ok(command) => command,
            Err(e) => {
                warn!("rejecting command {:?}: {}", trimmed, e);
                writer
                    .write_all(format!("{} {}\n", ERROR_PREFIX, e).as_bytes())
                    .await?;
                writer.flush().await?;
                return Err(e);
            }
        };
        debug!(command = %command, "executing debuggee command");
        let quitting = command == DebuggeeCommand::Quit;

        let result = match command {
            DebuggeeCommand::CreateActionsExecutors { events_count, tags } => {
                state.create_executors(events_count, tags)
            }
            DebuggeeCommand::StartExecution => state.start_execution(),
            DebuggeeCommand::WaitExecutionCompletion => {
                let state = state.clone();
                tokio::task::spawn_blocking(move || state.wait_completion())
                    .await
                    .map_err(|e| HarnessError::Protocol(format!("join failure: {}", e)))?
            }
            DebuggeeCommand::StopExecution => {
                state.stop_execution();
                Ok(())
            }
            DebuggeeCommand::Quit => {
                state.post_shutdown();
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                writer.write_all(READY.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Err(e) => {
                warn!("command failed: {}", e);
                writer
                    .write_all(format!("{} {}\n", ERROR_PREFIX, e).as_bytes())
                    .await?;
                writer.flush().await?;
                return Err(e);
            }
        }

        if quitting {
            info!("quit acknowledged, shutting down");
            state.close();
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::EventFilter;

    fn set_request(state: &DebuggeeState, spec: EventRequestSpec) -> i32 {
        match state.handle_command(Command::SetRequest(spec)) {
            Reply::RequestSet(id) => id,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn run_to_completion(state: &DebuggeeState) {
        state.start_execution().unwrap();
        let state = state.clone();
        tokio::task::spawn_blocking(move || state.wait_completion())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn workers_record_and_emit_per_action() {
        let (state, mut outgoing) = DebuggeeState::new(2);
        set_request(
            &state,
            EventRequestSpec::monitoring(EventTag::MonitorContendedEnter),
        );
        set_request(
            &state,
            EventRequestSpec::monitoring(EventTag::MonitorContendedEntered),
        );

        state
            .create_executors(
                3,
                vec![
                    EventTag::MonitorContendedEnter,
                    EventTag::MonitorContendedEntered,
                ],
            )
            .unwrap();
        run_to_completion(&state).await;

        // 2 workers x 3 actions x 2 tags recorded and emitted.
        let records = state.recorder().drain();
        assert_eq!(records.len(), 12);

        state.close();
        let mut emitted = 0;
        while let Some(set) = outgoing.recv().await {
            emitted += set.events.len();
        }
        assert_eq!(emitted, 12);
    }

    #[tokio::test]
    async fn save_flag_gates_recording_but_not_delivery() {
        let (state, mut outgoing) = DebuggeeState::new(2);
        set_request(&state, EventRequestSpec::monitoring(EventTag::MonitorWaited));

        state
            .create_executors(1, vec![EventTag::MonitorWaited])
            .unwrap();
        let flags = match state.handle_command(Command::FetchWorkers) {
            Reply::Workers(workers) => workers
                .iter()
                .map(|w| (w.thread, w.thread == THREAD_ID_BASE))
                .collect(),
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(state.handle_command(Command::SetSaveFlags(flags)), Reply::Ok);
        run_to_completion(&state).await;

        // Only the first worker saved its record.
        let records = state.recorder().drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].thread, THREAD_ID_BASE);
        assert_eq!(records[0].timed_out, Some(true));

        // Both workers still delivered events.
        state.close();
        let mut emitted = 0;
        while let Some(set) = outgoing.recv().await {
            emitted += set.events.len();
        }
        assert_eq!(emitted, 2);
    }

    #[tokio::test]
    async fn request_filters_suppress_delivery() {
        let (state, mut outgoing) = DebuggeeState::new(3);
        set_request(
            &state,
            EventRequestSpec::monitoring(EventTag::MonitorContendedEntered)
                .with_filters(&[EventFilter::ThreadOnly(THREAD_ID_BASE + 1)]),
        );

        state
            .create_executors(1, vec![EventTag::MonitorContendedEntered])
            .unwrap();
        run_to_completion(&state).await;

        state.close();
        let mut threads = Vec::new();
        while let Some(set) = outgoing.recv().await {
            for event in set.events {
                threads.push(event.thread);
            }
        }
        assert_eq!(threads, vec![Some(THREAD_ID_BASE + 1)]);
    }

    #[tokio::test]
    async fn disabled_request_generates_nothing() {
        let (state, mut outgoing) = DebuggeeState::new(1);
        let request = set_request(
            &state,
            EventRequestSpec::monitoring(EventTag::MonitorContendedEnter),
        );
        assert_eq!(
            state.handle_command(Command::SetRequestEnabled {
                request,
                enabled: false
            }),
            Reply::Ok
        );

        state
            .create_executors(1, vec![EventTag::MonitorContendedEnter])
            .unwrap();
        run_to_completion(&state).await;

        state.close();
        assert!(outgoing.recv().await.is_none());
        // The action still ran and was recorded.
        assert_eq!(state.recorder().len(), 1);
    }

    #[test]
    fn unknown_request_operations_error() {
        let (state, _outgoing) = DebuggeeState::new(1);
        assert!(matches!(
            state.handle_command(Command::ClearRequest(99)),
            Reply::Error(_)
        ));
        assert!(matches!(
            state.handle_command(Command::SetSaveFlags(vec![(0xdead, false)])),
            Reply::Error(_)
        ));
    }

    #[test]
    fn lifecycle_ordering_is_start_then_wait() {
        let (state, _outgoing) = DebuggeeState::new(1);
        assert!(state.start_execution().is_err());
        assert!(state.wait_completion().is_err());
        state.create_executors(1, vec![EventTag::MonitorWait]).unwrap();
        assert!(state.wait_completion().is_err());
    }
}
