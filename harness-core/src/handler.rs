// Event handler
//
// One dedicated task drains event sets from the link queue and fans each
// event out to listeners in priority order until one claims it. The
// listener registry is guarded by a single lock; registration changes and
// dispatch iteration are serialized on it.

use crate::event::{Event, EventSet, EventTag};
use crate::link::LinkHandle;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capability object invoked by the dispatch loop. Hooks run inline on the
/// dispatch task, so they must not block indefinitely.
pub trait EventListener: Send {
    /// Called once per event set before any event in it is dispatched.
    fn event_set_received(&mut self, _set: &EventSet) {}

    /// Offer one event. Return `true` to claim it; no later listener sees a
    /// claimed event.
    fn handle_event(&mut self, event: &Event) -> bool;

    /// Asked after the listener claims an event. A `true` removes the
    /// listener once the current set's epilogue has run.
    fn remove_after_handling(&self) -> bool {
        false
    }

    /// Called once per event set after every event in it was dispatched.
    /// A listener that requested removal still gets this final call.
    fn event_set_complete(&mut self, _set: &EventSet) {}
}

/// Registry handle for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    listener: Box<dyn EventListener>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Registered>,
    next_id: u64,
}

/// Session flags shared between the dispatch task and its owner.
#[derive(Debug, Default)]
pub struct SessionState {
    disconnected: AtomicBool,
    unexpected_events: AtomicBool,
    abnormal_termination: AtomicBool,
    vm_start_seen: AtomicBool,
    vm_death_seen: AtomicBool,
}

impl SessionState {
    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn unexpected_events_seen(&self) -> bool {
        self.unexpected_events.load(Ordering::SeqCst)
    }

    pub fn abnormal_termination(&self) -> bool {
        self.abnormal_termination.load(Ordering::SeqCst)
    }

    pub fn vm_start_seen(&self) -> bool {
        self.vm_start_seen.load(Ordering::SeqCst)
    }

    pub fn vm_death_seen(&self) -> bool {
        self.vm_death_seen.load(Ordering::SeqCst)
    }
}

/// Asynchronous event-dispatch loop over one debug session.
pub struct EventHandler {
    link: LinkHandle,
    registry: Arc<Mutex<Registry>>,
    state: Arc<SessionState>,
    cancel: CancellationToken,
    terminated: CancellationToken,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventHandler {
    pub fn new(link: LinkHandle) -> Self {
        Self {
            link,
            registry: Arc::new(Mutex::new(Registry::default())),
            state: Arc::new(SessionState::default()),
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn unexpected_events_seen(&self) -> bool {
        self.state.unexpected_events_seen()
    }

    pub fn abnormal_termination(&self) -> bool {
        self.state.abnormal_termination()
    }

    /// Resolves when the dispatch loop has exited, for any reason.
    pub fn terminated(&self) -> &CancellationToken {
        &self.terminated
    }

    /// Add a listener at the head of the registry: the listener added last
    /// is the first offered each event.
    pub fn add_listener(&self, listener: Box<dyn EventListener>) -> ListenerId {
        let mut registry = lock_registry(&self.registry);
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.entries.insert(0, Registered { id, listener });
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = lock_registry(&self.registry);
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        registry.entries.len() != before
    }

    /// Install the default listeners and start the dispatch task. Must be
    /// called exactly once.
    pub fn start_listening(&self) -> crate::error::HarnessResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(crate::error::HarnessError::Protocol(
                "event handler already started".to_string(),
            ));
        }

        // Installed in reverse priority order: the catcher is added first,
        // so every later listener outranks it.
        self.add_listener(Box::new(UnexpectedEventCatcher {
            state: Arc::clone(&self.state),
        }));
        self.add_listener(Box::new(VmDisconnectListener));
        self.add_listener(Box::new(VmLifecycleListener {
            tag: EventTag::VmDeath,
            state: Arc::clone(&self.state),
            fired: false,
        }));
        self.add_listener(Box::new(VmLifecycleListener {
            tag: EventTag::VmStart,
            state: Arc::clone(&self.state),
            fired: false,
        }));

        let task = tokio::spawn(dispatch_task(
            self.link.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.state),
            self.cancel.clone(),
            self.terminated.clone(),
        ));
        *lock_task(&self.task) = Some(task);
        Ok(())
    }

    /// Request cooperative cancellation and wait for the dispatch task to
    /// exit. Cancellation arriving while the task blocks on the queue is a
    /// clean exit, not an error.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = lock_task(&self.task).take();
        if let Some(task) = task {
            if task.await.is_err() {
                // Task panics are already recorded as abnormal termination.
                warn!("dispatch task join failed");
            }
        }
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_task(task: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    task.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn dispatch_task(
    link: LinkHandle,
    registry: Arc<Mutex<Registry>>,
    state: Arc<SessionState>,
    cancel: CancellationToken,
    terminated: CancellationToken,
) {
    info!("event dispatch loop started");
    let _done = terminated.drop_guard();

    loop {
        let event_set = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("dispatch loop cancelled");
                break;
            }
            maybe_set = link.recv_event_set() => match maybe_set {
                Some(set) => set,
                None => {
                    info!("event queue closed, session disconnected");
                    state.disconnected.store(true, Ordering::SeqCst);
                    break;
                }
            },
        };

        // A fault inside a listener poisons the whole session: mark it
        // disconnected and stop rather than dispatch over broken state.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            dispatch_set(&registry, &state, &event_set)
        }));
        match outcome {
            Ok(SetOutcome::Continue) => {}
            Ok(SetOutcome::Disconnected) => {
                info!("vm-disconnect received, dispatch loop ending");
                state.disconnected.store(true, Ordering::SeqCst);
                break;
            }
            Err(panic) => {
                error!("fatal error during event dispatch: {:?}", panic_message(&panic));
                state.disconnected.store(true, Ordering::SeqCst);
                state.abnormal_termination.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    info!("event dispatch loop stopped");
}

enum SetOutcome {
    Continue,
    Disconnected,
}

/// Dispatch one event set. The registry lock is held for the whole set, so
/// listener adds and removals never interleave with delivery.
fn dispatch_set(
    registry: &Mutex<Registry>,
    state: &SessionState,
    event_set: &EventSet,
) -> SetOutcome {
    let mut registry = lock_registry(registry);
    let mut outcome = SetOutcome::Continue;
    let mut removed: Vec<ListenerId> = Vec::new();

    for entry in registry.entries.iter_mut() {
        entry.listener.event_set_received(event_set);
    }

    for event in &event_set.events {
        if event.tag() == EventTag::VmDisconnect {
            outcome = SetOutcome::Disconnected;
        }

        let mut claimed = false;
        for entry in registry.entries.iter_mut() {
            // A listener that already requested removal is skipped for the
            // rest of the set; it only gets its final epilogue call.
            if removed.contains(&entry.id) {
                continue;
            }
            if entry.listener.handle_event(event) {
                claimed = true;
                if entry.listener.remove_after_handling() {
                    debug!(id = ?entry.id, "listener requested removal");
                    removed.push(entry.id);
                }
                break;
            }
        }

        if !claimed && event.tag() != EventTag::VmDisconnect {
            warn!(event = ?event, "event claimed by no listener");
            state.unexpected_events.store(true, Ordering::SeqCst);
        }
    }

    for entry in registry.entries.iter_mut() {
        entry.listener.event_set_complete(event_set);
    }
    registry.entries.retain(|entry| !removed.contains(&entry.id));

    outcome
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fallback listener at the lowest priority. Every event that reaches it is
/// unexpected: flag it, keep the loop running.
struct UnexpectedEventCatcher {
    state: Arc<SessionState>,
}

impl EventListener for UnexpectedEventCatcher {
    fn handle_event(&mut self, event: &Event) -> bool {
        warn!(event = ?event, "unexpected event");
        self.state.unexpected_events.store(true, Ordering::SeqCst);
        true
    }
}

/// One-shot listener for VmStart / VmDeath. Exactly one of each is expected
/// per session; the listener self-removes after firing so a repeat falls
/// through to the unexpected-event catcher.
struct VmLifecycleListener {
    tag: EventTag,
    state: Arc<SessionState>,
    fired: bool,
}

impl EventListener for VmLifecycleListener {
    fn handle_event(&mut self, event: &Event) -> bool {
        if event.tag() != self.tag {
            return false;
        }
        self.fired = true;
        let flag = match self.tag {
            EventTag::VmStart => &self.state.vm_start_seen,
            _ => &self.state.vm_death_seen,
        };
        flag.store(true, Ordering::SeqCst);
        info!(tag = %self.tag, "vm lifecycle event");
        true
    }

    fn remove_after_handling(&self) -> bool {
        self.fired
    }
}

/// Claims VmDisconnect so it never counts as unexpected. The loop's run
/// condition itself reacts to the tag.
struct VmDisconnectListener;

impl EventListener for VmDisconnectListener {
    fn handle_event(&mut self, event: &Event) -> bool {
        event.tag() == EventTag::VmDisconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, SuspendPolicy};
    use crate::link::{spawn_link, write_frame, Frame};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingListener {
        tag: EventTag,
        hits: Arc<AtomicUsize>,
        one_shot: bool,
        fired: bool,
    }

    impl CountingListener {
        fn claiming(tag: EventTag, hits: Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                tag,
                hits,
                one_shot: false,
                fired: false,
            })
        }

        fn one_shot(tag: EventTag, hits: Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                tag,
                hits,
                one_shot: true,
                fired: false,
            })
        }
    }

    impl EventListener for CountingListener {
        fn handle_event(&mut self, event: &Event) -> bool {
            if event.tag() != self.tag {
                return false;
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.fired = true;
            true
        }

        fn remove_after_handling(&self) -> bool {
            self.one_shot && self.fired
        }
    }

    fn monitor_event() -> Event {
        Event {
            request_id: Some(1),
            thread: Some(0x101),
            kind: EventKind::MonitorContendedEnter { monitor: 0x1001 },
        }
    }

    fn set_of(events: Vec<Event>) -> EventSet {
        EventSet {
            suspend_policy: SuspendPolicy::None,
            events,
        }
    }

    fn bare_registry() -> Mutex<Registry> {
        Mutex::new(Registry::default())
    }

    fn add(registry: &Mutex<Registry>, listener: Box<dyn EventListener>) -> ListenerId {
        let mut reg = lock_registry(registry);
        reg.next_id += 1;
        let id = ListenerId(reg.next_id);
        reg.entries.insert(0, Registered { id, listener });
        id
    }

    #[test]
    fn later_listener_outranks_earlier_one() {
        let registry = bare_registry();
        let state = SessionState::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        add(
            &registry,
            CountingListener::claiming(EventTag::MonitorContendedEnter, Arc::clone(&first)),
        );
        add(
            &registry,
            CountingListener::claiming(EventTag::MonitorContendedEnter, Arc::clone(&second)),
        );

        dispatch_set(&registry, &state, &set_of(vec![monitor_event()]));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!state.unexpected_events_seen());
    }

    #[test]
    fn one_shot_listener_never_fires_twice() {
        let registry = bare_registry();
        let state = SessionState::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let fallback = Arc::new(AtomicUsize::new(0));

        add(
            &registry,
            CountingListener::claiming(EventTag::MonitorContendedEnter, Arc::clone(&fallback)),
        );
        add(
            &registry,
            CountingListener::one_shot(EventTag::MonitorContendedEnter, Arc::clone(&hits)),
        );

        // Two events in one set, then another set: the one-shot claims only
        // the first event and is gone afterwards.
        dispatch_set(
            &registry,
            &state,
            &set_of(vec![monitor_event(), monitor_event()]),
        );
        dispatch_set(&registry, &state, &set_of(vec![monitor_event()]));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.load(Ordering::SeqCst), 2);
        assert_eq!(lock_registry(&registry).entries.len(), 1);
    }

    #[test]
    fn unclaimed_event_sets_the_unexpected_flag() {
        let registry = bare_registry();
        let state = SessionState::default();

        dispatch_set(&registry, &state, &set_of(vec![monitor_event()]));

        assert!(state.unexpected_events_seen());
    }

    #[test]
    fn removed_listener_still_gets_the_set_epilogue() {
        struct EpilogueProbe {
            epilogues: Arc<AtomicUsize>,
        }
        impl EventListener for EpilogueProbe {
            fn handle_event(&mut self, _event: &Event) -> bool {
                true
            }
            fn remove_after_handling(&self) -> bool {
                true
            }
            fn event_set_complete(&mut self, _set: &EventSet) {
                self.epilogues.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = bare_registry();
        let state = SessionState::default();
        let epilogues = Arc::new(AtomicUsize::new(0));
        add(
            &registry,
            Box::new(EpilogueProbe {
                epilogues: Arc::clone(&epilogues),
            }),
        );

        dispatch_set(&registry, &state, &set_of(vec![monitor_event()]));

        assert_eq!(epilogues.load(Ordering::SeqCst), 1);
        assert!(lock_registry(&registry).entries.is_empty());
    }

    #[tokio::test]
    async fn vm_disconnect_terminates_the_loop() {
        let (debugger_io, mut peer) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(debugger_io);
        let handler = EventHandler::new(spawn_link(read_half, write_half));
        handler.start_listening().unwrap();

        write_frame(
            &mut peer,
            &Frame::Events(set_of(vec![Event {
                request_id: None,
                thread: None,
                kind: EventKind::VmDisconnect,
            }])),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler.terminated().cancelled())
            .await
            .expect("dispatch loop did not terminate");
        assert!(handler.state().disconnected());
        assert!(!handler.unexpected_events_seen());
    }

    #[tokio::test]
    async fn vm_start_is_claimed_once_then_flagged() {
        let (debugger_io, mut peer) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(debugger_io);
        let handler = EventHandler::new(spawn_link(read_half, write_half));
        handler.start_listening().unwrap();

        let vm_start = Event {
            request_id: None,
            thread: None,
            kind: EventKind::VmStart,
        };
        write_frame(&mut peer, &Frame::Events(set_of(vec![vm_start.clone()])))
            .await
            .unwrap();
        write_frame(&mut peer, &Frame::Events(set_of(vec![vm_start])))
            .await
            .unwrap();
        write_frame(
            &mut peer,
            &Frame::Events(set_of(vec![Event {
                request_id: None,
                thread: None,
                kind: EventKind::VmDisconnect,
            }])),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler.terminated().cancelled())
            .await
            .expect("dispatch loop did not terminate");
        assert!(handler.state().vm_start_seen());
        // The second VmStart fell through to the catcher.
        assert!(handler.unexpected_events_seen());
    }

    #[tokio::test]
    async fn start_listening_twice_is_an_error() {
        let (debugger_io, _peer) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(debugger_io);
        let handler = EventHandler::new(spawn_link(read_half, write_half));

        handler.start_listening().unwrap();
        assert!(handler.start_listening().is_err());
        handler.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_a_blocked_loop() {
        let (debugger_io, _peer) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(debugger_io);
        let handler = EventHandler::new(spawn_link(read_half, write_half));
        handler.start_listening().unwrap();

        // The loop is blocked on the queue; stop must return promptly and
        // leave no abnormal-termination mark.
        tokio::time::timeout(Duration::from_secs(5), handler.stop())
            .await
            .expect("stop did not complete");
        assert!(!handler.abnormal_termination());
    }
}
