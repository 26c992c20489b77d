// Debuggee-side event records
//
// A worker appends one RecordedEvent immediately around each action that is
// expected to raise an event, provided its save flag is set. The list is
// only read by the debugger after the completion barrier and is drained on
// every fetch so repeated runs start clean.

use crate::event::{EventTag, ObjectId, ThreadId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Identity of one debuggee worker: the synthetic thread reference it runs
/// as and the monitor object it operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub thread: ThreadId,
    pub monitor: ObjectId,
}

/// Structured record of one generated event, as stored by the debuggee and
/// fetched by the debugger through introspection. Optional fields are
/// present only for the tags that define them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub tag: EventTag,
    pub thread: ThreadId,
    pub monitor: Option<ObjectId>,
    pub timeout_ms: Option<u64>,
    pub timed_out: Option<bool>,
}

impl RecordedEvent {
    pub fn thread_start(thread: ThreadId) -> Self {
        Self {
            tag: EventTag::ThreadStart,
            thread,
            monitor: None,
            timeout_ms: None,
            timed_out: None,
        }
    }

    pub fn thread_death(thread: ThreadId) -> Self {
        Self {
            tag: EventTag::ThreadDeath,
            thread,
            monitor: None,
            timeout_ms: None,
            timed_out: None,
        }
    }

    pub fn contended_enter(thread: ThreadId, monitor: ObjectId) -> Self {
        Self {
            tag: EventTag::MonitorContendedEnter,
            thread,
            monitor: Some(monitor),
            timeout_ms: None,
            timed_out: None,
        }
    }

    pub fn contended_entered(thread: ThreadId, monitor: ObjectId) -> Self {
        Self {
            tag: EventTag::MonitorContendedEntered,
            thread,
            monitor: Some(monitor),
            timeout_ms: None,
            timed_out: None,
        }
    }

    pub fn monitor_wait(thread: ThreadId, monitor: ObjectId, timeout_ms: u64) -> Self {
        Self {
            tag: EventTag::MonitorWait,
            thread,
            monitor: Some(monitor),
            timeout_ms: Some(timeout_ms),
            timed_out: None,
        }
    }

    pub fn monitor_waited(thread: ThreadId, monitor: ObjectId, timed_out: bool) -> Self {
        Self {
            tag: EventTag::MonitorWaited,
            thread,
            monitor: Some(monitor),
            timeout_ms: None,
            timed_out: Some(timed_out),
        }
    }
}

/// Shared append-only list of recorded events. Workers append concurrently;
/// the debugger reads only after the completion barrier, so the lock exists
/// for the appends, not for read/write exclusion.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    records: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: RecordedEvent) {
        self.lock().push(event);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take all records, leaving the list empty for the next run.
    pub fn drain(&self) -> Vec<RecordedEvent> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RecordedEvent>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_clears_the_list() {
        let recorder = EventRecorder::new();
        recorder.record(RecordedEvent::contended_enter(0x101, 0x1001));
        recorder.record(RecordedEvent::contended_entered(0x101, 0x1001));
        assert_eq!(recorder.len(), 2);

        let drained = recorder.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].tag, EventTag::MonitorContendedEnter);
        assert!(recorder.is_empty());
    }
}
