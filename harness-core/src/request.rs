// Event requests
//
// A request registers interest in future occurrences of one event kind.
// Filters restrict which workers a request fires for; the same two filter
// kinds are evaluated debugger-side to decide which workers record their
// generated events.

use crate::event::{EventTag, ObjectId, SuspendPolicy, ThreadId};
use crate::recorded::WorkerIdentity;
use serde::{Deserialize, Serialize};

/// Identity filter attached to an event request. Exactly two kinds exist:
/// object identity (the monitor a worker operates on) and thread identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    MonitorOnly(ObjectId),
    ThreadOnly(ThreadId),
}

impl EventFilter {
    pub fn accepts(&self, worker: &WorkerIdentity) -> bool {
        match self {
            EventFilter::MonitorOnly(monitor) => worker.monitor == *monitor,
            EventFilter::ThreadOnly(thread) => worker.thread == *thread,
        }
    }
}

/// Specification sent to the target when setting up a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRequestSpec {
    pub tag: EventTag,
    pub suspend_policy: SuspendPolicy,
    pub filters: Vec<EventFilter>,
}

impl EventRequestSpec {
    /// Non-intrusive monitoring request: suspend nothing, no filters.
    pub fn monitoring(tag: EventTag) -> Self {
        Self {
            tag,
            suspend_policy: SuspendPolicy::None,
            filters: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: &[EventFilter]) -> Self {
        self.filters.extend_from_slice(filters);
        self
    }

    /// True when every filter on this request accepts the worker.
    pub fn accepts(&self, worker: &WorkerIdentity) -> bool {
        self.filters.iter().all(|f| f.accepts(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerIdentity {
        WorkerIdentity {
            thread: 0x101,
            monitor: 0x1001,
        }
    }

    #[test]
    fn filters_check_identity() {
        assert!(EventFilter::ThreadOnly(0x101).accepts(&worker()));
        assert!(!EventFilter::ThreadOnly(0x102).accepts(&worker()));
        assert!(EventFilter::MonitorOnly(0x1001).accepts(&worker()));
        assert!(!EventFilter::MonitorOnly(0x1002).accepts(&worker()));
    }

    #[test]
    fn request_requires_all_filters_to_pass() {
        let spec = EventRequestSpec::monitoring(EventTag::MonitorContendedEnter)
            .with_filters(&[
                EventFilter::ThreadOnly(0x101),
                EventFilter::MonitorOnly(0x1002),
            ]);
        assert!(!spec.accepts(&worker()));

        let spec = EventRequestSpec::monitoring(EventTag::MonitorContendedEnter);
        assert!(spec.accepts(&worker()));
    }
}
