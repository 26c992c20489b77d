// Event model
//
// Events are notifications delivered by the debug target. The set of kinds
// the harness understands is closed, so events are a tagged sum type and
// every consumer matches on the tag instead of testing runtime types.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Object and thread references are 8-byte ids, like most debug wire protocols.
pub type ObjectId = u64;
pub type ThreadId = u64;
pub type RequestId = i32;

/// Discriminant-only view of an event kind. Used as a map key by the
/// correlator and as the spelling on the CLI and the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTag {
    VmStart,
    VmDeath,
    VmDisconnect,
    ThreadStart,
    ThreadDeath,
    MonitorContendedEnter,
    MonitorContendedEntered,
    MonitorWait,
    MonitorWaited,
}

impl EventTag {
    pub const ALL: [EventTag; 9] = [
        EventTag::VmStart,
        EventTag::VmDeath,
        EventTag::VmDisconnect,
        EventTag::ThreadStart,
        EventTag::ThreadDeath,
        EventTag::MonitorContendedEnter,
        EventTag::MonitorContendedEntered,
        EventTag::MonitorWait,
        EventTag::MonitorWaited,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventTag::VmStart => "vm-start",
            EventTag::VmDeath => "vm-death",
            EventTag::VmDisconnect => "vm-disconnect",
            EventTag::ThreadStart => "thread-start",
            EventTag::ThreadDeath => "thread-death",
            EventTag::MonitorContendedEnter => "monitor-contended-enter",
            EventTag::MonitorContendedEntered => "monitor-contended-entered",
            EventTag::MonitorWait => "monitor-wait",
            EventTag::MonitorWaited => "monitor-waited",
        }
    }

    /// VM-lifecycle events cannot be generated on demand by debuggee
    /// workers, so they cannot appear in a correlation scenario.
    pub fn is_correlatable(self) -> bool {
        !matches!(
            self,
            EventTag::VmStart | EventTag::VmDeath | EventTag::VmDisconnect
        )
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventTag {
    type Err = HarnessError;

    fn from_str(s: &str) -> HarnessResult<Self> {
        EventTag::ALL
            .into_iter()
            .find(|tag| tag.name() == s)
            .ok_or_else(|| HarnessError::Config(format!("unknown event type: {:?}", s)))
    }
}

/// Event payload, one variant per tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VmStart,
    VmDeath,
    VmDisconnect,
    ThreadStart,
    ThreadDeath,
    MonitorContendedEnter { monitor: ObjectId },
    MonitorContendedEntered { monitor: ObjectId },
    MonitorWait { monitor: ObjectId, timeout_ms: u64 },
    MonitorWaited { monitor: ObjectId, timed_out: bool },
}

impl EventKind {
    pub fn tag(&self) -> EventTag {
        match self {
            EventKind::VmStart => EventTag::VmStart,
            EventKind::VmDeath => EventTag::VmDeath,
            EventKind::VmDisconnect => EventTag::VmDisconnect,
            EventKind::ThreadStart => EventTag::ThreadStart,
            EventKind::ThreadDeath => EventTag::ThreadDeath,
            EventKind::MonitorContendedEnter { .. } => EventTag::MonitorContendedEnter,
            EventKind::MonitorContendedEntered { .. } => EventTag::MonitorContendedEntered,
            EventKind::MonitorWait { .. } => EventTag::MonitorWait,
            EventKind::MonitorWaited { .. } => EventTag::MonitorWaited,
        }
    }

    pub fn monitor(&self) -> Option<ObjectId> {
        match self {
            EventKind::MonitorContendedEnter { monitor }
            | EventKind::MonitorContendedEntered { monitor }
            | EventKind::MonitorWait { monitor, .. }
            | EventKind::MonitorWaited { monitor, .. } => Some(*monitor),
            _ => None,
        }
    }
}

/// Single delivered event. Immutable once delivered; `request_id` is `None`
/// for VM-lifecycle events, which no request produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub request_id: Option<RequestId>,
    pub thread: Option<ThreadId>,
    pub kind: EventKind,
}

impl Event {
    pub fn tag(&self) -> EventTag {
        self.kind.tag()
    }
}

/// Suspend policy attached to a delivered event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

/// Ordered, non-empty batch of events delivered together. The dispatch loop
/// consumes a set atomically: every event in it is offered to listeners
/// before the next set is drained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<Event>,
}
