// Debug-event harness core
//
// Asynchronous event dispatch and cross-process correlation for a
// JDWP-style target: a framed link carries requests and event sets between
// a debugger and a debuggee, an event handler fans sets out to prioritized
// listeners, and the correlator checks the debugger's view against what
// the debuggee actually did.

pub mod command;
pub mod config;
pub mod correlate;
pub mod debuggee;
pub mod error;
pub mod event;
pub mod handler;
pub mod link;
pub mod recorded;
pub mod request;
pub mod wait;

pub use command::{CommandChannel, DebuggeeCommand};
pub use config::{exit_status, HarnessOptions, TraceLevel};
pub use correlate::{EventsScenario, ScenarioConfig, ScenarioReport};
pub use error::{HarnessError, HarnessResult};
pub use event::{Event, EventKind, EventSet, EventTag, SuspendPolicy};
pub use handler::{EventHandler, EventListener, ListenerId};
pub use link::{spawn_link, LinkHandle};
pub use recorded::{EventRecorder, RecordedEvent, WorkerIdentity};
pub use request::{EventFilter, EventRequestSpec};
pub use wait::{wait_for_requested_event, wait_for_requested_event_set, WaitOptions};
