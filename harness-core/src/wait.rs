// Wait helpers
//
// Convert the push-based listener model into a synchronous, timeout-bounded
// call: install a temporary listener, optionally resume the target, block
// until a matching event arrives or the deadline elapses, then always
// remove the temporary listener.

use crate::error::{HarnessError, HarnessResult};
use crate::event::{Event, EventSet, RequestId};
use crate::handler::{EventHandler, EventListener};
use crate::link::LinkHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Resume the target after installing the temporary listener.
    pub resume_on_start: bool,
    /// Disable the given requests before returning.
    pub disable_on_exit: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            resume_on_start: true,
            disable_on_exit: true,
        }
    }
}

/// Block until an event produced by one of `requests` arrives.
///
/// `Ok(Some(event))` on a match, `Ok(None)` if the session disconnected
/// first, `Err(Timeout)` once the deadline elapses. The deadline is fixed
/// at entry; the runtime re-arms the remaining time on every wake.
pub async fn wait_for_requested_event(
    handler: &EventHandler,
    link: &LinkHandle,
    requests: &[RequestId],
    timeout: Duration,
    options: WaitOptions,
) -> HarnessResult<Option<Event>> {
    let deadline = Instant::now() + timeout;

    for request in requests {
        link.set_request_enabled(*request, true).await?;
    }

    let (tx, rx) = oneshot::channel();
    let listener_id = handler.add_listener(Box::new(EventMatchListener {
        requests: requests.to_vec(),
        tx: Some(tx),
    }));

    let outcome = await_match(handler, link, requests, rx, deadline, timeout, options).await;

    // The temporary listener must never leak across calls.
    handler.remove_listener(listener_id);
    outcome
}

/// Like [`wait_for_requested_event`], but yields the entire event set that
/// contained the matching event.
pub async fn wait_for_requested_event_set(
    handler: &EventHandler,
    link: &LinkHandle,
    requests: &[RequestId],
    timeout: Duration,
    options: WaitOptions,
) -> HarnessResult<Option<EventSet>> {
    let deadline = Instant::now() + timeout;

    for request in requests {
        link.set_request_enabled(*request, true).await?;
    }

    let (tx, rx) = oneshot::channel();
    let listener_id = handler.add_listener(Box::new(EventSetMatchListener {
        requests: requests.to_vec(),
        current_set: None,
        tx: Some(tx),
    }));

    let outcome = await_match(handler, link, requests, rx, deadline, timeout, options).await;

    handler.remove_listener(listener_id);
    outcome
}

async fn await_match<T>(
    handler: &EventHandler,
    link: &LinkHandle,
    requests: &[RequestId],
    rx: oneshot::Receiver<T>,
    deadline: Instant,
    timeout: Duration,
    options: WaitOptions,
) -> HarnessResult<Option<T>> {
    if options.resume_on_start {
        link.resume().await?;
    }

    let outcome = tokio::select! {
        matched = rx => match matched {
            Ok(value) => Ok(Some(value)),
            // Sender dropped without firing: the dispatch loop is gone.
            Err(_) => Ok(None),
        },
        _ = handler.terminated().cancelled() => {
            debug!("session disconnected while waiting for requested event");
            Ok(None)
        }
        _ = tokio::time::sleep_until(deadline) => Err(HarnessError::Timeout(timeout)),
    };

    if options.disable_on_exit {
        // Best effort: the link may already be down on the failure paths.
        for request in requests {
            if let Err(e) = link.set_request_enabled(*request, false).await {
                warn!(request = *request, "failed to disable request after wait: {}", e);
            }
        }
    }

    outcome
}

/// Temporary listener matching any event produced by one of the given
/// requests. Fires at most once, then asks for removal.
struct EventMatchListener {
    requests: Vec<RequestId>,
    tx: Option<oneshot::Sender<Event>>,
}

impl EventListener for EventMatchListener {
    fn handle_event(&mut self, event: &Event) -> bool {
        let Some(request_id) = event.request_id else {
            return false;
        };
        if !self.requests.contains(&request_id) {
            return false;
        }
        if let Some(tx) = self.tx.take() {
            if tx.send(event.clone()).is_err() {
                warn!("matched event arrived after the waiter gave up");
            }
        }
        true
    }

    fn remove_after_handling(&self) -> bool {
        self.tx.is_none()
    }
}


/// Set-level variant: remembers the set currently being dispatched and
/// sends the whole set when one of its events matches.
struct EventSetMatchListener {
    requests: Vec<RequestId>,
    current_set: Option<EventSet>,
    tx: Option<oneshot::Sender<EventSet>>,
}

impl EventListener for EventSetMatchListener {
    fn event_set_received(&mut self, set: &EventSet) {
        self.current_set = Some(set.clone());
    }

    fn handle_event(&mut self, event: &Event) -> bool {
        let Some(request_id) = event.request_id else {
            return false;
        };
        if !self.requests.contains(&request_id) {
            return false;
        }
        if let (Some(tx), Some(set)) = (self.tx.take(), self.current_set.take()) {
            if tx.send(set).is_err() {
                warn!("matched event set arrived after the waiter gave up");
            }
        }
        true
    }

    fn remove_after_handling(&self) -> bool {
        self.tx.is_none()
    }
}
