//! Fan-out of device state changes to per-subscriber queues.
//!
//! Every subscriber registers a [`ChangeHandlerFactory`]. When the device changes, the hub
//! asks each factory for a handler future and enqueues it on that subscriber's own queue;
//! the subscriber's task runs the queued handlers in order via [`ChangeQueue`]. Handlers
//! therefore never run on the publisher's task and a slow subscriber only delays itself.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Continue,
    /// The subscriber is done; its queue should stop processing.
    Stop,
}

pub type ChangeHandler = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// A handler that does nothing and keeps the subscription alive.
pub fn continue_handler() -> ChangeHandler {
    Box::pin(async { HandlerResult::Continue })
}

/// Builds the handler to enqueue for each kind of change.
///
/// Factories are called while the hub is locked, so they should only capture what the
/// handler needs and leave the work to the returned future.
pub trait ChangeHandlerFactory: Send + Sync {
    fn client_list_changed(&self) -> ChangeHandler;

    fn process_list_changed(&self) -> ChangeHandler {
        continue_handler()
    }

    fn logcat_message_added(&self, _message: &str) -> ChangeHandler {
        continue_handler()
    }
}

struct Subscriber {
    factory: Arc<dyn ChangeHandlerFactory>,
    queue: mpsc::UnboundedSender<ChangeHandler>,
}

#[derive(Default)]
struct HubState {
    stopped: bool,
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
}

#[derive(Clone, Default)]
pub struct ChangeHub {
    state: Arc<Mutex<HubState>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. Returns `None` once the hub has been stopped.
    pub fn subscribe(&self, factory: Arc<dyn ChangeHandlerFactory>) -> Option<ChangeQueue> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(
            id,
            Subscriber {
                factory,
                queue: tx,
            },
        );
        Some(ChangeQueue {
            id,
            rx,
            hub: Arc::downgrade(&self.state),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn client_list_changed(&self) {
        self.publish(|factory| factory.client_list_changed());
    }

    pub fn process_list_changed(&self) {
        self.publish(|factory| factory.process_list_changed());
    }

    pub fn logcat_message_added(&self, message: &str) {
        self.publish(|factory| factory.logcat_message_added(message));
    }

    /// Stops the hub: later publications are ignored and every queue drains its pending
    /// handlers, then reports the end of the subscription. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.subscribers.clear();
    }

    fn publish(&self, make: impl Fn(&dyn ChangeHandlerFactory) -> ChangeHandler) {
        // Enqueueing under the lock keeps every subscriber's queue in publication order.
        let state = self.state.lock();
        if state.stopped {
            return;
        }
        for subscriber in state.subscribers.values() {
            let _ = subscriber.queue.send(make(subscriber.factory.as_ref()));
        }
    }
}

impl fmt::Debug for ChangeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChangeHub")
            .field("stopped", &state.stopped)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// One subscriber's pending handlers. Dropping the queue unsubscribes.
pub struct ChangeQueue {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChangeHandler>,
    hub: Weak<Mutex<HubState>>,
}

impl ChangeQueue {
    /// Waits for the next queued handler and runs it.
    ///
    /// Returns `None` once the subscription ended (hub stopped, or unsubscribed) and
    /// every handler queued before that has run.
    pub async fn take_and_invoke(&mut self) -> Option<HandlerResult> {
        let handler = self.rx.recv().await?;
        Some(handler.await)
    }

    /// Runs handlers until one returns [`HandlerResult::Stop`] or the subscription ends.
    pub async fn run(mut self) {
        while let Some(HandlerResult::Continue) = self.take_and_invoke().await {}
    }

    /// Removes the subscriber from its hub. Handlers already queued can still be taken.
    pub fn unsubscribe(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().subscribers.remove(&self.id);
        }
        self.rx.close();
    }
}

impl Drop for ChangeQueue {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().subscribers.remove(&self.id);
        }
    }
}

impl fmt::Debug for ChangeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeQueue").field("id", &self.id).finish()
    }
}
