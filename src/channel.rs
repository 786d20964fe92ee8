use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Outcomes channel capacity. Generous relative to listener counts in
/// practice; a lagging subscriber only misses outcome notifications for its
/// own tags, which is treated as best-effort ("surface to the producer via
/// the outcomes stream when delivery fails").
const OUTCOMES_CAPACITY: usize = 256;

/// Events channel capacity, matching the `broadcast::channel(100)` sizing
/// used for comparable per-channel fan-out.
const EVENTS_CAPACITY: usize = 100;

/// One published event: a payload plus an optional correlator tag.
#[derive(Debug, Clone)]
pub struct Event {
    pub payload: String,
    pub tag: Option<u64>,
}

/// Delivery result reported back to the producer for a tagged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Failed,
}

/// One virtual pub/sub endpoint.
///
/// Same `broadcast::Sender` shape for events as a simple pub/sub channel,
/// with a second sender added for
/// outcomes and an explicit listener counter replacing
/// `subscriber_count()`/`receiver_count()` (a request can hold a receiver
/// for the merged wait without itself being "subscribed" the way an SSE
/// client is).
pub struct Channel {
    id: String,
    events_tx: broadcast::Sender<Event>,
    outcomes_tx: broadcast::Sender<(Outcome, u64)>,
    listeners: AtomicI64,
    live_count: Arc<AtomicUsize>,
}

impl Channel {
    pub(crate) fn new(id: String, live_count: Arc<AtomicUsize>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
        let (outcomes_tx, _) = broadcast::channel(OUTCOMES_CAPACITY);
        Self {
            id,
            events_tx,
            outcomes_tx,
            listeners: AtomicI64::new(0),
            live_count,
        }
    }

    pub fn id_of(&self) -> &str {
        &self.id
    }

    /// Publishes an event to every current subscriber. Non-blocking:
    /// publishing never buffers per-subscriber, so a publish with no
    /// current waiters is simply dropped (`broadcast::Sender::send`
    /// returning an error here is not a failure condition).
    pub fn publish(&self, payload: impl Into<String>, tag: Option<u64>) {
        let _ = self.events_tx.send(Event {
            payload: payload.into(),
            tag,
        });
    }

    /// Subscribes to this channel's event stream. Only events published
    /// after this call are visible to the returned receiver.
    pub fn observe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Emits one outcome for a tagged event.
    pub fn report_outcome(&self, result: Outcome, tag: u64) {
        let _ = self.outcomes_tx.send((result, tag));
    }

    /// Subscribes to this channel's outcomes stream.
    pub fn observe_outcomes(&self) -> broadcast::Receiver<(Outcome, u64)> {
        self.outcomes_tx.subscribe()
    }

    /// Atomically adjusts the listener count. `delta` may be negative.
    /// Never blocks.
    pub fn add_listeners(&self, delta: i64) {
        self.listeners.fetch_add(delta, Ordering::SeqCst);
    }

    /// Current count of HTTP requests actively waiting on this channel.
    pub fn listener_count(&self) -> i64 {
        self.listeners.load(Ordering::SeqCst)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.live_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> Channel {
        Channel::new("test-channel".to_string(), Arc::new(AtomicUsize::new(1)))
    }

    #[test]
    fn listener_count_tracks_add_and_remove() {
        let channel = test_channel();
        assert_eq!(channel.listener_count(), 0);
        channel.add_listeners(1);
        channel.add_listeners(1);
        assert_eq!(channel.listener_count(), 2);
        channel.add_listeners(-1);
        channel.add_listeners(-1);
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn untagged_events_never_emit_outcomes() {
        let channel = test_channel();
        let mut outcomes = channel.observe_outcomes();
        channel.publish("x", None);
        // give any (incorrect) emission a chance to land before asserting absence
        tokio::task::yield_now().await;
        assert!(outcomes.try_recv().is_err());
    }

    #[tokio::test]
    async fn tagged_outcome_round_trips() {
        let channel = test_channel();
        let mut outcomes = channel.observe_outcomes();
        channel.report_outcome(Outcome::Delivered, 7);
        let (result, tag) = outcomes.recv().await.unwrap();
        assert_eq!(result, Outcome::Delivered);
        assert_eq!(tag, 7);
    }

    #[tokio::test]
    async fn subscribers_only_see_events_after_subscribing() {
        let channel = test_channel();
        channel.publish("before", Some(1));
        let mut receiver = channel.observe_events();
        channel.publish("after", Some(2));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.payload, "after");
    }

    #[test]
    fn drop_decrements_live_count() {
        let live_count = Arc::new(AtomicUsize::new(1));
        let channel = Channel::new("id".to_string(), live_count.clone());
        drop(channel);
        assert_eq!(live_count.load(Ordering::SeqCst), 0);
    }
}
