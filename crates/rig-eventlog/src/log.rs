//! The append-only event log: the system's primary coordination medium
//! (spec §4.1).
//!
//! `publish` never blocks on a subscriber. `wait_for` always scans the
//! existing log before parking, eliminating the TOCTOU race between
//! "is it already ready?" and "start waiting for ready" (§9).

use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// Bounded per-subscriber buffer (§9's assumed default of 256).
const SUBSCRIBER_BUFFER: usize = 256;

struct LogState {
    events: Vec<Event>,
    next_seq: u64,
}

pub type Predicate = dyn Fn(&Event) -> bool + Send + Sync;

/// Append-only, in-memory log with one globally monotonic sequence counter.
pub struct EventLog {
    state: Mutex<LogState>,
    version: watch::Sender<u64>,
    broadcaster: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        let (broadcaster, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            state: Mutex::new(LogState {
                events: Vec::new(),
                next_seq: 1,
            }),
            version,
            broadcaster,
        }
    }

    /// Assigns the next `seq`, appends, and wakes all waiters. Never blocks
    /// on a subscriber: the broadcast send is fire-and-forget.
    pub async fn publish(&self, mut event: Event) -> Event {
        let mut state = self.state.lock().await;
        event.seq = state.next_seq;
        state.next_seq += 1;
        state.events.push(event.clone());
        let seq = event.seq;
        drop(state);

        // `send` only errors when there are no receivers; that's fine, the
        // event is already durably appended above.
        let _ = self.broadcaster.send(event.clone());
        let _ = self.version.send(seq);
        event
    }

    /// Scans the log for a match first; only parks if none is found yet.
    pub async fn wait_for(
        &self,
        cancel: &CancellationToken,
        predicate: impl Fn(&Event) -> bool,
    ) -> Option<Event> {
        loop {
            let mut rx = {
                let state = self.state.lock().await;
                if let Some(found) = state.events.iter().find(|e| predicate(e)) {
                    return Some(found.clone());
                }
                // Subscribed while still holding the lock: any publish landing
                // after this point is guaranteed to bump `version` after this
                // receiver's baseline, so the following `changed()` cannot miss it.
                self.version.subscribe()
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Replays matching events with `seq > from_seq`, then streams new
    /// matching events as they're published. A lagging subscriber drops
    /// events (bounded buffer); other subscribers are unaffected.
    pub async fn subscribe(
        &self,
        from_seq: u64,
        filter: Arc<Predicate>,
    ) -> impl Stream<Item = Event> + Send + 'static {
        let (replay, rx) = {
            let state = self.state.lock().await;
            let replay: Vec<Event> = state
                .events
                .iter()
                .filter(|e| e.seq > from_seq)
                .cloned()
                .collect();
            (replay, self.broadcaster.subscribe())
        };

        let replay_filter = filter.clone();
        let replay_stream = stream::iter(replay).filter(move |e| {
            let matched = replay_filter(e);
            async move { matched }
        });

        let live_stream = BroadcastStream::new(rx).filter_map(move |result| {
            let filter = filter.clone();
            async move {
                match result {
                    Ok(event) if filter(&event) => Some(event),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "SSE subscriber lagged, dropping events");
                        None
                    }
                }
            }
        });

        replay_stream.chain(live_stream)
    }

    /// A snapshot of the full log, for serialisation.
    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    /// `events()` filtered to exclude high-frequency classes, used by the
    /// watchdog for progress tracking.
    pub async fn lifecycle_events(&self) -> Vec<Event> {
        self.events()
            .await
            .into_iter()
            .filter(|e| !e.is_high_frequency())
            .collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn ev(environment: &str, event_type: EventType) -> Event {
        Event::builder(environment, event_type).build()
    }

    #[tokio::test]
    async fn seq_numbers_are_gapless_and_increasing() {
        let log = EventLog::new();
        for _ in 0..5 {
            log.publish(ev("t", EventType::ServiceLog)).await;
        }
        let events = log.events().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn wait_for_returns_already_published_event_immediately() {
        let log = EventLog::new();
        log.publish(ev("t", EventType::ServiceReady)).await;

        let cancel = CancellationToken::new();
        let found = log
            .wait_for(&cancel, |e| e.event_type == EventType::ServiceReady)
            .await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn wait_for_wakes_on_publish() {
        let log = Arc::new(EventLog::new());
        let cancel = CancellationToken::new();

        let waiter_log = log.clone();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_log
                .wait_for(&waiter_cancel, |e| e.event_type == EventType::ServiceReady)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        log.publish(ev("t", EventType::ServiceReady)).await;

        let found = waiter.await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn wait_for_honors_cancellation() {
        let log = EventLog::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let found = log.wait_for(&cancel, |_| false).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn lifecycle_events_excludes_high_frequency_classes() {
        let log = EventLog::new();
        log.publish(ev("t", EventType::ServiceReady)).await;
        log.publish(ev("t", EventType::ServiceLog)).await;
        log.publish(ev("t", EventType::ConnectionOpened)).await;

        let lifecycle = log.lifecycle_events().await;
        assert_eq!(lifecycle.len(), 1);
        assert_eq!(lifecycle[0].event_type, EventType::ServiceReady);
    }

    #[tokio::test]
    async fn subscribe_replays_then_streams_new_events() {
        let log = Arc::new(EventLog::new());
        log.publish(ev("t", EventType::ServiceReady)).await;

        let stream = log.subscribe(0, Arc::new(|_: &Event| true)).await;
        tokio::pin!(stream);

        let first = stream.next().await.unwrap();
        assert_eq!(first.event_type, EventType::ServiceReady);

        let log2 = log.clone();
        tokio::spawn(async move {
            log2.publish(ev("t", EventType::ServiceStopped)).await;
        });

        let second = stream.next().await.unwrap();
        assert_eq!(second.event_type, EventType::ServiceStopped);
    }
}
