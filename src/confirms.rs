// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Confirmation Tracking
//!
//! This module owns the correlation between broker-issued publish sequence
//! tags and the in-process awaiters of those publishes. The confirmation
//! stream is asynchronous, out of order, and partially lossy: acks and
//! nacks may cover ranges (`multiple`), returned messages carry no sequence
//! number, and a channel loss drops every outstanding confirmation at once.
//!
//! [`PublishConfirmationTracker::publish_confirmed`] assigns the next
//! sequence tag, stamps it into the outgoing headers, performs the raw
//! publish, and suspends until the broker resolves the tag or the confirm
//! window elapses. Tag assignment and the raw publish happen inside one
//! critical section per channel, so concurrent publishers can never be
//! stamped with swapped or duplicate tags.

use crate::{
    channel::AmqpChannel,
    envelope,
    errors::AmqpError,
    settings::ConfirmSettings,
};
use lapin::{types::ShortString, BasicProperties};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc::UnboundedReceiver, oneshot, Mutex},
    time,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Typed broker events that resolve pending publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationEvent {
    /// The broker durably accepted the publish(es)
    Ack { tag: u64, multiple: bool },
    /// The broker refused the publish(es)
    Nack { tag: u64, multiple: bool },
    /// The broker accepted but could not route a mandatory message. The tag
    /// is recovered from the stamped header, when present.
    Return {
        tag: Option<u64>,
        code: u16,
        text: String,
    },
    /// The channel was lost with every pending publish unresolved
    ChannelClosed { reason: String },
}

type PendingResolver = oneshot::Sender<Result<(), AmqpError>>;

struct TrackerState {
    next_tag: u64,
    pending: HashMap<u64, PendingResolver>,
}

/// Correlates publish sequence tags to pending publish awaiters on one
/// channel. One instance per channel; entries never outlive the channel.
pub struct PublishConfirmationTracker<C: AmqpChannel> {
    channel: Arc<C>,
    settings: ConfirmSettings,
    state: Mutex<TrackerState>,
}

impl<C: AmqpChannel + 'static> PublishConfirmationTracker<C> {
    pub fn new(channel: Arc<C>, settings: ConfirmSettings) -> Self {
        PublishConfirmationTracker {
            channel,
            settings,
            state: Mutex::new(TrackerState {
                next_tag: 0,
                pending: HashMap::default(),
            }),
        }
    }

    /// Spawns a task that feeds confirmation events into this tracker until
    /// the sender side is dropped.
    pub fn listen(self: &Arc<Self>, mut events: UnboundedReceiver<ConfirmationEvent>) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracker.handle_event(event).await;
            }
            debug!("confirmation event stream ended");
        });
    }

    /// Publishes and suspends until the broker confirms, the confirm window
    /// elapses, or the channel is lost.
    ///
    /// A timeout cancels only the local wait: the broker may still enqueue
    /// the message, and a late confirmation for the abandoned tag is
    /// ignored. Republishing after `PublishNotConfirmed` can therefore
    /// produce a duplicate (at-least-once).
    pub async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;

        state.next_tag += 1;
        let tag = state.next_tag;

        let properties = if properties.message_id().is_none() {
            properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        } else {
            properties
        };
        let properties = envelope::stamp_publish_sequence(properties, tag);

        let (tx, resolution) = oneshot::channel();
        if let Some(stale) = state.pending.insert(tag, tx) {
            // Channel reuse bug: a prior publish with this tag was never
            // resolved. Fail it loudly instead of dropping it silently.
            error!(tag, "publish sequence tag already pending");
            let _ = stale.send(Err(AmqpError::DuplicateSequenceTag(tag)));
        }

        // Only the first send stays inside the critical section: that is
        // what keeps tag assignment and send order from interleaving
        // across concurrent publishers. Backoff retries happen unlocked so
        // a failing publish cannot stall event resolution for other tags.
        let first_attempt = self
            .channel
            .publish(exchange, routing_key, properties.clone(), body)
            .await;
        drop(state);

        if let Err(err) = first_attempt {
            warn!(
                error = err.to_string(),
                attempt = 1u32,
                "raw publish attempt failed"
            );
            if let Err(err) = self
                .retry_publish(exchange, routing_key, properties, body, err)
                .await
            {
                self.state.lock().await.pending.remove(&tag);
                return Err(err);
            }
        }

        match time::timeout(self.settings.confirm_timeout, resolution).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AmqpError::PublishChannelClosed(
                "confirmation tracker dropped".to_owned(),
            )),
            Err(_) => {
                self.state.lock().await.pending.remove(&tag);
                warn!(tag, "publish not confirmed within period");
                Err(AmqpError::PublishNotConfirmed)
            }
        }
    }

    /// Applies one broker event to the pending set.
    ///
    /// Events for tags that are no longer pending (already resolved by a
    /// prior `multiple` ack, or abandoned by a local timeout) are no-ops.
    pub async fn handle_event(&self, event: ConfirmationEvent) {
        match event {
            ConfirmationEvent::Ack { tag, multiple } => {
                self.resolve(tag, multiple, Ok(())).await;
            }
            ConfirmationEvent::Nack { tag, multiple } => {
                self.resolve(tag, multiple, Err(AmqpError::PublishNacked))
                    .await;
            }
            ConfirmationEvent::Return { tag, code, text } => {
                // Unroutable mandatory message: a topology bug, e.g. a
                // delay-queue dead-letter binding pointing nowhere.
                error!(code, text, "publish returned by broker");
                match tag {
                    Some(tag) => {
                        self.resolve(tag, false, Err(AmqpError::PublishReturned { code, text }))
                            .await;
                    }
                    None => warn!("returned message without a sequence stamp"),
                }
            }
            ConfirmationEvent::ChannelClosed { reason } => {
                let mut state = self.state.lock().await;
                warn!(
                    reason,
                    pending = state.pending.len(),
                    "channel closed with pending publishes"
                );
                for (_, resolver) in state.pending.drain() {
                    let _ = resolver.send(Err(AmqpError::PublishChannelClosed(reason.clone())));
                }
            }
        }
    }

    async fn resolve(&self, tag: u64, multiple: bool, outcome: Result<(), AmqpError>) {
        let mut state = self.state.lock().await;

        if multiple {
            let covered: Vec<u64> = state
                .pending
                .keys()
                .filter(|&&pending| pending <= tag)
                .copied()
                .collect();
            for tag in covered {
                if let Some(resolver) = state.pending.remove(&tag) {
                    let _ = resolver.send(outcome.clone());
                }
            }
        } else if let Some(resolver) = state.pending.remove(&tag) {
            let _ = resolver.send(outcome);
        }
    }

    /// Retries the raw publish after a failed first attempt, sleeping an
    /// exponentially growing backoff before each retry. Runs without the
    /// state lock.
    async fn retry_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
        first_error: AmqpError,
    ) -> Result<(), AmqpError> {
        let attempts = self.settings.publish_attempts.max(1);
        let mut backoff = self.settings.publish_backoff;
        let mut last = first_error;

        for attempt in 2..=attempts {
            time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);

            match self
                .channel
                .publish(exchange, routing_key, properties.clone(), body)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt, "raw publish attempt failed"
                    );
                    last = err;
                }
            }
        }

        Err(last)
    }

    #[cfg(test)]
    pub(crate) async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    #[cfg(test)]
    pub(crate) async fn insert_pending(
        &self,
        tag: u64,
    ) -> oneshot::Receiver<Result<(), AmqpError>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        state.next_tag = state.next_tag.max(tag);
        state.pending.insert(tag, tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use std::time::Duration;

    fn tracker_with(
        mock: MockAmqpChannel,
        settings: ConfirmSettings,
    ) -> Arc<PublishConfirmationTracker<MockAmqpChannel>> {
        Arc::new(PublishConfirmationTracker::new(Arc::new(mock), settings))
    }

    async fn wait_for_pending(tracker: &PublishConfirmationTracker<MockAmqpChannel>) {
        while tracker.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn ack_resolves_the_pending_publish() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_publish().returning(|_, _, _, _| Ok(()));
        let tracker = tracker_with(mock, ConfirmSettings::default());

        let publishing = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .publish_confirmed("", "orders", BasicProperties::default(), b"{}")
                    .await
            })
        };

        wait_for_pending(&tracker).await;
        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 1,
                multiple: false,
            })
            .await;

        assert_eq!(publishing.await.unwrap(), Ok(()));
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn nack_fails_the_pending_publish() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_publish().returning(|_, _, _, _| Ok(()));
        let tracker = tracker_with(mock, ConfirmSettings::default());

        let publishing = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .publish_confirmed("", "orders", BasicProperties::default(), b"{}")
                    .await
            })
        };

        wait_for_pending(&tracker).await;
        tracker
            .handle_event(ConfirmationEvent::Nack {
                tag: 1,
                multiple: false,
            })
            .await;

        assert_eq!(publishing.await.unwrap(), Err(AmqpError::PublishNacked));
    }

    #[tokio::test]
    async fn multiple_nack_fails_every_tag_up_to_it() {
        let mock = MockAmqpChannel::new();
        let tracker = tracker_with(mock, ConfirmSettings::default());

        let first = tracker.insert_pending(1).await;
        let second = tracker.insert_pending(2).await;
        let third = tracker.insert_pending(3).await;

        tracker
            .handle_event(ConfirmationEvent::Nack {
                tag: 2,
                multiple: true,
            })
            .await;

        assert_eq!(first.await.unwrap(), Err(AmqpError::PublishNacked));
        assert_eq!(second.await.unwrap(), Err(AmqpError::PublishNacked));
        assert_eq!(tracker.pending_count().await, 1);

        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 3,
                multiple: false,
            })
            .await;
        assert_eq!(third.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn events_resolve_while_a_raw_publish_backs_off() {
        let mut mock = MockAmqpChannel::new();
        let mut calls = 0u32;
        mock.expect_publish().returning(move |_, _, _, _| {
            calls += 1;
            if calls == 1 {
                Err(AmqpError::PublishingError)
            } else {
                Ok(())
            }
        });
        let tracker = tracker_with(
            mock,
            ConfirmSettings {
                publish_attempts: 3,
                publish_backoff: Duration::from_secs(10),
                confirm_timeout: Duration::from_secs(120),
            },
        );

        let other = tracker.insert_pending(7).await;

        let publishing = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .publish_confirmed("", "orders", BasicProperties::default(), b"{}")
                    .await
            })
        };

        // Let the first raw attempt fail and the backoff sleep start.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // An unrelated tag must resolve immediately, without waiting out
        // the failing publish's backoff.
        let before = time::Instant::now();
        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 7,
                multiple: false,
            })
            .await;
        assert_eq!(other.await.unwrap(), Ok(()));
        assert_eq!(time::Instant::now(), before);

        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 8,
                multiple: false,
            })
            .await;
        assert_eq!(publishing.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn multiple_ack_resolves_every_tag_up_to_it() {
        let mock = MockAmqpChannel::new();
        let tracker = tracker_with(mock, ConfirmSettings::default());

        let first = tracker.insert_pending(1).await;
        let second = tracker.insert_pending(2).await;
        let third = tracker.insert_pending(3).await;

        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 2,
                multiple: true,
            })
            .await;

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(tracker.pending_count().await, 1);

        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 3,
                multiple: false,
            })
            .await;
        assert_eq!(third.await.unwrap(), Ok(()));

        // Late event for an already-resolved tag is a no-op.
        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 2,
                multiple: false,
            })
            .await;
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn returned_publish_fails_with_broker_reply() {
        let mock = MockAmqpChannel::new();
        let tracker = tracker_with(mock, ConfirmSettings::default());

        let pending = tracker.insert_pending(7).await;

        tracker
            .handle_event(ConfirmationEvent::Return {
                tag: Some(7),
                code: 312,
                text: "NO_ROUTE".to_owned(),
            })
            .await;

        assert_eq!(
            pending.await.unwrap(),
            Err(AmqpError::PublishReturned {
                code: 312,
                text: "NO_ROUTE".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn channel_closed_fails_every_pending_publish() {
        let mock = MockAmqpChannel::new();
        let tracker = tracker_with(mock, ConfirmSettings::default());

        let first = tracker.insert_pending(1).await;
        let second = tracker.insert_pending(2).await;

        tracker
            .handle_event(ConfirmationEvent::ChannelClosed {
                reason: "connection reset".to_owned(),
            })
            .await;

        let expected = Err(AmqpError::PublishChannelClosed(
            "connection reset".to_owned(),
        ));
        assert_eq!(first.await.unwrap(), expected);
        assert_eq!(second.await.unwrap(), expected);
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_timeout_abandons_the_tag_locally() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_publish().returning(|_, _, _, _| Ok(()));
        let tracker = tracker_with(
            mock,
            ConfirmSettings {
                confirm_timeout: Duration::from_millis(50),
                ..ConfirmSettings::default()
            },
        );

        let outcome = tracker
            .publish_confirmed("", "orders", BasicProperties::default(), b"{}")
            .await;

        assert_eq!(outcome, Err(AmqpError::PublishNotConfirmed));
        assert_eq!(tracker.pending_count().await, 0);

        // A late broker ack for the abandoned tag is ignored.
        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 1,
                multiple: false,
            })
            .await;
    }

    #[tokio::test]
    async fn duplicate_tag_fails_the_stale_entry() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_publish().returning(|_, _, _, _| Ok(()));
        let tracker = tracker_with(mock, ConfirmSettings::default());

        // Simulate a stale pending entry left behind by a channel reuse bug.
        let mut state = tracker.state.lock().await;
        let (tx, stale) = oneshot::channel();
        state.pending.insert(1, tx);
        drop(state);

        let publishing = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .publish_confirmed("", "orders", BasicProperties::default(), b"{}")
                    .await
            })
        };

        assert_eq!(
            stale.await.unwrap(),
            Err(AmqpError::DuplicateSequenceTag(1))
        );

        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 1,
                multiple: false,
            })
            .await;
        assert_eq!(publishing.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn raw_publish_retries_with_backoff_before_giving_up() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_publish()
            .times(3)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));
        let tracker = tracker_with(
            mock,
            ConfirmSettings {
                publish_attempts: 3,
                publish_backoff: Duration::from_millis(10),
                ..ConfirmSettings::default()
            },
        );

        let outcome = tracker
            .publish_confirmed("", "orders", BasicProperties::default(), b"{}")
            .await;

        assert_eq!(outcome, Err(AmqpError::PublishingError));
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn raw_publish_recovers_within_the_attempt_budget() {
        let mut mock = MockAmqpChannel::new();
        let mut attempts = 0u32;
        mock.expect_publish().returning(move |_, _, _, _| {
            attempts += 1;
            if attempts < 3 {
                Err(AmqpError::PublishingError)
            } else {
                Ok(())
            }
        });
        let tracker = tracker_with(
            mock,
            ConfirmSettings {
                publish_attempts: 3,
                publish_backoff: Duration::from_millis(10),
                confirm_timeout: Duration::from_secs(10),
                ..ConfirmSettings::default()
            },
        );

        let publishing = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .publish_confirmed("", "orders", BasicProperties::default(), b"{}")
                    .await
            })
        };

        wait_for_pending(&tracker).await;
        tracker
            .handle_event(ConfirmationEvent::Ack {
                tag: 1,
                multiple: false,
            })
            .await;

        assert_eq!(publishing.await.unwrap(), Ok(()));
    }
}
