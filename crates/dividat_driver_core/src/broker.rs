// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! In-process topic hub with non-blocking publish and per-subscriber bounded
//! queues. A slow subscriber loses messages; it never stalls a publisher.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::errors::{DriverError, DriverResult};

/// Frames received from the connected device.
pub const TOPIC_RX: &str = "rx";
/// Opaque commands bound for the connected device.
pub const TOPIC_TX: &str = "tx";
/// Status traffic fanned out to every client of a session.
pub const TOPIC_BROADCAST: &str = "rx-broadcast";

/// Queue capacity per subscriber. Once full, further publishes to that
/// subscriber are dropped until it drains.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

struct TopicSubscriber<M> {
  id: u64,
  sender: mpsc::Sender<M>,
}

/// A single subscriber's end of a topic. Dropping the subscription closes the
/// queue; the broker prunes the dead sender on its next publish.
pub struct Subscription<M> {
  id: u64,
  topic: String,
  receiver: mpsc::Receiver<M>,
}

impl<M> Subscription<M> {
  pub fn topic(&self) -> &str {
    &self.topic
  }

  /// Receives the next message, or `None` once unsubscribed or the broker has
  /// shut down.
  pub async fn recv(&mut self) -> Option<M> {
    self.receiver.recv().await
  }

  pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
    self.receiver.try_recv()
  }
}

pub struct Broker<M: Clone + Send + 'static> {
  topics: DashMap<String, Vec<TopicSubscriber<M>>>,
  next_id: AtomicU64,
  shut_down: AtomicBool,
}

impl<M: Clone + Send + 'static> Default for Broker<M> {
  fn default() -> Self {
    Self {
      topics: DashMap::new(),
      next_id: AtomicU64::new(0),
      shut_down: AtomicBool::new(false),
    }
  }
}

impl<M: Clone + Send + 'static> Broker<M> {
  /// Returns a new, independent bounded queue attached to `topic`. The queue
  /// is closed on [`Broker::unsubscribe`] or broker shutdown.
  pub fn subscribe(&self, topic: &str) -> DriverResult<Subscription<M>> {
    if self.shut_down.load(Ordering::SeqCst) {
      return Err(DriverError::BrokerShutdown);
    }
    let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self
      .topics
      .entry(topic.to_owned())
      .or_default()
      .push(TopicSubscriber { id, sender });
    trace!("Subscriber {} attached to topic {}", id, topic);
    Ok(Subscription {
      id,
      topic: topic.to_owned(),
      receiver,
    })
  }

  /// Enqueues `message` to every current subscriber of `topic`. A subscriber
  /// with a full queue loses this message; everyone else still receives it.
  pub fn try_publish(&self, message: M, topic: &str) {
    if self.shut_down.load(Ordering::SeqCst) {
      return;
    }
    let Some(mut subscribers) = self.topics.get_mut(topic) else {
      return;
    };
    subscribers.retain(|subscriber| match subscriber.sender.try_send(message.clone()) {
      Ok(()) => true,
      Err(mpsc::error::TrySendError::Full(_)) => {
        trace!(
          "Subscriber {} on topic {} is full, dropping message",
          subscriber.id, topic
        );
        true
      }
      // Receiver dropped without unsubscribing.
      Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
  }

  /// Removes the subscriber and closes its queue.
  pub fn unsubscribe(&self, subscription: Subscription<M>) {
    if let Some(mut subscribers) = self.topics.get_mut(&subscription.topic) {
      subscribers.retain(|subscriber| subscriber.id != subscription.id);
    }
    trace!(
      "Subscriber {} detached from topic {}",
      subscription.id, subscription.topic
    );
  }

  /// Closes every subscriber queue and rejects subsequent publishes and
  /// subscriptions.
  pub fn shutdown(&self) {
    self.shut_down.store(true, Ordering::SeqCst);
    self.topics.clear();
    debug!("Broker shut down, all subscriber queues closed");
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn test_publish_reaches_all_subscribers() {
    let broker = Broker::default();
    let mut a = broker.subscribe(TOPIC_RX).expect("broker is live");
    let mut b = broker.subscribe(TOPIC_RX).expect("broker is live");
    broker.try_publish(7u32, TOPIC_RX);
    assert_eq!(a.recv().await, Some(7));
    assert_eq!(b.recv().await, Some(7));
  }

  #[tokio::test]
  async fn test_topics_are_disjoint() {
    let broker = Broker::default();
    let mut rx = broker.subscribe(TOPIC_RX).expect("broker is live");
    broker.try_publish(1u32, TOPIC_TX);
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_full_queue_drops_for_that_subscriber_only() {
    let broker = Broker::default();
    let mut slow = broker.subscribe(TOPIC_RX).expect("broker is live");
    let mut fast = broker.subscribe(TOPIC_RX).expect("broker is live");
    for i in 0..(SUBSCRIBER_QUEUE_CAPACITY as u32 + 5) {
      broker.try_publish(i, TOPIC_RX);
      // Fast drains as it goes, slow never does.
      assert_eq!(fast.recv().await, Some(i));
    }
    // Slow saw the first CAPACITY messages and lost the rest, in order.
    for i in 0..SUBSCRIBER_QUEUE_CAPACITY as u32 {
      assert_eq!(slow.try_recv().ok(), Some(i));
    }
    assert!(slow.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_unsubscribe_closes_queue() {
    let broker = Broker::default();
    let first = broker.subscribe(TOPIC_RX).expect("broker is live");
    let mut second = broker.subscribe(TOPIC_RX).expect("broker is live");
    broker.unsubscribe(first);
    broker.try_publish(3u32, TOPIC_RX);
    assert_eq!(second.recv().await, Some(3));
  }

  #[tokio::test]
  async fn test_shutdown_closes_and_rejects() {
    let broker = Broker::default();
    let mut sub = broker.subscribe(TOPIC_RX).expect("broker is live");
    broker.shutdown();
    assert_eq!(sub.recv().await, None);
    assert!(broker.subscribe(TOPIC_RX).is_err());
    // Publishing after shutdown is a silent no-op.
    broker.try_publish(1u32, TOPIC_RX);
  }
}
