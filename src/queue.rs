use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use grow_wire::{SendAck, SendMsg};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

/// Delivery attempts per message before it is dropped.
pub const MAX_TRIES: u32 = 3;
/// How long a delivered message may stay unacknowledged.
pub const TIMEOUT: Duration = Duration::from_millis(500);
/// Period of the background timeout sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Ready,
    Unacked,
}

#[derive(Debug, Clone)]
struct QueueItem {
    send: SendMsg,
    state: ItemState,
    tries: u32,
    added_at: DateTime<Utc>,
    last_tried_at: Option<Instant>,
}

/// Per-receiver FIFO of outgoing sends with ack, timeout and retry.
///
/// At most one item per receiver is unacknowledged at a time. Deliveries
/// are handed to the outbox returned by [`Queues::new`]; whoever drains it
/// is the transport and must report acks back through [`Queues::on_ack`].
#[derive(Clone)]
pub struct Queues {
    owner: Arc<str>,
    items: Arc<Mutex<HashMap<String, VecDeque<QueueItem>>>>,
    outbox: UnboundedSender<SendMsg>,
}

impl Queues {
    pub fn new(owner: &str) -> (Self, UnboundedReceiver<SendMsg>) {
        let (outbox, deliveries) = mpsc::unbounded_channel();
        let queues = Self {
            owner: Arc::from(owner),
            items: Arc::new(Mutex::new(HashMap::new())),
            outbox,
        };
        (queues, deliveries)
    }

    pub fn enqueue(&self, send: SendMsg) {
        let receiver = send.receiver.clone();
        trace!(owner = %self.owner, %receiver, send_id = %send.send_id, "enqueue");
        self.with_items(|items| {
            items.entry(receiver.clone()).or_default().push_back(QueueItem {
                send,
                state: ItemState::Ready,
                tries: 0,
                added_at: Utc::now(),
                last_tried_at: None,
            });
        });
        self.kick(&receiver);
    }

    /// Removes the acknowledged item and moves on to the next one.
    /// Acks for unknown sends are ignored.
    pub fn on_ack(&self, ack: &SendAck) {
        let removed = self.with_items(|items| {
            let queue = items.get_mut(&ack.receiver)?;
            let pos = queue.iter().position(|item| item.send.send_id == ack.send_id)?;
            let item = queue.remove(pos)?;
            if queue.is_empty() {
                items.remove(&ack.receiver);
            }
            Some(item)
        });
        match removed {
            Some(_) => self.kick(&ack.receiver),
            None => trace!(owner = %self.owner, send_id = %ack.send_id, "ack for unknown send"),
        }
    }

    /// Delivers the head of `receiver`'s queue unless something is in flight.
    pub fn kick(&self, receiver: &str) {
        enum Next {
            Idle,
            Deliver(SendMsg),
            Dropped(QueueItem),
        }

        let now = Instant::now();
        let next = self.with_items(|items| {
            let Some(queue) = items.get_mut(receiver) else {
                return Next::Idle;
            };
            if queue.iter().any(|item| item.state == ItemState::Unacked) {
                return Next::Idle;
            }
            let Some(head) = queue.front_mut() else {
                return Next::Idle;
            };
            if head.tries >= MAX_TRIES {
                let dropped = queue.pop_front();
                if queue.is_empty() {
                    items.remove(receiver);
                }
                return dropped.map(Next::Dropped).unwrap_or(Next::Idle);
            }
            head.tries += 1;
            head.state = ItemState::Unacked;
            head.last_tried_at = Some(now);
            Next::Deliver(head.send.clone())
        });

        match next {
            Next::Idle => {}
            Next::Deliver(send) => {
                trace!(owner = %self.owner, %receiver, send_id = %send.send_id, "deliver");
                if self.outbox.send(send).is_err() {
                    debug!(owner = %self.owner, "queue transport is gone");
                }
            }
            Next::Dropped(item) => {
                error!(
                    owner = %self.owner,
                    receiver = %item.send.receiver,
                    send_id = %item.send.send_id,
                    tries = item.tries,
                    added_at = %item.added_at,
                    "dropping message after {MAX_TRIES} failed deliveries"
                );
                let queues = self.clone();
                let receiver = receiver.to_string();
                tokio::spawn(async move { queues.kick(&receiver) });
            }
        }
    }

    /// Moves every timed-out unacked item back to the tail of its queue as
    /// ready and returns the receivers that need a kick.
    pub fn timeout_check(&self) -> Vec<String> {
        let now = Instant::now();
        self.with_items(|items| {
            let mut touched = Vec::new();
            for (receiver, queue) in items.iter_mut() {
                let expired: Vec<usize> = queue
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| {
                        item.state == ItemState::Unacked
                            && item
                                .last_tried_at
                                .is_some_and(|at| now.duration_since(at) > TIMEOUT)
                    })
                    .map(|(i, _)| i)
                    .collect();
                if expired.is_empty() {
                    continue;
                }
                for i in expired.into_iter().rev() {
                    if let Some(mut item) = queue.remove(i) {
                        debug!(
                            owner = %self.owner,
                            %receiver,
                            send_id = %item.send.send_id,
                            tries = item.tries,
                            "send timed out"
                        );
                        item.state = ItemState::Ready;
                        queue.push_back(item);
                    }
                }
                touched.push(receiver.clone());
            }
            touched
        })
    }

    pub fn sweep(&self) {
        for receiver in self.timeout_check() {
            self.kick(&receiver);
        }
    }

    /// Runs [`Queues::sweep`] periodically until the handle is aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let queues = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                queues.sweep();
            }
        })
    }

    pub fn pending(&self, receiver: &str) -> usize {
        self.with_items(|items| items.get(receiver).map(VecDeque::len).unwrap_or(0))
    }

    pub fn unacked(&self, receiver: &str) -> usize {
        self.with_items(|items| {
            items
                .get(receiver)
                .map(|q| q.iter().filter(|i| i.state == ItemState::Unacked).count())
                .unwrap_or(0)
        })
    }

    pub fn clear(&self) {
        self.with_items(|items| items.clear());
    }

    fn with_items<T>(&self, f: impl FnOnce(&mut HashMap<String, VecDeque<QueueItem>>) -> T) -> T {
        let mut items = match self.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn send(receiver: &str, id: &str) -> SendMsg {
        SendMsg {
            caller: "Publisher".into(),
            receiver: receiver.into(),
            receiver_proc: receiver.into(),
            args: vec![json!("foo"), json!(id)],
            session_id: String::new(),
            request_id: "r".into(),
            send_id: id.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_unacked_item_per_receiver() {
        let (queues, mut deliveries) = Queues::new("test");
        queues.enqueue(send("Sub", "1"));
        queues.enqueue(send("Sub", "2"));
        queues.enqueue(send("Other", "3"));

        assert_eq!(deliveries.recv().await.unwrap().send_id, "1");
        assert_eq!(deliveries.recv().await.unwrap().send_id, "3");
        assert!(deliveries.try_recv().is_err());
        assert_eq!(queues.unacked("Sub"), 1);

        queues.on_ack(&SendAck { caller: "Publisher".into(), receiver: "Sub".into(), send_id: "1".into() });
        assert_eq!(deliveries.recv().await.unwrap().send_id, "2");
        assert_eq!(queues.pending("Sub"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_item_is_retried_then_dropped() {
        let (queues, mut deliveries) = Queues::new("test");
        queues.enqueue(send("Sub", "1"));
        assert_eq!(deliveries.recv().await.unwrap().send_id, "1");

        for _ in 1..MAX_TRIES {
            tokio::time::advance(TIMEOUT + Duration::from_millis(1)).await;
            queues.sweep();
            assert_eq!(deliveries.recv().await.unwrap().send_id, "1");
        }

        tokio::time::advance(TIMEOUT + Duration::from_millis(1)).await;
        queues.sweep();
        assert_eq!(queues.pending("Sub"), 0);
        assert!(deliveries.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_before_timeout() {
        let (queues, mut deliveries) = Queues::new("test");
        queues.enqueue(send("Sub", "1"));
        deliveries.recv().await.unwrap();

        tokio::time::advance(TIMEOUT / 2).await;
        queues.sweep();
        assert!(deliveries.try_recv().is_err());
        assert_eq!(queues.unacked("Sub"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_head_goes_to_the_tail() {
        let (queues, mut deliveries) = Queues::new("test");
        queues.enqueue(send("Sub", "1"));
        queues.enqueue(send("Sub", "2"));
        assert_eq!(deliveries.recv().await.unwrap().send_id, "1");

        tokio::time::advance(TIMEOUT + Duration::from_millis(1)).await;
        queues.sweep();
        assert_eq!(deliveries.recv().await.unwrap().send_id, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn late_and_unknown_acks_are_ignored() {
        let (queues, mut deliveries) = Queues::new("test");
        queues.on_ack(&SendAck { caller: "Publisher".into(), receiver: "Sub".into(), send_id: "nope".into() });
        queues.enqueue(send("Sub", "1"));
        deliveries.recv().await.unwrap();
        queues.on_ack(&SendAck { caller: "Publisher".into(), receiver: "Sub".into(), send_id: "1".into() });
        queues.on_ack(&SendAck { caller: "Publisher".into(), receiver: "Sub".into(), send_id: "1".into() });
        assert_eq!(queues.pending("Sub"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drives_retries_on_its_own() {
        let (queues, mut deliveries) = Queues::new("test");
        let sweeper = queues.spawn_sweeper();
        queues.enqueue(send("Sub", "1"));
        deliveries.recv().await.unwrap();

        let retried = tokio::time::timeout(Duration::from_secs(2), deliveries.recv()).await;
        assert_eq!(retried.unwrap().unwrap().send_id, "1");
        sweeper.abort();
    }
}
