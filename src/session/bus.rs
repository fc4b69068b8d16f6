//! Per-session outbound packet bus
//!
//! Three FIFO partitions feed one consumer (the connection writer). Data
//! carries application PUBLISH packets and is the only bounded partition.
//! Control carries acknowledgements, PUBREL and retransmissions; Health
//! carries PINGRESP. Dequeue drains Health, then Control, then Data, so
//! acknowledgements and retransmissions never wait behind a flood of data.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};

use crate::protocol::Packet;

/// What a full data partition does with the next enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Reject the incoming message
    #[default]
    DropNewMessage,
    /// Evict the head of the queue, then append
    DropOldestQueuedMessage,
}

impl FromStr for OverflowStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "drop_new_message" | "drop_new" => Ok(Self::DropNewMessage),
            "drop_oldest_queued_message" | "drop_oldest" => Ok(Self::DropOldestQueuedMessage),
            other => Err(format!("unknown overflow strategy '{}'", other)),
        }
    }
}

impl fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropNewMessage => write!(f, "drop_new_message"),
            Self::DropOldestQueuedMessage => write!(f, "drop_oldest_queued_message"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Data = 0,
    Control = 1,
    Health = 2,
}

const PARTITIONS: usize = 3;
const DEQUEUE_ORDER: [Partition; PARTITIONS] =
    [Partition::Health, Partition::Control, Partition::Data];

/// Final state of a bus item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Written to the transport
    Delivered,
    /// Evicted by a newer message under `DropOldestQueuedMessage`
    Overwritten,
    /// Rejected on enqueue under `DropNewMessage`
    Dropped,
    /// The bus was closed or the item discarded before it was written
    Abandoned,
}

/// Resolves once the item leaves the bus
#[derive(Debug)]
pub struct DeliveryReceipt(oneshot::Receiver<Completion>);

impl DeliveryReceipt {
    pub async fn wait(self) -> Completion {
        self.0.await.unwrap_or(Completion::Abandoned)
    }

    /// Non-blocking probe; `None` while the item is still queued
    pub fn try_result(&mut self) -> Option<Completion> {
        match self.0.try_recv() {
            Ok(completion) => Some(completion),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Completion::Abandoned),
        }
    }
}

/// One queued packet and its completion signal
#[derive(Debug)]
pub struct BusItem {
    pub packet: Packet,
    completion: Option<oneshot::Sender<Completion>>,
}

impl BusItem {
    fn new(packet: Packet) -> (Self, DeliveryReceipt) {
        let (tx, rx) = oneshot::channel();
        let item = Self {
            packet,
            completion: Some(tx),
        };
        (item, DeliveryReceipt(rx))
    }

    pub fn complete(mut self, completion: Completion) -> Packet {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(completion);
        }
        self.packet
    }
}

/// Data partition overflow reported back to the enqueuer
#[derive(Debug)]
pub enum Overflow {
    /// The new packet was not queued
    DroppedNew(Packet),
    /// The returned packet was evicted to make room
    Overwritten(Packet),
}

#[derive(Debug)]
pub struct Enqueued {
    pub receipt: DeliveryReceipt,
    pub overflow: Option<Overflow>,
}

#[derive(Default)]
struct BusInner {
    partitions: [VecDeque<BusItem>; PARTITIONS],
    closed: bool,
}

pub struct PacketBus {
    inner: Mutex<BusInner>,
    notify: Notify,
    max_pending: usize,
    strategy: OverflowStrategy,
}

impl PacketBus {
    pub fn new(max_pending: usize, strategy: OverflowStrategy) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            notify: Notify::new(),
            max_pending: max_pending.max(1),
            strategy,
        }
    }

    pub fn strategy(&self) -> OverflowStrategy {
        self.strategy
    }

    /// Queue a packet. Only the data partition is bounded; a closed bus
    /// abandons the packet immediately.
    pub fn enqueue(&self, packet: Packet, partition: Partition) -> Enqueued {
        let (item, receipt) = BusItem::new(packet);
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            item.complete(Completion::Abandoned);
            return Enqueued {
                receipt,
                overflow: None,
            };
        }

        let queue = &mut inner.partitions[partition as usize];
        let mut overflow = None;
        if partition == Partition::Data && queue.len() >= self.max_pending {
            match self.strategy {
                OverflowStrategy::DropNewMessage => {
                    drop(inner);
                    let packet = item.complete(Completion::Dropped);
                    return Enqueued {
                        receipt,
                        overflow: Some(Overflow::DroppedNew(packet)),
                    };
                }
                OverflowStrategy::DropOldestQueuedMessage => {
                    if let Some(oldest) = queue.pop_front() {
                        overflow = Some(Overflow::Overwritten(
                            oldest.complete(Completion::Overwritten),
                        ));
                    }
                }
            }
        }
        queue.push_back(item);
        drop(inner);
        self.notify.notify_one();
        Enqueued { receipt, overflow }
    }

    /// Take the next item from the highest-priority non-empty partition
    pub fn try_dequeue(&self) -> Option<BusItem> {
        let mut inner = self.inner.lock();
        DEQUEUE_ORDER
            .iter()
            .find_map(|p| inner.partitions[*p as usize].pop_front())
    }

    /// Wait for the next item. Returns `None` once the bus is closed.
    pub async fn dequeue(&self) -> Option<BusItem> {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            notified.await;
        }
    }

    /// Wake a waiting consumer without queueing anything
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Stop accepting items and abandon everything queued
    pub fn close(&self) {
        let drained: Vec<BusItem> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.partitions.iter_mut().flat_map(|q| q.drain(..)).collect()
        };
        for item in drained {
            item.complete(Completion::Abandoned);
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove every queued item of one partition, abandoning it
    pub fn clear(&self, partition: Partition) -> Vec<Packet> {
        let drained: Vec<BusItem> = self.inner.lock().partitions[partition as usize]
            .drain(..)
            .collect();
        drained
            .into_iter()
            .map(|item| item.complete(Completion::Abandoned))
            .collect()
    }

    /// Copies of the queued data packets, oldest first
    pub fn pending_data(&self) -> Vec<Packet> {
        self.inner.lock().partitions[Partition::Data as usize]
            .iter()
            .map(|item| item.packet.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().partitions.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_len(&self) -> usize {
        self.inner.lock().partitions[Partition::Data as usize].len()
    }
}

impl fmt::Debug for PacketBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBus")
            .field("len", &self.len())
            .field("max_pending", &self.max_pending)
            .field("strategy", &self.strategy)
            .finish()
    }
}
