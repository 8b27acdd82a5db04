// ABOUTME: Ingest queue between event producers and the single writer.
// ABOUTME: FIFO and non-blocking; past its capacity new events are dropped, control items never are.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use recorder_core::Event;
use tokio::sync::mpsc;

/// What travels through the queue.
#[derive(Debug)]
pub enum QueueItem {
    Event(Event),
    /// Acknowledged by the writer once everything queued before it is written.
    Barrier(std::sync::mpsc::SyncSender<()>),
    /// Close the current run and the connection, then stop.
    Shutdown,
}

#[derive(Debug)]
struct Counters {
    depth: AtomicUsize,
    dropped: AtomicU64,
}

/// Producer side of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IngestQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    counters: Arc<Counters>,
    capacity: usize,
}

/// Consumer side of the queue, owned by the writer.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    counters: Arc<Counters>,
}

impl IngestQueue {
    /// Create a queue holding at most `capacity` undelivered events.
    /// A capacity of zero means unbounded.
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters {
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        });
        (
            Self {
                tx,
                counters: Arc::clone(&counters),
                capacity,
            },
            QueueReceiver { rx, counters },
        )
    }

    /// Queue an event for the writer. Never blocks. Returns false if the event
    /// was dropped because the queue is full or the writer is gone.
    pub fn enqueue(&self, event: Event) -> bool {
        if self.capacity > 0 {
            let reserved = self
                .counters
                .depth
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                    (depth < self.capacity).then_some(depth + 1)
                })
                .is_ok();
            if !reserved {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "ingest queue full ({} events), dropping {} event (dropped so far: {})",
                    self.capacity,
                    event.event_type,
                    dropped
                );
                return false;
            }
        } else {
            self.counters.depth.fetch_add(1, Ordering::AcqRel);
        }

        if self.tx.send(QueueItem::Event(event)).is_err() {
            self.counters.depth.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!("writer has stopped, event not recorded");
            return false;
        }
        true
    }

    /// Queue a control item. Control items bypass the capacity limit.
    pub fn enqueue_control(&self, item: QueueItem) -> bool {
        debug_assert!(!matches!(item, QueueItem::Event(_)));
        self.tx.send(item).is_ok()
    }

    /// Ask the writer to shut down once it has written everything queued so far.
    pub fn shutdown(&self) -> bool {
        self.enqueue_control(QueueItem::Shutdown)
    }

    /// Events currently waiting for the writer.
    pub fn depth(&self) -> usize {
        self.counters.depth.load(Ordering::Acquire)
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl QueueReceiver {
    /// Block the current thread until an item is available. Returns None once
    /// every producer has been dropped. Must not be called from async code.
    pub fn dequeue(&mut self) -> Option<QueueItem> {
        let item = self.rx.blocking_recv()?;
        if matches!(item, QueueItem::Event(_)) {
            self.counters.depth.fetch_sub(1, Ordering::AcqRel);
        }
        Some(item)
    }
}
