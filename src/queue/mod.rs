//! Bounded multi-producer, single-consumer dispatch queue.
//!
//! A pre-allocated ring of slots, each carrying a sequence number. Producers
//! claim a position with a CAS on the claim counter, write the value, then
//! publish it by advancing the slot's sequence. The single consumer reads
//! positions strictly in claim order, so values arrive in the order their
//! positions were claimed.
//!
//! A full ring blocks producers: they spin with exponential backoff, then
//! park until the consumer frees a slot. Nothing is dropped.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Upper bound on a single park. Wakeups are signalled explicitly; this
/// only caps the cost of a missed one.
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity {0} must be a non-zero power of two")]
    Capacity(usize),
}

/// Returned with the rejected value when publishing into a closed queue.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("dispatch queue is closed")]
pub struct Closed<T>(pub T);

/// How a publish completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Immediate,
    /// The ring was full and the producer had to wait for the consumer.
    AfterWait,
}

/// Result of a consumer poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll<T> {
    Item {
        value: T,
        /// No further value was published when this one was taken.
        end_of_batch: bool,
    },
    /// Nothing arrived before the timeout.
    Idle,
    /// The queue is closed and fully drained.
    Closed,
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Shared<T> {
    slots: Box<[Slot<T>]>,
    capacity: usize,
    mask: usize,
    /// Next position a producer claims.
    claim: CachePadded<AtomicUsize>,
    /// Next position the consumer takes.
    cursor: CachePadded<AtomicUsize>,
    closed: AtomicBool,
    /// Producers between their closed check and the end of their publish.
    publishing: AtomicUsize,
    parked_producers: AtomicUsize,
    consumer_parked: AtomicBool,
    lock: Mutex<()>,
    not_full: Condvar,
    not_empty: Condvar,
}

// Slots are handed between threads through the sequence protocol: a slot is
// written only by the producer that claimed it and read only by the consumer
// after the producer published it.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Creates a queue with room for `capacity` values.
pub fn bounded<T>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
    if !capacity.is_power_of_two() {
        return Err(QueueError::Capacity(capacity));
    }

    let slots: Vec<Slot<T>> = (0..capacity)
        .map(|i| Slot {
            sequence: AtomicUsize::new(i),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        })
        .collect();

    let shared = Arc::new(Shared {
        slots: slots.into_boxed_slice(),
        capacity,
        mask: capacity - 1,
        claim: CachePadded::new(AtomicUsize::new(0)),
        cursor: CachePadded::new(AtomicUsize::new(0)),
        closed: AtomicBool::new(false),
        publishing: AtomicUsize::new(0),
        parked_producers: AtomicUsize::new(0),
        consumer_parked: AtomicBool::new(false),
        lock: Mutex::new(()),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    });

    Ok((
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared, cursor: 0 },
    ))
}

enum TryPublish<T> {
    Full(T),
    Closed(T),
}

impl<T> Shared<T> {
    fn try_publish(&self, value: T) -> Result<(), TryPublish<T>> {
        // A consumer that sees `closed` waits for `publishing` to reach zero,
        // so a producer past this check always lands before `Poll::Closed`.
        self.publishing.fetch_add(1, Ordering::SeqCst);
        let result = if self.closed.load(Ordering::SeqCst) {
            Err(TryPublish::Closed(value))
        } else {
            self.claim_and_write(value)
        };
        self.publishing.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn claim_and_write(&self, value: T) -> Result<(), TryPublish<T>> {
        let mut pos = self.claim.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.claim.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this producer the only writer
                        // of the slot until its sequence is advanced.
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(TryPublish::Full(value));
            } else {
                pos = self.claim.load(Ordering::Relaxed);
            }
        }
    }

    fn is_published(&self, pos: usize) -> bool {
        self.slots[pos & self.mask].sequence.load(Ordering::Acquire) == pos.wrapping_add(1)
    }

    fn len(&self) -> usize {
        let claim = self.claim.load(Ordering::Acquire);
        let cursor = self.cursor.load(Ordering::Acquire);
        claim.wrapping_sub(cursor).min(self.capacity)
    }

    fn park_producer(&self) {
        self.parked_producers.fetch_add(1, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        {
            let mut guard = self.lock.lock();
            if self.len() >= self.capacity && !self.closed.load(Ordering::Acquire) {
                self.not_full.wait_for(&mut guard, PARK_TIMEOUT);
            }
        }
        self.parked_producers.fetch_sub(1, Ordering::SeqCst);
    }

    fn park_consumer(&self, cursor: usize, until: Instant) {
        self.consumer_parked.store(true, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        {
            let mut guard = self.lock.lock();
            if !self.is_published(cursor) && !self.closed.load(Ordering::Acquire) {
                self.not_empty.wait_until(&mut guard, until);
            }
        }
        self.consumer_parked.store(false, Ordering::SeqCst);
    }

    fn wake_consumer(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.consumer_parked.load(Ordering::SeqCst) {
            let _guard = self.lock.lock();
            self.not_empty.notify_one();
        }
    }

    fn wake_producers(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.parked_producers.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.not_full.notify_all();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let claim = *self.claim.get_mut();
        let mut pos = *self.cursor.get_mut();
        while pos != claim {
            let slot = &mut self.slots[pos & self.mask];
            if *slot.sequence.get_mut() == pos.wrapping_add(1) {
                // SAFETY: a published, untaken slot holds an initialized value.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
            pos = pos.wrapping_add(1);
        }
    }
}

/// Publishing half. Cheap to clone; every clone feeds the same consumer.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Producer<T> {
    /// Publishes `value`, blocking while the ring is full.
    pub fn publish(&self, value: T) -> Result<Published, Closed<T>> {
        let backoff = Backoff::new();
        let mut value = value;
        let mut waited = false;

        loop {
            match self.shared.try_publish(value) {
                Ok(()) => {
                    self.shared.wake_consumer();
                    return Ok(if waited {
                        Published::AfterWait
                    } else {
                        Published::Immediate
                    });
                }
                Err(TryPublish::Closed(rejected)) => return Err(Closed(rejected)),
                Err(TryPublish::Full(rejected)) => {
                    value = rejected;
                    waited = true;
                    if backoff.is_completed() {
                        self.shared.park_producer();
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Stops accepting values. The consumer drains what was already
    /// published, then observes [`Poll::Closed`].
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Approximate number of values waiting.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Consuming half. Exactly one per queue.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    cursor: usize,
}

impl<T> Consumer<T> {
    /// Takes the next value if one is published.
    pub fn try_take(&mut self) -> Option<T> {
        let pos = self.cursor;
        let slot = &self.shared.slots[pos & self.shared.mask];
        if slot.sequence.load(Ordering::Acquire) != pos.wrapping_add(1) {
            return None;
        }

        // SAFETY: the sequence says the slot was published at `pos`, and only
        // this consumer reads it before handing the slot back.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence
            .store(pos.wrapping_add(self.shared.capacity), Ordering::Release);

        self.cursor = pos.wrapping_add(1);
        self.shared.cursor.store(self.cursor, Ordering::Release);
        self.shared.wake_producers();
        Some(value)
    }

    /// Waits up to `timeout` for the next value.
    pub fn poll_timeout(&mut self, timeout: Duration) -> Poll<T> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();

        loop {
            if let Some(value) = self.try_take() {
                let end_of_batch = !self.shared.is_published(self.cursor);
                return Poll::Item {
                    value,
                    end_of_batch,
                };
            }

            if self.shared.closed.load(Ordering::SeqCst)
                && self.shared.publishing.load(Ordering::SeqCst) == 0
                && self.shared.claim.load(Ordering::SeqCst) == self.cursor
            {
                return Poll::Closed;
            }

            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Poll::Idle;
            }
            self.shared
                .park_consumer(self.cursor, deadline.min(now + PARK_TIMEOUT));
        }
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dropping the consumer closes the queue. Producers then get [`Closed`]
/// instead of blocking on a ring nobody drains.
impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}
