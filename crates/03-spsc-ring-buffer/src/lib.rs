// ============================================================
//  Lock-free SPSC ring buffer with batched index publication.
//
//  After "A Lock-Free, Cache-Efficient Shared Ring Buffer for
//  Multi-Core Architectures" (Lee, Bu, Chandranmenon). One
//  producer thread, one consumer thread, a fixed ring of N
//  slots, and exactly two shared words: `head`, published by
//  the producer, and `tail`, published by the consumer.
//
//  The trick is what is NOT shared. Each side keeps a private
//  cursor plus a cached copy of the other side's published
//  index, and only touches the shared word when its cache says
//  the ring looks full (producer) or empty (consumer). Shared
//  indices are published once per B operations instead of once
//  per operation, so under steady flow each cache line carrying
//  an index crosses cores once per batch rather than once per
//  event. `head` and `tail` are additionally padded to their
//  own cache lines so the two publishers never false-share.
//
//  End of stream is a distinguished sentinel slot value: the
//  producer finishes with produced_last(), which emits the
//  sentinel and then unconditionally flushes the partial batch,
//  making everything before it observable. In this API the
//  sentinel is None - produce() takes a T, so a caller cannot
//  forge it.
// ============================================================

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};

/// Ring capacity used by the throughput driver. One slot is always kept
/// vacant to distinguish full from empty, so N slots hold N - 1 events.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Operations between publications of a shared index.
pub const DEFAULT_BATCH: usize = 128;

/// The storage both endpoints point at. Slot cells are handed back and
/// forth by the published indices: the producer owns the vacant region
/// ahead of `next_head`, the consumer owns the filled region behind it.
struct Shared<T, const N: usize> {
    slots: [UnsafeCell<Option<T>>; N],
    /// Producer's publication: slots before this index are readable.
    head: CachePadded<AtomicUsize>,
    /// Consumer's publication: slots before this index are writable again.
    tail: CachePadded<AtomicUsize>,
}

// Each slot cell is accessed by exactly one thread at a time: the
// producer until the covering `head` store, the consumer after the
// matching load. The release/acquire pair on the index transfers
// ownership of the cells it covers.
unsafe impl<T: Send, const N: usize> Sync for Shared<T, N> {}

/// Writing endpoint. Owned by the producer thread.
pub struct Producer<T, const N: usize, const B: usize> {
    shared: Arc<Shared<T, N>>,
    next_head: usize,
    local_tail: usize,
    batch: usize,
}

/// Reading endpoint. Owned by the consumer thread.
pub struct Consumer<T, const N: usize, const B: usize> {
    shared: Arc<Shared<T, N>>,
    next_tail: usize,
    local_head: usize,
    batch: usize,
}

/// Create a buffer of `N` slots publishing every `B` operations and split
/// it into its two endpoints. Memory is released when both are dropped.
pub fn allocate<T, const N: usize, const B: usize>() -> (Producer<T, N, B>, Consumer<T, N, B>) {
    assert!(N >= 2, "ring needs at least one usable slot");
    assert!(B >= 1, "batch size must be positive");
    // B >= N can deadlock: producer full with nothing published yet,
    // consumer spinning on an empty-looking ring.
    assert!(B < N, "batch size must be smaller than the ring");

    let shared = Arc::new(Shared {
        slots: std::array::from_fn(|_| UnsafeCell::new(None)),
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        Producer { shared: Arc::clone(&shared), next_head: 0, local_tail: 0, batch: 0 },
        Consumer { shared, next_tail: 0, local_head: 0, batch: 0 },
    )
}

impl<T, const N: usize, const B: usize> Producer<T, N, B> {
    /// Append one event, spinning while the ring is full.
    pub fn produce(&mut self, event: T) {
        self.write(Some(event));
    }

    /// Declare the stream complete: emit the end-of-stream sentinel, then
    /// flush the partial batch so every prior event becomes observable.
    /// Consumes the endpoint - nothing can be produced afterwards.
    pub fn produced_last(mut self) {
        self.write(None);
        self.shared.head.store(self.next_head, Ordering::Release);
    }

    fn write(&mut self, value: Option<T>) {
        let after_next = (self.next_head + 1) % N;

        // Ring looks full; refresh the cached tail and spin until the
        // consumer has vacated the slot we are about to claim.
        if after_next == self.local_tail {
            let backoff = Backoff::new();
            loop {
                let tail = self.shared.tail.load(Ordering::Acquire);
                if tail != after_next {
                    self.local_tail = tail;
                    break;
                }
                backoff.snooze();
            }
        }

        // Owned cell: the consumer cannot look at it until the covering
        // head publication below (or in produced_last).
        unsafe { *self.shared.slots[self.next_head].get() = value };
        self.next_head = after_next;

        self.batch += 1;
        if self.batch >= B {
            self.shared.head.store(self.next_head, Ordering::Release);
            self.batch = 0;
        }
    }
}

impl<T, const N: usize, const B: usize> Consumer<T, N, B> {
    /// Take the next event, spinning while the ring looks empty.
    /// Returns None once the producer has called `produced_last` and
    /// everything before the sentinel has been drained.
    pub fn consume(&mut self) -> Option<T> {
        if self.next_tail == self.local_head {
            let backoff = Backoff::new();
            loop {
                let head = self.shared.head.load(Ordering::Acquire);
                if head != self.next_tail {
                    self.local_head = head;
                    break;
                }
                backoff.snooze();
            }
        }

        let event = unsafe { (*self.shared.slots[self.next_tail].get()).take() };
        self.next_tail = (self.next_tail + 1) % N;

        self.batch += 1;
        if self.batch >= B {
            self.shared.tail.store(self.next_tail, Ordering::Release);
            self.batch = 0;
        }
        event
    }
}

// ============================================================
//  TESTS
// ============================================================
