//! Event queue for the discrete-event simulation.
//!
//! Events are ordered by `(time_us, kind priority, insertion sequence)`.
//! All three components are integers, so the order is total and never
//! depends on hashing or iteration order of any collection.

use crate::clock::SimClock;
use crate::request::Request;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Implemented by event payloads to declare their tie-break rank.
///
/// At equal timestamps, lower ranks are processed first.
pub trait EventKind {
    fn priority(&self) -> u8;
}

/// A timestamped event for the priority queue.
#[derive(Debug, Clone)]
struct TimedEvent<E> {
    time_us: u64,
    priority: u8,
    sequence: u64,
    event: E,
}

impl<E> TimedEvent<E> {
    fn key(&self) -> (u64, u8, u64) {
        (self.time_us, self.priority, self.sequence)
    }
}

impl<E> PartialEq for TimedEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<E> Eq for TimedEvent<E> {}

impl<E> PartialOrd for TimedEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for TimedEvent<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want min-heap
        other.key().cmp(&self.key())
    }
}

/// Pending events plus the simulation clock they drive.
#[derive(Debug, Clone)]
pub struct EventQueue<E> {
    clock: SimClock,
    heap: BinaryHeap<TimedEvent<E>>,
    sequence: u64,
}

impl<E: EventKind> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            clock: SimClock::new(),
            heap: BinaryHeap::new(),
            sequence: 0,
        }
    }

    /// Insert an event at `time_us`.
    ///
    /// # Panics
    ///
    /// Panics if `time_us` is before the current clock.
    pub fn schedule(&mut self, time_us: u64, event: E) {
        assert!(
            time_us >= self.clock.now_us(),
            "cannot schedule event in the past: now={}us, event={}us",
            self.clock.now_us(),
            time_us,
        );
        let priority = event.priority();
        self.heap.push(TimedEvent {
            time_us,
            priority,
            sequence: self.sequence,
            event,
        });
        self.sequence += 1;
    }

    /// Pop the earliest event and move the clock to its timestamp.
    pub fn advance(&mut self) -> Option<(u64, E)> {
        let timed = self.heap.pop()?;
        self.clock.advance_to_us(timed.time_us);
        Some((timed.time_us, timed.event))
    }

    /// Timestamp of the next event without removing it.
    pub fn peek_time(&self) -> Option<u64> {
        self.heap.peek().map(|t| t.time_us)
    }

    pub fn now(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Total events ever scheduled.
    pub fn scheduled_count(&self) -> u64 {
        self.sequence
    }
}

impl<E: EventKind> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events of the cluster simulation.
///
/// At equal timestamps the request pipeline runs first (arrival, then
/// admission, then routing), followed by instance events.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// A request reaches the cluster front door.
    Arrival(Request),
    /// The admission policy looks at the request.
    Admission(Request),
    /// The routing policy picks an instance.
    Routing(Request),
    /// A routed request joins `instance`'s wait queue.
    Queued { instance: usize, request: Request },
    /// The step in flight on `instance` finishes.
    StepComplete { instance: usize },
}

impl EventKind for SimEvent {
    fn priority(&self) -> u8 {
        match self {
            SimEvent::Arrival(_) => 0,
            SimEvent::Admission(_) => 1,
            SimEvent::Routing(_) => 2,
            SimEvent::Queued { .. } => 3,
            SimEvent::StepComplete { .. } => 4,
        }
    }
}
