//! Wait-queue ordering policies.
//!
//! Each scheduler returns a permutation of the wait queue. All sorts are
//! stable and end on `(arrival_us, id)` so equal keys keep a total order.

use crate::traits::*;
use std::cmp::Ordering;

fn identity(n: usize) -> Vec<usize> {
    (0..n).collect()
}

fn arrival_then_id(a: &QueuedRequest, b: &QueuedRequest) -> Ordering {
    a.arrival_us.cmp(&b.arrival_us).then(a.id.cmp(&b.id))
}

fn sorted_by<F>(waiting: &[QueuedRequest], mut cmp: F) -> Vec<usize>
where
    F: FnMut(&QueuedRequest, &QueuedRequest) -> Ordering,
{
    let mut order = identity(waiting.len());
    order.sort_by(|&a, &b| cmp(&waiting[a], &waiting[b]));
    order
}

/// First-come first-served: keeps the queue exactly as it is.
///
/// Preempted requests are pushed to the front of the queue, so they resume
/// before newer arrivals.
pub struct Fcfs;

impl SchedulerPolicy for Fcfs {
    fn order(&self, waiting: &[QueuedRequest], _running: &[QueuedRequest]) -> Vec<usize> {
        identity(waiting.len())
    }

    fn name(&self) -> &str {
        "fcfs"
    }
}

/// Shortest job first, by output tokens still to generate.
pub struct Sjf;

impl SchedulerPolicy for Sjf {
    fn order(&self, waiting: &[QueuedRequest], _running: &[QueuedRequest]) -> Vec<usize> {
        sorted_by(waiting, |a, b| {
            a.remaining_work
                .cmp(&b.remaining_work)
                .then_with(|| arrival_then_id(a, b))
        })
    }

    fn name(&self) -> &str {
        "sjf"
    }
}

/// Highest priority first, then arrival order.
pub struct PriorityFcfs;

impl SchedulerPolicy for PriorityFcfs {
    fn order(&self, waiting: &[QueuedRequest], _running: &[QueuedRequest]) -> Vec<usize> {
        sorted_by(waiting, |a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| arrival_then_id(a, b))
        })
    }

    fn name(&self) -> &str {
        "priority-fcfs"
    }
}

/// Lowest priority first. Pathological; used to provoke priority inversion.
pub struct ReversePriority;

impl SchedulerPolicy for ReversePriority {
    fn order(&self, waiting: &[QueuedRequest], _running: &[QueuedRequest]) -> Vec<usize> {
        sorted_by(waiting, |a, b| {
            a.priority
                .total_cmp(&b.priority)
                .then_with(|| arrival_then_id(a, b))
        })
    }

    fn name(&self) -> &str {
        "reverse-priority"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: u64, arrival_us: u64, priority: f64, remaining_work: u32) -> QueuedRequest {
        QueuedRequest {
            id,
            arrival_us,
            priority,
            remaining_work,
        }
    }

    fn ids(waiting: &[QueuedRequest], order: &[usize]) -> Vec<u64> {
        order.iter().map(|&i| waiting[i].id).collect()
    }

    #[test]
    fn test_fcfs_keeps_queue_order() {
        let waiting = vec![queued(3, 30, 0.0, 5), queued(1, 10, 0.0, 50), queued(2, 20, 0.0, 1)];
        assert_eq!(Fcfs.order(&waiting, &[]), vec![0, 1, 2]);
    }

    #[test]
    fn test_sjf_orders_by_remaining_work() {
        let waiting = vec![queued(0, 0, 0.0, 100), queued(1, 10, 0.0, 5), queued(2, 20, 0.0, 50)];
        let order = Sjf.order(&waiting, &[]);
        assert_eq!(ids(&waiting, &order), vec![1, 2, 0]);
    }

    #[test]
    fn test_sjf_ties_break_by_arrival_then_id() {
        let waiting = vec![queued(9, 20, 0.0, 5), queued(4, 10, 0.0, 5), queued(2, 10, 0.0, 5)];
        let order = Sjf.order(&waiting, &[]);
        assert_eq!(ids(&waiting, &order), vec![2, 4, 9]);
    }

    #[test]
    fn test_priority_fcfs_orders_by_priority_then_arrival() {
        let waiting = vec![
            queued(0, 0, 1.0, 10),
            queued(1, 5, 2.0, 10),
            queued(2, 3, 2.0, 10),
            queued(3, 1, 0.0, 10),
        ];
        let order = PriorityFcfs.order(&waiting, &[]);
        assert_eq!(ids(&waiting, &order), vec![2, 1, 0, 3]);
    }

    #[test]
    fn test_reverse_priority_runs_lowest_first() {
        let waiting = vec![queued(0, 0, 2.0, 10), queued(1, 1, 0.0, 10)];
        let order = ReversePriority.order(&waiting, &[]);
        assert_eq!(ids(&waiting, &order), vec![1, 0]);
    }

    #[test]
    fn test_order_is_permutation() {
        let waiting: Vec<_> = (0..20)
            .map(|i| queued(i, (i * 7) % 5, (i % 3) as f64, ((i * 13) % 11) as u32))
            .collect();
        let schedulers: [&dyn SchedulerPolicy; 4] = [&Fcfs, &Sjf, &PriorityFcfs, &ReversePriority];
        for s in schedulers {
            let mut order = s.order(&waiting, &[]);
            order.sort_unstable();
            assert_eq!(order, (0..20).collect::<Vec<_>>(), "{}", s.name());
        }
    }
}
