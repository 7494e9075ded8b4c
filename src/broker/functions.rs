use std::collections::{HashMap, VecDeque};

use crate::broker::job::{JobHandle, Priority, WorkerId, PRIORITY_TIERS};

/// Per-function dispatch state: the pending queue (one FIFO ring per
/// priority tier) and the workers currently parked waiting for work on
/// this function, in registration order.
#[derive(Debug, Default)]
pub struct Function {
    pending: [VecDeque<JobHandle>; PRIORITY_TIERS],
    waiting: VecDeque<WorkerId>,
}

impl Function {
    /// Total pending jobs across all tiers.
    pub fn depth(&self) -> usize {
        self.pending.iter().map(|tier| tier.len()).sum()
    }

    /// The next job this function would dispatch: front of the highest
    /// non-empty tier.
    pub fn peek_best(&self) -> Option<&JobHandle> {
        self.pending.iter().find_map(|tier| tier.front())
    }

    fn pop_best(&mut self) -> Option<JobHandle> {
        self.pending
            .iter_mut()
            .find(|tier| !tier.is_empty())
            .and_then(|tier| tier.pop_front())
    }
}

/// Maps function name -> pending jobs + waiting workers.
///
/// Owns no job state beyond handles; the registry is the source of truth.
#[derive(Debug, Default)]
pub struct FunctionTable {
    functions: HashMap<String, Function>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the function entry if absent. Idempotent.
    pub fn ensure(&mut self, name: &str) -> &mut Function {
        self.functions.entry(name.to_string()).or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Append a job to the back of its priority tier.
    pub fn enqueue(&mut self, name: &str, handle: JobHandle, priority: Priority) {
        self.ensure(name).pending[priority.tier()].push_back(handle);
    }

    /// Put a job back at the front of its tier, ahead of same-priority
    /// newcomers. Used when a worker drops mid-run.
    pub fn requeue_front(&mut self, name: &str, handle: JobHandle, priority: Priority) {
        self.ensure(name).pending[priority.tier()].push_front(handle);
    }

    /// Pop the highest-priority, oldest pending job for one function.
    pub fn pop_best(&mut self, name: &str) -> Option<JobHandle> {
        self.functions.get_mut(name).and_then(Function::pop_best)
    }

    /// Drop a specific handle from the pending rings (cancel path).
    /// Returns whether it was found.
    pub fn remove_pending(&mut self, name: &str, handle: &JobHandle) -> bool {
        let Some(function) = self.functions.get_mut(name) else {
            return false;
        };
        for tier in function.pending.iter_mut() {
            if let Some(pos) = tier.iter().position(|h| h == handle) {
                tier.remove(pos);
                return true;
            }
        }
        false
    }

    /// Park a worker at the back of the waiting ring. No-op if already
    /// parked there.
    pub fn park_worker(&mut self, name: &str, worker: WorkerId) {
        let function = self.ensure(name);
        if !function.waiting.contains(&worker) {
            function.waiting.push_back(worker);
        }
    }

    /// First-registered waiting worker for a function, if any.
    pub fn pop_waiting(&mut self, name: &str) -> Option<WorkerId> {
        self.functions
            .get_mut(name)
            .and_then(|f| f.waiting.pop_front())
    }

    /// Remove a worker from every waiting ring. Called when the worker is
    /// handed a job, times out, or disconnects.
    pub fn unpark_worker(&mut self, worker: WorkerId) {
        for function in self.functions.values_mut() {
            function.waiting.retain(|w| *w != worker);
        }
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn waiting_count(&self, name: &str) -> usize {
        self.functions.get(name).map_or(0, |f| f.waiting.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64) -> JobHandle {
        JobHandle(format!("H:test:{}", n))
    }

    #[test]
    fn pop_is_priority_major_fifo_minor() {
        let mut table = FunctionTable::new();
        table.enqueue("resize", h(1), Priority::Normal);
        table.enqueue("resize", h(2), Priority::High);
        table.enqueue("resize", h(3), Priority::Normal);
        table.enqueue("resize", h(4), Priority::Low);
        table.enqueue("resize", h(5), Priority::High);

        let order: Vec<JobHandle> = std::iter::from_fn(|| table.pop_best("resize")).collect();
        assert_eq!(order, vec![h(2), h(5), h(1), h(3), h(4)]);
    }

    #[test]
    fn requeue_front_goes_ahead_of_same_tier() {
        let mut table = FunctionTable::new();
        table.enqueue("resize", h(1), Priority::Normal);
        table.requeue_front("resize", h(2), Priority::Normal);

        assert_eq!(table.pop_best("resize"), Some(h(2)));
        assert_eq!(table.pop_best("resize"), Some(h(1)));
    }

    #[test]
    fn requeue_front_does_not_preempt_higher_tier() {
        let mut table = FunctionTable::new();
        table.enqueue("resize", h(1), Priority::High);
        table.requeue_front("resize", h(2), Priority::Normal);

        assert_eq!(table.pop_best("resize"), Some(h(1)));
        assert_eq!(table.pop_best("resize"), Some(h(2)));
    }

    #[test]
    fn waiting_ring_is_fifo_and_dedups() {
        let mut table = FunctionTable::new();
        table.park_worker("resize", WorkerId(1));
        table.park_worker("resize", WorkerId(2));
        table.park_worker("resize", WorkerId(1));

        assert_eq!(table.waiting_count("resize"), 2);
        assert_eq!(table.pop_waiting("resize"), Some(WorkerId(1)));
        assert_eq!(table.pop_waiting("resize"), Some(WorkerId(2)));
        assert_eq!(table.pop_waiting("resize"), None);
    }

    #[test]
    fn unpark_removes_from_every_ring() {
        let mut table = FunctionTable::new();
        table.park_worker("resize", WorkerId(1));
        table.park_worker("thumbnail", WorkerId(1));
        table.unpark_worker(WorkerId(1));

        assert_eq!(table.waiting_count("resize"), 0);
        assert_eq!(table.waiting_count("thumbnail"), 0);
    }

    #[test]
    fn remove_pending_drops_only_the_target() {
        let mut table = FunctionTable::new();
        table.enqueue("resize", h(1), Priority::Normal);
        table.enqueue("resize", h(2), Priority::Normal);

        assert!(table.remove_pending("resize", &h(1)));
        assert!(!table.remove_pending("resize", &h(1)));
        assert_eq!(table.pop_best("resize"), Some(h(2)));
    }
}
