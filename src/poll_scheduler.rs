use std::time::Instant;

/// Time ordered queue of deferred tasks, driven by the transport's per-frame poll. Tasks are
///  plain values (typically a small enum) that the owner interprets when they become due.
///
/// Entries are kept sorted by due time, with tasks for the same due time in insertion order.
///  A task can be scheduled at most once: scheduling it again moves the existing entry.
///  There are only ever a handful of entries, so a sorted Vec with linear insertion is all
///  that is needed.
pub struct PollScheduler<T> {
    entries: Vec<(Instant, T)>,
}

impl<T: PartialEq> PollScheduler<T> {
    pub fn new() -> PollScheduler<T> {
        PollScheduler {
            entries: Vec::new(),
        }
    }

    pub fn schedule(&mut self, task: T, due: Instant) {
        self.cancel(&task);

        let pos = self.entries.iter()
            .position(|(d, _)| *d > due)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (due, task));
    }

    pub fn cancel(&mut self, task: &T) {
        self.entries.retain(|(_, t)| t != task);
    }

    pub fn is_scheduled(&self, task: &T) -> bool {
        self.entries.iter().any(|(_, t)| t == task)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.first().map(|(d, _)| *d)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Removes and returns all tasks that are due at `now`, in order.
    ///
    /// NB: The caller runs them after this returns, so a task that reschedules itself (even for
    ///  right now) runs on the next call at the earliest, never twice in one pass.
    pub fn take_due(&mut self, now: Instant) -> Vec<T> {
        let num_due = self.entries.iter()
            .take_while(|(d, _)| *d <= now)
            .count();
        self.entries.drain(..num_due)
            .map(|(_, t)| t)
            .collect()
    }
}

impl<T: PartialEq> Default for PollScheduler<T> {
    fn default() -> Self {
        PollScheduler::new()
    }
}
