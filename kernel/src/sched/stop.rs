//! Stop class
//!
//! Kernel-internal highest class. A stop task preempts everything on its
//! CPU and is used for work that must run with the CPU to itself, such as
//! pushing tasks off a runqueue that is going offline. At most a handful of
//! stoppers ever exist; a plain FIFO suffices.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use super::task::Task;

pub struct StopQueue {
    pending: VecDeque<Arc<Task>>,
}

impl StopQueue {
    pub const fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    pub fn nr_queued(&self) -> usize {
        self.pending.len()
    }

    pub fn enqueue(&mut self, task: Arc<Task>) {
        self.pending.push_back(task);
    }

    pub fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        match self.pending.iter().position(|t| t.tid() == task.tid()) {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn pick_next(&mut self) -> Option<Arc<Task>> {
        self.pending.pop_front()
    }
}

impl Default for StopQueue {
    fn default() -> Self {
        Self::new()
    }
}
