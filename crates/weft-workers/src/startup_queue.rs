use crate::config::StartPriority;
use std::collections::VecDeque;

/// Pending startup requests, highest priority first, FIFO within a priority.
///
/// A high-priority request therefore lands at the front of the queue, behind
/// only earlier high-priority requests.
#[derive(Debug)]
pub(crate) struct StartupQueue<T> {
    items: VecDeque<(StartPriority, T)>,
}

impl<T> StartupQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, priority: StartPriority, item: T) {
        let at = self
            .items
            .iter()
            .position(|(queued, _)| *queued < priority)
            .unwrap_or(self.items.len());
        self.items.insert(at, (priority, item));
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front().map(|(_, item)| item)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_priority_jumps_queue() {
        let mut queue = StartupQueue::new();
        queue.push(StartPriority::Normal, "a");
        queue.push(StartPriority::Low, "b");
        queue.push(StartPriority::High, "c");
        queue.push(StartPriority::Normal, "d");
        queue.push(StartPriority::High, "e");

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order, vec!["c", "e", "a", "d", "b"]);
    }

    #[test]
    fn test_empty() {
        let mut queue: StartupQueue<u8> = StartupQueue::new();
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
    }
}
