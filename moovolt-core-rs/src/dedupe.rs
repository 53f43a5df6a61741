//! Bounded window of recently seen correlation ids

use std::collections::{HashSet, VecDeque};

use crate::types::CorrelationId;

#[derive(Debug)]
pub struct DedupeWindow {
    capacity: usize,
    order: VecDeque<CorrelationId>,
    seen: HashSet<CorrelationId>,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `id`. Returns false when it was already in the window.
    pub fn insert(&mut self, id: &CorrelationId) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.seen.insert(id.clone());
        true
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_rejected() {
        let mut window = DedupeWindow::new(4);
        let id = CorrelationId::new("CS001:1");
        assert!(window.insert(&id));
        assert!(!window.insert(&id));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut window = DedupeWindow::new(2);
        let ids: Vec<_> = (0..3).map(|i| CorrelationId::new(format!("m{}", i))).collect();
        for id in &ids {
            assert!(window.insert(id));
        }
        assert!(!window.contains(&ids[0]));
        assert!(window.contains(&ids[2]));
        assert!(window.insert(&ids[0]));
    }
}
