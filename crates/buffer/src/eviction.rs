//! Pluggable eviction policies for the buffer pool.

use crate::Priority;

/// An unpinned frame eligible for eviction, with the ordering key captured
/// at the moment the last pin was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub frame: usize,
    pub priority: Priority,
    pub last_access: u64,
    pub accessed: u64,
}

impl Candidate {
    fn key(&self) -> (Priority, u64, u64) {
        (self.priority, self.last_access, self.accessed)
    }
}

/// Strategy seam for victim selection. The pool guarantees that offered
/// candidates are unpinned and removes a candidate when its frame is
/// re-pinned; `poll` removes and returns the next victim.
pub trait EvictionQueue: Send {
    fn offer_candidate(&mut self, candidate: Candidate);
    fn remove_candidate(&mut self, frame: usize);
    fn poll(&mut self) -> Option<usize>;
}

/// Default policy: evict the candidate with the smallest
/// `(priority, last_access, accessed)` key, i.e. low-priority pages first,
/// then the least recently used, then the least frequently used.
pub struct LruEvictionQueue {
    candidates: Vec<Candidate>,
}

impl LruEvictionQueue {
    pub fn new() -> LruEvictionQueue {
        LruEvictionQueue {
            candidates: Vec::new(),
        }
    }
}

impl Default for LruEvictionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionQueue for LruEvictionQueue {
    fn offer_candidate(&mut self, candidate: Candidate) {
        self.remove_candidate(candidate.frame);
        self.candidates.push(candidate);
    }

    fn remove_candidate(&mut self, frame: usize) {
        self.candidates.retain(|c| c.frame != frame);
    }

    fn poll(&mut self) -> Option<usize> {
        let best = self
            .candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.key())?
            .0;
        Some(self.candidates.swap_remove(best).frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(frame: usize, priority: Priority, last_access: u64) -> Candidate {
        Candidate {
            frame,
            priority,
            last_access,
            accessed: 0,
        }
    }

    #[test]
    fn polls_lowest_priority_first() {
        let mut q = LruEvictionQueue::new();
        q.offer_candidate(candidate(0, Priority::High, 1));
        q.offer_candidate(candidate(1, Priority::Low, 9));
        q.offer_candidate(candidate(2, Priority::Normal, 2));

        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.poll(), Some(2));
        assert_eq!(q.poll(), Some(0));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn equal_priority_falls_back_to_recency() {
        let mut q = LruEvictionQueue::new();
        q.offer_candidate(candidate(0, Priority::Normal, 5));
        q.offer_candidate(candidate(1, Priority::Normal, 3));
        assert_eq!(q.poll(), Some(1));
    }

    #[test]
    fn removed_candidates_are_not_polled() {
        let mut q = LruEvictionQueue::new();
        q.offer_candidate(candidate(0, Priority::Normal, 1));
        q.offer_candidate(candidate(1, Priority::Normal, 2));
        q.remove_candidate(0);
        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn re_offer_replaces_stale_key() {
        let mut q = LruEvictionQueue::new();
        q.offer_candidate(candidate(0, Priority::Normal, 1));
        q.offer_candidate(candidate(1, Priority::Normal, 2));
        // Frame 0 touched again: now the most recent.
        q.offer_candidate(candidate(0, Priority::Normal, 9));
        assert_eq!(q.poll(), Some(1));
    }
}
