//! Round-robin selection over a fixed-size pool.

/// Cursor over `len` slots that hands out indices in stable rotation order.
///
/// Every call advances the cursor modulo `len`, wrapping to 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRobin {
    len: usize,
    cursor: usize,
}

impl RoundRobin {
    /// Create a rotation over `len` slots, starting at slot 0.
    pub fn new(len: usize) -> Self {
        Self { len, cursor: 0 }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if there is nothing to rotate over.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index the next call will consider first.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Hand out the current slot and advance.
    pub fn next_index(&mut self) -> Option<usize> {
        self.next_matching(|_| true)
    }

    /// Hand out the first slot from the cursor on that satisfies `usable`.
    ///
    /// Unusable slots are stepped over; the cursor ends one past the slot
    /// returned. Returns `None` after a full lap with no usable slot.
    pub fn next_matching(&mut self, usable: impl Fn(usize) -> bool) -> Option<usize> {
        for _ in 0..self.len {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % self.len;
            if usable(index) {
                return Some(index);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_slot_once_per_lap() {
        let mut rr = RoundRobin::new(3);
        let lap: Vec<usize> = (0..3).filter_map(|_| rr.next_index()).collect();
        assert_eq!(lap, vec![0, 1, 2]);
    }

    #[test]
    fn repeats_same_order() {
        let mut rr = RoundRobin::new(3);
        let picks: Vec<usize> = (0..7).filter_map(|_| rr.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(rr.cursor(), 1);
    }

    #[test]
    fn empty_rotation_yields_nothing() {
        let mut rr = RoundRobin::new(0);
        assert!(rr.is_empty());
        assert_eq!(rr.next_index(), None);
    }

    #[test]
    fn skips_unusable_slots() {
        let mut rr = RoundRobin::new(4);
        let picks: Vec<usize> = (0..4).filter_map(|_| rr.next_matching(|i| i != 1)).collect();
        assert_eq!(picks, vec![0, 2, 3, 0]);
    }

    #[test]
    fn full_lap_without_usable_slot_returns_none() {
        let mut rr = RoundRobin::new(3);
        rr.next_index();
        assert_eq!(rr.next_matching(|_| false), None);
        assert_eq!(rr.cursor(), 1);
    }
}
