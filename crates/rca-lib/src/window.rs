//! Fixed-size sliding window
//!
//! A ring buffer that slides by index: once full, each push overwrites the
//! oldest slot, so appends are O(1) and no memory is reallocated.

/// Fixed-capacity ring buffer of the most recent observations
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    slots: Vec<Option<T>>,
    /// Index of the slot the next push writes to
    head: usize,
    len: usize,
}

impl<T> SlidingWindow<T> {
    /// Create a window holding at most `capacity` observations (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Append an observation, returning the evicted one when the window was full
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = self.slots[self.head].replace(value);
        self.head = (self.head + 1) % self.slots.len();
        if self.len < self.slots.len() {
            self.len += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let cap = self.slots.len();
        let start = (self.head + cap - self.len) % cap;
        (0..self.len).filter_map(move |i| self.slots[(start + i) % cap].as_ref())
    }

    pub fn newest(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let cap = self.slots.len();
        self.slots[(self.head + cap - 1) % cap].as_ref()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.iter().next()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }

    /// Keep only the observations matching `keep`, preserving their order.
    /// Returns the number removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let cap = self.slots.len();
        let start = (self.head + cap - self.len) % cap;
        let mut kept = Vec::with_capacity(self.len);
        for i in 0..self.len {
            if let Some(value) = self.slots[(start + i) % cap].take() {
                if keep(&value) {
                    kept.push(value);
                }
            }
        }

        let removed = self.len - kept.len();
        self.head = 0;
        self.len = 0;
        for value in kept {
            self.push(value);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_until_full() {
        let mut window = SlidingWindow::new(3);
        assert!(window.is_empty());

        assert!(window.push(1).is_none());
        assert!(window.push(2).is_none());
        assert!(window.push(3).is_none());
        assert!(window.is_full());
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_overwrites_oldest() {
        let mut window = SlidingWindow::new(3);
        for i in 1..=5 {
            window.push(i);
        }

        assert_eq!(window.len(), 3);
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(window.oldest(), Some(&3));
        assert_eq!(window.newest(), Some(&5));
        assert_eq!(window.push(6), Some(3));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut window = SlidingWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.push("a");
        window.push("b");
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_retain_after_wrap() {
        let mut window = SlidingWindow::new(3);
        for i in 1..=5 {
            window.push(i);
        }

        assert_eq!(window.retain(|v| v % 2 == 1), 1);
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![3, 5]);
        assert_eq!(window.newest(), Some(&5));

        window.push(6);
        window.push(7);
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![5, 6, 7]);
    }

    #[test]
    fn test_clear() {
        let mut window = SlidingWindow::new(2);
        window.push(1);
        window.clear();
        assert!(window.is_empty());
        assert!(window.newest().is_none());
    }
}
