//! Fixed-capacity ring buffer used for all bounded histories: metric
//! samples, activity feeds, and worker exit logs.

/// Circular buffer that overwrites the oldest entry when full.
///
/// `to_vec` and `last_n` always return entries oldest-to-newest regardless
/// of where the write head currently is.
#[derive(Debug, Clone)]
pub struct RingBuffer<T: Clone> {
    items: Vec<T>,
    capacity: usize,
    /// Index the next push writes to
    head: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
            self.head = self.items.len() % self.capacity;
        } else {
            self.items[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently pushed entry.
    pub fn last(&self) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let idx = (self.head + self.capacity - 1) % self.capacity;
        self.items.get(idx)
    }

    /// All entries in push order, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        if self.items.len() < self.capacity {
            return self.items.clone();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.items[self.head..]);
        out.extend_from_slice(&self.items[..self.head]);
        out
    }

    /// The last `n` entries in push order, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<T> {
        let all = self.to_vec();
        let skip = all.len().saturating_sub(n);
        all[skip..].to_vec()
    }

    /// Iterate in push order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older) = if self.items.len() < self.capacity {
            (&self.items[..], &self.items[..0])
        } else {
            (&self.items[self.head..], &self.items[..self.head])
        };
        newer.iter().chain(older.iter())
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_below_capacity() {
        let mut ring = RingBuffer::new(5);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![1, 2, 3]);
        assert_eq!(ring.last(), Some(&3));
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut ring = RingBuffer::new(3);
        for i in 1..=5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![3, 4, 5]);
        assert_eq!(ring.last(), Some(&5));
    }

    #[test]
    fn test_length_is_min_of_pushes_and_capacity() {
        for capacity in [1usize, 2, 7, 16] {
            for pushes in [0usize, 1, 5, 16, 33] {
                let mut ring = RingBuffer::new(capacity);
                for i in 0..pushes {
                    ring.push(i);
                }
                let expected = pushes.min(capacity);
                assert_eq!(ring.len(), expected);
                let contents = ring.to_vec();
                assert_eq!(contents.len(), expected);
                // Contents are exactly the last min(N, C) values in order.
                let expected_values: Vec<usize> = (pushes - expected..pushes).collect();
                assert_eq!(contents, expected_values);
            }
        }
    }

    #[test]
    fn test_last_n() {
        let mut ring = RingBuffer::new(4);
        for i in 1..=6 {
            ring.push(i);
        }
        assert_eq!(ring.last_n(2), vec![5, 6]);
        assert_eq!(ring.last_n(10), vec![3, 4, 5, 6]);
        assert_eq!(ring.last_n(0), Vec::<i32>::new());
    }

    #[test]
    fn test_iter_matches_to_vec() {
        let mut ring = RingBuffer::new(3);
        for i in 0..7 {
            ring.push(i);
        }
        let via_iter: Vec<i32> = ring.iter().copied().collect();
        assert_eq!(via_iter, ring.to_vec());
    }

    #[test]
    fn test_empty() {
        let ring: RingBuffer<u32> = RingBuffer::new(4);
        assert!(ring.is_empty());
        assert_eq!(ring.last(), None);
        assert_eq!(ring.to_vec(), Vec::<u32>::new());
    }

    #[test]
    fn test_clear() {
        let mut ring = RingBuffer::new(2);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        ring.clear();
        assert!(ring.is_empty());
        ring.push(9);
        assert_eq!(ring.to_vec(), vec![9]);
    }

    #[test]
    fn test_capacity_one() {
        let mut ring = RingBuffer::new(1);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.to_vec(), vec!["b"]);
        assert_eq!(ring.last(), Some(&"b"));
    }
}
