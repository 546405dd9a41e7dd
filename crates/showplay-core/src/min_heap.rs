//! Binary min-heap ordered by next-eligible time
//!
//! Used by the frame dispatcher to pick the controller that may send soonest.
//! Entries are small copyable records (typically an index into an arena of
//! cursor states plus its `next_time`), so the heap never aliases the state it
//! schedules.

/// Anything with a time at which it next becomes eligible.
pub trait Scheduled {
    fn next_time(&self) -> u64;
}

#[derive(Debug, Clone, Default)]
pub struct MinHeap<T> {
    items: Vec<T>,
}

impl<T: Scheduled> MinHeap<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Append and bubble up.
    pub fn insert(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    /// Item with the smallest `next_time`.
    pub fn top(&self) -> Option<&T> {
        self.items.first()
    }

    /// Mutate the root in place, then restore heap order by bubbling it down.
    pub fn update_top<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let root = self.items.first_mut()?;
        let result = f(root);
        self.sift_down(0);
        Some(result)
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let item = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        item
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.items[idx].next_time() >= self.items[parent].next_time() {
                break;
            }
            self.items.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < len && self.items[left].next_time() < self.items[smallest].next_time() {
                smallest = left;
            }
            if right < len && self.items[right].next_time() < self.items[smallest].next_time() {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.items.swap(idx, smallest);
            idx = smallest;
        }
    }
}
