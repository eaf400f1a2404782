use std::collections::HashMap;

use ethers::types::H256;

/// An ordered queue of keyed items with O(1) key lookup.
///
/// Supports head and tail enqueue, positional delete, and a draining
/// snapshot. The key-to-index map is maintained on every mutation so that
/// `find_index` always agrees with the item order.
#[derive(Debug, Default)]
pub struct KeyedQueue<T> {
    items: Vec<(H256, T)>,
    keys: HashMap<H256, usize>,
}

impl<T> KeyedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            keys: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_key(&self, key: H256) -> bool {
        self.keys.contains_key(&key)
    }

    pub fn find_index(&self, key: H256) -> Option<usize> {
        self.keys.get(&key).copied()
    }

    pub fn enqueue_head(&mut self, key: H256, item: T) {
        self.items.insert(0, (key, item));
        for index in self.keys.values_mut() {
            *index += 1;
        }
        self.keys.insert(key, 0);
    }

    pub fn enqueue_tail(&mut self, key: H256, item: T) {
        self.items.push((key, item));
        self.keys.insert(key, self.items.len() - 1);
    }

    pub fn peek(&self, index: usize) -> Option<&T> {
        self.items.get(index).map(|(_, item)| item)
    }

    pub fn delete(&mut self, index: usize) -> Option<(H256, T)> {
        if index >= self.items.len() {
            return None;
        }
        let (key, item) = self.items.remove(index);
        self.keys.remove(&key);
        for mapped in self.keys.values_mut() {
            if *mapped > index {
                *mapped -= 1;
            }
        }
        Some((key, item))
    }

    pub fn remove_by_key(&mut self, key: H256) -> Option<(H256, T)> {
        let index = self.find_index(key)?;
        self.delete(index)
    }

    pub fn dequeue(&mut self) -> Option<(H256, T)> {
        if self.items.is_empty() {
            None
        } else {
            self.delete(0)
        }
    }

    /// Removes and returns every item in order.
    pub fn drain(&mut self) -> Vec<(H256, T)> {
        self.keys.clear();
        std::mem::take(&mut self.items)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(H256, T)> {
        self.items.iter()
    }
}

impl<T: Clone> KeyedQueue<T> {
    pub fn to_vec(&self) -> Vec<(H256, T)> {
        self.items.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    #[test]
    fn find_index_by_key() {
        let mut queue = KeyedQueue::new();
        queue.enqueue_tail(key(1), "first");
        queue.enqueue_tail(key(2), "second");

        assert_eq!(queue.find_index(key(2)), Some(1));
        assert_eq!(queue.find_index(key(3)), None);
    }

    #[test]
    fn dequeue_empty_queue() {
        let mut queue = KeyedQueue::<u32>::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_and_dequeue() {
        let mut queue = KeyedQueue::new();
        queue.enqueue_tail(key(1), 1);
        queue.enqueue_tail(key(2), 2);
        queue.enqueue_head(key(3), 3);

        let order: Vec<u32> = queue.to_vec().into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, vec![3, 1, 2]);

        let (k, item) = queue.dequeue().unwrap();
        assert_eq!(k, key(3));
        assert_eq!(item, 3);

        let order: Vec<u32> = queue.to_vec().into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn head_enqueue_keeps_indices_coherent() {
        let mut queue = KeyedQueue::new();
        queue.enqueue_tail(key(1), 1);
        queue.enqueue_tail(key(2), 2);
        queue.enqueue_head(key(3), 3);

        assert_eq!(queue.find_index(key(3)), Some(0));
        assert_eq!(queue.find_index(key(1)), Some(1));
        assert_eq!(queue.find_index(key(2)), Some(2));
    }

    #[test]
    fn delete_shifts_following_indices() {
        let mut queue = KeyedQueue::new();
        queue.enqueue_tail(key(1), 1);
        queue.enqueue_tail(key(2), 2);
        queue.enqueue_tail(key(3), 3);

        let (k, _) = queue.delete(1).unwrap();
        assert_eq!(k, key(2));
        assert_eq!(queue.find_index(key(1)), Some(0));
        assert_eq!(queue.find_index(key(2)), None);
        assert_eq!(queue.find_index(key(3)), Some(1));

        assert!(queue.delete(5).is_none());
    }

    #[test]
    fn remove_by_key() {
        let mut queue = KeyedQueue::new();
        queue.enqueue_tail(key(1), 1);
        queue.enqueue_tail(key(2), 2);

        let (_, item) = queue.remove_by_key(key(1)).unwrap();
        assert_eq!(item, 1);
        assert_eq!(queue.len(), 1);
        assert!(queue.remove_by_key(key(1)).is_none());
    }

    #[test]
    fn drain_empties_queue_in_order() {
        let mut queue = KeyedQueue::new();
        queue.enqueue_tail(key(1), 1);
        queue.enqueue_head(key(2), 2);

        let drained: Vec<u32> = queue.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(drained, vec![2, 1]);
        assert!(queue.is_empty());
        assert_eq!(queue.find_index(key(2)), None);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut queue = KeyedQueue::new();
        queue.enqueue_tail(key(1), 42);
        assert_eq!(queue.peek(0), Some(&42));
        assert_eq!(queue.peek(1), None);
        assert_eq!(queue.len(), 1);
    }
}
