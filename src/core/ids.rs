//! Wire id allocation and random document ids.

use rand::Rng;

/// Monotonic string ids for subscriptions, methods, and pings.
#[derive(Debug)]
pub struct IdAllocator {
    next: std::sync::atomic::AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        self.next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .to_string()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Alphabet without lookalike characters (no 0/O, 1/I/l).
const UNMISTAKABLE: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

pub const DOCUMENT_ID_LEN: usize = 17;

/// Random `_id` for optimistic inserts, in the server's own id style.
pub fn random_document_id() -> String {
    let mut rng = rand::rng();
    (0..DOCUMENT_ID_LEN)
        .map(|_| {
            let index = rng.random_range(0..UNMISTAKABLE.len());
            UNMISTAKABLE[index] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_monotonic() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
        assert_eq!(ids.next_id(), "3");
    }

    #[test]
    fn document_ids_are_well_formed() {
        let id = random_document_id();
        assert_eq!(id.len(), DOCUMENT_ID_LEN);
        assert!(id.bytes().all(|b| UNMISTAKABLE.contains(&b)));
    }

    #[test]
    fn document_ids_are_distinct() {
        let a = random_document_id();
        let b = random_document_id();
        assert_ne!(a, b);
    }
}
