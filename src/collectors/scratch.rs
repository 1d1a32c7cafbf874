//! Grow-only scratch list for session enumeration.

use std::collections::TryReserveError;

/// A vector that is cleared between uses but never shrinks.
///
/// The backend refills it in place, so as long as the session count stays
/// within the largest count seen so far no allocation happens.
#[derive(Debug)]
pub struct Scratch<T> {
    items: Vec<T>,
}

impl<T> Default for Scratch<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Scratch<T> {
    /// Empties the list and makes room for `count` items.
    ///
    /// # Errors
    ///
    /// Returns the allocation failure if growing was necessary and failed.
    pub fn ensure(&mut self, count: usize) -> Result<&mut Vec<T>, TryReserveError> {
        self.items.clear();
        if count > self.items.capacity() {
            self.items.try_reserve_exact(count)?;
        }
        Ok(&mut self.items)
    }

    /// Allocated slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_on_demand() {
        let mut scratch: Scratch<u32> = Scratch::default();
        assert_eq!(scratch.capacity(), 0);

        scratch.ensure(4).unwrap();
        assert!(scratch.capacity() >= 4);
    }

    #[test]
    fn test_never_shrinks() {
        let mut scratch: Scratch<u32> = Scratch::default();
        scratch.ensure(8).unwrap().extend(0..8);
        let cap = scratch.capacity();

        let list = scratch.ensure(2).unwrap();
        assert!(list.is_empty(), "ensure must clear");
        assert_eq!(scratch.capacity(), cap);
    }

    #[test]
    fn test_reuse_does_not_reallocate() {
        let mut scratch: Scratch<u64> = Scratch::default();
        let first = scratch.ensure(16).unwrap().as_ptr();
        let second = scratch.ensure(10).unwrap().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn test_impossible_size_fails() {
        let mut scratch: Scratch<u64> = Scratch::default();
        assert!(scratch.ensure(usize::MAX).is_err());
        assert!(scratch.ensure(1).is_ok(), "a failed reserve leaves the list usable");
    }
}
