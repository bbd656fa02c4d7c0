use std::borrow::Borrow;
use std::fmt;

use crate::base;

/// A lock-free concurrent ordered set.
///
/// Any number of threads may call [`insert`], [`remove`], [`contains`], and
/// [`is_empty`] at the same time through a shared reference. All operations
/// are linearizable and resolve contention by retrying internally; none of
/// them ever blocks.
///
/// [`insert`]: SkipSet::insert
/// [`remove`]: SkipSet::remove
/// [`contains`]: SkipSet::contains
/// [`is_empty`]: SkipSet::is_empty
pub struct SkipSet<T> {
    inner: base::SkipList<T>,
}

impl<T> SkipSet<T> {
    /// Returns a new, empty set.
    pub fn new() -> SkipSet<T> {
        SkipSet {
            inner: base::SkipList::new(),
        }
    }
}

impl<T> SkipSet<T>
where
    T: Ord + Send + 'static,
{
    /// Returns `true` if the set is empty.
    ///
    /// Under concurrent mutation the answer is a snapshot that may be stale
    /// by the time it is returned.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Adds a value to the set.
    ///
    /// Returns `true` if the value was newly inserted and `false` if an
    /// equal value was already present.
    pub fn insert(&self, value: T) -> bool {
        self.inner.insert(value)
    }

    /// Removes a value from the set.
    ///
    /// Returns `true` only for the call that actually removed the value;
    /// concurrent removals of the same value yield exactly one `true`.
    pub fn remove<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.inner.remove(value)
    }

    /// Returns `true` if the set contains a value equal to `value`.
    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.inner.contains(value)
    }
}

impl<T> Default for SkipSet<T> {
    fn default() -> SkipSet<T> {
        SkipSet::new()
    }
}

impl<T> fmt::Debug for SkipSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SkipSet").finish()
    }
}

impl<T> FromIterator<T> for SkipSet<T>
where
    T: Ord + Send + 'static,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> SkipSet<T> {
        let s = SkipSet::new();
        for value in iter {
            s.insert(value);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        let s: SkipSet<u64> = SkipSet::default();
        assert!(s.is_empty());
    }

    #[test]
    fn from_iter_deduplicates() {
        let s: SkipSet<i32> = [3, 1, 2, 3, 1].into_iter().collect();

        assert!(s.contains(&1));
        assert!(s.contains(&2));
        assert!(s.contains(&3));
        assert!(!s.contains(&4));

        // Only one copy of each value made it in.
        assert!(s.remove(&3));
        assert!(!s.remove(&3));
    }

    #[test]
    fn set_contract() {
        let s = SkipSet::new();
        assert!(s.is_empty());

        assert!(s.insert(5));
        assert!(!s.is_empty());
        assert!(s.contains(&5));
        assert!(!s.insert(5));

        assert!(s.remove(&5));
        assert!(!s.contains(&5));
        assert!(!s.remove(&5));
        assert!(s.is_empty());
    }
}
