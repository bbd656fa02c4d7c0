use std::alloc::{self, Layout};
use std::borrow::Borrow;
use std::cmp;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Relaxed, SeqCst};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};
use crossbeam_utils::CachePadded;
use scopeguard::defer_on_unwind;

const MAX_HEIGHT: usize = 32;
const HEIGHT_BITS: usize = 5;
const HEIGHT_MASK: usize = (1 << HEIGHT_BITS) - 1;

/// A skip list node.
///
/// The mark bit of every `next` pointer lives in the pointer's tag: a slot
/// with tag 1 means the node is logically deleted at that level, and the
/// reference half of the slot is frozen from then on (every CAS that changes
/// the reference expects tag 0).
///
/// This struct is marked with `repr(C)` so that the specific order of fields
/// can be enforced. It is important that the tower is the last field since it
/// is dynamically sized.
#[repr(C)]
pub struct Node<T> {
    /// The value, which is also the comparison key.
    value: T,

    /// Keeps the number of levels this node is linked at and the height of
    /// its tower.
    refs_and_height: AtomicUsize,

    /// The tower of atomic next pointers. Zero-sized here; the real tower is
    /// allocated right past the struct and reached through raw pointer
    /// arithmetic, never by indexing this array.
    pointers: [Atomic<Node<T>>; 0],
}

impl<T> Node<T> {
    /// Returns the layout of a node with a tower of `height` pointers.
    fn layout(height: usize) -> Layout {
        assert!(1 <= height && height <= MAX_HEIGHT);

        let tower = Layout::array::<Atomic<Self>>(height).unwrap();
        Layout::new::<Self>().extend(tower).unwrap().0.pad_to_align()
    }

    /// Allocates a node with a tower of `height` null pointers.
    ///
    /// The link counter starts at zero and the value is left uninitialized,
    /// which is why this function is unsafe.
    unsafe fn alloc(height: usize) -> *mut Self {
        let layout = Self::layout(height);
        let ptr = alloc::alloc(layout) as *mut Self;
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }

        ptr::write(&mut (*ptr).refs_and_height, AtomicUsize::new(height - 1));
        ptr::write_bytes((*ptr).pointers.as_mut_ptr(), 0, height);
        ptr
    }

    /// Deallocates a node without running any destructors.
    unsafe fn dealloc(ptr: *mut Self) {
        let height = (*ptr).height();
        alloc::dealloc(ptr as *mut u8, Self::layout(height));
    }

    /// Returns the height of this node's tower.
    #[inline]
    fn height(&self) -> usize {
        (self.refs_and_height.load(Relaxed) & HEIGHT_MASK) + 1
    }

    /// Returns the next pointer at the given level of the tower.
    #[inline]
    unsafe fn next(&self, level: usize) -> &Atomic<Self> {
        &*self.pointers.as_ptr().add(level)
    }

    /// Marks all levels of the tower and reports whether this call performed
    /// the level-0 transition.
    ///
    /// Marking goes from the top level down so that the node stays fully
    /// linked and traversable until the single level-0 `fetch_or`, at which
    /// point the value atomically leaves the set.
    fn mark_tower(&self) -> bool {
        let height = self.height();

        for level in (0..height).rev() {
            let next = unsafe { self.next(level).fetch_or(1, SeqCst, epoch::unprotected()) };

            if level == 0 && next.tag() == 1 {
                return false;
            }
        }

        true
    }

    /// Returns `true` if the node is logically deleted.
    fn is_removed(&self) -> bool {
        unsafe { self.next(0).load(SeqCst, epoch::unprotected()).tag() == 1 }
    }
}

impl<T: Send + 'static> Node<T> {
    /// Decrements the link counter of a node, scheduling it for destruction
    /// if the counter becomes zero.
    ///
    /// If the passed `ptr` is null, this function simply returns.
    #[inline]
    unsafe fn decrement(ptr: *const Self) {
        if let Some(node) = ptr.as_ref() {
            if node.refs_and_height.fetch_sub(1 << HEIGHT_BITS, AcqRel) >> HEIGHT_BITS == 1 {
                Self::finalize(ptr);
            }
        }
    }

    /// Defers destruction of a node that is unlinked at every level.
    #[cold]
    unsafe fn finalize(ptr: *const Self) {
        let ptr = ptr as *mut Self;

        // The value is also the comparison key, so a pinned traversal may
        // still be reading it. Both the drop and the deallocation have to
        // wait until all currently pinned threads get unpinned.
        epoch::pin().defer_unchecked(move || {
            ptr::drop_in_place(&mut (*ptr).value);
            Node::dealloc(ptr);
        });
    }
}

/// A lock-free skip list holding a set of values.
///
/// Values are kept sorted in a multi-level linked list. Level 0 holds every
/// value; each higher level is an express lane over the one below it. Removal
/// first marks the victim at every level (logical deletion) and any later
/// search splices marked nodes out (physical deletion), so traversals never
/// block and never observe a broken chain.
pub struct SkipList<T> {
    head: *const Node<T>, // !Send + !Sync
    seed: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send + Sync> Send for SkipList<T> {}
unsafe impl<T: Send + Sync> Sync for SkipList<T> {}

impl<T> SkipList<T> {
    /// Returns a new, empty skip list.
    pub fn new() -> SkipList<T> {
        SkipList {
            head: unsafe { Node::alloc(MAX_HEIGHT) },
            seed: CachePadded::new(AtomicUsize::new(1)),
        }
    }
}

impl<T> SkipList<T>
where
    T: Ord + Send + 'static,
{
    /// Returns `true` if the skip list holds no live values.
    ///
    /// This is a read-only walk over level 0 that skips marked nodes. It does
    /// not unlink anything and does not restart on contention; the answer is
    /// inherently transient under concurrent mutation.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();

        unsafe {
            let mut curr = (*self.head).next(0).load(SeqCst, guard);

            while let Some(c) = curr.as_ref() {
                let succ = c.next(0).load(SeqCst, guard);

                if succ.tag() == 0 {
                    return false;
                }

                curr = succ.with_tag(0);
            }

            true
        }
    }

    /// Generates a random tower height and returns it.
    fn random_height(&self) -> usize {
        // From "Xorshift RNGs" by George Marsaglia. The position of the
        // lowest set bit gives P(height = k) = 2^-k.
        let mut num = self.seed.load(Relaxed);
        num ^= num << 13;
        num ^= num >> 17;
        num ^= num << 5;
        self.seed.store(num, Relaxed);

        cmp::min(num.trailing_zeros() as usize + 1, MAX_HEIGHT)
    }

    /// Walks every level from top to bottom and returns the tight bounds
    /// around `value` at each of them.
    ///
    /// Any node found with a marked next pointer is spliced out along the
    /// way, so the hot path of every operation doubles as the physical
    /// deleter. A failed splice, or a predecessor that turns out to be marked
    /// itself, restarts the whole search from the top level.
    fn search<'g, Q>(&self, value: &Q, guard: &'g Guard) -> Bounds<'g, T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        unsafe {
            'search: loop {
                let head = &*self.head;
                let mut bounds = Bounds {
                    found: false,
                    left: [head; MAX_HEIGHT],
                    right: [Shared::null(); MAX_HEIGHT],
                };

                // Levels above the tallest tower trivially bound every value
                // between the head and the tail.
                let mut level = MAX_HEIGHT;
                while level >= 1 && head.next(level - 1).load(SeqCst, guard).is_null() {
                    level -= 1;
                }

                // The node we descend from, level by level.
                let mut node = head;

                while level >= 1 {
                    level -= 1;

                    let mut pred = node;
                    let mut curr = pred.next(level).load(SeqCst, guard);

                    // If `curr` is marked, `pred` is deleted and nothing on
                    // this path can be trusted. Restart.
                    if curr.tag() == 1 {
                        continue 'search;
                    }

                    while let Some(c) = curr.as_ref() {
                        let succ = c.next(level).load(SeqCst, guard);

                        if succ.tag() == 1 {
                            // `c` is logically deleted. Try unlinking it at
                            // this level before stepping over it.
                            match pred.next(level).compare_exchange(
                                curr,
                                succ.with_tag(0),
                                SeqCst,
                                SeqCst,
                                guard,
                            ) {
                                Ok(_) => {
                                    Node::decrement(curr.as_raw());
                                    curr = succ.with_tag(0);
                                    continue;
                                }
                                Err(_) => continue 'search,
                            }
                        }

                        if c.value.borrow() >= value {
                            break;
                        }

                        // Move one step forward.
                        pred = c;
                        curr = succ;
                    }

                    bounds.left[level] = pred;
                    bounds.right[level] = curr;

                    node = pred;
                }

                bounds.found = bounds.right[0]
                    .as_ref()
                    .map_or(false, |r| r.value.borrow() == value);

                return bounds;
            }
        }
    }

    /// Inserts a value into the skip list.
    ///
    /// Returns `true` if the value was newly inserted and `false` if an equal
    /// value was already present. Insertion takes effect at the moment the
    /// new node is linked into level 0.
    pub fn insert(&self, value: T) -> bool {
        let guard = &epoch::pin();

        unsafe {
            let mut bounds;

            loop {
                bounds = self.search(&value, guard);

                if !bounds.found {
                    break;
                }

                // An equal node that is already marked is logically absent.
                // Reporting a duplicate of a value that is gone would not
                // linearize, so search again until the view is clean.
                if !bounds.right[0].deref().is_removed() {
                    return false;
                }
            }

            let height = self.random_height();

            let (node, n) = {
                let n = Node::<T>::alloc(height);

                ptr::write(&mut (*n).value, value);

                // Two references: one for the level-0 link and one held by
                // this thread while the tower is built.
                (*n).refs_and_height.fetch_add(2 << HEIGHT_BITS, Relaxed);

                (Shared::<Node<T>>::from(n as *const _), &*n)
            };

            loop {
                // Set the lowest successor of `n` to `bounds.right[0]`.
                n.next(0).store(bounds.right[0], SeqCst);

                // Try linking the new node into level 0.
                if bounds.left[0]
                    .next(0)
                    .compare_exchange(bounds.right[0], node, SeqCst, SeqCst, guard)
                    .is_ok()
                {
                    break;
                }

                // Lost the race. Search again until the view is clean.
                loop {
                    bounds = {
                        // The `Ord` impl may panic during the search; free
                        // the unpublished node if it does.
                        defer_on_unwind! {{
                            ptr::drop_in_place(&n.value as *const T as *mut T);
                            Node::dealloc(node.as_raw() as *mut Node<T>);
                        }}
                        self.search(&n.value, guard)
                    };

                    if !bounds.found {
                        break;
                    }

                    if !bounds.right[0].deref().is_removed() {
                        // Someone else inserted the value first. Discard the
                        // new node and report the duplicate.
                        let raw = node.as_raw() as *mut Node<T>;
                        ptr::drop_in_place(&mut (*raw).value);
                        Node::dealloc(raw);
                        return false;
                    }
                }
            }

            // The node is in the set. Link in the express lanes above level 0.
            'build: for level in 1..height {
                loop {
                    let pred = bounds.left[level];
                    let succ = bounds.right[level];

                    let next = n.next(level).load(SeqCst, guard);

                    // If our own slot at this level is marked, a concurrent
                    // remove has already begun. Extending the tower of a
                    // logically removed node is pointless.
                    if next.tag() == 1 {
                        break 'build;
                    }

                    // A successor with an equal value can only be a marked
                    // leftover observed at a higher level. Linking to it
                    // would put two equal values in one chain; search again
                    // so it gets unlinked first.
                    if succ.as_ref().map_or(false, |s| s.value == n.value) {
                        bounds = self.search(&n.value, guard);
                        continue;
                    }

                    // Point our own slot at the successor. Failure means the
                    // slot got marked; stop building.
                    if n.next(level)
                        .compare_exchange(next, succ, SeqCst, SeqCst, guard)
                        .is_err()
                    {
                        break 'build;
                    }

                    // Account for the link about to be created.
                    n.refs_and_height.fetch_add(1 << HEIGHT_BITS, Relaxed);

                    // Try installing the node at this level.
                    if pred
                        .next(level)
                        .compare_exchange(succ, node, SeqCst, SeqCst, guard)
                        .is_ok()
                    {
                        break;
                    }

                    // Installation failed; undo the accounting and retry this
                    // level with fresher bounds.
                    n.refs_and_height.fetch_sub(1 << HEIGHT_BITS, Relaxed);

                    bounds = self.search(&n.value, guard);
                }
            }

            // A concurrent remove may have marked the node while the tower
            // was going up, possibly right after one of the installs above.
            // The trailing search unlinks whatever is marked on the path to
            // the value, including stale predecessors.
            self.search(&n.value, guard);

            Node::decrement(n);
            true
        }
    }

    /// Removes a value from the skip list.
    ///
    /// Returns `true` iff this call is the one that logically removed the
    /// value, i.e. it won the race to mark level 0.
    pub fn remove<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = &epoch::pin();

        let bounds = self.search(value, guard);
        if !bounds.found {
            return false;
        }

        let node = unsafe { bounds.right[0].deref() };
        let removed = node.mark_tower();

        // Physically unlink the node.
        self.search(value, guard);

        removed
    }

    /// Returns `true` if the skip list contains a value equal to `value`.
    ///
    /// The traversal may splice out marked nodes it passes, so the query is
    /// read-only in effect but not in implementation.
    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = &epoch::pin();
        self.search(value, guard).found
    }
}

impl<T> Drop for SkipList<T> {
    fn drop(&mut self) {
        let mut node = self.head as *mut Node<T>;

        while !node.is_null() {
            unsafe {
                if node as *const _ != self.head {
                    ptr::drop_in_place(&mut (*node).value);
                }

                let next = (*node)
                    .next(0)
                    .load(Relaxed, epoch::unprotected())
                    .with_tag(0);
                Node::dealloc(node);
                node = next.as_raw() as *mut Node<T>;
            }
        }
    }
}

/// A search result.
///
/// For every level, `left` is the last reachable node with a smaller value
/// and `right` is the first one with an equal or greater value; null stands
/// for the tail. Both are observed unmarked and physically adjacent at the
/// time the level is recorded.
struct Bounds<'g, T> {
    /// This flag is `true` if `right[0]` holds the searched value.
    found: bool,

    /// Adjacent nodes with smaller values.
    left: [&'g Node<T>; MAX_HEIGHT],

    /// Adjacent nodes with equal or greater values.
    right: [Shared<'g, Node<T>>; MAX_HEIGHT],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new() {
        SkipList::<i32>::new();
        SkipList::<String>::new();
    }

    #[test]
    fn is_empty() {
        let s = SkipList::new();
        assert!(s.is_empty());

        s.insert(1);
        assert!(!s.is_empty());
        s.insert(2);
        s.insert(3);
        assert!(!s.is_empty());

        s.remove(&2);
        assert!(!s.is_empty());

        s.remove(&1);
        assert!(!s.is_empty());

        s.remove(&3);
        assert!(s.is_empty());
    }

    #[test]
    fn insert() {
        let insert = [0, 4, 2, 12, 8, 7, 11, 5];
        let not_present = [1, 3, 6, 9, 10];
        let s = SkipList::new();

        for &elt in &insert {
            assert!(s.insert(elt));
            assert!(s.contains(&elt));
        }

        for &elt in &insert {
            assert!(!s.insert(elt));
        }

        for elt in &not_present {
            assert!(!s.contains(elt));
        }
    }

    #[test]
    fn remove() {
        let insert = [0, 4, 2, 12, 8, 7, 11, 5];
        let not_present = [1, 3, 6, 9, 10];
        let remove = [2, 12, 8];

        let s = SkipList::new();

        for &elt in &insert {
            s.insert(elt);
        }

        for elt in &not_present {
            assert!(!s.remove(elt));
        }

        for elt in &remove {
            assert!(s.remove(elt));
            assert!(!s.remove(elt));
            assert!(!s.contains(elt));
        }

        for elt in &insert {
            s.remove(elt);
        }

        assert!(s.is_empty());
    }

    #[test]
    fn insert_remove_cycle() {
        let s = SkipList::new();
        assert!(s.is_empty());

        assert!(s.insert(5));
        assert!(!s.is_empty());
        assert!(s.contains(&5));

        assert!(!s.insert(5));

        assert!(s.remove(&5));
        assert!(!s.contains(&5));
        assert!(!s.remove(&5));
        assert!(s.is_empty());

        // A removed value can come back.
        assert!(s.insert(5));
        assert!(s.contains(&5));
    }

    #[test]
    fn ordered_lookups() {
        let s = SkipList::new();
        s.insert(3);
        s.insert(1);
        s.insert(2);

        assert!(s.contains(&1));
        assert!(s.contains(&2));
        assert!(s.contains(&3));
        assert!(!s.contains(&4));
    }

    #[test]
    fn borrowed_lookups() {
        let s = SkipList::new();
        s.insert("alpha".to_string());
        s.insert("beta".to_string());

        assert!(s.contains("alpha"));
        assert!(s.remove("alpha"));
        assert!(!s.contains("alpha"));
        assert!(s.contains("beta"));
    }

    #[test]
    fn towers_above_level_zero() {
        // Enough values that many nodes get towers well above level 0, so
        // both the head's full-height scan and the per-level links past the
        // end of the struct are exercised.
        let s = SkipList::new();

        for i in 0..1000 {
            assert!(s.insert(i));
        }
        for i in 0..1000 {
            assert!(s.contains(&i));
        }

        for i in (0..1000).step_by(2) {
            assert!(s.remove(&i));
        }
        for i in 0..1000 {
            assert_eq!(s.contains(&i), i % 2 == 1);
        }
    }

    #[test]
    fn high_alignment_values() {
        #[derive(PartialEq, Eq, PartialOrd, Ord)]
        #[repr(align(16))]
        struct Wide(u64);

        let s = SkipList::new();
        assert!(s.insert(Wide(5)));
        assert!(s.insert(Wide(9)));
        assert!(s.contains(&Wide(5)));
        assert!(s.remove(&Wide(5)));
        assert!(!s.contains(&Wide(5)));
        assert!(s.contains(&Wide(9)));

        let u = SkipList::new();
        assert!(u.insert(5u128));
        assert!(u.insert(u128::MAX));
        assert!(u.remove(&5));
        assert!(!u.contains(&5));
        assert!(u.contains(&u128::MAX));
    }

    #[test]
    fn drops_remaining_values() {
        let s = SkipList::new();
        for i in 0..100 {
            s.insert(format!("value-{}", i));
        }
        for i in 0..50 {
            s.remove(&format!("value-{}", i));
        }
        // The rest is freed by `Drop`.
    }
}
