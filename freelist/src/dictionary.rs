//! Size-indexed binary search tree of free chunk lists.
//!
//! Every node is a [`TreeList`] living inside the first chunk of its size
//! class, so the dictionary itself is just a root link and two totals.
//! Sizes are in words.
use std::fmt;

use crate::{
    AdaptiveFreeList, CensusStats, ChunkRef, FreeListPolicy, HeapRegion, ListHeader,
    TREE_CHUNK_WORDS, TreeList,
    stats::{print_census_labels, print_census_row},
};

/// Whether a retrieval may hand out a larger chunk than requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dither {
    Exactly,
    AtLeast,
}

/// How a chunk entering the dictionary came to be, for the census.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkOrigin {
    Returned,
    Split,
    Coalesced,
}

/// Direction of a whole-tree walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug)]
pub struct BinaryTreeDictionary {
    root: Option<TreeList>,
    total_size: usize,
    total_free_blocks: usize,
    policy: Box<dyn FreeListPolicy>,
    verify_dictionary: bool,
}

impl BinaryTreeDictionary {
    pub fn new(policy: Box<dyn FreeListPolicy>) -> Self {
        Self {
            root: None,
            total_size: 0,
            total_free_blocks: 0,
            policy,
            verify_dictionary: false,
        }
    }

    /// A dictionary holding just `chunk`.
    pub fn with_chunk(heap: &mut HeapRegion, chunk: ChunkRef, policy: Box<dyn FreeListPolicy>) -> Self {
        let mut dict = Self::new(policy);
        dict.reset(heap, chunk);
        dict
    }

    /// Smallest chunk the dictionary accepts.
    pub const fn min_size() -> usize {
        TREE_CHUNK_WORDS
    }

    pub fn set_verify_dictionary(&mut self, verify: bool) {
        self.verify_dictionary = verify;
    }

    pub fn policy(&self) -> &dyn FreeListPolicy {
        &*self.policy
    }

    pub fn root(&self) -> Option<TreeList> {
        self.root
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn total_free_blocks(&self) -> usize {
        self.total_free_blocks
    }

    /// Forget every chunk. Their memory is left as is.
    pub fn reset_empty(&mut self) {
        self.root = None;
        self.total_size = 0;
        self.total_free_blocks = 0;
    }

    pub fn reset(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        self.reset_empty();
        let size = chunk.size(heap);
        self.root = Some(TreeList::as_tree_list(heap, chunk));
        self.total_size = size;
        self.total_free_blocks = 1;
    }

    fn verify_if_enabled(&self, heap: &HeapRegion) {
        if self.verify_dictionary {
            self.verify(heap);
        }
    }

    /// Take a chunk of `size` words, or larger under [`Dither::AtLeast`].
    pub fn get_chunk(&mut self, heap: &mut HeapRegion, size: usize, dither: Dither) -> Option<ChunkRef> {
        self.verify_if_enabled(heap);
        let chunk = self.get_chunk_from_tree(heap, size, dither);
        debug_assert!(chunk.is_none_or(|chunk| chunk.is_free(heap)));
        self.verify_if_enabled(heap);
        log::trace!("get_chunk({size}, {dither:?}) -> {chunk:?}");
        chunk
    }

    pub fn return_chunk(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        self.return_chunk_with_origin(heap, chunk, ChunkOrigin::Returned);
    }

    pub fn return_chunk_with_origin(&mut self, heap: &mut HeapRegion, chunk: ChunkRef, origin: ChunkOrigin) {
        self.verify_if_enabled(heap);
        self.insert_chunk_in_tree(heap, chunk);
        let size = chunk.size(heap);
        match origin {
            ChunkOrigin::Returned => {}
            ChunkOrigin::Split => self.dict_census_update(heap, size, true, true),
            ChunkOrigin::Coalesced => self.dict_census_update(heap, size, false, true),
        }
        self.verify_if_enabled(heap);
        log::trace!("return_chunk({chunk}, {size}, {origin:?})");
    }

    /// Pull a specific free chunk out, typically to coalesce it.
    pub fn remove_chunk(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        self.verify_if_enabled(heap);
        self.remove_chunk_from_tree(heap, chunk);
        debug_assert!(chunk.is_free(heap));
        self.verify_if_enabled(heap);
        log::trace!("remove_chunk({chunk})");
    }

    fn insert_chunk_in_tree(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        let size = chunk.size(heap);
        assert!(
            size >= Self::min_size(),
            "{chunk} of {size} words is below the dictionary minimum"
        );
        chunk.link_next(heap, None);
        chunk.link_prev(heap, None);

        let mut parent = None;
        let mut current = self.root;
        while let Some(node) = current {
            let node_size = node.size(heap);
            if node_size == size {
                break;
            }
            parent = Some(node);
            current = if node_size > size {
                node.left(heap)
            } else {
                node.right(heap)
            };
        }

        match current {
            Some(mut list) => list.return_chunk_at_tail(heap, chunk),
            None => {
                let list = TreeList::as_tree_list(heap, chunk);
                match parent {
                    None => self.root = Some(list),
                    Some(parent) if parent.size(heap) < size => parent.set_right(heap, Some(list)),
                    Some(parent) => parent.set_left(heap, Some(list)),
                }
            }
        }
        self.total_size += size;
        self.total_free_blocks += 1;
    }

    fn get_chunk_from_tree(&mut self, heap: &mut HeapRegion, size: usize, dither: Dither) -> Option<ChunkRef> {
        debug_assert!(size >= Self::min_size(), "request of {size} words below minimum");

        let mut prev = self.root;
        let mut current = self.root;
        while let Some(node) = current {
            let node_size = node.size(heap);
            if node_size == size {
                break;
            }
            prev = Some(node);
            current = if node_size < size {
                node.right(heap)
            } else {
                node.left(heap)
            };
        }

        if current.is_none() {
            if dither == Dither::Exactly {
                return None;
            }
            // The nearest ancestor at least as large is the best fit.
            current = prev;
            while let Some(node) = current {
                if node.size(heap) >= size {
                    break;
                }
                current = node.parent(heap);
            }
        }

        let list = current?;
        debug_assert!(!list.is_empty(heap), "empty list in the dictionary");
        let list = match dither {
            Dither::Exactly => list,
            Dither::AtLeast => self.policy.better_list(self, heap, list),
        };
        let chunk = list.first_available(heap)?;
        debug_assert!(chunk.size(heap) >= size);
        self.remove_chunk_from_tree(heap, chunk);
        Some(chunk)
    }

    fn remove_chunk_from_tree(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        debug_assert!(chunk.is_free(heap), "{chunk} is not free");
        let size = chunk.size(heap);
        let list = TreeList::list_of(heap, chunk).expect("chunk is not in the dictionary");
        debug_assert!(
            list.parent(heap)
                .is_none_or(|parent| parent.left(heap) == Some(list) || parent.right(heap) == Some(list)),
            "parent does not point back at {chunk}'s list"
        );

        let replacement = list.remove_chunk_replace_if_needed(heap, chunk);
        if self.root == Some(list) {
            self.root = Some(replacement);
        }

        if replacement.is_empty(heap) {
            let (node, promoted) = match (replacement.left(heap), replacement.right(heap)) {
                (None, right) => (right, None),
                (left, None) => (left, None),
                (Some(_), Some(right)) => {
                    let successor = self.remove_tree_minimum(heap, right);
                    (Some(successor), Some(successor))
                }
            };

            match replacement.parent(heap) {
                None => {
                    self.root = node;
                    if let Some(node) = node {
                        node.clear_parent(heap);
                    }
                }
                Some(parent) if parent.right(heap) == Some(replacement) => parent.set_right(heap, node),
                Some(parent) => {
                    debug_assert_eq!(parent.left(heap), Some(replacement));
                    parent.set_left(heap, node);
                }
            }

            if let Some(successor) = promoted {
                // Read after the minimum was cut out, it may have been our
                // right child.
                successor.set_left(heap, replacement.left(heap));
                successor.set_right(heap, replacement.right(heap));
            }
            replacement.clear_parent(heap);
            replacement.clear_left(heap);
            replacement.clear_right(heap);
        }

        self.total_size -= size;
        self.total_free_blocks -= 1;
    }

    /// Detach the smallest node of `subtree` and return it, childless and
    /// parentless.
    fn remove_tree_minimum(&mut self, heap: &mut HeapRegion, subtree: TreeList) -> TreeList {
        let mut min = subtree;
        while let Some(left) = min.left(heap) {
            min = left;
        }
        let right = min.right(heap);
        match min.parent(heap) {
            Some(parent) if parent.left(heap) == Some(min) => parent.set_left(heap, right),
            Some(parent) => parent.set_right(heap, right),
            None => {
                self.root = right;
                if let Some(right) = right {
                    right.clear_parent(heap);
                }
            }
        }
        min.clear_parent(heap);
        min.clear_right(heap);
        min
    }

    /// The list of exactly `size` words.
    pub fn find_list(&self, heap: &HeapRegion, size: usize) -> Option<TreeList> {
        let mut current = self.root;
        while let Some(node) = current {
            let node_size = node.size(heap);
            if node_size == size {
                return Some(node);
            }
            current = if node_size < size {
                node.right(heap)
            } else {
                node.left(heap)
            };
        }
        None
    }

    pub fn verify_chunk_in_free_list(&self, heap: &HeapRegion, chunk: ChunkRef) -> bool {
        self.find_list(heap, chunk.size(heap))
            .is_some_and(|list| list.verify_chunk_in_free_list(heap, chunk))
    }

    fn largest_list(&self, heap: &HeapRegion) -> Option<TreeList> {
        let mut node = self.root?;
        while let Some(right) = node.right(heap) {
            node = right;
        }
        Some(node)
    }

    /// Highest addressed chunk of the largest size.
    pub fn find_largest_dict(&self, heap: &HeapRegion) -> Option<ChunkRef> {
        self.largest_list(heap)?.largest_address(heap)
    }

    pub fn max_chunk_size(&self, heap: &HeapRegion) -> usize {
        self.largest_list(heap).map_or(0, |list| list.size(heap))
    }

    /// The free chunk whose last word sits right before `word`.
    pub fn find_chunk_ends_at(&self, heap: &HeapRegion, word: usize) -> Option<ChunkRef> {
        self.walk(heap, Order::Ascending)
            .flat_map(|list| list.chunks(heap))
            .find(|chunk| chunk.end(heap) == word)
    }

    pub fn walk<'h>(&self, heap: &'h HeapRegion, order: Order) -> TreeWalk<'h> {
        TreeWalk {
            heap,
            order,
            stack: Vec::new(),
            next: self.root,
        }
    }

    /// Visit every list in `order`. The visitor may change statistics but
    /// not the shape of the tree.
    pub fn apply(&self, heap: &mut HeapRegion, order: Order, mut visit: impl FnMut(&mut HeapRegion, TreeList)) {
        let lists: Vec<TreeList> = self.walk(heap, order).collect();
        for list in lists {
            visit(heap, list);
        }
    }

    pub fn total_count(&self, heap: &HeapRegion) -> usize {
        self.walk(heap, Order::Ascending)
            .map(|list| list.count(heap))
            .sum()
    }

    pub fn sum_of_squared_block_sizes(&self, heap: &HeapRegion) -> f64 {
        self.walk(heap, Order::Ascending)
            .map(|list| {
                let size = list.size(heap) as f64;
                size * size * list.count(heap) as f64
            })
            .sum()
    }

    pub fn total_nodes_in_tree(&self, heap: &HeapRegion) -> usize {
        self.walk(heap, Order::Ascending).count()
    }

    pub fn tree_height(&self, heap: &HeapRegion) -> usize {
        let mut height = 0;
        let mut stack: Vec<(TreeList, usize)> = self.root.into_iter().map(|root| (root, 1)).collect();
        while let Some((node, depth)) = stack.pop() {
            height = height.max(depth);
            stack.extend(node.left(heap).map(|left| (left, depth + 1)));
            stack.extend(node.right(heap).map(|right| (right, depth + 1)));
        }
        height
    }

    /// Length of `list` by walking it.
    pub fn total_list_length(&self, heap: &HeapRegion, list: TreeList) -> usize {
        list.chunks(heap).count()
    }

    pub fn dict_census_update(&self, heap: &mut HeapRegion, size: usize, split: bool, birth: bool) {
        self.policy.census_update(self, heap, size, split, birth);
    }

    pub fn coal_dict_over_populated(&self, heap: &HeapRegion, size: usize) -> bool {
        self.policy.coal_over_populated(self, heap, size)
    }

    pub fn begin_sweep_dict_census(
        &self,
        heap: &mut HeapRegion,
        coal_surplus_percent: f64,
        inter_sweep_current: f32,
        inter_sweep_estimate: f32,
        intra_sweep_estimate: f32,
    ) {
        self.policy.begin_sweep(
            self,
            heap,
            coal_surplus_percent,
            inter_sweep_current,
            inter_sweep_estimate,
            intra_sweep_estimate,
        );
    }

    pub fn end_sweep_dict_census(&self, heap: &mut HeapRegion, split_surplus_percent: f64) {
        self.policy.end_sweep(self, heap, split_surplus_percent);
    }

    /// `surplus = count - desired * split_surplus_percent` for every list.
    pub fn set_tree_surplus(&self, heap: &mut HeapRegion, split_surplus_percent: f64) {
        self.apply(heap, Order::Ascending, |heap, mut list| {
            let wanted = (list.desired(heap) as f64 * split_surplus_percent) as isize;
            let surplus = list.count(heap) as isize - wanted;
            list.set_surplus(heap, surplus);
        });
    }

    /// Point every list at the next larger list with a surplus.
    pub fn set_tree_hints(&self, heap: &mut HeapRegion) {
        let mut hint = 0;
        self.apply(heap, Order::Descending, |heap, mut list| {
            list.set_hint(heap, hint);
            debug_assert!(hint == 0 || hint > list.size(heap), "hints point to larger sizes");
            if list.surplus(heap) > 0 {
                hint = list.size(heap);
            }
        });
    }

    pub fn clear_tree_census(&self, heap: &mut HeapRegion) {
        self.apply(heap, Order::Ascending, |heap, mut list| list.clear_census(heap));
    }

    /// Full consistency check. Panics on the first broken invariant.
    pub fn verify(&self, heap: &HeapRegion) {
        if let Some(root) = self.root {
            assert_eq!(root.parent(heap), None, "root has a parent");
        }

        let mut total_size = 0;
        let mut total_blocks = 0;
        let mut last_size = 0;
        for list in self.walk(heap, Order::Ascending) {
            let size = list.size(heap);
            assert!(size > last_size, "tree out of order: {size} after {last_size}");
            assert!(size >= Self::min_size(), "list of {size} words below minimum");
            last_size = size;

            for child in [list.left(heap), list.right(heap)].into_iter().flatten() {
                assert_eq!(child.parent(heap), Some(list), "child of {size} lost its parent");
            }
            assert!(!list.is_empty(heap), "empty list of {size} words in the tree");
            assert_eq!(list.head(heap), Some(list.embedding()), "list of {size} not on its head");
            list.verify_list(heap);

            for chunk in list.chunks(heap) {
                assert!(chunk.is_free(heap), "{chunk} in the tree is not free");
                assert_eq!(chunk.size(heap), size, "{chunk} in the wrong list");
                assert_eq!(TreeList::list_of(heap, chunk), Some(list), "{chunk} has a stale list");
            }
            total_size += size * list.count(heap);
            total_blocks += list.count(heap);
        }
        assert_eq!(total_size, self.total_size, "total size out of sync");
        assert_eq!(total_blocks, self.total_free_blocks, "free block count out of sync");
    }

    pub fn report_statistics(&self, heap: &HeapRegion, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Statistics for BinaryTreeDictionary:")?;
        writeln!(out, "------------------------------------")?;
        let blocks = self.total_free_blocks;
        writeln!(out, "Total Free Space: {}", self.total_size)?;
        writeln!(out, "Max   Chunk Size: {}", self.max_chunk_size(heap))?;
        writeln!(out, "Number of Blocks: {blocks}")?;
        if blocks > 0 {
            writeln!(out, "Av.  Block  Size: {}", self.total_size / blocks)?;
        }
        writeln!(out, "Tree      Height: {}", self.tree_height(heap))
    }

    pub fn print_dict_census(&self, heap: &HeapRegion, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "BinaryTree")?;
        print_census_labels(out, "size")?;
        let mut total = AdaptiveFreeList::default();
        for list in self.walk(heap, Order::Ascending) {
            print_census_row(heap, &list, out, None)?;
            total.accumulate(heap, &list);
        }
        print_census_labels(out, " ")?;
        print_census_row(heap, &total, out, Some("TOTAL"))?;

        let births = total.split_births(heap) + total.coal_births(heap);
        let deaths = total.split_deaths(heap) + total.coal_deaths(heap);
        let growth = (births - deaths) as f64 / total.prev_sweep(heap).max(1) as f64;
        let desired = total.desired(heap);
        let deficit = (desired - total.count(heap) as isize) as f64 / desired.max(1) as f64;
        writeln!(out, "growth: {growth:8.5}  deficit: {deficit:8.5}")
    }

    pub fn print_free_lists(&self, heap: &HeapRegion, out: &mut dyn fmt::Write) -> fmt::Result {
        for list in self.walk(heap, Order::Descending) {
            write!(out, "size {:>8}: {:>6} chunks", list.size(heap), list.count(heap))?;
            for chunk in list.chunks(heap) {
                write!(out, " {chunk}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

type Step = fn(TreeList, &HeapRegion) -> Option<TreeList>;

/// In-order walk over the lists of a dictionary.
pub struct TreeWalk<'h> {
    heap: &'h HeapRegion,
    order: Order,
    stack: Vec<TreeList>,
    next: Option<TreeList>,
}

impl Iterator for TreeWalk<'_> {
    type Item = TreeList;

    fn next(&mut self) -> Option<TreeList> {
        let (first, second): (Step, Step) = match self.order {
            Order::Ascending => (TreeList::left, TreeList::right),
            Order::Descending => (TreeList::right, TreeList::left),
        };
        while let Some(node) = self.next {
            self.stack.push(node);
            self.next = first(node, self.heap);
        }
        let node = self.stack.pop()?;
        self.next = second(node, self.heap);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{AdaptivePolicy, CurrentCount, PlainPolicy};

    /// Test sizes are given in units so every class clears the minimum.
    const UNIT: usize = 8;

    struct Fixture {
        heap: HeapRegion,
        dict: BinaryTreeDictionary,
        cursor: usize,
    }

    impl Fixture {
        fn with_policy(policy: Box<dyn FreeListPolicy>) -> Self {
            let mut dict = BinaryTreeDictionary::new(policy);
            dict.set_verify_dictionary(true);
            Self {
                heap: HeapRegion::new(1 << 14),
                dict,
                cursor: 1,
            }
        }

        fn plain() -> Self {
            Self::with_policy(Box::new(PlainPolicy))
        }

        fn adaptive() -> Self {
            Self::with_policy(Box::new(AdaptivePolicy::new(Box::new(CurrentCount), false)))
        }

        fn chunk(&mut self, units: usize) -> ChunkRef {
            let size = units * UNIT;
            let chunk = self.heap.format_free(self.cursor, size);
            self.cursor += size;
            chunk
        }

        fn insert(&mut self, units: usize) -> ChunkRef {
            let chunk = self.chunk(units);
            self.dict.return_chunk(&mut self.heap, chunk);
            chunk
        }

        fn get(&mut self, units: usize, dither: Dither) -> Option<ChunkRef> {
            self.dict.get_chunk(&mut self.heap, units * UNIT, dither)
        }

        fn remove(&mut self, chunk: ChunkRef) {
            self.dict.remove_chunk(&mut self.heap, chunk);
        }

        fn list(&self, units: usize) -> Option<TreeList> {
            self.dict.find_list(&self.heap, units * UNIT)
        }

        fn units(&self, list: Option<TreeList>) -> Option<usize> {
            list.map(|list| list.size(&self.heap) / UNIT)
        }
    }

    #[test]
    fn exact_fit_removes_the_emptied_leaf() {
        let mut f = Fixture::plain();
        f.insert(8);
        let small = f.insert(4);
        f.insert(12);

        let root = f.dict.root().unwrap();
        assert_eq!(f.units(Some(root)), Some(8));
        assert_eq!(f.units(root.left(&f.heap)), Some(4));
        assert_eq!(f.units(root.right(&f.heap)), Some(12));

        assert_eq!(f.get(4, Dither::Exactly), Some(small));
        assert_eq!(root.left(&f.heap), None);
        assert_eq!(f.list(4), None);
        assert_eq!(f.dict.total_free_blocks(), 2);
        assert_eq!(f.dict.total_size(), 20 * UNIT);
    }

    #[test]
    fn duplicate_sizes_share_one_node() {
        let mut f = Fixture::plain();
        let first = f.insert(8);
        let second = f.insert(8);

        assert_eq!(f.dict.total_free_blocks(), 2);
        assert_eq!(f.dict.total_nodes_in_tree(&f.heap), 1);
        assert_eq!(f.list(8).unwrap().count(&f.heap), 2);

        f.remove(second);
        let list = f.list(8).expect("node stays while chunks remain");
        assert_eq!(list.count(&f.heap), 1);
        assert_eq!(list.embedding(), first);
        assert_eq!(f.dict.total_size(), 8 * UNIT);
    }

    #[test]
    fn best_fit_backtracks_to_smallest_larger_class() {
        let mut f = Fixture::plain();
        f.insert(8);
        f.insert(4);
        f.insert(12);
        let ten = f.insert(10);

        assert_eq!(f.get(9, Dither::AtLeast), Some(ten));
        assert_eq!(f.list(10), None);
        assert_eq!(f.get(9, Dither::Exactly), None);
        assert_eq!(f.get(13, Dither::AtLeast), None);
        let twelve = f.get(11, Dither::AtLeast).unwrap();
        assert_eq!(twelve.size(&f.heap), 12 * UNIT);
    }

    #[test]
    fn misses_leave_the_dictionary_alone() {
        let mut f = Fixture::plain();
        f.insert(8);
        f.insert(4);

        assert_eq!(f.get(6, Dither::Exactly), None);
        assert_eq!(f.get(9, Dither::AtLeast), None);
        assert_eq!(f.dict.total_free_blocks(), 2);
        assert_eq!(f.dict.total_size(), 12 * UNIT);
    }

    #[test]
    fn round_trip_returns_the_same_chunk() {
        let mut f = Fixture::plain();
        let chunk = f.insert(5);
        assert_eq!(f.get(5, Dither::Exactly), Some(chunk));
        assert_eq!(f.dict.root(), None);
        assert_eq!(f.dict.total_size(), 0);
        assert!(chunk.is_free(&f.heap), "still formatted until the caller takes it");
    }

    #[test]
    fn node_chunk_is_handed_out_last() {
        let mut f = Fixture::plain();
        let a = f.insert(6);
        let b = f.insert(6);
        let c = f.insert(6);

        assert_eq!(f.get(6, Dither::Exactly), Some(b));
        assert_eq!(f.get(6, Dither::Exactly), Some(c));
        assert_eq!(f.get(6, Dither::Exactly), Some(a));
        assert_eq!(f.get(6, Dither::Exactly), None);
    }

    #[test]
    fn removing_root_head_moves_the_root() {
        let mut f = Fixture::plain();
        let head = f.insert(8);
        let next = f.insert(8);
        f.insert(8);
        f.insert(4);
        f.insert(12);

        f.remove(head);

        let root = f.dict.root().unwrap();
        assert_eq!(root.embedding(), next);
        assert_eq!(f.units(root.left(&f.heap)), Some(4));
        assert_eq!(f.units(root.right(&f.heap)), Some(12));
        assert_eq!(root.left(&f.heap).unwrap().parent(&f.heap), Some(root));
        assert!(!f.dict.verify_chunk_in_free_list(&f.heap, head));
        assert!(f.dict.verify_chunk_in_free_list(&f.heap, next));
    }

    #[test]
    fn two_child_delete_promotes_successor() {
        let mut f = Fixture::plain();
        let root = f.insert(8);
        f.insert(4);
        f.insert(12);
        f.insert(10);
        f.insert(14);
        f.insert(11);

        f.remove(root);

        let root = f.dict.root().unwrap();
        assert_eq!(f.units(Some(root)), Some(10));
        assert_eq!(root.parent(&f.heap), None);
        assert_eq!(f.units(root.left(&f.heap)), Some(4));
        let twelve = root.right(&f.heap).unwrap();
        assert_eq!(f.units(Some(twelve)), Some(12));
        assert_eq!(f.units(twelve.left(&f.heap)), Some(11), "successor's right child moved up");
        assert_eq!(twelve.left(&f.heap).unwrap().parent(&f.heap), Some(twelve));
    }

    #[test]
    fn two_child_delete_with_direct_right_successor() {
        let mut f = Fixture::plain();
        f.insert(8);
        f.insert(4);
        let twelve = f.insert(12);
        f.insert(14);
        f.insert(2 + 4);

        let eight = f.list(8).unwrap().embedding();
        f.remove(eight);

        let root = f.dict.root().unwrap();
        assert_eq!(root.embedding(), twelve);
        assert_eq!(f.units(root.left(&f.heap)), Some(4));
        assert_eq!(f.units(root.right(&f.heap)), Some(14));
        assert_eq!(root.right(&f.heap).unwrap().parent(&f.heap), Some(root));
        assert_eq!(f.dict.tree_height(&f.heap), 3);
    }

    #[test]
    fn inner_delete_splices_single_child() {
        let mut f = Fixture::plain();
        f.insert(8);
        f.insert(4);
        let twelve = f.insert(12);
        f.insert(10);

        f.remove(twelve);

        let root = f.dict.root().unwrap();
        let ten = root.right(&f.heap).unwrap();
        assert_eq!(f.units(Some(ten)), Some(10));
        assert_eq!(ten.parent(&f.heap), Some(root));
    }

    #[test]
    fn deleting_the_root_with_one_child() {
        let mut f = Fixture::plain();
        let root = f.insert(8);
        f.insert(12);
        f.insert(10);

        f.remove(root);

        let root = f.dict.root().unwrap();
        assert_eq!(f.units(Some(root)), Some(12));
        assert_eq!(root.parent(&f.heap), None);
    }

    #[test]
    fn census_cycle_rolls_counts_forward() {
        let mut f = Fixture::adaptive();
        for units in [8, 8, 4, 12, 12, 12] {
            f.insert(units);
        }

        f.dict.begin_sweep_dict_census(&mut f.heap, 1.0, 1.0, 1.0, 1.0);
        let taken = f.get(12, Dither::Exactly).unwrap();
        f.dict.dict_census_update(&mut f.heap, 12 * UNIT, true, false);
        let split = f.chunk(4);
        f.dict.return_chunk_with_origin(&mut f.heap, split, ChunkOrigin::Split);
        let merged = f.chunk(8);
        f.dict.return_chunk_with_origin(&mut f.heap, merged, ChunkOrigin::Coalesced);
        assert_eq!(f.list(4).unwrap().split_births(&f.heap), 1);
        assert_eq!(f.list(8).unwrap().coal_births(&f.heap), 1);
        f.dict.end_sweep_dict_census(&mut f.heap, 1.0);

        let counts = [(4, 2), (8, 3), (12, 2)];
        for (units, count) in counts {
            let list = f.list(units).unwrap();
            assert_eq!(list.prev_sweep(&f.heap), count);
            assert_eq!(list.coal_births(&f.heap), 0);
            assert_eq!(list.coal_deaths(&f.heap), 0);
            assert_eq!(list.split_births(&f.heap), 0);
            assert_eq!(list.split_deaths(&f.heap), 0);
        }

        f.dict.begin_sweep_dict_census(&mut f.heap, 1.0, 1.0, 1.0, 1.0);
        f.dict.return_chunk(&mut f.heap, taken);
        f.dict.end_sweep_dict_census(&mut f.heap, 1.0);
        assert_eq!(f.list(12).unwrap().prev_sweep(&f.heap), 3);
        assert_eq!(f.list(4).unwrap().prev_sweep(&f.heap), 2);
    }

    #[test]
    fn stale_hint_is_dropped() {
        let mut f = Fixture::adaptive();
        f.insert(4);
        f.insert(4);
        f.insert(6);
        let mut small = f.list(4).unwrap();
        small.set_hint(&mut f.heap, 20 * UNIT);

        let chunk = f.get(4, Dither::AtLeast).unwrap();

        assert_eq!(chunk.size(&f.heap), 4 * UNIT);
        assert_eq!(f.list(4).unwrap().hint(&f.heap), 0);
    }

    #[test]
    fn hint_redirects_to_surplus() {
        let mut f = Fixture::adaptive();
        f.insert(4);
        f.insert(4);
        for _ in 0..3 {
            f.insert(12);
        }
        let mut large = f.list(12).unwrap();
        large.set_surplus(&mut f.heap, 2);
        let mut small = f.list(4).unwrap();
        small.set_hint(&mut f.heap, 12 * UNIT);

        let chunk = f.get(4, Dither::AtLeast).unwrap();

        assert_eq!(chunk.size(&f.heap), 12 * UNIT);
        assert_eq!(f.list(4).unwrap().count(&f.heap), 2);
        assert_eq!(f.list(4).unwrap().hint(&f.heap), 12 * UNIT);

        small.set_surplus(&mut f.heap, 1);
        assert_eq!(f.get(4, Dither::AtLeast).unwrap().size(&f.heap), 4 * UNIT);
    }

    #[test]
    fn exact_requests_ignore_hints() {
        let mut f = Fixture::adaptive();
        let wanted = f.insert(4);
        for _ in 0..3 {
            f.insert(5);
        }
        let mut large = f.list(5).unwrap();
        large.set_surplus(&mut f.heap, 2);
        let mut small = f.list(4).unwrap();
        small.set_hint(&mut f.heap, 5 * UNIT);

        assert_eq!(f.get(4, Dither::Exactly), Some(wanted));
        assert_eq!(f.list(4), None);
        assert_eq!(f.list(5).unwrap().count(&f.heap), 3);
    }

    #[test]
    fn largest_and_adjacent_lookups() {
        let mut f = Fixture::plain();
        assert_eq!(f.dict.find_largest_dict(&f.heap), None);
        assert_eq!(f.dict.max_chunk_size(&f.heap), 0);

        let a = f.insert(9);
        f.insert(4);
        let b = f.insert(9);

        assert_eq!(f.dict.max_chunk_size(&f.heap), 9 * UNIT);
        assert_eq!(f.dict.find_largest_dict(&f.heap), Some(b));
        assert_eq!(f.dict.find_chunk_ends_at(&f.heap, a.end(&f.heap)), Some(a));
        assert_eq!(f.dict.find_chunk_ends_at(&f.heap, a.end(&f.heap) + 1), None);
    }

    #[test]
    fn aggregates_match_contents() {
        let mut f = Fixture::plain();
        for units in [8, 4, 12, 4, 5] {
            f.insert(units);
        }
        let fours = f.list(4).unwrap();

        assert_eq!(f.dict.total_count(&f.heap), 5);
        assert_eq!(f.dict.total_nodes_in_tree(&f.heap), 4);
        assert_eq!(f.dict.tree_height(&f.heap), 3);
        assert_eq!(f.dict.total_list_length(&f.heap, fours), 2);
        let expected: usize = [8, 4, 12, 4, 5].iter().map(|u| (u * UNIT) * (u * UNIT)).sum();
        assert_eq!(f.dict.sum_of_squared_block_sizes(&f.heap), expected as f64);

        let descending: Vec<_> = f.dict.walk(&f.heap, Order::Descending).map(|l| l.size(&f.heap) / UNIT).collect();
        assert_eq!(descending, vec![12, 8, 5, 4]);
    }

    #[test]
    fn reset_seeds_or_empties() {
        let mut f = Fixture::plain();
        f.insert(4);
        let seed = f.chunk(30);

        f.dict.reset(&mut f.heap, seed);
        assert_eq!(f.dict.total_free_blocks(), 1);
        assert_eq!(f.dict.total_size(), 30 * UNIT);
        assert_eq!(f.dict.root().map(TreeList::embedding), Some(seed));
        f.dict.verify(&f.heap);

        f.dict.reset_empty();
        assert_eq!(f.dict.root(), None);
        assert_eq!(f.dict.total_size(), 0);
    }

    #[test]
    fn printers_cover_every_class() {
        let mut f = Fixture::adaptive();
        for units in [8, 4, 12, 12] {
            f.insert(units);
        }

        let mut census = String::new();
        f.dict.print_dict_census(&f.heap, &mut census).unwrap();
        assert!(census.contains("TOTAL"));
        assert!(census.contains("growth"));
        assert!(census.contains(&format!("{}", 12 * UNIT)));

        let mut lists = String::new();
        f.dict.print_free_lists(&f.heap, &mut lists).unwrap();
        let first = lists.lines().next().unwrap();
        assert!(first.contains(&format!("{}", 12 * UNIT)) && first.contains("2 chunks"));

        let mut report = String::new();
        f.dict.report_statistics(&f.heap, &mut report).unwrap();
        assert!(report.contains(&format!("Total Free Space: {}", 36 * UNIT)));
        assert!(report.contains("Number of Blocks: 4"));
    }

    #[test]
    #[should_panic(expected = "below the dictionary minimum")]
    fn tiny_chunks_are_rejected() {
        let mut f = Fixture::plain();
        let chunk = f.heap.format_free(1, BinaryTreeDictionary::min_size() - 1);
        f.dict.return_chunk(&mut f.heap, chunk);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize),
        Get(usize, bool),
        Remove(usize),
    }

    const CLASSES: [usize; 6] = [22, 23, 30, 41, 64, 100];
    const CHUNKS: usize = 48;

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..CHUNKS).prop_map(Op::Insert),
            (0..CLASSES.len(), any::<bool>()).prop_map(|(class, exact)| Op::Get(class, exact)),
            (0..CHUNKS).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn random_operations_keep_the_tree_consistent(ops in prop::collection::vec(op(), 1..200)) {
            let mut heap = HeapRegion::new(1 << 13);
            let mut dict = BinaryTreeDictionary::new(Box::new(PlainPolicy));
            let mut word = 1;
            let mut chunks = Vec::with_capacity(CHUNKS);
            for i in 0..CHUNKS {
                let size = CLASSES[i % CLASSES.len()];
                chunks.push(heap.format_free(word, size));
                word += size;
            }
            let mut held = vec![false; CHUNKS];

            for op in ops {
                match op {
                    Op::Insert(i) if !held[i] => {
                        heap.format_free(chunks[i].word(), CLASSES[i % CLASSES.len()]);
                        dict.return_chunk(&mut heap, chunks[i]);
                        held[i] = true;
                    }
                    Op::Remove(i) if held[i] => {
                        dict.remove_chunk(&mut heap, chunks[i]);
                        held[i] = false;
                    }
                    Op::Get(class, exact) => {
                        let size = CLASSES[class];
                        let best = (0..CHUNKS)
                            .filter(|&i| held[i])
                            .map(|i| CLASSES[i % CLASSES.len()])
                            .filter(|&s| if exact { s == size } else { s >= size })
                            .min();
                        let dither = if exact { Dither::Exactly } else { Dither::AtLeast };
                        let got = dict.get_chunk(&mut heap, size, dither);
                        prop_assert_eq!(got.map(|c| c.size(&heap)), best);
                        if let Some(chunk) = got {
                            let i = chunks.iter().position(|&c| c == chunk).unwrap();
                            prop_assert!(held[i]);
                            held[i] = false;
                        }
                    }
                    _ => {}
                }
                dict.verify(&heap);
                let expected: usize = (0..CHUNKS)
                    .filter(|&i| held[i])
                    .map(|i| CLASSES[i % CLASSES.len()])
                    .sum();
                prop_assert_eq!(dict.total_size(), expected);
                prop_assert_eq!(dict.total_free_blocks(), held.iter().filter(|&&h| h).count());
            }
        }
    }
}
