//! Size-class lists that double as binary tree nodes.
//!
//! The first chunk of every list in the dictionary carries the list header
//! and the tree links right behind its free chunk header:
//!
//! ```text
//! word 3:      owning list (on every chunk of the list)
//! word 4..11:  head, tail, count, size, parent, left, right
//! word 11..22: statistics, see [`Stat`]
//! ```
//!
//! When that first chunk leaves the list while others remain, the whole
//! header moves to the next chunk.
use crate::{CensusStats, ChunkRef, FREE_CHUNK_WORDS, HeapRegion, ListHeader, Stat};

pub const LIST_WORD: usize = FREE_CHUNK_WORDS;

const EMBEDDED: usize = LIST_WORD + 1;
const HEAD: usize = EMBEDDED;
const TAIL: usize = EMBEDDED + 1;
const COUNT: usize = EMBEDDED + 2;
const SIZE: usize = EMBEDDED + 3;
const PARENT: usize = EMBEDDED + 4;
const LEFT: usize = EMBEDDED + 5;
const RIGHT: usize = EMBEDDED + 6;
const STATS: usize = EMBEDDED + 7;

/// Smallest chunk that can carry an embedded list.
pub const TREE_CHUNK_WORDS: usize = STATS + Stat::COUNT;

/// A size-class list embedded in its first chunk.
///
/// Structural changes to a list in the tree go through
/// [`crate::BinaryTreeDictionary`], which keeps the node role on the head.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TreeList(ChunkRef);

impl TreeList {
    /// Make `chunk` the only member and tree node of a new list.
    pub fn as_tree_list(heap: &mut HeapRegion, chunk: ChunkRef) -> TreeList {
        let size = chunk.size(heap);
        assert!(size >= TREE_CHUNK_WORDS, "{chunk} too small for a tree node");

        let mut list = TreeList(chunk);
        chunk.link_next(heap, None);
        chunk.link_prev(heap, None);
        list.set_head(heap, Some(chunk));
        list.set_tail(heap, Some(chunk));
        list.set_count(heap, 1);
        list.set_size(heap, size);
        list.clear_parent(heap);
        list.clear_left(heap);
        list.clear_right(heap);
        list.init_statistics(heap);
        Self::set_list(heap, chunk, Some(list));
        list
    }

    /// The chunk holding this header.
    #[inline]
    pub fn embedding(self) -> ChunkRef {
        self.0
    }

    #[inline]
    fn load(self, heap: &HeapRegion, offset: usize) -> usize {
        heap.word(self.0.field(offset))
    }

    #[inline]
    fn store(self, heap: &mut HeapRegion, offset: usize, value: usize) {
        heap.set_word(self.0.field(offset), value);
    }

    #[inline]
    fn load_node(self, heap: &HeapRegion, offset: usize) -> Option<TreeList> {
        ChunkRef::decode(self.load(heap, offset)).map(TreeList)
    }

    #[inline]
    fn store_node(self, heap: &mut HeapRegion, offset: usize, node: Option<TreeList>) {
        self.store(heap, offset, ChunkRef::encode(node.map(TreeList::embedding)));
    }

    /// List a chunk in the dictionary belongs to.
    #[inline]
    pub fn list_of(heap: &HeapRegion, chunk: ChunkRef) -> Option<TreeList> {
        ChunkRef::decode(heap.word(chunk.field(LIST_WORD))).map(TreeList)
    }

    #[inline]
    pub(crate) fn set_list(heap: &mut HeapRegion, chunk: ChunkRef, list: Option<TreeList>) {
        heap.set_word(chunk.field(LIST_WORD), ChunkRef::encode(list.map(TreeList::embedding)));
    }

    pub fn parent(self, heap: &HeapRegion) -> Option<TreeList> {
        self.load_node(heap, PARENT)
    }

    pub fn left(self, heap: &HeapRegion) -> Option<TreeList> {
        self.load_node(heap, LEFT)
    }

    pub fn right(self, heap: &HeapRegion) -> Option<TreeList> {
        self.load_node(heap, RIGHT)
    }

    pub fn set_parent(self, heap: &mut HeapRegion, parent: Option<TreeList>) {
        self.store_node(heap, PARENT, parent);
    }

    /// Set the left child and point its parent link back here.
    pub fn set_left(self, heap: &mut HeapRegion, left: Option<TreeList>) {
        self.store_node(heap, LEFT, left);
        if let Some(left) = left {
            left.set_parent(heap, Some(self));
        }
    }

    pub fn set_right(self, heap: &mut HeapRegion, right: Option<TreeList>) {
        self.store_node(heap, RIGHT, right);
        if let Some(right) = right {
            right.set_parent(heap, Some(self));
        }
    }

    pub fn clear_parent(self, heap: &mut HeapRegion) {
        self.store_node(heap, PARENT, None);
    }

    pub fn clear_left(self, heap: &mut HeapRegion) {
        self.store_node(heap, LEFT, None);
    }

    pub fn clear_right(self, heap: &mut HeapRegion) {
        self.store_node(heap, RIGHT, None);
    }

    /// Chunk handed out next. The head is only given away when it is the
    /// last one, since it carries the node.
    pub fn first_available(self, heap: &HeapRegion) -> Option<ChunkRef> {
        let head = self.head(heap)?;
        Some(head.next(heap).unwrap_or(head))
    }

    pub fn largest_address(self, heap: &HeapRegion) -> Option<ChunkRef> {
        self.chunks(heap).max()
    }

    fn copy_embedded_to(self, heap: &mut HeapRegion, dst: TreeList) {
        for offset in EMBEDDED..TREE_CHUNK_WORDS {
            let value = self.load(heap, offset);
            dst.store(heap, offset, value);
        }
    }

    /// Unlink `chunk` from this list. If it was the head and others remain,
    /// the header and tree links move to the new head, which is returned.
    /// Otherwise `self` is returned.
    pub fn remove_chunk_replace_if_needed(
        self,
        heap: &mut HeapRegion,
        chunk: ChunkRef,
    ) -> TreeList {
        debug_assert_eq!(
            TreeList::list_of(heap, chunk),
            Some(self),
            "{chunk} is not on this list"
        );
        let mut replacement = self;
        let prev = chunk.prev(heap);
        let next = chunk.next(heap);

        if self.head(heap) == Some(chunk) {
            match next {
                None => {
                    debug_assert!(prev.is_none(), "head has a prev link");
                    replacement.set_head(heap, None);
                    replacement.set_tail(heap, None);
                }
                Some(next) => {
                    replacement = TreeList(next);
                    self.copy_embedded_to(heap, replacement);

                    let mut member = Some(next);
                    while let Some(current) = member {
                        Self::set_list(heap, current, Some(replacement));
                        member = current.next(heap);
                    }

                    if let Some(parent) = replacement.parent(heap) {
                        if parent.left(heap) == Some(self) {
                            parent.set_left(heap, Some(replacement));
                        } else {
                            debug_assert_eq!(parent.right(heap), Some(self));
                            parent.set_right(heap, Some(replacement));
                        }
                    }
                    if let Some(right) = replacement.right(heap) {
                        right.set_parent(heap, Some(replacement));
                    }
                    if let Some(left) = replacement.left(heap) {
                        left.set_parent(heap, Some(replacement));
                    }
                    replacement.link_head(heap, Some(next));
                }
            }
        } else {
            if next.is_none() {
                replacement.link_tail(heap, prev);
            }
            if let Some(prev) = prev {
                prev.link_after(heap, next);
            }
        }

        Self::set_list(heap, chunk, None);
        chunk.link_next(heap, None);
        chunk.link_prev(heap, None);
        replacement.decrement_count(heap);
        replacement
    }
}

impl ListHeader for TreeList {
    fn size(&self, heap: &HeapRegion) -> usize {
        self.load(heap, SIZE)
    }
    fn set_size(&mut self, heap: &mut HeapRegion, size: usize) {
        self.store(heap, SIZE, size);
    }
    fn head(&self, heap: &HeapRegion) -> Option<ChunkRef> {
        ChunkRef::decode(self.load(heap, HEAD))
    }
    fn set_head(&mut self, heap: &mut HeapRegion, head: Option<ChunkRef>) {
        self.store(heap, HEAD, ChunkRef::encode(head));
    }
    fn tail(&self, heap: &HeapRegion) -> Option<ChunkRef> {
        ChunkRef::decode(self.load(heap, TAIL))
    }
    fn set_tail(&mut self, heap: &mut HeapRegion, tail: Option<ChunkRef>) {
        self.store(heap, TAIL, ChunkRef::encode(tail));
    }
    fn count(&self, heap: &HeapRegion) -> usize {
        self.load(heap, COUNT)
    }
    fn set_count(&mut self, heap: &mut HeapRegion, count: usize) {
        self.store(heap, COUNT, count);
    }

    fn return_chunk_at_tail(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        debug_assert_eq!(chunk.size(heap), self.size(heap), "wrong size list");
        debug_assert!(!self.is_empty(heap), "tree lists are never empty");

        match self.tail(heap) {
            Some(tail) => tail.link_after(heap, Some(chunk)),
            None => self.link_head(heap, Some(chunk)),
        }
        self.link_tail(heap, Some(chunk));
        Self::set_list(heap, chunk, Some(*self));
        self.increment_count(heap);
        self.assert_proper_list(heap);
    }

    /// Inserts right behind the head, which has to stay in place.
    fn return_chunk_at_head(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        debug_assert_eq!(chunk.size(heap), self.size(heap), "wrong size list");
        debug_assert!(!self.is_empty(heap), "tree lists are never empty");

        let Some(head) = self.head(heap) else {
            self.link_head(heap, Some(chunk));
            self.link_tail(heap, Some(chunk));
            Self::set_list(heap, chunk, Some(*self));
            self.increment_count(heap);
            return;
        };
        let second = head.next(heap);
        chunk.link_after(heap, second);
        if second.is_none() {
            self.link_tail(heap, Some(chunk));
        }
        head.link_after(heap, Some(chunk));
        Self::set_list(heap, chunk, Some(*self));
        self.increment_count(heap);
        self.assert_proper_list(heap);
    }

    /// Unlinks a member behind the head. The head carries the node and goes
    /// through [`TreeList::remove_chunk_replace_if_needed`].
    fn remove_chunk(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        assert_ne!(chunk, self.embedding(), "{chunk} carries the tree node");
        let same = self.remove_chunk_replace_if_needed(heap, chunk);
        debug_assert_eq!(same, *self);
        self.assert_proper_list(heap);
    }

    fn get_chunk_at_head(&mut self, _heap: &mut HeapRegion) -> Option<ChunkRef> {
        unreachable!("the head of a tree list carries the node")
    }

    fn get_first_n_chunks_from_list<L: ListHeader>(
        &mut self,
        _heap: &mut HeapRegion,
        _n: usize,
        _dst: &mut L,
    ) {
        unreachable!("the head of a tree list carries the node")
    }

    fn prepend<L: ListHeader>(&mut self, _heap: &mut HeapRegion, _other: &mut L) {
        unreachable!("tree list members point back at their node")
    }
}

impl CensusStats for TreeList {
    fn stat(&self, heap: &HeapRegion, stat: Stat) -> isize {
        self.load(heap, STATS + stat as usize) as isize
    }
    fn set_stat(&mut self, heap: &mut HeapRegion, stat: Stat, value: isize) {
        self.store(heap, STATS + stat as usize, value as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = TREE_CHUNK_WORDS + 2;

    fn carve(heap: &mut HeapRegion, base: usize, size: usize, n: usize) -> Vec<ChunkRef> {
        (0..n)
            .map(|i| heap.format_free(base + i * size, size))
            .collect()
    }

    fn list_with(heap: &mut HeapRegion, chunks: &[ChunkRef]) -> TreeList {
        let mut list = TreeList::as_tree_list(heap, chunks[0]);
        for &chunk in &chunks[1..] {
            list.return_chunk_at_tail(heap, chunk);
        }
        list
    }

    #[test]
    fn plain_removal_clears_the_back_reference() {
        let mut heap = HeapRegion::new(1024);
        let c = carve(&mut heap, 1, SIZE, 3);
        let mut list = list_with(&mut heap, &c);

        list.remove_chunk(&mut heap, c[1]);

        assert_eq!(list.count(&heap), 2);
        assert_eq!(TreeList::list_of(&heap, c[1]), None);
        assert_eq!(list.chunks(&heap).collect::<Vec<_>>(), vec![c[0], c[2]]);
        assert_eq!(TreeList::list_of(&heap, c[2]), Some(list));
    }

    #[test]
    #[should_panic(expected = "carries the tree node")]
    fn plain_removal_refuses_the_node_chunk() {
        let mut heap = HeapRegion::new(1024);
        let c = carve(&mut heap, 1, SIZE, 2);
        let mut list = list_with(&mut heap, &c);
        list.remove_chunk(&mut heap, c[0]);
    }

    #[test]
    #[should_panic(expected = "carries the node")]
    fn head_detach_is_refused() {
        let mut heap = HeapRegion::new(1024);
        let c = carve(&mut heap, 1, SIZE, 2);
        let mut list = list_with(&mut heap, &c);
        list.get_chunk_at_head(&mut heap);
    }

    #[test]
    fn new_node_is_a_single_chunk_list() {
        let mut heap = HeapRegion::new(1024);
        let chunk = heap.format_free(1, SIZE);
        let list = TreeList::as_tree_list(&mut heap, chunk);

        assert_eq!(list.embedding(), chunk);
        assert_eq!(list.head(&heap), Some(chunk));
        assert_eq!(list.tail(&heap), Some(chunk));
        assert_eq!(list.count(&heap), 1);
        assert_eq!(list.size(&heap), SIZE);
        assert_eq!(list.parent(&heap), None);
        assert_eq!(TreeList::list_of(&heap, chunk), Some(list));
        assert_eq!(list.first_available(&heap), Some(chunk));
        assert_eq!(list.surplus(&heap), 0);
    }

    #[test]
    fn head_insert_keeps_node_in_front() {
        let mut heap = HeapRegion::new(1024);
        let c = carve(&mut heap, 1, SIZE, 3);
        let mut list = TreeList::as_tree_list(&mut heap, c[0]);

        list.return_chunk_at_head(&mut heap, c[1]);
        list.return_chunk_at_head(&mut heap, c[2]);

        let order: Vec<_> = list.chunks(&heap).collect();
        assert_eq!(order, vec![c[0], c[2], c[1]]);
        assert_eq!(list.tail(&heap), Some(c[1]));
        assert_eq!(list.first_available(&heap), Some(c[2]));
        assert!(c.iter().all(|&chunk| TreeList::list_of(&heap, chunk) == Some(list)));
        list.verify_list(&heap);
    }

    #[test]
    fn removing_the_node_chunk_moves_the_header() {
        let mut heap = HeapRegion::new(2048);
        let c = carve(&mut heap, 1, SIZE, 3);
        let kids = carve(&mut heap, 1 + 3 * SIZE, SIZE + 4, 1);
        let parents = carve(&mut heap, 1 + 4 * SIZE + 4, SIZE + 8, 1);

        let mut list = list_with(&mut heap, &c);
        let right_kid = TreeList::as_tree_list(&mut heap, kids[0]);
        let parent = TreeList::as_tree_list(&mut heap, parents[0]);
        parent.set_left(&mut heap, Some(list));
        list.set_right(&mut heap, Some(right_kid));
        list.set_desired(&mut heap, 7);

        let replacement = list.remove_chunk_replace_if_needed(&mut heap, c[0]);

        assert_eq!(replacement.embedding(), c[1]);
        assert_eq!(replacement.count(&heap), 2);
        assert_eq!(replacement.head(&heap), Some(c[1]));
        assert_eq!(replacement.tail(&heap), Some(c[2]));
        assert_eq!(replacement.desired(&heap), 7, "statistics travel along");
        assert_eq!(parent.left(&heap), Some(replacement));
        assert_eq!(replacement.parent(&heap), Some(parent));
        assert_eq!(replacement.right(&heap), Some(right_kid));
        assert_eq!(right_kid.parent(&heap), Some(replacement));
        assert_eq!(TreeList::list_of(&heap, c[2]), Some(replacement));
        assert_eq!(TreeList::list_of(&heap, c[0]), None);
        assert_eq!(c[0].next(&heap), None);
        assert!(c[0].is_free(&heap));
        replacement.verify_list(&heap);
    }

    #[test]
    fn removing_interior_and_tail_keeps_the_node() {
        let mut heap = HeapRegion::new(1024);
        let c = carve(&mut heap, 1, SIZE, 4);
        let list = list_with(&mut heap, &c);

        assert_eq!(list.remove_chunk_replace_if_needed(&mut heap, c[3]), list);
        assert_eq!(list.tail(&heap), Some(c[2]));
        assert_eq!(list.remove_chunk_replace_if_needed(&mut heap, c[1]), list);
        assert_eq!(list.chunks(&heap).collect::<Vec<_>>(), vec![c[0], c[2]]);
        assert_eq!(list.count(&heap), 2);
        list.verify_list(&heap);
    }

    #[test]
    fn removing_the_last_chunk_empties_the_list() {
        let mut heap = HeapRegion::new(1024);
        let chunk = heap.format_free(1, SIZE);
        let list = TreeList::as_tree_list(&mut heap, chunk);

        let after = list.remove_chunk_replace_if_needed(&mut heap, chunk);

        assert_eq!(after, list);
        assert!(after.is_empty(&heap));
        assert_eq!(after.head(&heap), None);
        assert_eq!(after.tail(&heap), None);
    }
}
