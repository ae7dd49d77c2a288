use crate::{ChunkRef, HeapRegion};

/// Storage of a size-class list header.
///
/// The list mechanics are provided methods so the same code runs against
/// an off-heap [`FreeList`] and against a list embedded in a tree chunk.
/// Every member of a list has the list's size. Mutators expect the caller
/// to hold the freelist lock.
pub trait ListHeader {
    fn size(&self, heap: &HeapRegion) -> usize;
    fn set_size(&mut self, heap: &mut HeapRegion, size: usize);
    fn head(&self, heap: &HeapRegion) -> Option<ChunkRef>;
    fn set_head(&mut self, heap: &mut HeapRegion, head: Option<ChunkRef>);
    fn tail(&self, heap: &HeapRegion) -> Option<ChunkRef>;
    fn set_tail(&mut self, heap: &mut HeapRegion, tail: Option<ChunkRef>);
    fn count(&self, heap: &HeapRegion) -> usize;
    fn set_count(&mut self, heap: &mut HeapRegion, count: usize);

    #[inline]
    fn is_empty(&self, heap: &HeapRegion) -> bool {
        self.count(heap) == 0
    }

    #[inline]
    fn increment_count(&mut self, heap: &mut HeapRegion) {
        let count = self.count(heap);
        self.set_count(heap, count + 1);
    }

    #[inline]
    fn decrement_count(&mut self, heap: &mut HeapRegion) {
        let count = self.count(heap);
        debug_assert!(count > 0, "list count underflow");
        self.set_count(heap, count - 1);
    }

    /// Set the head and clear its prev link.
    fn link_head(&mut self, heap: &mut HeapRegion, head: Option<ChunkRef>) {
        self.set_head(heap, head);
        if let Some(head) = head {
            head.link_prev(heap, None);
        }
    }

    /// Set the tail and clear its next link.
    fn link_tail(&mut self, heap: &mut HeapRegion, tail: Option<ChunkRef>) {
        self.set_tail(heap, tail);
        if let Some(tail) = tail {
            tail.link_next(heap, None);
        }
    }

    fn return_chunk_at_head(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        self.assert_proper_list(heap);
        debug_assert_eq!(chunk.size(heap), self.size(heap), "wrong size list");
        debug_assert_ne!(self.head(heap), Some(chunk), "double insertion");

        let old = self.head(heap);
        chunk.link_after(heap, old);
        self.link_head(heap, Some(chunk));
        if old.is_none() {
            self.link_tail(heap, Some(chunk));
        }
        self.increment_count(heap);
        self.assert_proper_list(heap);
    }

    fn return_chunk_at_tail(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        self.assert_proper_list(heap);
        debug_assert_eq!(chunk.size(heap), self.size(heap), "wrong size list");
        debug_assert_ne!(self.tail(heap), Some(chunk), "double insertion");

        match self.tail(heap) {
            Some(tail) => tail.link_after(heap, Some(chunk)),
            None => self.link_head(heap, Some(chunk)),
        }
        self.link_tail(heap, Some(chunk));
        self.increment_count(heap);
        self.assert_proper_list(heap);
    }

    /// Detach the first chunk, `None` when the list is empty.
    fn get_chunk_at_head(&mut self, heap: &mut HeapRegion) -> Option<ChunkRef> {
        self.assert_proper_list(heap);
        let head = self.head(heap)?;
        let next = head.next(heap);
        self.link_head(heap, next);
        if next.is_none() {
            self.set_tail(heap, None);
        }
        head.link_next(heap, None);
        head.link_prev(heap, None);
        self.decrement_count(heap);
        self.assert_proper_list(heap);
        Some(head)
    }

    /// Unlink an arbitrary member.
    fn remove_chunk(&mut self, heap: &mut HeapRegion, chunk: ChunkRef) {
        self.assert_proper_list(heap);
        debug_assert_eq!(chunk.size(heap), self.size(heap), "wrong size list");
        debug_assert!(!self.is_empty(heap), "remove from empty list");

        let prev = chunk.prev(heap);
        let next = chunk.next(heap);
        match prev {
            Some(prev) => prev.link_after(heap, next),
            None => self.link_head(heap, next),
        }
        if next.is_none() {
            self.set_tail(heap, prev);
        }
        chunk.link_next(heap, None);
        chunk.link_prev(heap, None);
        self.decrement_count(heap);
        self.assert_proper_list(heap);
    }

    /// Move the first `n` chunks into the empty list `dst`.
    fn get_first_n_chunks_from_list<L: ListHeader>(
        &mut self,
        heap: &mut HeapRegion,
        n: usize,
        dst: &mut L,
    ) {
        debug_assert!(dst.is_empty(heap), "destination must be empty");
        debug_assert_eq!(dst.size(heap), self.size(heap), "wrong size list");
        let Some(first) = self.head(heap) else {
            return;
        };
        if n == 0 {
            return;
        }

        let mut last = first;
        let mut taken = 1;
        while taken < n {
            match last.next(heap) {
                Some(next) => {
                    last = next;
                    taken += 1;
                }
                None => break,
            }
        }

        let rest = last.next(heap);
        self.link_head(heap, rest);
        if rest.is_none() {
            self.set_tail(heap, None);
        }
        let count = self.count(heap);
        self.set_count(heap, count - taken);

        dst.set_head(heap, Some(first));
        dst.link_tail(heap, Some(last));
        dst.set_count(heap, taken);
        self.assert_proper_list(heap);
        dst.assert_proper_list(heap);
    }

    /// Splice all of `other` in front of this list, leaving `other` empty.
    fn prepend<L: ListHeader>(&mut self, heap: &mut HeapRegion, other: &mut L) {
        debug_assert_eq!(other.size(heap), self.size(heap), "wrong size list");
        let (Some(other_head), Some(other_tail)) = (other.head(heap), other.tail(heap))
        else {
            return;
        };

        match self.head(heap) {
            None => {
                self.set_head(heap, Some(other_head));
                self.set_tail(heap, Some(other_tail));
                self.set_count(heap, other.count(heap));
            }
            Some(head) => {
                other_tail.link_after(heap, Some(head));
                self.set_head(heap, Some(other_head));
                let count = self.count(heap) + other.count(heap);
                self.set_count(heap, count);
            }
        }
        other.set_head(heap, None);
        other.set_tail(heap, None);
        other.set_count(heap, 0);
        self.assert_proper_list(heap);
    }

    fn chunks<'h>(&self, heap: &'h HeapRegion) -> ListChunks<'h> {
        ListChunks {
            heap,
            next: self.head(heap),
        }
    }

    fn verify_chunk_in_free_list(&self, heap: &HeapRegion, chunk: ChunkRef) -> bool {
        self.chunks(heap).any(|member| member == chunk)
    }

    /// Cheap structural checks, debug builds only.
    #[inline]
    fn assert_proper_list(&self, heap: &HeapRegion) {
        #[cfg(debug_assertions)]
        {
            let count = self.count(heap);
            let head = self.head(heap);
            let tail = self.tail(heap);
            debug_assert_eq!(head.is_none(), count == 0, "head and count disagree");
            debug_assert_eq!(tail.is_none(), count == 0, "tail and count disagree");
            debug_assert!(
                head.is_none_or(|head| head.prev(heap).is_none()),
                "list head has a prev link"
            );
            debug_assert!(
                tail.is_none_or(|tail| tail.next(heap).is_none()),
                "list tail has a next link"
            );
            debug_assert!(
                self.chunks(heap).take(count + 1).count() == count,
                "list chain does not match count"
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = heap;
    }

    /// Full walk. Panics on any inconsistency.
    fn verify_list(&self, heap: &HeapRegion) {
        let size = self.size(heap);
        let count = self.count(heap);
        let mut prev = None;
        let mut seen = 0;
        for chunk in self.chunks(heap).take(count + 1) {
            assert_eq!(chunk.size(heap), size, "{chunk} in wrong size list");
            assert!(chunk.is_free(heap), "{chunk} on free list not marked free");
            assert_eq!(chunk.prev(heap), prev, "{chunk} has a broken prev link");
            prev = Some(chunk);
            seen += 1;
        }
        assert_eq!(seen, count, "list of size {size} miscounted");
        assert_eq!(self.tail(heap), prev, "list of size {size} has a stale tail");
    }
}

/// Walks a list from head to tail.
pub struct ListChunks<'h> {
    heap: &'h HeapRegion,
    next: Option<ChunkRef>,
}

impl Iterator for ListChunks<'_> {
    type Item = ChunkRef;

    fn next(&mut self) -> Option<ChunkRef> {
        let current = self.next?;
        self.next = current.next(self.heap);
        Some(current)
    }
}

/// A size-class list whose header lives outside the heap.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeList {
    size: usize,
    head: Option<ChunkRef>,
    tail: Option<ChunkRef>,
    count: usize,
}

impl FreeList {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    pub fn reset(&mut self, size: usize) {
        *self = Self::new(size);
    }

    /// Adjust the count of a list used purely as a tally.
    pub(crate) fn set_len(&mut self, count: usize) {
        self.count = count;
    }
}

impl ListHeader for FreeList {
    fn size(&self, _: &HeapRegion) -> usize {
        self.size
    }
    fn set_size(&mut self, _: &mut HeapRegion, size: usize) {
        self.size = size;
    }
    fn head(&self, _: &HeapRegion) -> Option<ChunkRef> {
        self.head
    }
    fn set_head(&mut self, _: &mut HeapRegion, head: Option<ChunkRef>) {
        self.head = head;
    }
    fn tail(&self, _: &HeapRegion) -> Option<ChunkRef> {
        self.tail
    }
    fn set_tail(&mut self, _: &mut HeapRegion, tail: Option<ChunkRef>) {
        self.tail = tail;
    }
    fn count(&self, _: &HeapRegion) -> usize {
        self.count
    }
    fn set_count(&mut self, _: &mut HeapRegion, count: usize) {
        self.count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 8;

    fn carve(heap: &mut HeapRegion, n: usize) -> Vec<ChunkRef> {
        (0..n)
            .map(|i| heap.format_free(1 + i * SIZE, SIZE))
            .collect()
    }

    fn members(list: &FreeList, heap: &HeapRegion) -> Vec<ChunkRef> {
        list.chunks(heap).collect()
    }

    #[test]
    fn head_and_tail_insertion_order() {
        let mut heap = HeapRegion::new(512);
        let c = carve(&mut heap, 3);
        let mut list = FreeList::new(SIZE);

        list.return_chunk_at_tail(&mut heap, c[1]);
        list.return_chunk_at_head(&mut heap, c[0]);
        list.return_chunk_at_tail(&mut heap, c[2]);

        assert_eq!(members(&list, &heap), c);
        assert_eq!(list.count(&heap), 3);
        assert_eq!(list.head(&heap), Some(c[0]));
        assert_eq!(list.tail(&heap), Some(c[2]));
        list.verify_list(&heap);
    }

    #[test]
    fn get_chunk_at_head_drains_fifo() {
        let mut heap = HeapRegion::new(512);
        let c = carve(&mut heap, 2);
        let mut list = FreeList::new(SIZE);
        for &chunk in &c {
            list.return_chunk_at_tail(&mut heap, chunk);
        }

        assert_eq!(list.get_chunk_at_head(&mut heap), Some(c[0]));
        assert_eq!(c[0].next(&heap), None);
        assert_eq!(list.get_chunk_at_head(&mut heap), Some(c[1]));
        assert_eq!(list.get_chunk_at_head(&mut heap), None);
        assert!(list.is_empty(&heap));
        assert_eq!(list.tail(&heap), None);
    }

    #[test]
    fn remove_interior_head_and_tail() {
        let mut heap = HeapRegion::new(512);
        let c = carve(&mut heap, 5);
        let mut list = FreeList::new(SIZE);
        for &chunk in &c {
            list.return_chunk_at_tail(&mut heap, chunk);
        }

        list.remove_chunk(&mut heap, c[2]);
        assert_eq!(members(&list, &heap), vec![c[0], c[1], c[3], c[4]]);
        list.remove_chunk(&mut heap, c[0]);
        assert_eq!(list.head(&heap), Some(c[1]));
        list.remove_chunk(&mut heap, c[4]);
        assert_eq!(list.tail(&heap), Some(c[3]));
        assert_eq!(list.count(&heap), 2);
        assert!(!list.verify_chunk_in_free_list(&heap, c[2]));
        assert!(list.verify_chunk_in_free_list(&heap, c[3]));
        assert!(c[2].is_free(&heap), "removal does not change free status");
        list.verify_list(&heap);
    }

    #[test]
    fn first_n_chunks_move_to_empty_list() {
        let mut heap = HeapRegion::new(512);
        let c = carve(&mut heap, 5);
        let mut list = FreeList::new(SIZE);
        for &chunk in &c {
            list.return_chunk_at_tail(&mut heap, chunk);
        }

        let mut taken = FreeList::new(SIZE);
        list.get_first_n_chunks_from_list(&mut heap, 3, &mut taken);

        assert_eq!(members(&taken, &heap), c[..3].to_vec());
        assert_eq!(taken.count(&heap), 3);
        assert_eq!(members(&list, &heap), c[3..].to_vec());
        assert_eq!(list.count(&heap), 2);
        taken.verify_list(&heap);
        list.verify_list(&heap);

        let mut rest = FreeList::new(SIZE);
        list.get_first_n_chunks_from_list(&mut heap, 10, &mut rest);
        assert_eq!(rest.count(&heap), 2);
        assert!(list.is_empty(&heap));
        assert_eq!(list.tail(&heap), None);
    }

    #[test]
    fn prepend_absorbs_other_list() {
        let mut heap = HeapRegion::new(512);
        let c = carve(&mut heap, 4);
        let mut front = FreeList::new(SIZE);
        let mut back = FreeList::new(SIZE);
        front.return_chunk_at_tail(&mut heap, c[0]);
        front.return_chunk_at_tail(&mut heap, c[1]);
        back.return_chunk_at_tail(&mut heap, c[2]);
        back.return_chunk_at_tail(&mut heap, c[3]);

        back.prepend(&mut heap, &mut front);

        assert_eq!(members(&back, &heap), c);
        assert_eq!(back.count(&heap), 4);
        assert!(front.is_empty(&heap));
        assert_eq!(front.head(&heap), None);
        back.verify_list(&heap);

        let mut empty = FreeList::new(SIZE);
        empty.prepend(&mut heap, &mut back);
        assert_eq!(members(&empty, &heap), c);
        assert!(back.is_empty(&heap));
    }
}
