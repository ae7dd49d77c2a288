//! Free chunk header.
//!
//! A free chunk describes itself with words written at its own start:
//!
//! ```text
//! word 0: size in words
//! word 1: prev link | tag bits
//! word 2: next link
//! ```
//!
//! Links are byte offsets into the [`HeapRegion`], word aligned, so the two
//! low bits of the prev word carry the free and no-coalesce tags.
//! The header is only meaningful while the chunk is free.
use std::{fmt, num::NonZeroUsize};

use crate::{HEAP_WORD_SIZE, HeapRegion};

pub const SIZE_WORD: usize = 0;
pub const PREV_WORD: usize = 1;
pub const NEXT_WORD: usize = 2;

/// Smallest block that can describe itself as a free chunk.
pub const FREE_CHUNK_WORDS: usize = 3;

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum ChunkTag {
    Free = 0b01,
    NoCoalesce = 0b10,
}

pub const CHUNK_TAG_MASK: usize = 0b11;

/// Reference to a chunk inside a [`HeapRegion`].
///
/// Never zero, so `Option<ChunkRef>` is one word and its zero value is the
/// null link stored in headers.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRef(NonZeroUsize);

impl ChunkRef {
    #[inline]
    pub fn at_word(word: usize) -> Option<Self> {
        NonZeroUsize::new(word * HEAP_WORD_SIZE).map(Self)
    }

    #[inline]
    pub fn word(self) -> usize {
        self.0.get() / HEAP_WORD_SIZE
    }

    #[inline]
    pub fn byte_offset(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub(crate) fn encode(link: Option<ChunkRef>) -> usize {
        link.map_or(0, |chunk| chunk.0.get())
    }

    #[inline]
    pub(crate) fn decode(raw: usize) -> Option<ChunkRef> {
        NonZeroUsize::new(raw & !CHUNK_TAG_MASK).map(Self)
    }

    #[inline]
    pub(crate) fn field(self, offset: usize) -> usize {
        self.word() + offset
    }

    #[inline]
    pub fn size(self, heap: &HeapRegion) -> usize {
        heap.word(self.field(SIZE_WORD))
    }

    #[inline]
    pub fn set_size(self, heap: &mut HeapRegion, size: usize) {
        heap.set_word(self.field(SIZE_WORD), size);
    }

    /// First word past the chunk.
    #[inline]
    pub fn end(self, heap: &HeapRegion) -> usize {
        self.word() + self.size(heap)
    }

    #[inline]
    pub fn next(self, heap: &HeapRegion) -> Option<ChunkRef> {
        Self::decode(heap.word(self.field(NEXT_WORD)))
    }

    #[inline]
    pub fn prev(self, heap: &HeapRegion) -> Option<ChunkRef> {
        Self::decode(heap.word(self.field(PREV_WORD)))
    }

    /// Reads the free tag. On a block that was handed out this reads object
    /// data, which is only acceptable for diagnostics.
    #[inline]
    pub fn is_free(self, heap: &HeapRegion) -> bool {
        heap.word(self.field(PREV_WORD)) & ChunkTag::Free as usize != 0
    }

    #[inline]
    pub fn cant_coalesce(self, heap: &HeapRegion) -> bool {
        debug_assert!(self.is_free(heap), "only free chunks carry tags");
        heap.word(self.field(PREV_WORD)) & ChunkTag::NoCoalesce as usize != 0
    }

    pub fn dont_coalesce(self, heap: &mut HeapRegion) {
        debug_assert!(self.is_free(heap), "only free chunks carry tags");
        let raw = heap.word(self.field(PREV_WORD));
        heap.set_word(self.field(PREV_WORD), raw | ChunkTag::NoCoalesce as usize);
    }

    /// Clears the whole tagged prev word. Must happen before the memory is
    /// given to a new object.
    pub fn mark_not_free(self, heap: &mut HeapRegion) {
        heap.set_word(self.field(PREV_WORD), 0);
        debug_assert!(!self.is_free(heap));
    }

    /// Write a fresh, unlinked free header of `size` words.
    pub fn make_free(self, heap: &mut HeapRegion, size: usize) {
        self.set_size(heap, size);
        heap.set_word(self.field(PREV_WORD), ChunkTag::Free as usize);
        heap.set_word(self.field(NEXT_WORD), 0);
    }

    /// Set the prev link, marking the chunk free and keeping its
    /// no-coalesce tag.
    #[inline]
    pub fn link_prev(self, heap: &mut HeapRegion, prev: Option<ChunkRef>) {
        let kept = heap.word(self.field(PREV_WORD)) & ChunkTag::NoCoalesce as usize;
        heap.set_word(
            self.field(PREV_WORD),
            Self::encode(prev) | kept | ChunkTag::Free as usize,
        );
    }

    #[inline]
    pub fn link_next(self, heap: &mut HeapRegion, next: Option<ChunkRef>) {
        heap.set_word(self.field(NEXT_WORD), Self::encode(next));
    }

    /// Make `next` follow `self`, fixing the links on both sides.
    #[inline]
    pub fn link_after(self, heap: &mut HeapRegion, next: Option<ChunkRef>) {
        self.link_next(heap, next);
        if let Some(next) = next {
            next.link_prev(heap, Some(self));
        }
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk@{:#x}", self.word())
    }
}
