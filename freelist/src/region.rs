use std::{fmt, ptr::NonNull, slice};

use crate::{
    ChunkRef, FREE_CHUNK_WORDS,
    system::{self, map_memory, unmap_memory},
};

pub const HEAP_WORD_SIZE: usize = size_of::<usize>();

/// Words at the start of every region that never belong to a chunk,
/// so a stored link of zero always means "no chunk".
pub const RESERVED_WORDS: usize = 1;

/// A mapped, word addressed piece of memory that chunks are carved from.
///
/// The region is the only owner of the mapping. Free chunks are nothing but
/// words of this region interpreted as headers, every access goes through
/// the bounds checked [`HeapRegion::word`] and [`HeapRegion::set_word`].
pub struct HeapRegion {
    start: NonNull<usize>,
    words: usize,
    mapped: usize,
}

// SAFETY: the mapping is exclusively owned by this value
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    pub fn new(words: usize) -> Self {
        assert!(
            words > RESERVED_WORDS + FREE_CHUNK_WORDS,
            "region too small to hold a single chunk"
        );
        let mapped = system::page_align(words * HEAP_WORD_SIZE);
        let start =
            map_memory(mapped).expect("Allocate Memory for heap region");
        log::debug!("HeapRegion::new({words}): mapped {mapped:#x} bytes");
        Self {
            start: start.cast(),
            words,
            mapped,
        }
    }

    #[inline]
    pub fn words(&self) -> usize {
        self.words
    }

    /// First word a chunk may start at.
    #[inline]
    pub fn first_word(&self) -> usize {
        RESERVED_WORDS
    }

    #[inline]
    pub fn usable_words(&self) -> usize {
        self.words - RESERVED_WORDS
    }

    #[inline]
    fn as_words(&self) -> &[usize] {
        // SAFETY: mapping is live for the lifetime of self and holds `words` words
        unsafe { slice::from_raw_parts(self.start.as_ptr(), self.words) }
    }

    #[inline]
    fn as_words_mut(&mut self) -> &mut [usize] {
        // SAFETY: mapping is live and uniquely borrowed through &mut self
        unsafe { slice::from_raw_parts_mut(self.start.as_ptr(), self.words) }
    }

    #[inline]
    pub fn word(&self, index: usize) -> usize {
        self.as_words()[index]
    }

    #[inline]
    pub fn set_word(&mut self, index: usize, value: usize) {
        self.as_words_mut()[index] = value;
    }

    /// Whether `[word, word + size)` lies inside the chunk area.
    pub fn contains(&self, word: usize, size: usize) -> bool {
        word >= RESERVED_WORDS
            && word.checked_add(size).is_some_and(|end| end <= self.words)
    }

    /// Write a free chunk header of `size` words at `word`.
    pub fn format_free(&mut self, word: usize, size: usize) -> ChunkRef {
        assert!(size >= FREE_CHUNK_WORDS, "chunk too small for a header");
        assert!(
            self.contains(word, size),
            "chunk {word:#x}+{size:#x} outside region of {:#x} words",
            self.words
        );
        let chunk =
            ChunkRef::at_word(word).expect("reserved word is never a chunk");
        chunk.make_free(self, size);
        chunk
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: mapped in new with exactly this size
        unsafe { unmap_memory(self.start.cast(), self.mapped) };
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRegion")
            .field("start", &self.start)
            .field("words", &self.words)
            .finish()
    }
}
