use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    AdaptivePolicy, BinaryTreeDictionary, CensusStats, ChunkOrigin, ChunkRef, CurrentCount,
    DemandEstimator, Dither, FreeListPolicy, HEAP_WORD_SIZE, HeapRegion, ListHeader, PlainPolicy,
    RESERVED_WORDS,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Plain,
    #[default]
    Adaptive,
}

/// Overrides for [`SpaceSettings`], unset fields keep their default.
#[derive(Default)]
pub struct SpaceCreateInfo {
    pub words: Option<usize>,
    pub policy: Option<PolicyKind>,
    pub coal_surplus_percent: Option<f64>,
    pub split_surplus_percent: Option<f64>,
    pub always_coalesce_large: Option<bool>,
    pub verify_dictionary: Option<bool>,
    // demand model of the adaptive policy, defaults to CurrentCount
    pub estimator: Option<Box<dyn DemandEstimator>>,
}

impl fmt::Debug for SpaceCreateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceCreateInfo")
            .field("words", &self.words)
            .field("policy", &self.policy)
            .field("coal_surplus_percent", &self.coal_surplus_percent)
            .field("split_surplus_percent", &self.split_surplus_percent)
            .field("always_coalesce_large", &self.always_coalesce_large)
            .field("verify_dictionary", &self.verify_dictionary)
            .field("estimator", &self.estimator.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceSettings {
    /// Region size in words.
    pub words: usize,
    pub policy: PolicyKind,
    /// Scales desired into coal_desired when a sweep begins.
    pub coal_surplus_percent: f64,
    /// Scales desired when surplus is recomputed after a sweep.
    pub split_surplus_percent: f64,
    /// Coalesce regardless of how many chunks a class holds.
    pub always_coalesce_large: bool,
    /// Verify the whole dictionary around every get and remove. Slow.
    pub verify_dictionary: bool,
}

impl Default for SpaceSettings {
    fn default() -> Self {
        Self {
            words: (1 << 20) / HEAP_WORD_SIZE, // 1 MB
            policy: PolicyKind::Adaptive,
            coal_surplus_percent: 0.95,
            split_surplus_percent: 1.00,
            always_coalesce_large: false,
            verify_dictionary: false,
        }
    }
}

impl SpaceSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.words < RESERVED_WORDS + BinaryTreeDictionary::min_size() {
            return Err("region too small for a single chunk");
        }
        let percents = [self.coal_surplus_percent, self.split_surplus_percent];
        if percents.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err("surplus percentages must be finite and not negative");
        }
        Ok(())
    }
}

struct SpaceInner {
    heap: HeapRegion,
    dict: BinaryTreeDictionary,
    sweeps: usize,
    sweeping: bool,
}

/// A region of free chunks behind the freelist lock.
///
/// Every operation lives on [`FreelistGuard`], so holding the guard is the
/// locking protocol. Debug builds additionally track which thread holds it.
pub struct FreeListSpace {
    settings: SpaceSettings,
    inner: Mutex<SpaceInner>,
    owner: AtomicUsize,
}

fn thread_token() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    thread_local! {
        static TOKEN: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

impl FreeListSpace {
    pub fn new(info: SpaceCreateInfo) -> Self {
        let mut settings = SpaceSettings::default();
        info.words.inspect(|&val| settings.words = val);
        info.policy.inspect(|&val| settings.policy = val);
        info.coal_surplus_percent
            .inspect(|&val| settings.coal_surplus_percent = val);
        info.split_surplus_percent
            .inspect(|&val| settings.split_surplus_percent = val);
        info.always_coalesce_large
            .inspect(|&val| settings.always_coalesce_large = val);
        info.verify_dictionary
            .inspect(|&val| settings.verify_dictionary = val);
        settings.validate().expect("Invalid Space Settings");

        let policy: Box<dyn FreeListPolicy> = match settings.policy {
            PolicyKind::Plain => Box::new(PlainPolicy),
            PolicyKind::Adaptive => Box::new(AdaptivePolicy::new(
                info.estimator.unwrap_or_else(|| Box::new(CurrentCount)),
                settings.always_coalesce_large,
            )),
        };

        let mut heap = HeapRegion::new(settings.words);
        let first = heap.format_free(heap.first_word(), heap.usable_words());
        let mut dict = BinaryTreeDictionary::with_chunk(&mut heap, first, policy);
        dict.set_verify_dictionary(settings.verify_dictionary);
        log::debug!(
            "FreeListSpace::new: {} words, {:?} policy",
            settings.words,
            settings.policy
        );

        Self {
            settings,
            inner: Mutex::new(SpaceInner {
                heap,
                dict,
                sweeps: 0,
                sweeping: false,
            }),
            owner: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &SpaceSettings {
        &self.settings
    }

    /// Take the freelist lock.
    pub fn lock(&self) -> FreelistGuard<'_> {
        let inner = self.inner.lock();
        if cfg!(debug_assertions) {
            self.owner.store(thread_token(), Ordering::Relaxed);
        }
        FreelistGuard { space: self, inner }
    }

    pub fn try_lock(&self) -> Option<FreelistGuard<'_>> {
        let inner = self.inner.try_lock()?;
        if cfg!(debug_assertions) {
            self.owner.store(thread_token(), Ordering::Relaxed);
        }
        Some(FreelistGuard { space: self, inner })
    }

    /// Only tracked in debug builds, always false otherwise.
    pub fn owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread_token()
    }
}

impl fmt::Debug for FreeListSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeListSpace")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub struct FreelistGuard<'a> {
    space: &'a FreeListSpace,
    inner: MutexGuard<'a, SpaceInner>,
}

impl Drop for FreelistGuard<'_> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            self.space.owner.store(0, Ordering::Relaxed);
        }
    }
}

impl FreelistGuard<'_> {
    #[inline]
    fn assert_locked(&self) {
        debug_assert!(
            self.space.owned_by_current_thread(),
            "freelist lock not held by this thread"
        );
    }

    /// Hand out a block of at least `size` words. The request is rounded up
    /// to the dictionary minimum, a chunk large enough to leave a usable
    /// remainder is split. The block keeps its size in its first word.
    pub fn allocate(&mut self, size: usize, dither: Dither) -> Option<ChunkRef> {
        self.assert_locked();
        let min = BinaryTreeDictionary::min_size();
        let size = size.max(min);
        let inner = &mut *self.inner;
        let chunk = inner.dict.get_chunk(&mut inner.heap, size, dither)?;

        let found = chunk.size(&inner.heap);
        if found >= size + min {
            let remainder = inner.heap.format_free(chunk.word() + size, found - size);
            chunk.set_size(&mut inner.heap, size);
            inner.dict.return_chunk(&mut inner.heap, remainder);
            self.split(found, size);
            self.check_conservation(found - size);
        }
        chunk.mark_not_free(&mut self.inner.heap);
        log::trace!("allocate({size}, {dither:?}) -> {chunk}");
        Some(chunk)
    }

    fn give_back(&mut self, chunk: ChunkRef, size: usize, origin: ChunkOrigin) {
        self.assert_locked();
        let inner = &mut *self.inner;
        debug_assert!(inner.heap.contains(chunk.word(), size), "{chunk} outside the space");
        chunk.make_free(&mut inner.heap, size);
        self.return_to_dictionary(chunk, origin);
    }

    fn return_to_dictionary(&mut self, chunk: ChunkRef, origin: ChunkOrigin) {
        let inner = &mut *self.inner;
        inner.dict.return_chunk_with_origin(&mut inner.heap, chunk, origin);
        let size = chunk.size(&inner.heap);
        // Outside a sweep the census has not seen this block yet, it joins
        // its class as new stock.
        if origin == ChunkOrigin::Returned && !inner.sweeping {
            inner.dict.dict_census_update(&mut inner.heap, size, true, true);
        }
        self.check_conservation(size);
    }

    /// Between sweeps every class must account for its chunks.
    fn check_conservation(&self, size: usize) {
        if !cfg!(debug_assertions) || self.inner.sweeping {
            return;
        }
        let (heap, dict) = (&self.inner.heap, &self.inner.dict);
        if !dict.policy().is_adaptive() {
            return;
        }
        if let Some(list) = dict.find_list(heap, size) {
            debug_assert!(
                list.conservation_holds(heap),
                "class {size} violates conservation: prev_sweep {} births {} deaths {} count {}",
                list.prev_sweep(heap),
                list.split_births(heap) + list.coal_births(heap),
                list.split_deaths(heap) + list.coal_deaths(heap),
                list.count(heap)
            );
        }
    }

    /// Return a block whose neighbours were already dealt with.
    pub fn free(&mut self, chunk: ChunkRef, size: usize) {
        self.give_back(chunk, size, ChunkOrigin::Returned);
    }

    /// Return a block produced by merging free neighbours.
    pub fn free_coalesced(&mut self, chunk: ChunkRef, size: usize) {
        self.give_back(chunk, size, ChunkOrigin::Coalesced);
    }

    /// Turn raw words of the region into a free chunk.
    pub fn add_chunk(&mut self, word: usize, size: usize) -> ChunkRef {
        self.assert_locked();
        let inner = &mut *self.inner;
        let chunk = inner.heap.format_free(word, size);
        self.return_to_dictionary(chunk, ChunkOrigin::Returned);
        chunk
    }

    /// Take a free chunk out of the dictionary, for coalescing.
    pub fn remove_free_chunk(&mut self, chunk: ChunkRef) {
        self.assert_locked();
        let inner = &mut *self.inner;
        inner.dict.remove_chunk(&mut inner.heap, chunk);
    }

    pub fn begin_sweep_census(
        &mut self,
        coal_surplus_percent: f64,
        inter_sweep_current: f32,
        inter_sweep_estimate: f32,
        intra_sweep_estimate: f32,
    ) {
        self.assert_locked();
        let inner = &mut *self.inner;
        inner.dict.begin_sweep_dict_census(
            &mut inner.heap,
            coal_surplus_percent,
            inter_sweep_current,
            inter_sweep_estimate,
            intra_sweep_estimate,
        );
        inner.sweeping = true;
    }

    pub fn end_sweep_census(&mut self, split_surplus_percent: f64) {
        self.assert_locked();
        let inner = &mut *self.inner;
        if log::log_enabled!(log::Level::Debug) {
            let mut census = String::new();
            if inner.dict.print_dict_census(&inner.heap, &mut census).is_ok() {
                log::debug!("sweep {} census:\n{census}", inner.sweeps);
            }
        }
        inner.dict.end_sweep_dict_census(&mut inner.heap, split_surplus_percent);
        inner.sweeps += 1;
        inner.sweeping = false;
    }

    pub fn sweeps(&self) -> usize {
        self.inner.sweeps
    }

    /// Whether a sweep census is open.
    pub fn sweeping(&self) -> bool {
        self.inner.sweeping
    }

    pub fn coal_over_populated(&self, size: usize) -> bool {
        self.assert_locked();
        self.inner.dict.coal_dict_over_populated(&self.inner.heap, size)
    }

    fn census_update(&mut self, size: usize, split: bool, birth: bool) {
        self.assert_locked();
        let inner = &mut *self.inner;
        inner.dict.dict_census_update(&mut inner.heap, size, split, birth);
    }

    pub fn coal_birth(&mut self, size: usize) {
        self.census_update(size, false, true);
    }

    pub fn coal_death(&mut self, size: usize) {
        self.census_update(size, false, false);
    }

    pub fn split_birth(&mut self, size: usize) {
        self.census_update(size, true, true);
    }

    pub fn split_death(&mut self, size: usize) {
        self.census_update(size, true, false);
    }

    /// A chunk of `from` words became chunks of `to1` and `from - to1`.
    pub fn split(&mut self, from: usize, to1: usize) {
        debug_assert!(to1 < from);
        self.split_death(from);
        self.split_birth(to1);
        self.split_birth(from - to1);
    }

    pub fn verify(&self) {
        self.assert_locked();
        self.inner.dict.verify(&self.inner.heap);
    }

    pub fn report_statistics(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.dict.report_statistics(&self.inner.heap, out)
    }

    pub fn print_census(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.dict.print_dict_census(&self.inner.heap, out)
    }

    pub fn print_free_lists(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.dict.print_free_lists(&self.inner.heap, out)
    }

    /// 0 for a single free chunk, approaching 1 as free space splinters.
    pub fn fragmentation(&self) -> f64 {
        let total = self.inner.dict.total_size() as f64;
        if total == 0.0 {
            return 0.0;
        }
        1.0 - self.inner.dict.sum_of_squared_block_sizes(&self.inner.heap) / (total * total)
    }

    pub fn total_free_words(&self) -> usize {
        self.inner.dict.total_size()
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.dict.total_free_blocks()
    }

    pub fn max_chunk_size(&self) -> usize {
        self.inner.dict.max_chunk_size(&self.inner.heap)
    }

    pub fn find_chunk_ends_at(&self, word: usize) -> Option<ChunkRef> {
        self.inner.dict.find_chunk_ends_at(&self.inner.heap, word)
    }

    pub fn dictionary(&self) -> &BinaryTreeDictionary {
        &self.inner.dict
    }

    pub fn heap(&self) -> &HeapRegion {
        &self.inner.heap
    }

    pub fn heap_mut(&mut self) -> &mut HeapRegion {
        &mut self.inner.heap
    }
}
