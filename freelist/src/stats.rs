//! Per size-class allocation statistics.
//!
//! Every sweep recomputes how many chunks of each size the allocator would
//! like to keep (`desired`) and how far it is from that (`surplus`). In
//! between, births and deaths caused by splitting and coalescing are
//! counted so the next census can judge demand.
use std::fmt;

use crate::{ChunkRef, FreeList, HeapRegion, ListHeader};

/// Statistics slot of an adaptive list.
#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stat {
    Desired,
    CoalDesired,
    Surplus,
    BfrSurp,
    PrevSweep,
    BeforeSweep,
    CoalBirths,
    CoalDeaths,
    SplitBirths,
    SplitDeaths,
    /// Size of a larger class with surplus, zero when unset.
    Hint,
}

impl Stat {
    pub const COUNT: usize = 11;

    pub const ALL: [Stat; Stat::COUNT] = [
        Stat::Desired,
        Stat::CoalDesired,
        Stat::Surplus,
        Stat::BfrSurp,
        Stat::PrevSweep,
        Stat::BeforeSweep,
        Stat::CoalBirths,
        Stat::CoalDeaths,
        Stat::SplitBirths,
        Stat::SplitDeaths,
        Stat::Hint,
    ];
}

/// What a [`DemandEstimator`] gets to look at for one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DemandSample {
    pub size: usize,
    pub count: usize,
    pub prev_sweep: isize,
    pub before_sweep: isize,
    pub coal_births: isize,
    pub coal_deaths: isize,
    pub split_births: isize,
    pub split_deaths: isize,
    pub inter_sweep_current: f32,
    pub inter_sweep_estimate: f32,
    pub intra_sweep_estimate: f32,
}

/// Turns sweep timing and a list's history into a desired chunk count.
pub trait DemandEstimator: Send + Sync {
    fn desired(&self, sample: &DemandSample) -> isize;
}

impl<F> DemandEstimator for F
where
    F: Fn(&DemandSample) -> isize + Send + Sync,
{
    fn desired(&self, sample: &DemandSample) -> isize {
        self(sample)
    }
}

/// Wants exactly what is there. Placeholder for a real demand model.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentCount;

impl DemandEstimator for CurrentCount {
    fn desired(&self, sample: &DemandSample) -> isize {
        sample.count as isize
    }
}

/// A list that carries allocation statistics.
pub trait CensusStats: ListHeader {
    fn stat(&self, heap: &HeapRegion, stat: Stat) -> isize;
    fn set_stat(&mut self, heap: &mut HeapRegion, stat: Stat, value: isize);

    fn init_statistics(&mut self, heap: &mut HeapRegion) {
        for stat in Stat::ALL {
            self.set_stat(heap, stat, 0);
        }
    }

    #[inline]
    fn bump(&mut self, heap: &mut HeapRegion, stat: Stat, delta: isize) {
        let value = self.stat(heap, stat);
        self.set_stat(heap, stat, value + delta);
    }

    fn desired(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::Desired)
    }
    fn set_desired(&mut self, heap: &mut HeapRegion, value: isize) {
        self.set_stat(heap, Stat::Desired, value);
    }
    fn coal_desired(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::CoalDesired)
    }
    fn set_coal_desired(&mut self, heap: &mut HeapRegion, value: isize) {
        self.set_stat(heap, Stat::CoalDesired, value);
    }
    fn surplus(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::Surplus)
    }
    fn set_surplus(&mut self, heap: &mut HeapRegion, value: isize) {
        self.set_stat(heap, Stat::Surplus, value);
    }
    fn increment_surplus(&mut self, heap: &mut HeapRegion) {
        self.bump(heap, Stat::Surplus, 1);
    }
    fn decrement_surplus(&mut self, heap: &mut HeapRegion) {
        self.bump(heap, Stat::Surplus, -1);
    }
    fn bfr_surp(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::BfrSurp)
    }
    fn prev_sweep(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::PrevSweep)
    }
    fn before_sweep(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::BeforeSweep)
    }
    fn coal_births(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::CoalBirths)
    }
    fn increment_coal_births(&mut self, heap: &mut HeapRegion) {
        self.bump(heap, Stat::CoalBirths, 1);
    }
    fn coal_deaths(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::CoalDeaths)
    }
    fn increment_coal_deaths(&mut self, heap: &mut HeapRegion) {
        self.bump(heap, Stat::CoalDeaths, 1);
    }
    fn split_births(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::SplitBirths)
    }
    fn increment_split_births(&mut self, heap: &mut HeapRegion) {
        self.bump(heap, Stat::SplitBirths, 1);
    }
    fn split_deaths(&self, heap: &HeapRegion) -> isize {
        self.stat(heap, Stat::SplitDeaths)
    }
    fn increment_split_deaths(&mut self, heap: &mut HeapRegion) {
        self.bump(heap, Stat::SplitDeaths, 1);
    }

    fn hint(&self, heap: &HeapRegion) -> usize {
        self.stat(heap, Stat::Hint) as usize
    }
    fn set_hint(&mut self, heap: &mut HeapRegion, size: usize) {
        self.set_stat(heap, Stat::Hint, size as isize);
    }

    fn sample(
        &self,
        heap: &HeapRegion,
        inter_sweep_current: f32,
        inter_sweep_estimate: f32,
        intra_sweep_estimate: f32,
    ) -> DemandSample {
        DemandSample {
            size: self.size(heap),
            count: self.count(heap),
            prev_sweep: self.prev_sweep(heap),
            before_sweep: self.before_sweep(heap),
            coal_births: self.coal_births(heap),
            coal_deaths: self.coal_deaths(heap),
            split_births: self.split_births(heap),
            split_deaths: self.split_deaths(heap),
            inter_sweep_current,
            inter_sweep_estimate,
            intra_sweep_estimate,
        }
    }

    fn compute_desired(
        &mut self,
        heap: &mut HeapRegion,
        estimator: &dyn DemandEstimator,
        inter_sweep_current: f32,
        inter_sweep_estimate: f32,
        intra_sweep_estimate: f32,
    ) {
        let sample = self.sample(
            heap,
            inter_sweep_current,
            inter_sweep_estimate,
            intra_sweep_estimate,
        );
        self.set_desired(heap, estimator.desired(&sample));
    }

    /// Size the next request of this size should be served from: this list
    /// while it has a surplus, else the hinted class if there is one.
    fn get_better_size(&self, heap: &HeapRegion) -> usize {
        let hint = self.hint(heap);
        if self.surplus(heap) > 0 || hint == 0 {
            self.size(heap)
        } else {
            hint
        }
    }

    /// Snapshot taken at the end of a sweep: the stock seen now becomes the
    /// baseline and the event counters start over.
    fn clear_census(&mut self, heap: &mut HeapRegion) {
        let count = self.count(heap) as isize;
        self.set_stat(heap, Stat::PrevSweep, count);
        self.set_stat(heap, Stat::CoalBirths, 0);
        self.set_stat(heap, Stat::CoalDeaths, 0);
        self.set_stat(heap, Stat::SplitBirths, 0);
        self.set_stat(heap, Stat::SplitDeaths, 0);
    }

    /// Chunks created since the last sweep cover the chunks consumed plus
    /// the ones still here, up to one chunk of slack.
    fn conservation_holds(&self, heap: &HeapRegion) -> bool {
        self.prev_sweep(heap) + self.split_births(heap) + self.coal_births(heap) + 1
            >= self.split_deaths(heap) + self.coal_deaths(heap) + self.count(heap) as isize
    }
}

/// An off-heap list with statistics. Also used to sum up census rows.
#[derive(Debug, Default, Clone)]
pub struct AdaptiveFreeList {
    list: FreeList,
    stats: [isize; Stat::COUNT],
}

impl AdaptiveFreeList {
    pub fn new(size: usize) -> Self {
        Self {
            list: FreeList::new(size),
            stats: [0; Stat::COUNT],
        }
    }

    pub fn list(&self) -> &FreeList {
        &self.list
    }

    /// Add another list's count and statistics to this one.
    pub fn accumulate<L: CensusStats>(&mut self, heap: &HeapRegion, other: &L) {
        for stat in Stat::ALL {
            if stat != Stat::Hint {
                self.stats[stat as usize] += other.stat(heap, stat);
            }
        }
        let count = self.list.count(heap) + other.count(heap);
        self.list.set_len(count);
    }
}

impl ListHeader for AdaptiveFreeList {
    fn size(&self, heap: &HeapRegion) -> usize {
        self.list.size(heap)
    }
    fn set_size(&mut self, heap: &mut HeapRegion, size: usize) {
        self.list.set_size(heap, size);
    }
    fn head(&self, heap: &HeapRegion) -> Option<ChunkRef> {
        self.list.head(heap)
    }
    fn set_head(&mut self, heap: &mut HeapRegion, head: Option<ChunkRef>) {
        self.list.set_head(heap, head);
    }
    fn tail(&self, heap: &HeapRegion) -> Option<ChunkRef> {
        self.list.tail(heap)
    }
    fn set_tail(&mut self, heap: &mut HeapRegion, tail: Option<ChunkRef>) {
        self.list.set_tail(heap, tail);
    }
    fn count(&self, heap: &HeapRegion) -> usize {
        self.list.count(heap)
    }
    fn set_count(&mut self, heap: &mut HeapRegion, count: usize) {
        self.list.set_count(heap, count);
    }
}

impl CensusStats for AdaptiveFreeList {
    fn stat(&self, _: &HeapRegion, stat: Stat) -> isize {
        self.stats[stat as usize]
    }
    fn set_stat(&mut self, _: &mut HeapRegion, stat: Stat, value: isize) {
        self.stats[stat as usize] = value;
    }
}

pub fn print_census_labels(out: &mut dyn fmt::Write, label: &str) -> fmt::Result {
    writeln!(
        out,
        "{label:>16} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "bfrsurp",
        "surplus",
        "desired",
        "prvSwep",
        "bfrSwep",
        "count",
        "cBirths",
        "cDeaths",
        "sBirths",
        "sDeaths"
    )
}

/// One census row. Rows without a label print the list size.
pub fn print_census_row<L: CensusStats>(
    heap: &HeapRegion,
    list: &L,
    out: &mut dyn fmt::Write,
    label: Option<&str>,
) -> fmt::Result {
    match label {
        Some(label) => write!(out, "{label:>16}")?,
        None => write!(out, "{:>16}", list.size(heap))?,
    }
    writeln!(
        out,
        " {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        list.bfr_surp(heap),
        list.surplus(heap),
        list.desired(heap),
        list.prev_sweep(heap),
        list.before_sweep(heap),
        list.count(heap),
        list.coal_births(heap),
        list.coal_deaths(heap),
        list.split_births(heap),
        list.split_deaths(heap)
    )
}
