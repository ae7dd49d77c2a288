//! What the dictionary does with its statistics.
//!
//! A dictionary is built with one policy. [`PlainPolicy`] keeps no
//! statistics and never redirects a request. [`AdaptivePolicy`] runs the
//! sweep census and uses its results to steer allocation and coalescing.
use std::fmt;

use crate::{
    BinaryTreeDictionary, CensusStats, DemandEstimator, HeapRegion, ListHeader, Order, Stat, TreeList,
};

pub trait FreeListPolicy: fmt::Debug + Send {
    fn is_adaptive(&self) -> bool;

    /// List a request that landed on `list` should be served from.
    fn better_list(
        &self,
        _dict: &BinaryTreeDictionary,
        _heap: &mut HeapRegion,
        list: TreeList,
    ) -> TreeList {
        list
    }

    /// Record a split or coalesce birth or death for the class `size`.
    fn census_update(
        &self,
        _dict: &BinaryTreeDictionary,
        _heap: &mut HeapRegion,
        _size: usize,
        _split: bool,
        _birth: bool,
    ) {
    }

    /// Whether chunks of `size` are plentiful enough to be coalesced away.
    fn coal_over_populated(&self, _dict: &BinaryTreeDictionary, _heap: &HeapRegion, _size: usize) -> bool {
        true
    }

    fn begin_sweep(
        &self,
        _dict: &BinaryTreeDictionary,
        _heap: &mut HeapRegion,
        _coal_surplus_percent: f64,
        _inter_sweep_current: f32,
        _inter_sweep_estimate: f32,
        _intra_sweep_estimate: f32,
    ) {
    }

    fn end_sweep(&self, _dict: &BinaryTreeDictionary, _heap: &mut HeapRegion, _split_surplus_percent: f64) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainPolicy;

impl FreeListPolicy for PlainPolicy {
    fn is_adaptive(&self) -> bool {
        false
    }
}

pub struct AdaptivePolicy {
    estimator: Box<dyn DemandEstimator>,
    always_coalesce_large: bool,
}

impl AdaptivePolicy {
    pub fn new(estimator: Box<dyn DemandEstimator>, always_coalesce_large: bool) -> Self {
        Self {
            estimator,
            always_coalesce_large,
        }
    }

    pub fn always_coalesce_large(&self) -> bool {
        self.always_coalesce_large
    }
}

impl fmt::Debug for AdaptivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptivePolicy")
            .field("always_coalesce_large", &self.always_coalesce_large)
            .finish_non_exhaustive()
    }
}

impl FreeListPolicy for AdaptivePolicy {
    fn is_adaptive(&self) -> bool {
        true
    }

    /// Follows hints towards larger classes until one has a surplus. The
    /// first list remembers where the surplus was found, a hint that leads
    /// nowhere is dropped.
    fn better_list(
        &self,
        dict: &BinaryTreeDictionary,
        heap: &mut HeapRegion,
        list: TreeList,
    ) -> TreeList {
        if list.surplus(heap) > 0 {
            return list;
        }
        let mut candidate = list;
        let mut hinted = list;
        loop {
            let hint = hinted.hint(heap);
            if hint == 0 {
                break;
            }
            match dict.find_list(heap, hint) {
                Some(next) if next != list && hint > hinted.size(heap) => {
                    if next.surplus(heap) > 0 {
                        candidate.set_hint(heap, next.size(heap));
                        candidate = next;
                        break;
                    }
                    hinted = next;
                }
                _ => {
                    log::trace!("dropping stale hint {hint} of class {}", candidate.size(heap));
                    candidate.set_hint(heap, 0);
                    break;
                }
            }
        }
        candidate
    }

    fn census_update(
        &self,
        dict: &BinaryTreeDictionary,
        heap: &mut HeapRegion,
        size: usize,
        split: bool,
        birth: bool,
    ) {
        let Some(mut list) = dict.find_list(heap, size) else {
            return;
        };
        match (split, birth) {
            (true, true) => {
                list.increment_split_births(heap);
                list.increment_surplus(heap);
            }
            (true, false) => {
                list.increment_split_deaths(heap);
                list.decrement_surplus(heap);
            }
            (false, true) => {
                list.increment_coal_births(heap);
                list.increment_surplus(heap);
            }
            (false, false) => {
                list.increment_coal_deaths(heap);
                list.decrement_surplus(heap);
            }
        }
    }

    fn coal_over_populated(&self, dict: &BinaryTreeDictionary, heap: &HeapRegion, size: usize) -> bool {
        if self.always_coalesce_large {
            return true;
        }
        match dict.find_list(heap, size) {
            None => true,
            Some(list) => {
                let coal_desired = list.coal_desired(heap);
                coal_desired <= 0 || list.count(heap) as isize > coal_desired
            }
        }
    }

    fn begin_sweep(
        &self,
        dict: &BinaryTreeDictionary,
        heap: &mut HeapRegion,
        coal_surplus_percent: f64,
        inter_sweep_current: f32,
        inter_sweep_estimate: f32,
        intra_sweep_estimate: f32,
    ) {
        dict.apply(heap, Order::Ascending, |heap, mut list| {
            list.compute_desired(
                heap,
                &*self.estimator,
                inter_sweep_current,
                inter_sweep_estimate,
                intra_sweep_estimate,
            );
            let desired = list.desired(heap);
            list.set_coal_desired(heap, (desired as f64 * coal_surplus_percent) as isize);
            let count = list.count(heap) as isize;
            list.set_stat(heap, Stat::BeforeSweep, count);
            let surplus = list.surplus(heap);
            list.set_stat(heap, Stat::BfrSurp, surplus);
        });
    }

    fn end_sweep(&self, dict: &BinaryTreeDictionary, heap: &mut HeapRegion, split_surplus_percent: f64) {
        dict.set_tree_surplus(heap, split_surplus_percent);
        dict.set_tree_hints(heap);
        if log::log_enabled!(log::Level::Trace) {
            let mut report = String::new();
            if dict.report_statistics(heap, &mut report).is_ok() {
                log::trace!("{report}");
            }
        }
        dict.clear_tree_census(heap);
    }
}
