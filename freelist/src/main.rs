use std::{collections::BTreeMap, time::Instant};

use clap::{Parser, ValueEnum};
use freelist::{
    BinaryTreeDictionary, ChunkRef, Dither, FreeListSpace, FreelistGuard, PolicyKind,
    SpaceCreateInfo,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Policy {
    Plain,
    Adaptive,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Region size in words
    #[arg(long, default_value_t = 1 << 17)]
    words: usize,

    /// Allocate, kill and sweep this many times
    #[arg(long, default_value_t = 16)]
    cycles: usize,

    /// Allocation attempts per cycle
    #[arg(long, default_value_t = 2000)]
    objects: usize,

    /// Largest object in words
    #[arg(long, default_value_t = 256)]
    max_object: usize,

    /// Chance of an object surviving a cycle
    #[arg(long, default_value_t = 0.5)]
    survival: f64,

    #[arg(long, default_value_t = 0x2545_f491_4f6c_dd1d)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = Policy::Adaptive)]
    policy: Policy,

    /// Verify the dictionary around every operation
    #[arg(long)]
    verify: bool,
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.0 >> 33
    }

    fn between(&mut self, low: usize, high: usize) -> usize {
        low + (self.next() % (high - low + 1) as u64) as usize
    }

    fn chance(&mut self, p: f64) -> bool {
        (self.next() as f64 / (1u64 << 31) as f64) < p
    }
}

/// Free words collected so far, starting at `start`.
struct Run {
    start: ChunkRef,
    size: usize,
    pieces: usize,
    // still a chunk of the dictionary, nothing merged into it yet
    in_dictionary: bool,
}

#[derive(Debug, Default)]
struct SweepStats {
    freed: usize,
    coalesced: usize,
    skipped: usize,
}

struct Sweeper<'g, 'a> {
    guard: &'g mut FreelistGuard<'a>,
    run: Option<Run>,
    stats: SweepStats,
}

impl Sweeper<'_, '_> {
    fn flush(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        if run.in_dictionary {
            return;
        }
        if run.pieces == 1 {
            self.guard.free(run.start, run.size);
        } else {
            self.guard.free_coalesced(run.start, run.size);
            self.stats.coalesced += 1;
        }
    }

    fn run_accepts_more(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| !run.in_dictionary || self.guard.coal_over_populated(run.size))
    }

    fn absorb(&mut self, size: usize) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.in_dictionary {
            self.guard.coal_death(run.size);
            self.guard.remove_free_chunk(run.start);
            run.in_dictionary = false;
        }
        run.size += size;
        run.pieces += 1;
    }

    fn start(&mut self, start: ChunkRef, size: usize, in_dictionary: bool) {
        self.flush();
        self.run = Some(Run {
            start,
            size,
            pieces: 1,
            in_dictionary,
        });
    }

    fn dead_object(&mut self, chunk: ChunkRef, size: usize) {
        self.stats.freed += 1;
        if self.run_accepts_more() {
            self.absorb(size);
        } else {
            self.start(chunk, size, false);
        }
    }

    fn free_chunk(&mut self, chunk: ChunkRef, size: usize) {
        let mergeable =
            !chunk.cant_coalesce(self.guard.heap()) && self.guard.coal_over_populated(size);
        if mergeable && self.run_accepts_more() {
            self.guard.coal_death(size);
            self.guard.remove_free_chunk(chunk);
            self.absorb(size);
        } else {
            if !mergeable {
                self.stats.skipped += 1;
            }
            self.start(chunk, size, true);
        }
    }
}

/// Walk the region in address order, returning dead objects and folding
/// neighbouring free space together where the census allows it.
fn sweep(
    guard: &mut FreelistGuard<'_>,
    live: &BTreeMap<usize, usize>,
    dead: &mut BTreeMap<usize, usize>,
) -> SweepStats {
    let end = guard.heap().words();
    let mut word = guard.heap().first_word();
    let mut sweeper = Sweeper {
        guard,
        run: None,
        stats: SweepStats::default(),
    };

    while word < end {
        let Some(chunk) = ChunkRef::at_word(word) else {
            break;
        };
        if let Some(&size) = live.get(&word) {
            sweeper.flush();
            word += size;
        } else if let Some(size) = dead.remove(&word) {
            sweeper.dead_object(chunk, size);
            word += size;
        } else {
            let size = chunk.size(sweeper.guard.heap());
            assert!(
                chunk.is_free(sweeper.guard.heap()),
                "sweep lost track of the block at {word:#x}"
            );
            sweeper.free_chunk(chunk, size);
            word += size;
        }
    }
    sweeper.flush();
    debug_assert!(dead.is_empty(), "dead objects outside the region");
    sweeper.stats
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let policy = match cli.policy {
        Policy::Plain => PolicyKind::Plain,
        Policy::Adaptive => PolicyKind::Adaptive,
    };
    let space = FreeListSpace::new(SpaceCreateInfo {
        words: Some(cli.words),
        policy: Some(policy),
        verify_dictionary: Some(cli.verify),
        ..Default::default()
    });
    let settings = space.settings().clone();
    let min = BinaryTreeDictionary::min_size();
    let max_object = cli.max_object.max(min);

    let mut rng = Lcg(cli.seed);
    let mut live: BTreeMap<usize, usize> = BTreeMap::new();
    let mut last_sweep = Instant::now();
    let mut inter_sweep_estimate = 0.0f32;
    let mut intra_sweep_estimate = 0.0f32;

    for cycle in 0..cli.cycles {
        let mut guard = space.lock();

        let mut failed = 0;
        for _ in 0..cli.objects {
            let size = rng.between(min, max_object);
            match guard.allocate(size, Dither::AtLeast) {
                Some(chunk) => {
                    live.insert(chunk.word(), chunk.size(guard.heap()));
                }
                None => failed += 1,
            }
        }

        let mut dead = BTreeMap::new();
        live.retain(|&word, &mut size| {
            let survives = rng.chance(cli.survival);
            if !survives {
                dead.insert(word, size);
            }
            survives
        });

        let inter_sweep_current = last_sweep.elapsed().as_secs_f32();
        inter_sweep_estimate = if cycle == 0 {
            inter_sweep_current
        } else {
            0.5 * (inter_sweep_estimate + inter_sweep_current)
        };
        let started = Instant::now();
        guard.begin_sweep_census(
            settings.coal_surplus_percent,
            inter_sweep_current,
            inter_sweep_estimate,
            intra_sweep_estimate,
        );
        let stats = sweep(&mut guard, &live, &mut dead);
        guard.end_sweep_census(settings.split_surplus_percent);
        intra_sweep_estimate = started.elapsed().as_secs_f32();
        last_sweep = Instant::now();

        if cli.verify {
            guard.verify();
        }
        log::info!(
            "cycle {cycle}: {} live, {failed} failed, {stats:?}, {} free words in {} blocks, max {}, fragmentation {:.3}",
            live.len(),
            guard.total_free_words(),
            guard.free_blocks(),
            guard.max_chunk_size(),
            guard.fragmentation()
        );
    }

    let guard = space.lock();
    let mut report = String::new();
    if guard.report_statistics(&mut report).is_ok() && guard.print_census(&mut report).is_ok() {
        print!("{report}");
    }
}
