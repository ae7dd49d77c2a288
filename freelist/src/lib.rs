mod chunk;
mod dictionary;
mod free_list;
mod policy;
mod region;
mod space;
mod stats;
mod system;
mod tree;

pub use chunk::{CHUNK_TAG_MASK, ChunkRef, ChunkTag, FREE_CHUNK_WORDS};
pub use dictionary::{BinaryTreeDictionary, ChunkOrigin, Dither, Order, TreeWalk};
pub use free_list::{FreeList, ListChunks, ListHeader};
pub use policy::{AdaptivePolicy, FreeListPolicy, PlainPolicy};
pub use region::{HEAP_WORD_SIZE, HeapRegion, RESERVED_WORDS};
pub use space::{FreeListSpace, FreelistGuard, PolicyKind, SpaceCreateInfo, SpaceSettings};
pub use stats::{
    AdaptiveFreeList, CensusStats, CurrentCount, DemandEstimator, DemandSample, Stat,
    print_census_labels, print_census_row,
};
pub use system::{OS_PAGE_SIZE, map_memory, unmap_memory};
pub use tree::{TREE_CHUNK_WORDS, TreeList};
