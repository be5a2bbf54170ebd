//! Static, immutable, mmap-friendly maps with prefix-sharded pages.

mod map;
mod multimap;

pub use map::{Map, MapWriter, TAIL_LEN};
pub use multimap::{Inliner, MultiMap, MultiMapWriter};
