//! Causal history traversal and state merging
//!
//! Nodes are opaque identifiers; the graph structure is supplied as
//! successor and predecessor functions, and `le(a, b)` answers whether `a`
//! is an ancestor of (or equal to) `b`.

mod errors;
mod iter;
mod merge;

pub use errors::{GraphError, GraphResult};
pub use iter::{bf_iterator, bf_topo_iterator, BfIterator, BfTopoIterator};
pub use merge::{invert_successor_map, Merger};
