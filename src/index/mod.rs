//! Index handles, the engine contract they sit on, and the filtered and
//! cluster-restricted search protocol.

pub mod distance;
pub mod handle;
pub mod reference;
pub mod search;
pub mod traits;

pub use handle::{AnyIndex, BinaryIndex, FloatIndex, Index};
pub use traits::{Component, IvfFacet, NativeIndex, VectorEngine, VectorTransform};
