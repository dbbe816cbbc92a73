//! Portfolio construction.

mod allocator;

pub use allocator::{Allocator, TargetWeights};
