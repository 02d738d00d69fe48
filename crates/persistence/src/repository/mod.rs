//! Repository implementations for database operations

pub mod bars;
pub mod quotes;
pub mod snapshots;

pub use bars::*;
pub use quotes::*;
pub use snapshots::*;
