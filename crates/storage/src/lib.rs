//! Transactional storage for experiment records, change history, isolation
//! groups and bucket ranges.
//!
//! [`HatchStorage`] is the backend seam. [`MemoryStorage`] is the bundled
//! backend; [`conformance`] holds the suite every backend must pass.

pub mod conformance;
mod error;
mod memory;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use traits::HatchStorage;
