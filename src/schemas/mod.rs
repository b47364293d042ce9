//! Shared Schemas for the Contact Harvester
//!
//! All persisted structs use `serde(rename_all = "camelCase")` so the
//! stored documents stay readable by the campaign tooling.

pub mod contact;
pub mod progress;
pub mod stats;
pub mod summary;

pub use contact::*;
pub use progress::*;
pub use stats::*;
pub use summary::*;
