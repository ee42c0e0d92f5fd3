//! Download Engine - the heart of RDM
//!
//! This module implements a resumable single-stream download engine with:
//! - Byte-range resume guarded by the server's ETag
//! - In-run redirect handling and retry classification
//! - One worker per task, steered through a shared control flag
//! - A single-consumer event channel that persists before notifying

mod connectivity;
mod disk;
mod events;
mod executor;
mod observer;
mod persistence;
mod registry;
mod response;

pub use connectivity::*;
pub use events::*;
pub use executor::*;
pub use observer::*;
pub use persistence::*;
pub use registry::*;
pub use response::sanitize_mime_type;
