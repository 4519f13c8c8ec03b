//! Pure, deterministic logic with no I/O.

pub mod order;
pub mod taskid;
pub mod types;
