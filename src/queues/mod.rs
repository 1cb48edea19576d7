//! Batch processing.

pub mod scan;
pub mod work;
