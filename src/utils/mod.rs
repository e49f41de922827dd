//! Utility modules for the scanner

pub mod target_parser;

pub use target_parser::{enumerate_targets, TargetEnumerator};
