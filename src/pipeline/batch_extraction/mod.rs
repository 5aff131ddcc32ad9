//! Batched field extraction for one bank.
//!
//! ```text
//! registry → required fields → FieldBatcher (bisect on failure) → FieldExtractor
//!                                     ↓ per batch
//!                         validate cumulative → ExtractionEvent
//! ```

pub mod batcher;
pub mod runner;

pub use batcher::{partition, soft_fail_entry, BatchOutcome, BatchRun, FieldBatcher};
pub use runner::{CancelFlag, ExtractionEvent, ExtractionRunner};
