//! Field batching with bisection on failure.
//!
//! The required-field list is cut into consecutive batches. A batch that
//! fails (transport error or unparseable output) is split in half and each
//! half retried, down to single fields, which soft-fail to an empty record.
//! One bad field never aborts the rest of the run.

use serde_json::Value;

use crate::models::FieldRecord;
use crate::pipeline::field_extraction::{Attachment, ExtractionError, FieldExtractor, RawExtraction};

/// Split `fields` into consecutive chunks of at most `size` keys.
pub fn partition(fields: &[String], size: usize) -> Vec<Vec<String>> {
    fields.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}

/// Raw entry recorded for a field whose extraction could not be recovered.
pub fn soft_fail_entry() -> Value {
    FieldRecord::empty().to_raw()
}

/// Result of one top-level batch, bisection included.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Zero-based position of this batch.
    pub index: usize,
    pub total: usize,
    pub fields: Vec<String>,
    pub results: RawExtraction,
    /// Fields that could not be extracted even on their own.
    pub soft_failed: Vec<String>,
}

/// Drives a [`FieldExtractor`] over a field list in bounded batches.
pub struct FieldBatcher<'a> {
    extractor: &'a FieldExtractor,
    batch_size: usize,
}

impl<'a> FieldBatcher<'a> {
    pub fn new(extractor: &'a FieldExtractor, batch_size: usize) -> Self {
        Self {
            extractor,
            batch_size: batch_size.max(1),
        }
    }

    /// Lazily extract each top-level batch, in order.
    pub fn batches<'r>(
        &'r self,
        bank: &'r str,
        fields: &[String],
        document_text: &'r str,
        attachments: &'r [Attachment],
    ) -> BatchRun<'r> {
        let pending = partition(fields, self.batch_size);
        BatchRun {
            extractor: self.extractor,
            bank,
            document_text,
            attachments,
            total: pending.len(),
            pending: pending.into_iter().enumerate(),
            failed: false,
        }
    }

    /// Extract every field, merging all batch results into one map.
    pub fn extract_all(
        &self,
        bank: &str,
        fields: &[String],
        document_text: &str,
        attachments: &[Attachment],
    ) -> Result<RawExtraction, ExtractionError> {
        let mut merged = RawExtraction::new();
        for outcome in self.batches(bank, fields, document_text, attachments) {
            merged.extend(outcome?.results);
        }
        Ok(merged)
    }
}

/// Iterator over top-level batches. Stops after the first fatal error.
pub struct BatchRun<'a> {
    extractor: &'a FieldExtractor,
    bank: &'a str,
    document_text: &'a str,
    attachments: &'a [Attachment],
    total: usize,
    pending: std::iter::Enumerate<std::vec::IntoIter<Vec<String>>>,
    failed: bool,
}

impl BatchRun<'_> {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Extract one batch, bisecting failed chunks with an explicit work-list.
    /// The left half is always processed before the right half.
    fn run_batch(&self, index: usize, batch: Vec<String>) -> Result<BatchOutcome, ExtractionError> {
        let mut results = RawExtraction::new();
        let mut soft_failed = Vec::new();
        let mut work = vec![batch.clone()];

        while let Some(chunk) = work.pop() {
            match self
                .extractor
                .extract(self.bank, &chunk, self.document_text, self.attachments)
            {
                Ok(map) => results.extend(map),
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) if chunk.len() > 1 => {
                    let mid = (chunk.len() / 2).max(1);
                    tracing::warn!(
                        bank = %self.bank,
                        batch = index,
                        size = chunk.len(),
                        error = %e,
                        "Batch extraction failed, bisecting"
                    );
                    let (left, right) = chunk.split_at(mid);
                    work.push(right.to_vec());
                    work.push(left.to_vec());
                }
                Err(e) => {
                    for key in chunk {
                        tracing::warn!(
                            bank = %self.bank,
                            batch = index,
                            field = %key,
                            error = %e,
                            "Field extraction failed, recording empty value"
                        );
                        results.insert(key.clone(), soft_fail_entry());
                        soft_failed.push(key);
                    }
                }
            }
        }

        Ok(BatchOutcome {
            index,
            total: self.total,
            fields: batch,
            results,
            soft_failed,
        })
    }
}

impl Iterator for BatchRun<'_> {
    type Item = Result<BatchOutcome, ExtractionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (index, batch) = self.pending.next()?;
        tracing::debug!(
            bank = %self.bank,
            batch = index,
            total = self.total,
            size = batch.len(),
            "Extracting batch"
        );
        let outcome = self.run_batch(index, batch);
        self.failed = outcome.is_err();
        Some(outcome)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.failed { 0 } else { self.pending.len() };
        (0, Some(remaining))
    }
}
