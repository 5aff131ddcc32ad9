//! ExtractionRunner: resolves a bank's required fields, drives batched
//! extraction and validates the cumulative result after every batch.
//!
//! Batches for one bank run strictly in order. Progress is published over a
//! channel as validated snapshots, never raw model output.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use super::batcher::FieldBatcher;
use crate::models::ExtractionPayload;
use crate::pipeline::field_extraction::{Attachment, ExtractionError, FieldExtractor, RawExtraction};
use crate::pipeline::validation::validate;
use crate::pipeline_config::ExtractionConfig;
use crate::registry::{clean_field_keys, RegistrySource};

/// Cooperative cancellation, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress events for one bank run, in emission order.
#[derive(Debug, Clone)]
pub enum ExtractionEvent {
    Started {
        run_id: Uuid,
        bank: String,
        total_batches: usize,
        required_fields: usize,
    },
    BatchCompleted {
        run_id: Uuid,
        bank: String,
        /// Zero-based; strictly increasing within a run.
        batch_index: usize,
        total_batches: usize,
        soft_failed: Vec<String>,
        /// Validated state over everything extracted so far.
        snapshot: ExtractionPayload,
    },
    Completed {
        run_id: Uuid,
        bank: String,
        missing: usize,
        duration_ms: u64,
    },
    Cancelled {
        run_id: Uuid,
        bank: String,
        completed_batches: usize,
    },
}

/// Orchestrates registry lookup, batched extraction and validation.
pub struct ExtractionRunner {
    registry: Arc<dyn RegistrySource>,
    extractor: FieldExtractor,
    config: ExtractionConfig,
}

impl ExtractionRunner {
    pub fn new(
        registry: Arc<dyn RegistrySource>,
        extractor: FieldExtractor,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            registry,
            extractor,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Run extraction for one bank and return its consolidated payload.
    ///
    /// An empty required-field list yields a payload with an error marker
    /// rather than an error. Registry failures and cancellation are the only
    /// run-level errors; per-field failures surface as flags.
    pub fn process(
        &self,
        bank: &str,
        document_text: &str,
        confidence_threshold: f64,
        attachments: &[Attachment],
        progress: Option<&Sender<ExtractionEvent>>,
        cancel: Option<&CancelFlag>,
    ) -> Result<ExtractionPayload, ExtractionError> {
        let span = tracing::info_span!("process_bank", bank = %bank);
        let _enter = span.enter();

        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let confidence_threshold = self.config.effective_threshold(confidence_threshold);
        let emit = |event: ExtractionEvent| {
            if let Some(tx) = progress {
                // A dropped receiver only means nobody is watching.
                let _ = tx.send(event);
            }
        };

        let required = clean_field_keys(self.registry.required_fields(bank)?);
        if required.is_empty() {
            tracing::warn!("No required fields resolved for bank");
            emit(ExtractionEvent::Completed {
                run_id,
                bank: bank.to_string(),
                missing: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
            return Ok(ExtractionPayload::without_required_fields(
                bank,
                confidence_threshold,
            ));
        }

        let batcher = FieldBatcher::new(&self.extractor, self.config.field_batch_size);
        let mut run = batcher.batches(bank, &required, document_text, attachments);
        let total_batches = run.total();

        tracing::info!(
            %run_id,
            required = required.len(),
            batches = total_batches,
            attachments = attachments.len(),
            "Starting extraction"
        );
        emit(ExtractionEvent::Started {
            run_id,
            bank: bank.to_string(),
            total_batches,
            required_fields: required.len(),
        });

        let mut extracted = RawExtraction::new();
        let mut completed_batches = 0;

        loop {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                tracing::info!(%run_id, completed_batches, "Extraction cancelled");
                emit(ExtractionEvent::Cancelled {
                    run_id,
                    bank: bank.to_string(),
                    completed_batches,
                });
                return Err(ExtractionError::Cancelled);
            }

            let Some(outcome) = run.next() else {
                break;
            };
            let outcome = outcome?;
            extracted.extend(outcome.results);
            completed_batches += 1;

            let snapshot = self.build_payload(bank, &required, &extracted, confidence_threshold);
            tracing::debug!(
                batch = outcome.index,
                total = outcome.total,
                soft_failed = outcome.soft_failed.len(),
                missing = snapshot.missing_fields.len(),
                "Batch validated"
            );
            emit(ExtractionEvent::BatchCompleted {
                run_id,
                bank: bank.to_string(),
                batch_index: outcome.index,
                total_batches: outcome.total,
                soft_failed: outcome.soft_failed,
                snapshot,
            });
        }

        let payload = self.build_payload(bank, &required, &extracted, confidence_threshold);
        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            %run_id,
            required = required.len(),
            missing = payload.missing_fields.len(),
            duration_ms,
            "Extraction complete"
        );
        emit(ExtractionEvent::Completed {
            run_id,
            bank: bank.to_string(),
            missing: payload.missing_fields.len(),
            duration_ms,
        });

        Ok(payload)
    }

    /// Process several banks against the same documents, one after another.
    ///
    /// Each bank's result is independent: a registry failure for one bank
    /// does not stop the others. Cancellation stops the remaining banks.
    pub fn process_banks(
        &self,
        banks: &[String],
        document_text: &str,
        confidence_threshold: f64,
        attachments: &[Attachment],
        progress: Option<&Sender<ExtractionEvent>>,
        cancel: Option<&CancelFlag>,
    ) -> BTreeMap<String, Result<ExtractionPayload, ExtractionError>> {
        let mut results = BTreeMap::new();
        for bank in banks {
            if results.contains_key(bank) {
                continue;
            }
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                results.insert(bank.clone(), Err(ExtractionError::Cancelled));
                continue;
            }
            let result = self.process(
                bank,
                document_text,
                confidence_threshold,
                attachments,
                progress,
                cancel,
            );
            if let Err(e) = &result {
                tracing::error!(bank = %bank, error = %e, "Bank extraction failed");
            }
            results.insert(bank.clone(), result);
        }
        results
    }

    fn build_payload(
        &self,
        bank: &str,
        required: &[String],
        extracted: &RawExtraction,
        confidence_threshold: f64,
    ) -> ExtractionPayload {
        let (missing, fields) = validate(extracted, required, confidence_threshold);
        ExtractionPayload::new(bank, required.to_vec(), confidence_threshold, fields, missing)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::models::FieldValue;
    use crate::pipeline::field_extraction::{GenerationRequest, LlmClient, MockLlmClient};
    use crate::registry::{BankRegistry, RegistryError};

    const REGISTRY_CSV: &str = "\
bank,bank_label,canonical_key,required
ADCB,Full Name,applicant.full_name,yes
ADCB,E-mail,applicant.email,yes
ADCB,Mobile,applicant.mobile,yes
ADCB,Nationality,,no
EmptyBank,Notes,nan,no
";

    fn registry() -> Arc<dyn RegistrySource> {
        Arc::new(BankRegistry::from_reader(REGISTRY_CSV.as_bytes()).unwrap())
    }

    fn runner(llm: Arc<dyn LlmClient>, batch_size: usize) -> ExtractionRunner {
        let config = ExtractionConfig {
            field_batch_size: batch_size,
            ..ExtractionConfig::default()
        };
        let extractor = FieldExtractor::new(llm, config.clone());
        ExtractionRunner::new(registry(), extractor, config)
    }

    const FULL_RESPONSE: &str = r#"{
        "applicant.full_name": {"value": "Jane Doe", "confidence": 0.95, "evidence": "Name: Jane Doe"},
        "applicant.email": {"value": "not-an-email", "confidence": 0.9, "evidence": "..."},
        "applicant.mobile": {"value": "+971 50 123 4567", "confidence": 0.4, "evidence": "Mob"}
    }"#;

    #[test]
    fn process_validates_full_payload() {
        let mock = Arc::new(MockLlmClient::new(FULL_RESPONSE));
        let payload = runner(mock.clone(), 12)
            .process("ADCB", "doc", 0.6, &[], None, None)
            .unwrap();

        assert_eq!(
            payload.required_fields,
            vec!["applicant.full_name", "applicant.email", "applicant.mobile"]
        );
        assert_eq!(payload.fields.len(), 3);
        assert_eq!(payload.missing_fields, vec!["applicant.email", "applicant.mobile"]);
        assert!(payload.fields["applicant.email"].flags.invalid_format);
        assert!(payload.fields["applicant.mobile"].flags.low_confidence);
        assert_eq!(
            payload.fields["applicant.full_name"].value,
            FieldValue::Text("Jane Doe".into())
        );
        assert!(payload.error.is_none());
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn non_finite_threshold_falls_back_to_default() {
        let mock = Arc::new(MockLlmClient::new(FULL_RESPONSE));
        let payload = runner(mock, 12)
            .process("ADCB", "doc", f64::NAN, &[], None, None)
            .unwrap();

        let default = ExtractionConfig::default().confidence_threshold_default;
        assert_eq!(payload.confidence_threshold, default);
        assert!(payload.fields["applicant.mobile"].flags.low_confidence);
        assert!(payload.missing_fields.contains(&"applicant.mobile".to_string()));
    }

    #[test]
    fn empty_registry_entry_yields_error_marker() {
        let mock = Arc::new(MockLlmClient::new("{}"));
        let payload = runner(mock.clone(), 12)
            .process("EmptyBank", "doc", 0.6, &[], None, None)
            .unwrap();

        assert!(payload.fields.is_empty());
        assert!(payload.missing_fields.is_empty());
        assert_eq!(payload.error.as_deref(), Some(crate::models::NO_REQUIRED_FIELDS_ERROR));
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn unknown_bank_also_yields_error_marker() {
        let mock = Arc::new(MockLlmClient::new("{}"));
        let payload = runner(mock, 12)
            .process("adcb", "doc", 0.6, &[], None, None)
            .unwrap();
        assert!(payload.error.is_some());
    }

    #[test]
    fn progress_snapshots_grow_monotonically() {
        let mock = Arc::new(MockLlmClient::new(FULL_RESPONSE));
        let (tx, rx) = mpsc::channel();

        let payload = runner(mock, 1)
            .process("ADCB", "doc", 0.6, &[], Some(&tx), None)
            .unwrap();
        drop(tx);
        let events: Vec<ExtractionEvent> = rx.iter().collect();

        assert!(matches!(events.first(), Some(ExtractionEvent::Started { total_batches: 3, .. })));
        assert!(matches!(events.last(), Some(ExtractionEvent::Completed { missing: 2, .. })));

        let snapshots: Vec<(usize, &ExtractionPayload)> = events
            .iter()
            .filter_map(|e| match e {
                ExtractionEvent::BatchCompleted { batch_index, snapshot, .. } => {
                    Some((*batch_index, snapshot))
                }
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);

        // Every snapshot covers all required fields; extracted coverage grows.
        let present: Vec<usize> = snapshots
            .iter()
            .map(|(_, s)| {
                assert_eq!(s.fields.len(), 3);
                s.fields.values().filter(|r| !r.flags.missing).count()
            })
            .collect();
        assert_eq!(present, vec![1, 2, 3]);
        assert_eq!(snapshots[2].1, &payload);
    }

    #[test]
    fn cancellation_is_checked_between_batches() {
        struct CancelAfterFirst {
            flag: CancelFlag,
        }
        impl LlmClient for CancelAfterFirst {
            fn generate(&self, _request: &GenerationRequest<'_>) -> Result<String, ExtractionError> {
                self.flag.cancel();
                Ok(FULL_RESPONSE.to_string())
            }
        }

        let flag = CancelFlag::new();
        let llm = Arc::new(CancelAfterFirst { flag: flag.clone() });
        let (tx, rx) = mpsc::channel();

        let err = runner(llm, 1)
            .process("ADCB", "doc", 0.6, &[], Some(&tx), Some(&flag))
            .unwrap_err();
        drop(tx);

        assert!(matches!(err, ExtractionError::Cancelled));
        let events: Vec<ExtractionEvent> = rx.iter().collect();
        assert!(matches!(
            events.last(),
            Some(ExtractionEvent::Cancelled { completed_batches: 1, .. })
        ));
    }

    #[test]
    fn dropped_receiver_does_not_fail_run() {
        let mock = Arc::new(MockLlmClient::new(FULL_RESPONSE));
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let payload = runner(mock, 1).process("ADCB", "doc", 0.6, &[], Some(&tx), None);
        assert!(payload.is_ok());
    }

    #[test]
    fn failing_backend_degrades_to_missing_fields() {
        let mock = Arc::new(MockLlmClient::scripted(vec![]));
        let payload = runner(mock, 12)
            .process("ADCB", "doc", 0.6, &[], None, None)
            .unwrap();

        assert_eq!(payload.missing_fields, payload.required_fields);
        assert!(payload.fields.values().all(|r| r.value.is_empty() && r.confidence == 0.0));
    }

    #[test]
    fn registry_failure_is_fatal() {
        struct Broken;
        impl RegistrySource for Broken {
            fn required_fields(&self, _bank: &str) -> Result<Vec<String>, RegistryError> {
                Err(RegistryError::LockPoisoned)
            }
        }

        let mock = Arc::new(MockLlmClient::new("{}"));
        let config = ExtractionConfig::default();
        let runner = ExtractionRunner::new(
            Arc::new(Broken),
            FieldExtractor::new(mock, config.clone()),
            config,
        );
        let err = runner.process("ADCB", "doc", 0.6, &[], None, None).unwrap_err();
        assert!(matches!(err, ExtractionError::Registry(_)));
    }

    #[test]
    fn process_banks_collects_each_bank() {
        let mock = Arc::new(MockLlmClient::new(FULL_RESPONSE));
        let banks = vec!["ADCB".to_string(), "EmptyBank".to_string(), "ADCB".to_string()];

        let results = runner(mock.clone(), 12).process_banks(&banks, "doc", 0.6, &[], None, None);

        assert_eq!(results.len(), 2);
        assert!(results["ADCB"].as_ref().unwrap().error.is_none());
        assert!(results["EmptyBank"].as_ref().unwrap().error.is_some());
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!flag.is_cancelled());
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
