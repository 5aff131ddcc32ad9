use std::sync::Arc;

use super::parser::parse_extraction_response;
use super::prompt::{build_extraction_prompt, build_repair_prompt, trim_document};
use super::types::{Attachment, GenerationRequest, LlmClient, RawExtraction};
use super::ExtractionError;
use crate::pipeline_config::ExtractionConfig;

/// Calls the model for one batch of fields and recovers a JSON object from
/// its answer: prompt → model → parse, with a single repair call when the
/// first answer cannot be parsed.
#[derive(Clone)]
pub struct FieldExtractor {
    llm: Arc<dyn LlmClient>,
    config: ExtractionConfig,
}

impl FieldExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, config: ExtractionConfig) -> Self {
        Self {
            llm,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract `fields` for `bank` from the document text and attachments.
    ///
    /// The result only contains requested keys; keys the model omitted are
    /// simply absent and left for the validator to fill.
    pub fn extract(
        &self,
        bank: &str,
        fields: &[String],
        document_text: &str,
        attachments: &[Attachment],
    ) -> Result<RawExtraction, ExtractionError> {
        let documents = trim_document(document_text, self.config.max_document_chars);
        let prompt = build_extraction_prompt(bank, fields, &documents);

        let response = self.call(&prompt, attachments)?;
        let parsed = match parse_extraction_response(&response) {
            Ok(map) => map,
            Err(first_error) => {
                tracing::warn!(
                    bank = %bank,
                    fields = fields.len(),
                    error = %first_error,
                    "Model output not parseable, requesting repair"
                );
                let repair_prompt =
                    build_repair_prompt(&response, fields, self.config.max_document_chars);
                let repaired = self.call(&repair_prompt, &[])?;
                parse_extraction_response(&repaired)?
            }
        };

        Ok(retain_requested(parsed, fields))
    }

    fn call(&self, prompt: &str, attachments: &[Attachment]) -> Result<String, ExtractionError> {
        let request = GenerationRequest {
            model: &self.config.model_id,
            prompt,
            attachments,
            temperature: 0.0,
            max_output_tokens: self.config.max_output_tokens,
            json_mode: true,
        };
        self.llm.generate(&request)
    }
}

fn retain_requested(mut parsed: RawExtraction, fields: &[String]) -> RawExtraction {
    let before = parsed.len();
    parsed.retain(|key, _| fields.iter().any(|f| f == key));
    let dropped = before - parsed.len();
    if dropped > 0 {
        tracing::debug!(dropped, "Ignoring keys outside the requested batch");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::field_extraction::MockLlmClient;

    fn fields() -> Vec<String> {
        vec!["applicant.full_name".into(), "applicant.email".into()]
    }

    fn extractor(mock: &Arc<MockLlmClient>) -> FieldExtractor {
        FieldExtractor::new(mock.clone(), ExtractionConfig::default())
    }

    const GOOD: &str = r#"{
        "applicant.full_name": {"value": "Jane Doe", "confidence": 0.95, "evidence": "Name: Jane Doe"},
        "applicant.email": {"value": "jane@doe.com", "confidence": 0.9, "evidence": "Email"}
    }"#;

    #[test]
    fn single_call_when_output_parses() {
        let mock = Arc::new(MockLlmClient::new(GOOD));
        let result = extractor(&mock)
            .extract("ADCB", &fields(), "Name: Jane Doe", &[])
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result["applicant.full_name"]["value"], "Jane Doe");
        assert_eq!(mock.call_count(), 1);
        assert!(mock.prompts()[0].contains("bank: \"ADCB\""));
    }

    #[test]
    fn commentary_wrapped_output_needs_no_repair() {
        let wrapped = format!("Here you go:\n```json\n{GOOD}\n```\nLet me know!");
        let mock = Arc::new(MockLlmClient::new(&wrapped));
        let result = extractor(&mock).extract("ADCB", &fields(), "doc", &[]).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn repair_call_recovers_malformed_output() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok("{\"applicant.full_name\": {\"value\": \"Jane".into()),
            Ok(GOOD.into()),
        ]));
        let attachments = vec![Attachment::new("eid.pdf", b"%PDF".to_vec())];
        let result = extractor(&mock)
            .extract("ADCB", &fields(), "doc", &attachments)
            .unwrap();

        assert_eq!(result["applicant.email"]["value"], "jane@doe.com");
        assert_eq!(mock.call_count(), 2);
        assert!(mock.prompts()[1].contains("STRICT JSON"));
        assert_eq!(mock.attachment_counts(), vec![1, 0]);
    }

    #[test]
    fn second_malformed_output_fails() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok("not json".into()),
            Ok("still not json".into()),
            Ok(GOOD.into()),
        ]));
        let err = extractor(&mock).extract("ADCB", &fields(), "doc", &[]).unwrap_err();

        assert!(err.is_malformed());
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn transport_error_propagates_without_repair() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Err(
            ExtractionError::Connection("https://example.test".into()),
        )]));
        let err = extractor(&mock).extract("ADCB", &fields(), "doc", &[]).unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn unrequested_keys_are_dropped() {
        let mock = Arc::new(MockLlmClient::new(
            r#"{"applicant.full_name": {"value": "Jane"}, "property.value": {"value": 1}}"#,
        ));
        let result = extractor(&mock).extract("ADCB", &fields(), "doc", &[]).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("applicant.full_name"));
    }

    #[test]
    fn long_documents_are_trimmed_in_prompt() {
        let mock = Arc::new(MockLlmClient::new(GOOD));
        let config = ExtractionConfig {
            max_document_chars: 40,
            ..ExtractionConfig::default()
        };
        let extractor = FieldExtractor::new(mock.clone(), config);
        extractor
            .extract("ADCB", &fields(), &"x".repeat(500), &[])
            .unwrap();
        assert!(mock.prompts()[0].contains("--- TRUNCATED ---"));
    }
}
