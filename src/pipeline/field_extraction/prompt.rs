/// Marker inserted where over-long document text was cut.
pub const TRUNCATION_MARKER: &str = "\n\n--- TRUNCATED ---\n\n";

const EXTRACTION_RULES: &str = r#"Return ONLY valid JSON (no markdown, no explanations).
The JSON must be a single object where keys EXACTLY match the provided field names.
Return ONLY the requested keys.

For each field value, return an object:
- "value": string | number | boolean | null
- "confidence": number between 0 and 1
- "evidence": a short snippet from the documents, or null

Rules:
- Do not invent values. Never guess.
- If a field is not found, use "value": null and "confidence": 0.
- Numbers must be numeric (no commas, no currency symbols).
- Do not include trailing commas."#;

/// Cut document text to `max_chars`, keeping the first 75% and the last 25%.
pub fn trim_document(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let head_len = max_chars * 3 / 4;
    let tail_len = max_chars / 4;
    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(total - tail_len).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// Build the structured extraction prompt for one batch of fields.
pub fn build_extraction_prompt(bank: &str, fields: &[String], documents: &str) -> String {
    let field_list = serde_json::to_string_pretty(fields).unwrap_or_else(|_| "[]".to_string());

    format!(
        r#"You are a mortgage operations assistant.

Extract ONLY the requested fields for bank: "{bank}" from the DOCUMENTS and any attached files.

{EXTRACTION_RULES}

FIELDS:
{field_list}

DOCUMENTS:
{documents}
"#
    )
    .trim()
    .to_string()
}

/// Build the follow-up prompt asking the model to repair its own output.
pub fn build_repair_prompt(invalid_output: &str, fields: &[String], max_chars: usize) -> String {
    let field_list = serde_json::to_string(fields).unwrap_or_else(|_| "[]".to_string());
    let invalid = trim_document(invalid_output, max_chars);

    format!(
        r#"The following output was supposed to be a single valid JSON object but could not be parsed.

Repair it into STRICT JSON. Keep only these keys: {field_list}
Each key maps to an object with "value", "confidence" and "evidence".
Do not add new values. Return ONLY the JSON object.

INVALID OUTPUT:
{invalid}
"#
    )
    .trim()
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<String> {
        vec!["applicant.full_name".into(), "applicant.email".into()]
    }

    #[test]
    fn prompt_lists_bank_fields_and_documents() {
        let prompt = build_extraction_prompt("ADCB", &fields(), "### FILE: eid.pdf\nJane Doe");
        assert!(prompt.contains("bank: \"ADCB\""));
        assert!(prompt.contains("\"applicant.email\""));
        assert!(prompt.contains("Jane Doe"));
        assert!(prompt.contains("Do not invent values"));
        assert!(prompt.contains("\"confidence\": 0"));
    }

    #[test]
    fn short_documents_are_untouched() {
        assert_eq!(trim_document("  hello  ", 100), "hello");
    }

    #[test]
    fn long_documents_keep_head_and_tail() {
        let text = format!("{}{}", "a".repeat(900), "z".repeat(100));
        let trimmed = trim_document(&text, 100);
        assert!(trimmed.starts_with(&"a".repeat(75)));
        assert!(trimmed.ends_with(&"z".repeat(25)));
        assert!(trimmed.contains("--- TRUNCATED ---"));
    }

    #[test]
    fn trimming_respects_char_boundaries() {
        let text = "é".repeat(50);
        let trimmed = trim_document(&text, 10);
        assert!(trimmed.starts_with(&"é".repeat(7)));
        assert!(trimmed.ends_with("éé"));
    }

    #[test]
    fn repair_prompt_embeds_invalid_output() {
        let prompt = build_repair_prompt("{\"a\": {\"value\": 1,}", &fields(), 1000);
        assert!(prompt.contains("STRICT JSON"));
        assert!(prompt.contains("{\"a\": {\"value\": 1,}"));
        assert!(prompt.contains("applicant.full_name"));
    }
}
