//! Reading structured data out of model replies.
//!
//! Models are asked for JSON, but the same logical answer arrives in
//! several shapes: a `{"data": [{"Field", "Value"}]}` record list, a flat
//! object, an object nested under a section heading (`general_information`,
//! `GENERAL INFORMATION`), sometimes wrapped in a ```json fence or preceded
//! by a sentence of prose. The parsers here try the strict shape first, fall
//! back to key heuristics, and report what they did through
//! [`ExtractionOutcome`] rather than guessing silently.

use crate::error::TaskError;
use crate::output::{ExtractionOutcome, FieldList, IdentifierPair};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n(.*?)\n?```\s*$").unwrap());

static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

static RE_LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+?)\s*$").unwrap());

/// Strip one surrounding Markdown code fence, if present.
pub fn strip_code_fences(input: &str) -> &str {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

/// First run of ASCII digits in `text`.
///
/// `"12345 / 2020-01-01"` → `Some("12345")`.
pub fn extract_number(text: &str) -> Option<String> {
    RE_DIGITS.find(text).map(|m| m.as_str().to_string())
}

/// Parse a reply as JSON, tolerating fences and surrounding prose.
pub fn parse_json(text: &str) -> Result<Value, String> {
    let body = strip_code_fences(text);
    match serde_json::from_str(body) {
        Ok(v) => Ok(v),
        Err(first) => embedded_json(body).ok_or_else(|| first.to_string()),
    }
}

/// The outermost `{…}` or `[…]` span that parses on its own.
fn embedded_json(text: &str) -> Option<Value> {
    [('{', '}'), ('[', ']')].iter().find_map(|&(open, close)| {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    })
}

/// Identify the commercial-register and industrial-license numbers in the
/// identifier page's reply.
pub fn parse_identifiers(text: &str) -> ExtractionOutcome {
    let value = match parse_json(text) {
        Ok(v) => v,
        Err(e) => return ExtractionOutcome::failed(format!("not JSON: {e}")),
    };
    let Some(object) = value.as_object() else {
        return ExtractionOutcome::failed("reply is not a JSON object");
    };
    if object.is_empty() {
        return ExtractionOutcome::failed("reply has no fields");
    }

    if let Some(identifiers) = strict_identifiers(object) {
        return ExtractionOutcome::Structured { identifiers };
    }

    let identifiers = heuristic_identifiers(object);
    if identifiers.is_empty() {
        ExtractionOutcome::failed("no commercial register or industrial license field in reply")
    } else {
        ExtractionOutcome::HeuristicMatch { identifiers }
    }
}

/// `{"data": [{"Field": "Commercial Register No.", "Value": "…"}]}`
fn strict_identifiers(object: &Map<String, Value>) -> Option<IdentifierPair> {
    let records = object.get("data")?.as_array()?;
    let mut pair = IdentifierPair::default();
    for record in records {
        let (Some(field), Some(value)) = (
            record.get("Field").and_then(Value::as_str),
            record.get("Value").and_then(scalar_text),
        ) else {
            continue;
        };
        let field = field.to_lowercase();
        if pair.commercial_register.is_none() && field.contains("commercial") {
            pair.commercial_register = extract_number(&value);
        } else if pair.industrial_license.is_none() && field.starts_with("industrial") {
            pair.industrial_license = extract_number(&value);
        }
    }
    (!pair.is_empty()).then_some(pair)
}

/// Substring scan of top-level keys, then of keys one object deeper.
/// A later matching key replaces an earlier one, so a section such as
/// `general_information` has the last word over loose top-level keys.
fn heuristic_identifiers(object: &Map<String, Value>) -> IdentifierPair {
    let mut pair = IdentifierPair::default();
    scan_keys(object, &mut pair);
    for nested in object.values().filter_map(Value::as_object) {
        scan_keys(nested, &mut pair);
    }
    pair
}

fn scan_keys(object: &Map<String, Value>, pair: &mut IdentifierPair) {
    for (key, value) in object {
        let Some(text) = scalar_text(value) else { continue };
        let key = key.to_lowercase();
        if key.contains("commercial") {
            pair.commercial_register = extract_number(&text);
        }
        if key.contains("industr") {
            pair.industrial_license = extract_number(&text);
        }
    }
}

/// Strings as-is, numbers in their JSON spelling; anything else is not a value.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a consolidated field report (missing or inconsistent fields).
///
/// Accepted shapes, in order: a JSON array (of strings, or of objects with a
/// field/name entry), a JSON object holding such an array, a JSON object
/// whose keys are the field names, or plain bullet / numbered lines.
pub fn parse_field_list(text: &str, task: &str) -> Result<FieldList, TaskError> {
    let raw = text.trim().to_string();

    if let Ok(value) = parse_json(text) {
        if let Some(fields) = fields_from_json(&value) {
            return Ok(FieldList { raw, fields });
        }
    }

    let fields: Vec<String> = strip_code_fences(text)
        .lines()
        .filter_map(|line| RE_LIST_ITEM.captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    if !fields.is_empty() {
        return Ok(FieldList { raw, fields });
    }

    Err(TaskError::Parse {
        task: task.to_string(),
        detail: format!("expected a JSON list of fields, got: {}", preview(&raw)),
    })
}

fn fields_from_json(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(items.iter().filter_map(field_name).collect()),
        Value::Object(map) => {
            if let Some(inner) = map.values().find(|v| v.is_array()) {
                return fields_from_json(inner);
            }
            Some(map.keys().cloned().collect())
        }
        _ => None,
    }
}

fn field_name(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Object(map) => {
            let by_key = map.iter().find_map(|(k, v)| {
                let k = k.to_lowercase();
                (k == "field" || k == "field_name" || k == "name")
                    .then(|| v.as_str())
                    .flatten()
            });
            by_key
                .or_else(|| map.values().find_map(Value::as_str))
                .map(str::to_string)
        }
        _ => None,
    }
}

/// Look up `label` in a supporting document's JSON reply.
///
/// The label is matched exactly at the top level, then inside nested
/// objects, then among `{"Field", "Value"}` records under `data`.
pub fn parse_supporting_value(text: &str, label: &str) -> Result<String, TaskError> {
    let parse_error = |detail: String| TaskError::Parse {
        task: label.to_string(),
        detail,
    };
    let value = parse_json(text).map_err(|e| parse_error(format!("not JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| parse_error("reply is not a JSON object".into()))?;

    let found = object
        .get(label)
        .and_then(scalar_text)
        .or_else(|| {
            object
                .values()
                .filter_map(Value::as_object)
                .find_map(|nested| nested.get(label).and_then(scalar_text))
        })
        .or_else(|| {
            object
                .get("data")
                .and_then(Value::as_array)?
                .iter()
                .find(|r| r.get("Field").and_then(Value::as_str) == Some(label))
                .and_then(|r| r.get("Value"))
                .and_then(scalar_text)
        });

    found.ok_or_else(|| parse_error(format!("no '{label}' field in reply")))
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n[]\n```\n"), "[]");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_number() {
        assert_eq!(extract_number("12345 / 2020-01-01").as_deref(), Some("12345"));
        assert_eq!(extract_number("CR No. 1010-555"), Some("1010".into()));
        assert_eq!(extract_number("no digits here"), None);
        assert_eq!(extract_number(""), None);
    }

    #[test]
    fn json_inside_prose() {
        let v = parse_json("Here is the result:\n{\"x\": \"1\"}\nThanks").unwrap();
        assert_eq!(v["x"], "1");
        assert!(parse_json("nothing here").is_err());
    }

    #[test]
    fn identifiers_from_record_list() {
        let reply = r#"{"data": [
            {"Field": "Company Name", "Value": "Acme"},
            {"Field": "Commercial Register No.", "Value": "1010123456 / 1440-01-01"},
            {"Field": "Industrial License No.", "Value": "421102"}
        ]}"#;
        match parse_identifiers(reply) {
            ExtractionOutcome::Structured { identifiers } => {
                assert_eq!(identifiers.commercial_register.as_deref(), Some("1010123456"));
                assert_eq!(identifiers.industrial_license.as_deref(), Some("421102"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn identifiers_from_nested_section() {
        let reply = r#"```json
        {"GENERAL INFORMATION": {
            "Commercial Registration Number": "CR 2050001234",
            "Industry License": 998877
        }}
        ```"#;
        match parse_identifiers(reply) {
            ExtractionOutcome::HeuristicMatch { identifiers } => {
                assert_eq!(identifiers.commercial_register.as_deref(), Some("2050001234"));
                assert_eq!(identifiers.industrial_license.as_deref(), Some("998877"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn last_matching_key_wins() {
        let reply = r#"{"general_information": {
            "Commercial Register No. and date": "1010123456 / 1440-01-01",
            "Industrial license no. and date": "421102",
            "Commercial activity license": "7788",
            "Industry classification": "C23"
        }}"#;
        let outcome = parse_identifiers(reply);
        assert!(matches!(outcome, ExtractionOutcome::HeuristicMatch { .. }));
        assert_eq!(
            outcome.identifier(crate::output::IdentifierKind::CommercialRegister),
            Some("7788")
        );
        assert_eq!(
            outcome.identifier(crate::output::IdentifierKind::IndustrialLicense),
            Some("23")
        );
    }

    #[test]
    fn identifiers_from_flat_object() {
        let outcome = parse_identifiers(r#"{"commercial_register": "55", "other": "x"}"#);
        assert_eq!(
            outcome.identifiers().and_then(|p| p.commercial_register.as_deref()),
            Some("55")
        );
        assert_eq!(
            outcome.identifier(crate::output::IdentifierKind::IndustrialLicense),
            None
        );
    }

    #[test]
    fn identifiers_fail_on_non_json() {
        for reply in [
            "I could not read the page.",
            "[1, 2]",
            "{}",
            r#"{"applicant": "Acme"}"#,
        ] {
            assert!(
                matches!(parse_identifiers(reply), ExtractionOutcome::Failed { .. }),
                "{reply}"
            );
        }
    }

    #[test]
    fn field_list_shapes() {
        let list = parse_field_list(r#"["Applicant signature", "Date"]"#, "missing").unwrap();
        assert_eq!(list.fields, vec!["Applicant signature", "Date"]);

        let list = parse_field_list(
            r#"{"missing_fields": [{"field": "Guarantor"}, {"name": "Stamp"}]}"#,
            "missing",
        )
        .unwrap();
        assert_eq!(list.fields, vec!["Guarantor", "Stamp"]);

        let list = parse_field_list("[]", "inconsistent").unwrap();
        assert!(list.fields.is_empty());
        assert_eq!(list.raw, "[]");

        let list = parse_field_list("- Loan amount\n2. Tenor\n• Bank name", "missing").unwrap();
        assert_eq!(list.fields, vec!["Loan amount", "Tenor", "Bank name"]);
    }

    #[test]
    fn field_list_rejects_prose() {
        let err = parse_field_list("The document looks fine to me.", "inconsistent").unwrap_err();
        assert!(matches!(err, TaskError::Parse { ref task, .. } if task == "inconsistent"));
    }

    #[test]
    fn supporting_value_lookup() {
        let label = "رقم القرار";
        assert_eq!(
            parse_supporting_value(r#"{"رقم القرار": "421102"}"#, label).unwrap(),
            "421102"
        );
        assert_eq!(
            parse_supporting_value(r#"{"license": {"رقم القرار": 421102}}"#, label).unwrap(),
            "421102"
        );
        assert_eq!(
            parse_supporting_value(
                r#"{"data": [{"Field": "رقم القرار", "Value": "421102"}]}"#,
                label
            )
            .unwrap(),
            "421102"
        );
    }

    #[test]
    fn supporting_value_keeps_raw_text() {
        // no digit extraction on this side
        assert_eq!(
            parse_supporting_value(r#"{"رقم المنشأة": "1010-123"}"#, "رقم المنشأة").unwrap(),
            "1010-123"
        );
        assert_eq!(
            parse_supporting_value(r#"{"رقم المنشأة": " 1010123 "}"#, "رقم المنشأة").unwrap(),
            " 1010123 "
        );
    }

    #[test]
    fn supporting_value_errors() {
        assert!(matches!(
            parse_supporting_value("not json", "رقم المنشأة"),
            Err(TaskError::Parse { .. })
        ));
        assert!(matches!(
            parse_supporting_value(r#"{"other": "1"}"#, "رقم المنشأة"),
            Err(TaskError::Parse { .. })
        ));
    }
}
