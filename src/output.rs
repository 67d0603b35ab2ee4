//! Result and report types.
//!
//! Every field a caller can look at has an explicit "absent" form
//! ([`FieldStatus::Unavailable`], [`ExtractionOutcome::Failed`],
//! [`ReconciliationVerdict::Unavailable`]) so a partially failed run still
//! renders a complete report.

use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A page or upload ready for the model: base64 payload plus media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: String,
    pub media_type: String,
}

/// Which registration number an identifier is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    CommercialRegister,
    IndustrialLicense,
}

impl IdentifierKind {
    pub fn label(&self) -> &'static str {
        match self {
            IdentifierKind::CommercialRegister => "Commercial Registration",
            IdentifierKind::IndustrialLicense => "Industry License",
        }
    }
}

/// Identifier values pulled from one document, each digits-only or absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierPair {
    pub commercial_register: Option<String>,
    pub industrial_license: Option<String>,
}

impl IdentifierPair {
    pub fn get(&self, kind: IdentifierKind) -> Option<&str> {
        match kind {
            IdentifierKind::CommercialRegister => self.commercial_register.as_deref(),
            IdentifierKind::IndustrialLicense => self.industrial_license.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commercial_register.is_none() && self.industrial_license.is_none()
    }
}

/// How the identifier page's model output was understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    /// The output matched the `{"data": [{"Field", "Value"}]}` schema.
    Structured { identifiers: IdentifierPair },
    /// The output was a JSON object whose keys were scanned by substring.
    HeuristicMatch { identifiers: IdentifierPair },
    /// Nothing usable; both identifiers are absent.
    Failed { reason: String },
}

impl ExtractionOutcome {
    pub fn identifiers(&self) -> Option<&IdentifierPair> {
        match self {
            ExtractionOutcome::Structured { identifiers }
            | ExtractionOutcome::HeuristicMatch { identifiers } => Some(identifiers),
            ExtractionOutcome::Failed { .. } => None,
        }
    }

    pub fn identifier(&self, kind: IdentifierKind) -> Option<&str> {
        self.identifiers().and_then(|p| p.get(kind))
    }

    pub fn failed(reason: impl fmt::Display) -> Self {
        ExtractionOutcome::Failed {
            reason: reason.to_string(),
        }
    }
}

/// A value that may be missing or invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldStatus<T> {
    Available { value: T },
    Unavailable { reason: TaskError },
}

impl<T> FieldStatus<T> {
    pub fn available(value: T) -> Self {
        FieldStatus::Available { value }
    }

    pub fn unavailable(reason: TaskError) -> Self {
        FieldStatus::Unavailable { reason }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            FieldStatus::Available { value } => Some(value),
            FieldStatus::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, FieldStatus::Available { .. })
    }
}

impl<T> From<Result<T, TaskError>> for FieldStatus<T> {
    fn from(r: Result<T, TaskError>) -> Self {
        match r {
            Ok(value) => FieldStatus::Available { value },
            Err(reason) => FieldStatus::Unavailable { reason },
        }
    }
}

/// A consolidated model report: the raw text plus whatever field names
/// could be read out of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldList {
    pub raw: String,
    pub fields: Vec<String>,
}

/// Raw model output for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageExtraction {
    /// 1-indexed page number.
    pub page_num: usize,
    /// Raw model text. Empty when `error` is set.
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
    pub error: Option<TaskError>,
}

impl PageExtraction {
    pub fn failed(page_num: usize, error: TaskError) -> Self {
        Self {
            page_num,
            text: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Blank-field detection: per-page raw data and the consolidated list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingFieldsReport {
    pub pages: Vec<PageExtraction>,
    pub missing_data: FieldStatus<FieldList>,
}

/// Token accounting across every call of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn record(&mut self, input_tokens: usize, output_tokens: usize) {
        self.calls += 1;
        self.input_tokens += input_tokens as u64;
        self.output_tokens += output_tokens as u64;
    }

    pub fn merge(&mut self, other: TokenUsage) {
        self.calls += other.calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Everything extracted from the loan application itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedResult {
    pub page_count: usize,
    pub identifiers: ExtractionOutcome,
    pub missing: MissingFieldsReport,
    pub inconsistencies: FieldStatus<FieldList>,
    pub usage: TokenUsage,
}

/// Outcome of comparing one identifier across two documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationVerdict {
    Matched,
    Mismatched,
    Unavailable,
}

/// One identifier cross-check, with both sides as they were compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierCheck {
    pub kind: IdentifierKind,
    pub verdict: ReconciliationVerdict,
    pub primary: Option<String>,
    pub supporting: Option<String>,
}

/// Run-level statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeStats {
    pub total_duration_ms: u64,
    pub usage: TokenUsage,
}

/// The final user-facing report of one intake run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeReport {
    pub document_name: String,
    /// Present when the loan application could be processed at all.
    pub document: Option<CombinedResult>,
    /// Why the loan application could not be processed.
    pub document_error: Option<String>,
    pub missing_fields: FieldStatus<FieldList>,
    pub inconsistent_fields: FieldStatus<FieldList>,
    pub industry_license: IdentifierCheck,
    pub commercial_registration: IdentifierCheck,
    pub stats: IntakeStats,
}

impl fmt::Display for IntakeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref err) = self.document_error {
            writeln!(f, "Loan application could not be processed: {err}")?;
            writeln!(f)?;
        }

        writeln!(f, "Fields which do not have data:")?;
        write_field_list(f, &self.missing_fields, "No missing fields.")?;
        writeln!(f)?;

        writeln!(f, "Inconsistent data:")?;
        write_field_list(f, &self.inconsistent_fields, "No inconsistencies found.")?;
        writeln!(f)?;

        writeln!(f, "{}", check_sentence(&self.industry_license))?;
        writeln!(f, "{}", check_sentence(&self.commercial_registration))
    }
}

fn write_field_list(
    f: &mut fmt::Formatter<'_>,
    status: &FieldStatus<FieldList>,
    empty: &str,
) -> fmt::Result {
    match status {
        FieldStatus::Available { value } if !value.fields.is_empty() => {
            for field in &value.fields {
                writeln!(f, "  - {field}")?;
            }
            Ok(())
        }
        // Model answered but nothing could be itemised; show it as-is.
        FieldStatus::Available { value } if !value.raw.trim().is_empty() && !is_empty_list(&value.raw) => {
            for line in value.raw.trim().lines() {
                writeln!(f, "  {line}")?;
            }
            Ok(())
        }
        FieldStatus::Available { .. } => writeln!(f, "  {empty}"),
        FieldStatus::Unavailable { reason } => {
            writeln!(f, "  Response is missing or invalid ({reason}).")
        }
    }
}

fn is_empty_list(raw: &str) -> bool {
    matches!(raw.trim(), "[]" | "{}")
}

/// The sentence shown to the user for one cross-check.
pub fn check_sentence(check: &IdentifierCheck) -> String {
    let number = match check.kind {
        IdentifierKind::IndustrialLicense => "Industry license number",
        IdentifierKind::CommercialRegister => "Commercial Registration number",
    };
    match (check.verdict, check.kind) {
        (ReconciliationVerdict::Matched, IdentifierKind::IndustrialLicense) => format!(
            "{number} from Loan Application is same as Industry license number in image uploaded."
        ),
        (ReconciliationVerdict::Matched, IdentifierKind::CommercialRegister) => format!(
            "{number} from Loan Application is same as CR-number in image uploaded."
        ),
        (ReconciliationVerdict::Mismatched, IdentifierKind::IndustrialLicense) => {
            format!("{number} from Loan Application is not matched with image uploaded.")
        }
        (ReconciliationVerdict::Mismatched, IdentifierKind::CommercialRegister) => format!(
            "{number} from Loan Application is not same as CR-number in image uploaded."
        ),
        (ReconciliationVerdict::Unavailable, kind) => {
            format!("{} response is missing or invalid.", kind.label())
        }
    }
}
