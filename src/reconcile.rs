//! Cross-checking identifiers between the loan application and the
//! supporting documents.
//!
//! The loan application's value is always digits-only (see
//! [`crate::pipeline::parse::extract_number`]). The supporting document's
//! value is compared exactly as the model returned it unless
//! `normalize_supporting` is set, in which case it goes through the same
//! digit extraction first.

use crate::output::{FieldStatus, IdentifierCheck, IdentifierKind, ReconciliationVerdict};
use crate::pipeline::parse::extract_number;
use tracing::debug;

/// Compare one identifier across the two documents.
///
/// Values are compared byte for byte, surrounding whitespace included.
/// `Matched` iff both sides are present and equal, `Unavailable` if either
/// side is absent, blank or (when normalising) has no digits, otherwise
/// `Mismatched`.
pub fn reconcile(
    kind: IdentifierKind,
    primary: Option<&str>,
    supporting: &FieldStatus<String>,
    normalize_supporting: bool,
) -> IdentifierCheck {
    let primary = primary.filter(|s| !s.trim().is_empty());
    // blank counts as absent; anything else is compared exactly as read
    let raw_supporting = supporting
        .value()
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty());

    let compared = if normalize_supporting {
        raw_supporting.and_then(extract_number)
    } else {
        raw_supporting.map(str::to_string)
    };

    let verdict = match (primary, compared.as_deref()) {
        (Some(p), Some(s)) if p == s => ReconciliationVerdict::Matched,
        (Some(_), Some(_)) => ReconciliationVerdict::Mismatched,
        _ => ReconciliationVerdict::Unavailable,
    };
    debug!(
        "{}: {:?} vs {:?} → {:?}",
        kind.label(),
        primary,
        raw_supporting,
        verdict
    );

    IdentifierCheck {
        kind,
        verdict,
        primary: primary.map(str::to_string),
        supporting: raw_supporting.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;

    const CR: IdentifierKind = IdentifierKind::CommercialRegister;

    fn found(v: &str) -> FieldStatus<String> {
        FieldStatus::available(v.to_string())
    }

    #[test]
    fn equal_values_match() {
        for v in ["1", "1010123456", "000042"] {
            let check = reconcile(CR, Some(v), &found(v), false);
            assert_eq!(check.verdict, ReconciliationVerdict::Matched, "{v}");
        }
    }

    #[test]
    fn different_values_mismatch() {
        let check = reconcile(CR, Some("1010123456"), &found("1010123457"), false);
        assert_eq!(check.verdict, ReconciliationVerdict::Mismatched);
        assert_eq!(check.primary.as_deref(), Some("1010123456"));
        assert_eq!(check.supporting.as_deref(), Some("1010123457"));
    }

    #[test]
    fn absent_side_is_unavailable() {
        let missing = FieldStatus::unavailable(TaskError::NotProvided("x".into()));
        assert_eq!(
            reconcile(CR, Some("1"), &missing, false).verdict,
            ReconciliationVerdict::Unavailable
        );
        assert_eq!(
            reconcile(CR, None, &found("1"), false).verdict,
            ReconciliationVerdict::Unavailable
        );
        assert_eq!(
            reconcile(CR, Some("1"), &found("   "), false).verdict,
            ReconciliationVerdict::Unavailable
        );
    }

    #[test]
    fn supporting_side_raw_by_default() {
        // digits agree but the supporting text carries a date suffix
        let check = reconcile(CR, Some("12345"), &found("12345 / 2020-01-01"), false);
        assert_eq!(check.verdict, ReconciliationVerdict::Mismatched);
    }

    #[test]
    fn supporting_whitespace_is_not_ignored() {
        let check = reconcile(CR, Some("4521"), &found(" 4521 "), false);
        assert_eq!(check.verdict, ReconciliationVerdict::Mismatched);
        assert_eq!(check.supporting.as_deref(), Some(" 4521 "));

        let check = reconcile(CR, Some("4521"), &found(" 4521 "), true);
        assert_eq!(check.verdict, ReconciliationVerdict::Matched);
    }

    #[test]
    fn supporting_side_normalised_when_enabled() {
        let check = reconcile(CR, Some("12345"), &found("12345 / 2020-01-01"), true);
        assert_eq!(check.verdict, ReconciliationVerdict::Matched);
        assert_eq!(check.supporting.as_deref(), Some("12345 / 2020-01-01"));

        let check = reconcile(CR, Some("12345"), &found("pending"), true);
        assert_eq!(check.verdict, ReconciliationVerdict::Unavailable);
    }
}
