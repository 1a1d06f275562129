//! Oracle error normalization.
//!
//! Oracle surfaces everything as `ORA-NNNNN` codes buried in driver
//! messages. This module extracts the code, classifies it for retry/repair
//! routing, and translates the common ones into a user-facing explanation
//! with a suggestion, matching the catalog the support team curates.

use serde::{Deserialize, Serialize};

use super::adapter::DbErrorKind;

/// User-facing translation of an Oracle error.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OracleErrorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub title: String,
    pub explanation: String,
    pub suggestion: String,
    pub raw_message: String,
}

/// Curated catalog of common Oracle errors.
const ORACLE_ERRORS: [(&str, &str, &str, &str); 12] = [
    (
        "ORA-00001",
        "Unique constraint violated",
        "Attempted to insert a duplicate value in a column with a unique constraint",
        "Check for existing records before inserting, or use MERGE statement",
    ),
    (
        "ORA-00904",
        "Invalid identifier",
        "Column name doesn't exist in the table or is misspelled",
        "Verify column names match the schema exactly (case-sensitive)",
    ),
    (
        "ORA-00942",
        "Table or view does not exist",
        "Referenced table/view doesn't exist or user lacks privileges",
        "Check table name spelling and schema permissions",
    ),
    (
        "ORA-01400",
        "Cannot insert NULL",
        "Attempted to insert NULL into a NOT NULL column",
        "Provide a value for all required columns",
    ),
    (
        "ORA-01722",
        "Invalid number",
        "Attempted to convert a non-numeric string to a number",
        "Ensure data types match or use TO_NUMBER with proper format",
    ),
    (
        "ORA-01747",
        "Invalid column specification",
        "Column name contains invalid characters or syntax",
        "Use double quotes for reserved words or special characters",
    ),
    (
        "ORA-01789",
        "Query block has incorrect number of result columns",
        "UNION/INTERSECT queries have mismatched column counts",
        "Ensure all query blocks return the same number of columns",
    ),
    (
        "ORA-01843",
        "Not a valid month",
        "Invalid month value in date conversion",
        "Use correct date format (e.g., TO_DATE with 'DD-MON-YYYY')",
    ),
    (
        "ORA-12154",
        "TNS: could not resolve service name",
        "Database connection string is invalid or not found",
        "Verify tnsnames.ora configuration or connection string",
    ),
    (
        "ORA-12541",
        "TNS: no listener",
        "Database listener is not running",
        "Start the Oracle listener service",
    ),
    (
        "ORA-28000",
        "Account is locked",
        "User account has been locked due to failed login attempts",
        "Contact DBA to unlock the account",
    ),
    (
        "ORA-28001",
        "Password has expired",
        "User password needs to be changed",
        "Change password using ALTER USER statement",
    ),
];

/// Pull the first `ORA-NNNNN` code out of a driver message.
#[must_use]
pub fn extract_ora_code(message: &str) -> Option<String> {
    let upper = message.to_ascii_uppercase();
    let idx = upper.find("ORA-")?;
    let digits: String = upper[idx + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() == 5 {
        Some(format!("ORA-{digits}"))
    } else {
        None
    }
}

/// Translate an Oracle error message into user-facing detail.
#[must_use]
pub fn parse_oracle_error(message: &str) -> OracleErrorInfo {
    let Some(code) = extract_ora_code(message) else {
        return OracleErrorInfo {
            error_code: None,
            title: "Unknown Error".to_string(),
            explanation: message.to_string(),
            suggestion: "Review the full error message for details".to_string(),
            raw_message: message.to_string(),
        };
    };

    let entry = ORACLE_ERRORS.iter().find(|(c, _, _, _)| *c == code);
    let (title, explanation, suggestion) = match entry {
        Some((_, title, explanation, suggestion)) => {
            ((*title).to_string(), (*explanation).to_string(), (*suggestion).to_string())
        }
        None => (
            format!("Oracle Error {code}"),
            "Uncommon Oracle error".to_string(),
            "Consult Oracle documentation for this error code".to_string(),
        ),
    };

    OracleErrorInfo {
        error_code: Some(code),
        title,
        explanation,
        suggestion,
        raw_message: message.to_string(),
    }
}

/// Extract the offending identifier from an ORA-00904 message.
///
/// Driver messages quote the identifier (`ORA-00904: "FOO": invalid
/// identifier`) but some intermediaries strip the quotes.
#[must_use]
pub fn extract_invalid_identifier(message: &str) -> Option<String> {
    let upper = message.to_ascii_uppercase();
    let tail_start = upper.find("ORA-00904").map(|i| i + "ORA-00904".len())?;
    let tail = message[tail_start..].trim_start_matches([':', ' ']);
    if let Some(rest) = tail.strip_prefix('"') {
        let end = rest.find('"')?;
        let candidate = rest[..end].trim();
        return (!candidate.is_empty()).then(|| candidate.to_string());
    }
    let token: String = tail
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let token = token.trim_matches('"').to_string();
    (!token.is_empty()).then_some(token)
}

/// Map an Oracle error message onto the shared classification.
#[must_use]
pub fn classify_oracle_error(message: &str) -> DbErrorKind {
    match extract_ora_code(message).as_deref() {
        Some("ORA-00942") => DbErrorKind::MissingObject,
        Some("ORA-00904" | "ORA-01747") => DbErrorKind::InvalidIdentifier,
        Some("ORA-00933" | "ORA-00936" | "ORA-00907" | "ORA-01789") => DbErrorKind::Syntax,
        Some("ORA-12154" | "ORA-12541" | "ORA-12170" | "ORA-03113" | "ORA-03114") => {
            DbErrorKind::Connection
        }
        Some("ORA-01013") => DbErrorKind::Timeout,
        Some("ORA-00054" | "ORA-08177") => DbErrorKind::Transient,
        Some("ORA-28000" | "ORA-28001" | "ORA-01031") => DbErrorKind::PermissionDenied,
        Some(_) => DbErrorKind::Other,
        None => DbErrorKind::Other,
    }
}

/// Format an Oracle error with context for display.
#[must_use]
pub fn format_oracle_error(message: &str) -> String {
    let parsed = parse_oracle_error(message);
    let Some(code) = &parsed.error_code else {
        return message.to_string();
    };
    format!(
        "{title} ({code})\n\nWhat happened: {explanation}\n\nSuggestion: {suggestion}\n\nRaw error: {raw}",
        title = parsed.title,
        explanation = parsed.explanation,
        suggestion = parsed.suggestion,
        raw = parsed.raw_message,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_translates_known_codes() {
        let info = parse_oracle_error("ORA-00942: table or view does not exist");
        assert_eq!(info.error_code.as_deref(), Some("ORA-00942"));
        assert_eq!(info.title, "Table or view does not exist");
    }

    #[test]
    fn unknown_code_gets_generic_entry() {
        let info = parse_oracle_error("ORA-99999: strange");
        assert_eq!(info.error_code.as_deref(), Some("ORA-99999"));
        assert_eq!(info.title, "Oracle Error ORA-99999");
    }

    #[test]
    fn message_without_code_passes_through() {
        let info = parse_oracle_error("network unreachable");
        assert_eq!(info.error_code, None);
        assert_eq!(info.explanation, "network unreachable");
    }

    #[test]
    fn invalid_identifier_extraction() {
        assert_eq!(
            extract_invalid_identifier("ORA-00904: \"SERVICE_DATE\": invalid identifier"),
            Some("SERVICE_DATE".to_string())
        );
        assert_eq!(
            extract_invalid_identifier("ORA-00904: FOO: invalid identifier"),
            Some("FOO".to_string())
        );
        assert_eq!(extract_invalid_identifier("ORA-00942: missing"), None);
    }

    #[test]
    fn classification_covers_repair_and_retry_classes() {
        assert_eq!(
            classify_oracle_error("ORA-00942: no table"),
            DbErrorKind::MissingObject
        );
        assert_eq!(
            classify_oracle_error("ORA-00904: bad column"),
            DbErrorKind::InvalidIdentifier
        );
        assert_eq!(
            classify_oracle_error("ORA-12541: no listener"),
            DbErrorKind::Connection
        );
        assert_eq!(classify_oracle_error("who knows"), DbErrorKind::Other);
    }
}
