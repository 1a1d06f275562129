//! Doris error normalization.
//!
//! Doris speaks the MySQL protocol, so failures arrive as MySQL error
//! numbers or FE-specific message text. Classification feeds the same
//! retry/repair routing as the other backends.

use super::adapter::DbErrorKind;

/// Map a Doris/MySQL-protocol error message onto the shared classification.
#[must_use]
pub fn classify_doris_error(message: &str) -> DbErrorKind {
    let lower = message.to_ascii_lowercase();

    if let Some(code) = extract_mysql_code(message) {
        return match code {
            1064 => DbErrorKind::Syntax,
            1146 => DbErrorKind::MissingObject,
            1054 => DbErrorKind::InvalidIdentifier,
            1045 | 1142 => DbErrorKind::PermissionDenied,
            1205 | 1213 => DbErrorKind::Transient,
            2002 | 2003 | 2006 | 2013 => DbErrorKind::Connection,
            _ => DbErrorKind::Other,
        };
    }

    if lower.contains("timeout") || lower.contains("timed out") {
        DbErrorKind::Timeout
    } else if lower.contains("connection") || lower.contains("broken pipe") {
        DbErrorKind::Connection
    } else if lower.contains("unknown table") || lower.contains("table not found") {
        DbErrorKind::MissingObject
    } else if lower.contains("unknown column") {
        DbErrorKind::InvalidIdentifier
    } else if lower.contains("syntax error") {
        DbErrorKind::Syntax
    } else if lower.contains("too many queries") || lower.contains("resource is not enough") {
        // FE admission control pushes back under load; worth retrying.
        DbErrorKind::Transient
    } else {
        DbErrorKind::Other
    }
}

/// Pull a leading `ERROR NNNN` / `errCode = NNNN` style MySQL error number
/// out of the message, if present.
fn extract_mysql_code(message: &str) -> Option<u32> {
    let upper = message.to_ascii_uppercase();
    for marker in ["ERROR ", "ERRCODE = ", "ERRCODE="] {
        if let Some(idx) = upper.find(marker) {
            let digits: String = upper[idx + marker.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !digits.is_empty() {
                return digits.parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_mysql_error_numbers() {
        assert_eq!(
            classify_doris_error("ERROR 1064 (42000): syntax error near 'SELEC'"),
            DbErrorKind::Syntax
        );
        assert_eq!(
            classify_doris_error("errCode = 1146, message: Unknown table 'x'"),
            DbErrorKind::MissingObject
        );
        assert_eq!(
            classify_doris_error("ERROR 2013 (HY000): Lost connection to MySQL server"),
            DbErrorKind::Connection
        );
    }

    #[test]
    fn classifies_message_text() {
        assert_eq!(
            classify_doris_error("query timed out on FE"),
            DbErrorKind::Timeout
        );
        assert_eq!(
            classify_doris_error("Unknown column 'FOO' in 'field list'"),
            DbErrorKind::InvalidIdentifier
        );
        assert_eq!(classify_doris_error("???"), DbErrorKind::Other);
    }
}
