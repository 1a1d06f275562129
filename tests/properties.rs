//! Property tests for the invariants the service contracts promise.

mod common;

use proptest::prelude::*;
use serde_json::json;

use amila::results::{ResultStore, StreamLimits};
use amila::sql::{normalize_sql, query_hash};
use amila::state::ExecutionResult;
use amila::types::DatabaseType;
use amila::webhooks::{sign_payload, verify_signature};

/// SQL-ish fragments for normalization inputs: keywords, identifiers,
/// literals, comments, messy whitespace.
fn sql_fragment() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("SELECT".to_string()),
        Just("FROM".to_string()),
        Just("WHERE".to_string()),
        Just("AND".to_string()),
        Just("t1".to_string()),
        Just("amount".to_string()),
        Just("= 42".to_string()),
        Just("> 100".to_string()),
        Just("'text literal'".to_string()),
        Just("TO_DATE('2025-01-01')".to_string()),
        Just("-- a comment".to_string()),
        Just("/* block */".to_string()),
        Just(";".to_string()),
        Just("\n\t ".to_string()),
    ]
}

fn sql_input() -> impl Strategy<Value = String> {
    proptest::collection::vec(sql_fragment(), 0..24).prop_map(|parts| parts.join(" "))
}

proptest! {
    #[test]
    fn normalize_sql_is_idempotent(sql in sql_input(), params in any::<bool>()) {
        let once = normalize_sql(&sql, params);
        let twice = normalize_sql(&once, params);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn equal_normalized_sql_gives_equal_cache_keys(sql in sql_input()) {
        let reformatted = format!("  {}  ", sql.replace(' ', "\n"));
        // Reformatting must not cross literal or line-comment boundaries,
        // since newlines change what those swallow.
        if !sql.contains('\'') && !sql.contains("--") {
            prop_assert_eq!(
                query_hash(&sql, DatabaseType::Oracle),
                query_hash(&reformatted, DatabaseType::Oracle)
            );
        }
        // A trailing line comment would swallow the suffix.
        if !sql.contains("--") {
            prop_assert_ne!(
                query_hash(&format!("{sql} extra"), DatabaseType::Oracle),
                query_hash(&format!("{sql} other"), DatabaseType::Oracle)
            );
        }
    }

    #[test]
    fn webhook_signatures_verify_iff_untampered(
        secret in "[a-zA-Z0-9]{8,32}",
        timestamp in 0i64..4_000_000_000i64,
        body in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let ts = timestamp.to_string();
        let signature = sign_payload(&secret, &ts, &body);
        prop_assert!(verify_signature(&secret, &ts, &body, &signature));

        let mut tampered = body.clone();
        tampered.push(0x55);
        prop_assert!(!verify_signature(&secret, &ts, &tampered, &signature));

        let other_ts = (timestamp + 1).to_string();
        prop_assert!(!verify_signature(&secret, &other_ts, &body, &signature));
    }
}

#[test]
fn transport_sizing_honors_row_count_contract() {
    let store = ResultStore::new(
        std::sync::Arc::new(amila::kv::InMemoryKv::new()),
        StreamLimits {
            max_rows: 200,
            preview_rows: 50,
        },
        std::time::Duration::from_secs(300),
        std::time::Duration::from_secs(3600),
    );
    for rows in [0usize, 1, 50, 199, 200, 201, 500] {
        let result = ExecutionResult::new(
            vec!["id".to_string()],
            (0..rows).map(|i| vec![json!(i)]).collect(),
            3,
        );
        let payload = store.transport_payload("q", &result, None);
        if rows <= 200 {
            // Inline: full rows, no reference, count matches rows.
            assert!(payload.result_ref.is_none(), "rows={rows}");
            assert!(!payload.truncated);
            assert_eq!(payload.results.row_count, payload.results.rows.len());
        } else {
            // Preview: truncated flag set, declared count preserved.
            assert!(payload.truncated, "rows={rows}");
            assert_eq!(payload.results.rows.len(), 50);
            assert_eq!(payload.results.row_count, rows);
            assert!(payload.results.truncated);
            assert_eq!(payload.result_ref.as_ref().unwrap().row_count, rows);
        }
    }
}
