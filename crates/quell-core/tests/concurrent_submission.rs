//! Concurrent submissions against one shared file-backed store.
//!
//! Integration tests verifying:
//!
//! - Racing creates of distinct mitigations all land, each on a unique
//!   workflow id.
//! - Racing creates of the *same* mitigation resolve to exactly one
//!   winner; every loser sees a duplicate-name client error.
//! - The ledger never relies on in-process exclusion: every thread runs
//!   its own `RequestLedger` over its own store handle to the same file.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use quell_core::config::LedgerConfig;
use quell_core::conflict::ComparatorRegistry;
use quell_core::ledger::{RequestError, RequestLedger};
use quell_core::record::{MitigationDefinition, MitigationRequest};
use quell_core::retry::RetryPolicy;
use quell_core::store::SqliteLedgerStore;

const DEVICE: &str = "edge-router-7";
const SCOPE: &str = "border";

fn contended_config() -> LedgerConfig {
    // Enough headroom for every thread to lose several insert races and
    // ride out SQLITE_BUSY from the other writers.
    let policy = RetryPolicy {
        max_attempts: 64,
        base_delay: Duration::from_millis(1),
        transient_max_attempts: 64,
    };
    LedgerConfig {
        retry: policy,
        lease: policy,
        ..LedgerConfig::default()
    }
}

fn ledger_at(dir: &TempDir) -> RequestLedger {
    let store = SqliteLedgerStore::open(dir.path().join("ledger.db")).expect("open store");
    RequestLedger::new(
        Arc::new(store),
        ComparatorRegistry::new(),
        contended_config(),
    )
}

fn create_request(name: &str, payload: &[u8]) -> MitigationRequest {
    MitigationRequest {
        device_key: DEVICE.to_string(),
        device_scope: SCOPE.to_string(),
        mitigation_name: name.to_string(),
        mitigation_template: "rate-limit".to_string(),
        service_name: "dns".to_string(),
        requested_version: None,
        rollback_to_version: None,
        definition: MitigationDefinition::new(payload.to_vec()),
        locations: BTreeSet::from(["iad-core-1".to_string()]),
        requested_by: "oncall".to_string(),
    }
}

#[test]
fn racing_creates_of_distinct_mitigations_get_unique_ids() {
    let dir = TempDir::new().expect("tempdir");
    const THREADS: usize = 8;

    let records: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let dir = &dir;
                scope.spawn(move || {
                    let ledger = ledger_at(dir);
                    let name = format!("mitigation-{i}");
                    let payload = format!("limit flow {i}");
                    ledger
                        .create(&create_request(&name, payload.as_bytes()))
                        .expect("create")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect()
    });

    let ids: HashSet<u64> = records.iter().map(|r| r.workflow_id).collect();
    assert_eq!(ids.len(), THREADS, "workflow id allocated twice");
    assert!(ids.iter().all(|&id| id >= 100));
    assert!(records.iter().all(|r| r.mitigation_version == 1));
}

#[test]
fn racing_creates_of_same_mitigation_have_one_winner() {
    let dir = TempDir::new().expect("tempdir");
    const THREADS: usize = 6;

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let dir = &dir;
                scope.spawn(move || {
                    let ledger = ledger_at(dir);
                    ledger.create(&create_request("dns-flood", b"limit udp/53"))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect()
    });

    let mut winners = 0;
    for result in results {
        match result {
            Ok(record) => {
                winners += 1;
                assert_eq!(record.mitigation_version, 1);
            }
            Err(
                err @ (RequestError::DuplicateMitigationName { .. }
                | RequestError::DuplicateDefinition { .. }),
            ) => {
                assert!(err.is_client_error());
            }
            Err(other) => panic!("unexpected submission error: {other}"),
        }
    }
    assert_eq!(winners, 1, "exactly one create must win the name");
}

#[test]
fn chains_survive_reopen() {
    let dir = TempDir::new().expect("tempdir");

    let first = ledger_at(&dir)
        .create(&create_request("dns-flood", b"limit udp/53"))
        .expect("create");
    assert_eq!(first.workflow_id, 100);

    // A fresh process over the same file continues the id sequence and
    // still sees the claimed name.
    let reopened = ledger_at(&dir);
    let err = reopened
        .create(&create_request("dns-flood", b"other payload"))
        .unwrap_err();
    assert!(matches!(err, RequestError::DuplicateMitigationName { .. }));

    let second = reopened
        .create(&create_request("second", b"other payload"))
        .expect("create");
    assert_eq!(second.workflow_id, 101);
}
