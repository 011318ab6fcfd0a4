//! Tests for the conflict detector and comparator registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;

use crate::record::{
    MitigationDefinition, MitigationRequest, RequestRecord, RequestType, WorkflowStatus,
};
use crate::store::SqliteLedgerStore;

use super::*;

const DEVICE: &str = "edge-router-7";
const SCOPE: &str = "border";

fn request(name: &str, template: &str, payload: &[u8]) -> MitigationRequest {
    let mut locations = BTreeSet::new();
    locations.insert("iad-core-1".to_string());
    MitigationRequest {
        device_key: DEVICE.to_string(),
        device_scope: SCOPE.to_string(),
        mitigation_name: name.to_string(),
        mitigation_template: template.to_string(),
        service_name: "dns".to_string(),
        requested_version: None,
        rollback_to_version: None,
        definition: MitigationDefinition::new(payload.to_vec()),
        locations,
        requested_by: "oncall".to_string(),
    }
}

fn insert(store: &SqliteLedgerStore, name: &str, template: &str, payload: &[u8], workflow_id: u64) {
    let req = request(name, template, payload);
    let record = RequestRecord::from_request(
        &req,
        RequestType::Create,
        workflow_id,
        1,
        &req.definition,
        Utc::now(),
    );
    store.put_request(&record).expect("insert");
}

/// Comparator that counts invocations and flags payloads equal byte-for-byte.
struct CountingComparator {
    calls: AtomicUsize,
}

impl CountingComparator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConflictComparator for CountingComparator {
    fn is_conflicting(&self, existing: &RequestRecord, candidate: &MitigationRequest) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        existing.definition_payload == candidate.definition.payload
    }
}

#[test]
fn test_clean_scan_passes() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    insert(&store, "m1", "rate-limit", b"limit udp/53", 100);
    insert(&store, "m2", "rate-limit", b"limit tcp/80", 101);

    let registry = ComparatorRegistry::new();
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    detector
        .check(&request("m3", "rate-limit", b"limit tcp/443"), false, &mut cursor)
        .expect("no conflict");
}

#[test]
fn test_duplicate_name_is_fatal_for_create() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    insert(&store, "dns-flood", "rate-limit", b"limit udp/53", 100);

    let registry = ComparatorRegistry::new();
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    let err = detector
        .check(&request("dns-flood", "rate-limit", b"other"), false, &mut cursor)
        .unwrap_err();
    assert!(matches!(
        err,
        ConflictError::DuplicateName { workflow_id: 100, .. }
    ));
}

#[test]
fn test_same_name_skipped_for_update() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    insert(&store, "dns-flood", "rate-limit", b"limit udp/53", 100);

    let registry = ComparatorRegistry::new();
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    detector
        .check(&request("dns-flood", "rate-limit", b"new payload"), true, &mut cursor)
        .expect("own chain is not a conflict on update");
}

#[test]
fn test_fingerprint_match_invokes_comparator() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    // Three active mitigations; one shares the candidate's payload (and so
    // its fingerprint) under a different name.
    insert(&store, "m1", "rate-limit", b"limit udp/53", 100);
    insert(&store, "m2", "rate-limit", b"limit tcp/80", 101);
    insert(&store, "m3", "blackhole", b"drop all", 102);

    let comparator = CountingComparator::new();
    let mut registry = ComparatorRegistry::new();
    registry.register("rate-limit", comparator.clone());
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    let err = detector
        .check(&request("m-new", "rate-limit", b"limit udp/53"), false, &mut cursor)
        .unwrap_err();
    assert!(matches!(
        err,
        ConflictError::DuplicateDefinition { workflow_id: 100, .. }
    ));
    // m1 conflicted on the first comparison; m3 is cross-template and never
    // reached the comparator.
    assert_eq!(comparator.calls(), 1);
}

#[test]
fn test_cross_template_rows_never_compared() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    insert(&store, "m1", "blackhole", b"limit udp/53", 100);

    let comparator = CountingComparator::new();
    let mut registry = ComparatorRegistry::new();
    registry.register("rate-limit", comparator.clone());
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    // Identical payload, different template: clean.
    detector
        .check(&request("m-new", "rate-limit", b"limit udp/53"), false, &mut cursor)
        .expect("cross-template");
    assert_eq!(comparator.calls(), 0);
}

#[test]
fn test_fingerprint_match_without_comparator_is_duplicate() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    insert(&store, "m1", "rate-limit", b"limit udp/53", 100);

    let registry = ComparatorRegistry::new();
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    let err = detector
        .check(&request("m-new", "rate-limit", b"limit udp/53"), false, &mut cursor)
        .unwrap_err();
    assert!(matches!(err, ConflictError::DuplicateDefinition { .. }));
}

#[test]
fn test_comparator_sees_differing_fingerprints() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    insert(&store, "m1", "rate-limit", b"limit udp/53", 100);

    let comparator = CountingComparator::new();
    let mut registry = ComparatorRegistry::new();
    registry.register("rate-limit", comparator.clone());
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    detector
        .check(&request("m-new", "rate-limit", b"limit tcp/80"), false, &mut cursor)
        .expect("no conflict");
    // Semantic comparison happened even though the hashes differ.
    assert_eq!(comparator.calls(), 1);
}

#[test]
fn test_scan_ignores_rows_without_claim() {
    let store = SqliteLedgerStore::in_memory().expect("store");

    let req = request("m-failed", "rate-limit", b"limit udp/53");
    let mut failed = RequestRecord::from_request(
        &req,
        RequestType::Create,
        100,
        1,
        &req.definition,
        Utc::now(),
    );
    failed.workflow_status = WorkflowStatus::Failed;
    store.put_request(&failed).expect("insert failed row");

    let registry = ComparatorRegistry::new();
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    // Same name and payload, but the failed workflow holds no claim.
    detector
        .check(&request("m-failed", "rate-limit", b"limit udp/53"), false, &mut cursor)
        .expect("failed rows hold no claim");
}

#[test]
fn test_incremental_rescan_skips_cleared_rows() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    insert(&store, "m1", "rate-limit", b"a", 100);
    insert(&store, "m2", "rate-limit", b"b", 101);

    let comparator = CountingComparator::new();
    let mut registry = ComparatorRegistry::new();
    registry.register("rate-limit", comparator.clone());
    let detector = ConflictDetector::new(&store, &registry, 16);
    let mut cursor = ConflictCursor::new();

    detector
        .check(&request("m-new", "rate-limit", b"c"), false, &mut cursor)
        .expect("first pass");
    assert_eq!(comparator.calls(), 2);

    // A retry of the same submission re-scans from the inclusive floor
    // (101): m1 stays cleared, m2 and the new row are compared.
    insert(&store, "m3", "rate-limit", b"d", 105);
    detector
        .check(&request("m-new", "rate-limit", b"c"), false, &mut cursor)
        .expect("second pass");
    assert_eq!(comparator.calls(), 4);
}

#[test]
fn test_pagination_covers_every_head() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    for i in 0..9 {
        insert(&store, &format!("m{i}"), "rate-limit", &[i], 100 + u64::from(i));
    }
    // The conflicting row lands on the last page.
    insert(&store, "m-dup", "rate-limit", b"needle", 120);

    let registry = ComparatorRegistry::new();
    let detector = ConflictDetector::new(&store, &registry, 3);
    let mut cursor = ConflictCursor::new();

    let err = detector
        .check(&request("m-new", "rate-limit", b"needle"), false, &mut cursor)
        .unwrap_err();
    assert!(matches!(
        err,
        ConflictError::DuplicateDefinition { workflow_id: 120, .. }
    ));
}
