//! Tests for both workflow-id allocation strategies.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;

use crate::config::ScopeIdRange;
use crate::record::{
    CounterRecord, CounterState, LockStatus, MitigationDefinition, MitigationRequest,
    RequestRecord, RequestType, WorkflowStatus,
};
use crate::retry::RetryPolicy;
use crate::store::{LedgerStore, Page, PageToken, SqliteLedgerStore, StoreError};

use super::*;

const DEVICE: &str = "edge-router-7";
const SCOPE: &str = "border";

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        transient_max_attempts: 3,
    }
}

fn record(workflow_id: u64) -> RequestRecord {
    let mut locations = BTreeSet::new();
    locations.insert("iad-core-1".to_string());
    let request = MitigationRequest {
        device_key: DEVICE.to_string(),
        device_scope: SCOPE.to_string(),
        mitigation_name: format!("m-{workflow_id}"),
        mitigation_template: "rate-limit".to_string(),
        service_name: "dns".to_string(),
        requested_version: None,
        rollback_to_version: None,
        definition: MitigationDefinition::new(b"x".to_vec()),
        locations,
        requested_by: "oncall".to_string(),
    };
    RequestRecord::from_request(
        &request,
        RequestType::Create,
        workflow_id,
        1,
        &request.definition,
        Utc::now(),
    )
}

// ---------------------------------------------------------------------------
// Scan-then-increment
// ---------------------------------------------------------------------------

#[test]
fn test_scan_empty_history_starts_at_scope_minimum() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    let allocator = ScanAllocator::new(&store, ScopeIdRange::default());
    let mut cursor = ScanCursor::new();

    let candidate = allocator
        .next_candidate(DEVICE, SCOPE, &mut cursor)
        .expect("candidate");
    assert_eq!(candidate, 100);
}

#[test]
fn test_scan_proposes_successor_of_max() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    store.put_request(&record(100)).expect("insert");
    store.put_request(&record(104)).expect("insert");

    let allocator = ScanAllocator::new(&store, ScopeIdRange::default());
    let mut cursor = ScanCursor::new();

    let candidate = allocator
        .next_candidate(DEVICE, SCOPE, &mut cursor)
        .expect("candidate");
    assert_eq!(candidate, 105);
}

#[test]
fn test_scan_lost_race_advances_floor() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    let allocator = ScanAllocator::new(&store, ScopeIdRange::default());
    let mut cursor = ScanCursor::new();

    let candidate = allocator
        .next_candidate(DEVICE, SCOPE, &mut cursor)
        .expect("candidate");
    assert_eq!(candidate, 100);

    // A concurrent writer takes 100 before we can.
    store.put_request(&record(100)).expect("racer insert");
    cursor.note_lost_race(candidate);

    let candidate = allocator
        .next_candidate(DEVICE, SCOPE, &mut cursor)
        .expect("candidate");
    assert_eq!(candidate, 101);
}

#[test]
fn test_scan_clamps_to_scope_minimum() {
    // History below the configured minimum (range raised after rows were
    // written) must not produce candidates below the minimum.
    let store = SqliteLedgerStore::in_memory().expect("store");
    store.put_request(&record(100)).expect("insert");

    let range = ScopeIdRange {
        min_workflow_id: 500,
        max_workflow_id: 1000,
    };
    let allocator = ScanAllocator::new(&store, range);
    let mut cursor = ScanCursor::new();

    let candidate = allocator
        .next_candidate(DEVICE, SCOPE, &mut cursor)
        .expect("candidate");
    assert_eq!(candidate, 500);
}

#[test]
fn test_scan_id_space_exhaustion_is_fatal() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    let range = ScopeIdRange {
        min_workflow_id: 100,
        max_workflow_id: 101,
    };
    store.put_request(&record(101)).expect("insert");

    let allocator = ScanAllocator::new(&store, range);
    let mut cursor = ScanCursor::new();

    let err = allocator
        .next_candidate(DEVICE, SCOPE, &mut cursor)
        .unwrap_err();
    assert!(matches!(
        err,
        AllocatorError::IdSpaceExhausted { candidate: 102, .. }
    ));
}

// ---------------------------------------------------------------------------
// Lease counter
// ---------------------------------------------------------------------------

#[test]
fn test_lease_allocates_and_confirms() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    store
        .init_counter(&CounterRecord::new(DEVICE, SCOPE, 99))
        .expect("init");

    let allocator = LeaseAllocator::new(&store, fast_policy(10));

    let id = allocator
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("allocate");
    assert_eq!(id, 100);

    let row = store.get_counter(DEVICE, SCOPE).expect("get").expect("row");
    assert_eq!(row.counter, 100);
    assert_eq!(row.lock_status, LockStatus::Locked);

    allocator
        .confirm_acquiring_workflow_id(DEVICE, SCOPE, id)
        .expect("confirm");

    let row = store.get_counter(DEVICE, SCOPE).expect("get").expect("row");
    assert_eq!(row.lock_status, LockStatus::Unlocked);

    // The next holder continues the sequence.
    let id = allocator
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("allocate");
    assert_eq!(id, 101);
}

#[test]
fn test_lease_missing_counter_is_fatal() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    let allocator = LeaseAllocator::new(&store, fast_policy(3));

    let err = allocator.generate_workflow_id(DEVICE, SCOPE).unwrap_err();
    assert!(matches!(err, LeaseAllocError::CounterMissing { .. }));
}

#[test]
fn test_lease_forced_takeover_of_abandoned_lock() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    store
        .init_counter(&CounterRecord::new(DEVICE, SCOPE, 99))
        .expect("init");

    let allocator = LeaseAllocator::new(&store, fast_policy(4));

    // First holder allocates 100 and dies without confirming.
    let abandoned = allocator
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("allocate");
    assert_eq!(abandoned, 100);

    // The second caller exhausts its retries against an unchanging locked
    // row and then steals the lease exactly once.
    let stolen = allocator
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("takeover");
    assert_eq!(stolen, 101);

    let row = store.get_counter(DEVICE, SCOPE).expect("get").expect("row");
    assert_eq!(row.counter, 101);
    assert_eq!(row.lock_status, LockStatus::Locked);

    allocator
        .confirm_acquiring_workflow_id(DEVICE, SCOPE, stolen)
        .expect("confirm stolen lease");
}

#[test]
fn test_lease_live_contention_is_not_forced() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    store
        .init_counter(&CounterRecord::new(DEVICE, SCOPE, 99))
        .expect("init");
    let allocator = LeaseAllocator::new(&store, fast_policy(4));
    let held = allocator
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("allocate");

    // The blocking row keeps changing: a live holder is cycling the lease.
    let churn = ChurningStore::new(store.clone());
    let contender = LeaseAllocator::new(&churn, fast_policy(4));

    let err = contender.generate_workflow_id(DEVICE, SCOPE).unwrap_err();
    assert!(matches!(
        err,
        LeaseAllocError::Contention { attempts: 4, .. }
    ));

    // The original holder's lease was never disturbed past the churn.
    assert!(held >= 100);
}

#[test]
fn test_lease_waits_out_live_holder_that_confirms() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    store
        .init_counter(&CounterRecord::new(DEVICE, SCOPE, 99))
        .expect("init");

    let allocator = LeaseAllocator::new(&store, fast_policy(6));
    let held = allocator
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("allocate");
    assert_eq!(held, 100);

    // The holder confirms while the contender is mid-retry; the contender
    // then acquires normally, well before any takeover could trigger.
    let releasing = ReleasingStore::new(store.clone(), 3);
    let contender = LeaseAllocator::new(&releasing, fast_policy(6));
    let id = contender
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("acquire after release");
    assert_eq!(id, 101);

    let row = store.get_counter(DEVICE, SCOPE).expect("get").expect("row");
    assert_eq!(row.counter, 101);
    assert_eq!(row.lock_status, LockStatus::Locked);
}

#[test]
fn test_lease_confirm_detects_stolen_lease() {
    let store = SqliteLedgerStore::in_memory().expect("store");
    store
        .init_counter(&CounterRecord::new(DEVICE, SCOPE, 99))
        .expect("init");

    let allocator = LeaseAllocator::new(&store, fast_policy(3));
    let id = allocator
        .generate_workflow_id(DEVICE, SCOPE)
        .expect("allocate");

    // Another party forces the counter forward before we confirm.
    store
        .put_counter(
            DEVICE,
            SCOPE,
            CounterState {
                counter: id + 1,
                lock_status: LockStatus::Locked,
            },
            CounterState {
                counter: id,
                lock_status: LockStatus::Locked,
            },
        )
        .expect("steal");

    let err = allocator
        .confirm_acquiring_workflow_id(DEVICE, SCOPE, id)
        .unwrap_err();
    assert!(matches!(err, LeaseAllocError::LeaseStolen { .. }));
}

/// Store wrapper that unlocks the counter row after a fixed number of
/// reads, simulating the holder confirming while a contender retries.
struct ReleasingStore {
    inner: SqliteLedgerStore,
    reads_until_release: std::sync::atomic::AtomicU32,
}

impl ReleasingStore {
    const fn new(inner: SqliteLedgerStore, reads_until_release: u32) -> Self {
        Self {
            inner,
            reads_until_release: std::sync::atomic::AtomicU32::new(reads_until_release),
        }
    }
}

impl LedgerStore for ReleasingStore {
    fn get_request(
        &self,
        device_key: &str,
        workflow_id: u64,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.inner.get_request(device_key, workflow_id)
    }

    fn put_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        self.inner.put_request(record)
    }

    fn max_workflow_id(
        &self,
        device_key: &str,
        scope: &str,
        at_or_above: Option<u64>,
    ) -> Result<Option<u64>, StoreError> {
        self.inner.max_workflow_id(device_key, scope, at_or_above)
    }

    fn active_heads(
        &self,
        device_key: &str,
        min_workflow_id: u64,
        page: Option<PageToken>,
        page_size: usize,
    ) -> Result<Page<RequestRecord>, StoreError> {
        self.inner
            .active_heads(device_key, min_workflow_id, page, page_size)
    }

    fn latest_for_name(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.inner.latest_for_name(device_key, scope, mitigation_name)
    }

    fn record_for_version(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
        mitigation_version: u32,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.inner
            .record_for_version(device_key, scope, mitigation_name, mitigation_version)
    }

    fn mark_superseded(
        &self,
        device_key: &str,
        workflow_id: u64,
        successor_workflow_id: u64,
    ) -> Result<(), StoreError> {
        self.inner
            .mark_superseded(device_key, workflow_id, successor_workflow_id)
    }

    fn set_workflow_status(
        &self,
        device_key: &str,
        workflow_id: u64,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        self.inner.set_workflow_status(device_key, workflow_id, status)
    }

    fn get_counter(
        &self,
        device_key: &str,
        scope: &str,
    ) -> Result<Option<CounterRecord>, StoreError> {
        use std::sync::atomic::Ordering;

        let remaining = self.reads_until_release.load(Ordering::SeqCst);
        if remaining > 0 {
            self.reads_until_release.store(remaining - 1, Ordering::SeqCst);
        } else if let Some(row) = self.inner.get_counter(device_key, scope)? {
            if row.lock_status == LockStatus::Locked {
                let released = CounterState {
                    counter: row.counter,
                    lock_status: LockStatus::Unlocked,
                };
                self.inner
                    .put_counter(device_key, scope, released, row.state())?;
            }
        }
        self.inner.get_counter(device_key, scope)
    }

    fn init_counter(&self, record: &CounterRecord) -> Result<(), StoreError> {
        self.inner.init_counter(record)
    }

    fn put_counter(
        &self,
        device_key: &str,
        scope: &str,
        new: CounterState,
        expected: CounterState,
    ) -> Result<(), StoreError> {
        self.inner.put_counter(device_key, scope, new, expected)
    }
}

/// Store wrapper whose counter row changes on every read, simulating a live
/// holder cycling the lease while we watch.
struct ChurningStore {
    inner: SqliteLedgerStore,
}

impl ChurningStore {
    const fn new(inner: SqliteLedgerStore) -> Self {
        Self { inner }
    }
}

impl LedgerStore for ChurningStore {
    fn get_request(
        &self,
        device_key: &str,
        workflow_id: u64,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.inner.get_request(device_key, workflow_id)
    }

    fn put_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        self.inner.put_request(record)
    }

    fn max_workflow_id(
        &self,
        device_key: &str,
        scope: &str,
        at_or_above: Option<u64>,
    ) -> Result<Option<u64>, StoreError> {
        self.inner.max_workflow_id(device_key, scope, at_or_above)
    }

    fn active_heads(
        &self,
        device_key: &str,
        min_workflow_id: u64,
        page: Option<PageToken>,
        page_size: usize,
    ) -> Result<Page<RequestRecord>, StoreError> {
        self.inner
            .active_heads(device_key, min_workflow_id, page, page_size)
    }

    fn latest_for_name(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.inner.latest_for_name(device_key, scope, mitigation_name)
    }

    fn record_for_version(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
        mitigation_version: u32,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.inner
            .record_for_version(device_key, scope, mitigation_name, mitigation_version)
    }

    fn mark_superseded(
        &self,
        device_key: &str,
        workflow_id: u64,
        successor_workflow_id: u64,
    ) -> Result<(), StoreError> {
        self.inner
            .mark_superseded(device_key, workflow_id, successor_workflow_id)
    }

    fn set_workflow_status(
        &self,
        device_key: &str,
        workflow_id: u64,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        self.inner.set_workflow_status(device_key, workflow_id, status)
    }

    fn get_counter(
        &self,
        device_key: &str,
        scope: &str,
    ) -> Result<Option<CounterRecord>, StoreError> {
        // Advance the row before reporting it so every observation differs.
        if let Some(row) = self.inner.get_counter(device_key, scope)? {
            let churned = CounterState {
                counter: row.counter + 1,
                lock_status: LockStatus::Locked,
            };
            self.inner
                .put_counter(device_key, scope, churned, row.state())?;
        }
        self.inner.get_counter(device_key, scope)
    }

    fn init_counter(&self, record: &CounterRecord) -> Result<(), StoreError> {
        self.inner.init_counter(record)
    }

    fn put_counter(
        &self,
        device_key: &str,
        scope: &str,
        new: CounterState,
        expected: CounterState,
    ) -> Result<(), StoreError> {
        self.inner.put_counter(device_key, scope, new, expected)
    }
}
