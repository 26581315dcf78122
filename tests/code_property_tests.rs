//! Property-based tests for code issuance and consumption
//!
//! These use proptest to drive the code service through arbitrary sequences
//! of issue, consume and cancel operations over a deliberately small code
//! range, so collisions between candidate codes are frequent. After every
//! step the store must still satisfy the invariants the handoffs rely on.
//!
//! What these tests DON'T cover (deliberately):
//!
//! - Threads racing for one code (see concurrency_tests.rs)
//! - The shipment lifecycle (see scenarios.rs)

use delivery_confirmation::{
    CodeKind, CodeRecord, ConfirmationCodeService, Rejection, StoreError, Verdict,
    config::Config,
    memory_store::MemoryStore,
    source::{RandomCodeSource, SequenceCodeSource},
    store::CodeStore,
};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const SHIPMENTS: [&str; 4] = ["ship_a", "ship_b", "ship_c", "ship_d"];

#[derive(Debug, Clone)]
enum Op {
    Issue(usize, CodeKind),
    Consume(usize, CodeKind),
    Cancel(usize, CodeKind),
}

fn kind_strategy() -> impl Strategy<Value = CodeKind> {
    prop_oneof![
        Just(CodeKind::WarehouseToDriver),
        Just(CodeKind::DriverToRecipient),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let shipment = 0..SHIPMENTS.len();
    prop_oneof![
        3 => (shipment.clone(), kind_strategy()).prop_map(|(s, k)| Op::Issue(s, k)),
        1 => (shipment.clone(), kind_strategy()).prop_map(|(s, k)| Op::Consume(s, k)),
        1 => (shipment, kind_strategy()).prop_map(|(s, k)| Op::Cancel(s, k)),
    ]
}

fn small_space_service() -> ConfirmationCodeService<MemoryStore> {
    ConfirmationCodeService::with_source(
        Arc::new(MemoryStore::new()),
        Arc::new(RandomCodeSource),
        Config::default().set_code_range(100_000, 100_020),
    )
}

fn all_records(store: &MemoryStore) -> Vec<CodeRecord> {
    SHIPMENTS
        .iter()
        .flat_map(|s| store.history(s).unwrap())
        .collect()
}

fn apply(service: &ConfirmationCodeService<MemoryStore>, op: &Op) {
    match op {
        Op::Issue(s, kind) => {
            service.generate(SHIPMENTS[*s], *kind, Some("staff")).unwrap();
        }
        Op::Consume(s, kind) => {
            if let Some(active) = service.active_code(SHIPMENTS[*s], *kind).unwrap() {
                let verdict = service
                    .validate_and_consume_for(&active.code, SHIPMENTS[*s], *kind, "driver")
                    .unwrap();
                assert_eq!(verdict, Verdict::Valid(*kind));
            }
        }
        Op::Cancel(s, kind) => {
            service.cancel_active(SHIPMENTS[*s], *kind, "admin").unwrap();
        }
    }
}

proptest! {
    /// Property: no two unconsumed records ever share a code, and each
    /// shipment/kind pair has at most one unconsumed record.
    #[test]
    fn prop_active_codes_are_unique(ops in prop::collection::vec(op_strategy(), 1..=40)) {
        let service = small_space_service();

        for op in &ops {
            apply(&service, op);

            let records = all_records(service.store());
            let mut codes = HashSet::new();
            let mut pairs = HashSet::new();
            for record in records.iter().filter(|r| !r.consumed) {
                prop_assert!(codes.insert(record.code.clone()), "code {} active twice", record.code);
                prop_assert!(pairs.insert(record.pair_key()), "pair {} active twice", record.pair_key());
            }
        }
    }

    /// Property: records are never removed; every issue adds exactly one.
    #[test]
    fn prop_history_is_append_only(ops in prop::collection::vec(op_strategy(), 1..=30)) {
        let service = small_space_service();
        let mut issued: HashMap<usize, usize> = HashMap::new();

        for op in &ops {
            apply(&service, op);
            if let Op::Issue(s, _) = op {
                *issued.entry(*s).or_default() += 1;
            }
        }

        for (s, shipment) in SHIPMENTS.iter().enumerate() {
            let history = service.store().history(shipment).unwrap();
            prop_assert_eq!(history.len(), issued.get(&s).copied().unwrap_or(0));
        }
    }

    /// Property: once a newer code is issued for the pair, the older one is
    /// rejected as used.
    #[test]
    fn prop_supersession_retires_old_code(first in 100_000u32..=999_999, second in 100_000u32..=999_999) {
        prop_assume!(first != second);
        let service = ConfirmationCodeService::with_source(
            Arc::new(MemoryStore::new()),
            Arc::new(SequenceCodeSource::new([first.to_string(), second.to_string()])),
            Config::default(),
        );

        service.generate("ship_a", CodeKind::WarehouseToDriver, None).unwrap();
        service.generate("ship_a", CodeKind::WarehouseToDriver, None).unwrap();

        let verdict = service
            .validate_and_consume(&first.to_string(), "ship_a", "driver")
            .unwrap();
        prop_assert_eq!(verdict, Verdict::Rejected(Rejection::NotFoundOrUsed));

        let verdict = service
            .validate_and_consume(&second.to_string(), "ship_a", "driver")
            .unwrap();
        prop_assert!(verdict.is_valid());
    }

    /// Property: a mismatched shipment never consumes the code.
    #[test]
    fn prop_mismatch_leaves_code_unconsumed(code in 100_000u32..=999_999, other in "[a-z]{3,8}") {
        prop_assume!(other != "ship_a");
        let code = code.to_string();
        let service = ConfirmationCodeService::with_source(
            Arc::new(MemoryStore::new()),
            Arc::new(SequenceCodeSource::new([code.clone()])),
            Config::default(),
        );
        service.generate("ship_a", CodeKind::DriverToRecipient, None).unwrap();

        let verdict = service.validate_and_consume(&code, &other, "driver").unwrap();
        prop_assert_eq!(verdict, Verdict::Rejected(Rejection::ShipmentMismatch));

        let verdict = service.validate_and_consume(&code, "ship_a", "driver").unwrap();
        prop_assert_eq!(verdict, Verdict::Valid(CodeKind::DriverToRecipient));
    }

    /// Property: anything that is not exactly six digits is turned away
    /// before the store is consulted.
    #[test]
    fn prop_malformed_codes_never_reach_the_store(input in "\\PC{0,12}") {
        let trimmed = input.trim();
        prop_assume!(!(trimmed.len() == 6 && trimmed.bytes().all(|b| b.is_ascii_digit())));

        let store = Arc::new(CountingStore::default());
        let service = ConfirmationCodeService::new(store.clone());

        let verdict = service.validate_and_consume(&input, "ship_a", "driver").unwrap();
        prop_assert_eq!(verdict, Verdict::Rejected(Rejection::InvalidFormat));
        let verdict = service.validate_without_consuming(&input, "ship_a").unwrap();
        prop_assert_eq!(verdict, Verdict::Rejected(Rejection::InvalidFormat));
        prop_assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn listed_malformed_inputs_are_rejected() {
    let store = Arc::new(CountingStore::default());
    let service = ConfirmationCodeService::new(store.clone());

    for input in ["12345", "1234567", "12a456", ""] {
        let verdict = service.validate_and_consume(input, "ship_a", "driver").unwrap();
        assert_eq!(verdict.reason(), Some(Rejection::InvalidFormat), "{input:?}");
    }
    assert_eq!(delivery_confirmation::utils::normalise_code(None), None);
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);
}

/// Wraps the in-memory store and counts every call made through it.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    calls: AtomicUsize,
}

impl CountingStore {
    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl CodeStore for CountingStore {
    fn find_unconsumed(&self, code: &str) -> Result<Option<CodeRecord>, StoreError> {
        self.tick();
        self.inner.find_unconsumed(code)
    }

    fn find_active_for_shipment(
        &self,
        shipment_id: &str,
        kind: CodeKind,
    ) -> Result<Option<CodeRecord>, StoreError> {
        self.tick();
        self.inner.find_active_for_shipment(shipment_id, kind)
    }

    fn insert(
        &self,
        shipment_id: &str,
        code: &str,
        kind: CodeKind,
        issued_by: Option<&str>,
    ) -> Result<Option<CodeRecord>, StoreError> {
        self.tick();
        self.inner.insert(shipment_id, code, kind, issued_by)
    }

    fn supersede_active(&self, shipment_id: &str, kind: CodeKind) -> Result<usize, StoreError> {
        self.tick();
        self.inner.supersede_active(shipment_id, kind)
    }

    fn mark_consumed(&self, id: &str, consumed_by: &str) -> Result<bool, StoreError> {
        self.tick();
        self.inner.mark_consumed(id, consumed_by)
    }

    fn history(&self, shipment_id: &str) -> Result<Vec<CodeRecord>, StoreError> {
        self.tick();
        self.inner.history(shipment_id)
    }
}
