use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use apexfin_core::{Currency, UserId};
use apexfin_events::{EventEnvelope, InMemoryEventBus};
use apexfin_infra::event_store::InMemoryEventStore;
use apexfin_infra::ledger_service::{LedgerService, NewTransaction};
use apexfin_infra::wallet_service::WalletService;
use apexfin_ledger::{TransactionKind, TransactionMetadata};
use apexfin_wallet::{FundsSource, WalletId};

type Store = Arc<InMemoryEventStore>;
type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

/// Naive balance map: direct key-value updates, no events, no history.
struct NaiveBalanceStore {
    inner: RwLock<HashMap<WalletId, u64>>,
}

impl NaiveBalanceStore {
    fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn credit(&self, wallet_id: WalletId, amount: u64) {
        let mut map = self.inner.write().unwrap();
        *map.entry(wallet_id).or_insert(0) += amount;
    }
}

fn services() -> (Arc<WalletService<Store, Bus>>, LedgerService<Store, Bus>) {
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let wallets = Arc::new(WalletService::new(store.clone(), bus.clone()));
    let ledger = LedgerService::new(store, bus, wallets.clone());
    (wallets, ledger)
}

fn bench_credit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("wallet_credit");
    group.throughput(Throughput::Elements(1));

    let (wallets, _) = services();
    let wallet = wallets
        .get_or_create(UserId::new(), Currency::Mxn)
        .unwrap()
        .id_typed();
    group.bench_function("event_sourced", |b| {
        b.iter(|| {
            wallets
                .credit(black_box(wallet), black_box(1), FundsSource::Manual)
                .unwrap()
        })
    });

    let naive = NaiveBalanceStore::new();
    group.bench_function("naive_crud", |b| {
        b.iter(|| naive.credit(black_box(wallet), black_box(1)))
    });

    group.finish();
}

fn bench_rehydration(c: &mut Criterion) {
    let mut group = c.benchmark_group("wallet_rehydration");

    for stream_len in [8u64, 64, 512] {
        let (wallets, _) = services();
        let wallet = wallets
            .get_or_create(UserId::new(), Currency::Mxn)
            .unwrap()
            .id_typed();
        for _ in 0..stream_len {
            wallets.credit(wallet, 1, FundsSource::Manual).unwrap();
        }

        group.throughput(Throughput::Elements(stream_len));
        group.bench_with_input(
            BenchmarkId::from_parameter(stream_len),
            &stream_len,
            |b, _| b.iter(|| wallets.get(black_box(wallet)).unwrap()),
        );
    }

    group.finish();
}

fn bench_transfer_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_transfer");
    group.throughput(Throughput::Elements(1));

    let (wallets, ledger) = services();
    let from = wallets
        .get_or_create(UserId::new(), Currency::Mxn)
        .unwrap()
        .id_typed();
    let to = wallets
        .get_or_create(UserId::new(), Currency::Mxn)
        .unwrap()
        .id_typed();
    wallets
        .credit(from, 1_000_000_000_000, FundsSource::Manual)
        .unwrap();

    let mut seq = 0u64;
    group.bench_function("open_and_complete", |b| {
        b.iter(|| {
            seq += 1;
            let tx = ledger
                .open(NewTransaction {
                    kind: TransactionKind::Transfer,
                    from_wallet: Some(from),
                    to_wallet: Some(to),
                    amount: 1,
                    currency: Currency::Mxn,
                    description: "bench transfer".to_string(),
                    metadata: TransactionMetadata::default(),
                    idempotency_key: format!("bench-{seq}"),
                })
                .unwrap();
            ledger.complete(black_box(tx.id_typed())).unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_credit_throughput,
    bench_rehydration,
    bench_transfer_completion
);
criterion_main!(benches);
