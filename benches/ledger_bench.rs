//! Nonce ledger hot-path benchmarks
//!
//! Benchmarks:
//! - Nonce allocation, single-threaded and contended
//! - Inclusion resolving a run of open waiters

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use txflood::types::{Address, Receipt, TxHash};
use txflood::AccountLedger;

fn receipt(block: u64) -> Receipt {
    Receipt {
        tx_hash: TxHash::default(),
        block_number: block,
        block_hash: TxHash::default(),
        success: true,
        gas_used: 21_000,
        effective_gas_price: 1,
        blob_gas_used: 0,
        blob_gas_price: 0,
        logs: 0,
    }
}

fn bench_allocate(c: &mut Criterion) {
    let ledger = AccountLedger::new(Address::new([1; 20]));
    c.bench_function("allocate_nonce", |b| {
        b.iter(|| black_box(ledger.allocate_nonce()))
    });

    let ledger = Arc::new(AccountLedger::new(Address::new([2; 20])));
    c.bench_function("allocate_nonce_4_threads", |b| {
        b.iter(|| {
            std::thread::scope(|s| {
                for _ in 0..4 {
                    let ledger = ledger.clone();
                    s.spawn(move || {
                        for _ in 0..256 {
                            black_box(ledger.allocate_nonce());
                        }
                    });
                }
            })
        })
    });
}

fn bench_mark_included(c: &mut Criterion) {
    let mut group = c.benchmark_group("mark_included");
    for waiters in [1u64, 16, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(waiters), &waiters, |b, &waiters| {
            b.iter_batched(
                || {
                    let ledger = AccountLedger::new(Address::new([3; 20]));
                    let handles: Vec<_> = (0..waiters)
                        .filter_map(|_| ledger.subscribe_nonce(ledger.allocate_nonce()))
                        .collect();
                    (ledger, handles)
                },
                |(ledger, handles)| {
                    black_box(ledger.mark_included(waiters - 1, &receipt(1), 1));
                    drop(handles);
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_allocate, bench_mark_included);
criterion_main!(benches);
