use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rust_decimal::Decimal;

use stockhold_core::{
    BatchId, DraftInvoiceId, LineItemTempId, ManualClock, ProductId, Quantity, WarehouseId,
};
use stockhold_infra::{EngineConfig, FifoRequest, InMemoryReservationRepository, ReservationEngine};
use stockhold_reservations::{
    AllocationLine, AllocationMethod, AllocationOutcome, HoldExemption, ProcurementChannel,
    Reservation, ReservationStatus, StockBatch, compute_availability, fifo_select,
};

fn batches(n: i64) -> Vec<StockBatch> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (1..=n)
        .map(|i| StockBatch {
            id: BatchId::new(i).unwrap(),
            batch_number: format!("LOT-{i}"),
            product_id: ProductId::new(1).unwrap(),
            warehouse_id: WarehouseId::new(1).unwrap(),
            quantity_on_hand: Quantity::from_int(1_000),
            quantity_consumed: Quantity::ZERO,
            procurement_channel: ProcurementChannel::Local,
            unit_cost: Decimal::new(1250, 2),
            received_at: start + Duration::days(i),
            version: 0,
        })
        .collect()
}

/// One live hold of 10 per (draft, batch) pair.
fn holds(drafts: i64, batch_count: i64) -> Vec<Reservation> {
    let now = Utc::now();
    (1..=drafts)
        .map(|d| Reservation {
            id: Default::default(),
            draft_invoice_id: DraftInvoiceId::new(d).ok(),
            line_item_temp_id: LineItemTempId::new(format!("line-{d}")).unwrap(),
            product_id: ProductId::new(1).unwrap(),
            warehouse_id: WarehouseId::new(1).unwrap(),
            unit: "pcs".to_string(),
            requested_quantity: Quantity::from_int(10 * batch_count as u32),
            allocations: (1..=batch_count)
                .map(|b| AllocationLine {
                    batch_id: BatchId::new(b).unwrap(),
                    quantity: Quantity::from_int(10),
                })
                .collect(),
            method: AllocationMethod::Manual,
            outcome: AllocationOutcome::Full,
            status: ReservationStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::minutes(30),
            invoice_item_id: None,
        })
        .collect()
}

fn bench_availability(c: &mut Criterion) {
    let mut group = c.benchmark_group("availability");

    for drafts in [10_i64, 100, 1000].iter() {
        let bs = batches(20);
        let rs = holds(*drafts, 20);
        let now = Utc::now();
        group.throughput(Throughput::Elements(*drafts as u64));
        group.bench_with_input(BenchmarkId::new("compute_with_holds", drafts), drafts, |b, _| {
            b.iter(|| black_box(compute_availability(&bs, &rs, HoldExemption::None, now)));
        });
    }

    group.finish();
}

fn bench_fifo_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo_select");
    let now = Utc::now();

    for batch_count in [10_i64, 100, 1000].iter() {
        let view = compute_availability(&batches(*batch_count), &[], HoldExemption::None, now);
        let required = Quantity::from_int(1_000 * (*batch_count as u32) / 2);
        group.bench_with_input(BenchmarkId::new("half_of_stock", batch_count), batch_count, |b, _| {
            b.iter(|| black_box(fifo_select(&view, black_box(required)).unwrap()));
        });
    }

    group.finish();
}

fn bench_engine_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_allocate");
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("fifo_reallocate_same_line", |b| {
        let repo = Arc::new(InMemoryReservationRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = ReservationEngine::new(repo, clock, EngineConfig::default());
        rt.block_on(async {
            for batch in batches(20) {
                engine.receive_batch(batch).await.unwrap();
            }
        });

        b.iter(|| {
            let request = FifoRequest {
                draft_invoice_id: DraftInvoiceId::new(1).ok(),
                product_id: ProductId::new(1).unwrap(),
                warehouse_id: WarehouseId::new(1).unwrap(),
                required_quantity: black_box(Quantity::from_int(2_500)),
                unit: "pcs".to_string(),
                line_item_temp_id: LineItemTempId::new("line-1").unwrap(),
            };
            rt.block_on(engine.allocate_fifo(request)).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_availability, bench_fifo_select, bench_engine_allocate);
criterion_main!(benches);
