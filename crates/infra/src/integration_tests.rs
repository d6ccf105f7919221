//! Engine tests against the in-memory repository.
//!
//! Covers allocate -> extend/cancel/expire -> finalize end to end, driven by a
//! manual clock so expiry is deterministic.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use stockhold_core::{
        BatchId, DraftInvoiceId, InvoiceItemId, LineItemTempId, ManualClock, ProductId, Quantity,
        WarehouseId,
    };
    use stockhold_reservations::{
        AllocationLine, AllocationOutcome, InvoiceStatus, LineItemMapping, ManualLine,
        ProcurementChannel, ReservationError, ReservationEvent, ReservationStatus, StockBatch,
    };

    use crate::config::EngineConfig;
    use crate::engine::{EngineError, FifoRequest, FinalizeRequest, ManualRequest, ReservationEngine};
    use crate::store::{InMemoryReservationRepository, ReservationRepository};

    type Engine = ReservationEngine<Arc<InMemoryReservationRepository>>;

    struct Harness {
        engine: Arc<Engine>,
        repo: Arc<InMemoryReservationRepository>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryReservationRepository::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()));
        let engine = Arc::new(ReservationEngine::new(
            repo.clone(),
            clock.clone(),
            EngineConfig::default(),
        ));
        Harness { engine, repo, clock }
    }

    fn bid(v: i64) -> BatchId {
        BatchId::new(v).unwrap()
    }

    fn line(v: &str) -> LineItemTempId {
        LineItemTempId::new(v).unwrap()
    }

    fn draft(v: i64) -> DraftInvoiceId {
        DraftInvoiceId::new(v).unwrap()
    }

    fn qty(v: u32) -> Quantity {
        Quantity::from_int(v)
    }

    async fn seed(h: &Harness, id: i64, on_hand: u32, received: (i32, u32, u32)) -> StockBatch {
        h.engine
            .receive_batch(StockBatch {
                id: bid(id),
                batch_number: format!("LOT-{id}"),
                product_id: ProductId::new(1).unwrap(),
                warehouse_id: WarehouseId::new(1).unwrap(),
                quantity_on_hand: qty(on_hand),
                quantity_consumed: Quantity::ZERO,
                procurement_channel: ProcurementChannel::Local,
                unit_cost: Decimal::new(1000 + id, 2),
                received_at: Utc
                    .with_ymd_and_hms(received.0, received.1, received.2, 0, 0, 0)
                    .unwrap(),
                version: 0,
            })
            .await
            .unwrap()
    }

    /// A(500, 2024-01-01), B(300, 2024-02-01).
    async fn seed_ab(h: &Harness) {
        seed(h, 2, 300, (2024, 2, 1)).await;
        seed(h, 1, 500, (2024, 1, 1)).await;
    }

    fn fifo(d: Option<i64>, l: &str, required: u32) -> FifoRequest {
        FifoRequest {
            draft_invoice_id: d.map(draft),
            product_id: ProductId::new(1).unwrap(),
            warehouse_id: WarehouseId::new(1).unwrap(),
            required_quantity: qty(required),
            unit: "pcs".to_string(),
            line_item_temp_id: line(l),
        }
    }

    fn manual(d: i64, l: &str, lines: &[(i64, u32)]) -> ManualRequest {
        ManualRequest {
            draft_invoice_id: Some(draft(d)),
            product_id: ProductId::new(1).unwrap(),
            warehouse_id: WarehouseId::new(1).unwrap(),
            line_item_temp_id: line(l),
            unit: "pcs".to_string(),
            allocations: lines
                .iter()
                .map(|(b, q)| ManualLine { batch_id: bid(*b), quantity: qty(*q) })
                .collect(),
        }
    }

    fn mapping(l: &str, item: i64) -> LineItemMapping {
        LineItemMapping {
            line_item_temp_id: line(l),
            invoice_item_id: InvoiceItemId::new(item).unwrap(),
        }
    }

    fn finalize(d: i64, mappings: Vec<LineItemMapping>) -> FinalizeRequest {
        FinalizeRequest {
            draft_invoice_id: draft(d),
            line_item_mappings: mappings,
            target_status: InvoiceStatus::Issued,
            skip_stock_deduction: false,
        }
    }

    async fn allocatable(h: &Harness, d: Option<i64>) -> Vec<(i64, Quantity)> {
        h.engine
            .available_batches(ProductId::new(1).unwrap(), WarehouseId::new(1).unwrap(), d.map(draft))
            .await
            .unwrap()
            .into_iter()
            .map(|b| (b.batch_id.get(), b.quantity_allocatable))
            .collect()
    }

    #[tokio::test]
    async fn fifo_exhausts_oldest_batch_first() {
        let h = harness();
        seed_ab(&h).await;

        let receipt = h.engine.allocate_fifo(fifo(Some(10), "l1", 600)).await.unwrap();
        assert_eq!(
            receipt.reservation.allocations,
            vec![
                AllocationLine { batch_id: bid(1), quantity: qty(500) },
                AllocationLine { batch_id: bid(2), quantity: qty(100) },
            ]
        );
        assert_eq!(receipt.reservation.total_reserved(), qty(600));
        assert_eq!(receipt.outcome, AllocationOutcome::Full);
        assert_eq!(
            receipt.reservation.expires_at,
            h.clock_now() + Duration::minutes(30)
        );
    }

    impl Harness {
        fn clock_now(&self) -> chrono::DateTime<Utc> {
            use stockhold_core::Clock;
            self.clock.now()
        }
    }

    #[tokio::test]
    async fn fifo_shortfall_is_partial_not_an_error() {
        let h = harness();
        seed_ab(&h).await;

        let receipt = h.engine.allocate_fifo(fifo(Some(10), "l1", 900)).await.unwrap();
        assert_eq!(receipt.reservation.total_reserved(), qty(800));
        assert_eq!(receipt.outcome, AllocationOutcome::Partial);
        assert!(receipt.message.contains("partial"));
    }

    #[tokio::test]
    async fn fifo_against_other_drafts_holds_reserves_what_is_left() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(1), "x", 50)).await.unwrap();

        let receipt = h.engine.allocate_fifo(fifo(Some(2), "y", 250)).await.unwrap();
        assert_eq!(receipt.reservation.total_reserved(), qty(50));
        assert!(receipt.message.contains("partial"));
    }

    #[tokio::test]
    async fn zero_allocatable_is_insufficient_stock() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(1), "x", 100)).await.unwrap();

        let err = h.engine.allocate_fifo(fifo(Some(2), "y", 10)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Reservation(ReservationError::InsufficientStock { .. })
        ));
        assert!(h.repo.reservations_for_draft(draft(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reallocating_a_line_supersedes_the_previous_hold() {
        let h = harness();
        seed_ab(&h).await;

        let first = h.engine.allocate_fifo(fifo(Some(10), "l1", 600)).await.unwrap();
        // The first hold is exempt for its own replacement, so all 800 is usable.
        let second = h.engine.allocate_fifo(fifo(Some(10), "l1", 700)).await.unwrap();
        assert_eq!(second.superseded, Some(first.reservation.id));
        assert_eq!(second.reservation.total_reserved(), qty(700));

        let all = h.repo.reservations_for_draft(draft(10)).await.unwrap();
        let live: Vec<_> = all.iter().filter(|r| r.is_live_status()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.reservation.id);

        let old = h.engine.get(first.reservation.id).await.unwrap();
        assert_eq!(old.status, ReservationStatus::Cancelled);
        let history = h.engine.history(first.reservation.id).await.unwrap();
        assert!(matches!(
            history.last(),
            Some(ReservationEvent::Superseded { superseded_by, .. }) if *superseded_by == second.reservation.id
        ));

        assert_eq!(allocatable(&h, None).await, vec![(1, Quantity::ZERO), (2, qty(100))]);
    }

    #[tokio::test]
    async fn lines_of_the_same_draft_do_not_share_stock() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(10), "l1", 80)).await.unwrap();
        let second = h.engine.allocate_fifo(fifo(Some(10), "l2", 80)).await.unwrap();
        assert_eq!(second.reservation.total_reserved(), qty(20));
    }

    #[tokio::test]
    async fn unsaved_draft_line_is_superseded_on_reallocation() {
        let h = harness();
        seed_ab(&h).await;
        let a = h.engine.allocate_fifo(fifo(None, "uuid-line-1", 100)).await.unwrap();
        let b = h.engine.allocate_fifo(fifo(None, "uuid-line-1", 120)).await.unwrap();
        assert_eq!(b.superseded, Some(a.reservation.id));
        assert_eq!(h.engine.get(a.reservation.id).await.unwrap().status, ReservationStatus::Cancelled);
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(380)), (2, qty(300))]);

        // A saved draft using the same temp id is a different line.
        h.engine.allocate_fifo(fifo(Some(9), "uuid-line-1", 30)).await.unwrap();
        assert_eq!(h.engine.get(b.reservation.id).await.unwrap().status, ReservationStatus::Active);

        assert_eq!(h.engine.cancel_by_line_item(None, &line("uuid-line-1")).await.unwrap(), 1);
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(470)), (2, qty(300))]);
    }

    #[tokio::test]
    async fn own_draft_holds_are_shown_as_available_to_it() {
        let h = harness();
        seed(&h, 1, 500, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(10), "l1", 100)).await.unwrap();
        h.engine.allocate_fifo(fifo(Some(20), "l1", 150)).await.unwrap();

        assert_eq!(allocatable(&h, Some(10)).await, vec![(1, qty(350))]);
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(250))]);
    }

    #[tokio::test]
    async fn manual_over_allocatable_is_rejected_whole() {
        let h = harness();
        seed_ab(&h).await;

        let err = h
            .engine
            .allocate_manual(manual(10, "l1", &[(2, 100), (1, 600)]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Reservation(ReservationError::ReservationConflict { batch_id, .. }) if batch_id == bid(1)
        ));
        assert!(h.repo.reservations_for_draft(draft(10)).await.unwrap().is_empty());

        let ok = h
            .engine
            .allocate_manual(manual(10, "l1", &[(2, 100), (1, 500)]))
            .await
            .unwrap();
        assert_eq!(ok.reservation.total_reserved(), qty(600));
    }

    #[tokio::test]
    async fn manual_rejects_batches_of_other_products() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        let err = h.engine.allocate_manual(manual(10, "l1", &[(99, 1)])).await.unwrap_err();
        assert!(matches!(err, EngineError::Reservation(ReservationError::UnknownBatch(_))));
    }

    #[tokio::test]
    async fn expired_hold_stops_counting_before_the_sweep() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        let r = h.engine.allocate_fifo(fifo(Some(1), "l1", 60)).await.unwrap();
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(40))]);

        h.clock.advance(Duration::minutes(30));
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(100))]);
        assert_eq!(h.engine.get(r.reservation.id).await.unwrap().status, ReservationStatus::Active);

        let report = h.engine.sweep_expired().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(h.engine.get(r.reservation.id).await.unwrap().status, ReservationStatus::Expired);
        assert!(h.engine.list_by_draft(draft(1), None).await.unwrap().reservations.is_empty());

        // Second sweep finds nothing.
        assert_eq!(h.engine.sweep_expired().await.unwrap().expired, 0);
    }

    #[tokio::test]
    async fn extend_pushes_expiry_from_now() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(1), "l1", 10)).await.unwrap();
        h.engine.allocate_fifo(fifo(Some(1), "l2", 10)).await.unwrap();

        h.clock.advance(Duration::minutes(20));
        let extended = h.engine.extend(Some(draft(1)), Some(line("l1")), 45).await.unwrap();
        assert_eq!(extended.len(), 1);
        assert_eq!(extended[0].status, ReservationStatus::Extended);
        assert_eq!(extended[0].expires_at, h.clock_now() + Duration::minutes(45));

        // l2 was not extended and lapses at minute 30; l1 survives.
        h.clock.advance(Duration::minutes(15));
        let listed = h.engine.list_by_draft(draft(1), None).await.unwrap();
        assert_eq!(listed.reservations.len(), 1);
        assert_eq!(listed.total_reserved, qty(10));
    }

    #[tokio::test]
    async fn extend_rejects_expired_and_oversized_requests() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(1), "l1", 10)).await.unwrap();

        for minutes in [0, -5, 241, i64::MAX, i64::MIN] {
            let err = h.engine.extend(Some(draft(1)), None, minutes).await.unwrap_err();
            assert!(matches!(err, EngineError::Reservation(ReservationError::Validation(_))));
        }
        let err = h.engine.extend(None, None, 30).await.unwrap_err();
        assert!(matches!(err, EngineError::Reservation(ReservationError::Validation(_))));

        h.clock.advance(Duration::minutes(31));
        let err = h.engine.extend(Some(draft(1)), None, 30).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Reservation(ReservationError::ExpiredReservation { .. })
        ));
    }

    #[tokio::test]
    async fn extending_a_draft_skips_lines_that_already_lapsed() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        let old = h.engine.allocate_fifo(fifo(Some(5), "old", 10)).await.unwrap();
        h.clock.advance(Duration::minutes(25));
        let new = h.engine.allocate_fifo(fifo(Some(5), "new", 10)).await.unwrap();
        h.clock.advance(Duration::minutes(6));

        let extended = h.engine.extend(Some(draft(5)), None, 30).await.unwrap();
        assert_eq!(extended.iter().map(|r| r.id).collect::<Vec<_>>(), vec![new.reservation.id]);
        assert_eq!(extended[0].expires_at, h.clock_now() + Duration::minutes(30));
        assert_eq!(h.engine.get(old.reservation.id).await.unwrap().status, ReservationStatus::Active);

        // Targeting the lapsed line alone still reports it.
        let err = h.engine.extend(Some(draft(5)), Some(line("old")), 30).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Reservation(ReservationError::ExpiredReservation { ref line_item_temp_id }) if line_item_temp_id.as_str() == "old"
        ));
    }

    #[tokio::test]
    async fn cancel_releases_immediately_and_is_idempotent() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        let r = h.engine.allocate_fifo(fifo(Some(1), "l1", 70)).await.unwrap();

        let cancelled = h.engine.cancel(r.reservation.id).await.unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(100))]);

        let again = h.engine.cancel(r.reservation.id).await.unwrap();
        assert_eq!(again.status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_by_draft_and_line() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(1), "a", 10)).await.unwrap();
        h.engine.allocate_fifo(fifo(Some(1), "b", 10)).await.unwrap();
        h.engine.allocate_fifo(fifo(Some(1), "c", 10)).await.unwrap();

        assert_eq!(h.engine.cancel_by_line_item(Some(draft(1)), &line("a")).await.unwrap(), 1);
        assert_eq!(h.engine.cancel_by_draft(draft(1)).await.unwrap(), 2);
        assert_eq!(h.engine.cancel_by_draft(draft(1)).await.unwrap(), 0);
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(100))]);
    }

    #[tokio::test]
    async fn finalize_consumes_and_converts() {
        let h = harness();
        seed_ab(&h).await;
        let r = h.engine.allocate_fifo(fifo(Some(5), "l1", 100)).await.unwrap();

        let receipt = h.engine.finalize(finalize(5, vec![mapping("l1", 900)])).await.unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.invoice.invoice_number, "INV-000001");
        assert_eq!(receipt.invoice.invoice_id, 5);
        assert_eq!(receipt.invoice.status, InvoiceStatus::Issued);
        assert_eq!(receipt.converted, vec![r.reservation.id]);
        assert_eq!(receipt.consumptions.len(), 1);
        assert_eq!(receipt.consumptions[0].quantity, qty(100));
        assert_eq!(receipt.consumptions[0].unit_cost_at_consumption, Decimal::new(1001, 2));

        let a = h.engine.batch_detail(bid(1)).await.unwrap();
        assert_eq!(a.batch.quantity_consumed, qty(100));
        assert_eq!(a.consumptions.len(), 1);
        assert_eq!(h.engine.get(r.reservation.id).await.unwrap().status, ReservationStatus::Converted);

        // Consumed stock is gone from availability, the converted hold no longer counts.
        assert_eq!(allocatable(&h, None).await, vec![(1, qty(400)), (2, qty(300))]);
    }

    #[tokio::test]
    async fn finalize_retry_returns_the_same_invoice() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(5), "l1", 10)).await.unwrap();

        let first = h.engine.finalize(finalize(5, vec![mapping("l1", 900)])).await.unwrap();
        let again = h.engine.finalize(finalize(5, vec![mapping("l1", 900)])).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.invoice.invoice_number, first.invoice.invoice_number);
        assert_eq!(again.consumptions, first.consumptions);
        assert_eq!(h.engine.batch_detail(bid(1)).await.unwrap().batch.quantity_consumed, qty(10));

        let err = h
            .engine
            .finalize(finalize(5, vec![mapping("l1", 901)]))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Reservation(ReservationError::AlreadyConverted));
    }

    #[tokio::test]
    async fn finalize_with_one_expired_line_changes_nothing() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        let early = h.engine.allocate_fifo(fifo(Some(5), "l1", 10)).await.unwrap();
        h.clock.advance(Duration::minutes(20));
        let late = h.engine.allocate_fifo(fifo(Some(5), "l2", 10)).await.unwrap();
        h.clock.advance(Duration::minutes(15));

        let err = h
            .engine
            .finalize(finalize(5, vec![mapping("l1", 1), mapping("l2", 2)]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Reservation(ReservationError::ExpiredReservation { ref line_item_temp_id }) if line_item_temp_id.as_str() == "l1"
        ));

        assert_eq!(h.engine.batch_detail(bid(1)).await.unwrap().batch.quantity_consumed, Quantity::ZERO);
        assert_eq!(h.engine.get(early.reservation.id).await.unwrap().status, ReservationStatus::Active);
        assert_eq!(h.engine.get(late.reservation.id).await.unwrap().status, ReservationStatus::Active);
        assert!(h.repo.finalized_invoice(draft(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_detects_ledger_drift() {
        let h = harness();
        let a = seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(5), "l1", 50)).await.unwrap();

        // Another system consumed most of the batch behind our back.
        let mut drifted = h.repo.load_batch(a.id).await.unwrap().unwrap();
        drifted.quantity_consumed = qty(80);
        h.repo.upsert_batch(drifted).await.unwrap();

        let err = h.engine.finalize(finalize(5, vec![mapping("l1", 1)])).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Reservation(ReservationError::InsufficientStockAtFinalize { .. })
        ));
        assert_eq!(h.engine.batch_detail(bid(1)).await.unwrap().batch.quantity_consumed, qty(80));
    }

    #[tokio::test]
    async fn finalize_without_stock_deduction_records_but_keeps_ledger() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        let r = h.engine.allocate_fifo(fifo(Some(5), "l1", 30)).await.unwrap();

        let mut req = finalize(5, vec![mapping("l1", 1)]);
        req.skip_stock_deduction = true;
        req.target_status = InvoiceStatus::Proforma;
        let receipt = h.engine.finalize(req).await.unwrap();

        assert!(!receipt.invoice.stock_deducted);
        assert_eq!(receipt.consumptions.len(), 1);
        assert_eq!(receipt.consumptions[0].quantity, qty(30));
        assert!(receipt.invoice.deductions.is_empty());
        assert_eq!(h.engine.get(r.reservation.id).await.unwrap().status, ReservationStatus::Converted);

        let a = h.engine.batch_detail(bid(1)).await.unwrap();
        assert_eq!(a.batch.quantity_consumed, Quantity::ZERO);
        assert_eq!(a.consumptions.len(), 1);
    }

    #[tokio::test]
    async fn receiving_cannot_shrink_a_batch_below_its_holds() {
        let h = harness();
        let a = seed(&h, 1, 100, (2024, 1, 1)).await;
        h.engine.allocate_fifo(fifo(Some(1), "l1", 60)).await.unwrap();

        let mut shrunk = a.clone();
        shrunk.quantity_on_hand = qty(50);
        let err = h.engine.receive_batch(shrunk.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::Reservation(ReservationError::Validation(_))));
        assert_eq!(h.engine.batch_detail(bid(1)).await.unwrap().batch.quantity_on_hand, qty(100));

        shrunk.quantity_on_hand = qty(60);
        let stored = h.engine.receive_batch(shrunk.clone()).await.unwrap();
        assert_eq!(stored.quantity_on_hand, qty(60));
        assert_eq!(allocatable(&h, None).await, vec![(1, Quantity::ZERO)]);

        // Once the hold lapses the floor drops with it.
        h.clock.advance(Duration::minutes(30));
        shrunk.quantity_on_hand = qty(10);
        assert!(h.engine.receive_batch(shrunk).await.is_ok());
    }

    #[tokio::test]
    async fn expiring_lists_holds_lapsing_soon() {
        let h = harness();
        seed(&h, 1, 100, (2024, 1, 1)).await;
        let soon = h.engine.allocate_fifo(fifo(Some(1), "a", 1)).await.unwrap();
        h.clock.advance(Duration::minutes(20));
        h.engine.allocate_fifo(fifo(Some(1), "b", 1)).await.unwrap();

        let due = h.engine.expiring(15).await.unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![soon.reservation.id]);

        for within in [-1, i64::MAX / 60_000, i64::MAX] {
            let err = h.engine.expiring(within).await.unwrap_err();
            assert!(matches!(err, EngineError::Reservation(ReservationError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn summary_reports_utilization() {
        let h = harness();
        seed(&h, 1, 300, (2024, 1, 1)).await;
        seed(&h, 2, 100, (2024, 2, 1)).await;
        h.engine.allocate_fifo(fifo(Some(1), "a", 100)).await.unwrap();

        let s = h
            .engine
            .summary(ProductId::new(1).unwrap(), WarehouseId::new(1).unwrap())
            .await
            .unwrap();
        assert_eq!(s.batch_count, 2);
        assert_eq!(s.quantity_reserved, qty(100));
        assert_eq!(s.utilization_percent, Decimal::from(25));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_never_oversell() {
        let h = harness();
        seed(&h, 1, 500, (2024, 1, 1)).await;

        let mut tasks = Vec::new();
        for d in 1..=10 {
            let engine = h.engine.clone();
            tasks.push(tokio::spawn(async move {
                engine.allocate_fifo(fifo(Some(d), "l1", 100)).await
            }));
        }

        let mut reserved = Quantity::ZERO;
        for t in tasks {
            if let Ok(receipt) = t.await.unwrap() {
                reserved += receipt.reservation.total_reserved();
            }
        }
        assert_eq!(reserved, qty(500));
        assert_eq!(allocatable(&h, None).await, vec![(1, Quantity::ZERO)]);
    }
}
