mod common;

use chrono::Duration;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

use cinema_booking::error::ErrorKind;
use cinema_booking::models::{ReservationStatus, SeatStatus};
use cinema_booking::store::BookingStore;

use common::{card, faulty_harness, seats, Harness, SweepGate, ALICE, BOB, SHOWTIME};

const SEAT_NAMES: [&str; 8] = ["A1", "A2", "A3", "A4", "A5", "B1", "B2", "B3"];

/// Запускает все запросы параллельно и проверяет, что ни одно место не занято дважды.
fn race(requests: Vec<BTreeSet<usize>>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let h = Harness::new();
        let requests: Vec<Vec<String>> = requests
            .into_iter()
            .map(|set| set.into_iter().map(|i| SEAT_NAMES[i].to_string()).collect())
            .collect();

        let handles: Vec<_> = requests
            .iter()
            .enumerate()
            .map(|(i, numbers)| {
                let manager = h.state.reservations.clone();
                let numbers = numbers.clone();
                tokio::spawn(async move { manager.create_reservation(1_000 + i as i64, SHOWTIME, numbers).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let mut owner: HashMap<String, uuid::Uuid> = HashMap::new();
        for result in &results {
            if let Ok(reservation) = result {
                for number in &reservation.seat_numbers {
                    assert!(
                        owner.insert(number.clone(), reservation.id).is_none(),
                        "seat {number} won by two holds"
                    );
                }
            }
        }

        for (i, result) in results.iter().enumerate() {
            let overlaps_other = requests
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && other.iter().any(|n| requests[i].contains(n)));
            match result {
                Ok(_) => {}
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::Conflict);
                    assert!(overlaps_other, "uncontested request {i} failed: {err}");
                    // Проигравший упёрся в место, которое держит победитель.
                    assert!(err.seats().iter().all(|n| owner.contains_key(n)));
                }
            }
        }

        let stored = h.store.seats(SHOWTIME).await.unwrap();
        let held: Vec<_> = stored.iter().filter(|s| s.status == SeatStatus::Held).collect();
        assert_eq!(held.len(), owner.len());
        for seat in held {
            assert_eq!(seat.holder_reference, owner.get(&seat.seat_number).copied());
        }
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn racing_holds_never_double_sell(
        requests in prop::collection::vec(prop::collection::btree_set(0..SEAT_NAMES.len(), 1..4), 2..8)
    ) {
        race(requests);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_wins_a_seat() {
    let h = Harness::new();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let manager = h.state.reservations.clone();
            tokio::spawn(async move { manager.create_reservation(500 + i, SHOWTIME, seats(&["A3"])).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn sweep_releases_only_strictly_after_expiry() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;

    h.clock.set(reservation.hold_expiry);
    let report = h.state.sweeper.run_once().await;
    assert_eq!(report.scanned, 0);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Held);

    h.clock.advance(Duration::milliseconds(1));
    let report = h.state.sweeper.run_once().await;
    assert_eq!(report.expired, 1);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Available);
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Expired);
}

#[tokio::test]
async fn sweep_leaves_seats_that_moved_on() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1", "A2"]).await;

    // A2 сняли с продажи, пока бронь ещё висела.
    let a2 = h.seat("A2").await;
    h.state.ledger.transition(&a2, SeatStatus::Blocked).await.unwrap();

    h.clock.advance(Duration::minutes(6));
    let report = h.state.sweeper.run_once().await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.seats_released, 1);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Available);
    assert_eq!(h.seat("A2").await.status, SeatStatus::Blocked);
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Expired);
}

#[tokio::test]
async fn sweep_loses_to_a_last_moment_confirm() {
    let (h, faulty) = faulty_harness();
    let reservation = h.hold(ALICE, &["A1", "A2"]).await;
    let gate = Arc::new(SweepGate::default());
    *faulty.sweep_gate.lock().unwrap() = Some(gate.clone());

    // Уборщик видит бронь истёкшей и останавливается перед освобождением.
    h.clock.set(reservation.hold_expiry + Duration::milliseconds(1));
    let sweeper = h.state.sweeper.clone();
    let sweep = tokio::spawn(async move { sweeper.run_once().await });
    gate.entered.notified().await;

    // Подтверждение по часам сервиса пришло ровно в срок.
    h.clock.set(reservation.hold_expiry);
    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();

    gate.release.notify_one();
    let report = sweep.await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.lost_races, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(report.seats_released, 0);
    assert_eq!(report.failed, 0);

    for number in ["A1", "A2"] {
        let seat = h.seat(number).await;
        assert_eq!(seat.status, SeatStatus::Booked);
        assert!(seat.is_owned_by(reservation.id));
    }
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Confirmed);
    assert_eq!(h.state.cancellations.get_booking(ALICE, booking.id).await.unwrap().id, booking.id);
}

#[tokio::test]
async fn one_failed_release_does_not_stop_the_batch() {
    let (h, faulty) = faulty_harness();
    let broken = h.hold(ALICE, &["A1"]).await;
    let healthy = h.hold(BOB, &["A2"]).await;
    faulty.failing_expirations.lock().unwrap().insert(broken.id);

    h.clock.advance(Duration::minutes(6));
    let report = h.state.sweeper.run_once().await;
    assert_eq!(report.scanned, 2);
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.reservation(healthy.id).await.status, ReservationStatus::Expired);
    assert_eq!(h.reservation(broken.id).await.status, ReservationStatus::Pending);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Held);

    // Следующий проход догоняет.
    faulty.failing_expirations.lock().unwrap().clear();
    let report = h.state.sweeper.run_once().await;
    assert_eq!(report.expired, 1);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Available);
}

#[tokio::test]
async fn overlapping_sweep_is_skipped() {
    let (h, faulty) = faulty_harness();
    let gate = Arc::new(SweepGate::default());
    *faulty.sweep_gate.lock().unwrap() = Some(gate.clone());

    let sweeper = h.state.sweeper.clone();
    let first = tokio::spawn(async move { sweeper.run_once().await });
    gate.entered.notified().await;

    let second = h.state.sweeper.run_once().await;
    assert!(second.skipped_tick);

    gate.release.notify_one();
    let first = first.await.unwrap();
    assert!(!first.skipped_tick);

    // Флаг снят: следующий проход снова работает.
    *faulty.sweep_gate.lock().unwrap() = None;
    assert!(!h.state.sweeper.run_once().await.skipped_tick);
}

#[tokio::test]
async fn sweeper_loop_stops_on_shutdown() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;
    h.clock.advance(Duration::minutes(6));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.state.sweeper.clone().run(shutdown_rx));

    // Первый тик интервала срабатывает сразу.
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while h.reservation(reservation.id).await.status != ReservationStatus::Expired {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn double_cancel_leaves_seats_untouched() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["B1", "B2"]).await;
    h.state.reservations.cancel_reservation(ALICE, reservation.id).await.unwrap();

    let before = h.store.seats(SHOWTIME).await.unwrap();
    let err = h
        .state
        .reservations
        .cancel_reservation(ALICE, reservation.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(h.store.seats(SHOWTIME).await.unwrap(), before);
}
