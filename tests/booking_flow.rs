mod common;

use chrono::Duration;
use std::sync::atomic::Ordering;

use cinema_booking::error::{BookingError, ErrorKind};
use cinema_booking::models::{
    BookingStatus, Money, PaymentDetails, PaymentMethod, PaymentStatus, ReservationStatus, SeatStatus,
};
use cinema_booking::services::booking::is_well_formed_booking_code;
use cinema_booking::services::incident::RefundOutcome;
use cinema_booking::services::payment::DECLINED_TOKEN;
use cinema_booking::services::RefundState;
use cinema_booking::store::BookingStore;

use common::{card, faulty_harness, seats, Harness, ALICE, BOB, SHOWTIME};

#[tokio::test]
async fn hold_conflict_expiry_confirm_and_cancel() {
    let h = Harness::new();

    // Бронь {A1, A2}: 10 + 10.
    let first = h.hold(ALICE, &["A1", "A2"]).await;
    assert_eq!(first.total_amount, Money::from_major(20));
    for number in ["A1", "A2"] {
        let seat = h.seat(number).await;
        assert_eq!(seat.status, SeatStatus::Held);
        assert!(seat.is_owned_by(first.id));
    }

    // Пересекающаяся бронь проигрывает и называет спорное место.
    let err = h
        .state
        .reservations
        .create_reservation(BOB, SHOWTIME, seats(&["A2", "A3"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.seats(), seats(&["A2"]).as_slice());
    assert_eq!(h.seat("A3").await.status, SeatStatus::Available);

    // Никто не подтвердил: уборщик забирает места.
    h.clock.advance(Duration::minutes(5) + Duration::seconds(1));
    let report = h.state.sweeper.run_once().await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.seats_released, 2);
    assert_eq!(h.reservation(first.id).await.status, ReservationStatus::Expired);
    for number in ["A1", "A2"] {
        let seat = h.seat(number).await;
        assert_eq!(seat.status, SeatStatus::Available);
        assert_eq!(seat.holder_reference, None);
        assert_eq!(seat.hold_expiry, None);
    }

    // Бронь {B1} и оплата.
    let second = h.hold(BOB, &["B1"]).await;
    let booking = h
        .state
        .confirmer
        .confirm_booking(BOB, second.id, card())
        .await
        .unwrap();
    assert!(is_well_formed_booking_code(&booking.code));
    assert!(booking.code.starts_with("BK-261017-"));
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.total_amount, Money::from_major(10));
    assert_eq!(h.seat("B1").await.status, SeatStatus::Booked);
    assert_eq!(h.reservation(second.id).await.status, ReservationStatus::Confirmed);

    let payment = h.store.payment_for_booking(booking.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.transaction_id, booking.payment_reference);

    // Отмена до начала сеанса.
    let outcome = h.state.cancellations.cancel_booking(BOB, booking.id).await.unwrap();
    assert_eq!(outcome.refund, RefundState::Refunded);
    assert_eq!(outcome.booking.status, BookingStatus::Cancelled);
    assert_eq!(h.gateway.refunds(), vec![booking.payment_reference.clone()]);
    assert_eq!(h.seat("B1").await.status, SeatStatus::Available);

    let stored = h.store.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(stored.cancelled_at, Some(h.now()));
    let payment = h.store.payment_for_booking(booking.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn booking_total_is_locked_at_hold_time() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1", "A2"]).await;

    // Каталог поднимает цену уже после создания брони.
    assert!(h.store.set_seat_price(SHOWTIME, "A1", Money::from_major(15)));

    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();
    assert_eq!(booking.total_amount, Money::from_major(20));
    assert_eq!(h.gateway.charges()[0].amount, Money::from_major(20));
}

#[tokio::test]
async fn price_change_before_hold_is_charged_as_held() {
    let h = Harness::new();
    assert!(h.store.set_seat_price(SHOWTIME, "A1", Money::from_major(15)));

    let reservation = h.hold(ALICE, &["A1", "A2"]).await;
    assert_eq!(reservation.total_amount, Money::from_major(25));

    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();
    assert_eq!(booking.total_amount, Money::from_major(25));
    assert_eq!(h.gateway.charges()[0].amount, Money::from_major(25));
}

#[tokio::test]
async fn declined_payment_keeps_hold_usable() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1", "A2"]).await;

    let declined = PaymentDetails {
        method: PaymentMethod::Card,
        token: DECLINED_TOKEN.to_string(),
    };
    let err = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, declined)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PaymentDeclined);
    assert_eq!(err.seats(), seats(&["A1", "A2"]).as_slice());
    assert_eq!(h.seat("A1").await.status, SeatStatus::Held);
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Pending);

    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();
    assert_eq!(booking.seat_numbers, seats(&["A1", "A2"]));
}

#[tokio::test]
async fn unavailable_gateway_changes_nothing() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;
    h.gateway.set_unavailable(true);

    let err = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Held);
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Pending);
}

#[tokio::test]
async fn confirm_at_expiry_instant_still_succeeds() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;

    h.clock.set(reservation.hold_expiry);
    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();
    assert_eq!(booking.reservation_id, reservation.id);
}

#[tokio::test]
async fn expired_but_unswept_hold_cannot_be_confirmed() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;

    h.clock.set(reservation.hold_expiry + Duration::milliseconds(1));
    let err = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::HoldExpired { .. }));
    assert!(h.gateway.charges().is_empty());
    // Бронь убрана сразу, не дожидаясь уборщика.
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Expired);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Available);
}

#[tokio::test]
async fn only_owner_can_confirm_pending_hold() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;

    let err = h
        .state
        .confirmer
        .confirm_booking(BOB, reservation.id, card())
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::ReservationNotFound(_)));

    h.state.reservations.cancel_reservation(ALICE, reservation.id).await.unwrap();
    let err = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::ReservationNotPending {
            status: ReservationStatus::Cancelled,
            ..
        }
    ));
    assert!(h.gateway.charges().is_empty());
}

#[tokio::test]
async fn failed_commit_after_charge_is_refunded_and_escalated() {
    let (h, faulty) = faulty_harness();
    let reservation = h.hold(ALICE, &["A1", "A2"]).await;
    faulty.fail_booking_insert.store(true, Ordering::SeqCst);

    let err = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap_err();

    let charge = h.gateway.charges().remove(0);
    match err {
        BookingError::FatalInconsistency {
            reservation_id,
            ref transaction_id,
            amount,
        } => {
            assert_eq!(reservation_id, reservation.id);
            assert_eq!(transaction_id, &charge.transaction_id);
            assert_eq!(amount, Money::from_major(20));
        }
        other => panic!("expected FatalInconsistency, got {other:?}"),
    }

    let incidents = h.incidents.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].transaction_id, charge.transaction_id);
    assert_eq!(incidents[0].compensation, RefundOutcome::Refunded);
    assert_eq!(h.gateway.refunds(), vec![charge.transaction_id]);

    // Единица работы откатилась целиком.
    assert_eq!(h.seat("A1").await.status, SeatStatus::Held);
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Pending);
    assert!(h.store.payments().is_empty());
}

#[tokio::test]
async fn failed_compensation_is_still_escalated() {
    let (h, faulty) = faulty_harness();
    let reservation = h.hold(ALICE, &["A1"]).await;
    faulty.fail_booking_insert.store(true, Ordering::SeqCst);
    h.gateway.set_fail_refunds(true);

    let err = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FatalInconsistency);

    let incidents = h.incidents.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].compensation, RefundOutcome::Failed);
}

#[tokio::test]
async fn concurrent_confirms_share_one_booking_and_keep_the_payment() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1", "A2"]).await;
    let state = h.with_rendezvous(2);

    // Оба запроса проходят проверки до того, как кто-то из них запишет бронирование.
    let (first, second) = tokio::join!(
        state.confirmer.confirm_booking(ALICE, reservation.id, card()),
        state.confirmer.confirm_booking(ALICE, reservation.id, card()),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.code, second.code);

    // Шлюз провёл одно списание, и его никто не вернул.
    let charges = h.gateway.charges();
    assert_eq!(charges.len(), 1);
    assert_eq!(first.payment_reference, charges[0].transaction_id);
    assert!(h.gateway.refunds().is_empty());
    assert!(h.incidents.incidents().is_empty());

    let payments = h.store.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Completed);
    assert_eq!(h.store.bookings_for_user(ALICE).await.unwrap().len(), 1);
    assert_eq!(h.reservation(reservation.id).await.status, ReservationStatus::Confirmed);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Booked);
}

#[tokio::test]
async fn booking_code_collision_is_regenerated() {
    let (h, faulty) = faulty_harness();
    let reservation = h.hold(ALICE, &["A1"]).await;
    faulty.code_collisions.store(2, Ordering::SeqCst);

    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();
    assert!(is_well_formed_booking_code(&booking.code));
    assert_eq!(faulty.code_collisions.load(Ordering::SeqCst), 0);
    assert!(h.incidents.incidents().is_empty());
}

#[tokio::test]
async fn cancel_requires_confirmed_booking_before_showtime() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;
    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();

    let err = h.state.cancellations.cancel_booking(BOB, booking.id).await.unwrap_err();
    assert!(matches!(err, BookingError::BookingNotFound(_)));

    h.clock.advance(Duration::days(1));
    let err = h.state.cancellations.cancel_booking(ALICE, booking.id).await.unwrap_err();
    assert!(matches!(err, BookingError::ShowtimeStarted(SHOWTIME)));
    assert_eq!(h.seat("A1").await.status, SeatStatus::Booked);
}

#[tokio::test]
async fn failed_refund_does_not_block_release() {
    let h = Harness::new();
    let reservation = h.hold(ALICE, &["A1"]).await;
    let booking = h
        .state
        .confirmer
        .confirm_booking(ALICE, reservation.id, card())
        .await
        .unwrap();
    h.gateway.set_fail_refunds(true);

    let outcome = h.state.cancellations.cancel_booking(ALICE, booking.id).await.unwrap();
    assert_eq!(outcome.refund, RefundState::Failed);
    assert_eq!(h.seat("A1").await.status, SeatStatus::Available);

    let payment = h.store.payment_for_booking(booking.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);

    let err = h.state.cancellations.cancel_booking(ALICE, booking.id).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::BookingNotConfirmed {
            status: BookingStatus::Cancelled,
            ..
        }
    ));
}
