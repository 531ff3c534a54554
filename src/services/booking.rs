//! Подтверждение брони: списание через шлюз и фиксация бронирования.
//!
//! Порядок важен:
//! 1. Бронь проверяется заново (владелец, PENDING, срок не истёк по часам
//!    сервиса, места всё ещё HELD этой бронью).
//! 2. Шлюз списывает зафиксированную при создании брони сумму. Отказ
//!    ничего не меняет - клиент может повторить до истечения срока.
//! 3. Места HELD -> BOOKED, бронирование, платёж и бронь CONFIRMED
//!    записываются одной единицей работы с версиями мест, прочитанными
//!    в шаге 1.
//! 4. Если после успешного списания запись не прошла, это не обычная
//!    ошибка: деньги возвращаются компенсирующим возвратом, а инцидент
//!    эскалируется через [`IncidentReporter`]. Исключение - гонка двух
//!    confirm одной брони: шлюз дедуплицирует списание по id брони, и
//!    проигравший получает уже записанное бронирование победителя.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::incident::{IncidentReporter, PaymentIncident, RefundOutcome};
use super::payment::{ChargeReceipt, PaymentGateway};
use super::reservation::{ensure_pending, owned_reservation};
use super::sweeper::release_expired_hold;
use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::error::{BookingError, BookingResult};
use crate::models::{
    Booking, BookingStatus, Payment, PaymentDetails, PaymentStatus, Reservation, ReservationStatus,
    Seat, SeatStatus,
};
use crate::store::{BookingStore, SeatWrite, StoreError, StoreResult, UnitOfWork};

/// Алфавит суффикса кода: без 0/O, 1/I/L.
pub const BOOKING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const BOOKING_CODE_SUFFIX_LEN: usize = 5;

/// Код вида `BK-261017-7KQ9X`: префикс, дата бронирования, случайный суффикс.
pub fn generate_booking_code<R: Rng + ?Sized>(prefix: &str, booked_at: DateTime<Utc>, rng: &mut R) -> String {
    let suffix: String = (0..BOOKING_CODE_SUFFIX_LEN)
        .map(|_| BOOKING_CODE_ALPHABET[rng.gen_range(0..BOOKING_CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}-{}", prefix, booked_at.format("%y%m%d"), suffix)
}

pub fn is_well_formed_booking_code(code: &str) -> bool {
    let mut parts = code.split('-');
    let (Some(prefix), Some(date), Some(suffix), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    prefix.len() == 2
        && prefix.bytes().all(|b| b.is_ascii_uppercase())
        && date.len() == 6
        && date.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == BOOKING_CODE_SUFFIX_LEN
        && suffix.bytes().all(|b| BOOKING_CODE_ALPHABET.contains(&b))
}

pub struct BookingConfirmer {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
    incidents: Arc<dyn IncidentReporter>,
    policy: BookingPolicy,
}

impl BookingConfirmer {
    pub fn new(
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        incidents: Arc<dyn IncidentReporter>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            gateway,
            incidents,
            policy,
        }
    }

    pub async fn confirm_booking(
        &self,
        user_id: i64,
        reservation_id: Uuid,
        payment: PaymentDetails,
    ) -> BookingResult<Booking> {
        if payment.token.trim().is_empty() {
            return Err(BookingError::InvalidRequest("payment token is required".to_string()));
        }

        let reservation = owned_reservation(self.store.as_ref(), user_id, reservation_id).await?;
        ensure_pending(&reservation)?;

        let now = self.clock.now();
        if reservation.is_expired_at(now) {
            self.expire_stale_hold(&reservation).await;
            return Err(BookingError::HoldExpired {
                id: reservation.id,
                expired_at: reservation.hold_expiry,
            });
        }

        let seats = self.held_seats(&reservation).await?;

        let receipt = match self
            .gateway
            .charge(reservation.total_amount, &payment, &reservation.id.to_string())
            .await
        {
            Ok(receipt) => receipt,
            Err(e) if e.is_decline() => {
                info!("Payment for reservation {} declined: {}", reservation.id, e);
                return Err(BookingError::PaymentDeclined {
                    reason: e.to_string(),
                    seats: reservation.seat_numbers.clone(),
                });
            }
            Err(e) => {
                warn!("Payment gateway unavailable for reservation {}: {}", reservation.id, e);
                return Err(BookingError::PaymentUnavailable(e.to_string()));
            }
        };

        match self.record_booking(&reservation, &seats, &payment, &receipt).await {
            Ok(booking) => {
                info!(
                    "✅ Booking {} confirmed for reservation {} ({} seats, {})",
                    booking.code,
                    reservation.id,
                    booking.seat_numbers.len(),
                    booking.total_amount
                );
                Ok(booking)
            }
            Err(cause) if cause.is_conflict() => match self.settled_by_same_charge(&reservation, &receipt).await {
                // Параллельный confirm той же брони уже записал бронирование
                // по этому же списанию: возвращать деньги нельзя.
                Ok(Some(booking)) => {
                    info!(
                        "Reservation {} already confirmed as {} by a concurrent request",
                        reservation.id, booking.code
                    );
                    Ok(booking)
                }
                Ok(None) => Err(self.escalate(&reservation, receipt, cause, true).await),
                Err(e) => {
                    error!("Could not re-read reservation {} after conflict: {}", reservation.id, e);
                    Err(self.escalate(&reservation, receipt, cause, false).await)
                }
            },
            Err(cause) => Err(self.escalate(&reservation, receipt, cause, true).await),
        }
    }

    /// Бронирование этой брони, оплаченное транзакцией `receipt`, если оно уже записано.
    async fn settled_by_same_charge(
        &self,
        reservation: &Reservation,
        receipt: &ChargeReceipt,
    ) -> StoreResult<Option<Booking>> {
        let current = self.store.reservation(reservation.id).await?;
        if current.map(|r| r.status) != Some(ReservationStatus::Confirmed) {
            return Ok(None);
        }

        let bookings = self.store.bookings_for_user(reservation.user_id).await?;
        Ok(bookings
            .into_iter()
            .find(|b| b.reservation_id == reservation.id && b.payment_reference == receipt.transaction_id))
    }

    /// Места брони, если все они всё ещё HELD именно ею.
    async fn held_seats(&self, reservation: &Reservation) -> BookingResult<Vec<Seat>> {
        let seats = self
            .store
            .seats_by_number(reservation.showtime_id, &reservation.seat_numbers)
            .await?;

        let lost: Vec<String> = reservation
            .seat_numbers
            .iter()
            .filter(|number| {
                !seats.iter().any(|seat| {
                    &seat.seat_number == *number
                        && seat.status == SeatStatus::Held
                        && seat.is_owned_by(reservation.id)
                })
            })
            .cloned()
            .collect();
        if !lost.is_empty() {
            return Err(BookingError::ConcurrencyLost { seats: lost });
        }
        Ok(seats)
    }

    async fn record_booking(
        &self,
        reservation: &Reservation,
        seats: &[Seat],
        payment: &PaymentDetails,
        receipt: &ChargeReceipt,
    ) -> Result<Booking, StoreError> {
        let booked_at = self.clock.now();
        let booking_id = Uuid::new_v4();
        let mut last_code = String::new();

        for attempt in 1..=self.policy.booking_code_attempts {
            let code = generate_booking_code(&self.policy.booking_code_prefix, booked_at, &mut rand::thread_rng());
            if self.store.booking_code_exists(&code).await? {
                warn!("Booking code {} already taken (attempt {})", code, attempt);
                last_code = code;
                continue;
            }

            let booking = Booking {
                id: booking_id,
                code: code.clone(),
                user_id: reservation.user_id,
                showtime_id: reservation.showtime_id,
                reservation_id: reservation.id,
                seat_numbers: reservation.seat_numbers.clone(),
                total_amount: reservation.total_amount,
                status: BookingStatus::Confirmed,
                payment_reference: receipt.transaction_id.clone(),
                booked_at,
                cancelled_at: None,
            };
            let payment_record = Payment {
                id: Uuid::new_v4(),
                booking_id,
                amount: receipt.amount,
                method: payment.method,
                transaction_id: receipt.transaction_id.clone(),
                status: PaymentStatus::Completed,
                created_at: booked_at,
            };

            let bookings = seats
                .iter()
                .map(|seat| SeatWrite::from_seat(seat, SeatStatus::Booked).owned_by(reservation.id));
            let unit = UnitOfWork::new()
                .seats(bookings)
                .reservation_status(reservation.id, ReservationStatus::Pending, ReservationStatus::Confirmed)
                .insert_booking(booking.clone())
                .insert_payment(payment_record);

            match self.store.apply(unit).await {
                Ok(_) => return Ok(booking),
                // Код заняли между проверкой и записью.
                Err(StoreError::DuplicateBookingCode(code)) => {
                    warn!("Booking code {} collided on insert (attempt {})", code, attempt);
                    last_code = code;
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::DuplicateBookingCode(last_code))
    }

    /// `compensate == false`: не удалось проверить, не оплачено ли этим
    /// списанием уже записанное бронирование, возврат оставляется оператору.
    async fn escalate(
        &self,
        reservation: &Reservation,
        receipt: ChargeReceipt,
        cause: StoreError,
        compensate: bool,
    ) -> BookingError {
        error!(
            "Payment {} captured for reservation {} but booking failed: {}",
            receipt.transaction_id, reservation.id, cause
        );

        let compensation = if !compensate {
            warn!("Compensating refund for {} withheld", receipt.transaction_id);
            RefundOutcome::Withheld
        } else {
            match self.gateway.refund(&receipt.transaction_id, receipt.amount).await {
                Ok(refund) => {
                    info!("Compensating refund {} issued for {}", refund.refund_id, receipt.transaction_id);
                    RefundOutcome::Refunded
                }
                Err(e) => {
                    error!("Compensating refund for {} failed: {}", receipt.transaction_id, e);
                    RefundOutcome::Failed
                }
            }
        };

        self.incidents.report(&PaymentIncident {
            reservation_id: reservation.id,
            transaction_id: receipt.transaction_id.clone(),
            amount: receipt.amount,
            cause: cause.to_string(),
            compensation,
        });

        BookingError::FatalInconsistency {
            reservation_id: reservation.id,
            transaction_id: receipt.transaction_id,
            amount: receipt.amount,
        }
    }

    /// Истёкшая, но ещё не убранная бронь освобождается сразу, тем же путём, что и у уборщика.
    async fn expire_stale_hold(&self, reservation: &Reservation) {
        match release_expired_hold(self.store.as_ref(), reservation).await {
            Ok(commit) => info!(
                "Reservation {} expired at confirm time, {} seats released",
                reservation.id,
                commit.applied_seats.len()
            ),
            Err(e) => warn!("Could not expire reservation {} at confirm time: {}", reservation.id, e),
        }
    }
}
