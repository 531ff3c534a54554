use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::payment::PaymentGateway;
use crate::clock::Clock;
use crate::error::{BookingError, BookingResult};
use crate::models::{Booking, BookingStatus, PaymentStatus, SeatStatus};
use crate::store::{BookingStore, SeatWrite, StoreError, UnitOfWork};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundState {
    Refunded,
    /// Шлюз не принял возврат; места всё равно освобождены.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationOutcome {
    pub booking: Booking,
    pub refund: RefundState,
}

/// Отмена подтверждённого бронирования до начала сеанса.
pub struct CancellationService {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
}

impl CancellationService {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, clock, gateway }
    }

    pub async fn get_booking(&self, user_id: i64, booking_id: Uuid) -> BookingResult<Booking> {
        self.store
            .booking(booking_id)
            .await?
            .filter(|b| b.user_id == user_id)
            .ok_or(BookingError::BookingNotFound(booking_id))
    }

    pub async fn list_bookings(&self, user_id: i64) -> BookingResult<Vec<Booking>> {
        Ok(self.store.bookings_for_user(user_id).await?)
    }

    /// Сначала места и статус бронирования фиксируются одной единицей работы,
    /// затем запрашивается возврат. Сбой возврата не откатывает отмену.
    pub async fn cancel_booking(&self, user_id: i64, booking_id: Uuid) -> BookingResult<CancellationOutcome> {
        let booking = self.get_booking(user_id, booking_id).await?;
        if booking.status != BookingStatus::Confirmed {
            return Err(BookingError::BookingNotConfirmed {
                id: booking.id,
                status: booking.status,
            });
        }

        let now = self.clock.now();
        let showtime = self
            .store
            .showtime(booking.showtime_id)
            .await?
            .ok_or(BookingError::ShowtimeNotFound(booking.showtime_id))?;
        if showtime.has_started(now) {
            return Err(BookingError::ShowtimeStarted(showtime.id));
        }

        let seats = self
            .store
            .seats_by_number(booking.showtime_id, &booking.seat_numbers)
            .await?;
        let releases = seats
            .iter()
            .filter(|seat| seat.status == SeatStatus::Booked && seat.is_owned_by(booking.reservation_id))
            .map(|seat| SeatWrite::from_seat(seat, SeatStatus::Available));

        let unit = UnitOfWork::new().seats(releases).booking_status(
            booking.id,
            BookingStatus::Confirmed,
            BookingStatus::Cancelled,
            Some(now),
        );

        let commit = match self.store.apply(unit).await {
            Ok(commit) => commit,
            Err(StoreError::SeatConflict { seats }) => return Err(BookingError::ConcurrencyLost { seats }),
            Err(StoreError::RecordConflict { .. }) => {
                let current = self.get_booking(user_id, booking_id).await?;
                return Err(BookingError::BookingNotConfirmed {
                    id: current.id,
                    status: current.status,
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Booking {} cancelled, {} seats back on sale",
            booking.code,
            commit.applied_seats.len()
        );

        let refund = self.refund(&booking).await;
        Ok(CancellationOutcome {
            booking: Booking {
                status: BookingStatus::Cancelled,
                cancelled_at: Some(now),
                ..booking
            },
            refund,
        })
    }

    async fn refund(&self, booking: &Booking) -> RefundState {
        match self
            .gateway
            .refund(&booking.payment_reference, booking.total_amount)
            .await
        {
            Ok(receipt) => {
                info!(
                    "💸 Refund {} issued for booking {} ({})",
                    receipt.refund_id, booking.code, booking.total_amount
                );
                self.mark_payment_refunded(booking).await;
                RefundState::Refunded
            }
            Err(e) => {
                error!(
                    "Refund for booking {} (transaction {}) failed: {}",
                    booking.code, booking.payment_reference, e
                );
                RefundState::Failed
            }
        }
    }

    async fn mark_payment_refunded(&self, booking: &Booking) {
        let payment = match self.store.payment_for_booking(booking.id).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                warn!("No payment record for booking {}", booking.code);
                return;
            }
            Err(e) => {
                error!("Failed to load payment of booking {}: {}", booking.code, e);
                return;
            }
        };

        let unit = UnitOfWork::new().payment_status(payment.id, PaymentStatus::Completed, PaymentStatus::Refunded);
        if let Err(e) = self.store.apply(unit).await {
            error!("Failed to mark payment {} refunded: {}", payment.id, e);
        }
    }
}
