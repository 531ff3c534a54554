//! Реестр мест сеанса: чтение доступности и единственный примитив
//! условного перехода статуса места.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{BookingError, BookingResult};
use crate::models::{Money, Seat, SeatStatus};
use crate::store::{BookingStore, SeatWrite, StoreError, UnitOfWork};

/// Место в ответе о доступности. Владелец брони наружу не отдаётся.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatView {
    pub seat_number: String,
    pub seat_type: String,
    pub price: Money,
}

impl From<&Seat> for SeatView {
    fn from(seat: &Seat) -> Self {
        Self {
            seat_number: seat.seat_number.clone(),
            seat_type: seat.seat_type.clone(),
            price: seat.price,
        }
    }
}

/// Места сеанса, разложенные по статусам.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeatAvailability {
    pub showtime_id: i64,
    pub available: Vec<SeatView>,
    pub held: Vec<SeatView>,
    pub booked: Vec<SeatView>,
    pub blocked: Vec<SeatView>,
}

impl SeatAvailability {
    pub fn from_seats(showtime_id: i64, seats: &[Seat]) -> Self {
        let mut availability = SeatAvailability {
            showtime_id,
            ..Default::default()
        };
        for seat in seats {
            let bucket = match seat.status {
                SeatStatus::Available => &mut availability.available,
                SeatStatus::Held => &mut availability.held,
                SeatStatus::Booked => &mut availability.booked,
                SeatStatus::Blocked => &mut availability.blocked,
            };
            bucket.push(SeatView::from(seat));
        }
        availability
    }

    pub fn total(&self) -> usize {
        self.available.len() + self.held.len() + self.booked.len() + self.blocked.len()
    }
}

#[derive(Clone)]
pub struct SeatLedger {
    store: Arc<dyn BookingStore>,
}

impl SeatLedger {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    pub async fn availability(&self, showtime_id: i64) -> BookingResult<SeatAvailability> {
        if self.store.showtime(showtime_id).await?.is_none() {
            return Err(BookingError::ShowtimeNotFound(showtime_id));
        }
        let seats = self.store.seats(showtime_id).await?;
        Ok(SeatAvailability::from_seats(showtime_id, &seats))
    }

    /// Переводит место из прочитанного состояния в `new_status`, только если
    /// с момента чтения оно не менялось. Иначе - `ConcurrencyLost`.
    pub async fn transition(&self, seat: &Seat, new_status: SeatStatus) -> BookingResult<()> {
        let unit = UnitOfWork::new().seat(SeatWrite::from_seat(seat, new_status));
        match self.store.apply(unit).await {
            Ok(_) => {
                debug!(
                    "Seat {}/{} {} -> {}",
                    seat.showtime_id, seat.seat_number, seat.status, new_status
                );
                Ok(())
            }
            Err(StoreError::SeatConflict { seats }) => Err(BookingError::ConcurrencyLost { seats }),
            Err(e) => Err(e.into()),
        }
    }
}
