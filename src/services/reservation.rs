use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::error::{BookingError, BookingResult};
use crate::models::{Money, Reservation, ReservationStatus, SeatStatus};
use crate::store::{BookingStore, SeatWrite, StoreError, UnitOfWork};

/// Создание и отмена временных броней.
#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>, policy: BookingPolicy) -> Self {
        Self { store, clock, policy }
    }

    /// Держит все запрошенные места одной единицей работы: либо все, либо ни одного.
    pub async fn create_reservation(
        &self,
        user_id: i64,
        showtime_id: i64,
        seat_numbers: Vec<String>,
    ) -> BookingResult<Reservation> {
        let seat_numbers = normalize_seat_numbers(seat_numbers, self.policy.max_seats_per_hold)?;
        let now = self.clock.now();

        let showtime = self
            .store
            .showtime(showtime_id)
            .await?
            .ok_or(BookingError::ShowtimeNotFound(showtime_id))?;
        if showtime.has_started(now) {
            return Err(BookingError::ShowtimeInPast(showtime_id));
        }

        let seats = self.store.seats_by_number(showtime_id, &seat_numbers).await?;

        let found: HashSet<&str> = seats.iter().map(|s| s.seat_number.as_str()).collect();
        let missing: Vec<String> = seat_numbers
            .iter()
            .filter(|n| !found.contains(n.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BookingError::SeatNotFound { seats: missing });
        }

        let unavailable: Vec<String> = seats
            .iter()
            .filter(|s| !s.is_available())
            .map(|s| s.seat_number.clone())
            .collect();
        if !unavailable.is_empty() {
            return Err(BookingError::SeatUnavailable { seats: unavailable });
        }

        let id = Uuid::new_v4();
        let hold_expiry = now + self.policy.hold_duration();
        // Цена фиксируется здесь и дальше не пересчитывается.
        let total_amount: Money = seats.iter().map(|s| s.price).sum();

        let reservation = Reservation {
            id,
            user_id,
            showtime_id,
            seat_numbers,
            total_amount,
            created_at: now,
            hold_expiry,
            status: ReservationStatus::Pending,
        };

        let holds = seats
            .iter()
            .map(|seat| SeatWrite::from_seat(seat, SeatStatus::Held).held_by(id, hold_expiry));
        let unit = UnitOfWork::new().seats(holds).insert_reservation(reservation.clone());

        match self.store.apply(unit).await {
            Ok(_) => {
                info!(
                    "🎟️ Reservation {} holds {} seats on showtime {} until {}",
                    id,
                    reservation.seat_numbers.len(),
                    showtime_id,
                    hold_expiry
                );
                Ok(reservation)
            }
            Err(StoreError::SeatConflict { seats }) => {
                warn!("Hold on showtime {} lost race for seats {:?}", showtime_id, seats);
                Err(BookingError::ConcurrencyLost { seats })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_reservation(&self, user_id: i64, reservation_id: Uuid) -> BookingResult<Reservation> {
        owned_reservation(self.store.as_ref(), user_id, reservation_id).await
    }

    /// Отмена брони клиентом: места HELD -> AVAILABLE, бронь PENDING -> CANCELLED.
    pub async fn cancel_reservation(&self, user_id: i64, reservation_id: Uuid) -> BookingResult<Reservation> {
        let reservation = owned_reservation(self.store.as_ref(), user_id, reservation_id).await?;
        ensure_pending(&reservation)?;

        let seats = self
            .store
            .seats_by_number(reservation.showtime_id, &reservation.seat_numbers)
            .await?;
        let releases = seats
            .iter()
            .filter(|seat| seat.status == SeatStatus::Held && seat.is_owned_by(reservation.id))
            .map(|seat| SeatWrite::from_seat(seat, SeatStatus::Available));

        let unit = UnitOfWork::new().seats(releases).reservation_status(
            reservation.id,
            ReservationStatus::Pending,
            ReservationStatus::Cancelled,
        );

        match self.store.apply(unit).await {
            Ok(commit) => {
                info!(
                    "Reservation {} cancelled, {} seats released",
                    reservation.id,
                    commit.applied_seats.len()
                );
                Ok(Reservation {
                    status: ReservationStatus::Cancelled,
                    ..reservation
                })
            }
            Err(StoreError::SeatConflict { seats }) => Err(BookingError::ConcurrencyLost { seats }),
            // Бронь успели подтвердить или убрать параллельно.
            Err(StoreError::RecordConflict { .. }) => {
                let current = owned_reservation(self.store.as_ref(), user_id, reservation_id).await?;
                Err(BookingError::ReservationNotPending {
                    id: current.id,
                    status: current.status,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Чужая бронь неотличима от несуществующей.
pub(crate) async fn owned_reservation(
    store: &dyn BookingStore,
    user_id: i64,
    reservation_id: Uuid,
) -> BookingResult<Reservation> {
    store
        .reservation(reservation_id)
        .await?
        .filter(|r| r.user_id == user_id)
        .ok_or(BookingError::ReservationNotFound(reservation_id))
}

pub(crate) fn ensure_pending(reservation: &Reservation) -> BookingResult<()> {
    if reservation.is_pending() {
        Ok(())
    } else {
        Err(BookingError::ReservationNotPending {
            id: reservation.id,
            status: reservation.status,
        })
    }
}

fn normalize_seat_numbers(seat_numbers: Vec<String>, max: usize) -> BookingResult<Vec<String>> {
    if seat_numbers.is_empty() {
        return Err(BookingError::InvalidRequest("at least one seat is required".to_string()));
    }
    if seat_numbers.len() > max {
        return Err(BookingError::InvalidRequest(format!(
            "at most {max} seats can be held at once"
        )));
    }

    let mut seen = HashSet::with_capacity(seat_numbers.len());
    let mut normalized = Vec::with_capacity(seat_numbers.len());
    for number in seat_numbers {
        let number = number.trim().to_string();
        if number.is_empty() {
            return Err(BookingError::InvalidRequest("seat number must not be blank".to_string()));
        }
        if !seen.insert(number.clone()) {
            return Err(BookingError::InvalidRequest(format!("seat {number} is requested twice")));
        }
        normalized.push(number);
    }
    Ok(normalized)
}
