//! Хранилище в памяти процесса: арена мест с ключом (showtime_id, seat_number).
//!
//! Мьютекс берётся только на время одного чтения или одного `apply`, ни одна
//! операция не ждёт ввода-вывода под ним. Каталог (сеансы и карта мест)
//! заполняется снаружи через `insert_showtime` / `insert_seats`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{BookingStore, Commit, OnConflict, StoreError, StoreResult, UnitOfWork, Write};
use crate::models::{Booking, Money, Payment, Reservation, Seat, SeatStatus, Showtime};

type SeatKey = (i64, String);

#[derive(Debug, Default)]
struct Inner {
    showtimes: HashMap<i64, Showtime>,
    seats: BTreeMap<SeatKey, Seat>,
    reservations: HashMap<Uuid, Reservation>,
    bookings: HashMap<Uuid, Booking>,
    booking_codes: HashSet<String>,
    payments: HashMap<Uuid, Payment>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // apply() сначала всё проверяет и только потом пишет, так что
        // состояние под отравленным мьютексом остаётся согласованным.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_showtime(&self, showtime: Showtime) {
        self.lock().showtimes.insert(showtime.id, showtime);
    }

    pub fn insert_seats(&self, seats: impl IntoIterator<Item = Seat>) {
        let mut inner = self.lock();
        for seat in seats {
            inner.seats.insert((seat.showtime_id, seat.seat_number.clone()), seat);
        }
    }

    /// Изменение цены каталогом. Уже созданные брони это не затрагивает.
    pub fn set_seat_price(&self, showtime_id: i64, seat_number: &str, price: Money) -> bool {
        let mut inner = self.lock();
        match inner.seats.get_mut(&(showtime_id, seat_number.to_string())) {
            Some(seat) => {
                seat.price = price;
                seat.version += 1;
                true
            }
            None => false,
        }
    }

    /// Административная блокировка свободного места (ремонт, технические места).
    pub fn block_seat(&self, showtime_id: i64, seat_number: &str) -> bool {
        let mut inner = self.lock();
        match inner.seats.get_mut(&(showtime_id, seat_number.to_string())) {
            Some(seat) if seat.status == SeatStatus::Available => {
                seat.status = SeatStatus::Blocked;
                seat.version += 1;
                true
            }
            _ => false,
        }
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.lock().payments.values().cloned().collect()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.lock().reservations.values().cloned().collect()
    }

    /// Демо-каталог для запуска без базы: сеанс 1 через сутки, ряды A-E по 10 мест,
    /// ряд E - VIP.
    pub fn seed_demo(&self, now: DateTime<Utc>) {
        let base_price = Money::from_major(25);
        self.insert_showtime(Showtime {
            id: 1,
            hall_id: 1,
            start_time: now + chrono::Duration::days(1),
            duration_minutes: 120,
            base_price,
        });
        self.insert_seats(["A", "B", "C", "D", "E"].into_iter().flat_map(|row| {
            (1..=10).map(move |n| {
                if row == "E" {
                    Seat::new(1, format!("{row}{n}"), "VIP", Money::from_major(40))
                } else {
                    Seat::new(1, format!("{row}{n}"), "STANDARD", base_price)
                }
            })
        }));
    }
}

impl Inner {
    /// Проверка всех условий без изменений. Возвращает места, которые надо пропустить.
    fn validate(&self, unit: &UnitOfWork) -> StoreResult<HashSet<SeatKey>> {
        let mut conflicts = Vec::new();
        let mut skipped = HashSet::new();
        let mut touched = HashSet::new();
        let mut new_codes = HashSet::new();

        for write in unit.writes() {
            match write {
                Write::Seat(w) => {
                    let key = (w.showtime_id, w.seat_number.clone());
                    if !touched.insert(key.clone()) {
                        return Err(StoreError::Integrity(format!(
                            "seat {} written twice in one unit",
                            w.seat_number
                        )));
                    }
                    let matches = self.seats.get(&key).is_some_and(|seat| w.matches(seat));
                    if !matches {
                        match w.on_conflict {
                            OnConflict::Abort => conflicts.push(w.seat_number.clone()),
                            OnConflict::Skip => {
                                skipped.insert(key);
                            }
                        }
                    }
                }
                Write::InsertReservation(r) => {
                    if self.reservations.contains_key(&r.id) {
                        return Err(StoreError::Integrity(format!("reservation {} already exists", r.id)));
                    }
                }
                Write::ReservationStatus { id, from, .. } => {
                    if self.reservations.get(id).map(|r| r.status) != Some(*from) {
                        return Err(StoreError::RecordConflict {
                            entity: "reservation",
                            id: *id,
                            expected: from.as_str(),
                        });
                    }
                }
                Write::InsertBooking(b) => {
                    if self.booking_codes.contains(&b.code) || !new_codes.insert(b.code.clone()) {
                        return Err(StoreError::DuplicateBookingCode(b.code.clone()));
                    }
                    if self.bookings.contains_key(&b.id) {
                        return Err(StoreError::Integrity(format!("booking {} already exists", b.id)));
                    }
                }
                Write::BookingStatus { id, from, .. } => {
                    if self.bookings.get(id).map(|b| b.status) != Some(*from) {
                        return Err(StoreError::RecordConflict {
                            entity: "booking",
                            id: *id,
                            expected: from.as_str(),
                        });
                    }
                }
                Write::InsertPayment(p) => {
                    if self.payments.contains_key(&p.id) {
                        return Err(StoreError::Integrity(format!("payment {} already exists", p.id)));
                    }
                }
                Write::PaymentStatus { id, from, .. } => {
                    if self.payments.get(id).map(|p| p.status) != Some(*from) {
                        return Err(StoreError::RecordConflict {
                            entity: "payment",
                            id: *id,
                            expected: from.as_str(),
                        });
                    }
                }
            }
        }

        if conflicts.is_empty() {
            Ok(skipped)
        } else {
            Err(StoreError::SeatConflict { seats: conflicts })
        }
    }

    fn write_all(&mut self, unit: UnitOfWork, skipped: &HashSet<SeatKey>) -> Commit {
        let mut commit = Commit::default();

        for write in unit.writes {
            match write {
                Write::Seat(w) => {
                    let key = (w.showtime_id, w.seat_number);
                    if skipped.contains(&key) {
                        commit.skipped_seats.push(key.1);
                        continue;
                    }
                    if let Some(seat) = self.seats.get_mut(&key) {
                        seat.status = w.new_status;
                        seat.holder_reference = w.holder_reference;
                        seat.hold_expiry = w.hold_expiry;
                        seat.version += 1;
                        commit.applied_seats.push(key.1);
                    }
                }
                Write::InsertReservation(r) => {
                    self.reservations.insert(r.id, r);
                }
                Write::ReservationStatus { id, to, .. } => {
                    if let Some(r) = self.reservations.get_mut(&id) {
                        r.status = to;
                    }
                }
                Write::InsertBooking(b) => {
                    self.booking_codes.insert(b.code.clone());
                    self.bookings.insert(b.id, b);
                }
                Write::BookingStatus { id, to, cancelled_at, .. } => {
                    if let Some(b) = self.bookings.get_mut(&id) {
                        b.status = to;
                        if cancelled_at.is_some() {
                            b.cancelled_at = cancelled_at;
                        }
                    }
                }
                Write::InsertPayment(p) => {
                    self.payments.insert(p.id, p);
                }
                Write::PaymentStatus { id, to, .. } => {
                    if let Some(p) = self.payments.get_mut(&id) {
                        p.status = to;
                    }
                }
            }
        }

        commit
    }
}

#[async_trait]
impl BookingStore for InMemoryStore {
    async fn showtime(&self, id: i64) -> StoreResult<Option<Showtime>> {
        Ok(self.lock().showtimes.get(&id).cloned())
    }

    async fn seats(&self, showtime_id: i64) -> StoreResult<Vec<Seat>> {
        let inner = self.lock();
        Ok(inner
            .seats
            .range((showtime_id, String::new())..)
            .take_while(|((sid, _), _)| *sid == showtime_id)
            .map(|(_, seat)| seat.clone())
            .collect())
    }

    async fn seats_by_number(&self, showtime_id: i64, numbers: &[String]) -> StoreResult<Vec<Seat>> {
        let inner = self.lock();
        Ok(numbers
            .iter()
            .filter_map(|n| inner.seats.get(&(showtime_id, n.clone())).cloned())
            .collect())
    }

    async fn reservation(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
        Ok(self.lock().reservations.get(&id).cloned())
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Reservation>> {
        let inner = self.lock();
        let mut expired: Vec<Reservation> = inner
            .reservations
            .values()
            .filter(|r| r.is_pending() && r.hold_expiry < now)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.hold_expiry);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn booking(&self, id: Uuid) -> StoreResult<Option<Booking>> {
        Ok(self.lock().bookings.get(&id).cloned())
    }

    async fn bookings_for_user(&self, user_id: i64) -> StoreResult<Vec<Booking>> {
        let inner = self.lock();
        let mut bookings: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.booked_at.cmp(&a.booked_at));
        Ok(bookings)
    }

    async fn payment_for_booking(&self, booking_id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.booking_id == booking_id)
            .cloned())
    }

    async fn booking_code_exists(&self, code: &str) -> StoreResult<bool> {
        Ok(self.lock().booking_codes.contains(code))
    }

    async fn apply(&self, unit: UnitOfWork) -> StoreResult<Commit> {
        let mut inner = self.lock();
        let skipped = inner.validate(&unit)?;
        Ok(inner.write_all(unit, &skipped))
    }
}
