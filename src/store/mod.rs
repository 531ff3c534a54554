//! Хранилище мест, броней, бронирований и платежей.
//!
//! Чтения идут через отдельные методы [`BookingStore`], а любые изменения -
//! только через [`BookingStore::apply`]: единица работы ([`UnitOfWork`])
//! состоит из условных записей и применяется целиком или не применяется
//! вовсе. Запись места проходит, только если его статус и `version`
//! совпадают с прочитанными ранее; иначе вся единица откатывается с
//! [`StoreError::SeatConflict`]. Блокировки между запросами не держатся.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Booking, BookingStatus, ParseStatusError, Payment, PaymentStatus, Reservation,
    ReservationStatus, Seat, SeatStatus, Showtime,
};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Хотя бы одно место изменилось между чтением и записью.
    #[error("seats changed concurrently: {}", .seats.join(", "))]
    SeatConflict { seats: Vec<String> },

    /// Запись уже не в ожидаемом статусе (или её нет).
    #[error("{entity} {id} is no longer {expected}")]
    RecordConflict {
        entity: &'static str,
        id: Uuid,
        expected: &'static str,
    },

    #[error("booking code {0} is already taken")]
    DuplicateBookingCode(String),

    #[error("stored data is inconsistent: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Проигранная гонка: безопасно перечитать состояние и повторить запрос.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::SeatConflict { .. } | StoreError::RecordConflict { .. })
    }
}

impl From<ParseStatusError> for StoreError {
    fn from(err: ParseStatusError) -> Self {
        StoreError::Integrity(err.to_string())
    }
}

/// Что делать, если условие записи места не выполнено.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Откатить всю единицу работы.
    Abort,
    /// Пропустить только это место (освобождение уже ушедшего места - no-op).
    Skip,
}

/// Условный переход места `expected_status -> new_status` при неизменной `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatWrite {
    pub showtime_id: i64,
    pub seat_number: String,
    pub expected_status: SeatStatus,
    pub expected_version: i64,
    pub new_status: SeatStatus,
    pub holder_reference: Option<Uuid>,
    pub hold_expiry: Option<DateTime<Utc>>,
    pub on_conflict: OnConflict,
}

impl SeatWrite {
    /// Переход от прочитанного состояния места. Владелец и срок по умолчанию сбрасываются.
    pub fn from_seat(seat: &Seat, new_status: SeatStatus) -> Self {
        Self {
            showtime_id: seat.showtime_id,
            seat_number: seat.seat_number.clone(),
            expected_status: seat.status,
            expected_version: seat.version,
            new_status,
            holder_reference: None,
            hold_expiry: None,
            on_conflict: OnConflict::Abort,
        }
    }

    pub fn held_by(mut self, reservation_id: Uuid, hold_expiry: DateTime<Utc>) -> Self {
        self.holder_reference = Some(reservation_id);
        self.hold_expiry = Some(hold_expiry);
        self
    }

    pub fn owned_by(mut self, reservation_id: Uuid) -> Self {
        self.holder_reference = Some(reservation_id);
        self.hold_expiry = None;
        self
    }

    pub fn or_skip(mut self) -> Self {
        self.on_conflict = OnConflict::Skip;
        self
    }

    pub(crate) fn matches(&self, seat: &Seat) -> bool {
        seat.status == self.expected_status && seat.version == self.expected_version
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Seat(SeatWrite),
    InsertReservation(Reservation),
    ReservationStatus {
        id: Uuid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    InsertBooking(Booking),
    BookingStatus {
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        cancelled_at: Option<DateTime<Utc>>,
    },
    InsertPayment(Payment),
    PaymentStatus {
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    },
}

/// Набор условных записей, применяемых атомарно в заданном порядке.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOfWork {
    writes: Vec<Write>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seat(mut self, write: SeatWrite) -> Self {
        self.writes.push(Write::Seat(write));
        self
    }

    pub fn seats(mut self, writes: impl IntoIterator<Item = SeatWrite>) -> Self {
        self.writes.extend(writes.into_iter().map(Write::Seat));
        self
    }

    pub fn insert_reservation(mut self, reservation: Reservation) -> Self {
        self.writes.push(Write::InsertReservation(reservation));
        self
    }

    pub fn reservation_status(mut self, id: Uuid, from: ReservationStatus, to: ReservationStatus) -> Self {
        self.writes.push(Write::ReservationStatus { id, from, to });
        self
    }

    pub fn insert_booking(mut self, booking: Booking) -> Self {
        self.writes.push(Write::InsertBooking(booking));
        self
    }

    pub fn booking_status(
        mut self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.writes.push(Write::BookingStatus { id, from, to, cancelled_at });
        self
    }

    pub fn insert_payment(mut self, payment: Payment) -> Self {
        self.writes.push(Write::InsertPayment(payment));
        self
    }

    pub fn payment_status(mut self, id: Uuid, from: PaymentStatus, to: PaymentStatus) -> Self {
        self.writes.push(Write::PaymentStatus { id, from, to });
        self
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Результат применения единицы работы.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub applied_seats: Vec<String>,
    /// Места с `OnConflict::Skip`, условие которых уже не выполнялось.
    pub skipped_seats: Vec<String>,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn showtime(&self, id: i64) -> StoreResult<Option<Showtime>>;

    /// Все места сеанса, упорядоченные по номеру.
    async fn seats(&self, showtime_id: i64) -> StoreResult<Vec<Seat>>;

    /// Места с указанными номерами; отсутствующие номера просто не попадают в ответ.
    async fn seats_by_number(&self, showtime_id: i64, numbers: &[String]) -> StoreResult<Vec<Seat>>;

    async fn reservation(&self, id: Uuid) -> StoreResult<Option<Reservation>>;

    /// `PENDING`-брони с `hold_expiry < now`, самые старые первыми.
    async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Reservation>>;

    async fn booking(&self, id: Uuid) -> StoreResult<Option<Booking>>;

    async fn bookings_for_user(&self, user_id: i64) -> StoreResult<Vec<Booking>>;

    async fn payment_for_booking(&self, booking_id: Uuid) -> StoreResult<Option<Payment>>;

    async fn booking_code_exists(&self, code: &str) -> StoreResult<bool>;

    async fn apply(&self, unit: UnitOfWork) -> StoreResult<Commit>;
}
