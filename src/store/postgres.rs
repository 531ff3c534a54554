//! PostgreSQL-реализация хранилища.
//!
//! Условная запись места - это `UPDATE ... WHERE status = $ AND version = $`:
//! при READ COMMITTED конкурентный `UPDATE` той же строки ждёт коммита
//! соперника и перепроверяет условие, так что из двух гонщиков проходит один.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BookingStore, Commit, OnConflict, SeatWrite, StoreError, StoreResult, UnitOfWork, Write};
use crate::models::{Booking, Money, Payment, Reservation, Seat, Showtime};

/// Соединение ждёт свободного слота пула не дольше этого.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Открывает пул и накатывает схему мест, броней и платежей.
    pub async fn connect(database_url: &str, pool_size: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        info!("Booking store connected, pool size {}", pool_size);

        sqlx::migrate!("./src/migrations")
            .run(&pool)
            .await?;
        info!("Booking schema is up to date");

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/* ---------- rows ---------- */

#[derive(FromRow)]
struct ShowtimeRow {
    id: i64,
    hall_id: i64,
    start_time: DateTime<Utc>,
    duration_minutes: i32,
    base_price: i64,
}

impl From<ShowtimeRow> for Showtime {
    fn from(row: ShowtimeRow) -> Self {
        Showtime {
            id: row.id,
            hall_id: row.hall_id,
            start_time: row.start_time,
            duration_minutes: row.duration_minutes,
            base_price: Money::from_minor(row.base_price),
        }
    }
}

#[derive(FromRow)]
struct SeatRow {
    showtime_id: i64,
    seat_number: String,
    seat_type: String,
    price: i64,
    status: String,
    holder_reference: Option<Uuid>,
    hold_expiry: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<SeatRow> for Seat {
    type Error = StoreError;

    fn try_from(row: SeatRow) -> Result<Self, Self::Error> {
        Ok(Seat {
            showtime_id: row.showtime_id,
            seat_number: row.seat_number,
            seat_type: row.seat_type,
            price: Money::from_minor(row.price),
            status: row.status.parse()?,
            holder_reference: row.holder_reference,
            hold_expiry: row.hold_expiry,
            version: row.version,
        })
    }
}

#[derive(FromRow)]
struct ReservationRow {
    id: Uuid,
    user_id: i64,
    showtime_id: i64,
    seat_numbers: Vec<String>,
    total_amount: i64,
    created_at: DateTime<Utc>,
    hold_expiry: DateTime<Utc>,
    status: String,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: row.id,
            user_id: row.user_id,
            showtime_id: row.showtime_id,
            seat_numbers: row.seat_numbers,
            total_amount: Money::from_minor(row.total_amount),
            created_at: row.created_at,
            hold_expiry: row.hold_expiry,
            status: row.status.parse()?,
        })
    }
}

#[derive(FromRow)]
struct BookingRow {
    id: Uuid,
    code: String,
    user_id: i64,
    showtime_id: i64,
    reservation_id: Uuid,
    seat_numbers: Vec<String>,
    total_amount: i64,
    status: String,
    payment_reference: String,
    booked_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            code: row.code,
            user_id: row.user_id,
            showtime_id: row.showtime_id,
            reservation_id: row.reservation_id,
            seat_numbers: row.seat_numbers,
            total_amount: Money::from_minor(row.total_amount),
            status: row.status.parse()?,
            payment_reference: row.payment_reference,
            booked_at: row.booked_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    booking_id: Uuid,
    amount: i64,
    method: String,
    transaction_id: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            booking_id: row.booking_id,
            amount: Money::from_minor(row.amount),
            method: row.method.parse()?,
            transaction_id: row.transaction_id,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

const SEAT_COLUMNS: &str =
    "showtime_id, seat_number, seat_type, price, status, holder_reference, hold_expiry, version";
const RESERVATION_COLUMNS: &str =
    "id, user_id, showtime_id, seat_numbers, total_amount, created_at, hold_expiry, status";
const BOOKING_COLUMNS: &str = "id, code, user_id, showtime_id, reservation_id, seat_numbers, \
     total_amount, status, payment_reference, booked_at, cancelled_at";
const PAYMENT_COLUMNS: &str = "id, booking_id, amount, method, transaction_id, status, created_at";

/* ---------- writes ---------- */

async fn write_seat(tx: &mut Transaction<'static, Postgres>, w: &SeatWrite) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE seats
        SET status = $1, holder_reference = $2, hold_expiry = $3,
            version = version + 1, updated_at = NOW()
        WHERE showtime_id = $4 AND seat_number = $5
          AND status = $6 AND version = $7
        "#,
    )
    .bind(w.new_status.as_str())
    .bind(w.holder_reference)
    .bind(w.hold_expiry)
    .bind(w.showtime_id)
    .bind(&w.seat_number)
    .bind(w.expected_status.as_str())
    .bind(w.expected_version)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn transition(
    tx: &mut Transaction<'static, Postgres>,
    sql: &str,
    id: Uuid,
    from: &'static str,
    to: &'static str,
    entity: &'static str,
) -> StoreResult<()> {
    let result = sqlx::query(sql)
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&mut **tx)
        .await?;

    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(StoreError::RecordConflict { entity, id, expected: from })
    }
}

fn map_insert_error(err: sqlx::Error, code: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.constraint() == Some("bookings_code_key") {
            return StoreError::DuplicateBookingCode(code.to_string());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl BookingStore for PgStore {
    async fn showtime(&self, id: i64) -> StoreResult<Option<Showtime>> {
        let row = sqlx::query_as::<_, ShowtimeRow>(
            "SELECT id, hall_id, start_time, duration_minutes, base_price FROM showtimes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Showtime::from))
    }

    async fn seats(&self, showtime_id: i64) -> StoreResult<Vec<Seat>> {
        let sql = format!("SELECT {SEAT_COLUMNS} FROM seats WHERE showtime_id = $1 ORDER BY seat_number");
        sqlx::query_as::<_, SeatRow>(&sql)
            .bind(showtime_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Seat::try_from)
            .collect()
    }

    async fn seats_by_number(&self, showtime_id: i64, numbers: &[String]) -> StoreResult<Vec<Seat>> {
        let sql = format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE showtime_id = $1 AND seat_number = ANY($2) ORDER BY seat_number"
        );
        sqlx::query_as::<_, SeatRow>(&sql)
            .bind(showtime_id)
            .bind(numbers)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Seat::try_from)
            .collect()
    }

    async fn reservation(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1");
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Reservation::try_from)
            .transpose()
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE status = 'PENDING' AND hold_expiry < $1 \
             ORDER BY hold_expiry LIMIT $2"
        );
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Reservation::try_from)
            .collect()
    }

    async fn booking(&self, id: Uuid) -> StoreResult<Option<Booking>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        sqlx::query_as::<_, BookingRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Booking::try_from)
            .transpose()
    }

    async fn bookings_for_user(&self, user_id: i64) -> StoreResult<Vec<Booking>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE user_id = $1 ORDER BY booked_at DESC");
        sqlx::query_as::<_, BookingRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Booking::try_from)
            .collect()
    }

    async fn payment_for_booking(&self, booking_id: Uuid) -> StoreResult<Option<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE booking_id = $1 ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn booking_code_exists(&self, code: &str) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM bookings WHERE code = $1)")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn apply(&self, unit: UnitOfWork) -> StoreResult<Commit> {
        // Транзакция откатывается при drop, поэтому любой ранний `?` безопасен.
        let mut tx = self.pool.begin().await?;
        let mut commit = Commit::default();
        let mut conflicts = Vec::new();

        for write in unit.writes() {
            match write {
                Write::Seat(w) => {
                    if write_seat(&mut tx, w).await? {
                        commit.applied_seats.push(w.seat_number.clone());
                    } else {
                        match w.on_conflict {
                            OnConflict::Abort => conflicts.push(w.seat_number.clone()),
                            OnConflict::Skip => commit.skipped_seats.push(w.seat_number.clone()),
                        }
                    }
                }
                Write::InsertReservation(r) => {
                    sqlx::query(
                        r#"
                        INSERT INTO reservations
                            (id, user_id, showtime_id, seat_numbers, total_amount, created_at, hold_expiry, status)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(r.id)
                    .bind(r.user_id)
                    .bind(r.showtime_id)
                    .bind(&r.seat_numbers)
                    .bind(r.total_amount.minor())
                    .bind(r.created_at)
                    .bind(r.hold_expiry)
                    .bind(r.status.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                Write::ReservationStatus { id, from, to } => {
                    transition(
                        &mut tx,
                        "UPDATE reservations SET status = $1 WHERE id = $2 AND status = $3",
                        *id,
                        from.as_str(),
                        to.as_str(),
                        "reservation",
                    )
                    .await?;
                }
                Write::InsertBooking(b) => {
                    sqlx::query(
                        r#"
                        INSERT INTO bookings
                            (id, code, user_id, showtime_id, reservation_id, seat_numbers,
                             total_amount, status, payment_reference, booked_at, cancelled_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                        "#,
                    )
                    .bind(b.id)
                    .bind(&b.code)
                    .bind(b.user_id)
                    .bind(b.showtime_id)
                    .bind(b.reservation_id)
                    .bind(&b.seat_numbers)
                    .bind(b.total_amount.minor())
                    .bind(b.status.as_str())
                    .bind(&b.payment_reference)
                    .bind(b.booked_at)
                    .bind(b.cancelled_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_insert_error(e, &b.code))?;
                }
                Write::BookingStatus { id, from, to, cancelled_at } => {
                    let result = sqlx::query(
                        "UPDATE bookings SET status = $1, cancelled_at = COALESCE($2, cancelled_at) \
                         WHERE id = $3 AND status = $4",
                    )
                    .bind(to.as_str())
                    .bind(*cancelled_at)
                    .bind(*id)
                    .bind(from.as_str())
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() != 1 {
                        return Err(StoreError::RecordConflict {
                            entity: "booking",
                            id: *id,
                            expected: from.as_str(),
                        });
                    }
                }
                Write::InsertPayment(p) => {
                    sqlx::query(
                        r#"
                        INSERT INTO payments (id, booking_id, amount, method, transaction_id, status, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(p.id)
                    .bind(p.booking_id)
                    .bind(p.amount.minor())
                    .bind(p.method.as_str())
                    .bind(&p.transaction_id)
                    .bind(p.status.as_str())
                    .bind(p.created_at)
                    .execute(&mut *tx)
                    .await?;
                }
                Write::PaymentStatus { id, from, to } => {
                    transition(
                        &mut tx,
                        "UPDATE payments SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
                        *id,
                        from.as_str(),
                        to.as_str(),
                        "payment",
                    )
                    .await?;
                }
            }
        }

        if !conflicts.is_empty() {
            debug!("Rolling back unit of work, lost seats: {:?}", conflicts);
            tx.rollback().await?;
            return Err(StoreError::SeatConflict { seats: conflicts });
        }

        tx.commit().await?;
        Ok(commit)
    }
}
