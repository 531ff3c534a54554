use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{text_enum, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Expired,
    Confirmed,
    Cancelled,
}

text_enum!(ReservationStatus, "reservation", {
    Pending => "PENDING",
    Expired => "EXPIRED",
    Confirmed => "CONFIRMED",
    Cancelled => "CANCELLED",
});

/// Временная бронь (hold) набора мест.
///
/// `hold_expiry` выставляется один раз при создании и никогда не продлевается.
/// `total_amount` фиксирует цены мест на момент создания брони.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: i64,
    pub showtime_id: i64,
    pub seat_numbers: Vec<String>,
    pub total_amount: Money,
    pub created_at: DateTime<Utc>,
    pub hold_expiry: DateTime<Utc>,
    pub status: ReservationStatus,
}

impl Reservation {
    /// Граница исключающая: в момент `hold_expiry` бронь ещё действует.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.hold_expiry
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReservationStatus::Pending
    }
}
