use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{text_enum, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Refunded,
}

text_enum!(BookingStatus, "booking", {
    Confirmed => "CONFIRMED",
    Cancelled => "CANCELLED",
    Refunded => "REFUNDED",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub code: String,
    pub user_id: i64,
    pub showtime_id: i64,
    pub reservation_id: Uuid,
    pub seat_numbers: Vec<String>,
    pub total_amount: Money,
    pub status: BookingStatus,
    /// Идентификатор транзакции платёжного шлюза.
    pub payment_reference: String,
    pub booked_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}
