use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{text_enum, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Held,
    Booked,
    Blocked,
}

text_enum!(SeatStatus, "seat", {
    Available => "AVAILABLE",
    Held => "HELD",
    Booked => "BOOKED",
    Blocked => "BLOCKED",
});

/// Место конкретного сеанса. Ключ - (showtime_id, seat_number).
///
/// `version` - маркер конкурентного доступа: любая успешная запись в место
/// увеличивает его, поэтому запись с устаревшей версией отклоняется.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub showtime_id: i64,
    pub seat_number: String,
    pub seat_type: String,
    pub price: Money,
    pub status: SeatStatus,
    pub holder_reference: Option<Uuid>,
    pub hold_expiry: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Seat {
    pub fn new(showtime_id: i64, seat_number: impl Into<String>, seat_type: impl Into<String>, price: Money) -> Self {
        Self {
            showtime_id,
            seat_number: seat_number.into(),
            seat_type: seat_type.into(),
            price,
            status: SeatStatus::Available,
            holder_reference: None,
            hold_expiry: None,
            version: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == SeatStatus::Available
    }

    pub fn is_owned_by(&self, reservation_id: Uuid) -> bool {
        self.holder_reference == Some(reservation_id)
    }
}
