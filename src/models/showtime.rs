use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Money;

/// Сеанс, как его отдаёт каталог. Сервис бронирования его только читает.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Showtime {
    pub id: i64,
    pub hall_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub base_price: Money,
}

impl Showtime {
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time
    }
}
