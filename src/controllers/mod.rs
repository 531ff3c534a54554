pub mod bookings;
pub mod reservations;
pub mod showtimes;

use axum::Router;
use std::sync::Arc;
use validator::Validate;

use crate::error::BookingError;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(showtimes::routes())
        .merge(reservations::routes())
        .merge(bookings::routes())
}

fn validate<T: Validate>(req: &T) -> Result<(), BookingError> {
    req.validate()
        .map_err(|e| BookingError::InvalidRequest(e.to_string()))
}
