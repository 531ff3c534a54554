use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::error::BookingError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/showtimes/{id}/seats", get(get_seats))
}

// GET /api/showtimes/{id}/seats
async fn get_seats(
    State(state): State<Arc<AppState>>,
    Path(showtime_id): Path<i64>,
) -> Result<impl IntoResponse, BookingError> {
    let availability = state.ledger.availability(showtime_id).await?;
    Ok(Json(availability))
}
