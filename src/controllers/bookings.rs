use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, patch},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::BookingError;
use crate::middleware::AuthUser;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", get(get_user_bookings))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/cancel", patch(cancel_booking))
}

// GET /api/bookings
async fn get_user_bookings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, BookingError> {
    let bookings = state.cancellations.list_bookings(user.user_id).await?;
    Ok(Json(bookings))
}

// GET /api/bookings/{id}
async fn get_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
) -> Result<impl IntoResponse, BookingError> {
    let booking = state.cancellations.get_booking(user.user_id, booking_id).await?;
    Ok(Json(booking))
}

// PATCH /api/bookings/{id}/cancel
// Места освобождаются даже если возврат не прошёл; результат возврата в поле `refund`.
async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
) -> Result<impl IntoResponse, BookingError> {
    let outcome = state.cancellations.cancel_booking(user.user_id, booking_id).await?;
    Ok(Json(outcome))
}
