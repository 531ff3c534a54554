use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::validate;
use crate::error::BookingError;
use crate::middleware::AuthUser;
use crate::models::{PaymentDetails, PaymentMethod};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reservations", post(create_reservation))
        .route("/reservations/{id}", get(get_reservation))
        .route("/reservations/{id}/cancel", patch(cancel_reservation))
        .route("/reservations/{id}/confirm", post(confirm_reservation))
}

/* ---------- HOLDS ---------- */

// POST /api/reservations
#[derive(Debug, Deserialize, Validate)]
struct CreateReservationRequest {
    #[validate(range(min = 1, message = "showtime_id должен быть > 0"))]
    showtime_id: i64,
    #[validate(length(min = 1, max = 50, message = "нужно от 1 до 50 мест"))]
    seat_numbers: Vec<String>,
}

async fn create_reservation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateReservationRequest>,
) -> Result<impl IntoResponse, BookingError> {
    validate(&req)?;

    let reservation = state
        .reservations
        .create_reservation(user.user_id, req.showtime_id, req.seat_numbers)
        .await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

// GET /api/reservations/{id}
async fn get_reservation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(reservation_id): Path<Uuid>,
) -> Result<impl IntoResponse, BookingError> {
    let reservation = state.reservations.get_reservation(user.user_id, reservation_id).await?;
    Ok(Json(reservation))
}

// PATCH /api/reservations/{id}/cancel
async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(reservation_id): Path<Uuid>,
) -> Result<impl IntoResponse, BookingError> {
    let reservation = state
        .reservations
        .cancel_reservation(user.user_id, reservation_id)
        .await?;
    Ok(Json(reservation))
}

/* ---------- CONFIRM ---------- */

// POST /api/reservations/{id}/confirm
#[derive(Debug, Deserialize, Validate)]
struct ConfirmRequest {
    method: PaymentMethod,
    #[validate(length(min = 1, max = 256, message = "payment_token обязателен"))]
    payment_token: String,
}

async fn confirm_reservation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(reservation_id): Path<Uuid>,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, BookingError> {
    validate(&req)?;

    let payment = PaymentDetails {
        method: req.method,
        token: req.payment_token,
    };
    let booking = state
        .confirmer
        .confirm_booking(user.user_id, reservation_id, payment)
        .await?;
    Ok((StatusCode::CREATED, Json(booking)))
}
