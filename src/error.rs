//! Ошибки сервисного слоя и их отображение в HTTP.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{BookingStatus, Money, ReservationStatus};
use crate::store::StoreError;

/// Класс ошибки: по нему вызывающая сторона решает, что делать дальше.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    PreconditionFailed,
    /// Проиграна гонка за место - запрос можно повторить целиком.
    Conflict,
    /// Шлюз отказал - бронь остаётся в силе до истечения срока.
    PaymentDeclined,
    ServiceUnavailable,
    /// Деньги списаны, а локальная фиксация не прошла.
    FatalInconsistency,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("showtime {0} not found")]
    ShowtimeNotFound(i64),

    #[error("seats not found: {}", .seats.join(", "))]
    SeatNotFound { seats: Vec<String> },

    #[error("reservation {0} not found")]
    ReservationNotFound(Uuid),

    #[error("booking {0} not found")]
    BookingNotFound(Uuid),

    #[error("showtime {0} has already started")]
    ShowtimeInPast(i64),

    #[error("reservation {id} is {status}, expected PENDING")]
    ReservationNotPending { id: Uuid, status: ReservationStatus },

    #[error("hold of reservation {id} expired at {expired_at}")]
    HoldExpired { id: Uuid, expired_at: DateTime<Utc> },

    #[error("booking {id} is {status}, expected CONFIRMED")]
    BookingNotConfirmed { id: Uuid, status: BookingStatus },

    #[error("showtime {0} has started, booking can no longer be cancelled")]
    ShowtimeStarted(i64),

    #[error("seats are not available: {}", .seats.join(", "))]
    SeatUnavailable { seats: Vec<String> },

    #[error("seats were taken concurrently: {}", .seats.join(", "))]
    ConcurrencyLost { seats: Vec<String> },

    #[error("payment declined: {reason}")]
    PaymentDeclined { reason: String, seats: Vec<String> },

    #[error("payment gateway unavailable: {0}")]
    PaymentUnavailable(String),

    #[error(
        "payment {transaction_id} of {amount} captured for reservation {reservation_id} but booking was not recorded"
    )]
    FatalInconsistency {
        reservation_id: Uuid,
        transaction_id: String,
        amount: Money,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BookingError::ShowtimeNotFound(_)
            | BookingError::SeatNotFound { .. }
            | BookingError::ReservationNotFound(_)
            | BookingError::BookingNotFound(_) => ErrorKind::NotFound,
            BookingError::ShowtimeInPast(_)
            | BookingError::ReservationNotPending { .. }
            | BookingError::HoldExpired { .. }
            | BookingError::BookingNotConfirmed { .. }
            | BookingError::ShowtimeStarted(_) => ErrorKind::PreconditionFailed,
            BookingError::SeatUnavailable { .. } | BookingError::ConcurrencyLost { .. } => ErrorKind::Conflict,
            BookingError::PaymentDeclined { .. } => ErrorKind::PaymentDeclined,
            BookingError::PaymentUnavailable(_) => ErrorKind::ServiceUnavailable,
            BookingError::FatalInconsistency { .. } => ErrorKind::FatalInconsistency,
            BookingError::Store(err) if err.is_conflict() => ErrorKind::Conflict,
            BookingError::Store(_) => ErrorKind::Internal,
        }
    }

    /// Места, которые клиенту нужно перерисовать.
    pub fn seats(&self) -> &[String] {
        match self {
            BookingError::SeatNotFound { seats }
            | BookingError::SeatUnavailable { seats }
            | BookingError::ConcurrencyLost { seats }
            | BookingError::PaymentDeclined { seats, .. } => seats,
            BookingError::Store(StoreError::SeatConflict { seats }) => seats,
            _ => &[],
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::PaymentDeclined)
    }
}

pub type BookingResult<T> = Result<T, BookingError>;

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PreconditionFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::PaymentDeclined => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::FatalInconsistency | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    success: bool,
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    seats: &'a [String],
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        // Детали хранилища наружу не отдаём.
        let message = match kind {
            ErrorKind::Internal => "internal error".to_string(),
            ErrorKind::FatalInconsistency => {
                "payment was captured but the booking could not be recorded; support has been notified".to_string()
            }
            _ => self.to_string(),
        };
        if kind == ErrorKind::Internal {
            tracing::error!("request failed: {}", self);
        }

        let body = ErrorBody {
            success: false,
            kind,
            message,
            seats: self.seats(),
        };
        (kind.status_code(), Json(body)).into_response()
    }
}
