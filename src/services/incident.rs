//! Эскалация инцидентов, которые нельзя вернуть клиенту как обычную ошибку:
//! деньги списаны, а бронирование не записано.

use std::sync::{Mutex, PoisonError};
use tracing::error;
use uuid::Uuid;

use crate::models::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    Failed,
    /// Возврат не запрашивался: состояние брони не удалось перечитать.
    Withheld,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIncident {
    pub reservation_id: Uuid,
    pub transaction_id: String,
    pub amount: Money,
    pub cause: String,
    pub compensation: RefundOutcome,
}

pub trait IncidentReporter: Send + Sync {
    fn report(&self, incident: &PaymentIncident);
}

/// Пишет инцидент в отдельный target `alert`, на который настроены оповещения.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIncidentReporter;

impl IncidentReporter for LogIncidentReporter {
    fn report(&self, incident: &PaymentIncident) {
        error!(
            target: "alert",
            reservation_id = %incident.reservation_id,
            transaction_id = %incident.transaction_id,
            amount = %incident.amount,
            compensation = ?incident.compensation,
            "🚨 Payment captured but booking was not recorded: {}",
            incident.cause
        );
    }
}

/// Копит инциденты в памяти; для тестов.
#[derive(Debug, Default)]
pub struct RecordingIncidentReporter {
    incidents: Mutex<Vec<PaymentIncident>>,
}

impl RecordingIncidentReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<PaymentIncident> {
        self.incidents.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl IncidentReporter for RecordingIncidentReporter {
    fn report(&self, incident: &PaymentIncident) {
        LogIncidentReporter.report(incident);
        self.incidents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(incident.clone());
    }
}
