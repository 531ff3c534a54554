pub mod booking;
pub mod cancellation;
pub mod incident;
pub mod payment;
pub mod reservation;
pub mod sweeper;

pub use booking::BookingConfirmer;
pub use cancellation::{CancellationOutcome, CancellationService, RefundState};
pub use incident::{IncidentReporter, LogIncidentReporter};
pub use payment::{HttpPaymentGateway, MockPaymentGateway, PaymentGateway};
pub use reservation::ReservationManager;
pub use sweeper::{ExpirationSweeper, SweepReport};
