pub mod money;
pub mod showtime;
pub mod seat;
pub mod reservation;
pub mod booking;
pub mod payment;

pub use money::Money;
pub use showtime::Showtime;
pub use seat::{Seat, SeatStatus};
pub use reservation::{Reservation, ReservationStatus};
pub use booking::{Booking, BookingStatus};
pub use payment::{Payment, PaymentDetails, PaymentMethod, PaymentStatus};

/// Строковое значение статуса из хранилища не распознано.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {entity} status '{value}'")]
pub struct ParseStatusError {
    pub entity: &'static str,
    pub value: String,
}

// Статусы хранятся в БД как TEXT в SCREAMING_SNAKE_CASE, в JSON - так же.
macro_rules! text_enum {
    ($name:ident, $entity:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::models::ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::models::ParseStatusError {
                        entity: $entity,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use text_enum;
