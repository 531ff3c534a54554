use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::models::{Reservation, ReservationStatus, SeatStatus};
use crate::store::{BookingStore, Commit, SeatWrite, StoreError, StoreResult, UnitOfWork};

/// Итоги одного прохода уборщика.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub seats_released: usize,
    /// Места, которые к моменту освобождения уже ушли из HELD.
    pub seats_skipped: usize,
    /// Брони, которые успели подтвердить или отменить раньше уборщика.
    pub lost_races: usize,
    pub failed: usize,
    /// Проход пропущен: предыдущий ещё не закончился.
    pub skipped_tick: bool,
}

/// Освобождает места истёкшей брони и переводит её в EXPIRED одной единицей
/// работы. Место, которое уже не HELD этой бронью, пропускается.
pub async fn release_expired_hold(store: &dyn BookingStore, reservation: &Reservation) -> StoreResult<Commit> {
    let seats = store
        .seats_by_number(reservation.showtime_id, &reservation.seat_numbers)
        .await?;

    let releases = seats
        .iter()
        .filter(|seat| seat.status == SeatStatus::Held && seat.is_owned_by(reservation.id))
        .map(|seat| SeatWrite::from_seat(seat, SeatStatus::Available).or_skip());

    let unit = UnitOfWork::new().seats(releases).reservation_status(
        reservation.id,
        ReservationStatus::Pending,
        ReservationStatus::Expired,
    );
    store.apply(unit).await
}

/// Сбрасывает флаг прохода даже при панике внутри него.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ExpirationSweeper {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
    concurrency: usize,
    running: AtomicBool,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>, policy: &BookingPolicy) -> Self {
        Self {
            store,
            clock,
            interval: policy.sweep_interval(),
            batch_size: policy.sweep_batch_size.max(1),
            concurrency: policy.sweep_concurrency.max(1),
            running: AtomicBool::new(false),
        }
    }

    /// Фоновый цикл: проход раз в `interval` до сигнала остановки.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("🧹 Expiration sweeper started, interval {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("🧹 Expiration sweeper stopped");
    }

    /// Один проход. Если предыдущий ещё идёт, этот пропускается.
    pub async fn run_once(&self) -> SweepReport {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Previous sweep still running, skipping tick");
            return SweepReport {
                skipped_tick: true,
                ..SweepReport::default()
            };
        }
        let _guard = InFlight(&self.running);

        self.sweep().await
    }

    async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let expired = match self.store.expired_reservations(now, self.batch_size).await {
            Ok(expired) => expired,
            Err(e) => {
                error!("Failed to load expired reservations: {}", e);
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            scanned: expired.len(),
            ..SweepReport::default()
        };
        if expired.is_empty() {
            debug!("⏰ No expired holds to sweep");
            return report;
        }

        info!("⏰ Found {} expired holds to sweep", expired.len());

        let store = &self.store;
        let outcomes: Vec<_> = stream::iter(expired)
            .map(|reservation| async move {
                let outcome = release_expired_hold(store.as_ref(), &reservation).await;
                (reservation, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        // Ошибка одной брони не прерывает остальные.
        for (reservation, outcome) in outcomes {
            match outcome {
                Ok(commit) => {
                    report.expired += 1;
                    report.seats_released += commit.applied_seats.len();
                    report.seats_skipped += commit.skipped_seats.len();
                    debug!(
                        "Reservation {} expired, {} seats released",
                        reservation.id,
                        commit.applied_seats.len()
                    );
                }
                Err(StoreError::RecordConflict { .. }) => {
                    report.lost_races += 1;
                    debug!("Reservation {} changed before sweep, leaving it", reservation.id);
                }
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to expire reservation {}: {}", reservation.id, e);
                }
            }
        }

        info!(
            "✅ Sweep completed: {} expired, {} seats released, {} skipped, {} failed",
            report.expired, report.seats_released, report.seats_skipped, report.failed
        );
        report
    }
}
