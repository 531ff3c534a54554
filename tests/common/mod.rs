#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Barrier, Notify};
use uuid::Uuid;

use cinema_booking::clock::{Clock, ManualClock};
use cinema_booking::config::{
    AppConfig, BookingPolicy, CircuitBreakerConfig, Config, LogFormat, PaymentBackend, PaymentConfig,
    StorageBackend, StorageConfig,
};
use cinema_booking::models::{
    Booking, Money, Payment, PaymentDetails, PaymentMethod, Reservation, ReservationStatus, Seat,
    Showtime,
};
use cinema_booking::services::incident::RecordingIncidentReporter;
use cinema_booking::services::payment::{ChargeReceipt, GatewayError, RefundReceipt};
use cinema_booking::services::{MockPaymentGateway, PaymentGateway};
use cinema_booking::store::{
    BookingStore, Commit, InMemoryStore, StoreError, StoreResult, UnitOfWork, Write,
};
use cinema_booking::AppState;

pub const SHOWTIME: i64 = 1;
pub const ALICE: i64 = 101;
pub const BOB: i64 = 202;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
}

pub fn test_config() -> Config {
    Config {
        app: AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            rust_log: "info".to_string(),
            log_format: LogFormat::Pretty,
        },
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            database_url: None,
            pool_size: 1,
        },
        payment: PaymentConfig {
            backend: PaymentBackend::Mock,
            merchant_id: "cinema".to_string(),
            merchant_password: "secret".to_string(),
            gateway_url: "http://localhost".to_string(),
            currency: "KZT".to_string(),
            timeout_seconds: 5,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            timeout_seconds: 60,
        },
        booking: BookingPolicy::default(),
    }
}

/// Сеанс через сутки от `start_time()`, ряды A и B по 5 мест, по 10.00.
pub fn seed(store: &InMemoryStore) {
    store.insert_showtime(Showtime {
        id: SHOWTIME,
        hall_id: 1,
        start_time: start_time() + Duration::days(1),
        duration_minutes: 120,
        base_price: Money::from_major(10),
    });
    store.insert_seats(["A", "B"].into_iter().flat_map(|row| {
        (1..=5).map(move |n| Seat::new(SHOWTIME, format!("{row}{n}"), "STANDARD", Money::from_major(10)))
    }));
}

pub fn seats(numbers: &[&str]) -> Vec<String> {
    numbers.iter().map(|n| n.to_string()).collect()
}

pub fn card() -> PaymentDetails {
    PaymentDetails {
        method: PaymentMethod::Card,
        token: "tok_visa".to_string(),
    }
}

pub struct Harness {
    pub store: InMemoryStore,
    pub clock: ManualClock,
    pub gateway: Arc<MockPaymentGateway>,
    pub incidents: Arc<RecordingIncidentReporter>,
    pub state: Arc<AppState>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(|store| Arc::new(store) as Arc<dyn BookingStore>)
    }

    /// `wrap` позволяет подставить хранилище-обёртку с внедрёнными сбоями.
    pub fn with_store(wrap: impl FnOnce(InMemoryStore) -> Arc<dyn BookingStore>) -> Self {
        let store = InMemoryStore::new();
        seed(&store);
        let clock = ManualClock::new(start_time());
        let gateway = Arc::new(MockPaymentGateway::new());
        let incidents = Arc::new(RecordingIncidentReporter::new());

        let state = AppState::from_parts(
            test_config(),
            wrap(store.clone()),
            Arc::new(clock.clone()),
            gateway.clone(),
            incidents.clone(),
        );

        Self {
            store,
            clock,
            gateway,
            incidents,
            state,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn seat(&self, number: &str) -> Seat {
        self.store
            .seats_by_number(SHOWTIME, &seats(&[number]))
            .await
            .unwrap()
            .remove(0)
    }

    pub async fn reservation(&self, id: Uuid) -> Reservation {
        self.store.reservation(id).await.unwrap().unwrap()
    }

    /// Состояние над теми же хранилищем и шлюзом, но списания ждут, пока
    /// до шлюза дойдут `parties` запросов.
    pub fn with_rendezvous(&self, parties: usize) -> Arc<AppState> {
        AppState::from_parts(
            test_config(),
            Arc::new(self.store.clone()),
            Arc::new(self.clock.clone()),
            Arc::new(RendezvousGateway {
                inner: self.gateway.clone(),
                barrier: Barrier::new(parties),
            }),
            self.incidents.clone(),
        )
    }

    pub async fn hold(&self, user_id: i64, numbers: &[&str]) -> Reservation {
        self.state
            .reservations
            .create_reservation(user_id, SHOWTIME, seats(numbers))
            .await
            .unwrap()
    }
}

/// Шлюз, который держит списания до встречи всех участников.
pub struct RendezvousGateway {
    pub inner: Arc<MockPaymentGateway>,
    pub barrier: Barrier,
}

#[async_trait]
impl PaymentGateway for RendezvousGateway {
    async fn charge(
        &self,
        amount: Money,
        instrument: &PaymentDetails,
        order_ref: &str,
    ) -> Result<ChargeReceipt, GatewayError> {
        self.barrier.wait().await;
        self.inner.charge(amount, instrument, order_ref).await
    }

    async fn refund(&self, transaction_id: &str, amount: Money) -> Result<RefundReceipt, GatewayError> {
        self.inner.refund(transaction_id, amount).await
    }
}

/// Точка остановки внутри прохода уборщика (после выборки истёкших броней).
#[derive(Default)]
pub struct SweepGate {
    pub entered: Notify,
    pub release: Notify,
}

/// Обёртка над `InMemoryStore` с управляемыми сбоями.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: InMemoryStore,
    pub fail_booking_insert: AtomicBool,
    /// Сколько раз подряд `booking_code_exists` ответит "занят".
    pub code_collisions: AtomicU32,
    pub failing_expirations: Mutex<HashSet<Uuid>>,
    pub sweep_gate: Mutex<Option<Arc<SweepGate>>>,
}

impl FaultyStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }
}

#[async_trait]
impl BookingStore for FaultyStore {
    async fn showtime(&self, id: i64) -> StoreResult<Option<Showtime>> {
        self.inner.showtime(id).await
    }

    async fn seats(&self, showtime_id: i64) -> StoreResult<Vec<Seat>> {
        self.inner.seats(showtime_id).await
    }

    async fn seats_by_number(&self, showtime_id: i64, numbers: &[String]) -> StoreResult<Vec<Seat>> {
        self.inner.seats_by_number(showtime_id, numbers).await
    }

    async fn reservation(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
        self.inner.reservation(id).await
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Reservation>> {
        let found = self.inner.expired_reservations(now, limit).await;
        let gate = self.sweep_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        found
    }

    async fn booking(&self, id: Uuid) -> StoreResult<Option<Booking>> {
        self.inner.booking(id).await
    }

    async fn bookings_for_user(&self, user_id: i64) -> StoreResult<Vec<Booking>> {
        self.inner.bookings_for_user(user_id).await
    }

    async fn payment_for_booking(&self, booking_id: Uuid) -> StoreResult<Option<Payment>> {
        self.inner.payment_for_booking(booking_id).await
    }

    async fn booking_code_exists(&self, code: &str) -> StoreResult<bool> {
        let forced = self
            .code_collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(true);
        }
        self.inner.booking_code_exists(code).await
    }

    async fn apply(&self, unit: UnitOfWork) -> StoreResult<Commit> {
        for write in unit.writes() {
            match write {
                Write::InsertBooking(_) if self.fail_booking_insert.load(Ordering::SeqCst) => {
                    return Err(StoreError::Integrity("simulated write failure".to_string()));
                }
                Write::ReservationStatus {
                    id,
                    to: ReservationStatus::Expired,
                    ..
                } if self.failing_expirations.lock().unwrap().contains(id) => {
                    return Err(StoreError::Integrity("simulated write failure".to_string()));
                }
                _ => {}
            }
        }
        self.inner.apply(unit).await
    }
}

/// Стенд поверх `FaultyStore`; второй элемент - ручка для управления сбоями.
pub fn faulty_harness() -> (Harness, Arc<FaultyStore>) {
    let mut handle = None;
    let harness = Harness::with_store(|store| {
        let faulty = Arc::new(FaultyStore::new(store));
        handle = Some(faulty.clone());
        faulty as Arc<dyn BookingStore>
    });
    (harness, handle.expect("store wrapper is built"))
}
