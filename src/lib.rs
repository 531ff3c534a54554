pub mod clock;
pub mod config;
pub mod controllers;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, PaymentBackend, StorageBackend};
use crate::ledger::SeatLedger;
use crate::services::{
    BookingConfirmer, CancellationService, ExpirationSweeper, HttpPaymentGateway, IncidentReporter,
    LogIncidentReporter, MockPaymentGateway, PaymentGateway, ReservationManager,
};
use crate::store::{BookingStore, InMemoryStore, PgStore};

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn BookingStore>,
    pub clock: Arc<dyn Clock>,
    pub ledger: SeatLedger,
    pub reservations: ReservationManager,
    pub confirmer: Arc<BookingConfirmer>,
    pub cancellations: Arc<CancellationService>,
    pub sweeper: Arc<ExpirationSweeper>,
}

impl AppState {
    /// Поднимает хранилище и шлюз по конфигурации.
    pub async fn new(config: Config) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn BookingStore> = match config.storage.backend {
            StorageBackend::Postgres => {
                let url = config
                    .storage
                    .database_url
                    .as_deref()
                    .ok_or(crate::config::ConfigError::Missing("DATABASE_URL"))?;
                Arc::new(PgStore::connect(url, config.storage.pool_size).await?)
            }
            StorageBackend::Memory => {
                let store = InMemoryStore::new();
                store.seed_demo(clock.now());
                info!("Using in-memory store with demo catalog");
                Arc::new(store)
            }
        };

        let gateway: Arc<dyn PaymentGateway> = match config.payment.backend {
            PaymentBackend::Http => Arc::new(HttpPaymentGateway::from_config(
                &config.payment,
                &config.circuit_breaker,
            )?),
            PaymentBackend::Mock => {
                info!("Using mock payment gateway");
                Arc::new(MockPaymentGateway::new())
            }
        };

        Ok(Self::from_parts(config, store, clock, gateway, Arc::new(LogIncidentReporter)))
    }

    /// Сборка из готовых зависимостей; так же собираются тесты.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        incidents: Arc<dyn IncidentReporter>,
    ) -> Arc<Self> {
        let policy = config.booking.clone();

        Arc::new(Self {
            ledger: SeatLedger::new(store.clone()),
            reservations: ReservationManager::new(store.clone(), clock.clone(), policy.clone()),
            confirmer: Arc::new(BookingConfirmer::new(
                store.clone(),
                clock.clone(),
                gateway.clone(),
                incidents,
                policy.clone(),
            )),
            cancellations: Arc::new(CancellationService::new(store.clone(), clock.clone(), gateway)),
            sweeper: Arc::new(ExpirationSweeper::new(store.clone(), clock.clone(), &policy)),
            config,
            store,
            clock,
        })
    }
}

/// Корневой роутер: `/health` и API под `/api`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
