//! payment.rs
//!
//! Этот модуль реализует взаимодействие с внешним платёжным шлюзом.
//!
//! Ключевые компоненты:
//! 1.  **PaymentGateway**: контракт шлюза - списание (`charge`) и возврат (`refund`).
//! 2.  **CircuitBreaker**: паттерн "Автоматический выключатель", который
//!     перестаёт дёргать неработающий шлюз после серии сбоев.
//! 3.  **HttpPaymentGateway**: HTTP-клиент шлюза с подписью запросов SHA-256,
//!     все сетевые вызовы проходят через `CircuitBreaker`.
//! 4.  **MockPaymentGateway**: шлюз в памяти для разработки и тестов.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CircuitBreakerConfig, PaymentConfig};
use crate::models::{Money, PaymentDetails};

/// Ошибки платёжного шлюза.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Шлюз ответил, но отказал в операции (карта отклонена, нет средств...).
    #[error("payment declined: {0}")]
    Declined(String),
    /// Circuit Breaker в состоянии Open и блокирует запрос.
    #[error("circuit breaker is open - payment gateway temporarily unavailable")]
    CircuitOpen,
    #[error("payment gateway error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment gateway returned malformed response: {0}")]
    Malformed(String),
}

impl GatewayError {
    pub fn is_decline(&self) -> bool {
        matches!(self, GatewayError::Declined(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub transaction_id: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Списывает `amount` с инструмента клиента. `order_ref` - наш идентификатор
    /// заказа, по нему шлюз дедуплицирует повторы.
    async fn charge(
        &self,
        amount: Money,
        instrument: &PaymentDetails,
        order_ref: &str,
    ) -> Result<ChargeReceipt, GatewayError>;

    async fn refund(&self, transaction_id: &str, amount: Money) -> Result<RefundReceipt, GatewayError>;
}

/* ---------- Circuit Breaker ---------- */

/// Состояния "Автоматического выключателя" (Circuit Breaker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// **Closed (Замкнуто)**: нормальный режим, запросы разрешены.
    Closed,
    /// **Open (Разомкнуто)**: запросы временно запрещены после серии сбоев.
    Open,
    /// **HalfOpen (Полуоткрыто)**: после таймаута пропускается пробный запрос.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    /// Счетчик последовательных сбоев.
    failure_count: AtomicU32,
    /// Момент последнего сбоя для расчета таймаута.
    last_failure: Mutex<Option<Instant>>,
    failure_threshold: u32,
    timeout_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            failure_threshold: failure_threshold.max(1),
            timeout_duration: timeout,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_secs(config.timeout_seconds))
    }

    /// Проверяет, можно ли выполнить следующий запрос к сервису.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let last_failure = *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner);
                let cooled_down = last_failure.map_or(true, |at| at.elapsed() >= self.timeout_duration);

                if cooled_down {
                    *state = CircuitState::HalfOpen;
                    info!("Circuit breaker transitioning to HalfOpen state");
                }
                cooled_down
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == CircuitState::HalfOpen {
            info!("Circuit breaker recovered - transitioning to Closed state");
        }
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let failure_count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *state {
            CircuitState::Closed if failure_count >= self.failure_threshold => {
                *state = CircuitState::Open;
                error!(
                    "Circuit breaker OPENED - {} failures reached threshold {}",
                    failure_count, self.failure_threshold
                );
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                warn!("Circuit breaker test failed - returning to Open state");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }
}

/* ---------- HTTP-шлюз ---------- */

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    amount: i64,
    currency: &'a str,
    #[serde(rename = "orderId")]
    order_id: &'a str,
    #[serde(rename = "paymentMethod")]
    payment_method: &'static str,
    #[serde(rename = "paymentToken")]
    payment_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "transactionId")]
    transaction_id: Option<String>,
    code: Option<i32>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    #[serde(rename = "transactionId")]
    transaction_id: &'a str,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "refundId")]
    refund_id: Option<String>,
    message: Option<String>,
}

#[derive(Debug)]
pub struct HttpPaymentGateway {
    team_slug: String,
    password: String,
    base_url: String,
    currency: String,
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
}

impl HttpPaymentGateway {
    pub fn from_config(config: &PaymentConfig, breaker: &CircuitBreakerConfig) -> Result<Self, GatewayError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            team_slug: config.merchant_id.clone(),
            password: config.merchant_password.clone(),
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            currency: config.currency.clone(),
            http_client,
            circuit_breaker: CircuitBreaker::from_config(breaker),
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Выполняет запрос через Circuit Breaker. Отказ шлюза по бизнес-причине
    /// (decline) сбоем не считается - сбой это только транспорт.
    async fn execute_with_circuit_breaker<F, T>(&self, operation: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, reqwest::Error>>,
    {
        if !self.circuit_breaker.can_execute() {
            warn!("Circuit breaker is OPEN - blocking payment gateway request");
            return Err(GatewayError::CircuitOpen);
        }

        match operation.await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                error!("Payment gateway request failed: {:?}", e);
                self.circuit_breaker.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    /// POST с JSON-телом. 5xx и сетевые ошибки считаются сбоем шлюза; 4xx
    /// с JSON-телом - это ответ по существу (отказ), он разбирается как обычный.
    async fn post_json<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, GatewayError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .execute_with_circuit_breaker(async {
                let response = self.http_client.post(url).json(request).send().await?;
                if response.status().is_client_error() {
                    return Ok(response);
                }
                response.error_for_status()
            })
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Malformed(format!("HTTP {} from {}: {}", status, path, e)))
    }

    /// Подпись запроса: SHA-256 от значимых полей, пароля и идентификатора продавца.
    fn sign(&self, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hasher.update(self.password.as_bytes());
        hasher.update(self.team_slug.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(
        &self,
        amount: Money,
        instrument: &PaymentDetails,
        order_ref: &str,
    ) -> Result<ChargeReceipt, GatewayError> {
        let minor = amount.minor();
        let request = ChargeRequest {
            team_slug: &self.team_slug,
            token: self.sign(&[&minor.to_string(), &self.currency, order_ref]),
            amount: minor,
            currency: &self.currency,
            order_id: order_ref,
            payment_method: instrument.method.as_str(),
            payment_token: &instrument.token,
        };

        info!("Charging {} {} for order {}", amount, self.currency, order_ref);

        let response: ChargeResponse = self.post_json("/api/v1/PaymentCharge/charge", &request).await?;

        if !response.success {
            let reason = response.message.unwrap_or_else(|| "declined".to_string());
            warn!("Gateway declined order {}: {} (code {:?})", order_ref, reason, response.code);
            return Err(GatewayError::Declined(reason));
        }

        let transaction_id = response
            .transaction_id
            .ok_or_else(|| GatewayError::Malformed("successful charge without transactionId".to_string()))?;

        Ok(ChargeReceipt { transaction_id, amount })
    }

    async fn refund(&self, transaction_id: &str, amount: Money) -> Result<RefundReceipt, GatewayError> {
        let minor = amount.minor();
        let request = RefundRequest {
            team_slug: &self.team_slug,
            token: self.sign(&[transaction_id, &minor.to_string()]),
            transaction_id,
            amount: minor,
        };

        info!("Requesting refund of {} for transaction {}", amount, transaction_id);

        let response: RefundResponse = self.post_json("/api/v1/PaymentRefund/refund", &request).await?;

        if !response.success {
            return Err(GatewayError::Declined(
                response.message.unwrap_or_else(|| "refund rejected".to_string()),
            ));
        }

        let refund_id = response
            .refund_id
            .ok_or_else(|| GatewayError::Malformed("successful refund without refundId".to_string()))?;

        Ok(RefundReceipt { refund_id })
    }
}

/* ---------- Mock-шлюз ---------- */

/// Токен инструмента, который mock-шлюз всегда отклоняет.
pub const DECLINED_TOKEN: &str = "tok_declined";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCharge {
    pub order_ref: String,
    pub amount: Money,
    pub transaction_id: String,
}

/// Шлюз в памяти, дедуплицирует списания по `order_ref`, как настоящий.
/// Списания всегда проходят, кроме `DECLINED_TOKEN`
/// или режима `decline_all`; возвраты можно сломать через `fail_refunds`,
/// а `unavailable` изображает разомкнутый Circuit Breaker.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    decline_all: AtomicBool,
    fail_refunds: AtomicBool,
    unavailable: AtomicBool,
    charges: Mutex<Vec<RecordedCharge>>,
    refunds: Mutex<Vec<String>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_decline_all(&self, decline: bool) {
        self.decline_all.store(decline, Ordering::SeqCst);
    }

    pub fn set_fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn charges(&self) -> Vec<RecordedCharge> {
        self.charges.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Идентификаторы транзакций, по которым запрашивался возврат (включая неудачные попытки).
    pub fn refunds(&self) -> Vec<String> {
        self.refunds.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn charge(
        &self,
        amount: Money,
        instrument: &PaymentDetails,
        order_ref: &str,
    ) -> Result<ChargeReceipt, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::CircuitOpen);
        }
        if self.decline_all.load(Ordering::SeqCst) || instrument.token == DECLINED_TOKEN {
            return Err(GatewayError::Declined("card declined".to_string()));
        }

        let mut charges = self.charges.lock().unwrap_or_else(PoisonError::into_inner);
        // Повтор по тому же заказу возвращает уже проведённое списание.
        if let Some(existing) = charges.iter().find(|c| c.order_ref == order_ref) {
            return Ok(ChargeReceipt {
                transaction_id: existing.transaction_id.clone(),
                amount: existing.amount,
            });
        }

        let transaction_id = format!("mock_txn_{}", Uuid::new_v4().simple());
        charges.push(RecordedCharge {
            order_ref: order_ref.to_string(),
            amount,
            transaction_id: transaction_id.clone(),
        });

        Ok(ChargeReceipt { transaction_id, amount })
    }

    async fn refund(&self, transaction_id: &str, _amount: Money) -> Result<RefundReceipt, GatewayError> {
        self.refunds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction_id.to_string());

        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(GatewayError::Declined("refund rejected".to_string()));
        }
        Ok(RefundReceipt {
            refund_id: format!("mock_refund_{}", Uuid::new_v4().simple()),
        })
    }
}
