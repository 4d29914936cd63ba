//! Payment provider adapter.
//!
//! [`PaymentGateway`] is the narrow seam to the external provider; the HTTP
//! implementation speaks an iamport-style JSON API where every response is an
//! envelope `{ "code": 0, "message": null, "response": { .. } }` and a
//! non-zero `code` means the provider refused the request.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider credential on outbound calls
const AUTHORIZATION: &str = "Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPaymentStatus {
    /// Intent exists but nothing has been charged yet
    Ready,
    Paid,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPayment {
    pub transaction_id: String,
    pub amount: i64,
}

/// Provider's view of an intent, as returned by a status lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub status: ProviderPaymentStatus,
    pub transaction_id: Option<String>,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("payment provider timed out")]
    Timeout,
    #[error("payment provider unreachable: {0}")]
    Transport(String),
    #[error("payment provider rejected the request ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("unexpected payment provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Failures that say nothing about the provider's answer and may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::Transport(_))
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        ServiceError::GatewayError(err.to_string())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Registers an expected charge of `amount` for `order_ref`, returning the intent id.
    async fn authorize(&self, amount: i64, order_ref: &str) -> Result<String, ProviderError>;

    async fn capture(&self, intent_id: &str) -> Result<CapturedPayment, ProviderError>;

    /// Cancels (fully or partially) a captured transaction.
    async fn cancel(&self, transaction_id: &str, amount: i64) -> Result<(), ProviderError>;

    async fn lookup(&self, intent_id: &str) -> Result<ProviderPayment, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    message: Option<String>,
    response: Option<T>,
}

#[derive(Debug, Serialize)]
struct PrepareBody<'a> {
    merchant_uid: &'a str,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct PrepareResponse {
    intent_id: String,
}

#[derive(Debug, Serialize)]
struct CancelBody<'a> {
    imp_uid: &'a str,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    imp_uid: Option<String>,
    amount: i64,
    status: ProviderPaymentStatus,
}

/// `PaymentGateway` over the provider's REST API
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Transport(format!("provider returned {}", status)));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if envelope.code != 0 {
            return Err(ProviderError::Rejected {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        envelope
            .response
            .ok_or_else(|| ProviderError::InvalidResponse("empty response body".into()))
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self))]
    async fn authorize(&self, amount: i64, order_ref: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.url("/payments/prepare"))
            .header(AUTHORIZATION, &self.api_key)
            .json(&PrepareBody {
                merchant_uid: order_ref,
                amount,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let prepared: PrepareResponse = Self::read(response).await?;
        debug!(intent_id = %prepared.intent_id, "payment intent registered");
        Ok(prepared.intent_id)
    }

    #[instrument(skip(self))]
    async fn capture(&self, intent_id: &str) -> Result<CapturedPayment, ProviderError> {
        let response = self
            .client
            .post(self.url(&format!("/payments/{}/capture", intent_id)))
            .header(AUTHORIZATION, &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let payment: PaymentResponse = Self::read(response).await?;

        match (payment.status, payment.imp_uid) {
            (ProviderPaymentStatus::Paid, Some(transaction_id)) => Ok(CapturedPayment {
                transaction_id,
                amount: payment.amount,
            }),
            (status, _) => {
                warn!(?status, "capture did not produce a paid transaction");
                Err(ProviderError::Rejected {
                    code: -1,
                    message: format!("payment is {:?}", status).to_lowercase(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn cancel(&self, transaction_id: &str, amount: i64) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.url("/payments/cancel"))
            .header(AUTHORIZATION, &self.api_key)
            .json(&CancelBody {
                imp_uid: transaction_id,
                amount,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let _: serde_json::Value = Self::read(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn lookup(&self, intent_id: &str) -> Result<ProviderPayment, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("/payments/intents/{}", intent_id)))
            .header(AUTHORIZATION, &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let payment: PaymentResponse = Self::read(response).await?;
        Ok(ProviderPayment {
            status: payment.status,
            transaction_id: payment.imp_uid,
            amount: payment.amount,
        })
    }
}

/// Inbound provider callback
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    #[serde(alias = "imp_uid")]
    pub transaction_id: String,
    /// Merchant reference of the charge; the order id
    #[serde(alias = "merchant_uid")]
    pub order_ref: String,
    pub amount: i64,
    pub status: String,
    pub signature: String,
}

/// Checks HMAC-SHA256 signatures on provider callbacks
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    fn mac(&self, notification: &WebhookNotification) -> Option<HmacSha256> {
        let secret = self.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(
            format!(
                "{}|{}|{}|{}",
                notification.transaction_id,
                notification.order_ref,
                notification.amount,
                notification.status
            )
            .as_bytes(),
        );
        Some(mac)
    }

    /// Hex signature for a notification; `None` without a configured secret.
    pub fn sign(&self, notification: &WebhookNotification) -> Option<String> {
        self.mac(notification)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
    }

    /// Callbacks are rejected outright when no secret is configured.
    pub fn verify(&self, notification: &WebhookNotification) -> Result<(), ServiceError> {
        let mac = self.mac(notification).ok_or_else(|| {
            ServiceError::Unauthorized("webhook verification is not configured".into())
        })?;
        let signature = hex::decode(notification.signature.trim())
            .map_err(|_| ServiceError::Unauthorized("malformed webhook signature".into()))?;
        mac.verify_slice(&signature)
            .map_err(|_| ServiceError::Unauthorized("invalid webhook signature".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> HttpPaymentGateway {
        HttpPaymentGateway::new(server.uri(), "test-key", Duration::from_millis(300)).unwrap()
    }

    fn notification(amount: i64) -> WebhookNotification {
        WebhookNotification {
            transaction_id: "imp_1".into(),
            order_ref: "order-1".into(),
            amount,
            status: "paid".into(),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn authorize_returns_intent_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments/prepare"))
            .and(header("Authorization", "test-key"))
            .and(body_json(json!({ "merchant_uid": "order-1", "amount": 15000 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "message": null,
                "response": { "intent_id": "intent_42" }
            })))
            .mount(&server)
            .await;

        let intent = gateway(&server).authorize(15_000, "order-1").await.unwrap();
        assert_eq!(intent, "intent_42");
    }

    #[tokio::test]
    async fn provider_refusal_is_rejected_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": -1,
                "message": "already cancelled",
                "response": null
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).cancel("imp_1", 1000).await.unwrap_err();
        assert_matches!(err, ProviderError::Rejected { code: -1, .. });
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/intents/intent_1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = gateway(&server).lookup("intent_1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments/intent_1/capture"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(json!({ "code": 0, "response": null })),
            )
            .mount(&server)
            .await;

        let err = gateway(&server).capture("intent_1").await.unwrap_err();
        assert_eq!(err, ProviderError::Timeout);
    }

    #[tokio::test]
    async fn lookup_maps_provider_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/intents/intent_7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "response": { "imp_uid": "imp_7", "amount": 9000, "status": "paid" }
            })))
            .mount(&server)
            .await;

        let payment = gateway(&server).lookup("intent_7").await.unwrap();
        assert_eq!(
            payment,
            ProviderPayment {
                status: ProviderPaymentStatus::Paid,
                transaction_id: Some("imp_7".into()),
                amount: 9000,
            }
        );
    }

    #[test]
    fn webhook_signature_covers_amount() {
        let verifier = WebhookVerifier::new(Some("whsec".into()));
        let mut signed = notification(5000);
        signed.signature = verifier.sign(&signed).unwrap();
        assert!(verifier.verify(&signed).is_ok());

        let mut tampered = signed.clone();
        tampered.amount = 1;
        assert_matches!(verifier.verify(&tampered), Err(ServiceError::Unauthorized(_)));

        let mut garbage = signed;
        garbage.signature = "not-hex".into();
        assert_matches!(verifier.verify(&garbage), Err(ServiceError::Unauthorized(_)));
    }

    #[test]
    fn webhooks_rejected_without_secret() {
        let verifier = WebhookVerifier::new(Some(String::new()));
        assert!(verifier.sign(&notification(1)).is_none());
        assert_matches!(
            verifier.verify(&notification(1)),
            Err(ServiceError::Unauthorized(_))
        );
    }
}
