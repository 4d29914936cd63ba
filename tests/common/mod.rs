#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use serde_json::Value;
use storefront_api::{
    auth::{oauth2::OAuth2Service, AuthConfig, AuthService, TokenPair},
    build_router,
    config::AppConfig,
    db,
    entities::member,
    events::{self, EventSender},
    handlers::AppServices,
    services::{
        catalog::CreateProductRequest,
        gateway::{
            CapturedPayment, PaymentGateway, ProviderError, ProviderPayment,
            ProviderPaymentStatus, WebhookNotification, WebhookVerifier,
        },
        inventory::{RegisterSkuRequest, SkuStock},
        mail::{MailDispatcher, MailMessage},
        members::RegisterMemberRequest,
        orders::{OrderLine, PlaceOrderRequest, PlacedOrder, ShippingAddress},
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "k3v9Qz7Lw2Rm8Tn4Yp6Xs1Ub5Oc0Id7Fe3Gh9Jj2Kl4Mn6Pq8Rs0Tu1Vw3Xy5Za7Bd";
pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const ADMIN_EMAIL: &str = "ops@shop.test";
pub const PASSWORD: &str = "correct horse battery";

/// Scripted payment provider.
///
/// Intents are numbered in issue order. Captures report the authorized
/// amount unless overridden, and every cancel is recorded.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeGatewayState>,
}

#[derive(Default)]
struct FakeGatewayState {
    next_intent: u32,
    authorized: HashMap<String, i64>,
    capture_amounts: HashMap<String, i64>,
    lookups: HashMap<String, ProviderPayment>,
    cancels: Vec<(String, i64)>,
    failing: Option<ProviderError>,
    delay: Option<Duration>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every subsequent call fails with `err` until [`FakeGateway::recover`].
    pub fn fail_with(&self, err: ProviderError) {
        self.state.lock().unwrap().failing = Some(err);
    }

    pub fn recover(&self) {
        self.state.lock().unwrap().failing = None;
    }

    /// Makes every call sleep before answering
    pub fn delay_by(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn capture_amount(&self, intent_id: &str, amount: i64) {
        self.state
            .lock()
            .unwrap()
            .capture_amounts
            .insert(intent_id.to_string(), amount);
    }

    pub fn report(&self, intent_id: &str, payment: ProviderPayment) {
        self.state
            .lock()
            .unwrap()
            .lookups
            .insert(intent_id.to_string(), payment);
    }

    pub fn cancels(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().cancels.clone()
    }

    fn prepare(&self) -> Result<Option<Duration>, ProviderError> {
        let state = self.state.lock().unwrap();
        match &state.failing {
            Some(err) => Err(err.clone()),
            None => Ok(state.delay),
        }
    }

    async fn enter(&self) -> Result<(), ProviderError> {
        if let Some(delay) = self.prepare()? {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn authorize(&self, amount: i64, _order_ref: &str) -> Result<String, ProviderError> {
        self.enter().await?;
        let mut state = self.state.lock().unwrap();
        state.next_intent += 1;
        let intent_id = format!("intent_{}", state.next_intent);
        state.authorized.insert(intent_id.clone(), amount);
        Ok(intent_id)
    }

    async fn capture(&self, intent_id: &str) -> Result<CapturedPayment, ProviderError> {
        self.enter().await?;
        let state = self.state.lock().unwrap();
        let amount = state
            .capture_amounts
            .get(intent_id)
            .or_else(|| state.authorized.get(intent_id))
            .copied()
            .ok_or_else(|| ProviderError::Rejected {
                code: 1,
                message: format!("unknown intent {}", intent_id),
            })?;
        Ok(CapturedPayment {
            transaction_id: transaction_for(intent_id),
            amount,
        })
    }

    async fn cancel(&self, transaction_id: &str, amount: i64) -> Result<(), ProviderError> {
        self.enter().await?;
        self.state
            .lock()
            .unwrap()
            .cancels
            .push((transaction_id.to_string(), amount));
        Ok(())
    }

    async fn lookup(&self, intent_id: &str) -> Result<ProviderPayment, ProviderError> {
        self.enter().await?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .lookups
            .get(intent_id)
            .cloned()
            .unwrap_or(ProviderPayment {
                status: ProviderPaymentStatus::Ready,
                transaction_id: None,
                amount: 0,
            }))
    }
}

/// Transaction id the fake provider assigns to a captured intent
pub fn transaction_for(intent_id: &str) -> String {
    format!("imp_{}", intent_id)
}

/// Collects outgoing mail instead of sending it
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<MailMessage>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailDispatcher for RecordingMailer {
    async fn send(
        &self,
        message: MailMessage,
    ) -> Result<(), storefront_api::errors::ServiceError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

/// Full application over in-memory SQLite with a scripted payment provider.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub mailer: Arc<RecordingMailer>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection keeps every query on the same in-memory database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.payment_gateway_timeout_secs = 1;
        cfg.admin_emails = Some(ADMIN_EMAIL.to_string());
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = FakeGateway::new();
        let mailer = Arc::new(RecordingMailer::default());
        let services = AppServices::new(
            db_arc.clone(),
            &cfg,
            Some(event_sender.clone()),
            gateway.clone(),
            mailer.clone(),
        );
        let auth = Arc::new(AuthService::new(
            AuthConfig::from(&cfg),
            db_arc.clone(),
            services.members.clone(),
        ));
        let oauth2 = Arc::new(OAuth2Service::new(cfg.build_oauth2_config()));

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender: Some(event_sender),
            services,
            auth,
            oauth2,
        };

        Self {
            router: build_router(state.clone()),
            state,
            gateway,
            mailer,
            _event_task: event_task,
        }
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn register(&self, email: &str) -> member::Model {
        self.state
            .services
            .members
            .register(RegisterMemberRequest {
                email: email.to_string(),
                password: PASSWORD.to_string(),
                name: "Test Member".to_string(),
            })
            .await
            .expect("register member")
    }

    /// Registers a member and returns it with a fresh token pair
    pub async fn member_with_tokens(&self, email: &str) -> (member::Model, TokenPair) {
        let member = self.register(email).await;
        let tokens = self
            .state
            .auth
            .issue_tokens(&member)
            .await
            .expect("issue tokens");
        (member, tokens)
    }

    pub async fn admin_token(&self) -> String {
        let (_, tokens) = self.member_with_tokens(ADMIN_EMAIL).await;
        tokens.access_token
    }

    /// Creates a product priced `price` with one SKU holding `stock` units
    pub async fn seed_sku(&self, price: i64, discount_rate: i32, stock: i32) -> SkuStock {
        let product = self
            .state
            .services
            .catalog
            .create_product(CreateProductRequest {
                name: format!("Linen shirt {}", Uuid::new_v4().simple()),
                price,
                discount_rate,
                image_url: None,
                category_id: None,
            })
            .await
            .expect("seed product");
        self.state
            .services
            .inventory
            .register_sku(RegisterSkuRequest {
                product_id: product.id,
                color: "white".to_string(),
                size: "L".to_string(),
                category_id: None,
                initial_stock: stock,
                is_restock_available: false,
            })
            .await
            .expect("seed sku")
    }

    pub async fn place(&self, member_id: Uuid, lines: Vec<OrderLine>) -> PlacedOrder {
        self.state
            .services
            .orders
            .place_order(
                member_id,
                PlaceOrderRequest {
                    lines,
                    shipping_address: address(),
                },
            )
            .await
            .expect("place order")
    }

    pub async fn stock_of(&self, sku_id: Uuid) -> SkuStock {
        self.state
            .services
            .inventory
            .get_sku(sku_id)
            .await
            .expect("sku exists")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn address() -> ShippingAddress {
    ShippingAddress {
        recipient_name: "Kim Minji".to_string(),
        recipient_phone: "010-1234-5678".to_string(),
        zip_code: "06236".to_string(),
        address: "Teheran-ro 152, Gangnam-gu".to_string(),
        address_detail: Some("12F".to_string()),
        delivery_message: None,
    }
}

/// Builds a webhook body signed with the test secret
pub fn signed_webhook(transaction_id: &str, order_id: Uuid, amount: i64, status: &str) -> WebhookNotification {
    let mut notification = WebhookNotification {
        transaction_id: transaction_id.to_string(),
        order_ref: order_id.to_string(),
        amount,
        status: status.to_string(),
        signature: String::new(),
    };
    notification.signature = WebhookVerifier::new(Some(WEBHOOK_SECRET.to_string()))
        .sign(&notification)
        .expect("secret configured");
    notification
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}
