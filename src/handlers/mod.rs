pub mod cart;
pub mod catalog;
pub mod members;
pub mod orders;
pub mod payments;

use std::sync::Arc;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        cart::CartService,
        catalog::CatalogService,
        gateway::{PaymentGateway, WebhookVerifier},
        inventory::InventoryLedger,
        mail::MailDispatcher,
        members::{MemberService, MemberSettings},
        orders::OrderService,
        payments::PaymentReconciliationService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub inventory: Arc<InventoryLedger>,
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentReconciliationService>,
    pub members: Arc<MemberService>,
}

impl AppServices {
    /// Wires every service against one pool. The payment provider and mail
    /// transport are injected so tests can substitute scripted fakes.
    pub fn new(
        db: Arc<DbPool>,
        config: &AppConfig,
        event_sender: Option<Arc<EventSender>>,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn MailDispatcher>,
    ) -> Self {
        let inventory = Arc::new(InventoryLedger::new(db.clone(), event_sender.clone()));
        let cart = Arc::new(CartService::new(db.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            inventory.clone(),
            cart.clone(),
            event_sender.clone(),
        ));

        let breaker = Arc::new(CircuitBreaker::new(
            "payment_gateway",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                timeout: std::time::Duration::from_secs(config.circuit_breaker_timeout_secs),
                ..CircuitBreakerConfig::default()
            },
        ));
        let payments = Arc::new(PaymentReconciliationService::new(
            orders.clone(),
            gateway,
            breaker,
            WebhookVerifier::new(config.payment_webhook_secret.clone()),
            config.payment_gateway_timeout(),
        ));

        let members = Arc::new(MemberService::new(
            db.clone(),
            mailer,
            event_sender,
            MemberSettings {
                verification_ttl: config.email_verification_ttl(),
                admin_emails: config.admin_emails(),
                verification_url: format!(
                    "http://{}:{}/auth/verify-email",
                    config.host, config.port
                ),
            },
        ));

        Self {
            catalog: Arc::new(CatalogService::new(db)),
            inventory,
            cart,
            orders,
            payments,
            members,
        }
    }
}

/// Rejects callers acting on a resource they do not own.
pub(crate) fn ensure_owner(
    user: &crate::auth::AuthUser,
    owner_id: uuid::Uuid,
) -> Result<(), ServiceError> {
    if user.can_access(owner_id) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "resource belongs to another member".to_string(),
        ))
    }
}
