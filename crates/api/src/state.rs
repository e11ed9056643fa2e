//! Application state

use sqlx::PgPool;

use billsync_billing::{
    AuditLogger, DispatchWorker, Dispatcher, EntitlementService, EventProcessor,
    ReconciliationEngine, SignatureVerifier, Stores, WebhookIngestor,
};

use crate::{auth::JwtManager, config::Config};

/// Admin tokens are short-lived; operators mint them with `issue-admin-token`
pub const ADMIN_TOKEN_EXPIRY_HOURS: i64 = 8;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// None when running on the in-memory store
    pub pool: Option<PgPool>,
    pub stores: Stores,
    pub processor: EventProcessor,
    pub ingestor: WebhookIngestor,
    pub reconciliation: ReconciliationEngine,
    pub entitlements: EntitlementService,
    pub jwt_manager: JwtManager,
}

impl AppState {
    /// Wire the pipeline. The returned worker must be spawned for webhook
    /// deliveries to be processed inline.
    pub fn new(config: Config, stores: Stores, pool: Option<PgPool>) -> (Self, DispatchWorker) {
        let processor = EventProcessor::new(stores.clone(), config.processor_config());
        let (dispatcher, worker) = Dispatcher::new(processor.clone(), config.dispatch_queue_capacity);

        if config.webhook_secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET is not set; webhook signatures will not be verified");
        }

        let ingestor = WebhookIngestor::new(
            SignatureVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs),
            stores.events.clone(),
            processor.audit_logger().clone(),
            dispatcher,
        );

        let state = Self {
            jwt_manager: JwtManager::new(&config.admin_jwt_secret, ADMIN_TOKEN_EXPIRY_HOURS),
            reconciliation: ReconciliationEngine::new(processor.clone()),
            entitlements: EntitlementService::new(stores.clone()),
            ingestor,
            processor,
            stores,
            pool,
            config,
        };
        (state, worker)
    }

    pub fn audit(&self) -> &AuditLogger {
        self.processor.audit_logger()
    }
}
