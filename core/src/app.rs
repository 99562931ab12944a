//! Application context built once at startup and shared by every request
//! handler. Credential discovery happens here and nowhere else.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agents::config::{self, build_gateways, discover_credentials, load_settings};
use crate::agents::{AiProviderInfo, Orchestrator, OrchestratorSettings, ProviderGateway};
use crate::aggregator::ResponseAggregator;
use crate::context::routing::RoutingClassifier;
use crate::context::ContextManager;
use crate::db::{init_db, DbPool, SqliteStorage};
use crate::router::Router;

/// Startup options, normally read from the environment.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub workspace_dir: Option<PathBuf>,
    pub ephemeral: bool,
}

impl AppConfig {
    pub fn from_env(workspace_dir: Option<PathBuf>) -> Self {
        let ephemeral = std::env::var("CHORUS_EPHEMERAL")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            workspace_dir,
            ephemeral,
        }
    }
}

pub struct AppContext {
    pub db: Option<DbPool>,
    pub router: Router,
    providers: Vec<AiProviderInfo>,
}

impl AppContext {
    /// Open the workspace database, discover credentials and wire the
    /// components together. Must run inside a Tokio runtime.
    pub fn bootstrap(app_config: AppConfig) -> Result<Self> {
        let db = match (&app_config.workspace_dir, app_config.ephemeral) {
            (Some(dir), false) => Some(init_db(dir.clone()).context("failed to open workspace database")?),
            _ => None,
        };

        let mut settings = match &db {
            Some(pool) => {
                let conn = pool.get()?;
                load_settings(&conn).context("failed to load orchestrator settings")?
            }
            None => OrchestratorSettings::default(),
        };
        if db.is_none() {
            settings.persist = false;
        }

        let credentials = {
            let conn = db.as_ref().map(|pool| pool.get()).transpose()?;
            discover_credentials(conn.as_deref(), |key| std::env::var(key).ok())?
        };
        let gateways = build_gateways(&credentials)?;
        tracing::info!(
            "{} provider(s) configured: {}",
            gateways.len(),
            gateways
                .iter()
                .map(|g| g.descriptor().id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self::assemble(settings, gateways, db))
    }

    /// Wire already-built gateways. Storage is attached only when a pool is
    /// given and the settings ask for persistence.
    pub fn assemble(
        settings: OrchestratorSettings,
        gateways: Vec<Arc<dyn ProviderGateway>>,
        db: Option<DbPool>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(gateways));
        let available = orchestrator.available_providers();

        let designated = |preferred: &str| {
            settings
                .resolve_provider(preferred, &available)
                .and_then(|id| orchestrator.gateway(id))
        };
        let classifier = designated(&settings.classifier_provider);
        let synthesizer = designated(&settings.synthesis_provider);

        let mut contexts = ContextManager::new(settings.clone());
        if let Some(gateway) = classifier {
            let classifier =
                RoutingClassifier::new(gateway, &settings.name, settings.classifier_temperature);
            contexts = contexts.with_classifier(classifier, available.clone());
        }
        if let (Some(pool), true) = (&db, settings.persist) {
            contexts = contexts.with_storage(Arc::new(SqliteStorage::new(pool.clone())));
        } else {
            tracing::info!("running without persistence");
        }

        let router = Router::new(
            Arc::new(contexts),
            orchestrator,
            ResponseAggregator::new(synthesizer),
            db.clone(),
        );
        Self {
            db,
            router,
            providers: config::list_providers(&available),
        }
    }

    pub fn providers(&self) -> &[AiProviderInfo] {
        &self.providers
    }

    pub fn available_providers(&self) -> Vec<String> {
        self.router.orchestrator().available_providers()
    }

    /// Wait for queued conversation writes.
    pub async fn shutdown(&self) {
        self.router.contexts().flush().await;
    }
}
