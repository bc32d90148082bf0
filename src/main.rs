//! anifeed - watches anime RSS feeds, downloads new episodes through
//! OpenList offline downloads and files them into a media library.

mod api;
mod clients;
mod config;
mod db;
mod error;
mod feed;
mod notify;
mod pipeline;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::clients::llm::OpenAiExtractor;
use crate::clients::local::LocalStorage;
use crate::clients::openlist::OpenListClient;
use crate::clients::tmdb::TmdbCatalog;
use crate::config::{Config, Loaded, StorageKind};
use crate::db::Db;
use crate::error::PipelineError;
use crate::feed::HttpFeedSource;
use crate::notify::NotificationManager;
use crate::pipeline::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use crate::pipeline::resolver::{MetadataResolver, ResolverSettings};
use crate::pipeline::traits::StorageBackend;
use crate::retry::RetryConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let path = config::config_path();
    let loaded = Config::load_or_create(&path).await?;
    let (config, created) = match loaded {
        Loaded::Existing(config) => (config, false),
        Loaded::Created(config) => (config, true),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if created {
        let err = PipelineError::FatalConfig(format!(
            "no configuration found, defaults written to {}; fill it in and restart",
            path.display()
        ));
        tracing::error!("{}", err);
        return Err(err.into());
    }

    for problem in config.validate() {
        tracing::error!("Config: {}", problem);
    }
    config.ensure_valid()?;

    clients::init_http_client(&config.proxy)?;

    let db = Db::open(&config.database_path())?;
    tracing::info!("Database ready at {}", config.database_path());

    let openlist = Arc::new(OpenListClient::new(&config.openlist));
    openlist
        .check_health()
        .await
        .map_err(|e| PipelineError::FatalConfig(format!("OpenList unreachable: {:#}", e)))?;
    openlist
        .check_tool()
        .await
        .map_err(|e| PipelineError::FatalConfig(format!("{:#}", e)))?;
    tracing::info!(
        "OpenList ready at {} using {}",
        config.openlist.url,
        config.openlist.offline_download_tool.as_str()
    );

    if config.tmdb.api_key.is_empty() {
        tracing::warn!("TMDB API key not set, titles will not be checked against the catalog");
    }
    let resolver = MetadataResolver::new(
        Arc::new(OpenAiExtractor::new(&config.llm)),
        Arc::new(TmdbCatalog::new(&config.tmdb)),
        ResolverSettings {
            similarity_threshold: config.pipeline.similarity_threshold,
            retry: RetryConfig::new(
                config.llm.max_retries.max(1),
                Duration::from_millis(config.llm.retry_initial_ms),
            ),
        },
    );

    let notifier = NotificationManager::from_config(&config.notification);
    tracing::info!("{} notification channel(s) active", notifier.channel_count());

    let storage: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageKind::OpenList => openlist.clone(),
        StorageKind::Local => {
            let root = &config.storage.local_root;
            if !tokio::fs::try_exists(root).await.unwrap_or(false) {
                let err = PipelineError::FatalConfig(format!("[storage] local_root {} does not exist", root));
                tracing::error!("{}", err);
                return Err(err.into());
            }
            tracing::info!("Moving files directly under {}", root);
            Arc::new(LocalStorage::new(root))
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::new(
        db.clone(),
        Collaborators {
            feeds: Arc::new(HttpFeedSource),
            downloads: openlist,
            storage,
            resolver: Arc::new(resolver),
            notifier: Arc::new(notifier),
        },
        OrchestratorSettings::from_config(&config),
        shutdown_rx.clone(),
    );
    orchestrator.recover().await?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {:?}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let server = if config.server.enabled {
        let listener = tokio::net::TcpListener::bind(&config.server.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind))?;
        tracing::info!("Review page on http://{}", config.server.bind);

        let app = api::router(db.clone());
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Review server failed: {:?}", e);
            }
        }))
    } else {
        None
    };

    pipeline::tracker::run(
        orchestrator,
        Duration::from_secs(config.rss.interval_secs.max(1)),
        shutdown_rx,
    )
    .await;

    if let Some(server) = server {
        let _ = server.await;
    }
    tracing::info!("Bye");
    Ok(())
}
