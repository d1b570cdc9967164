#![allow(dead_code)]

mod auth;
mod detection;
mod email;
mod error;
mod model;
mod observability;
mod prompt;
mod rate_limiters;
mod server_config;
mod state;
#[cfg(test)]
mod testing;
mod util;

use std::{env, sync::Arc, time::Duration};

use auth::credentials::GoogleTokenRefresher;
use chrono::Utc;
use detection::detector::{DetectorConfig, SubscriptionDetector};
use email::client::GmailSourceFactory;
use mimalloc::MiMalloc;
use model::{
    repository::{InMemoryRepository, Repository},
    user::UserAccount,
};
use observability::ScanTracker;
use prompt::mistral::MistralProvider;
use rate_limiters::RateLimiters;
use server_config::ServerConfig;
use state::{
    cancellation::{
        browser::BrowserHost, chromium::ChromiumBrowserHost, engine::CancellationEngine,
        monitor::ConfirmationMonitor,
    },
    jobs::{JobQueue, JobRunner, PipelineHandler},
    registry::Registry,
    scan::orchestrator::ScanOrchestrator,
    service::SubscriptionService,
};
use tokio::signal;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = ServerConfig::from_file(&ServerConfig::default_path())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.settings.log_filter)),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();
    tracing::info!("{}", cfg);

    let http_client = reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .timeout(Duration::from_secs(cfg.gmail.request_timeout_secs))
        .build()?;

    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let credentials = Arc::new(GoogleTokenRefresher::new(http_client.clone(), &cfg.gmail));
    let sources = Arc::new(GmailSourceFactory::new(
        http_client.clone(),
        cfg.gmail.api_base.clone(),
        cfg.gmail.quota_per_second,
    ));
    let rate_limiters = RateLimiters::from_config(&cfg.api.prompt_limits);
    let provider = Arc::new(MistralProvider::new(
        http_client.clone(),
        rate_limiters.clone(),
        &cfg.api,
        &cfg.model,
    ));
    let detector = Arc::new(SubscriptionDetector::new(
        provider,
        DetectorConfig::from(&cfg.model),
    ));
    let registry = Arc::new(Registry::new(repo.clone()));
    let tracker = ScanTracker::new();

    let orchestrator = Arc::new(ScanOrchestrator::new(
        repo.clone(),
        credentials.clone(),
        sources.clone(),
        detector,
        registry.clone(),
        tracker.clone(),
        cfg.scan.clone(),
    ));
    // Without a browser, form links fall through to manual handling
    let browser: Option<Arc<dyn BrowserHost>> = if cfg.cancellation.browser_enabled {
        match ChromiumBrowserHost::launch(&cfg.cancellation).await {
            Ok(host) => Some(Arc::new(host) as Arc<dyn BrowserHost>),
            Err(e) => {
                tracing::error!("Browser automation unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };
    let engine = Arc::new(CancellationEngine::new(
        repo.clone(),
        registry.clone(),
        http_client.clone(),
        browser,
        cfg.cancellation.clone(),
    ));
    let monitor = Arc::new(ConfirmationMonitor::new(
        repo.clone(),
        registry.clone(),
        credentials,
        sources,
        cfg.cancellation.clone(),
        &cfg.scan,
    ));

    let queue = JobQueue::new();
    let service = SubscriptionService::new(
        repo.clone(),
        registry,
        engine.clone(),
        queue.clone(),
        cfg.scan.default_lookback_years,
    );
    let runner = JobRunner::new(
        Arc::new(PipelineHandler::new(orchestrator, engine, monitor.clone())),
        queue,
        cfg.jobs.clone(),
    );

    let mut scheduler = JobScheduler::new().await?;
    {
        let monitor = monitor.clone();
        scheduler
            .add(CronJob::new_repeated_async(
                Duration::from_secs(cfg.cancellation.monitor_interval_secs),
                move |uuid, _l| {
                    let monitor = monitor.clone();
                    Box::pin(async move {
                        match monitor.sweep(Utc::now()).await {
                            Ok(report) => tracing::info!(
                                "Confirmation sweep {}: {:?}",
                                uuid,
                                report
                            ),
                            Err(e) => tracing::error!("Confirmation sweep failed: {:?}", e),
                        }
                    })
                },
            )?)
            .await?;

        let tracker = tracker.clone();
        let rate_limiters = rate_limiters.clone();
        scheduler
            .add(CronJob::new_repeated(
                Duration::from_secs(cfg.jobs.tracker_log_interval_secs),
                move |_uuid, _l| {
                    tracker.log_state();
                    if rate_limiters.is_backing_off() {
                        tracing::info!("{}", rate_limiters.get_status());
                    }
                },
            )?)
            .await?;
    }
    scheduler.set_shutdown_handler(Box::new(move || {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));
    scheduler.start().await?;

    // Optional single mailbox from the environment
    if let Ok(refresh_token) = env::var("GMAIL_REFRESH_TOKEN") {
        let email = env::var("GMAIL_ADDRESS").unwrap_or_else(|_| "me".to_string());
        let user = UserAccount::new(email, refresh_token);
        repo.upsert_user(&user).await?;
        let session_id = service.start_scan(user.id, None).await?;
        tracing::info!("Started scan {} for {}", session_id, user.email);
    }

    let shutdown = CancellationToken::new();
    let runner_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.run(shutdown).await })
    };

    shutdown_signal().await;
    shutdown.cancel();
    scheduler.shutdown().await?;
    runner_handle.await?;
    tracing::info!("Cleanups done, shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
