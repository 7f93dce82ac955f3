use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deploy_approver::access::MemoryAccessClient;
use deploy_approver::approval::{DecisionHandler, HandlerRegistry};
use deploy_approver::config::{AccessBackend, Config, Secrets};
use deploy_approver::dispatch::Dispatcher;
use deploy_approver::github::GitHubClient;
use deploy_approver::leader::SingleWriter;
use deploy_approver::reconcile::Reconciler;
use deploy_approver::server::{AppState, build_router};
use deploy_approver::watch::AccessRequestWatcher;
use deploy_approver::webhooks::WebhookSecret;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_approver=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let secrets = Secrets::from_env().context("reading secrets")?;
    let webhook_secret =
        WebhookSecret::new(&secrets.webhook_secret).context("invalid webhook secret")?;

    let github = Arc::new(
        GitHubClient::from_token(secrets.github_token).context("building GitHub client")?,
    );
    let access = match config.access.backend {
        AccessBackend::Memory => {
            tracing::warn!(
                "access backend is \"memory\": requests live only in this process and \
                 no external reviewer can decide them"
            );
            Arc::new(MemoryAccessClient::new())
        }
    };

    let handlers = HandlerRegistry::new(
        config
            .handler_configs()
            .into_iter()
            .map(|c| DecisionHandler::new(c, github.clone(), access.clone())),
    )?;
    let dispatcher = Arc::new(Dispatcher::new(config.dispatcher_config(), handlers));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = dispatcher.run(shutdown).await {
                tracing::error!(error = %e, "dispatcher exited with error");
            }
        });
    }

    let reconciler = Reconciler::new(
        config.reconcile_targets(),
        github.clone(),
        access.clone(),
        dispatcher.clone(),
        Arc::new(SingleWriter),
    )
    .with_interval(config.reconcile_interval());
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    for user in config.users() {
        let watcher = AccessRequestWatcher::new(user, access.clone(), dispatcher.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move { watcher.run(shutdown).await });
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("interrupt received, shutting down"),
                Err(e) => tracing::error!(error = %e, "failed to listen for interrupt"),
            }
            shutdown.cancel();
        }
    });

    let app = build_router(AppState::new(dispatcher.clone(), webhook_secret));
    let addr = config.service.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    shutdown.cancel();

    while tasks.join_next().await.is_some() {}
    served.context("server error")?;
    Ok(())
}
