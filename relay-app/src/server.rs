//! Relay server: wires the components together and serves the HTTP surface.

use crate::bridge::QueryBridge;
use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use crate::inflight::InFlightGuard;
use crate::invoker::CompletionInvoker;
use crate::routes;
use crate::session::SessionStore;
use crate::waiter::ResponseWaiters;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request};
use axum::response::Response;
use relay_broker::BrokerManager;
use relay_llm::{CompletionBackend, CompletionClient};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub bridge: Arc<QueryBridge>,
    pub store: Arc<SessionStore>,
    pub broker: Arc<BrokerManager>,
    pub started_at: Instant,
}

impl AppState {
    #[cfg(test)]
    pub fn for_tests(backend: crate::test_support::ScriptedBackend) -> Arc<Self> {
        let store = Arc::new(SessionStore::new(10));
        let guard = Arc::new(InFlightGuard::default());
        let waiters = Arc::new(ResponseWaiters::default());
        let invoker = Arc::new(CompletionInvoker::new(
            Arc::new(backend),
            store.clone(),
            None,
        ));
        let broker = BrokerManager::new(
            None,
            relay_broker::QueuePolicy {
                stream: "relay:requests".to_string(),
                group: "relay".to_string(),
                consumer: "relay-test".to_string(),
                max_length: 16,
                message_ttl: Duration::from_secs(60),
                reconnect_delay: Duration::from_millis(10),
                block: Duration::from_millis(10),
            },
        )
        .expect("test broker manager");
        let bridge = Arc::new(QueryBridge::new(
            broker.clone(),
            waiters,
            invoker,
            guard,
            Duration::from_millis(500),
        ));
        Arc::new(Self {
            bridge,
            store,
            broker,
            started_at: Instant::now(),
        })
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    tracing::info!(
        model = %cfg.llm.model,
        base_url = %cfg.llm.base_url,
        bind_addr = %cfg.server.bind_addr,
        queue_configured = cfg.queue.url.is_some(),
        "config ok"
    );

    let broker = BrokerManager::new(cfg.queue.url.as_deref(), cfg.queue_policy())?;
    if broker.is_configured() {
        match broker.ensure_connection().await {
            Ok(_) => tracing::info!(stream = %cfg.queue.stream, "broker reachable"),
            Err(e) => tracing::warn!(error = %e, "broker unreachable; requests would fall back to direct invocation"),
        }
    } else {
        tracing::info!("no queue configured; requests are invoked directly");
    }
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    tracing::info!(
        model = %cfg.llm.model,
        bind_addr = %cfg.server.bind_addr,
        queue_configured = cfg.queue.url.is_some(),
        queue_stream = %cfg.queue.stream,
        queue_max_attempts = cfg.queue.max_attempts,
        session_max_turns = cfg.session.max_turns,
        response_timeout_seconds = cfg.session.response_timeout_seconds,
        "status ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr: SocketAddr = cfg.server.bind_addr.parse()?;
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.llm.model,
        base_url = %cfg.llm.base_url,
        queue_configured = cfg.queue.url.is_some(),
        queue_stream = %cfg.queue.stream,
        queue_max_length = cfg.queue.max_length,
        queue_max_attempts = cfg.queue.max_attempts,
        queue_reconnect_delay_seconds = cfg.queue.reconnect_delay_seconds,
        session_max_turns = cfg.session.max_turns,
        response_timeout_seconds = cfg.session.response_timeout_seconds,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let backend: Arc<dyn CompletionBackend> = Arc::new(CompletionClient::new(
        &cfg.llm.api_key,
        &cfg.llm.base_url,
        &cfg.llm.model,
        Duration::from_secs(cfg.llm.request_timeout_seconds),
    ));
    let store = Arc::new(SessionStore::new(cfg.session.max_turns));
    let guard = Arc::new(InFlightGuard::default());
    let waiters = Arc::new(ResponseWaiters::default());
    let invoker = Arc::new(CompletionInvoker::new(
        backend,
        store.clone(),
        cfg.llm.system_prompt.clone(),
    ));
    let broker = BrokerManager::new(cfg.queue.url.as_deref(), cfg.queue_policy())?;
    let bridge = Arc::new(QueryBridge::new(
        broker.clone(),
        waiters.clone(),
        invoker.clone(),
        guard.clone(),
        cfg.response_timeout(),
    ));

    let shutdown = CancellationToken::new();
    let dispatcher_handle = if broker.is_configured() {
        let dispatcher = Dispatcher::new(
            broker.clone(),
            guard,
            invoker,
            waiters,
            cfg.queue.max_attempts,
        );
        let handle = dispatcher.spawn(shutdown.child_token());
        tracing::info!(stream = %cfg.queue.stream, "dispatcher started");
        Some(handle)
    } else {
        tracing::warn!("no queue configured; serving with direct invocation only");
        None
    };

    let state = Arc::new(AppState {
        bridge,
        store,
        broker,
        started_at,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::new(Duration::from_secs(
            cfg.server.http_timeout_seconds,
        )))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if let Some(handle) = dispatcher_handle {
        match handle.await {
            Ok(()) => tracing::info!("dispatcher shutdown completed"),
            Err(e) => tracing::error!(error = %e, "dispatcher join failed during shutdown"),
        }
    }

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
