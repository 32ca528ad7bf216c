//! `PulseServer`: axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::client::{Client, ClientContext};
use crate::websocket::manager::ClientManager;
use crate::websocket::observer::{ClientObserver, TracingObserver};
use crate::websocket::router::Router;
use crate::websocket::transport;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<ClientManager>,
    ctx: ClientContext,
    client: ClientConfig,
    slots: ConnectionSlots,
    shutdown: ShutdownCoordinator,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

/// Counts upgraded sockets against `max_connections`.
///
/// A slot is taken before the upgrade and held until the client's pumps have
/// both stopped, so concurrent upgrades cannot overshoot the cap.
#[derive(Clone, Debug)]
struct ConnectionSlots {
    used: Arc<AtomicUsize>,
    max: usize,
}

impl ConnectionSlots {
    fn new(max: usize) -> Self {
        Self {
            used: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    fn try_acquire(&self) -> Option<SlotGuard> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| SlotGuard {
                used: Arc::clone(&self.used),
            })
    }
}

/// Releases its slot on drop.
#[derive(Debug)]
struct SlotGuard {
    used: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.used.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The relay server.
pub struct PulseServer {
    config: ServerConfig,
    manager: Arc<ClientManager>,
    router: Arc<dyn Router>,
    observer: Arc<dyn ClientObserver>,
    slots: ConnectionSlots,
    shutdown: ShutdownCoordinator,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl PulseServer {
    /// Create a server dispatching inbound events to `router` and registering
    /// clients with `manager`.
    pub fn new(config: ServerConfig, router: Arc<dyn Router>, manager: Arc<ClientManager>) -> Self {
        let slots = ConnectionSlots::new(config.max_connections);
        Self {
            config,
            manager,
            router,
            observer: Arc::new(TracingObserver),
            slots,
            shutdown: ShutdownCoordinator::new(),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Report pump events to `observer` instead of the log.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ClientObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Build the axum router with all routes.
    pub fn app(&self) -> axum::Router {
        let ctx = ClientContext::new(self.manager.clone(), self.router.clone())
            .with_observer(self.observer.clone());
        let state = AppState {
            manager: self.manager.clone(),
            ctx,
            client: self.config.client,
            slots: self.slots.clone(),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        axum::Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Bind and serve in the background.
    ///
    /// Returns the bound address and the serve task. The task finishes after
    /// [`ShutdownCoordinator::shutdown`], once every client queue has been
    /// closed and in-flight HTTP requests are done.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "pulse server listening");

        let app = self.app();
        let token = self.shutdown.token();
        let manager = self.manager.clone();
        let handle = tokio::spawn(async move {
            let signal = async move {
                token.cancelled().await;
                let closed = manager.close_all();
                info!(closed, "shutdown: closing client connections");
            };
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(%error, "server stopped with error");
            }
        });
        Ok((addr, handle))
    }

    /// Wait until every client has deregistered. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            while !self.manager.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Client registry.
    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(slot) = state.slots.try_acquire() else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(
            max_connections = state.slots.max,
            "refusing websocket upgrade: connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };
    ws.max_message_size(state.client.read_limit)
        .on_upgrade(move |socket| handle_socket(socket, state, slot))
}

async fn handle_socket(socket: WebSocket, state: AppState, slot: SlotGuard) {
    let connection = transport::from_websocket(socket);
    let (client, handles) = Client::connect(connection, &state.client, state.ctx);
    info!(client_id = %client.id(), "client connected");
    let (read, write) = handles.join().await;
    info!(
        client_id = %client.id(),
        read = %read,
        write = %write,
        connected_secs = client.age().as_secs_f64(),
        "client disconnected"
    );
    drop(slot);
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.manager.len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
