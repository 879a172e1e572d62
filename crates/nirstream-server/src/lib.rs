//! Nirstream Export Server - Axum WebSocket distribution
//!
//! Streams a stored recording to up to three remote subscribers. Clients
//! connect with the `security-phrase` header, receive playback commands as
//! plain text and data frames as JSON arrays.

pub mod api;
pub mod clients;
pub mod stream;
pub mod ws;

use axum::http::{header, HeaderValue};
use axum::Router;
use clients::{ClientStatus, Roster};
use nirstream_core::storage::RecordingStore;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stream::{Command, PlaybackState, StreamCursor};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Ports tried in order when the server starts
pub const DEFAULT_PORTS: [u16; 6] = [9797, 9898, 8080, 9090, 2424, 2525];

/// Handshake header carrying the shared secret
pub const SECRET_HEADER: &str = "security-phrase";

pub const DEFAULT_SECRET: &str = "beastspectrum-export-stream+";

/// Version answered to `get-protocol-version`
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors starting or driving the export server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Network problem, could not find any available port")]
    NoAvailablePort,

    #[error("No export client is connected")]
    NoClients,

    #[error("No recording selected for export")]
    NoRecording,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a connection was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Security phrase was incorrect! Please try again.")]
    Credential,

    #[error("Server has reached the maximum number of active sockets.")]
    Capacity,
}

/// Points per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputShape {
    /// 25 points per frame
    #[default]
    Batch,
    /// One point per frame
    SinglePoint,
}

/// How each point is written into a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// `{timeStamp,O2Hb,HHb,THb,TOI,HbDiff,PI,SCORx,SCPRx}`
    #[default]
    Json,
    /// `"[ts,O2Hb,HHb,THb,TOI,0,0,0,0]"`
    Delimited,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Bind address
    pub bind_addr: String,
    /// Port candidates, first free wins
    pub ports: Vec<u16>,
    pub secret: String,
    pub output_shape: OutputShape,
    pub encoding: Encoding,
    /// Per-point tick; a frame goes out every `tick_interval_ms * batch_size`
    pub tick_interval_ms: u64,
    pub max_clients: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            ports: DEFAULT_PORTS.to_vec(),
            secret: DEFAULT_SECRET.to_string(),
            output_shape: OutputShape::default(),
            encoding: Encoding::default(),
            tick_interval_ms: 10,
            max_clients: 3,
        }
    }
}

impl ExportConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Notifications for the local application
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    ClientConnected { client: String, addr: String },
    ClientDisconnected { client: String },
    /// Text received from a client, prefixed with its id
    ClientMessage { client: String, message: String },
    Error(String),
    StatusChanged(ServerStatus),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub clients: usize,
    pub protocols: Vec<String>,
    pub status: String,
    pub streaming: PlaybackState,
}

/// One local network interface
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub ip: Vec<NetworkInterface>,
    pub port: u16,
    pub version: String,
}

/// Shared server state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ExportConfig>,
    /// Source of exported rows
    pub store: Arc<dyn RecordingStore>,
    /// Text broadcast to every client: commands and data frames
    pub ws_tx: broadcast::Sender<String>,
    roster: Arc<Mutex<Roster>>,
    cursor: Arc<Mutex<StreamCursor>>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    shutdown: watch::Receiver<bool>,
    /// Cleared once the listener stops accepting
    listening: Arc<AtomicBool>,
    port: u16,
}

impl AppState {
    pub fn new(
        config: ExportConfig,
        store: Arc<dyn RecordingStore>,
        events: Option<mpsc::UnboundedSender<ServerEvent>>,
        shutdown: watch::Receiver<bool>,
        port: u16,
    ) -> Self {
        let (ws_tx, _) = broadcast::channel(256);
        Self {
            config: Arc::new(config),
            store,
            ws_tx,
            roster: Arc::new(Mutex::new(Roster::default())),
            cursor: Arc::new(Mutex::new(StreamCursor::default())),
            events,
            shutdown,
            listening: Arc::new(AtomicBool::new(true)),
            port,
        }
    }

    /// Broadcast a command to every client
    pub fn send_command(&self, command: Command) {
        let _ = self.ws_tx.send(command.as_str().to_string());
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            clients: self.client_count(),
            protocols: vec!["Protocol 1".to_string(), "Protocol 2".to_string()],
            status: if self.is_listening() { "Active" } else { "Error" }.to_string(),
            streaming: self.playback(),
        }
    }

    pub fn info(&self) -> ServerInfo {
        let ip = local_ip_address::list_afinet_netifas()
            .map(|ifas| {
                ifas.into_iter()
                    .map(|(name, ip)| NetworkInterface { name, ip })
                    .collect()
            })
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to list network interfaces");
                Vec::new()
            });
        ServerInfo {
            ip,
            port: self.port,
            version: nirstream_core::VERSION.to_string(),
        }
    }

    pub fn clients(&self) -> Vec<ClientStatus> {
        lock(&self.roster).clients().to_vec()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.roster).len()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Release);
    }

    pub(crate) fn notify(&self, event: ServerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub(crate) fn publish_status(&self) {
        self.notify(ServerEvent::StatusChanged(self.status()));
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // WebSocket export stream
        .route("/", axum::routing::get(ws::ws_handler))
        // REST API
        .route("/api/v1/status", axum::routing::get(api::get_status))
        .route("/api/v1/info", axum::routing::get(api::get_info))
        .route("/api/v1/clients", axum::routing::get(api::get_clients))
        .route("/api/v1/stream", axum::routing::post(api::control_stream))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Bind the first free candidate port
pub async fn bind_first_free(
    bind_addr: &str,
    ports: &[u16],
) -> Result<TcpListener, ServerError> {
    for &port in ports {
        match TcpListener::bind((bind_addr, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!(port, error = %e, "Port unavailable"),
        }
    }
    Err(ServerError::NoAvailablePort)
}

/// Running export server
pub struct ExportServer {
    state: AppState,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ExportServer {
    /// Bind and start serving
    pub async fn start(
        config: ExportConfig,
        store: Arc<dyn RecordingStore>,
        events: Option<mpsc::UnboundedSender<ServerEvent>>,
    ) -> Result<Self, ServerError> {
        let listener = bind_first_free(&config.bind_addr, &config.ports).await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = AppState::new(config, store, events, shutdown_rx.clone(), addr.port());
        let app = build_router(state.clone());

        tracing::info!(%addr, "Export server listening");

        let mut signal = shutdown_rx;
        let served_state = state.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = signal.wait_for(|stop| *stop).await;
            })
            .await;
            served_state.set_listening(false);
            if let Err(e) = served {
                tracing::error!(error = %e, "Export server error");
                served_state.notify(ServerEvent::Error(e.to_string()));
            }
            served_state.publish_status();
        });

        Ok(Self {
            state,
            addr,
            shutdown,
            task,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Close every client and stop listening
    pub async fn stop(self) {
        self.state.halt_stream();
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Export server task failed");
        }
        tracing::info!(port = self.addr.port(), "Export server stopped");
    }
}
