use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::FromRef;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde_json::json;
use sos_protocol::{AssignmentsCreated, NewRequests, SystemNotifications, VolunteerStatusUpdates};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{chat_ws, map, notifications_ws, requests, volunteers};
use crate::auth::{LoginSessions, auth_middleware};
use crate::chat::ChatSessionManager;
use crate::config::{GatewaySettings, Settings};
use crate::event_bus::{BusClient, MemoryTransport, Transport};
use crate::gateway::{ChatRooms, NotificationHub};
use crate::matching::Dispatcher;
use crate::store::{
    DocumentStore, GeoLookup, MemoryDocumentStore, MemorySessionStore, Records, SessionStore,
    StoreGeoLookup, seed,
};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// State wrappers
// ============================================================================

/// Chat room registry wrapper for state extraction
#[derive(Clone, Default)]
pub struct Rooms(pub Arc<ChatRooms>);

impl Deref for Rooms {
    type Target = ChatRooms;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Notification hub wrapper for state extraction
#[derive(Clone, Default)]
pub struct Hub(pub Arc<NotificationHub>);

impl Deref for Hub {
    type Target = NotificationHub;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Application state
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub records: Records,
    pub bus: BusClient,
    pub dispatcher: Dispatcher,
    pub chat: ChatSessionManager,
    pub logins: LoginSessions,
    pub rooms: Rooms,
    pub hub: Hub,
}

impl FromRef<AppState> for Records {
    fn from_ref(state: &AppState) -> Self {
        state.records.clone()
    }
}

impl FromRef<AppState> for BusClient {
    fn from_ref(state: &AppState) -> Self {
        state.bus.clone()
    }
}

impl FromRef<AppState> for Dispatcher {
    fn from_ref(state: &AppState) -> Self {
        state.dispatcher.clone()
    }
}

impl FromRef<AppState> for ChatSessionManager {
    fn from_ref(state: &AppState) -> Self {
        state.chat.clone()
    }
}

impl FromRef<AppState> for LoginSessions {
    fn from_ref(state: &AppState) -> Self {
        state.logins.clone()
    }
}

impl FromRef<AppState> for Rooms {
    fn from_ref(state: &AppState) -> Self {
        state.rooms.clone()
    }
}

impl FromRef<AppState> for Hub {
    fn from_ref(state: &AppState) -> Self {
        state.hub.clone()
    }
}

impl FromRef<AppState> for GatewaySettings {
    fn from_ref(state: &AppState) -> Self {
        state.settings.gateway.clone()
    }
}

// ============================================================================
// Backends
// ============================================================================

/// External collaborators the service runs on.
pub struct Backends {
    pub documents: Arc<dyn DocumentStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub transport: Arc<dyn Transport>,
    /// Defaults to a scan over `documents`.
    pub geo: Option<Arc<dyn GeoLookup>>,
    sweepable: Option<Arc<MemorySessionStore>>,
}

impl Backends {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        sessions: Arc<dyn SessionStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            documents,
            sessions,
            transport,
            geo: None,
            sweepable: None,
        }
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Everything in process memory.
    pub fn in_memory(settings: &Settings) -> Self {
        let sessions = Arc::new(MemorySessionStore::new());
        Self {
            documents: Arc::new(MemoryDocumentStore::new()),
            sessions: sessions.clone(),
            transport: Arc::new(MemoryTransport::new(settings.bus.channel_capacity)),
            geo: None,
            sweepable: Some(sessions),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct Service {
    state: AppState,
    shutdown: CancellationToken,
    sweeper: Option<JoinHandle<()>>,
}

impl Service {
    /// Wire every component, connect the bus and start the listeners for
    /// new requests, assignments and notifications.
    pub async fn start(settings: Settings, backends: Backends) -> anyhow::Result<Self> {
        let records = Records::new(backends.documents);
        if let Some(path) = &settings.seed_file {
            seed::load_volunteers(&records, path).await?;
        }

        let geo = backends
            .geo
            .unwrap_or_else(|| Arc::new(StoreGeoLookup::new(records.clone())));

        let bus = BusClient::new(backends.transport, settings.bus.clone());
        bus.connect()
            .await
            .context("failed to connect to message bus")?;

        let dispatcher = Dispatcher::new(records.clone(), geo, bus.clone(), settings.matching.clone());
        let chat = ChatSessionManager::new(backends.sessions.clone(), bus.clone(), settings.chat.clone());
        let logins = LoginSessions::new(backends.sessions, settings.auth.clone());
        let hub = Hub::default();

        bus.subscribe::<NewRequests, _>(Arc::new(dispatcher.clone()))
            .await
            .context("failed to subscribe matching engine")?;
        bus.subscribe::<VolunteerStatusUpdates, _>(Arc::new(dispatcher.clone()))
            .await
            .context("failed to subscribe volunteer status consumer")?;
        bus.subscribe::<AssignmentsCreated, _>(Arc::new(chat.clone()))
            .await
            .context("failed to subscribe chat session manager")?;
        bus.subscribe::<SystemNotifications, _>(Arc::clone(&hub.0))
            .await
            .context("failed to subscribe notification relay")?;

        let shutdown = CancellationToken::new();
        let sweeper = backends
            .sweepable
            .map(|sessions| spawn_session_sweeper(sessions, shutdown.clone()));

        info!("dispatch service started");

        Ok(Self {
            state: AppState {
                settings,
                records,
                bus,
                dispatcher,
                chat,
                logins,
                rooms: Rooms::default(),
                hub,
            },
            shutdown,
            sweeper,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Stop background work and disconnect the bus.
    pub async fn shutdown(self) {
        info!("shutting down dispatch service");
        self.shutdown.cancel();
        if let Some(sweeper) = self.sweeper {
            let _ = sweeper.await;
        }
        self.state.bus.disconnect().await;
    }
}

fn spawn_session_sweeper(
    sessions: Arc<MemorySessionStore>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = sessions.purge_expired();
                    if purged > 0 {
                        debug!(purged, "expired session entries purged");
                    }
                }
            }
        }
    })
}

// ============================================================================
// Routes
// ============================================================================

async fn health_check() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

pub fn router(state: AppState) -> Router {
    let volunteer_routes = Router::new()
        .route(
            "/api/v1/requests/:request_id/accept",
            post(requests::accept_request),
        )
        .route_layer(middleware::from_fn_with_state(
            state.logins.clone(),
            auth_middleware,
        ));

    Router::new()
        // Health check
        .route("/api", get(health_check))
        // Intake and volunteer routes
        .route("/api/v1/request/direct", post(requests::submit_direct_request))
        .route("/api/v1/volunteer/verify", post(volunteers::verify_volunteer))
        .route("/api/v1/map/hotspots", get(map::get_hotspots))
        .merge(volunteer_routes)
        // Realtime gateway
        .route("/ws/chat/:room_id/:token", get(chat_ws::ws_chat))
        .route("/ws/notifications", get(notifications_ws::ws_notifications))
        .with_state(state)
}
