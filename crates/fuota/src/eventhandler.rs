//! Uplink event intake.
//!
//! The network server posts integration events to a single HTTP endpoint.
//! Only `?event=up` is processed; the body is a protobuf or JSON encoded
//! `UplinkEvent` depending on the configured marshaler. Clock-sync uplinks
//! (FPort 202) are always handled, even when no deployment exists for the
//! device; everything else fans out to the registered deployment handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use chirpstack_api::integration;
use prost::Message;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

use applayer::clocksync;
use ns_client::NetworkServerClient;

use crate::config::Marshaler;
use crate::error::Result;

/// Receives uplink events routed to a deployment.
#[async_trait]
pub trait UplinkHandler: Send + Sync {
    async fn handle_uplink(&self, event: integration::UplinkEvent) -> Result<()>;
}

/// Routes uplink events to the clock-sync handler and to the registered
/// per-deployment handlers.
pub struct EventRouter {
    marshaler: Marshaler,
    client: Arc<dyn NetworkServerClient>,
    handlers: RwLock<HashMap<Uuid, Arc<dyn UplinkHandler>>>,
}

impl EventRouter {
    pub fn new(marshaler: Marshaler, client: Arc<dyn NetworkServerClient>) -> Arc<Self> {
        Arc::new(Self {
            marshaler,
            client,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Registers a handler for uplinks; multiple deployments can be
    /// registered simultaneously.
    pub fn register(&self, id: Uuid, handler: Arc<dyn UplinkHandler>) {
        self.handlers.write().unwrap().insert(id, handler);
    }

    pub fn unregister(&self, id: Uuid) {
        self.handlers.write().unwrap().remove(&id);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    fn unmarshal(&self, body: &[u8]) -> std::result::Result<integration::UplinkEvent, String> {
        match self.marshaler {
            Marshaler::Protobuf => {
                integration::UplinkEvent::decode(body).map_err(|e| e.to_string())
            }
            Marshaler::Json => serde_json::from_slice(body).map_err(|e| e.to_string()),
        }
    }

    /// Dispatches one decoded uplink event. Every handler runs in its own
    /// task; failures are logged and do not abort the other handlers.
    pub fn dispatch(&self, event: integration::UplinkEvent) {
        let f_port = event.f_port as u8;

        if f_port == clocksync::DEFAULT_FPORT {
            // Clock-sync is device-initiated and may arrive before any
            // deployment exists for this device.
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::clocksync::handle_clock_sync(client.as_ref(), &event).await
                {
                    error!(error = %e, "eventhandler: clock-sync handler error");
                }
            });
            return;
        }

        let handlers: Vec<(Uuid, Arc<dyn UplinkHandler>)> = self
            .handlers
            .read()
            .unwrap()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        for (id, handler) in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle_uplink(event).await {
                    error!(deployment_id = %id, error = %e, "eventhandler: uplink handler error");
                }
            });
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", post(handle_event))
            .with_state(self)
    }

    /// Serves the HTTP event endpoint until the listener fails.
    pub async fn serve(self: Arc<Self>, bind: SocketAddr) -> std::io::Result<()> {
        info!(%bind, "eventhandler: starting event-handler server");
        let listener = TcpListener::bind(bind).await?;
        axum::serve(listener, self.router()).await
    }
}

#[derive(Deserialize)]
struct EventQuery {
    #[serde(default)]
    event: String,
}

async fn handle_event(
    State(router): State<Arc<EventRouter>>,
    Query(query): Query<EventQuery>,
    body: Bytes,
) -> StatusCode {
    // Non-uplink events are acknowledged and dropped.
    if query.event != "up" {
        return StatusCode::OK;
    }

    match router.unmarshal(&body) {
        Ok(event) => {
            debug!(
                dev_eui = event
                    .device_info
                    .as_ref()
                    .map(|d| d.dev_eui.as_str())
                    .unwrap_or(""),
                f_port = event.f_port,
                f_cnt = event.f_cnt,
                "eventhandler: uplink event received"
            );
            router.dispatch(event);
        }
        Err(e) => {
            error!(error = %e, "eventhandler: unmarshal UplinkEvent error");
        }
    }

    StatusCode::OK
}
