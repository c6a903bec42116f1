use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, RealtimeConfig, RelayConfig, TransportMode};
use crate::error::{error_response, AppError};
use crate::gateway::{gateway_router, Gateway, GatewayStatistics};
use crate::relay::{
    relay_router, HttpRelayTransport, LocalRelayTransport, RelayRegistry, RelayScheduler,
    RelayStatistics, RelayTransport,
};
use crate::submission::{submission_router, SubmissionFacade};
use crate::tracking::{tracking_router, LedgerError, LedgerStatistics, TrackingLedger};

/// Composed view over the ledger, the scheduler and the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatistics {
    pub tracking: LedgerStatistics,
    pub relays: RelayStatistics,
    pub realtime: GatewayStatistics,
    pub timestamp: DateTime<Utc>,
}

/// Owns one independent instance of every component.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<TrackingLedger>,
    pub scheduler: Arc<RelayScheduler>,
    pub gateway: Gateway,
    pub submissions: Arc<SubmissionFacade>,
    relay: RelayConfig,
    realtime: RealtimeConfig,
}

impl AppContext {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let transport: Arc<dyn RelayTransport> = match &config.relay.transport {
            TransportMode::Local => Arc::new(LocalRelayTransport),
            TransportMode::Http { base_url, api_key } => Arc::new(HttpRelayTransport::new(
                base_url.clone(),
                api_key.clone(),
                config.relay.request_timeout,
            )?),
        };
        Ok(Self::assemble(
            config.relay.clone(),
            config.realtime.clone(),
            Arc::new(SystemClock),
            transport,
        ))
    }

    pub fn assemble(
        relay: RelayConfig,
        realtime: RealtimeConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        let ledger = Arc::new(TrackingLedger::in_memory(clock.clone()));
        let scheduler = Arc::new(
            RelayScheduler::new(
                RelayRegistry::default_network(clock.now()),
                ledger.clone(),
                transport,
                clock.clone(),
            )
            .with_heartbeat_window(relay.heartbeat_window)
            .with_transport_timeout(relay.request_timeout),
        );
        let gateway = Gateway::new(ledger.clone(), clock.clone());
        let submissions = Arc::new(SubmissionFacade::new(ledger.clone(), scheduler.clone()));
        Self {
            clock,
            ledger,
            scheduler,
            gateway,
            submissions,
            relay,
            realtime,
        }
    }

    pub fn statistics(&self) -> Result<SystemStatistics, LedgerError> {
        Ok(SystemStatistics {
            tracking: self.ledger.get_statistics()?,
            relays: self.scheduler.statistics(),
            realtime: self.gateway.statistics(),
            timestamp: self.clock.now(),
        })
    }

    /// Every API route plus the realtime channel.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/statistics", get(statistics_handler))
            .with_state(self.clone())
            .merge(tracking_router(self.ledger.clone()))
            .merge(relay_router(self.scheduler.clone()))
            .merge(submission_router(self.submissions.clone()))
            .merge(gateway_router(self.gateway.clone()))
    }

    /// Starts queue advancement, relay health, connection heartbeat and the
    /// ledger event pump.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let queue = {
            let scheduler = self.scheduler.clone();
            every(self.relay.queue_tick, move || {
                let report = scheduler.advance_queues();
                if report.completed > 0 {
                    debug!(advanced = report.advanced, completed = report.completed, "queue tick");
                }
                async {}
            })
        };
        let health = {
            let scheduler = self.scheduler.clone();
            every(self.relay.health_interval, move || {
                let scheduler = scheduler.clone();
                async move {
                    let report = scheduler.health_sweep().await;
                    debug!(online = report.online.len(), offline = report.offline.len(), "relay health sweep");
                }
            })
        };
        let heartbeat = {
            let gateway = self.gateway.clone();
            every(self.realtime.heartbeat_interval, move || {
                let report = gateway.heartbeat_sweep();
                if !report.terminated.is_empty() {
                    debug!(terminated = report.terminated.len(), "realtime heartbeat sweep");
                }
                async {}
            })
        };
        let pump = self.gateway.spawn_event_pump(self.ledger.events().feed());
        let mut handles = vec![queue, health, heartbeat, pump];
        handles.extend(self.ledger.spawn_notification_worker());

        info!(
            queue_tick = ?self.relay.queue_tick,
            health_interval = ?self.relay.health_interval,
            heartbeat_interval = ?self.realtime.heartbeat_interval,
            "background activities started"
        );
        BackgroundTasks { handles }
    }

    /// Stops background work and closes every realtime connection.
    pub fn shutdown(&self, tasks: BackgroundTasks) {
        tasks.abort();
        self.gateway.shutdown();
    }
}

fn every<F, Fut>(period: Duration, mut action: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            action().await;
        }
    })
}

/// Handles of the periodic tasks.
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn statistics_handler(State(context): State<AppContext>) -> axum::response::Response {
    match context.statistics() {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => error_response(err.kind(), err.to_string()),
    }
}
