//! Host Service — boot sequence, component wiring, graceful stop
//!
//! Every component is constructed as an owned value at boot, wired
//! together through channels, then driven by a `start`/`stop` pair the
//! binary calls from its signal handler. No process-wide globals.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::abuse::{AbuseFilter, AbuseFilterConfigThresholds, Signal as AbuseSignal};
use crate::b2bua::B2buaCore;
use crate::call_manager::CallManager;
use crate::clock::{SharedClock, SystemClock};
use crate::config::ServerConfig;
use crate::dialplan::DialplanEvaluator;
use crate::dispatcher::{self, RetransmitDetector, Route};
use crate::events::ServerEvent;
use crate::registrar::RegistrarCore;
use crate::registry::DomainRegistry;
use crate::sip::{SipMethod, SipResponse};
use crate::store::memory::MemoryStore;
use crate::store::Store;
use crate::subscriber::{self, NotifyJob, SubscriberCore};
use crate::transport::{TransportAdapter, TransportEvent};
use crate::webrtc_relay::{self, WebrtcRelay};

/// Everything the host service owns, constructed once at boot and
/// torn down together on `stop()`.
pub struct HostService {
    config: ServerConfig,
    store: Arc<dyn Store>,
    registry: Arc<DomainRegistry>,
    abuse_filter: Arc<AbuseFilter>,
    registrar: Arc<RegistrarCore>,
    b2bua: Arc<B2buaCore>,
    subscriber: Arc<SubscriberCore>,
    dialplan: Arc<DialplanEvaluator>,
    call_manager: Arc<CallManager>,
    transport: Arc<TransportAdapter>,
    tasks: Vec<JoinHandle<()>>,
    http_handle: Option<JoinHandle<()>>,
}

impl HostService {
    /// Loads the dialplan, binds the transport, and constructs every
    /// core. Fails fast if the domain registry
    /// would load zero domains.
    pub async fn boot(config: ServerConfig) -> crate::Result<Self> {
        config.validate()?;

        let memory_store = Arc::new(MemoryStore::new());
        memory_store.seed_domain(crate::store::Domain {
            id: uuid::Uuid::new_v4(),
            name: config.general.sip_domain.clone(),
            aliases: Vec::new(),
        });
        let store: Arc<dyn Store> = memory_store;

        let registry = Arc::new(DomainRegistry::load(store.as_ref()).await?);
        let clock: SharedClock = Arc::new(SystemClock);

        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let abuse_filter = Arc::new(AbuseFilter::new(
            AbuseFilterConfigThresholds {
                reg_failure_threshold: config.abuse_filter.reg_failure_threshold,
                retransmit_threshold: config.abuse_filter.retransmit_threshold,
                accept_failure_threshold: config.abuse_filter.accept_failure_threshold,
            },
            &config.transport.private_subnets,
            clock.clone(),
        ));

        let registrar = Arc::new(RegistrarCore::spawn(
            config.registrar.clone(),
            registry.clone(),
            store.clone(),
            clock.clone(),
            events_tx.clone(),
        ));

        let dialplan = Arc::new(
            DialplanEvaluator::load(
                store.clone(),
                "default",
                config.dialplan.max_operations,
                config.dialplan.max_call_levels,
            )
            .await?,
        );
        let call_manager = Arc::new(CallManager::new(store.clone()));
        let b2bua = Arc::new(B2buaCore::spawn(
            config.b2bua.clone(),
            registry.clone(),
            store.clone(),
            dialplan.clone(),
            call_manager.clone(),
            events_tx.clone(),
        ));

        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<NotifyJob>();
        let subscriber = Arc::new(SubscriberCore::spawn(
            config.subscriber.clone(),
            registry.clone(),
            store.clone(),
            notify_tx,
        ));

        let (transport, transport_rx) = TransportAdapter::bind(config.transport.clone()).await?;
        let transport = Arc::new(transport);
        transport.spawn_receivers();

        let mut tasks = Vec::new();
        tasks.push(spawn_abuse_event_listener(abuse_filter.clone(), events_rx));
        tasks.push(spawn_notify_sender(transport.clone(), notify_rx));
        tasks.push(spawn_dispatch_loop(
            transport.clone(),
            abuse_filter.clone(),
            registrar.clone(),
            b2bua.clone(),
            subscriber.clone(),
            call_manager.clone(),
            events_tx.clone(),
            Arc::new(RetransmitDetector::new(clock.clone())),
            transport_rx,
        ));

        info!("host service booted");

        Ok(Self {
            config,
            store,
            registry,
            abuse_filter,
            registrar,
            b2bua,
            subscriber,
            dialplan,
            call_manager,
            transport,
            tasks,
            http_handle: None,
        })
    }

    /// Starts the WebRTC relay's HTTP surface. Separate from `boot()`
    /// so tests can construct a `HostService` without binding a second
    /// port.
    pub async fn start_http_relay(&mut self) -> crate::Result<()> {
        let relay = Arc::new(WebrtcRelay::new(self.store.clone()));
        let app = webrtc_relay::router(relay);
        let listen_addr = self.config.webrtc_relay.listen_addr.clone();
        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| crate::Error::network(format!("webrtc relay bind failed: {e}")))?;

        info!(addr = %listen_addr, "webrtc signal relay listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "webrtc relay server exited");
            }
        });
        self.http_handle = Some(handle);
        Ok(())
    }

    pub fn dialplan(&self) -> &Arc<DialplanEvaluator> {
        &self.dialplan
    }

    pub fn call_manager(&self) -> &Arc<CallManager> {
        &self.call_manager
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn abuse_filter(&self) -> &Arc<AbuseFilter> {
        &self.abuse_filter
    }

    pub async fn stop(&mut self) {
        info!("stopping host service");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(handle) = self.http_handle.take() {
            handle.abort();
        }
    }
}

fn spawn_abuse_event_listener(
    abuse_filter: Arc<AbuseFilter>,
    mut events_rx: mpsc::UnboundedReceiver<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ServerEvent::RegisterFailure {
                    remote,
                    request_uri_is_ip_literal,
                    ..
                } => {
                    abuse_filter.record(
                        remote.ip(),
                        AbuseSignal::RegisterFailure,
                        request_uri_is_ip_literal,
                    );
                }
                ServerEvent::AcceptCallFailure {
                    remote,
                    request_uri_is_ip_literal,
                    ..
                } => {
                    abuse_filter.record(
                        remote.ip(),
                        AbuseSignal::AcceptFailure,
                        request_uri_is_ip_literal,
                    );
                }
                ServerEvent::Retransmit {
                    remote,
                    request_uri_is_ip_literal,
                } => {
                    abuse_filter.record(
                        remote.ip(),
                        AbuseSignal::Retransmit,
                        request_uri_is_ip_literal,
                    );
                }
            }
        }
    })
}

fn spawn_notify_sender(
    transport: Arc<TransportAdapter>,
    mut notify_rx: mpsc::UnboundedReceiver<NotifyJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = notify_rx.recv().await {
            let response = SipResponse::new(200, "OK")
                .with_body(subscriber::render_mwi_notify_body());
            if let Err(e) = transport
                .send_response(response, SipMethod::Notify, job.target)
                .await
            {
                warn!(error = %e, target = %job.target, "failed to send MWI NOTIFY");
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_dispatch_loop(
    transport: Arc<TransportAdapter>,
    abuse_filter: Arc<AbuseFilter>,
    registrar: Arc<RegistrarCore>,
    b2bua: Arc<B2buaCore>,
    subscriber: Arc<SubscriberCore>,
    call_manager: Arc<CallManager>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    retransmit_detector: Arc<RetransmitDetector>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = transport_rx.recv().await {
            let request = match event {
                TransportEvent::Request(request) => request,
                TransportEvent::ParseFailure { .. } => continue,
            };

            if let Some(reason) = abuse_filter.is_banned(request.remote_addr.ip()) {
                warn!(source = %request.remote_addr, reason = ?reason, "dropping request from banned source");
                continue;
            }

            if retransmit_detector.observe(&request) {
                let _ = events_tx.send(ServerEvent::Retransmit {
                    remote: request.remote_addr,
                    request_uri_is_ip_literal: request.request_uri.is_ip_literal(),
                });
            }

            let peer = request.remote_addr;
            let method = request.method;

            let response = match dispatcher::classify(&request) {
                Route::InDialog => call_manager
                    .process_in_dialog(&request)
                    .await
                    .unwrap_or_else(|_| SipResponse::new(500, "Server Internal Error")),
                Route::Register => registrar.submit(request).await,
                Route::Invite => {
                    let trying = SipResponse::new(100, "Trying");
                    let _ = transport.send_response(trying, method, peer).await;
                    b2bua.submit(request).await
                }
                Route::Subscribe => subscriber.submit(request).await,
                Route::Options => SipResponse::new(200, "OK"),
                Route::Unsolicited => continue,
                Route::MethodNotAllowed => SipResponse::new(405, "Method Not Allowed"),
            };

            if let Err(e) = transport.send_response(response, method, peer).await {
                error!(error = %e, peer = %peer, "failed to send response");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default_config();
        config.transport.sip_listen_port = 0;
        config.webrtc_relay.listen_addr = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn boots_and_stops_cleanly() {
        let mut host = HostService::boot(test_config()).await.unwrap();
        assert!(host.registry().canonicalise("example.com").is_some());
        host.stop().await;
    }
}
