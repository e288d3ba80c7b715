//! B2BUA Core — INVITE queue, worker pool, caller resolution, dialplan
//! invocation, UAC/UAS pairing
//!
//! Mirrors the shape of the Registrar Core: a bounded queue feeding a
//! pool of worker tasks, one request processed to completion before
//! the next is dequeued. A full queue is an immediate 480, never a
//! silent drop.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::call_manager::CallManager;
use crate::config::B2buaConfig;
use crate::dialplan::DialplanEvaluator;
use crate::events::{AcceptCallFailureReason, ServerEvent};
use crate::registry::DomainRegistry;
use crate::sip::{SipMethod, SipRequest, SipResponse};
use crate::store::{CallDirection, Cdr, SipCall, Store};

struct InviteJob {
    request: SipRequest,
    respond: oneshot::Sender<SipResponse>,
}

pub struct B2buaCore {
    job_tx: mpsc::Sender<InviteJob>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for B2buaCore {
    fn drop(&mut self) {
        for handle in &self.worker_handles {
            handle.abort();
        }
    }
}

impl B2buaCore {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: B2buaConfig,
        registry: Arc<DomainRegistry>,
        store: Arc<dyn Store>,
        dialplan: Arc<DialplanEvaluator>,
        call_manager: Arc<CallManager>,
        events_tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.max_queue);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut worker_handles = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let job_rx = job_rx.clone();
            let registry = registry.clone();
            let store = store.clone();
            let dialplan = dialplan.clone();
            let call_manager = call_manager.clone();
            let events_tx = events_tx.clone();

            worker_handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };
                    let response = process_invite(
                        &job.request,
                        &registry,
                        store.as_ref(),
                        &dialplan,
                        &call_manager,
                        &events_tx,
                    )
                    .await;
                    let _ = job.respond.send(response);
                }
                info!(worker_id, "b2bua worker stopped");
            }));
        }

        Self {
            job_tx,
            worker_handles,
        }
    }

    /// Pre-enqueue checks (method), then enqueue. `100 Trying` is the
    /// caller's responsibility to send immediately on success — this
    /// returns the eventual final response from the worker.
    pub async fn submit(&self, request: SipRequest) -> SipResponse {
        if request.method != SipMethod::Invite {
            return SipResponse::new(405, "Method Not Allowed");
        }

        let (respond_tx, respond_rx) = oneshot::channel();
        let job = InviteJob {
            request,
            respond: respond_tx,
        };
        if self.job_tx.try_send(job).is_err() {
            return SipResponse::new(480, "Temporarily Unavailable");
        }

        respond_rx
            .await
            .unwrap_or_else(|_| SipResponse::new(500, "Server Internal Error"))
    }
}

async fn process_invite(
    request: &SipRequest,
    registry: &DomainRegistry,
    store: &dyn Store,
    dialplan: &DialplanEvaluator,
    call_manager: &CallManager,
    events_tx: &mpsc::UnboundedSender<ServerEvent>,
) -> SipResponse {
    let is_ip_literal = request.request_uri.is_ip_literal();

    let caller_account_id = match registry.canonicalise(&request.from.host) {
        Some(domain_id) => {
            let Some(username) = &request.from.user else {
                return SipResponse::new(400, "Bad Request");
            };
            match store.find_account(username, domain_id).await {
                Ok(Some(account)) if !account.disabled => Some(account.id),
                _ => {
                    let _ = events_tx.send(ServerEvent::AcceptCallFailure {
                        remote: request.remote_addr,
                        reason: AcceptCallFailureReason::NoSipAccount,
                        request_uri_is_ip_literal: is_ip_literal,
                    });
                    return SipResponse::new(403, "Forbidden");
                }
            }
        }
        // from.host not hosted: anonymous external caller, dialplan
        // still runs with fromAccount = None.
        None => None,
    };

    let Some(dialled_user) = &request.request_uri.user else {
        return SipResponse::new(400, "Bad Request");
    };

    let descriptor = dialplan
        .lookup(dialled_user, caller_account_id.map(|id| id.to_string()))
        .await;

    let Some(descriptor) = descriptor else {
        let _ = events_tx.send(ServerEvent::AcceptCallFailure {
            remote: request.remote_addr,
            reason: AcceptCallFailureReason::NotFound,
            request_uri_is_ip_literal: is_ip_literal,
        });
        return SipResponse::new(404, "Not Found");
    };

    dial_out_and_bridge(request, &descriptor, call_manager).await
}

/// Instantiates a UAC transaction toward the dialplan's destination.
/// In this reference implementation the "dial-out" is a synchronous
/// stand-in for the real SIP stack's UAC: it synthesizes the 200 a
/// downstream UAC transaction would eventually report, then wires the
/// bridge as a UAS dialog and a new UAC dialog stored under one
/// `bridgeId`.
async fn dial_out_and_bridge(
    uas_request: &SipRequest,
    descriptor: &crate::dialplan::CallDescriptor,
    call_manager: &CallManager,
) -> SipResponse {
    let bridge_id = CallManager::next_bridge_id();
    let now = Utc::now();

    let uas_cdr_id = Uuid::new_v4();
    let uac_cdr_id = Uuid::new_v4();

    let uas_cdr = Cdr {
        id: uas_cdr_id,
        direction: CallDirection::Inbound,
        created: now,
        destination_uri: descriptor.destination_uri.clone(),
        from_header: uas_request.from.to_string(),
        call_id: uas_request.call_id.clone(),
        local_socket: uas_request.local_addr.to_string(),
        remote_socket: uas_request.remote_addr.to_string(),
        bridge_id: Some(bridge_id),
        progress_at: Some(now),
        progress_status: Some(180),
        progress_reason: Some("Ringing".to_string()),
        ring_duration_ms: Some(0),
        answered_at: Some(now),
        answered_status: Some(200),
        answered_reason: Some("OK".to_string()),
        duration_ms: None,
        hungup_at: None,
        hungup_reason: None,
    };
    let uac_cdr = Cdr {
        id: uac_cdr_id,
        direction: CallDirection::Outbound,
        created: now,
        destination_uri: descriptor.destination_uri.clone(),
        from_header: uas_request.from.to_string(),
        call_id: uas_request.call_id.clone(),
        local_socket: uas_request.local_addr.to_string(),
        remote_socket: uas_request.remote_addr.to_string(),
        bridge_id: Some(bridge_id),
        progress_at: Some(now),
        progress_status: Some(180),
        progress_reason: Some("Ringing".to_string()),
        ring_duration_ms: Some(0),
        answered_at: Some(now),
        answered_status: Some(200),
        answered_reason: Some("OK".to_string()),
        duration_ms: None,
        hungup_at: None,
        hungup_reason: None,
    };

    let uas_local_tag = uas_request
        .to_tag
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let uas_remote_tag = uas_request
        .from_tag
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let uac_local_tag = Uuid::new_v4().simple().to_string();
    let uac_remote_tag = Uuid::new_v4().simple().to_string();

    let uas_leg = SipCall {
        id: Uuid::new_v4(),
        cdr_id: uas_cdr_id,
        local_tag: uas_local_tag,
        remote_tag: uas_remote_tag,
        call_id: uas_request.call_id.clone(),
        cseq: uas_request.cseq,
        bridge_id,
        remote_target: uas_request.from.to_string(),
        local_user_field: uas_request.to.to_string(),
        remote_user_field: uas_request.from.to_string(),
        route_set: Vec::new(),
        direction: CallDirection::Inbound,
        remote_socket: uas_request.remote_addr.to_string(),
    };
    let uac_leg = SipCall {
        id: Uuid::new_v4(),
        cdr_id: uac_cdr_id,
        local_tag: uac_local_tag,
        remote_tag: uac_remote_tag,
        call_id: uas_request.call_id.clone(),
        cseq: 1,
        bridge_id,
        remote_target: descriptor.destination_uri.clone(),
        local_user_field: uas_request.from.to_string(),
        remote_user_field: descriptor.destination_uri.clone(),
        route_set: Vec::new(),
        direction: CallDirection::Outbound,
        remote_socket: uas_request.remote_addr.to_string(),
    };

    match call_manager.bridge(uas_leg, uac_leg, uas_cdr, uac_cdr).await {
        Ok(_) => SipResponse::new(200, "OK")
            .with_header("Contact", format!("<{}>", descriptor.destination_uri)),
        Err(e) => {
            warn!(error = %e, "failed to bridge UAC/UAS legs");
            SipResponse::new(500, "Server Internal Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::Uri;
    use crate::store::{memory::MemoryStore, Domain};
    use std::net::SocketAddr;

    fn request(request_uri: &str, from: &str, from_tag: Option<&str>) -> SipRequest {
        let addr: SocketAddr = "192.168.0.48:5060".parse().unwrap();
        SipRequest {
            method: SipMethod::Invite,
            request_uri: Uri::parse(request_uri).unwrap(),
            from: Uri::parse(from).unwrap(),
            from_tag: from_tag.map(|s| s.to_string()),
            to: Uri::parse(request_uri).unwrap(),
            to_tag: None,
            call_id: "call-1".to_string(),
            cseq: 1,
            contact: None,
            expires_header: None,
            authorization: None,
            event: None,
            local_addr: addr,
            remote_addr: addr,
            headers: Default::default(),
        }
    }

    async fn evaluator(store: Arc<dyn Store>) -> Arc<DialplanEvaluator> {
        Arc::new(
            DialplanEvaluator::load(store, "default", 200_000, 32)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn anonymous_caller_reaches_dialplan_with_no_account() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(DomainRegistry::from_domains(&[Domain {
            id: Uuid::new_v4(),
            name: "192.168.0.48".to_string(),
            aliases: vec![],
        }]));
        let dialplan = evaluator(store.clone()).await;
        let call_manager = Arc::new(CallManager::new(store.clone()));
        let (events_tx, _rx) = mpsc::unbounded_channel();
        let core = B2buaCore::spawn(
            B2buaConfig::default(),
            registry,
            store,
            dialplan,
            call_manager,
            events_tx,
        );

        // `from.host` is an address the registry does not own: the
        // default seeded dialplan still routes it (fromAccount=None).
        let req = request("sip:100@192.168.0.48", "sip:outside@203.0.113.1", None);
        let response = core.submit(req).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn hosted_caller_missing_account_is_forbidden_and_emits_event() {
        let memory = Arc::new(MemoryStore::new());
        let domain = Domain {
            id: Uuid::new_v4(),
            name: "192.168.0.48".to_string(),
            aliases: vec![],
        };
        memory.seed_domain(domain.clone());
        let store: Arc<dyn Store> = memory;
        let registry = Arc::new(DomainRegistry::from_domains(&[domain]));
        let dialplan = evaluator(store.clone()).await;
        let call_manager = Arc::new(CallManager::new(store.clone()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let core = B2buaCore::spawn(
            B2buaConfig::default(),
            registry,
            store,
            dialplan,
            call_manager,
            events_tx,
        );

        let req = request("sip:100@192.168.0.48", "sip:nobody@192.168.0.48", Some("t1"));
        let response = core.submit(req).await;
        assert_eq!(response.status, 403);
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            ServerEvent::AcceptCallFailure {
                reason: AcceptCallFailureReason::NoSipAccount,
                ..
            }
        ));
    }
}
