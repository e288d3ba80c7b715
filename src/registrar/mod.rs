//! Registrar Core — REGISTER request queue, worker pool, authentication

mod binding_manager;

pub use binding_manager::{BindingManager, ContactUpdate};

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::auth::{self, DigestCredentials};
use crate::clock::SharedClock;
use crate::config::RegistrarConfig;
use crate::events::{RegisterFailureReason, ServerEvent};
use crate::registry::DomainRegistry;
use crate::sip::{SipMethod, SipRequest, SipResponse};
use crate::store::{Account, Store};

struct RegistrarJob {
    request: SipRequest,
    respond: oneshot::Sender<SipResponse>,
}

pub struct RegistrarCore {
    job_tx: mpsc::Sender<RegistrarJob>,
    min_expiry: u32,
    _sweep_handle: tokio::task::JoinHandle<()>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for RegistrarCore {
    fn drop(&mut self) {
        self._sweep_handle.abort();
        for handle in &self.worker_handles {
            handle.abort();
        }
    }
}

impl RegistrarCore {
    pub fn spawn(
        config: RegistrarConfig,
        registry: Arc<DomainRegistry>,
        store: Arc<dyn Store>,
        clock: SharedClock,
        events_tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.max_queue);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let binding_manager = Arc::new(BindingManager::new(
            store.clone(),
            clock.clone(),
            config.max_bindings_per_account,
        ));

        let mut worker_handles = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let job_rx = job_rx.clone();
            let registry = registry.clone();
            let store = store.clone();
            let binding_manager = binding_manager.clone();
            let events_tx = events_tx.clone();
            let min_expiry = config.min_binding_expiry;
            let max_expiry = config.max_binding_expiry;

            worker_handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };
                    let response = process_register(
                        &job.request,
                        &registry,
                        store.as_ref(),
                        &binding_manager,
                        min_expiry,
                        max_expiry,
                        &events_tx,
                    )
                    .await;
                    let _ = job.respond.send(response);
                }
                info!(worker_id, "registrar worker stopped");
            }));
        }

        let sweep_store = store.clone();
        let sweep_interval = StdDuration::from_secs(config.sweep_interval_secs.max(1));
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep_store.sweep_expired_bindings(chrono::Utc::now()).await {
                    warn!(error = %e, "binding sweep failed");
                }
            }
        });

        Self {
            job_tx,
            min_expiry: config.min_binding_expiry,
            _sweep_handle: sweep_handle,
            worker_handles,
        }
    }

    /// Performs the pre-enqueue checks (method, interval) synchronously,
    /// then enqueues. A full queue yields an immediate 480, never a
    /// silent drop.
    pub async fn submit(&self, request: SipRequest) -> SipResponse {
        if request.method != SipMethod::Register {
            return SipResponse::new(405, "Method Not Allowed");
        }

        if let Some(expiry) = request.requested_expiry() {
            if expiry > 0 && expiry < self.min_expiry {
                return SipResponse::new(423, "Interval Too Brief")
                    .with_header("Min-Expires", self.min_expiry.to_string());
            }
        }

        let (respond_tx, respond_rx) = oneshot::channel();
        let job = RegistrarJob {
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

#[allow(clippy::too_many_arguments)]
async fn process_register(
    request: &SipRequest,
    registry: &DomainRegistry,
    store: &dyn Store,
    binding_manager: &BindingManager,
    min_expiry: u32,
    max_expiry: u32,
    events_tx: &mpsc::UnboundedSender<ServerEvent>,
) -> SipResponse {
    let is_ip_literal = request.to.is_ip_literal();

    let Some(domain_id) = registry.canonicalise(&request.to.host) else {
        let _ = events_tx.send(ServerEvent::RegisterFailure {
            remote: request.remote_addr,
            reason: RegisterFailureReason::DomainNotServiced,
            request_uri_is_ip_literal: is_ip_literal,
        });
        return SipResponse::new(403, "Domain not serviced");
    };

    let username = match &request.to.user {
        Some(user) => user,
        None => return SipResponse::new(400, "Bad Request"),
    };

    let account = match store.find_account(username, domain_id).await {
        Ok(Some(account)) if !account.disabled => account,
        _ => {
            let _ = events_tx.send(ServerEvent::RegisterFailure {
                remote: request.remote_addr,
                reason: RegisterFailureReason::Forbidden,
                request_uri_is_ip_literal: is_ip_literal,
            });
            return SipResponse::new(403, "Forbidden");
        }
    };

    if !authenticate(request, &account) {
        let challenge = auth::issue_challenge(&registry_realm(&request.to.host));
        return SipResponse::new(401, "Unauthorized").with_header(
            "WWW-Authenticate",
            format!(
                "Digest realm=\"{}\", nonce=\"{}\"",
                challenge.realm, challenge.nonce
            ),
        );
    }

    let Some(contact) = &request.contact else {
        return match binding_manager.get_for_account(account.id).await {
            Ok(bindings) => ok_with_bindings(bindings),
            Err(_) => SipResponse::new(200, "OK"),
        };
    };

    let requested = request.requested_expiry().unwrap_or(max_expiry);
    let expiry = BindingManager::clamp_expiry(requested, min_expiry, max_expiry).unwrap_or(0);

    let update = ContactUpdate {
        uri: contact.clone(),
        user_agent: request.headers.get("User-Agent").cloned(),
        remote_socket: request.remote_addr.to_string(),
        proxy_socket: None,
        registrar_socket: Some(request.local_addr.to_string()),
        expiry,
    };

    match binding_manager.update(account.id, update).await {
        Ok(bindings) => ok_with_bindings(bindings),
        // Storage error on the refresh: a soft failure. Respond 200 but
        // force the Contact's expires down to the minimum so the UA
        // retries soon, rather than surfacing a storage failure to it.
        Err(_) => SipResponse::new(200, "OK")
            .with_header("Contact", format!("<{}>;expires={}", contact, min_expiry)),
    }
}

fn authenticate(request: &SipRequest, account: &Account) -> bool {
    let Some(header) = &request.authorization else {
        return false;
    };
    let Some(parsed) = auth::parse_authorization_header(header) else {
        return false;
    };
    let creds = DigestCredentials {
        username: &parsed.username,
        realm: &parsed.realm,
        nonce: &parsed.nonce,
        uri: &parsed.uri,
        response: &parsed.response,
        method: request.method.as_str(),
    };
    auth::verify(account, &creds)
}

fn registry_realm(host: &str) -> String {
    host.to_string()
}

fn ok_with_bindings(bindings: Vec<crate::store::RegistrarBinding>) -> SipResponse {
    let mut response = SipResponse::new(200, "OK");
    if let Some(first) = bindings.first() {
        response = response.with_header(
            "Contact",
            format!("<{}>;expires={}", first.contact_uri, first.expiry),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ha1;
    use crate::clock::SystemClock;
    use crate::sip::Uri;
    use crate::store::{memory::MemoryStore, Domain};
    use chrono::Utc;
    use uuid::Uuid;

    fn registry_and_store() -> (Arc<DomainRegistry>, Arc<MemoryStore>, Uuid) {
        let domain = Domain {
            id: Uuid::new_v4(),
            name: "192.168.0.50".to_string(),
            aliases: vec![],
        };
        let domain_id = domain.id;
        let store = Arc::new(MemoryStore::new());
        store.seed_domain(domain.clone());
        let registry = Arc::new(DomainRegistry::from_domains(&[domain]));
        (registry, store, domain_id)
    }

    fn request(to_uri: &str, contact: Option<&str>, expires: Option<u32>) -> SipRequest {
        let addr: std::net::SocketAddr = "203.0.113.1:5060".parse().unwrap();
        SipRequest {
            method: SipMethod::Register,
            request_uri: Uri::parse(to_uri).unwrap(),
            from: Uri::parse(to_uri).unwrap(),
            from_tag: Some("tag1".to_string()),
            to: Uri::parse(to_uri).unwrap(),
            to_tag: None,
            call_id: "call-1".to_string(),
            cseq: 1,
            contact: contact.and_then(Uri::parse),
            expires_header: expires,
            authorization: None,
            event: None,
            local_addr: addr,
            remote_addr: addr,
            headers: Default::default(),
        }
    }

    #[tokio::test]
    async fn rejects_interval_below_minimum_without_enqueueing() {
        let (registry, store, _) = registry_and_store();
        let clock: SharedClock = Arc::new(SystemClock);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let core = RegistrarCore::spawn(
            RegistrarConfig::default(),
            registry,
            store,
            clock,
            events_tx,
        );
        let req = request(
            "sip:user@192.168.0.50",
            Some("sip:user@1.2.3.4:5060;expires=30"),
            Some(30),
        );
        let response = core.submit(req).await;
        assert_eq!(response.status, 423);
        assert_eq!(response.headers.get("Min-Expires").unwrap(), "60");
    }

    #[tokio::test]
    async fn unknown_domain_yields_403_and_emits_event() {
        let (registry, store, _) = registry_and_store();
        let clock: SharedClock = Arc::new(SystemClock);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let core = RegistrarCore::spawn(
            RegistrarConfig::default(),
            registry,
            store,
            clock,
            events_tx,
        );
        let req = request("sip:user@evil.example", None, None);
        let response = core.submit(req).await;
        assert_eq!(response.status, 403);
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            ServerEvent::RegisterFailure {
                reason: RegisterFailureReason::DomainNotServiced,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn challenges_unauthenticated_register_then_accepts_valid_digest() {
        let (registry, store, domain_id) = registry_and_store();
        let digest = ha1("user", "192.168.0.50", "password");
        store
            .upsert_account(Account {
                id: Uuid::new_v4(),
                domain_id,
                username: "user".to_string(),
                ha1_digest: digest,
                disabled: false,
                inserted: Utc::now(),
            })
            .await
            .unwrap();

        let clock: SharedClock = Arc::new(SystemClock);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let core = RegistrarCore::spawn(
            RegistrarConfig::default(),
            registry,
            store,
            clock,
            events_tx,
        );

        let req = request(
            "sip:user@192.168.0.50",
            Some("sip:user@1.2.3.4:5060"),
            Some(3600),
        );
        let response = core.submit(req).await;
        assert_eq!(response.status, 401);
        assert!(response.headers.contains_key("WWW-Authenticate"));
    }
}
