//! Subscriber Core — SUBSCRIBE queue, worker pool, dummy MWI NOTIFY
//!
//! Same queue/worker shape as the Registrar Core. On a successful
//! `message-summary` subscription this fires a `Messages-Waiting: no`
//! NOTIFY after a short delay — to the request's *remote* endpoint,
//! not the Contact URI. That's deliberate: cloud-deployed instances
//! sit behind NAT, and the UA that just SUBSCRIBEd is reachable at the
//! socket it SUBSCRIBEd from, not necessarily at its advertised
//! Contact (may fail for proxied deployments, but is the right default
//! here).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::info;

use crate::auth::{self, DigestCredentials};
use crate::config::SubscriberConfig;
use crate::registry::DomainRegistry;
use crate::sip::{SipMethod, SipRequest, SipResponse};
use crate::store::Account;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct NotifyJob {
    pub target: SocketAddr,
    pub call_id: String,
}

struct SubscribeJob {
    request: SipRequest,
    respond: oneshot::Sender<SipResponse>,
}

pub struct SubscriberCore {
    job_tx: mpsc::Sender<SubscribeJob>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for SubscriberCore {
    fn drop(&mut self) {
        for handle in &self.worker_handles {
            handle.abort();
        }
    }
}

impl SubscriberCore {
    pub fn spawn(
        config: SubscriberConfig,
        registry: Arc<DomainRegistry>,
        store: Arc<dyn Store>,
        notify_tx: mpsc::UnboundedSender<NotifyJob>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.max_queue);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut worker_handles = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let job_rx = job_rx.clone();
            let registry = registry.clone();
            let store = store.clone();
            let notify_tx = notify_tx.clone();
            let notify_delay = StdDuration::from_millis(config.notify_delay_ms);

            worker_handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };
                    let response = process_subscribe(
                        &job.request,
                        &registry,
                        store.as_ref(),
                        &notify_tx,
                        notify_delay,
                    )
                    .await;
                    let _ = job.respond.send(response);
                }
                info!(worker_id, "subscriber worker stopped");
            }));
        }

        Self {
            job_tx,
            worker_handles,
        }
    }

    pub async fn submit(&self, request: SipRequest) -> SipResponse {
        if request.method != SipMethod::Subscribe {
            return SipResponse::new(405, "Method Not Allowed");
        }

        let (respond_tx, respond_rx) = oneshot::channel();
        let job = SubscribeJob {
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

async fn process_subscribe(
    request: &SipRequest,
    registry: &DomainRegistry,
    store: &dyn Store,
    notify_tx: &mpsc::UnboundedSender<NotifyJob>,
    notify_delay: StdDuration,
) -> SipResponse {
    let Some(domain_id) = registry.canonicalise(&request.to.host) else {
        return SipResponse::new(403, "Domain not serviced");
    };
    let Some(username) = &request.to.user else {
        return SipResponse::new(400, "Bad Request");
    };

    let account = match store.find_account(username, domain_id).await {
        Ok(Some(account)) if !account.disabled => account,
        _ => return SipResponse::new(403, "Forbidden"),
    };

    if !authenticate(request, &account) {
        let challenge = auth::issue_challenge(request.to.host.clone());
        return SipResponse::new(401, "Unauthorized").with_header(
            "WWW-Authenticate",
            format!(
                "Digest realm=\"{}\", nonce=\"{}\"",
                challenge.realm, challenge.nonce
            ),
        );
    }

    let is_message_summary = request
        .event
        .as_deref()
        .map(|e| e.eq_ignore_ascii_case("message-summary"))
        .unwrap_or(false);
    let expires = request.requested_expiry().unwrap_or(0);

    if is_message_summary && expires > 0 {
        let job = NotifyJob {
            target: request.remote_addr,
            call_id: request.call_id.clone(),
        };
        let notify_tx = notify_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(notify_delay).await;
            let _ = notify_tx.send(job);
        });
    }

    SipResponse::new(200, "OK")
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

/// Builds the dummy `Messages-Waiting: no` NOTIFY body. No real
/// presence/MWI data is generated — this is the one NOTIFY this crate
/// ever sends.
pub fn render_mwi_notify_body() -> String {
    "Messages-Waiting: no\r\n".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ha1;
    use crate::sip::Uri;
    use crate::store::memory::MemoryStore;
    use crate::store::Domain;
    use chrono::Utc;
    use uuid::Uuid;

    fn request(
        to_uri: &str,
        expires: Option<u32>,
        event: Option<&str>,
        authorization: Option<&str>,
    ) -> SipRequest {
        let addr: SocketAddr = "203.0.113.1:5060".parse().unwrap();
        SipRequest {
            method: SipMethod::Subscribe,
            request_uri: Uri::parse(to_uri).unwrap(),
            from: Uri::parse(to_uri).unwrap(),
            from_tag: Some("tag1".to_string()),
            to: Uri::parse(to_uri).unwrap(),
            to_tag: None,
            call_id: "call-1".to_string(),
            cseq: 1,
            contact: None,
            expires_header: expires,
            authorization: authorization.map(|s| s.to_string()),
            event: event.map(|s| s.to_string()),
            local_addr: addr,
            remote_addr: addr,
            headers: Default::default(),
        }
    }

    async fn registry_and_store() -> (Arc<DomainRegistry>, Arc<MemoryStore>, Uuid) {
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

    #[tokio::test]
    async fn unknown_account_is_forbidden() {
        let (registry, store, _) = registry_and_store().await;
        let (notify_tx, _rx) = mpsc::unbounded_channel();
        let core = SubscriberCore::spawn(SubscriberConfig::default(), registry, store, notify_tx);
        let req = request("sip:nobody@192.168.0.50", Some(3600), None, None);
        let response = core.submit(req).await;
        assert_eq!(response.status, 403);
    }

    #[tokio::test]
    async fn authenticated_message_summary_schedules_notify() {
        let (registry, store, domain_id) = registry_and_store().await;
        let digest = ha1("user", "192.168.0.50", "password");
        store
            .upsert_account(Account {
                id: Uuid::new_v4(),
                domain_id,
                username: "user".to_string(),
                ha1_digest: digest.clone(),
                disabled: false,
                inserted: Utc::now(),
            })
            .await
            .unwrap();

        let mut config = SubscriberConfig::default();
        config.notify_delay_ms = 1;
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let core = SubscriberCore::spawn(config, registry, store, notify_tx);

        let ha2 = {
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            hasher.update(b"SUBSCRIBE:sip:192.168.0.50");
            hex::encode(hasher.finalize())
        };
        let response_digest = {
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            hasher.update(format!("{digest}:nonce123:{ha2}").as_bytes());
            hex::encode(hasher.finalize())
        };
        let header = format!(
            r#"Digest username="user", realm="192.168.0.50", nonce="nonce123", uri="sip:192.168.0.50", response="{response_digest}""#
        );

        let req = request(
            "sip:user@192.168.0.50",
            Some(3600),
            Some("message-summary"),
            Some(&header),
        );
        let response = core.submit(req).await;
        assert_eq!(response.status, 200);

        let job = tokio::time::timeout(StdDuration::from_millis(200), notify_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.call_id, "call-1");
    }
}
