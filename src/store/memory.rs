//! In-memory reference implementation of [`Store`]
//!
//! Suitable for tests and single-node deployments without an external
//! database attached. Keeps every table behind its own `DashMap` so
//! writers to different tables never contend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{Account, Cdr, Dialplan, Domain, RegistrarBinding, SignalType, SipCall, Store, WebrtcSignal};
use crate::Result;

#[derive(Debug, Default)]
pub struct MemoryStore {
    domains: DashMap<Uuid, Domain>,
    accounts: DashMap<Uuid, Account>,
    bindings: DashMap<Uuid, RegistrarBinding>,
    dialplans: DashMap<String, Dialplan>,
    cdrs: DashMap<Uuid, Cdr>,
    sip_calls: DashMap<Uuid, SipCall>,
    signals: DashMap<Uuid, WebrtcSignal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_domain(&self, domain: Domain) {
        self.domains.insert(domain.id, domain);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_domains(&self) -> Result<Vec<Domain>> {
        Ok(self.domains.iter().map(|e| e.value().clone()).collect())
    }

    async fn find_account(&self, username: &str, domain_id: Uuid) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .iter()
            .find(|e| e.value().username == username && e.value().domain_id == domain_id)
            .map(|e| e.value().clone()))
    }

    async fn upsert_account(&self, account: Account) -> Result<()> {
        self.accounts.insert(account.id, account);
        Ok(())
    }

    async fn bindings_for_account(&self, account_id: Uuid) -> Result<Vec<RegistrarBinding>> {
        Ok(self
            .bindings
            .iter()
            .filter(|e| e.value().account_id == account_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn find_binding(
        &self,
        account_id: Uuid,
        contact_uri: &str,
    ) -> Result<Option<RegistrarBinding>> {
        Ok(self
            .bindings
            .iter()
            .find(|e| e.value().account_id == account_id && e.value().contact_uri == contact_uri)
            .map(|e| e.value().clone()))
    }

    async fn upsert_binding(&self, binding: RegistrarBinding) -> Result<()> {
        self.bindings.insert(binding.id, binding);
        Ok(())
    }

    async fn delete_binding(&self, id: Uuid) -> Result<()> {
        self.bindings.remove(&id);
        Ok(())
    }

    async fn sweep_expired_bindings(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Uuid> = self
            .bindings
            .iter()
            .filter(|e| e.value().expiry_time <= now)
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.bindings.remove(id);
        }
        Ok(expired.len())
    }

    async fn load_dialplan(&self, name: &str) -> Result<Option<Dialplan>> {
        Ok(self.dialplans.get(name).map(|e| e.value().clone()))
    }

    async fn save_dialplan(&self, dialplan: Dialplan) -> Result<()> {
        self.dialplans.insert(dialplan.name.clone(), dialplan);
        Ok(())
    }

    async fn insert_cdr(&self, cdr: Cdr) -> Result<()> {
        self.cdrs.insert(cdr.id, cdr);
        Ok(())
    }

    async fn update_cdr(&self, cdr: Cdr) -> Result<()> {
        self.cdrs.insert(cdr.id, cdr);
        Ok(())
    }

    async fn find_cdr(&self, id: Uuid) -> Result<Option<Cdr>> {
        Ok(self.cdrs.get(&id).map(|e| e.value().clone()))
    }

    async fn insert_sip_call(&self, call: SipCall) -> Result<()> {
        self.sip_calls.insert(call.id, call);
        Ok(())
    }

    async fn find_sip_call_by_dialog(
        &self,
        call_id: &str,
        local_tag: &str,
        remote_tag: &str,
    ) -> Result<Option<SipCall>> {
        Ok(self
            .sip_calls
            .iter()
            .find(|e| {
                e.value().call_id == call_id
                    && e.value().local_tag == local_tag
                    && e.value().remote_tag == remote_tag
            })
            .map(|e| e.value().clone()))
    }

    async fn find_bridge_peer(&self, bridge_id: Uuid, self_id: Uuid) -> Result<Option<SipCall>> {
        Ok(self
            .sip_calls
            .iter()
            .find(|e| e.value().bridge_id == bridge_id && e.value().id != self_id)
            .map(|e| e.value().clone()))
    }

    async fn delete_sip_call(&self, id: Uuid) -> Result<()> {
        self.sip_calls.remove(&id);
        Ok(())
    }

    async fn put_signal(&self, signal: WebrtcSignal) -> Result<()> {
        self.signals.insert(signal.id, signal);
        Ok(())
    }

    async fn purge_signals(&self, a: &str, b: &str) -> Result<()> {
        let stale: Vec<Uuid> = self
            .signals
            .iter()
            .filter(|e| {
                (e.value().from == a && e.value().to == b)
                    || (e.value().from == b && e.value().to == a)
            })
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            self.signals.remove(id);
        }
        Ok(())
    }

    async fn next_undelivered_signal(
        &self,
        to: &str,
        from: &str,
        signal_type: Option<SignalType>,
    ) -> Result<Option<WebrtcSignal>> {
        let mut candidates: Vec<WebrtcSignal> = self
            .signals
            .iter()
            .filter(|e| {
                let v = e.value();
                v.to == to
                    && v.from == from
                    && v.delivered_at.is_none()
                    && signal_type
                        .as_ref()
                        .map(|t| *t == v.signal_type)
                        .unwrap_or(true)
            })
            .map(|e| e.value().clone())
            .collect();
        candidates.sort_by_key(|s| s.inserted);
        Ok(candidates.into_iter().next())
    }

    async fn mark_signal_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(mut entry) = self.signals.get_mut(&id) {
            entry.delivered_at = Some(now);
        }
        Ok(())
    }
}
