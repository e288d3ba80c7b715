//! Persistence abstraction
//!
//! The durable store is treated as an opaque map with the schemas below.
//! `Store` is the seam: production deployments would back it with a real
//! database, but the engineered core only depends on this trait.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub username: String,
    pub ha1_digest: String,
    pub disabled: bool,
    pub inserted: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrarBinding {
    pub id: Uuid,
    pub account_id: Uuid,
    pub contact_uri: String,
    pub user_agent: Option<String>,
    pub expiry: u32,
    pub expiry_time: DateTime<Utc>,
    pub remote_socket: String,
    pub proxy_socket: Option<String>,
    pub registrar_socket: Option<String>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dialplan {
    pub name: String,
    pub script_source: String,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cdr {
    pub id: Uuid,
    pub direction: CallDirection,
    pub created: DateTime<Utc>,
    pub destination_uri: String,
    pub from_header: String,
    pub call_id: String,
    pub local_socket: String,
    pub remote_socket: String,
    pub bridge_id: Option<Uuid>,
    pub progress_at: Option<DateTime<Utc>>,
    pub progress_status: Option<u16>,
    pub progress_reason: Option<String>,
    pub ring_duration_ms: Option<i64>,
    pub answered_at: Option<DateTime<Utc>>,
    pub answered_status: Option<u16>,
    pub answered_reason: Option<String>,
    pub duration_ms: Option<i64>,
    pub hungup_at: Option<DateTime<Utc>>,
    pub hungup_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SipCall {
    pub id: Uuid,
    pub cdr_id: Uuid,
    pub local_tag: String,
    pub remote_tag: String,
    pub call_id: String,
    pub cseq: u32,
    pub bridge_id: Uuid,
    pub remote_target: String,
    pub local_user_field: String,
    pub remote_user_field: String,
    pub route_set: Vec<String>,
    pub direction: CallDirection,
    pub remote_socket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalType {
    Sdp,
    Ice,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebrtcSignal {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub signal_type: SignalType,
    pub body: String,
    pub inserted: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Durable store seam. Every operation that can fail surfaces a
/// [`crate::Error::Store`] rather than panicking — callers on the hot
/// path (binding refresh) treat a store error as a soft failure.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_domains(&self) -> Result<Vec<Domain>>;

    async fn find_account(&self, username: &str, domain_id: Uuid) -> Result<Option<Account>>;
    async fn upsert_account(&self, account: Account) -> Result<()>;

    async fn bindings_for_account(&self, account_id: Uuid) -> Result<Vec<RegistrarBinding>>;
    async fn find_binding(
        &self,
        account_id: Uuid,
        contact_uri: &str,
    ) -> Result<Option<RegistrarBinding>>;
    async fn upsert_binding(&self, binding: RegistrarBinding) -> Result<()>;
    async fn delete_binding(&self, id: Uuid) -> Result<()>;
    async fn sweep_expired_bindings(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn load_dialplan(&self, name: &str) -> Result<Option<Dialplan>>;
    async fn save_dialplan(&self, dialplan: Dialplan) -> Result<()>;

    async fn insert_cdr(&self, cdr: Cdr) -> Result<()>;
    async fn update_cdr(&self, cdr: Cdr) -> Result<()>;
    async fn find_cdr(&self, id: Uuid) -> Result<Option<Cdr>>;

    async fn insert_sip_call(&self, call: SipCall) -> Result<()>;
    async fn find_sip_call_by_dialog(
        &self,
        call_id: &str,
        local_tag: &str,
        remote_tag: &str,
    ) -> Result<Option<SipCall>>;
    async fn find_bridge_peer(&self, bridge_id: Uuid, self_id: Uuid) -> Result<Option<SipCall>>;
    async fn delete_sip_call(&self, id: Uuid) -> Result<()>;

    async fn put_signal(&self, signal: WebrtcSignal) -> Result<()>;
    async fn purge_signals(&self, a: &str, b: &str) -> Result<()>;
    async fn next_undelivered_signal(
        &self,
        to: &str,
        from: &str,
        signal_type: Option<SignalType>,
    ) -> Result<Option<WebrtcSignal>>;
    async fn mark_signal_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;
}
