//! Binding Manager — durable `(account, contact) → expiry` store

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::sip::Uri;
use crate::store::{RegistrarBinding, Store};
use crate::Result;

pub struct ContactUpdate {
    pub uri: Uri,
    pub user_agent: Option<String>,
    pub remote_socket: String,
    pub proxy_socket: Option<String>,
    pub registrar_socket: Option<String>,
    /// Clamped expiry; `0` means "remove this binding".
    pub expiry: u32,
}

pub struct BindingManager {
    store: Arc<dyn Store>,
    clock: SharedClock,
    max_bindings_per_account: usize,
}

impl BindingManager {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, max_bindings_per_account: usize) -> Self {
        Self {
            store,
            clock,
            max_bindings_per_account,
        }
    }

    /// Clamps a requested expiry into `[min, max]`. Returns `None` when
    /// the (unclamped) request is non-zero but below `min` — the
    /// caller must reject those with 423 before ever reaching here.
    pub fn clamp_expiry(requested: u32, min: u32, max: u32) -> Option<u32> {
        if requested == 0 {
            return Some(0);
        }
        if requested < min {
            return None;
        }
        Some(requested.min(max))
    }

    pub async fn get_for_account(&self, account_id: Uuid) -> Result<Vec<RegistrarBinding>> {
        self.store.bindings_for_account(account_id).await
    }

    pub async fn update(
        &self,
        account_id: Uuid,
        update: ContactUpdate,
    ) -> Result<Vec<RegistrarBinding>> {
        let now = self.clock.now();
        let contact_uri = update.uri.to_string();
        let existing = self.store.find_binding(account_id, &contact_uri).await?;

        if update.expiry == 0 {
            if let Some(existing) = existing {
                self.store.delete_binding(existing.id).await?;
            }
            return self.store.bindings_for_account(account_id).await;
        }

        let expiry_time = now + chrono::Duration::seconds(update.expiry as i64);
        let binding = RegistrarBinding {
            id: existing.as_ref().map(|b| b.id).unwrap_or_else(Uuid::new_v4),
            account_id,
            contact_uri,
            user_agent: update.user_agent,
            expiry: update.expiry,
            expiry_time,
            remote_socket: update.remote_socket,
            proxy_socket: update.proxy_socket,
            registrar_socket: update.registrar_socket,
            last_update: now,
        };
        self.store.upsert_binding(binding).await?;

        self.evict_overflow(account_id).await?;
        self.store.bindings_for_account(account_id).await
    }

    async fn evict_overflow(&self, account_id: Uuid) -> Result<()> {
        loop {
            let mut bindings = self.store.bindings_for_account(account_id).await?;
            if bindings.len() <= self.max_bindings_per_account {
                return Ok(());
            }
            bindings.sort_by_key(|b| b.last_update);
            let oldest = bindings.remove(0);
            debug!(account = %account_id, binding = %oldest.id, "evicting oldest binding, account over capacity");
            self.store.delete_binding(oldest.id).await?;
        }
    }

    pub async fn sweep_expired(&self) -> Result<usize> {
        self.store.sweep_expired_bindings(self.clock.now()).await
    }
}
