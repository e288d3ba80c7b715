//! Call Manager — bridged-dialog table and CDR lifecycle

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::sip::{SipRequest, SipResponse};
use crate::store::{CallDirection, Cdr, SipCall, Store};
use crate::Result;

#[derive(Debug, Clone)]
pub struct DialogLeg {
    pub sip_call_id: Uuid,
    pub cdr_id: Uuid,
    pub bridge_id: Uuid,
}

/// Tracks `bridgeId → (legA, legB)` and routes in-dialog traffic
/// between the two. The process-local index mirrors what's durably
/// stored via [`Store`] so a restart can rehydrate it, but routing
/// decisions are made against this in-memory copy for latency.
pub struct CallManager {
    store: Arc<dyn Store>,
    dialogs: DashMap<(String, String, String), DialogLeg>,
}

impl CallManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            dialogs: DashMap::new(),
        }
    }

    /// Persists both legs under a shared bridge id and records a CDR
    /// for each. Called once the UAC side answers.
    pub async fn bridge(
        &self,
        uas: SipCall,
        uac: SipCall,
        uas_cdr: Cdr,
        uac_cdr: Cdr,
    ) -> Result<Uuid> {
        let bridge_id = uas.bridge_id;
        self.store.insert_sip_call(uas.clone()).await?;
        self.store.insert_sip_call(uac.clone()).await?;
        self.store.insert_cdr(uas_cdr).await?;
        self.store.insert_cdr(uac_cdr).await?;

        self.dialogs.insert(
            (uas.call_id.clone(), uas.local_tag.clone(), uas.remote_tag.clone()),
            DialogLeg {
                sip_call_id: uas.id,
                cdr_id: uas.cdr_id,
                bridge_id,
            },
        );
        self.dialogs.insert(
            (uac.call_id.clone(), uac.local_tag.clone(), uac.remote_tag.clone()),
            DialogLeg {
                sip_call_id: uac.id,
                cdr_id: uac.cdr_id,
                bridge_id,
            },
        );

        info!(bridge_id = %bridge_id, "legs bridged");
        Ok(bridge_id)
    }

    /// Routes an in-dialog request (BYE, re-INVITE) to the paired leg.
    /// A BYE finalises both CDRs and tears down the bridge entry.
    pub async fn process_in_dialog(&self, request: &SipRequest) -> Result<SipResponse> {
        let key = (
            request.call_id.clone(),
            request.to_tag.clone().unwrap_or_default(),
            request.from_tag.clone().unwrap_or_default(),
        );

        let Some((_, leg)) = self.dialogs.remove(&key) else {
            return Ok(SipResponse::new(481, "Call/Transaction Does Not Exist"));
        };

        let Some(peer) = self
            .store
            .find_bridge_peer(leg.bridge_id, leg.sip_call_id)
            .await?
        else {
            warn!(bridge_id = %leg.bridge_id, "no peer leg found for in-dialog request");
            return Ok(SipResponse::new(481, "Call/Transaction Does Not Exist"));
        };

        if matches!(request.method, crate::sip::SipMethod::Bye) {
            self.finalise(leg.bridge_id, leg.cdr_id, peer.cdr_id).await?;
        } else {
            self.dialogs.insert(key, leg);
        }

        Ok(SipResponse::new(200, "OK"))
    }

    async fn finalise(&self, bridge_id: Uuid, cdr_a: Uuid, cdr_b: Uuid) -> Result<()> {
        let now = Utc::now();
        for cdr_id in [cdr_a, cdr_b] {
            if let Some(mut cdr) = self.store.find_cdr(cdr_id).await? {
                cdr.hungup_at = Some(now);
                cdr.hungup_reason = Some("bye".to_string());
                if let Some(answered_at) = cdr.answered_at {
                    cdr.duration_ms = Some((now - answered_at).num_milliseconds());
                }
                self.store.update_cdr(cdr).await?;
            }
        }
        info!(bridge_id = %bridge_id, "bridge finalised");
        Ok(())
    }

    pub fn next_bridge_id() -> Uuid {
        Uuid::new_v4()
    }
}
