//! WebRTC Signal Relay — store-and-forward mailbox for SDP/ICE between
//! browser peers, plus its HTTP surface
//!
//! `getNext` is genuinely a long-poll from the client's perspective;
//! the server side is a single non-blocking mailbox read that returns
//! immediately (200 with body, or 204). The long-poll behavior lives
//! entirely in the client.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::store::{SignalType, Store, WebrtcSignal};

pub struct WebrtcRelay {
    store: Arc<dyn Store>,
}

impl WebrtcRelay {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// If `sdp` is an offer, purges every prior message for either
    /// direction of `(from, to)` before appending the new one.
    pub async fn put_sdp(&self, from: &str, to: &str, sdp: &SdpBody) -> crate::Result<()> {
        if sdp.sdp_type.eq_ignore_ascii_case("offer") {
            self.store.purge_signals(from, to).await?;
        }
        self.store
            .put_signal(WebrtcSignal {
                id: Uuid::new_v4(),
                from: from.to_string(),
                to: to.to_string(),
                signal_type: SignalType::Sdp,
                body: serde_json::to_string(sdp).map_err(crate::Error::Serialization)?,
                inserted: Utc::now(),
                delivered_at: None,
            })
            .await
    }

    pub async fn put_ice(&self, from: &str, to: &str, candidate: &IceBody) -> crate::Result<()> {
        self.store
            .put_signal(WebrtcSignal {
                id: Uuid::new_v4(),
                from: from.to_string(),
                to: to.to_string(),
                signal_type: SignalType::Ice,
                body: serde_json::to_string(candidate).map_err(crate::Error::Serialization)?,
                inserted: Utc::now(),
                delivered_at: None,
            })
            .await
    }

    /// Returns the oldest undelivered message matching `(to, from,
    /// type)` and marks it delivered. `None` if the mailbox is empty
    /// for that filter.
    pub async fn get_next(
        &self,
        to: &str,
        from: &str,
        signal_type: Option<SignalType>,
    ) -> crate::Result<Option<WebrtcSignal>> {
        let signal = self
            .store
            .next_undelivered_signal(to, from, signal_type)
            .await?;
        if let Some(signal) = &signal {
            self.store.mark_signal_delivered(signal.id, Utc::now()).await?;
        }
        Ok(signal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpBody {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceBody {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u32>,
}

/// Wire-format of a signal as returned from a `GET` — the stored
/// JSON body plus the envelope fields the client needs (`type`).
#[derive(Debug, Serialize)]
struct SignalEnvelope {
    #[serde(rename = "type")]
    signal_type: &'static str,
    body: serde_json::Value,
}

pub fn router(relay: Arc<WebrtcRelay>) -> Router {
    Router::new()
        .route("/api/webrtcsignal/sdp/:from/:to", put(put_sdp))
        .route("/api/webrtcsignal/ice/:from/:to", put(put_ice))
        .route("/api/webrtcsignal/:to/:from/:kind", get(get_next))
        .with_state(relay)
}

async fn put_sdp(
    State(relay): State<Arc<WebrtcRelay>>,
    Path((from, to)): Path<(String, String)>,
    Json(body): Json<SdpBody>,
) -> impl IntoResponse {
    match relay.put_sdp(&from, &to, &body).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "failed to store SDP signal");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn put_ice(
    State(relay): State<Arc<WebrtcRelay>>,
    Path((from, to)): Path<(String, String)>,
    Json(body): Json<IceBody>,
) -> impl IntoResponse {
    match relay.put_ice(&from, &to, &body).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "failed to store ICE signal");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_next(
    State(relay): State<Arc<WebrtcRelay>>,
    Path((to, from, kind)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let signal_type = match kind.as_str() {
        "sdp" => Some(SignalType::Sdp),
        "ice" => Some(SignalType::Ice),
        "any" => None,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    match relay.get_next(&to, &from, signal_type).await {
        Ok(Some(signal)) => {
            let body: serde_json::Value =
                serde_json::from_str(&signal.body).unwrap_or(serde_json::Value::Null);
            let kind = match signal.signal_type {
                SignalType::Sdp => "sdp",
                SignalType::Ice => "ice",
            };
            info!(to = %to, from = %from, kind, "delivered webrtc signal");
            Json(SignalEnvelope {
                signal_type: kind,
                body,
            })
            .into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read next webrtc signal");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn relay() -> Arc<WebrtcRelay> {
        Arc::new(WebrtcRelay::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn reoffer_purges_prior_messages_for_both_directions() {
        let relay = relay();
        relay
            .put_sdp(
                "a",
                "b",
                &SdpBody {
                    sdp_type: "offer".to_string(),
                    sdp: "offer1".to_string(),
                },
            )
            .await
            .unwrap();
        relay
            .put_ice(
                "a",
                "b",
                &IceBody {
                    candidate: "ice1".to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            )
            .await
            .unwrap();
        relay
            .put_sdp(
                "a",
                "b",
                &SdpBody {
                    sdp_type: "offer".to_string(),
                    sdp: "offer2".to_string(),
                },
            )
            .await
            .unwrap();

        let next = relay.get_next("b", "a", Some(SignalType::Sdp)).await.unwrap();
        let body: SdpBody = serde_json::from_str(&next.unwrap().body).unwrap();
        assert_eq!(body.sdp, "offer2");

        // The ICE candidate from before the re-offer was purged too.
        let ice = relay.get_next("b", "a", Some(SignalType::Ice)).await.unwrap();
        assert!(ice.is_none());
    }

    #[tokio::test]
    async fn delivered_exactly_once() {
        let relay = relay();
        relay
            .put_sdp(
                "a",
                "b",
                &SdpBody {
                    sdp_type: "offer".to_string(),
                    sdp: "offer1".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(relay.get_next("b", "a", None).await.unwrap().is_some());
        assert!(relay.get_next("b", "a", None).await.unwrap().is_none());
    }
}
