//! Dispatcher — classifies incoming requests into in-dialog / method-specific / rejected

use std::net::SocketAddr;

use chrono::Duration;
use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::sip::{SipMethod, SipRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Has both a From-tag and a To-tag: belongs to an existing dialog,
    /// hand to the Call Manager.
    InDialog,
    Register,
    Invite,
    Subscribe,
    /// OPTIONS outside a dialog: answered inline with a capabilities reply.
    Options,
    /// ACK/CANCEL/NOTIFY arriving outside any known dialog/transaction.
    Unsolicited,
    MethodNotAllowed,
}

pub fn classify(request: &SipRequest) -> Route {
    if request.to_tag.is_some() && request.from_tag.is_some() {
        return Route::InDialog;
    }

    match request.method {
        SipMethod::Register => Route::Register,
        SipMethod::Invite => Route::Invite,
        SipMethod::Subscribe => Route::Subscribe,
        SipMethod::Options => Route::Options,
        SipMethod::Ack | SipMethod::Cancel | SipMethod::Notify => Route::Unsolicited,
        SipMethod::Bye => Route::InDialog,
        SipMethod::Other => Route::MethodNotAllowed,
    }
}

/// Window a repeated `(source, Call-ID, CSeq, method)` tuple is still
/// treated as a retransmit rather than a fresh request. Comfortably
/// covers UDP's exponential-backoff retransmit schedule (RFC 3261
/// Timer A/E tops out well under this).
const RETRANSMIT_WINDOW_SECS: i64 = 32;

type RetransmitKey = (SocketAddr, String, u32, SipMethod);

/// Flags duplicate requests from the same source as retransmits so the
/// Abuse Filter can count them. Keyed on the transaction identity a UA
/// reuses across retries; a genuinely new request (bumped CSeq, fresh
/// Call-ID) is never mistaken for one.
pub struct RetransmitDetector {
    seen: DashMap<RetransmitKey, chrono::DateTime<chrono::Utc>>,
    clock: SharedClock,
}

impl RetransmitDetector {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            seen: DashMap::new(),
            clock,
        }
    }

    /// Returns `true` if this exact request was already seen within
    /// the retransmit window, recording it either way.
    pub fn observe(&self, request: &SipRequest) -> bool {
        let key = (
            request.remote_addr,
            request.call_id.clone(),
            request.cseq,
            request.method,
        );
        let now = self.clock.now();
        let is_retransmit = match self.seen.get(&key) {
            Some(last_seen) => now - *last_seen <= Duration::seconds(RETRANSMIT_WINDOW_SECS),
            None => false,
        };
        self.seen.insert(key, now);
        is_retransmit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::Uri;
    use std::net::SocketAddr;

    fn request(method: SipMethod, from_tag: Option<&str>, to_tag: Option<&str>) -> SipRequest {
        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        SipRequest {
            method,
            request_uri: Uri::parse("sip:192.168.0.50").unwrap(),
            from: Uri::parse("sip:a@192.168.0.50").unwrap(),
            from_tag: from_tag.map(|s| s.to_string()),
            to: Uri::parse("sip:b@192.168.0.50").unwrap(),
            to_tag: to_tag.map(|s| s.to_string()),
            call_id: "c1".to_string(),
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

    #[test]
    fn in_dialog_wins_regardless_of_method() {
        let req = request(SipMethod::Invite, Some("a"), Some("b"));
        assert_eq!(classify(&req), Route::InDialog);
    }

    #[test]
    fn fresh_invite_routes_to_invite() {
        let req = request(SipMethod::Invite, Some("a"), None);
        assert_eq!(classify(&req), Route::Invite);
    }

    #[test]
    fn unknown_method_is_not_allowed() {
        let req = request(SipMethod::Other, None, None);
        assert_eq!(classify(&req), Route::MethodNotAllowed);
    }

    #[test]
    fn second_identical_request_is_flagged_a_retransmit() {
        use crate::clock::FixedClock;
        use std::sync::Arc;

        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let detector = RetransmitDetector::new(clock);
        let req = request(SipMethod::Invite, Some("a"), None);

        assert!(!detector.observe(&req));
        assert!(detector.observe(&req));
    }

    #[test]
    fn bumped_cseq_is_not_a_retransmit() {
        use crate::clock::FixedClock;
        use std::sync::Arc;

        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let detector = RetransmitDetector::new(clock);
        let mut first = request(SipMethod::Invite, Some("a"), None);
        first.cseq = 1;
        let mut second = request(SipMethod::Invite, Some("a"), None);
        second.cseq = 2;

        assert!(!detector.observe(&first));
        assert!(!detector.observe(&second));
    }

    #[test]
    fn request_outside_the_window_is_not_a_retransmit() {
        use crate::clock::FixedClock;
        use std::sync::Arc;

        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let detector = RetransmitDetector::new(clock.clone());
        let req = request(SipMethod::Invite, Some("a"), None);

        assert!(!detector.observe(&req));
        clock.advance(chrono::Duration::seconds(RETRANSMIT_WINDOW_SECS + 1));
        assert!(!detector.observe(&req));
    }
}
