//! Failure event hooks — `OnRegisterFailure` / `OnAcceptCallFailure`
//!
//! Delegate-style subscriptions in the original become a mailbox per
//! consumer: the Abuse Filter is the only subscriber today, but the
//! channel shape allows more without touching the emitting cores.

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFailureReason {
    DomainNotServiced,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptCallFailureReason {
    NoSipAccount,
    NotFound,
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    RegisterFailure {
        remote: SocketAddr,
        reason: RegisterFailureReason,
        request_uri_is_ip_literal: bool,
    },
    AcceptCallFailure {
        remote: SocketAddr,
        reason: AcceptCallFailureReason,
        request_uri_is_ip_literal: bool,
    },
    Retransmit {
        remote: SocketAddr,
        request_uri_is_ip_literal: bool,
    },
}
