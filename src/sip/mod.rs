//! Lightweight SIP message model
//!
//! The wire parser, transaction/dialog state machine, and retransmit
//! timers are treated as a black box a production deployment would hang
//! a full SIP stack behind. These types are the shape this crate's
//! components actually operate on: a parsed request/response plus
//! enough header accessors to drive routing, auth, and contact
//! rewriting. Wiring a specific wire stack's AST into every component
//! signature would just be a thin adapter over what's modeled here.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Bye,
    Cancel,
    Ack,
    Options,
    Subscribe,
    Notify,
    Other,
}

impl SipMethod {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "REGISTER" => Self::Register,
            "INVITE" => Self::Invite,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "ACK" => Self::Ack,
            "OPTIONS" => Self::Options,
            "SUBSCRIBE" => Self::Subscribe,
            "NOTIFY" => Self::Notify,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Invite => "INVITE",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Ack => "ACK",
            Self::Options => "OPTIONS",
            Self::Subscribe => "SUBSCRIBE",
            Self::Notify => "NOTIFY",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed `sip:`/`sips:` URI, enough for routing and contact rewrite
/// decisions. Unknown URI parameters are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: HashMap<String, String>,
}

impl Uri {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        // A header value may wrap the URI in angle brackets followed by
        // header-level params, e.g. `<sip:user@host:5060>;expires=3600`.
        // Those trailing params are folded in alongside the URI's own
        // params so callers like `expires_param()` see them either way.
        let (raw, trailing_params) = if let Some(rest) = raw.strip_prefix('<') {
            match rest.find('>') {
                Some(end) => (&rest[..end], &rest[end + 1..]),
                None => (rest, ""),
            }
        } else {
            (raw, "")
        };
        let (scheme, rest) = raw.split_once(':')?;
        let secure = match scheme.to_ascii_lowercase().as_str() {
            "sip" => false,
            "sips" => true,
            _ => return None,
        };

        let mut parts = rest.splitn(2, ';');
        let userinfo_host = parts.next()?;
        let param_str = parts.next().unwrap_or("");

        let (user, host_port) = match userinfo_host.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, userinfo_host),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse::<u16>().ok()),
            None => (host_port.to_string(), None),
        };

        let mut params = HashMap::new();
        for pair in param_str
            .split(';')
            .chain(trailing_params.split(';'))
            .filter(|s| !s.is_empty())
        {
            match pair.split_once('=') {
                Some((k, v)) => {
                    params.insert(k.to_string(), v.to_string());
                }
                None => {
                    params.insert(pair.to_string(), String::new());
                }
            }
        }

        Some(Self {
            secure,
            user,
            host,
            port,
            params,
        })
    }

    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }

    pub fn expires_param(&self) -> Option<u32> {
        self.params.get("expires").and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "sips" } else { "sip" };
        write!(f, "{scheme}:")?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for (k, v) in &self.params {
            if v.is_empty() {
                write!(f, ";{k}")?;
            } else {
                write!(f, ";{k}={v}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub request_uri: Uri,
    pub from: Uri,
    pub from_tag: Option<String>,
    pub to: Uri,
    pub to_tag: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    pub contact: Option<Uri>,
    pub expires_header: Option<u32>,
    pub authorization: Option<String>,
    pub event: Option<String>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub headers: HashMap<String, String>,
}

impl SipRequest {
    /// The expiry this request actually asks for: the Contact
    /// parameter takes precedence over the `Expires` header.
    pub fn requested_expiry(&self) -> Option<u32> {
        self.contact
            .as_ref()
            .and_then(|c| c.expires_param())
            .or(self.expires_header)
    }
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_uri() {
        let uri = Uri::parse("sip:user@192.168.0.50:5060").unwrap();
        assert_eq!(uri.user.as_deref(), Some("user"));
        assert_eq!(uri.host, "192.168.0.50");
        assert_eq!(uri.port, Some(5060));
        assert!(!uri.secure);
    }

    #[test]
    fn parses_uri_with_expires_param() {
        let uri = Uri::parse("<sip:user@1.2.3.4:5060>;expires=3600").unwrap();
        assert_eq!(uri.expires_param(), Some(3600));
    }

    #[test]
    fn bracketed_uri_with_trailing_params_keeps_its_port() {
        let uri = Uri::parse("<sip:user@1.2.3.4:5060>;expires=3600").unwrap();
        assert_eq!(uri.host, "1.2.3.4");
        assert_eq!(uri.port, Some(5060));
    }

    #[test]
    fn detects_ip_literal_host() {
        let uri = Uri::parse("sip:203.0.113.7").unwrap();
        assert!(uri.is_ip_literal());
        let uri = Uri::parse("sip:example.com").unwrap();
        assert!(!uri.is_ip_literal());
    }

    #[test]
    fn sips_scheme_is_secure() {
        let uri = Uri::parse("sips:user@example.com").unwrap();
        assert!(uri.secure);
    }

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!(SipMethod::parse("register"), SipMethod::Register);
        assert_eq!(SipMethod::parse("InViTe"), SipMethod::Invite);
        assert_eq!(SipMethod::parse("WIBBLE"), SipMethod::Other);
    }
}
