//! Minimal request-line + header parser
//!
//! Deliberately narrow: enough to extract the handful of headers this
//! crate's components act on. A production deployment sits this
//! behind the real wire parser; this reference parser exists so the
//! crate is exercisable without one.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::sip::{SipMethod, SipRequest, Uri};

pub fn parse_request(bytes: &[u8], local: SocketAddr, peer: SocketAddr) -> Option<SipRequest> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;

    let mut parts = request_line.split_whitespace();
    let method_raw = parts.next()?;
    let uri_raw = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("SIP/2.0") {
        return None;
    }

    let method = SipMethod::parse(method_raw);
    let request_uri = Uri::parse(uri_raw)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    let from_raw = headers.get("From").or_else(|| headers.get("f"))?;
    let (from_uri_str, from_tag) = split_tag(from_raw);
    let from = Uri::parse(from_uri_str)?;

    let to_raw = headers.get("To").or_else(|| headers.get("t"))?;
    let (to_uri_str, to_tag) = split_tag(to_raw);
    let to = Uri::parse(to_uri_str)?;

    let call_id = headers
        .get("Call-ID")
        .or_else(|| headers.get("i"))?
        .to_string();

    let cseq = headers
        .get("CSeq")
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let contact = headers
        .get("Contact")
        .or_else(|| headers.get("m"))
        .and_then(|v| Uri::parse(v));

    let expires_header = headers.get("Expires").and_then(|v| v.parse().ok());
    let authorization = headers.get("Authorization").cloned();
    let event = headers.get("Event").or_else(|| headers.get("o")).cloned();

    Some(SipRequest {
        method,
        request_uri,
        from,
        from_tag,
        to,
        to_tag,
        call_id,
        cseq,
        contact,
        expires_header,
        authorization,
        event,
        local_addr: local,
        remote_addr: peer,
        headers,
    })
}

fn split_tag(header_value: &str) -> (&str, Option<String>) {
    match header_value.split_once(";tag=") {
        Some((uri, rest)) => {
            let tag = rest.split(';').next().unwrap_or(rest);
            (uri, Some(tag.to_string()))
        }
        None => (header_value, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    #[test]
    fn parses_minimal_register() {
        let raw = "REGISTER sip:192.168.0.50 SIP/2.0\r\n\
            From: <sip:user@192.168.0.50>;tag=abc\r\n\
            To: <sip:user@192.168.0.50>\r\n\
            Call-ID: call-1\r\n\
            CSeq: 1 REGISTER\r\n\
            Contact: <sip:user@1.2.3.4:5060>;expires=3600\r\n\
            Expires: 3600\r\n\r\n";
        let req = parse_request(raw.as_bytes(), addr(), addr()).unwrap();
        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.from_tag.as_deref(), Some("abc"));
        assert_eq!(req.call_id, "call-1");
        assert_eq!(req.requested_expiry(), Some(3600));
    }

    #[test]
    fn rejects_non_sip_version() {
        let raw = "REGISTER sip:192.168.0.50 HTTP/1.1\r\n\r\n";
        assert!(parse_request(raw.as_bytes(), addr(), addr()).is_none());
    }
}
