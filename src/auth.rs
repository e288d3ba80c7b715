//! Digest authentication — `HA1 = MD5(user:realm:password)`
//!
//! Mirrors the challenge/response exchange used by the Registrar and
//! Subscriber cores. The account store holds only `ha1_digest`; the
//! plaintext password is never persisted.

use md5::{Digest, Md5};
use rand::RngCore;

use crate::store::Account;

#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

#[derive(Debug, Clone)]
pub struct DigestCredentials<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub uri: &'a str,
    pub response: &'a str,
    pub method: &'a str,
}

pub fn ha1(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{username}:{realm}:{password}"))
}

/// Generates a challenge with a fresh nonce. Two back-to-back calls
/// never produce the same nonce.
pub fn issue_challenge(realm: impl Into<String>) -> DigestChallenge {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    DigestChallenge {
        realm: realm.into(),
        nonce: hex::encode(bytes),
    }
}

/// Verifies a digest response against the account's stored HA1.
/// Returns `true` on match. `account.disabled` is not checked here —
/// callers reject disabled accounts before authenticating.
pub fn verify(account: &Account, creds: &DigestCredentials<'_>) -> bool {
    let ha2 = md5_hex(&format!("{}:{}", creds.method, creds.uri));
    let expected = md5_hex(&format!(
        "{}:{}:{}",
        account.ha1_digest, creds.nonce, ha2
    ));
    expected.eq_ignore_ascii_case(creds.response)
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ParsedAuthorization {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

/// Parses an `Authorization: Digest ...` header into its quoted
/// key-value pairs. Returns `None` if any required field is absent.
pub fn parse_authorization_header(header: &str) -> Option<ParsedAuthorization> {
    let rest = header.trim().strip_prefix("Digest")?.trim();
    let mut fields = std::collections::HashMap::new();
    for pair in rest.split(',') {
        let pair = pair.trim();
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(key.trim(), value.trim().trim_matches('"').to_string());
        }
    }
    Some(ParsedAuthorization {
        username: fields.remove("username")?,
        realm: fields.remove("realm")?,
        nonce: fields.remove("nonce")?,
        uri: fields.remove("uri")?,
        response: fields.remove("response")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn account(ha1_digest: &str) -> Account {
        Account {
            id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            username: "user".to_string(),
            ha1_digest: ha1_digest.to_string(),
            disabled: false,
            inserted: Utc::now(),
        }
    }

    #[test]
    fn ha1_matches_known_vector() {
        assert_eq!(
            ha1("user", "192.168.0.50", "password"),
            md5_hex("user:192.168.0.50:password")
        );
    }

    #[test]
    fn challenges_carry_fresh_nonces() {
        let a = issue_challenge("example.com");
        let b = issue_challenge("example.com");
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn verifies_correct_response() {
        let digest = ha1("user", "example.com", "secret");
        let account = account(&digest);
        let nonce = "abc123";
        let method = "REGISTER";
        let uri = "sip:example.com";
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let response = md5_hex(&format!("{digest}:{nonce}:{ha2}"));

        let creds = DigestCredentials {
            username: "user",
            realm: "example.com",
            nonce,
            uri,
            response: &response,
            method,
        };
        assert!(verify(&account, &creds));
    }

    #[test]
    fn rejects_wrong_response() {
        let account = account(&ha1("user", "example.com", "secret"));
        let creds = DigestCredentials {
            username: "user",
            realm: "example.com",
            nonce: "abc123",
            uri: "sip:example.com",
            response: "deadbeef",
            method: "REGISTER",
        };
        assert!(!verify(&account, &creds));
    }

    #[test]
    fn parses_authorization_header() {
        let header = r#"Digest username="user", realm="example.com", nonce="abc123", uri="sip:example.com", response="deadbeef", algorithm=MD5"#;
        let parsed = parse_authorization_header(header).unwrap();
        assert_eq!(parsed.username, "user");
        assert_eq!(parsed.nonce, "abc123");
    }
}
