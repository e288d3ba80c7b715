//! Contact Customiser — rewrites outgoing Contact headers for NAT/LB topologies

use std::net::IpAddr;

use crate::config::TransportConfig;
use crate::sip::Uri;

#[derive(Debug, Clone, Copy)]
pub enum Destination {
    V4(IpAddr),
    V6(IpAddr),
}

/// Rewrites `contact` in place per the precedence rules:
/// TLS+hostname, else matching-family public IP, else hostname.
/// A no-op if no public address/hostname is configured at all.
pub fn rewrite(contact: &mut Uri, destination: Destination, config: &TransportConfig) {
    if contact.secure {
        if let Some(hostname) = &config.public_contact_hostname {
            apply_host(contact, hostname.clone(), None);
            return;
        }
    }

    match destination {
        Destination::V4(_) => {
            if let Some(v4) = config.public_contact_ipv4 {
                let port = preserved_port(contact);
                apply_host(contact, v4.to_string(), port);
                return;
            }
        }
        Destination::V6(_) => {
            if let Some(v6) = config.public_contact_ipv6 {
                let port = preserved_port(contact);
                apply_host(contact, format!("[{v6}]"), port);
                return;
            }
        }
    }

    if let Some(hostname) = &config.public_contact_hostname {
        apply_host(contact, hostname.clone(), None);
    }
}

/// A source port of 0 means "let transport decide" — the rewrite
/// drops the port entirely in that case.
fn preserved_port(contact: &Uri) -> Option<u16> {
    match contact.port {
        Some(0) | None => None,
        Some(port) => Some(port),
    }
}

fn apply_host(contact: &mut Uri, host: String, port: Option<u16>) {
    contact.host = host;
    contact.port = port;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn config_with(v4: Option<&str>, v6: Option<&str>, hostname: Option<&str>) -> TransportConfig {
        TransportConfig {
            sip_listen_port: 5060,
            sip_tls_listen_port: 5061,
            tls_cert_path: None,
            tls_key_path: None,
            public_contact_hostname: hostname.map(|s| s.to_string()),
            public_contact_ipv4: v4.map(|s| s.parse().unwrap()),
            public_contact_ipv6: v6.map(|s| s.parse().unwrap()),
            private_subnets: vec![],
        }
    }

    #[test]
    fn rewrites_v4_destination_to_public_v4() {
        let config = config_with(Some("1.2.3.4"), None, None);
        let mut contact = Uri::parse("sip:user@10.0.0.5:5060").unwrap();
        rewrite(
            &mut contact,
            Destination::V4(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
            &config,
        );
        assert_eq!(contact.host, "1.2.3.4");
        assert_eq!(contact.port, Some(5060));
    }

    #[test]
    fn drops_zero_port() {
        let config = config_with(Some("1.2.3.4"), None, None);
        let mut contact = Uri::parse("sip:user@10.0.0.5:0").unwrap();
        rewrite(
            &mut contact,
            Destination::V4(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
            &config,
        );
        assert_eq!(contact.port, None);
    }

    #[test]
    fn tls_prefers_hostname_over_public_v4() {
        let config = config_with(Some("1.2.3.4"), None, Some("sip.example.com"));
        let mut contact = Uri::parse("sips:user@10.0.0.5:5061").unwrap();
        rewrite(
            &mut contact,
            Destination::V4(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
            &config,
        );
        assert_eq!(contact.host, "sip.example.com");
    }

    #[test]
    fn falls_back_to_hostname_when_family_unconfigured() {
        let config = config_with(None, None, Some("sip.example.com"));
        let mut contact = Uri::parse("sip:user@10.0.0.5:5060").unwrap();
        rewrite(
            &mut contact,
            Destination::V4(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
            &config,
        );
        assert_eq!(contact.host, "sip.example.com");
    }

    #[test]
    fn no_configuration_leaves_contact_untouched() {
        let config = config_with(None, None, None);
        let mut contact = Uri::parse("sip:user@10.0.0.5:5060").unwrap();
        let original_host = contact.host.clone();
        rewrite(
            &mut contact,
            Destination::V4(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
            &config,
        );
        assert_eq!(contact.host, original_host);
    }
}
