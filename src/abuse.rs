//! Abuse Filter — per-source counters and ban table
//!
//! Hooked from the Transport Adapter (retransmits) and from the
//! Registrar/B2BUA failure events. One [`BanEntry`] per source IP,
//! held behind its own lock so unrelated sources never contend.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::clock::SharedClock;

const BAN_RESET_WINDOW_SECS: i64 = 600;
const RULE_VIOLATION_COUNT_FOR_IPADDRESS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    ExcessiveRegistrationFailures,
    ExcessiveRetransmits,
    ExcessiveCallAcceptFailures,
}

impl BanReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ExcessiveRegistrationFailures => "ExcessiveRegistrationFailures",
            Self::ExcessiveRetransmits => "ExcessiveRetransmits",
            Self::ExcessiveCallAcceptFailures => "ExcessiveCallAcceptFailures",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BanEntry {
    pub reg_failure_count: u32,
    pub last_reg_failure_at: Option<DateTime<Utc>>,
    pub retransmit_count: u32,
    pub last_retransmit_at: Option<DateTime<Utc>>,
    pub accept_failure_count: u32,
    pub last_accept_failure_at: Option<DateTime<Utc>>,
    pub banned_at: Option<DateTime<Utc>>,
    pub ban_duration_minutes: i64,
    pub ban_reason: Option<BanReason>,
    pub ban_counts: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    RegisterFailure,
    Retransmit,
    AcceptFailure,
}

pub struct AbuseFilterConfigThresholds {
    pub reg_failure_threshold: u32,
    pub retransmit_threshold: u32,
    pub accept_failure_threshold: u32,
}

pub struct AbuseFilter {
    entries: DashMap<IpAddr, Arc<Mutex<BanEntry>>>,
    thresholds: AbuseFilterConfigThresholds,
    private_subnets: Vec<ipnet::IpNet>,
    clock: SharedClock,
}

impl AbuseFilter {
    pub fn new(
        thresholds: AbuseFilterConfigThresholds,
        private_subnets: &[String],
        clock: SharedClock,
    ) -> Self {
        let private_subnets = private_subnets
            .iter()
            .filter_map(|s| match s.parse::<ipnet::IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!(subnet = %s, error = %e, "ignoring malformed private subnet");
                    None
                }
            })
            .collect();
        Self {
            entries: DashMap::new(),
            thresholds,
            private_subnets,
            clock,
        }
    }

    pub fn is_private(&self, addr: IpAddr) -> bool {
        self.private_subnets.iter().any(|net| net.contains(&addr))
    }

    /// Returns the active ban reason, if `source` is currently banned.
    /// Clears the ban (and its counters) once `banDuration` has elapsed.
    pub fn is_banned(&self, source: IpAddr) -> Option<BanReason> {
        let entry = self.entries.get(&source)?;
        let mut guard = entry.lock();
        let now = self.clock.now();
        if let (Some(banned_at), Some(reason)) = (guard.banned_at, guard.ban_reason) {
            if now - banned_at > Duration::minutes(guard.ban_duration_minutes) {
                let ban_counts = guard.ban_counts;
                *guard = BanEntry {
                    ban_counts,
                    ..BanEntry::default()
                };
                return None;
            }
            return Some(reason);
        }
        None
    }

    /// Records a violation signal for `source`, crossing the ban
    /// threshold if applicable. `is_ip_literal` weights the hit by
    /// [`RULE_VIOLATION_COUNT_FOR_IPADDRESS`].
    pub fn record(&self, source: IpAddr, signal: Signal, is_ip_literal: bool) {
        if self.is_private(source) {
            return;
        }
        let weight = if is_ip_literal {
            RULE_VIOLATION_COUNT_FOR_IPADDRESS
        } else {
            1
        };

        let entry = self
            .entries
            .entry(source)
            .or_insert_with(|| Arc::new(Mutex::new(BanEntry::default())))
            .clone();
        let mut guard = entry.lock();
        let now = self.clock.now();

        let (count, last, threshold, reason) = match signal {
            Signal::RegisterFailure => (
                &mut guard.reg_failure_count,
                &mut guard.last_reg_failure_at,
                self.thresholds.reg_failure_threshold,
                BanReason::ExcessiveRegistrationFailures,
            ),
            Signal::Retransmit => (
                &mut guard.retransmit_count,
                &mut guard.last_retransmit_at,
                self.thresholds.retransmit_threshold,
                BanReason::ExcessiveRetransmits,
            ),
            Signal::AcceptFailure => (
                &mut guard.accept_failure_count,
                &mut guard.last_accept_failure_at,
                self.thresholds.accept_failure_threshold,
                BanReason::ExcessiveCallAcceptFailures,
            ),
        };

        if let Some(prev) = *last {
            if now - prev > Duration::seconds(BAN_RESET_WINDOW_SECS) {
                *count = 0;
            }
        }
        *count += weight;
        *last = Some(now);

        if *count >= threshold && guard.banned_at.is_none() {
            guard.ban_counts += 1;
            guard.banned_at = Some(now);
            guard.ban_duration_minutes = 5 * 2i64.pow(guard.ban_counts.saturating_sub(1));
            guard.ban_reason = Some(reason);
            warn!(source = %source, reason = reason.as_str(), "source banned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::sync::Arc as StdArc;

    fn filter(clock: SharedClock) -> AbuseFilter {
        AbuseFilter::new(
            AbuseFilterConfigThresholds {
                reg_failure_threshold: 5,
                retransmit_threshold: 20,
                accept_failure_threshold: 5,
            },
            &[],
            clock,
        )
    }

    #[test]
    fn bans_after_threshold_register_failures() {
        let clock = StdArc::new(FixedClock::new(Utc::now()));
        let filter = filter(clock.clone());
        let source: IpAddr = "203.0.113.7".parse().unwrap();

        for _ in 0..4 {
            filter.record(source, Signal::RegisterFailure, false);
            assert!(filter.is_banned(source).is_none());
        }
        filter.record(source, Signal::RegisterFailure, false);
        assert_eq!(
            filter.is_banned(source),
            Some(BanReason::ExcessiveRegistrationFailures)
        );
    }

    #[test]
    fn ip_literal_violation_counts_triple() {
        let clock = StdArc::new(FixedClock::new(Utc::now()));
        let filter = filter(clock);
        let source: IpAddr = "203.0.113.8".parse().unwrap();
        filter.record(source, Signal::RegisterFailure, true);
        filter.record(source, Signal::RegisterFailure, true);
        assert!(filter.is_banned(source).is_some());
    }

    #[test]
    fn ban_clears_and_duration_doubles_on_reoffense() {
        let clock = StdArc::new(FixedClock::new(Utc::now()));
        let filter = filter(clock.clone());
        let source: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..5 {
            filter.record(source, Signal::RegisterFailure, false);
        }
        assert!(filter.is_banned(source).is_some());

        clock.advance(Duration::minutes(6));
        assert!(filter.is_banned(source).is_none());

        for _ in 0..5 {
            filter.record(source, Signal::RegisterFailure, false);
        }
        let entry = filter.entries.get(&source).unwrap().clone();
        assert_eq!(entry.lock().ban_duration_minutes, 10);
    }

    #[test]
    fn private_subnet_is_exempt() {
        let clock = StdArc::new(FixedClock::new(Utc::now()));
        let filter = AbuseFilter::new(
            AbuseFilterConfigThresholds {
                reg_failure_threshold: 1,
                retransmit_threshold: 1,
                accept_failure_threshold: 1,
            },
            &["10.0.0.0/8".to_string()],
            clock,
        );
        let source: IpAddr = "10.1.2.3".parse().unwrap();
        filter.record(source, Signal::RegisterFailure, false);
        assert!(filter.is_banned(source).is_none());
    }
}
