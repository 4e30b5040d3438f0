#![forbid(unsafe_code)]

use crate::domain::{Connection, IP_PROTOCOL_TCP, IP_PROTOCOL_UDP};
use serde::Serialize;
use std::collections::BTreeMap;

/// Running counters over a set of connections.
///
/// `remove` exactly undoes a previous `update` of the same record, so the
/// counters always describe the records currently held. Internal records
/// only move `count_internal`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    distinct_ips: BTreeMap<String, usize>,
    distinct_countries: BTreeMap<String, usize>,
    distinct_asns: BTreeMap<String, usize>,
    started: BTreeMap<i64, usize>,
    pub count_tcp: usize,
    pub count_udp: usize,
    pub count_dns: usize,
    pub count_encrypted: usize,
    pub count_accepted: usize,
    pub count_internal: usize,
}

/// Flat copy of the counters, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSummary {
    pub distinct_ips: usize,
    pub distinct_countries: usize,
    pub distinct_asns: usize,
    pub first_connection: Option<i64>,
    pub last_connection: Option<i64>,
    pub tcp: usize,
    pub udp: usize,
    pub dns: usize,
    pub encrypted: usize,
    pub accepted: usize,
    pub internal: usize,
}

fn increment(map: &mut BTreeMap<String, usize>, key: String) {
    *map.entry(key).or_default() += 1;
}

fn decrement(map: &mut BTreeMap<String, usize>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            map.remove(key);
        }
    }
}

impl ConnectionStatistics {
    pub fn update(&mut self, conn: &Connection) {
        if conn.internal {
            self.count_internal += 1;
            return;
        }

        if let Some(entity) = &conn.entity {
            if entity.asn != 0 {
                increment(&mut self.distinct_asns, format!("AS{}", entity.asn));
            }
            if entity.ip.is_empty() {
                self.count_dns += 1;
            } else {
                increment(&mut self.distinct_ips, entity.ip.clone());
            }
            if !entity.country.is_empty() {
                increment(&mut self.distinct_countries, entity.country.clone());
            }
        }

        *self.started.entry(conn.started).or_default() += 1;

        if conn.is_accepted() {
            self.count_accepted += 1;
        }
        if conn.encrypted {
            self.count_encrypted += 1;
        }
        match conn.ip_protocol {
            IP_PROTOCOL_TCP => self.count_tcp += 1,
            IP_PROTOCOL_UDP => self.count_udp += 1,
            _ => {}
        }
    }

    pub fn remove(&mut self, conn: &Connection) {
        if conn.internal {
            self.count_internal = self.count_internal.saturating_sub(1);
            return;
        }

        if let Some(entity) = &conn.entity {
            if entity.asn != 0 {
                decrement(&mut self.distinct_asns, &format!("AS{}", entity.asn));
            }
            if entity.ip.is_empty() {
                self.count_dns = self.count_dns.saturating_sub(1);
            } else {
                decrement(&mut self.distinct_ips, &entity.ip);
            }
            if !entity.country.is_empty() {
                decrement(&mut self.distinct_countries, &entity.country);
            }
        }

        if let Some(count) = self.started.get_mut(&conn.started) {
            *count -= 1;
            if *count == 0 {
                self.started.remove(&conn.started);
            }
        }

        if conn.is_accepted() {
            self.count_accepted = self.count_accepted.saturating_sub(1);
        }
        if conn.encrypted {
            self.count_encrypted = self.count_encrypted.saturating_sub(1);
        }
        match conn.ip_protocol {
            IP_PROTOCOL_TCP => self.count_tcp = self.count_tcp.saturating_sub(1),
            IP_PROTOCOL_UDP => self.count_udp = self.count_udp.saturating_sub(1),
            _ => {}
        }
    }

    pub fn first_connection(&self) -> Option<i64> {
        self.started.keys().next().copied()
    }

    pub fn last_connection(&self) -> Option<i64> {
        self.started.keys().next_back().copied()
    }

    pub fn distinct_ips(&self) -> &BTreeMap<String, usize> {
        &self.distinct_ips
    }

    pub fn distinct_countries(&self) -> &BTreeMap<String, usize> {
        &self.distinct_countries
    }

    pub fn distinct_asns(&self) -> &BTreeMap<String, usize> {
        &self.distinct_asns
    }

    pub fn summary(&self) -> StatisticsSummary {
        StatisticsSummary {
            distinct_ips: self.distinct_ips.len(),
            distinct_countries: self.distinct_countries.len(),
            distinct_asns: self.distinct_asns.len(),
            first_connection: self.first_connection(),
            last_connection: self.last_connection(),
            tcp: self.count_tcp,
            udp: self.count_udp,
            dns: self.count_dns,
            encrypted: self.count_encrypted,
            accepted: self.count_accepted,
            internal: self.count_internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Entity, Verdict};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn conn(ip: &str, country: &str, asn: u32, protocol: u16, started: i64) -> Connection {
        Connection {
            id: format!("{ip}-{started}"),
            ip_protocol: protocol,
            started,
            entity: Some(Entity {
                ip: ip.into(),
                country: country.into(),
                asn,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn counts_entities_and_protocols() {
        let mut stats = ConnectionStatistics::default();
        let mut accepted = conn("1.1.1.1", "AU", 13335, IP_PROTOCOL_UDP, 20);
        accepted.verdict = Verdict::Accept;
        accepted.encrypted = true;
        stats.update(&accepted);
        stats.update(&conn("1.1.1.1", "AU", 13335, IP_PROTOCOL_TCP, 10));
        stats.update(&conn("", "", 0, 0, 30));

        assert_eq!(stats.distinct_ips().get("1.1.1.1"), Some(&2));
        assert_eq!(stats.distinct_asns().get("AS13335"), Some(&2));
        assert_eq!(stats.count_dns, 1);
        assert_eq!((stats.count_tcp, stats.count_udp), (1, 1));
        assert_eq!((stats.count_accepted, stats.count_encrypted), (1, 1));
        assert_eq!(stats.first_connection(), Some(10));
        assert_eq!(stats.last_connection(), Some(30));
    }

    #[test]
    fn internal_records_only_count_as_internal() {
        let mut stats = ConnectionStatistics::default();
        let mut internal = conn("10.0.0.1", "", 0, IP_PROTOCOL_TCP, 5);
        internal.internal = true;
        internal.verdict = Verdict::Accept;

        stats.update(&internal);
        assert_eq!(stats.count_internal, 1);
        assert_eq!(stats.summary().tcp, 0);
        assert!(stats.distinct_ips().is_empty());

        stats.remove(&internal);
        assert_eq!(stats, ConnectionStatistics::default());
    }

    fn arb_conn() -> impl Strategy<Value = Connection> {
        (
            prop_oneof![Just(""), Just("1.1.1.1"), Just("8.8.8.8")],
            prop_oneof![Just(""), Just("DE"), Just("US")],
            0u32..3,
            prop_oneof![Just(0u16), Just(IP_PROTOCOL_TCP), Just(IP_PROTOCOL_UDP)],
            0i64..5,
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(ip, country, asn, protocol, started, accepted, internal)| {
                let mut c = conn(ip, country, asn, protocol, started);
                c.internal = internal;
                if accepted {
                    c.verdict = Verdict::Accept;
                }
                c
            })
    }

    proptest! {
        #[test]
        fn remove_undoes_update(conns in prop::collection::vec(arb_conn(), 0..16)) {
            let mut stats = ConnectionStatistics::default();
            for c in &conns {
                stats.update(c);
            }
            for c in conns.iter().rev() {
                stats.remove(c);
            }
            prop_assert_eq!(stats, ConnectionStatistics::default());
        }
    }
}
