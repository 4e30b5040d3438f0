#![forbid(unsafe_code)]

use portapi::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const IP_PROTOCOL_TCP: u16 = 6;
pub const IP_PROTOCOL_UDP: u16 = 17;

#[derive(Debug, thiserror::Error)]
#[error("unknown verdict {0}")]
pub struct UnknownVerdict(pub u8);

/// Final decision the backend took on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Verdict {
    #[default]
    Undecided,
    Undeterminable,
    Accept,
    Block,
    Drop,
    RerouteToNameserver,
    RerouteToTunnel,
    Failed,
}

impl TryFrom<u8> for Verdict {
    type Error = UnknownVerdict;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Undecided,
            1 => Self::Undeterminable,
            2 => Self::Accept,
            3 => Self::Block,
            4 => Self::Drop,
            5 => Self::RerouteToNameserver,
            6 => Self::RerouteToTunnel,
            7 => Self::Failed,
            other => return Err(UnknownVerdict(other)),
        })
    }
}

impl From<Verdict> for u8 {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Undecided => 0,
            Verdict::Undeterminable => 1,
            Verdict::Accept => 2,
            Verdict::Block => 3,
            Verdict::Drop => 4,
            Verdict::RerouteToNameserver => 5,
            Verdict::RerouteToTunnel => 6,
            Verdict::Failed => 7,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undecided => "undecided",
            Self::Undeterminable => "undeterminable",
            Self::Accept => "accept",
            Self::Block => "block",
            Self::Drop => "drop",
            Self::RerouteToNameserver => "reroute-to-nameserver",
            Self::RerouteToTunnel => "reroute-to-tunnel",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Remote side of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Entity {
    pub protocol: u16,
    pub port: u16,
    pub domain: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub country: String,
    #[serde(rename = "ASN")]
    pub asn: u32,
    #[serde(rename = "ASOrg")]
    pub as_org: String,
}

/// The process, and through it the profile, that owns a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessContext {
    pub binary_path: String,
    pub process_name: String,
    pub profile_name: String,
    #[serde(rename = "PID")]
    pub pid: i64,
    pub profile: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Connection {
    #[serde(rename = "ID")]
    pub id: String,
    /// A [`ScopeIdentifier`](super::ScopeIdentifier) code or a domain name.
    pub scope: String,
    #[serde(rename = "IPVersion")]
    pub ip_version: u8,
    pub inbound: bool,
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: u16,
    #[serde(rename = "LocalIP")]
    pub local_ip: String,
    pub local_port: u16,
    pub entity: Option<Entity>,
    pub verdict: Verdict,
    /// Seconds since the epoch.
    pub started: i64,
    /// Seconds since the epoch, 0 while the connection is open.
    pub ended: i64,
    pub tunneled: bool,
    pub encrypted: bool,
    pub internal: bool,
    pub process_context: Option<ProcessContext>,
    pub profile_revision_counter: i64,
}

impl Connection {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }

    pub fn is_open(&self) -> bool {
        self.ended == 0
    }

    /// Profile id of the owner, if the record carries one.
    pub fn profile_id(&self) -> Option<&str> {
        self.process_context
            .as_ref()
            .map(|ctx| ctx.profile.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// The `network:` prefix also carries process records; they have a `CmdLine`.
pub fn is_process_record(payload: &Payload) -> bool {
    payload
        .as_json()
        .and_then(serde_json::Value::as_object)
        .is_some_and(|fields| fields.contains_key("CmdLine"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_backend_record() {
        let record = json!({
            "ID": "c1",
            "Scope": "example.com.",
            "IPVersion": 4,
            "Inbound": false,
            "IPProtocol": 6,
            "Entity": {"IP": "93.184.216.34", "Country": "US", "ASN": 15133, "CNAME": null},
            "Verdict": 3,
            "Started": 1700000000,
            "Ended": 0,
            "Encrypted": true,
            "ProcessContext": {
                "Profile": "p1",
                "ProfileName": "Firefox",
                "Source": "local",
                "PID": 42
            },
            "ProfileRevisionCounter": 0,
            "Unrelated": "ignored"
        });

        let conn: Connection = serde_json::from_value(record).unwrap();
        assert_eq!(conn.verdict, Verdict::Block);
        assert_eq!(conn.profile_id(), Some("p1"));
        assert_eq!(conn.entity.as_ref().map(|e| e.asn), Some(15133));
        assert!(conn.is_open());
        assert!(!conn.is_accepted());
    }

    #[test]
    fn rejects_unknown_verdict() {
        let err = serde_json::from_value::<Connection>(json!({"Verdict": 42})).unwrap_err();
        assert!(err.to_string().contains("unknown verdict 42"));
    }

    #[test]
    fn verdict_codes_round_trip() {
        for code in 0u8..=7 {
            assert_eq!(u8::from(Verdict::try_from(code).unwrap()), code);
        }
    }

    #[test]
    fn detects_process_records() {
        assert!(is_process_record(&Payload::Json(json!({"CmdLine": "/bin/true"}))));
        assert!(!is_process_record(&Payload::Json(json!({"ID": "c1"}))));
        assert!(!is_process_record(&Payload::Raw("CmdLine".into())));
    }
}
