#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

/// Coarse traffic classification used instead of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeIdentifier {
    PeerInternet,
    IncomingInternet,
    PeerLan,
    IncomingLan,
    PeerHost,
    IncomingHost,
    PeerInvalid,
    IncomingInvalid,
}

impl ScopeIdentifier {
    pub fn code(self) -> &'static str {
        match self {
            Self::PeerInternet => "PI",
            Self::IncomingInternet => "II",
            Self::PeerLan => "PL",
            Self::IncomingLan => "IL",
            Self::PeerHost => "PH",
            Self::IncomingHost => "IH",
            Self::PeerInvalid => "PX",
            Self::IncomingInvalid => "IX",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::PeerInternet => "Peer to Peer (Internet)",
            Self::IncomingInternet => "Internet Incoming",
            Self::PeerLan => "Peer to Peer (LAN)",
            Self::IncomingLan => "LAN Incoming",
            Self::PeerHost => "Localhost Peer to Peer",
            Self::IncomingHost => "Localhost Incoming",
            Self::PeerInvalid => "Peer to Peer (Invalid)",
            Self::IncomingInvalid => "Invalid Incoming",
        }
    }
}

impl FromStr for ScopeIdentifier {
    type Err = ();

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Ok(match code {
            "PI" => Self::PeerInternet,
            "II" => Self::IncomingInternet,
            "PL" => Self::PeerLan,
            "IL" => Self::IncomingLan,
            "PH" => Self::PeerHost,
            "IH" => Self::IncomingHost,
            "PX" => Self::PeerInvalid,
            "IX" => Self::IncomingInvalid,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for ScopeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    /// Registrable part, the last two labels.
    pub domain: String,
    pub subdomain: Option<String>,
}

/// Split a DNS name into its registrable domain and the rest. Does not know
/// about multi-label public suffixes.
pub fn parse_domain(name: &str) -> Option<Domain> {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        return None;
    }
    let labels: Vec<&str> = name.split('.').collect();
    let split = labels.len().saturating_sub(2);
    let subdomain = (split > 0).then(|| labels[..split].join("."));
    Some(Domain {
        domain: labels[split..].join("."),
        subdomain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_subdomain() {
        assert_eq!(
            parse_domain("www.api.example.com."),
            Some(Domain {
                domain: "example.com".into(),
                subdomain: Some("www.api".into())
            })
        );
        assert_eq!(
            parse_domain("example.com"),
            Some(Domain {
                domain: "example.com".into(),
                subdomain: None
            })
        );
        assert_eq!(parse_domain("."), None);
    }

    #[test]
    fn scope_codes_round_trip() {
        for code in ["PI", "II", "PL", "IL", "PH", "IH", "PX", "IX"] {
            assert_eq!(code.parse::<ScopeIdentifier>().unwrap().code(), code);
        }
        assert!("example.com".parse::<ScopeIdentifier>().is_err());
    }
}
