#![forbid(unsafe_code)]

mod connection;
mod profile;
mod scope;

pub use connection::{
    Connection, Entity, IP_PROTOCOL_TCP, IP_PROTOCOL_UDP, ProcessContext, UnknownVerdict, Verdict,
    is_process_record,
};
pub use profile::{AppProfile, BlockStatus, LayeredProfile};
pub use scope::{Domain, ScopeIdentifier, parse_domain};
