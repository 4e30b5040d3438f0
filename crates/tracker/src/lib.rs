#![forbid(unsafe_code)]

pub mod domain;
pub mod engine;
pub mod error;
pub mod inspected;
pub mod process_group;
pub mod scope_group;
pub mod stats;

pub use engine::{Tracker, TrackerHandle, TrackerService, TrackerSnapshot};
pub use error::Error;
pub use inspected::{
    InspectEvent, InspectedProfile, InspectedSummary, ScopeChange, ScopeGroupUpdate,
};
pub use process_group::{ConnectionUpdate, ProcessGroup, ProcessGroupSummary};
pub use scope_group::{ConnectionFilter, ScopeGroup, ScopeSummary};
pub use stats::{ConnectionStatistics, StatisticsSummary};
