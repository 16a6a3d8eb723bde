//! Timeline Engine (C7, §4.7): the deduplicated, filtered, owner-enriched
//! log of resource changes and native cluster events. `store` holds the
//! core append/query logic, `historical` derives status-based ancillary
//! events, and `persist` is the optional durable single-file variant.

pub mod historical;
pub mod persist;
pub mod store;

pub use persist::TimelinePersistence;
pub use store::{
    EventSource, EventType, FilterPreset, Health, QueryOptions, TimelineEntry, TimelineEvent,
    TimelineMetrics, TimelineStore,
};
