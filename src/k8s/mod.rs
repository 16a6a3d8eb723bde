pub mod broadcast;
pub mod capability;
pub mod change;
pub mod client;
pub mod connection;
pub mod diff;
pub mod discovery;
pub mod dynamic_cache;
pub mod engine;
pub mod kind;
pub mod snapshot;
pub mod system_monitor;
pub mod timeline;
pub mod transform;
pub mod typed_cache;

pub use broadcast::{Broadcaster, SubscriberMessage, Subscription};
pub use capability::{CapabilityProber, CapabilityQuery};
pub use client::{K8sClient, K8sContext};
pub use connection::{
    CollaboratorHooks, ConnectionController, ConnectionErrorType, ConnectionState, ConnectionStatus,
};
pub use discovery::ApiDiscovery;
pub use engine::Engine;
pub use kind::{ApiResourceDescriptor, Gvr};
pub use snapshot::{ResourceRef, ResourceSnapshot};