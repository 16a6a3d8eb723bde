//! `kordon_core`: local-first Kubernetes observability server core.
//!
//! The crate root wires together the resource cache engine (C1-C4), the
//! timeline and broadcaster (C7-C8) and the connection controller (C9)
//! that owns their lifecycle, plus the HTTP/SSE boundary that exposes them.

pub mod cleanup;
pub mod config;
pub mod errors;
pub mod http;
pub mod k8s;

pub use config::{CliArgs, Config, TimelineStorageKind};
pub use errors::{EngineError, EngineResult};
pub use k8s::{CollaboratorHooks, Engine};
