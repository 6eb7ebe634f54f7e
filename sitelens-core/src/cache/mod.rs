//! Per-route artifact cache on top of `cacache`.

pub mod fingerprint;
pub mod store;

pub use fingerprint::CacheFingerprint;
pub use store::{ArtifactCache, AuditArtifact, PageSnapshot, RouteArtifacts};
