use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Number of hex characters kept from the SHA-256 of a canonical path.
const ROUTE_ID_LEN: usize = 16;

/// Stable identifier of a route, derived from its canonical path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    /// Hashes a canonical path. Callers are expected to pass the output of
    /// the normalizer; equal paths always give equal ids.
    pub fn from_path(canonical_path: &str) -> Self {
        let digest = Sha256::digest(canonical_path.as_bytes());
        let mut encoded = hex::encode(digest);
        encoded.truncate(ROUTE_ID_LEN);
        RouteId(encoded)
    }

    /// Wraps an id received from the outside (e.g. an HTTP path segment).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        (raw.len() == ROUTE_ID_LEN && raw.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| RouteId(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanId(pub Uuid);

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanId {
    pub fn new() -> Self {
        ScanId(Uuid::now_v7())
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_id_is_stable_for_equal_paths() {
        let a = RouteId::from_path("/blog/hello");
        let b = RouteId::from_path("/blog/hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ROUTE_ID_LEN);
        assert_ne!(a, RouteId::from_path("/blog/hello-world"));
    }

    #[test]
    fn parse_accepts_only_route_id_shapes() {
        let id = RouteId::from_path("/");
        assert_eq!(RouteId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(RouteId::parse(&id.as_str().to_uppercase()), Some(id));
        assert!(RouteId::parse("not-an-id").is_none());
        assert!(RouteId::parse("").is_none());
    }
}
