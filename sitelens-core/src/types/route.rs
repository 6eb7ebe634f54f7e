use serde::{Deserialize, Serialize};

use super::ids::RouteId;

/// Host-supplied route definition (e.g. a framework page component).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Unique name used as the default sampling group.
    pub name: String,
    /// Path pattern such as `/blog/:slug`, `/docs/[slug]` or `/[...rest]`.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl RouteDefinition {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            component: None,
        }
    }

    /// True when the pattern contains at least one dynamic segment.
    pub fn is_dynamic(&self) -> bool {
        self.path
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.contains('['))
    }
}

/// A canonical, same-origin page of the scanned site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    /// Absolute URL that will be audited.
    pub url: String,
    /// Canonical path (plus sorted query when queries are kept).
    pub path: String,
    pub dynamic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<RouteDefinition>,
}

impl Route {
    pub fn group_key(&self) -> String {
        if let Some(definition) = &self.definition {
            return definition.name.clone();
        }
        match self.path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => format!("{}/*", &self.path[..idx]),
        }
    }
}
