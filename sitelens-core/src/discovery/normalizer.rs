use std::sync::Arc;

use url::Url;
use uuid::Uuid;

use super::definitions::RouteDefinitionMatcher;
use crate::types::{Route, RouteId};

/// Extensions that never point at an auditable document.
const NON_DOCUMENT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "bmp", "pdf", "css", "js", "mjs",
    "json", "xml", "txt", "zip", "gz", "tar", "rar", "7z", "mp3", "mp4", "webm", "ogg", "wav",
    "mov", "avi", "woff", "woff2", "ttf", "otf", "eot", "map", "csv", "rss", "atom",
];

/// Canonicalizes raw URLs into same-origin [`Route`]s.
#[derive(Debug, Clone)]
pub struct RouteNormalizer {
    site: Url,
    origin: String,
    matcher: Option<Arc<dyn RouteDefinitionMatcher>>,
    keep_query: bool,
}

impl RouteNormalizer {
    pub fn new(site: Url) -> Self {
        let origin = site.origin().ascii_serialization();
        Self {
            site,
            origin,
            matcher: None,
            keep_query: false,
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn RouteDefinitionMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn keep_query(mut self, keep: bool) -> Self {
        self.keep_query = keep;
        self
    }

    pub fn site(&self) -> &Url {
        &self.site
    }

    pub fn matcher(&self) -> Option<&Arc<dyn RouteDefinitionMatcher>> {
        self.matcher.as_ref()
    }

    /// Route for the site root; always accepted.
    pub fn root(&self) -> Route {
        self.build_route("/".to_string(), "/")
    }

    /// Resolves `raw` against the site root and canonicalizes it. Returns
    /// `None` for other origins, non-http schemes and non-document resources.
    pub fn normalise(&self, raw: &str) -> Option<Route> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let url = self.site.join(raw).ok()?;
        if !matches!(url.scheme(), "http" | "https") || !self.same_origin(&url) {
            return None;
        }

        let path = collapse_path(url.path());
        if has_non_document_extension(&path) {
            return None;
        }

        let canonical = match url.query().filter(|_| self.keep_query) {
            Some(query) if !query.is_empty() => {
                let mut pairs: Vec<(String, String)> = url
                    .query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                pairs.sort();
                let sorted = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                format!("{path}?{sorted}")
            }
            _ => path.clone(),
        };

        Some(self.build_route(canonical, &path))
    }

    fn build_route(&self, canonical: String, path: &str) -> Route {
        let definition = self
            .matcher
            .as_ref()
            .and_then(|matcher| matcher.match_path(path));
        let dynamic = match &definition {
            Some(definition) => definition.is_dynamic(),
            None => path.split('/').any(looks_like_identifier),
        };
        Route {
            id: RouteId::from_path(&canonical),
            url: format!("{}{}", self.origin, canonical),
            path: canonical,
            dynamic,
            definition,
        }
    }

    fn same_origin(&self, url: &Url) -> bool {
        let (Some(theirs), Some(ours)) = (url.host_str(), self.site.host_str()) else {
            return false;
        };
        bare_host(theirs) == bare_host(ours)
            && url.port_or_known_default() == self.site.port_or_known_default()
    }
}

fn bare_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

fn collapse_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn has_non_document_extension(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            NON_DOCUMENT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        _ => false,
    }
}

fn looks_like_identifier(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    segment.chars().all(|c| c.is_ascii_digit())
        || Uuid::parse_str(segment).is_ok()
        || (segment.len() >= 16 && segment.chars().all(|c| c.is_ascii_hexdigit()))
}
