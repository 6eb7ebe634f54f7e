//! Route discovery: sitemap walking, crawl feedback and static route tables,
//! all funnelled through one normalizer and one dedup frontier.

pub mod definitions;
pub mod filters;
pub mod frontier;
pub mod normalizer;
pub mod sampling;
pub mod sitemap;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use definitions::{RouteDefinitionMatcher, StaticRouteTable};
pub use filters::RouteFilter;
pub use frontier::{Admission, RouteFrontier};
pub use normalizer::RouteNormalizer;
pub use sampling::RouteSampler;

use crate::error::Result;
use crate::fetch::DocumentFetcher;
use crate::orchestration::config::{DiscoveryConfig, DiscoveryMode};
use crate::types::Route;

/// Nested sitemap indexes are followed this many levels deep.
pub const MAX_SITEMAP_DEPTH: usize = 3;

#[derive(Debug)]
pub struct RouteDiscovery {
    config: DiscoveryConfig,
    normalizer: RouteNormalizer,
    fetcher: Arc<dyn DocumentFetcher>,
    frontier: RouteFrontier,
}

impl RouteDiscovery {
    pub fn new(
        config: &DiscoveryConfig,
        normalizer: RouteNormalizer,
        fetcher: Arc<dyn DocumentFetcher>,
    ) -> Result<Self> {
        let filter = RouteFilter::new(&config.include, &config.exclude)?;
        let sampler = RouteSampler::new(&config.sampling, config.dynamic_sampling)?;
        Ok(Self {
            config: config.clone(),
            normalizer,
            fetcher,
            frontier: RouteFrontier::new(filter, sampler, config.max_routes),
        })
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.config.mode
    }

    pub fn normalizer(&self) -> &RouteNormalizer {
        &self.normalizer
    }

    pub fn frontier(&self) -> &RouteFrontier {
        &self.frontier
    }

    /// Produces the initial route set. Fetch failures are logged and leave a
    /// partial set; this never fails the scan.
    pub async fn discover(&self) -> Vec<Route> {
        let mut routes = Vec::new();

        let root = self.normalizer.root();
        if self.frontier.force_admit(&root) == Admission::Accepted {
            routes.push(root);
        }

        match self.config.mode {
            DiscoveryMode::Sitemap => self.walk_sitemaps(&mut routes).await,
            DiscoveryMode::Crawl => {}
            DiscoveryMode::StaticDefinitions => self.enumerate_definitions(&mut routes),
        }

        for raw in &self.config.urls {
            self.offer(raw, &mut routes);
        }

        info!(
            target: "scan::discovery",
            mode = ?self.config.mode,
            routes = routes.len(),
            cap = self.frontier.max_routes(),
            "route discovery finished"
        );
        routes
    }

    /// Crawl feedback from the link-extract stage. Returns the routes that
    /// were not seen before and still fit under the cap; always empty
    /// outside crawl mode.
    pub fn offer_links(&self, links: &[String]) -> Vec<Route> {
        if self.config.mode != DiscoveryMode::Crawl {
            return Vec::new();
        }
        let mut accepted = Vec::new();
        for link in links {
            if self.frontier.is_full() {
                debug!(target: "scan::discovery", "route cap reached, dropping crawl feedback");
                break;
            }
            self.offer(link, &mut accepted);
        }
        accepted
    }

    fn offer(&self, raw: &str, out: &mut Vec<Route>) {
        let Some(route) = self.normalizer.normalise(raw) else {
            return;
        };
        match self.frontier.admit(&route) {
            Admission::Accepted => out.push(route),
            Admission::Duplicate => {}
            other => {
                debug!(target: "scan::discovery", path = %route.path, admission = ?other, "route skipped")
            }
        }
    }

    async fn sitemap_locations(&self) -> Vec<String> {
        let site = self.normalizer.site();
        let mut locations = Vec::new();

        if let Ok(robots_url) = site.join("/robots.txt") {
            match self.fetcher.fetch(robots_url.as_str()).await {
                Ok(doc) if doc.is_success() => {
                    locations.extend(sitemap::robots_sitemaps(&doc.body))
                }
                Ok(doc) => {
                    debug!(target: "scan::discovery", status = doc.status, "no robots.txt")
                }
                Err(err) => {
                    warn!(target: "scan::discovery", error = %err, "robots.txt fetch failed")
                }
            }
        }

        for path in &self.config.sitemap_paths {
            if let Ok(url) = site.join(path) {
                locations.push(url.to_string());
            }
        }
        locations
    }

    async fn walk_sitemaps(&self, routes: &mut Vec<Route>) {
        let mut queue: VecDeque<(String, usize)> = self
            .sitemap_locations()
            .await
            .into_iter()
            .map(|loc| (loc, 0))
            .collect();
        let mut visited = HashSet::new();

        while let Some((location, depth)) = queue.pop_front() {
            if !visited.insert(location.clone()) {
                continue;
            }
            if self.frontier.is_full() {
                break;
            }

            let doc = match self.fetcher.fetch(&location).await {
                Ok(doc) if doc.is_success() => doc,
                Ok(doc) => {
                    warn!(target: "scan::discovery", %location, status = doc.status, "sitemap unavailable");
                    continue;
                }
                Err(err) => {
                    warn!(target: "scan::discovery", %location, error = %err, "sitemap fetch failed");
                    continue;
                }
            };

            let parsed = sitemap::parse_sitemap(&doc.body);
            debug!(
                target: "scan::discovery",
                %location,
                depth,
                urls = parsed.urls.len(),
                nested = parsed.sitemaps.len(),
                "parsed sitemap"
            );
            for url in &parsed.urls {
                self.offer(url, routes);
            }
            if depth < MAX_SITEMAP_DEPTH {
                queue.extend(parsed.sitemaps.into_iter().map(|loc| (loc, depth + 1)));
            } else if !parsed.sitemaps.is_empty() {
                warn!(target: "scan::discovery", %location, "sitemap index nested too deep, ignoring children");
            }
        }
    }

    fn enumerate_definitions(&self, routes: &mut Vec<Route>) {
        let Some(matcher) = self.normalizer.matcher() else {
            warn!(target: "scan::discovery", "static-definitions mode without a route table");
            return;
        };
        for definition in matcher.definitions() {
            if definition.is_dynamic() {
                continue;
            }
            self.offer(&definition.path, routes);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use url::Url;

    use super::*;
    use crate::testing::StaticSiteFetcher;
    use crate::types::RouteDefinition;

    fn site() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    fn discovery(config: DiscoveryConfig, fetcher: StaticSiteFetcher) -> RouteDiscovery {
        RouteDiscovery::new(&config, RouteNormalizer::new(site()), Arc::new(fetcher)).unwrap()
    }

    fn paths(routes: &[Route]) -> Vec<&str> {
        routes.iter().map(|r| r.path.as_str()).collect()
    }

    #[tokio::test]
    async fn sitemap_index_and_robots_are_followed() {
        let fetcher = StaticSiteFetcher::new()
            .with_page(
                "https://example.com/robots.txt",
                "User-agent: *\nSitemap: https://example.com/index.xml\n",
            )
            .with_page(
                "https://example.com/index.xml",
                "<sitemapindex><sitemap><loc>https://example.com/pages.xml</loc></sitemap></sitemapindex>",
            )
            .with_page(
                "https://example.com/pages.xml",
                "<urlset><url><loc>https://example.com/about</loc></url><url><loc>https://example.com/blog/</loc></url><url><loc>https://example.com/about#team</loc></url></urlset>",
            );
        let routes = discovery(DiscoveryConfig::default(), fetcher).discover().await;
        assert_eq!(paths(&routes), vec!["/", "/about", "/blog"]);
    }

    #[tokio::test]
    async fn unreachable_sitemap_degrades_to_root() {
        let routes = discovery(DiscoveryConfig::default(), StaticSiteFetcher::new())
            .discover()
            .await;
        assert_eq!(paths(&routes), vec!["/"]);
    }

    #[tokio::test]
    async fn sampling_and_exclude_apply_to_sitemap_entries() {
        let urls: String = (0..5)
            .map(|i| format!("<url><loc>https://example.com/blog/post-{i}</loc></url>"))
            .chain(std::iter::once(
                "<url><loc>https://example.com/admin</loc></url>".to_string(),
            ))
            .collect();
        let fetcher = StaticSiteFetcher::new()
            .with_page("https://example.com/sitemap.xml", format!("<urlset>{urls}</urlset>"));
        let config = DiscoveryConfig {
            exclude: vec!["/admin".into()],
            sampling: BTreeMap::from([("/blog/*".to_string(), 2)]),
            ..DiscoveryConfig::default()
        };
        let routes = discovery(config, fetcher).discover().await;
        assert_eq!(paths(&routes), vec!["/", "/blog/post-0", "/blog/post-1"]);
    }

    #[test]
    fn crawl_feedback_never_exceeds_cap() {
        let config = DiscoveryConfig {
            mode: DiscoveryMode::Crawl,
            max_routes: 3,
            ..DiscoveryConfig::default()
        };
        let discovery = discovery(config, StaticSiteFetcher::new());
        discovery.frontier().force_admit(&discovery.normalizer().root());

        let links: Vec<String> = (0..10).map(|i| format!("https://example.com/p{i}")).collect();
        let first = discovery.offer_links(&links);
        assert_eq!(first.len(), 2);
        assert!(discovery.offer_links(&links).is_empty());
        assert_eq!(discovery.frontier().len(), 3);
    }

    #[test]
    fn offer_links_is_inert_outside_crawl_mode() {
        let discovery = discovery(DiscoveryConfig::default(), StaticSiteFetcher::new());
        assert!(
            discovery
                .offer_links(&["https://example.com/new".to_string()])
                .is_empty()
        );
    }

    #[tokio::test]
    async fn static_definitions_enumerate_non_dynamic_routes() {
        let table = StaticRouteTable::new([
            RouteDefinition::new("home", "/"),
            RouteDefinition::new("pricing", "/pricing"),
            RouteDefinition::new("post", "/blog/:slug"),
        ])
        .unwrap();
        let config = DiscoveryConfig {
            mode: DiscoveryMode::StaticDefinitions,
            urls: vec!["/blog/hello".into()],
            ..DiscoveryConfig::default()
        };
        let normalizer = RouteNormalizer::new(site()).with_matcher(Arc::new(table));
        let discovery =
            RouteDiscovery::new(&config, normalizer, Arc::new(StaticSiteFetcher::new())).unwrap();
        let routes = discovery.discover().await;
        assert_eq!(paths(&routes), vec!["/", "/pricing", "/blog/hello"]);
        assert!(routes[2].dynamic);
        assert_eq!(routes[2].definition.as_ref().unwrap().name, "post");
    }
}
