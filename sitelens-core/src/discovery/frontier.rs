use std::collections::HashSet;

use parking_lot::Mutex;

use super::filters::RouteFilter;
use super::sampling::RouteSampler;
use crate::types::{Route, RouteId};

/// Why a candidate route was or was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate,
    Filtered,
    Sampled,
    CapReached,
}

#[derive(Debug)]
struct FrontierState {
    seen: HashSet<RouteId>,
    sampler: RouteSampler,
}

/// Shared dedup set for every route source of a scan (sitemap entries,
/// static definitions and crawl feedback), bounded by `max_routes`.
#[derive(Debug)]
pub struct RouteFrontier {
    filter: RouteFilter,
    max_routes: usize,
    state: Mutex<FrontierState>,
}

impl RouteFrontier {
    pub fn new(filter: RouteFilter, sampler: RouteSampler, max_routes: usize) -> Self {
        Self {
            filter,
            max_routes,
            state: Mutex::new(FrontierState {
                seen: HashSet::new(),
                sampler,
            }),
        }
    }

    /// Filter, dedup, sampling and cap checks happen under one lock so
    /// concurrent crawl feedback can never push the set past the cap.
    pub fn admit(&self, route: &Route) -> Admission {
        if !self.filter.allows(&route.path) {
            return Admission::Filtered;
        }
        let mut state = self.state.lock();
        if state.seen.contains(&route.id) {
            return Admission::Duplicate;
        }
        if state.seen.len() >= self.max_routes {
            return Admission::CapReached;
        }
        if !state.sampler.has_room(route) {
            return Admission::Sampled;
        }
        state.sampler.record(route);
        state.seen.insert(route.id.clone());
        Admission::Accepted
    }

    /// Admits a route regardless of filters and sampling (the site root).
    pub fn force_admit(&self, route: &Route) -> Admission {
        let mut state = self.state.lock();
        if state.seen.contains(&route.id) {
            return Admission::Duplicate;
        }
        if state.seen.len() >= self.max_routes {
            return Admission::CapReached;
        }
        state.seen.insert(route.id.clone());
        Admission::Accepted
    }

    pub fn contains(&self, id: &RouteId) -> bool {
        self.state.lock().seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_routes
    }

    pub fn max_routes(&self) -> usize {
        self.max_routes
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;

    fn route(path: &str) -> Route {
        Route {
            id: RouteId::from_path(path),
            url: format!("https://example.com{path}"),
            path: path.into(),
            dynamic: false,
            definition: None,
        }
    }

    fn frontier(max: usize) -> RouteFrontier {
        RouteFrontier::new(
            RouteFilter::default(),
            RouteSampler::new(&BTreeMap::new(), None).unwrap(),
            max,
        )
    }

    #[test]
    fn deduplicates_and_caps() {
        let f = frontier(2);
        assert_eq!(f.admit(&route("/a")), Admission::Accepted);
        assert_eq!(f.admit(&route("/a")), Admission::Duplicate);
        assert_eq!(f.admit(&route("/b")), Admission::Accepted);
        assert_eq!(f.admit(&route("/c")), Admission::CapReached);
        assert!(f.is_full());
    }

    #[test]
    fn concurrent_admission_respects_cap() {
        let f = Arc::new(frontier(10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|i| f.admit(&route(&format!("/t{t}/{i}"))) == Admission::Accepted)
                        .count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 10);
        assert_eq!(f.len(), 10);
    }
}
