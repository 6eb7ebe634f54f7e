use dashmap::DashMap;
use parking_lot::RwLock;

use crate::types::{Route, RouteId, RouteReport};

/// One [`RouteReport`] per route id, updated in place, listed in
/// first-enqueue order.
#[derive(Debug, Default)]
pub struct ReportRegistry {
    reports: DashMap<RouteId, RouteReport>,
    order: RwLock<Vec<RouteId>>,
}

impl ReportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the report for `route` unless one exists. Returns the current
    /// snapshot and whether it was created by this call.
    pub fn insert_if_absent(&self, route: Route) -> (RouteReport, bool) {
        let id = route.id.clone();
        let mut created = false;
        let snapshot = self
            .reports
            .entry(id.clone())
            .or_insert_with(|| {
                created = true;
                RouteReport::new(route)
            })
            .clone();
        if created {
            self.order.write().push(id);
        }
        (snapshot, created)
    }

    /// Mutates a report in place and returns the closure's result together
    /// with the snapshot taken after the mutation.
    pub fn update<R>(
        &self,
        id: &RouteId,
        f: impl FnOnce(&mut RouteReport) -> R,
    ) -> Option<(R, RouteReport)> {
        let mut entry = self.reports.get_mut(id)?;
        let result = f(entry.value_mut());
        Some((result, entry.value().clone()))
    }

    pub fn get(&self, id: &RouteId) -> Option<RouteReport> {
        self.reports.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &RouteId) -> bool {
        self.reports.contains_key(id)
    }

    pub fn list(&self) -> Vec<RouteReport> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn ids(&self) -> Vec<RouteId> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}
