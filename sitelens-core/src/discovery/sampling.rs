use std::collections::{BTreeMap, HashMap};

use regex::Regex;

use super::filters::compile_path_pattern;
use crate::error::Result;
use crate::types::Route;

#[derive(Debug)]
struct SamplingRule {
    key: String,
    pattern: Regex,
    max: usize,
}

/// First-N cap per route group.
///
/// Explicit rules are checked in key order; the first matching rule decides.
/// Dynamic routes no rule covers fall back to the `dynamic_cap`, grouped by
/// [`Route::group_key`].
#[derive(Debug, Default)]
pub struct RouteSampler {
    rules: Vec<SamplingRule>,
    dynamic_cap: Option<usize>,
    counts: HashMap<String, usize>,
}

impl RouteSampler {
    pub fn new(rules: &BTreeMap<String, usize>, dynamic_cap: Option<usize>) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(key, max)| {
                Ok(SamplingRule {
                    key: key.clone(),
                    pattern: compile_path_pattern(key)?,
                    max: *max,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            dynamic_cap,
            counts: HashMap::new(),
        })
    }

    /// Group the route would be counted in, with its cap.
    fn group_for(&self, route: &Route) -> Option<(String, usize)> {
        if let Some(rule) = self.rules.iter().find(|r| r.pattern.is_match(&route.path)) {
            return Some((format!("rule:{}", rule.key), rule.max));
        }
        match self.dynamic_cap {
            Some(cap) if route.dynamic => Some((format!("dynamic:{}", route.group_key()), cap)),
            _ => None,
        }
    }

    /// Whether the route still fits in its group; does not count it.
    pub fn has_room(&self, route: &Route) -> bool {
        match self.group_for(route) {
            Some((group, max)) => self.counts.get(&group).copied().unwrap_or(0) < max,
            None => true,
        }
    }

    /// Counts an admitted route against its group.
    pub fn record(&mut self, route: &Route) {
        if let Some((group, _)) = self.group_for(route) {
            *self.counts.entry(group).or_default() += 1;
        }
    }
}
