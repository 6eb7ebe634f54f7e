use std::fmt;

use regex::Regex;

use crate::error::{Result, ScanError};
use crate::types::RouteDefinition;

/// Maps a canonical path onto one of the host's route definitions.
pub trait RouteDefinitionMatcher: Send + Sync + fmt::Debug {
    fn match_path(&self, path: &str) -> Option<RouteDefinition>;

    /// Every known definition, used to enumerate static routes.
    fn definitions(&self) -> Vec<RouteDefinition> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Specificity {
    Static,
    Dynamic,
    CatchAll,
}

#[derive(Debug)]
struct CompiledDefinition {
    definition: RouteDefinition,
    pattern: Regex,
    specificity: Specificity,
}

/// Route table built from path patterns such as `/blog/:slug`,
/// `/docs/[slug]` or `/a/[...rest]`.
///
/// Static definitions win over dynamic ones, catch-alls match last.
#[derive(Debug, Default)]
pub struct StaticRouteTable {
    entries: Vec<CompiledDefinition>,
}

impl StaticRouteTable {
    pub fn new(definitions: impl IntoIterator<Item = RouteDefinition>) -> Result<Self> {
        let mut entries = definitions
            .into_iter()
            .map(|definition| {
                let (pattern, specificity) = compile_pattern(&definition.path)?;
                Ok(CompiledDefinition {
                    definition,
                    pattern,
                    specificity,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.specificity);
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RouteDefinitionMatcher for StaticRouteTable {
    fn match_path(&self, path: &str) -> Option<RouteDefinition> {
        let path = path.split('?').next().unwrap_or(path);
        self.entries
            .iter()
            .find(|entry| entry.pattern.is_match(path))
            .map(|entry| entry.definition.clone())
    }

    fn definitions(&self) -> Vec<RouteDefinition> {
        self.entries
            .iter()
            .map(|entry| entry.definition.clone())
            .collect()
    }
}

fn compile_pattern(path: &str) -> Result<(Regex, Specificity)> {
    let mut source = String::from("^");
    let mut specificity = Specificity::Static;

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if let Some(inner) = segment
            .strip_prefix("[[...")
            .and_then(|s| s.strip_suffix("]]"))
        {
            if inner.is_empty() {
                return Err(invalid(path));
            }
            source.push_str("(?:/.*)?");
            specificity = Specificity::CatchAll;
        } else if let Some(inner) = segment
            .strip_prefix("[...")
            .and_then(|s| s.strip_suffix(']'))
        {
            if inner.is_empty() {
                return Err(invalid(path));
            }
            source.push_str("/.+");
            specificity = Specificity::CatchAll;
        } else if segment.starts_with(':')
            || (segment.starts_with('[') && segment.ends_with(']'))
        {
            if segment.len() < 2 || segment == "[]" {
                return Err(invalid(path));
            }
            source.push_str("/[^/]+");
            specificity = specificity.max(Specificity::Dynamic);
        } else {
            source.push('/');
            source.push_str(&regex::escape(segment));
        }
    }

    if source == "^" {
        source.push_str("/$");
    } else {
        source.push_str("/?$");
    }

    let pattern = Regex::new(&source).map_err(|e| {
        ScanError::ConfigValidation(format!("route pattern `{path}` does not compile: {e}"))
    })?;
    Ok((pattern, specificity))
}

fn invalid(path: &str) -> ScanError {
    ScanError::ConfigValidation(format!("route pattern `{path}` has an empty parameter"))
}
