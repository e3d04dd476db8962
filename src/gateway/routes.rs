//! Route table: priced rules binding `(method, path_template)` to upstream
//! providers. Dispatch is longest-match over compiled templates; mutations
//! swap a copy-on-write snapshot so in-flight requests keep a consistent view.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::utils::usdc::parse_usdc;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteAuth {
    pub header: String,
    pub value: String,
}

/// One priced gateway rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub tool_id: String,
    pub method: String,
    /// Path template; `:name` segments bind parameters.
    pub path: String,
    /// Decimal USDC price per call; `"0"` is free.
    pub price_usdc: String,
    pub provider_id: String,
    pub backend_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RouteAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Restricted rules never match gateway dispatch; admin-only visibility.
    #[serde(default)]
    pub restricted: bool,
    /// Escape hatch for test routes pointing at private hosts.
    #[serde(default, rename = "_skip_ssrf")]
    pub skip_ssrf: bool,
}

impl RouteRule {
    /// Static validation: shape only, no network I/O.
    pub fn validate(&self) -> Result<(), RouteError> {
        if self.tool_id.trim().is_empty() {
            return Err(RouteError::Invalid("tool_id must not be empty".into()));
        }
        let method = self.method.to_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(RouteError::Invalid(format!(
                "method {} is not supported",
                self.method
            )));
        }
        if !self.path.starts_with('/') {
            return Err(RouteError::Invalid("path must start with '/'".into()));
        }
        if let Err(e) = parse_usdc(&self.price_usdc) {
            return Err(RouteError::Invalid(format!("price_usdc: {}", e)));
        }
        if self.backend_url.trim().is_empty() {
            return Err(RouteError::Invalid("backend_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn price_micros(&self) -> u64 {
        parse_usdc(&self.price_usdc).unwrap_or(0)
    }

    /// Listing view with the provider auth secret redacted.
    pub fn redacted(&self) -> RouteRule {
        let mut rule = self.clone();
        if let Some(auth) = rule.auth.as_mut() {
            auth.value = "***".to_string();
        }
        rule
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteError {
    DuplicateToolId(String),
    UnknownToolId(String),
    Invalid(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::DuplicateToolId(id) => write!(f, "tool_id {} already registered", id),
            RouteError::UnknownToolId(id) => write!(f, "tool_id {} not found", id),
            RouteError::Invalid(msg) => write!(f, "invalid route: {}", msg),
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    rule: Arc<RouteRule>,
    method: String,
    segments: Vec<Segment>,
    /// Number of leading literal segments; primary tie-break.
    literal_prefix: usize,
    /// Total literal segments; secondary tie-break.
    literal_count: usize,
    /// Registration order; final tie-break.
    index: usize,
}

fn compile_segments(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if let Some(name) = s.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(s.to_string())
            }
        })
        .collect()
}

/// Immutable compiled dispatch structure; one snapshot per table version.
#[derive(Debug, Default)]
pub struct CompiledTable {
    routes: Vec<CompiledRoute>,
}

#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub rule: Arc<RouteRule>,
    pub params: HashMap<String, String>,
}

impl CompiledTable {
    fn compile(rules: &[Arc<RouteRule>]) -> Self {
        let routes = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let segments = compile_segments(&rule.path);
                let literal_prefix = segments
                    .iter()
                    .take_while(|s| matches!(s, Segment::Literal(_)))
                    .count();
                let literal_count = segments
                    .iter()
                    .filter(|s| matches!(s, Segment::Literal(_)))
                    .count();
                CompiledRoute {
                    method: rule.method.to_uppercase(),
                    segments,
                    literal_prefix,
                    literal_count,
                    index,
                    rule: rule.clone(),
                }
            })
            .collect();
        Self { routes }
    }

    /// Longest-match dispatch. Restricted rules behave as non-existent here.
    pub fn match_route(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let method = method.to_uppercase();
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut best: Option<(&CompiledRoute, HashMap<String, String>)> = None;
        for route in &self.routes {
            if route.rule.restricted || route.method != method {
                continue;
            }
            if route.segments.len() != parts.len() {
                continue;
            }
            let mut params = HashMap::new();
            let mut matched = true;
            for (segment, part) in route.segments.iter().zip(&parts) {
                match segment {
                    Segment::Literal(lit) => {
                        if lit != part {
                            matched = false;
                            break;
                        }
                    }
                    Segment::Param(name) => {
                        params.insert(name.clone(), (*part).to_string());
                    }
                }
            }
            if !matched {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    (route.literal_prefix, route.literal_count, std::cmp::Reverse(route.index))
                        > (
                            current.literal_prefix,
                            current.literal_count,
                            std::cmp::Reverse(current.index),
                        )
                }
            };
            if better {
                best = Some((route, params));
            }
        }

        best.map(|(route, params)| RouteMatch {
            rule: route.rule.clone(),
            params,
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Copy-on-write route table. Readers take an `Arc` snapshot; admin
/// mutations rebuild and swap it atomically.
pub struct RouteTable {
    rules: RwLock<Vec<Arc<RouteRule>>>,
    snapshot: RwLock<Arc<CompiledTable>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            snapshot: RwLock::new(Arc::new(CompiledTable::default())),
        }
    }

    pub fn from_rules(rules: Vec<RouteRule>) -> Result<Self, RouteError> {
        let table = Self::new();
        for rule in rules {
            table.insert(rule)?;
        }
        Ok(table)
    }

    pub fn snapshot(&self) -> Arc<CompiledTable> {
        self.snapshot.read().unwrap().clone()
    }

    pub fn list(&self) -> Vec<RouteRule> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .map(|r| (**r).clone())
            .collect()
    }

    pub fn get(&self, tool_id: &str) -> Option<RouteRule> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .find(|r| r.tool_id == tool_id)
            .map(|r| (**r).clone())
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, rule: RouteRule) -> Result<(), RouteError> {
        rule.validate()?;
        let mut rules = self.rules.write().unwrap();
        if rules.iter().any(|r| r.tool_id == rule.tool_id) {
            return Err(RouteError::DuplicateToolId(rule.tool_id));
        }
        rules.push(Arc::new(rule));
        self.recompile(&rules);
        Ok(())
    }

    /// Admin mutation: price and description only.
    pub fn update(
        &self,
        tool_id: &str,
        price_usdc: Option<String>,
        description: Option<String>,
    ) -> Result<RouteRule, RouteError> {
        let mut rules = self.rules.write().unwrap();
        let slot = rules
            .iter_mut()
            .find(|r| r.tool_id == tool_id)
            .ok_or_else(|| RouteError::UnknownToolId(tool_id.to_string()))?;
        let mut updated = (**slot).clone();
        if let Some(price) = price_usdc {
            parse_usdc(&price).map_err(|e| RouteError::Invalid(format!("price_usdc: {}", e)))?;
            updated.price_usdc = price;
        }
        if let Some(description) = description {
            updated.description = Some(description);
        }
        *slot = Arc::new(updated.clone());
        self.recompile(&rules);
        Ok(updated)
    }

    pub fn remove(&self, tool_id: &str) -> Result<RouteRule, RouteError> {
        let mut rules = self.rules.write().unwrap();
        let position = rules
            .iter()
            .position(|r| r.tool_id == tool_id)
            .ok_or_else(|| RouteError::UnknownToolId(tool_id.to_string()))?;
        let removed = rules.remove(position);
        self.recompile(&rules);
        Ok((*removed).clone())
    }

    fn recompile(&self, rules: &[Arc<RouteRule>]) {
        let compiled = Arc::new(CompiledTable::compile(rules));
        *self.snapshot.write().unwrap() = compiled;
    }
}

#[derive(Debug, Deserialize)]
struct RoutesFile {
    routes: Vec<RouteRule>,
}

/// Load `{ "routes": [...] }`; parse or validation errors fail startup.
pub fn load_routes_file(path: &Path) -> Result<Vec<RouteRule>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading routes file {}", path.display()))?;
    let parsed: RoutesFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing routes file {}", path.display()))?;

    let mut seen = HashSet::new();
    for rule in &parsed.routes {
        rule.validate()
            .with_context(|| format!("route {}", rule.tool_id))?;
        if !rule.skip_ssrf {
            crate::gateway::ssrf::check_backend_url(&rule.backend_url)
                .with_context(|| format!("route {}", rule.tool_id))?;
        }
        if !seen.insert(rule.tool_id.clone()) {
            anyhow::bail!("duplicate tool_id {} in routes file", rule.tool_id);
        }
    }
    Ok(parsed.routes)
}

/// Atomic rewrite (temp file + rename) so a crash never truncates the file.
pub fn write_routes_file(path: &Path, rules: &[RouteRule]) -> Result<()> {
    let body = serde_json::to_string_pretty(&serde_json::json!({ "routes": rules }))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)
        .with_context(|| format!("writing routes file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replacing routes file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(tool_id: &str, method: &str, path: &str, price: &str) -> RouteRule {
        RouteRule {
            tool_id: tool_id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            price_usdc: price.to_string(),
            provider_id: "prov".to_string(),
            backend_url: "https://api.example.com".to_string(),
            auth: None,
            group: None,
            description: None,
            restricted: false,
            skip_ssrf: false,
        }
    }

    #[test]
    fn longest_template_wins() {
        let table = RouteTable::from_rules(vec![
            rule("user", "GET", "/api/users/:id", "0"),
            rule("profile", "GET", "/api/users/:id/profile", "0"),
        ])
        .unwrap();

        let snapshot = table.snapshot();
        let matched = snapshot.match_route("GET", "/api/users/42/profile").unwrap();
        assert_eq!(matched.rule.tool_id, "profile");
        assert_eq!(matched.params.get("id").unwrap(), "42");

        let matched = snapshot.match_route("GET", "/api/users/42").unwrap();
        assert_eq!(matched.rule.tool_id, "user");
    }

    #[test]
    fn literal_segment_beats_parameter() {
        let table = RouteTable::from_rules(vec![
            rule("by-id", "GET", "/api/users/:id", "0"),
            rule("me", "GET", "/api/users/me", "0"),
        ])
        .unwrap();

        let snapshot = table.snapshot();
        assert_eq!(
            snapshot.match_route("GET", "/api/users/me").unwrap().rule.tool_id,
            "me"
        );
        assert_eq!(
            snapshot.match_route("GET", "/api/users/7").unwrap().rule.tool_id,
            "by-id"
        );
    }

    #[test]
    fn first_registered_wins_ties() {
        let table = RouteTable::from_rules(vec![
            rule("a", "GET", "/api/things/:x", "0"),
            rule("b", "GET", "/api/things/:y", "0"),
        ])
        .unwrap();
        assert_eq!(
            table
                .snapshot()
                .match_route("GET", "/api/things/1")
                .unwrap()
                .rule
                .tool_id,
            "a"
        );
    }

    #[test]
    fn method_must_match_and_restricted_is_invisible() {
        let mut hidden = rule("hidden", "GET", "/api/secret", "0");
        hidden.restricted = true;
        let table =
            RouteTable::from_rules(vec![rule("echo", "GET", "/api/echo", "0"), hidden]).unwrap();

        let snapshot = table.snapshot();
        assert!(snapshot.match_route("POST", "/api/echo").is_none());
        assert!(snapshot.match_route("GET", "/api/secret").is_none());
    }

    #[test]
    fn duplicate_tool_id_rejected() {
        let table = RouteTable::new();
        table.insert(rule("echo", "GET", "/api/echo", "0")).unwrap();
        let err = table
            .insert(rule("echo", "POST", "/api/echo2", "0"))
            .unwrap_err();
        assert_eq!(err, RouteError::DuplicateToolId("echo".to_string()));
    }

    #[test]
    fn update_touches_only_price_and_description() {
        let table = RouteTable::new();
        table
            .insert(rule("echo", "GET", "/api/echo", "0.01"))
            .unwrap();
        let updated = table
            .update("echo", Some("0.05".to_string()), Some("bumped".to_string()))
            .unwrap();
        assert_eq!(updated.price_usdc, "0.05");
        assert_eq!(updated.description.as_deref(), Some("bumped"));
        assert!(table.update("missing", None, None).is_err());
        assert!(table
            .update("echo", Some("not-a-price".to_string()), None)
            .is_err());
    }

    #[test]
    fn snapshot_is_stable_across_mutations() {
        let table = RouteTable::new();
        table.insert(rule("echo", "GET", "/api/echo", "0")).unwrap();
        let before = table.snapshot();
        table.remove("echo").unwrap();
        assert!(before.match_route("GET", "/api/echo").is_some());
        assert!(table.snapshot().match_route("GET", "/api/echo").is_none());
    }

    #[test]
    fn invalid_rules_rejected() {
        assert!(rule("", "GET", "/api/x", "0").validate().is_err());
        assert!(rule("x", "FETCH", "/api/x", "0").validate().is_err());
        assert!(rule("x", "GET", "api/x", "0").validate().is_err());
        assert!(rule("x", "GET", "/api/x", "-1").validate().is_err());
        assert!(rule("x", "GET", "/api/x", "0.1234567").validate().is_err());
    }

    #[test]
    fn routes_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        let rules = vec![rule("echo", "GET", "/api/echo", "0.01")];
        write_routes_file(&path, &rules).unwrap();
        let loaded = load_routes_file(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].tool_id, "echo");
    }
}
