//! Loose OpenAPI 3.0 import: flatten `paths` × HTTP methods into priced
//! route rules against one backend.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::gateway::routes::{RouteAuth, RouteRule};

const HTTP_METHODS: &[&str] = &["get", "post", "put", "delete", "patch", "head", "options"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    /// The OpenAPI document; only `paths`, methods and `operationId` are read.
    pub spec: Value,
    pub provider_id: String,
    pub backend_url: String,
    pub price_usdc: String,
    #[serde(default)]
    pub auth: Option<RouteAuth>,
    #[serde(default, rename = "_skip_ssrf")]
    pub skip_ssrf: bool,
}

/// Flatten the document into rules. `tool_id` comes from a slugified
/// `operationId` when present, else from the method+path; `{name}` path
/// templates become `:name` segments.
pub fn rules_from_openapi(request: &ImportRequest) -> Result<Vec<RouteRule>, String> {
    let paths = request
        .spec
        .get("paths")
        .and_then(|p| p.as_object())
        .ok_or_else(|| "document has no paths object".to_string())?;

    let mut rules = Vec::new();
    let mut used_ids = std::collections::HashSet::new();
    for (raw_path, operations) in paths {
        let operations = match operations.as_object() {
            Some(ops) => ops,
            None => continue,
        };
        let path = convert_path_template(raw_path);
        for method in HTTP_METHODS {
            let operation = match operations.get(*method) {
                Some(op) => op,
                None => continue,
            };
            let mut tool_id = operation
                .get("operationId")
                .and_then(|id| id.as_str())
                .map(slugify)
                .filter(|slug| !slug.is_empty())
                .unwrap_or_else(|| slugify(&format!("{} {}", method, raw_path)));
            // Collisions inside one document get a method-qualified id.
            if !used_ids.insert(tool_id.clone()) {
                tool_id = slugify(&format!("{} {}", method, raw_path));
                if !used_ids.insert(tool_id.clone()) {
                    continue;
                }
            }
            let description = operation
                .get("summary")
                .or_else(|| operation.get("description"))
                .and_then(|d| d.as_str())
                .map(|d| d.to_string());

            rules.push(RouteRule {
                tool_id,
                method: method.to_uppercase(),
                path: path.clone(),
                price_usdc: request.price_usdc.clone(),
                provider_id: request.provider_id.clone(),
                backend_url: request.backend_url.clone(),
                auth: request.auth.clone(),
                group: request
                    .spec
                    .get("info")
                    .and_then(|i| i.get("title"))
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string()),
                description,
                restricted: false,
                skip_ssrf: request.skip_ssrf,
            });
        }
    }
    Ok(rules)
}

/// `/users/{id}/posts` → `/api/users/:id/posts`; paths already under `/api`
/// keep their prefix.
fn convert_path_template(raw: &str) -> String {
    let re = Regex::new(r"\{([^}/]+)\}").expect("static regex compiles");
    let converted = re.replace_all(raw, ":$1").to_string();
    if converted.starts_with("/api/") || converted == "/api" {
        converted
    } else {
        format!("/api{}", converted)
    }
}

fn slugify(raw: &str) -> String {
    let re = Regex::new(r"[^a-z0-9]+").expect("static regex compiles");
    re.replace_all(&raw.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}
