//! Cache key derivation.
//!
//! Keys are built from a fixed prefix, the route path and the normalized values
//! of the route's declared parameters, in declaration order. Undeclared query
//! parameters never reach the key.

use std::collections::HashMap;

use axum::http::Uri;

use super::config::{ParamKind, Route};
use super::policy::Scope;

const KEY_VERSION: &str = "v1";
const EMPTY_TOKEN_LIST: &str = "[]";

/// Canonical key of a guarded request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    scope: Option<String>,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Normalized scope value, when the route declares a scope parameter.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

#[derive(Debug, Clone)]
pub struct KeyDeriver {
    prefix: String,
}

impl KeyDeriver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn derive_from_uri(&self, route: &Route, uri: &Uri) -> CacheKey {
        self.derive(route, &query_params(uri.query().unwrap_or("")))
    }

    pub fn derive(&self, route: &Route, params: &HashMap<String, String>) -> CacheKey {
        let mut key = format!("{}:{KEY_VERSION}:{}", self.prefix, route.path);
        let mut scope = None;

        for param in &route.params {
            let raw = params.get(&param.name).map(String::as_str);
            let component = match param.kind {
                ParamKind::Text => slug(raw.unwrap_or("")),
                ParamKind::Tokens => token_list(raw.unwrap_or("")),
                ParamKind::Scope => {
                    let value = scope_value(raw);
                    scope = Some(value.clone());
                    value
                }
            };
            key.push(':');
            key.push_str(&component);
        }

        CacheKey { key, scope }
    }
}

/// Decode a query string, keeping the first value of repeated parameters.
pub fn query_params(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

/// Lowercase, trim, and join whitespace-separated words with single hyphens.
pub fn slug(value: &str) -> String {
    value
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical form of a comma-separated token list.
pub fn token_list(value: &str) -> String {
    let mut tokens: Vec<String> = value
        .split(',')
        .map(|token| token.trim().to_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    if tokens.is_empty() {
        return EMPTY_TOKEN_LIST.to_string();
    }
    tokens.sort();
    tokens.join(",")
}

fn scope_value(raw: Option<&str>) -> String {
    let value = slug(raw.unwrap_or(""));
    if value.is_empty() {
        Scope::default().as_str().to_string()
    } else {
        value
    }
}
