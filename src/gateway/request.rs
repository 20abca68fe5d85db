//! Inbound request model and cache fingerprints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;

/// Request method as seen by the admission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Whether responses to this method may be served from the cache.
    ///
    /// Only `GET` is cached; `HEAD` and `OPTIONS` are idempotent but carry
    /// no body worth storing.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(GatewayError::Config(format!("unsupported method: {}", other))),
        }
    }
}

/// A request arriving at the gateway, after transport parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundRequest {
    /// Correlates log events of one request.
    pub id: Uuid,
    /// The rate-limited identity, usually an API key.
    pub principal: String,
    pub method: Method,
    /// Logical path, without host or query string.
    pub path: String,
    pub body: Option<Value>,
}

impl InboundRequest {
    pub fn new(principal: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Cache address of this request's response.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.principal, &self.path)
    }
}

/// Deterministic cache key derived from a principal and a logical path.
///
/// The principal is length-prefixed so that no choice of principal and path
/// can produce another pair's key; two principals never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub principal: String,
    pub path: String,
}

impl Fingerprint {
    pub fn new(principal: &str, path: &str) -> Self {
        Self {
            principal: principal.to_string(),
            path: path.to_string(),
        }
    }

    /// Serialized key, `<len(principal)>:<principal>:<path>`.
    pub fn to_key(&self) -> String {
        format!("{}:{}:{}", self.principal.len(), self.principal, self.path)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}
