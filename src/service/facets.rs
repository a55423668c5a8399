//! Consolidated analysis queries with per-facet partial success.
//!
//! One `analyze` round trip asks the oracle for several facets of the same
//! document. Each facet succeeds or fails on its own; [`normalize`] turns
//! whatever the oracle returned into a response where every requested facet
//! appears in exactly one of `result` and `failures`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::cache::DocumentVersion;
use crate::error::OracleError;

pub const ANALYZE_METHOD: &str = "analyze";

/// Failure kind for a requested facet the oracle said nothing about.
pub const FAILURE_MISSING: &str = "missing";
/// Failure kind for a facet the oracle rejected.
pub const FAILURE_ORACLE: &str = "oracle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facet {
    Parse,
    Introspect,
    Diagnostics,
    Tokenize,
}

impl Facet {
    pub const ALL: [Facet; 4] = [
        Facet::Parse,
        Facet::Introspect,
        Facet::Diagnostics,
        Facet::Tokenize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Facet::Parse => "parse",
            Facet::Introspect => "introspect",
            Facet::Diagnostics => "diagnostics",
            Facet::Tokenize => "tokenize",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown facet `{0}` (expected parse, introspect, diagnostics or tokenize)")]
pub struct UnknownFacet(pub String);

impl FromStr for Facet {
    type Err = UnknownFacet;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Facet::ALL
            .into_iter()
            .find(|facet| facet.as_str() == s.trim())
            .ok_or_else(|| UnknownFacet(s.to_string()))
    }
}

fn all_facets() -> Vec<Facet> {
    Facet::ALL.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeParams {
    pub uri: Url,
    pub text: String,
    /// Editor buffer version; when absent the content hash identifies the
    /// document version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default = "all_facets")]
    pub include: Vec<Facet>,
}

impl AnalyzeParams {
    pub fn new(uri: Url, text: impl Into<String>) -> Self {
        Self {
            uri,
            text: text.into(),
            version: None,
            include: all_facets(),
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_include(mut self, include: impl IntoIterator<Item = Facet>) -> Self {
        self.include = include.into_iter().collect();
        self
    }

    pub fn document_version(&self) -> DocumentVersion {
        match self.version {
            Some(version) => DocumentVersion::Version(version),
            None => DocumentVersion::for_content(&self.text),
        }
    }

    /// Requested facets in canonical order, duplicates removed.
    pub fn requested(&self) -> Vec<Facet> {
        let mut facets = self.include.clone();
        facets.sort();
        facets.dedup();
        facets
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetFailure {
    pub kind: String,
    pub message: String,
}

impl FacetFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    fn missing(facet: Facet) -> Self {
        Self::new(
            FAILURE_MISSING,
            format!("oracle returned no {} result", facet),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    #[serde(default)]
    pub result: BTreeMap<Facet, Value>,
    #[serde(default)]
    pub failures: BTreeMap<Facet, FacetFailure>,
}

impl AnalyzeResponse {
    /// Fold in facets answered elsewhere. A success replaces a failure of the
    /// same facet, never the other way around.
    pub fn merge(&mut self, other: AnalyzeResponse) {
        for (facet, value) in other.result {
            self.failures.remove(&facet);
            self.result.insert(facet, value);
        }
        for (facet, failure) in other.failures {
            if !self.result.contains_key(&facet) {
                self.failures.insert(facet, failure);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Build the response for `requested` from a raw oracle `analyze` result.
///
/// A facet in the oracle's `result` map succeeds even if the oracle also
/// listed a failure for it. A requested facet in neither map fails with kind
/// `missing`. Facets that were not requested are dropped.
pub fn normalize(requested: &[Facet], raw: &Value) -> AnalyzeResponse {
    let results = raw.get("result").and_then(Value::as_object);
    let failures = raw.get("failures").and_then(Value::as_object);

    let mut response = AnalyzeResponse::default();
    for &facet in requested {
        if let Some(value) = results.and_then(|r| r.get(facet.as_str())) {
            response.result.insert(facet, value.clone());
            continue;
        }
        let failure = failures
            .and_then(|f| f.get(facet.as_str()))
            .map(|raw| failure_from_value(facet, raw))
            .unwrap_or_else(|| FacetFailure::missing(facet));
        response.failures.insert(facet, failure);
    }
    response
}

/// Every requested facet fails with the same oracle-reported error.
pub fn fail_all(requested: &[Facet], error: &OracleError) -> AnalyzeResponse {
    let message = match error {
        OracleError::Oracle(inner) => inner.message.clone(),
        other => other.to_string(),
    };
    AnalyzeResponse {
        result: BTreeMap::new(),
        failures: requested
            .iter()
            .map(|&facet| (facet, FacetFailure::new(FAILURE_ORACLE, message.clone())))
            .collect(),
    }
}

fn failure_from_value(facet: Facet, raw: &Value) -> FacetFailure {
    match raw {
        Value::String(message) => FacetFailure::new(FAILURE_ORACLE, message.clone()),
        Value::Object(fields) => {
            let kind = fields
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or(FAILURE_ORACLE);
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} failed", facet));
            FacetFailure::new(kind, message)
        }
        other => FacetFailure::new(FAILURE_ORACLE, other.to_string()),
    }
}
