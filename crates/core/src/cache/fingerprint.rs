//! Query fingerprints.
//!
//! A fingerprint is the SHA-256 digest of a canonical text rendering of a
//! query shape. Filters are sorted so expression order does not matter, and
//! every value carries a type tag plus a length prefix so that values of
//! different types, or strings containing separators, never collide.

use std::fmt::{self, Write as _};

use sha2::{Digest, Sha256};

use crate::entity::{Result, Value};
use crate::query::{Filter, Query};

/// Hex-encoded digest identifying a normalized query shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `query` executed in `namespace`.
    ///
    /// # Errors
    ///
    /// Fails when the query's ancestor key is malformed, incomplete or
    /// belongs to a different namespace.
    pub fn of(namespace: &str, query: &Query) -> Result<Self> {
        let canonical = canonical_form(namespace, query)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(Self(hex::encode(digest)))
    }

    /// Wraps an already computed digest (e.g. one read back from an index set).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Renders the canonical text that is hashed into a fingerprint.
pub fn canonical_form(namespace: &str, query: &Query) -> Result<String> {
    let mut out = String::new();
    field(&mut out, "ns", namespace);
    field(&mut out, "kind", &query.kind);

    if let Some(ancestor) = &query.ancestor {
        ancestor.ensure_namespace(namespace)?;
        field(&mut out, "ancestor", &ancestor.encode()?);
    }

    let mut filters: Vec<String> = query
        .filters
        .iter()
        .map(canonical_filter)
        .collect::<Result<_>>()?;
    filters.sort();
    for filter in &filters {
        field(&mut out, "filter", filter);
    }

    for sort in &query.order {
        let mut rendered = String::new();
        field(&mut rendered, "field", &sort.field);
        field(&mut rendered, "dir", sort.direction.as_str());
        field(&mut out, "sort", &rendered);
    }

    if let Some(geo) = &query.geo {
        let mut rendered = String::new();
        field(&mut rendered, "field", &geo.field);
        field(
            &mut rendered,
            "center",
            &canonical_value(&Value::GeoPoint(geo.center))?,
        );
        field(&mut rendered, "radius", &format!("{:016x}", geo.radius_meters.to_bits()));
        field(
            &mut rendered,
            "dir",
            geo.direction.map(|d| d.as_str()).unwrap_or("none"),
        );
        field(&mut out, "geo", &rendered);
    }

    match query.limit {
        Some(limit) => field(&mut out, "limit", &limit.to_string()),
        None => field(&mut out, "limit", "none"),
    }

    Ok(out)
}

fn canonical_filter(filter: &Filter) -> Result<String> {
    let mut out = String::new();
    field(&mut out, "field", &filter.field);
    field(&mut out, "op", filter.op.as_str());
    field(&mut out, "value", &canonical_value(&filter.value)?);
    Ok(out)
}

/// Tagged, length-prefixed textual encoding of a value.
pub fn canonical_value(value: &Value) -> Result<String> {
    let body = match value {
        Value::Null => String::new(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Double(d) => format!("{:016x}", d.to_bits()),
        Value::String(s) => s.clone(),
        Value::Timestamp(ts) => ts.timestamp_nanos_opt().unwrap_or(i64::MAX).to_string(),
        Value::Key(key) => key.encode()?,
        Value::GeoPoint(point) => format!(
            "{:016x},{:016x}",
            point.latitude.to_bits(),
            point.longitude.to_bits()
        ),
        Value::Array(values) => {
            let mut rendered = String::new();
            for v in values {
                field(&mut rendered, "item", &canonical_value(v)?);
            }
            rendered
        }
    };
    let mut out = String::new();
    field(&mut out, value.type_tag(), &body);
    Ok(out)
}

fn field(out: &mut String, name: &str, body: &str) {
    // `name:len:body;` lets bodies contain any character unambiguously.
    let _ = write!(out, "{}:{}:{};", name, body.len(), body);
}
