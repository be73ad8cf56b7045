//! Entity keys with ancestor paths.
//!
//! A key is a namespace plus a non-empty path of `(kind, id)` elements. The
//! last element names the entity itself; earlier elements are its ancestors.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{KeyError, Result};

/// Identifier of a single path element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyId {
    /// Numeric identifier, usually allocated by the backing store.
    Id(i64),
    /// Caller-chosen string identifier.
    Name(String),
    /// Not yet allocated. Only valid on keys passed to `create`.
    Incomplete,
}

/// One `(kind, id)` step of a key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathElement {
    pub kind: String,
    pub id: KeyId,
}

impl PathElement {
    pub fn new(kind: impl Into<String>, id: KeyId) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

/// A fully qualified entity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub namespace: String,
    pub path: Vec<PathElement>,
}

impl Key {
    /// Creates a root key with a numeric id.
    pub fn with_id(namespace: impl Into<String>, kind: impl Into<String>, id: i64) -> Self {
        Self {
            namespace: namespace.into(),
            path: vec![PathElement::new(kind, KeyId::Id(id))],
        }
    }

    /// Creates a root key with a string name.
    pub fn with_name(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            path: vec![PathElement::new(kind, KeyId::Name(name.into()))],
        }
    }

    /// Creates a root key whose id will be allocated on create.
    pub fn incomplete(namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            path: vec![PathElement::new(kind, KeyId::Incomplete)],
        }
    }

    /// Returns a key for a child entity under this key.
    pub fn child(&self, kind: impl Into<String>, id: KeyId) -> Self {
        let mut path = self.path.clone();
        path.push(PathElement::new(kind, id));
        Self {
            namespace: self.namespace.clone(),
            path,
        }
    }

    /// Kind of the entity this key names (the last path element).
    pub fn kind(&self) -> &str {
        self.path.last().map(|e| e.kind.as_str()).unwrap_or("")
    }

    /// Identifier of the last path element, if any.
    pub fn id(&self) -> Option<&KeyId> {
        self.path.last().map(|e| &e.id)
    }

    /// Returns the parent key, or `None` for root keys.
    pub fn parent(&self) -> Option<Key> {
        if self.path.len() < 2 {
            return None;
        }
        Some(Self {
            namespace: self.namespace.clone(),
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// True when every path element carries an identifier.
    pub fn is_complete(&self) -> bool {
        !self.path.is_empty() && self.path.iter().all(|e| e.id != KeyId::Incomplete)
    }

    /// True when `ancestor` is a strict or non-strict prefix of this key.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        self.namespace == ancestor.namespace
            && ancestor.path.len() <= self.path.len()
            && self.path[..ancestor.path.len()] == ancestor.path[..]
    }

    /// Replaces the last element's id. Used when allocating ids on create.
    pub fn with_allocated_id(&self, id: i64) -> Self {
        let mut key = self.clone();
        if let Some(last) = key.path.last_mut() {
            last.id = KeyId::Id(id);
        }
        key
    }

    /// Checks the key is well formed and belongs to `namespace`.
    pub fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        self.validate()?;
        if self.namespace != namespace {
            return Err(KeyError::CrossNamespace {
                expected: namespace.to_string(),
                actual: self.namespace.clone(),
            });
        }
        Ok(())
    }

    /// Structural validation shared by every encoder.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(KeyError::Malformed("key has an empty path".to_string()));
        }
        if let Some(element) = self.path.iter().find(|e| e.kind.is_empty()) {
            return Err(KeyError::Malformed(format!(
                "path element with empty kind (id {:?})",
                element.id
            )));
        }
        Ok(())
    }

    /// Encodes the key to its stable textual form.
    ///
    /// Format: `{namespace}|{kind}:i{id}/{kind}:n{name}`, with `%`, `|`, `/`
    /// and `:` percent-escaped inside namespaces, kinds and names.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::Incomplete` if any element lacks an identifier.
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        let mut out = escape(&self.namespace);
        out.push('|');
        for (i, element) in self.path.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(&escape(&element.kind));
            out.push(':');
            match &element.id {
                KeyId::Id(id) => {
                    out.push('i');
                    out.push_str(&id.to_string());
                }
                KeyId::Name(name) => {
                    out.push('n');
                    out.push_str(&escape(name));
                }
                KeyId::Incomplete => {
                    return Err(KeyError::Incomplete(format!(
                        "element {} of kind '{}' has no id",
                        i, element.kind
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Parses a key previously produced by [`Key::encode`].
    pub fn decode(encoded: &str) -> Result<Self> {
        let (namespace, rest) = encoded
            .split_once('|')
            .ok_or_else(|| KeyError::Malformed(format!("missing namespace separator: {encoded}")))?;

        let mut path = Vec::new();
        for segment in rest.split('/') {
            let (kind, id) = segment
                .split_once(':')
                .ok_or_else(|| KeyError::Malformed(format!("missing kind separator: {segment}")))?;
            let id = match id.split_at_checked(1) {
                Some(("i", digits)) => KeyId::Id(digits.parse().map_err(|_| {
                    KeyError::Malformed(format!("invalid numeric id: {digits}"))
                })?),
                Some(("n", name)) => KeyId::Name(unescape(name)?),
                _ => return Err(KeyError::Malformed(format!("invalid id: {id}"))),
            };
            path.push(PathElement::new(unescape(kind)?, id));
        }

        let key = Self {
            namespace: unescape(namespace)?,
            path,
        };
        key.validate()?;
        Ok(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.namespace)?;
        for (i, element) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            match &element.id {
                KeyId::Id(id) => write!(f, "{}({})", element.kind, id)?,
                KeyId::Name(name) => write!(f, "{}({:?})", element.kind, name)?,
                KeyId::Incomplete => write!(f, "{}(?)", element.kind)?,
            }
        }
        Ok(())
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(escaped: &str) -> Result<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        let decoded = match code.as_str() {
            "25" => '%',
            "7C" => '|',
            "2F" => '/',
            "3A" => ':',
            _ => return Err(KeyError::Malformed(format!("invalid escape %{code}"))),
        };
        out.push(decoded);
    }
    Ok(out)
}
