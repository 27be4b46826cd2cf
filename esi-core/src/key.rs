//! Cache key construction and serialization.
//!
//! A [`CacheKey`] is the fingerprint of one upstream request: the endpoint
//! path, its path parameters, its query parameters, and the character the
//! request is scoped to (0 for public endpoints). The [`Display`]
//! implementation produces the string under which the entry is stored.
//!
//! ## Format
//!
//! Parts are joined with `:`, starting with the literal `esi` namespace:
//!
//! ```text
//! esi:{endpoint}:{path params}:{query params}:char={id}
//! ```
//!
//! - The endpoint is stored with leading and trailing `/` stripped.
//! - Parameters are emitted as `name=value`, sorted by name.
//! - Empty segments are omitted entirely; `char=` only appears for a
//!   positive character id.
//!
//! ```
//! use esi_core::CacheKey;
//!
//! let key = CacheKey::new("/v4/markets/10000002/orders/")
//!     .query_param("order_type", "all")
//!     .query_param("page", "1");
//! assert_eq!(
//!     key.to_string(),
//!     "esi:v4/markets/10000002/orders:order_type=all:page=1",
//! );
//! ```
//!
//! [`Display`]: std::fmt::Display

use std::collections::BTreeMap;
use std::fmt;

/// A deterministic identifier for a cached upstream response.
///
/// Equal keys serialize to byte-identical strings regardless of the order
/// in which parameters were inserted; the parameter maps are ordered by
/// name internally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CacheKey {
    endpoint: String,
    path_params: BTreeMap<String, String>,
    query_params: BTreeMap<String, String>,
    character_id: i64,
}

impl CacheKey {
    /// Creates a key for the given endpoint path.
    pub fn new(endpoint: impl Into<String>) -> Self {
        CacheKey {
            endpoint: endpoint.into(),
            ..CacheKey::default()
        }
    }

    /// Adds a path parameter.
    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    /// Adds a query parameter.
    ///
    /// For a parameter that appears more than once, the first value wins,
    /// matching how the upstream interprets repeated parameters.
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.entry(name.into()).or_insert_with(|| value.into());
        self
    }

    /// Scopes the key to a character for authenticated endpoints.
    ///
    /// An id of 0 means a public endpoint; the `char=` segment is then
    /// omitted from the serialized form.
    pub fn character(mut self, character_id: i64) -> Self {
        self.character_id = character_id;
        self
    }

    /// Returns the endpoint path this key was built for.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "esi")?;

        let endpoint = self.endpoint.trim_matches('/');
        if !endpoint.is_empty() {
            write!(f, ":{endpoint}")?;
        }

        for (name, value) in &self.path_params {
            write!(f, ":{name}={value}")?;
        }

        for (name, value) in &self.query_params {
            write!(f, ":{name}={value}")?;
        }

        if self.character_id > 0 {
            write!(f, ":char={}", self.character_id)?;
        }

        Ok(())
    }
}
