//! Database domain and cluster identifiers.
//!
//! A [`Domain`] names a logical database (database, optional schema, table
//! prefix). A [`ClusterName`] names the physical cluster a load balancer
//! fronts: either a core section serving one or more domains, or an external
//! storage cluster. Handles are cached per [`ClusterName`], never per domain.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;

/// Section name of the default core cluster.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Identifier for a logical database.
///
/// Two domains are equal iff their normalized id strings match (see
/// [`Domain::id`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain {
    database: String,
    schema: Option<String>,
    prefix: String,
}

impl Domain {
    /// Creates a domain from its parts. An empty schema is treated as none.
    #[must_use]
    pub fn new(
        database: impl Into<String>,
        schema: Option<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.filter(|s| !s.is_empty()),
            prefix: prefix.into(),
        }
    }

    /// Shorthand for a domain with no schema and no table prefix.
    #[must_use]
    pub fn database(database: impl Into<String>) -> Self {
        Self::new(database, None, "")
    }

    /// Database name.
    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.database
    }

    /// Schema name, if any.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Table prefix (possibly empty).
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns a copy of this domain with a different table prefix.
    #[must_use]
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self.clone()
        }
    }

    /// Normalized id: `database[-schema][-prefix]`, with `?` escaped as `??`
    /// and `-` escaped as `?h` inside each component.
    #[must_use]
    pub fn id(&self) -> String {
        let mut id = escape(&self.database);
        if let Some(schema) = &self.schema {
            id.push('-');
            id.push_str(&escape(schema));
        }
        if !self.prefix.is_empty() {
            if self.schema.is_none() {
                // Keep the prefix position unambiguous.
                id.push('-');
            }
            id.push('-');
            id.push_str(&escape(&self.prefix));
        }
        id
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::database("default")
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl FromStr for Domain {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let decoded = parts
            .iter()
            .map(|p| unescape(p))
            .collect::<Result<Vec<_>, _>>()?;
        match decoded.as_slice() {
            [db] if !db.is_empty() => Ok(Self::database(db.clone())),
            [db, schema] if !db.is_empty() => Ok(Self::new(db.clone(), Some(schema.clone()), "")),
            [db, schema, prefix] if !db.is_empty() => {
                Ok(Self::new(db.clone(), Some(schema.clone()), prefix.clone()))
            }
            _ => Err(CoordinatorError::Configuration(format!(
                "invalid domain id: {s:?}"
            ))),
        }
    }
}

fn escape(component: &str) -> String {
    component.replace('?', "??").replace('-', "?h")
}

fn unescape(component: &str) -> Result<String, CoordinatorError> {
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c != '?' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('?') => out.push('?'),
            Some('h') => out.push('-'),
            _ => {
                return Err(CoordinatorError::Configuration(format!(
                    "bad escape sequence in domain component {component:?}"
                )));
            }
        }
    }
    Ok(out)
}

/// Physical cluster a load balancer fronts.
///
/// Serialized as `core:<section>` or `external:<name>` so it can key JSON
/// maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ClusterName {
    /// Core cluster for the given section.
    Core(String),
    /// External storage cluster.
    External(String),
}

impl ClusterName {
    /// The sentinel core/main cluster.
    #[must_use]
    pub fn main() -> Self {
        Self::Core(DEFAULT_SECTION.to_string())
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core(section) => write!(f, "core:{section}"),
            Self::External(name) => write!(f, "external:{name}"),
        }
    }
}

impl From<ClusterName> for String {
    fn from(name: ClusterName) -> Self {
        name.to_string()
    }
}

impl TryFrom<String> for ClusterName {
    type Error = CoordinatorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if let Some(section) = s.strip_prefix("core:") {
            return Ok(Self::Core(section.to_string()));
        }
        if let Some(name) = s.strip_prefix("external:") {
            return Ok(Self::External(name.to_string()));
        }
        Err(CoordinatorError::Configuration(format!(
            "invalid cluster name: {s:?}"
        )))
    }
}

/// Which family of load balancer a caller asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LbKind {
    /// Main cluster serving the domain's section.
    Main,
    /// Named external storage cluster.
    External(String),
}
