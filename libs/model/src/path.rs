//! Instance paths.
//!
//! A path is the slash-joined list of instance names from the tree root to an
//! instance, e.g. `/vm/tomcat/webapp`. Paths are the stable identity of
//! instances across the manager, the agents and persistence.

use std::fmt;
use std::str::FromStr;

use crate::ModelError;

const SEPARATOR: char = '/';

/// Validated path of an instance in the tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstancePath(String);

impl InstancePath {
    /// Parses a path such as `/vm/app`.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        if s.is_empty() {
            return Err(ModelError::EmptyPath);
        }

        let Some(rest) = s.strip_prefix(SEPARATOR) else {
            return Err(ModelError::MissingLeadingSlash(s.to_string()));
        };

        if rest.is_empty() || rest.split(SEPARATOR).any(str::is_empty) {
            return Err(ModelError::EmptySegment(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Path of a root instance.
    pub fn root(name: &str) -> Result<Self, ModelError> {
        validate_name(name)?;
        Ok(Self(format!("{SEPARATOR}{name}")))
    }

    /// Path of a child of this instance.
    pub fn child(&self, name: &str) -> Result<Self, ModelError> {
        validate_name(name)?;
        Ok(Self(format!("{}{SEPARATOR}{name}", self.0)))
    }

    /// Path of the parent instance, `None` for a root.
    pub fn parent(&self) -> Option<Self> {
        let idx = self.0.rfind(SEPARATOR)?;
        if idx == 0 {
            None
        } else {
            Some(Self(self.0[..idx].to_string()))
        }
    }

    /// Name of the instance (last segment).
    pub fn name(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or_default()
    }

    /// Names from the root down to this instance.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split(SEPARATOR)
    }

    /// Number of segments (1 for a root instance).
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Path of the root instance of this path's tree.
    pub fn root_path(&self) -> Self {
        match self.segments().next() {
            Some(first) => Self(format!("{SEPARATOR}{first}")),
            None => self.clone(),
        }
    }

    /// True if `self` equals `other` or lies below it.
    pub fn is_within(&self, other: &InstancePath) -> bool {
        self.0 == other.0
            || (self.0.starts_with(&other.0)
                && self.0[other.0.len()..].starts_with(SEPARATOR))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_name(name: &str) -> Result<(), ModelError> {
    if name.is_empty() || name.contains(SEPARATOR) || name.trim() != name {
        return Err(ModelError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl fmt::Display for InstancePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstancePath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for InstancePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for InstancePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstancePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
