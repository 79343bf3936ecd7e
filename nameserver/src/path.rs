use std::fmt;

use crate::error::{NamespaceError, NsResult};

pub const SEPARATOR: char = '/';

/// An absolute, validated namespace path.
///
/// The root is `/`. Every other path is `/`-separated non-empty names;
/// a trailing separator counts as an empty component and is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacePath {
    components: Vec<String>,
}

impl NamespacePath {
    pub fn root() -> Self {
        NamespacePath {
            components: Vec::new(),
        }
    }

    pub fn parse(path: &str) -> NsResult<Self> {
        if !path.starts_with(SEPARATOR) {
            return Err(NamespaceError::invalid_path(path, "path is not absolute"));
        }
        if path.len() == 1 {
            return Ok(Self::root());
        }

        let mut components = Vec::new();
        for part in path[1..].split(SEPARATOR) {
            if part.is_empty() {
                return Err(NamespaceError::invalid_path(path, "empty path component"));
            }
            validate_name(part).map_err(|reason| NamespaceError::invalid_path(path, reason))?;
            components.push(part.to_string());
        }

        Ok(NamespacePath { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Last component; `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<NamespacePath> {
        if self.is_root() {
            return None;
        }
        Some(NamespacePath {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, name: &str) -> NamespacePath {
        let mut components = self.components.clone();
        components.push(name.to_string());
        NamespacePath { components }
    }

    /// True when `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &NamespacePath) -> bool {
        self.components.len() >= ancestor.components.len()
            && self.components[..ancestor.components.len()] == ancestor.components[..]
    }
}

impl fmt::Display for NamespacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "{}", SEPARATOR);
        }
        for c in &self.components {
            write!(f, "{}{}", SEPARATOR, c)?;
        }
        Ok(())
    }
}

/// Checks a single entry name. Returns the reason on failure.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty name");
    }
    if name.contains(SEPARATOR) {
        return Err("name contains a path separator");
    }
    if name == "." || name == ".." {
        return Err("relative path component");
    }
    if name.contains('\0') {
        return Err("name contains NUL");
    }
    Ok(())
}
