//! Resource names: `storage$name[$subobject]`
//!
//! The storage prefix picks a storage backend, the name identifies a bundle
//! (or blob) inside it and the optional sub-object picks a chunk. A name with
//! no `$` at all is shorthand for the default `disk` storage.
//!
//! `|$|$subobject` is a link relative to the bundle currently being read and
//! `storage$null` is the null reference.

use crate::error::{BundleError, Result};
use std::borrow::Cow;
use std::fmt;

pub const SEPARATOR: char = '$';
pub const DEFAULT_STORAGE: &str = "disk";
pub const NULL_STORAGE: &str = "null";
pub const CURRENT_LINK_PREFIX: &str = "|$|";

/// Owned or borrowed resource name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName<'a>(Cow<'a, str>);

impl<'a> ResourceName<'a> {
    /// Wrap a name, prefixing bare names with the default storage
    pub fn new(name: impl Into<Cow<'a, str>>) -> Self {
        let name = name.into();
        if !name.is_empty() && !name.contains(SEPARATOR) {
            return ResourceName(Cow::Owned(format!(
                "{}{}{}",
                DEFAULT_STORAGE, SEPARATOR, name
            )));
        }
        ResourceName(name)
    }

    /// Wrap a name and reject it unless it is valid
    pub fn parse(name: impl Into<Cow<'a, str>>) -> Result<Self> {
        let name = Self::new(name);
        if !name.is_valid() {
            return Err(BundleError::InvalidName(name.0.into_owned()));
        }
        Ok(name)
    }

    /// Assemble `storage$name$subobject` (sub-object omitted when empty)
    pub fn from_parts(storage: &str, name: &str, subobject: &str) -> ResourceName<'static> {
        let joined = if subobject.is_empty() {
            format!("{}{}{}", storage, SEPARATOR, name)
        } else {
            format!("{}{}{}{}{}", storage, SEPARATOR, name, SEPARATOR, subobject)
        };
        ResourceName(Cow::Owned(joined))
    }

    pub fn null() -> ResourceName<'static> {
        ResourceName(Cow::Borrowed("null$null"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_owned(self) -> ResourceName<'static> {
        ResourceName(Cow::Owned(self.0.into_owned()))
    }

    fn first_separator(&self) -> Option<usize> {
        self.0.find(SEPARATOR)
    }

    /// Separator after the name part, if any
    fn second_separator(&self) -> Option<usize> {
        let first = self.first_separator()?;
        self.0[first + 1..].find(SEPARATOR).map(|pos| first + 1 + pos)
    }

    /// There is a `$`, the storage is non-empty and something follows the `$`
    pub fn is_valid(&self) -> bool {
        match self.first_separator() {
            Some(first) => first > 0 && first + 1 < self.0.len(),
            None => false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.is_valid() && self.storage() == NULL_STORAGE
    }

    /// Matches `|$|$subobject` with a non-empty sub-object
    pub fn is_current_link(&self) -> bool {
        if !self.is_valid() || !self.0.starts_with(CURRENT_LINK_PREFIX) {
            return false;
        }
        match self.second_separator() {
            Some(second) => second + 1 < self.0.len(),
            None => false,
        }
    }

    /// Text before the first `$`
    pub fn storage(&self) -> &str {
        match self.first_separator() {
            Some(first) => &self.0[..first],
            None => "",
        }
    }

    /// Text between the first and second `$`, or to the end
    pub fn name(&self) -> &str {
        let Some(first) = self.first_separator() else {
            return "";
        };
        match self.second_separator() {
            Some(second) => &self.0[first + 1..second],
            None => &self.0[first + 1..],
        }
    }

    /// Text after the second `$`, empty if absent
    pub fn subobject(&self) -> &str {
        match self.second_separator() {
            Some(second) => &self.0[second + 1..],
            None => "",
        }
    }

    /// Rewrite a current-bundle link against the bundle `current` names
    pub fn rebase(&self, current: &ResourceName<'_>) -> Option<ResourceName<'static>> {
        if !self.is_current_link() {
            return None;
        }
        Some(ResourceName::from_parts(
            current.storage(),
            current.name(),
            self.subobject(),
        ))
    }

    /// Same storage and bundle with another sub-object
    pub fn with_subobject(&self, subobject: &str) -> ResourceName<'static> {
        ResourceName::from_parts(self.storage(), self.name(), subobject)
    }
}

impl fmt::Display for ResourceName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ResourceName<'_> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'a> From<&'a str> for ResourceName<'a> {
    fn from(name: &'a str) -> Self {
        ResourceName::new(name)
    }
}

impl From<String> for ResourceName<'static> {
    fn from(name: String) -> Self {
        ResourceName::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_uses_default_storage() {
        let name = ResourceName::new("bob");
        assert!(name.is_valid());
        assert_eq!(name.storage(), "disk");
        assert_eq!(name.name(), "bob");
        assert_eq!(name.subobject(), "");
    }

    #[test]
    fn test_three_part_name() {
        let name = ResourceName::new("disk$bob$0");
        assert!(name.is_valid());
        assert_eq!(name.storage(), "disk");
        assert_eq!(name.name(), "bob");
        assert_eq!(name.subobject(), "0");
        assert!(!name.is_current_link());
        assert!(!name.is_null());
    }

    #[test]
    fn test_invalid_names() {
        assert!(!ResourceName::new("").is_valid());
        assert!(!ResourceName::new("$").is_valid());
        assert!(!ResourceName::new("$$").is_valid());
        assert!(!ResourceName::new("disk$").is_valid());
        assert!(ResourceName::parse("$bob").is_err());
    }

    #[test]
    fn test_current_link() {
        let link = ResourceName::new("|$|$0");
        assert!(link.is_current_link());
        assert_eq!(link.subobject(), "0");

        let empty = ResourceName::new("|$|$");
        assert!(empty.is_valid());
        assert!(!empty.is_current_link());

        assert!(!ResourceName::new("|$|").is_current_link());
        assert!(!ResourceName::new("x$|$0").is_current_link());
    }

    #[test]
    fn test_null_name() {
        assert!(ResourceName::new("null$null").is_null());
        assert!(ResourceName::null().is_null());
        assert!(ResourceName::new("null$anything").is_null());
        assert!(!ResourceName::new("disk$null").is_null());
    }

    #[test]
    fn test_rebase() {
        let current = ResourceName::new("mem$level1$mesh");
        let link = ResourceName::new("|$|$texture");
        let rebased = link.rebase(&current).unwrap();
        assert_eq!(rebased.as_str(), "mem$level1$texture");

        assert!(ResourceName::new("disk$a$b").rebase(&current).is_none());
    }

    #[test]
    fn test_borrowed_is_zero_copy() {
        let source = String::from("disk$bob$0");
        let name = ResourceName::new(source.as_str());
        assert!(matches!(name.0, Cow::Borrowed(_)));
        assert_eq!(name.to_string(), "disk$bob$0");
    }
}
