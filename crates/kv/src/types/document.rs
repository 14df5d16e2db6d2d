//! Documents and version tokens

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned version token
///
/// Every successful mutation produces a new CAS. Writers that pass a stale
/// CAS are rejected with [`crate::StoreError::CasMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cas(u64);

impl Cas {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A document as read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: String,
    /// Committed value. `None` marks a shadow document that only holds metadata.
    pub body: Option<Vec<u8>>,
    /// Opaque extended attribute, invisible to plain readers
    pub xattr: Option<Vec<u8>>,
    pub cas: Cas,
}

impl Document {
    /// Whether this document exists only to carry metadata
    pub fn is_shadow(&self) -> bool {
        self.body.is_none()
    }
}

/// What a mutation writes: the body and the extended attribute are both
/// replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentContent {
    pub body: Option<Vec<u8>>,
    pub xattr: Option<Vec<u8>>,
}

impl DocumentContent {
    /// Plain document with no metadata
    pub fn body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
            xattr: None,
        }
    }

    /// Shadow document carrying only metadata
    pub fn shadow(xattr: impl Into<Vec<u8>>) -> Self {
        Self {
            body: None,
            xattr: Some(xattr.into()),
        }
    }

    pub fn with_xattr(mut self, xattr: impl Into<Vec<u8>>) -> Self {
        self.xattr = Some(xattr.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_has_no_body() {
        let content = DocumentContent::shadow(b"meta".to_vec());
        assert!(content.body.is_none());
        assert_eq!(content.xattr.as_deref(), Some(&b"meta"[..]));
    }

    #[test]
    fn test_builder_keeps_both_parts() {
        let content = DocumentContent::body("v").with_xattr("x");
        assert_eq!(content.body.as_deref(), Some(&b"v"[..]));
        assert_eq!(content.xattr.as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn test_cas_display_is_hex() {
        assert_eq!(Cas::new(255).to_string(), "0xff");
    }
}
