//! Namespaced identifiers (`namespace:path`).

use std::fmt;
use std::str::FromStr;

use crate::{CodecError, MAX_IDENTIFIER_BYTES};

/// A namespaced name such as `arbor:blocks/chest`.
///
/// Namespaces allow `[a-z0-9_.-]`, paths additionally allow `/`. The
/// encoded `namespace:path` form is at most [`MAX_IDENTIFIER_BYTES`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    namespace: String,
    path: String,
}

impl Identifier {
    pub fn new(namespace: &str, path: &str) -> Result<Self, CodecError> {
        if !valid_namespace(namespace) || !valid_path(path) {
            return Err(CodecError::InvalidIdentifier(format!("{namespace}:{path}")));
        }
        let len = namespace.len() + 1 + path.len();
        if len > MAX_IDENTIFIER_BYTES {
            return Err(CodecError::StringTooLong {
                len,
                max: MAX_IDENTIFIER_BYTES,
            });
        }
        Ok(Self {
            namespace: namespace.to_string(),
            path: path.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FromStr for Identifier {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, path)) => Identifier::new(namespace, path),
            None => Err(CodecError::InvalidIdentifier(s.to_string())),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path)
    }
}

fn valid_namespace(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'))
}

fn valid_path(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-' | b'/')
        })
}
