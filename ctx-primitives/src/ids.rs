//! Consumer identifier type.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 64;

/// Stable identity of a consumer registered with the engine.
///
/// Identifiers are short lowercase slugs such as `claude-desktop` or
/// `cursor.workspace-1`, which keeps them safe to embed in log fields and
/// storage keys.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Creates a consumer identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConsumerId`] if the identifier is empty, too
    /// long, or contains characters outside `[a-z0-9._-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier(&id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConsumerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConsumerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for ConsumerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ConsumerId> for String {
    fn from(value: ConsumerId) -> Self {
        value.0
    }
}

fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidConsumerId {
            id: String::new(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidConsumerId {
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_ID_LEN}"),
        });
    }

    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::InvalidConsumerId {
            id: id.into(),
            reason: "identifier must contain lowercase alphanumeric, dash, underscore, or dot"
                .into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_identifiers() {
        let id: ConsumerId = "cursor.workspace-1".parse().expect("parse");
        assert_eq!(id.as_str(), "cursor.workspace-1");
        assert_eq!(id.to_string(), "cursor.workspace-1");
    }

    #[test]
    fn rejects_invalid_identifiers() {
        assert!(matches!(
            ConsumerId::new(""),
            Err(Error::InvalidConsumerId { .. })
        ));
        assert!(ConsumerId::new("Upper").is_err());
        assert!(ConsumerId::new("has space").is_err());
        assert!(ConsumerId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn serializes_transparently() {
        let id = ConsumerId::new("claude").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"claude\"");
    }
}
