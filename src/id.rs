//! K-sortable run identifiers.
//!
//! Ids are monotonic within a millisecond and lexicographically
//! sortable by creation time, the property the run store relies on for
//! `created_at`-ordered pagination cursors. Generation wraps
//! [`ulid::Ulid`]; the wire/display form is `run_<ulid>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

const PREFIX: &str = "run_";

/// Externally visible run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RunId(Ulid);

impl RunId {
    /// Generate a new id, ordered after any id generated earlier in the
    /// same process (and, within the same millisecond, after any id
    /// generated by a prior call on this thread's system clock tick).
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ParseRunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or(ParseRunIdError::MissingPrefix)?;
        let ulid = Ulid::from_string(rest).map_err(ParseRunIdError::Ulid)?;
        Ok(Self(ulid))
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RunId {
    type Error = ParseRunIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Errors parsing a [`RunId`] from its string form.
#[derive(Debug, thiserror::Error)]
pub enum ParseRunIdError {
    /// The string was missing the `run_` prefix.
    #[error("run id is missing the 'run_' prefix")]
    MissingPrefix,

    /// The suffix was not a valid ulid.
    #[error("invalid ulid suffix: {0}")]
    Ulid(#[from] ulid::DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let id = RunId::generate();
        let text = id.to_string();
        assert!(text.starts_with(PREFIX));
        let parsed: RunId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_missing_prefix() {
        let err = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse::<RunId>().unwrap_err();
        assert!(matches!(err, ParseRunIdError::MissingPrefix));
    }

    #[test]
    fn successive_ids_sort_monotonically() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert!(a <= b);
    }
}
