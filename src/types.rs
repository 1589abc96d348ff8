//! NewType wrappers for type safety
//!
//! Identifiers are validated at construction so the rest of the crate
//! never has to re-check them.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// JOB ID
// ============================================================================

/// Strongly-typed job identifier
///
/// Guarantees:
/// - Non-empty
/// - Valid characters (alphanumeric, dash, underscore, dot)
/// - Maximum 64 characters
///
/// Identifiers are opaque, stable and never reused within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Maximum allowed length
    pub const MAX_LENGTH: usize = 64;

    /// Create a new JobId with validation
    pub fn new(id: impl AsRef<str>) -> Result<Self, JobIdError> {
        let id = id.as_ref();

        if id.is_empty() {
            return Err(JobIdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(JobIdError::TooLong(id.len()));
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(JobIdError::InvalidCharacters(id.to_string()));
        }

        Ok(JobId(id.to_string()))
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for JobId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobId::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = JobIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        JobId::new(s)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> String {
        id.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobIdError {
    #[error("Job ID cannot be empty")]
    Empty,
    #[error("Job ID too long ({0} > {})", JobId::MAX_LENGTH)]
    TooLong(usize),
    #[error("Job ID contains invalid characters: {0}")]
    InvalidCharacters(String),
}

// ============================================================================
// RESOURCE NAME
// ============================================================================

/// Strongly-typed name of an execution resource (a backend instance)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
    /// Create a new resource name with validation
    pub fn new(name: impl AsRef<str>) -> Result<Self, ResourceNameError> {
        let name = name.as_ref();

        if name.is_empty() {
            return Err(ResourceNameError::Empty);
        }
        if name.len() > 128 {
            return Err(ResourceNameError::TooLong(name.len()));
        }

        Ok(ResourceName(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceName {
    type Err = ResourceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceName::new(s)
    }
}

impl TryFrom<String> for ResourceName {
    type Error = ResourceNameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ResourceName::new(s)
    }
}

impl From<ResourceName> for String {
    fn from(name: ResourceName) -> String {
        name.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceNameError {
    #[error("Resource name cannot be empty")]
    Empty,
    #[error("Resource name too long ({0} > 128)")]
    TooLong(usize),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_validation() {
        assert!(JobId::new("job-000001").is_ok());
        assert!(JobId::new("stage_2.post").is_ok());
        assert!(JobId::new("UPPER").is_ok());

        assert!(JobId::new("").is_err());
        assert!(JobId::new("job with spaces").is_err());
        assert!(JobId::new("job@7").is_err());
        assert!(JobId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn job_id_serde_round_trip() {
        let id = JobId::new("job-42").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"job-42\"");

        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn job_id_rejects_invalid_on_deserialize() {
        let result: Result<JobId, _> = serde_json::from_str("\"bad id\"");
        assert!(result.is_err());
    }

    #[test]
    fn resource_name_validation() {
        assert!(ResourceName::new("localhost").is_ok());
        assert!(ResourceName::new("slurm @ cluster.example.org").is_ok());
        assert!(ResourceName::new("").is_err());
        assert!(ResourceName::new("x".repeat(129)).is_err());
    }
}
