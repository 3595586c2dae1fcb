//! Names of the OS-visible resources shared by one exam
//!
//! Every participant of the same exam derives identical names from the same
//! namespace. Per-attempt channel names embed a fresh uuid, so a name orphaned
//! by a crashed worker never blocks a later attempt.

use uuid::Uuid;

use crate::error::{ExamError, Result};

/// Default namespace shared by teacher, students and observers
pub const DEFAULT_NAMESPACE: &str = "exam";

/// Size of the fixed channel-name fields inside a slot (including the NUL)
pub const CHANNEL_NAME_LEN: usize = 64;

const MAX_NAMESPACE_LEN: usize = 16;

/// Resource names derived from a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Names {
    namespace: String,
}

impl Default for Names {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl Names {
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let invalid = |reason: &str| ExamError::InvalidNamespace {
            namespace: namespace.clone(),
            reason: reason.to_string(),
        };

        if namespace.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if namespace.len() > MAX_NAMESPACE_LEN {
            return Err(invalid("longer than 16 characters"));
        }
        if !namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("only [A-Za-z0-9_-] allowed"));
        }

        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Shared-memory object holding the slot table
    pub fn arena(&self) -> String {
        format!("/{}_shm", self.namespace)
    }

    /// Semaphore serializing slot-table access
    pub fn table_lock(&self) -> String {
        format!("/{}_mutex", self.namespace)
    }

    /// Semaphore counting registrations the teacher has not picked up yet
    pub fn work_ready(&self) -> String {
        format!("/{}_queue", self.namespace)
    }

    /// Fresh (grade, ack) channel names for one exam attempt
    pub fn attempt_channels(&self) -> (String, String) {
        let id = Uuid::now_v7().simple().to_string();
        (
            format!("/{}_grade_{}", self.namespace, id),
            format!("/{}_ack_{}", self.namespace, id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let names = Names::default();
        assert_eq!(names.arena(), "/exam_shm");
        assert_eq!(names.table_lock(), "/exam_mutex");
        assert_eq!(names.work_ready(), "/exam_queue");
    }

    #[test]
    fn test_rejects_bad_namespaces() {
        assert!(Names::new("").is_err());
        assert!(Names::new("has/slash").is_err());
        assert!(Names::new("a".repeat(17)).is_err());
        assert!(Names::new("ok_name-1").is_ok());
    }

    #[test]
    fn test_attempt_channels_are_unique_and_fit_slot_fields() {
        let names = Names::new("a".repeat(16)).unwrap();
        let (grade1, ack1) = names.attempt_channels();
        let (grade2, _) = names.attempt_channels();

        assert_ne!(grade1, grade2);
        assert!(grade1.len() < CHANNEL_NAME_LEN);
        assert!(ack1.len() < CHANNEL_NAME_LEN);
        assert!(grade1.starts_with("/aaaaaaaaaaaaaaaa_grade_"));
    }
}
