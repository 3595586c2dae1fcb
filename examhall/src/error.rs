//! Exam coordination error types

use nix::errno::Errno;
use thiserror::Error;

use crate::arena::SlotState;

/// Errors raised by the coordination core
#[derive(Debug, Error)]
pub enum ExamError {
    #[error("Capacity {capacity} out of range (must be 1..={max})")]
    InvalidCapacity { capacity: u32, max: u32 },

    #[error("Invalid namespace '{namespace}': {reason}")]
    InvalidNamespace { namespace: String, reason: String },

    #[error("Invalid resource name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Resource already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Permission denied for resource: {name}")]
    PermissionDenied { name: String },

    #[error("Resource not found: {name}")]
    NotFound { name: String },

    #[error("Shared arena has a corrupt layout: {0}")]
    CorruptLayout(String),

    #[error("Invalid slot transition {from} -> {to}")]
    InvalidTransition { from: SlotState, to: SlotState },

    #[error("Slot index {index} out of range (capacity {capacity})")]
    SlotOutOfRange { index: usize, capacity: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("System call failed on {name}: {errno}")]
    Os { name: String, errno: Errno },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExamError {
    /// Build an OS error from the current `errno`
    pub(crate) fn last_os(name: &str) -> Self {
        Self::from_errno(name, Errno::last())
    }

    /// Map an errno from a create/open call onto the resource taxonomy
    pub(crate) fn from_errno(name: &str, errno: Errno) -> Self {
        let name = name.to_string();
        match errno {
            Errno::EEXIST => Self::AlreadyExists { name },
            Errno::EACCES | Errno::EPERM => Self::PermissionDenied { name },
            Errno::ENOENT => Self::NotFound { name },
            Errno::EINVAL | Errno::ENAMETOOLONG => Self::InvalidName {
                name,
                reason: errno.desc().to_string(),
            },
            errno => Self::Os { name, errno },
        }
    }

    /// The peer (or coordinator) resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExamError::NotFound { .. })
    }

    /// Configuration errors are fatal to the process and never retried
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ExamError::InvalidCapacity { .. }
                | ExamError::InvalidNamespace { .. }
                | ExamError::InvalidConfig(_)
                | ExamError::NotFound { .. }
                | ExamError::CorruptLayout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ExamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert!(matches!(
            ExamError::from_errno("/x", Errno::EEXIST),
            ExamError::AlreadyExists { .. }
        ));
        assert!(matches!(
            ExamError::from_errno("/x", Errno::EACCES),
            ExamError::PermissionDenied { .. }
        ));
        assert!(ExamError::from_errno("/x", Errno::ENOENT).is_not_found());
        assert!(matches!(
            ExamError::from_errno("/x", Errno::EIO),
            ExamError::Os { errno: Errno::EIO, .. }
        ));
    }

    #[test]
    fn test_config_error_classification() {
        assert!(ExamError::InvalidCapacity { capacity: 0, max: 1024 }.is_config_error());
        assert!(ExamError::CorruptLayout("short".to_string()).is_config_error());
        assert!(!ExamError::AlreadyExists { name: "/a".to_string() }.is_config_error());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = ExamError::InvalidTransition {
            from: SlotState::Empty,
            to: SlotState::Processing,
        };
        let msg = err.to_string();
        assert!(msg.contains("empty"));
        assert!(msg.contains("processing"));
    }
}
