//! Directive status codes and fatal error sources.
//!
//! Every directive validates its arguments before it mutates anything and
//! reports failure through [`Status`]. Conditions the system cannot recover
//! from do not produce a status at all: they go through the fatal path, which
//! calls the configured fatal handler and unwinds with a [`Fatal`] payload.

use core::fmt;

use thiserror::Error;

/// Failure status of a directive. Success is `Ok(_)`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    #[error("invalid object id")]
    InvalidId,
    #[error("invalid object name")]
    InvalidName,
    #[error("directive not defined for this object")]
    NotDefined,
    #[error("resource still in use")]
    ResourceInUse,
    #[error("wait timed out")]
    Timeout,
    #[error("directive called from interrupt context")]
    CalledFromIsr,
    #[error("directive not implemented in this configuration")]
    NotImplemented,
    #[error("too many objects")]
    TooMany,
    #[error("invalid priority")]
    InvalidPriority,
    #[error("invalid number")]
    InvalidNumber,
    #[error("invalid size")]
    InvalidSize,
    #[error("request not satisfied")]
    Unsatisfied,
    #[error("object in incorrect state")]
    IncorrectState,
    #[error("task already suspended")]
    AlreadySuspended,
    #[error("caller does not own the resource")]
    NotOwnerOfResource,
    #[error("object deleted while waiting")]
    ObjectWasDeleted,
    /// The calling task is now blocked. Its body returns
    /// [`TaskAction::Blocked`](crate::task::TaskAction::Blocked) and repeats
    /// the same directive once it runs again; the repeated call yields the
    /// outcome of the wait.
    #[error("caller blocked")]
    WouldBlock,
}

/// Result of a directive.
pub type Result<T> = core::result::Result<T, Status>;

/// Origin of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FatalSource {
    /// Kernel internal consistency violation, see [`InternalError`].
    InternalError,
    /// Raised by application code through [`Context::fatal`](crate::Context::fatal).
    Application,
}

/// Codes reported with [`FatalSource::InternalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InternalError {
    /// A life-changing directive ran with thread dispatching disabled.
    BadThreadDispatchDisableLevel = 1,
    /// A blocking directive ran with thread dispatching disabled.
    BadThreadDispatchEnvironment = 2,
}

impl InternalError {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::BadThreadDispatchDisableLevel),
            2 => Some(Self::BadThreadDispatchEnvironment),
            _ => None,
        }
    }
}

/// Unwind payload of a fatal halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fatal {
    pub source: FatalSource,
    pub code: u32,
}

impl Fatal {
    pub(crate) fn internal(error: InternalError) -> Self {
        Self {
            source: FatalSource::InternalError,
            code: error.code(),
        }
    }

    pub fn internal_error(&self) -> Option<InternalError> {
        match self.source {
            FatalSource::InternalError => InternalError::from_code(self.code),
            FatalSource::Application => None,
        }
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.internal_error() {
            Some(error) => write!(f, "fatal internal error {error:?}"),
            None => write!(f, "fatal error {:?} code {}", self.source, self.code),
        }
    }
}

/// Unwind payload used by directives that do not return to the calling task
/// (self delete, exit, self restart). Caught by the dispatcher.
#[derive(Debug)]
pub(crate) struct TaskExit;
