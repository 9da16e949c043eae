//! Error taxonomy for the token module
//!
//! Every public entry point returns `Result<T, TokenError>`. At the host
//! boundary the error collapses into a numeric [`ReturnValue`] using the
//! PKCS#11 `CKR_*` numbering.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::object::{Capability, ObjectHandle};
use crate::session::SessionHandle;

/// Result alias used throughout the crate
pub type TokenResult<T> = Result<T, TokenError>;

/// Coarse grouping of [`TokenError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    ModuleState,
    SlotOrSession,
    Object,
    Operation,
    Device,
}

/// All failures the module can surface to a caller
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("module is not initialized")]
    NotInitialized,

    #[error("module is already initialized")]
    AlreadyInitialized,

    #[error("slot id {0} is not valid")]
    SlotIdInvalid(u64),

    #[error("session handle {0} is not valid")]
    SessionHandleInvalid(SessionHandle),

    #[error("session {0} is read-only")]
    SessionReadOnly(SessionHandle),

    #[error("session limit of {0} reached")]
    SessionCount(usize),

    #[error("object handle {0} is not valid")]
    InvalidHandle(ObjectHandle),

    #[error("object {handle} does not permit {required:?}")]
    KeyAttributeMismatch {
        handle: ObjectHandle,
        required: Capability,
    },

    #[error("inconsistent template: {0}")]
    TemplateInconsistent(String),

    #[error("no operation is active on the session")]
    OperationNotActive,

    #[error("an operation is already active on the session")]
    OperationActive,

    #[error("mechanism not supported: {0}")]
    MechanismNotSupported(String),

    #[error("data length {actual} outside accepted range {min}..={max}")]
    DataLenRange { actual: usize, min: usize, max: usize },

    #[error("signature is invalid")]
    SignatureInvalid,

    #[error("signature length {actual} does not match expected {expected}")]
    SignatureLenRange { actual: usize, expected: usize },

    #[error("enclave device unavailable at {path}: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    #[error("enclave channel busy: waited {0:?} for a turn")]
    DeviceBusy(Duration),

    #[error("enclave did not answer within {0:?}")]
    DeviceTimeout(Duration),

    #[error("enclave device error: {0}")]
    DeviceError(String),

    #[error("enclave did not respond to probe: {0}")]
    DeviceNotResponsive(String),
}

impl TokenError {
    /// Which taxonomy bucket this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            TokenError::NotInitialized | TokenError::AlreadyInitialized => {
                ErrorCategory::ModuleState
            }
            TokenError::SlotIdInvalid(_)
            | TokenError::SessionHandleInvalid(_)
            | TokenError::SessionReadOnly(_)
            | TokenError::SessionCount(_) => ErrorCategory::SlotOrSession,
            TokenError::InvalidHandle(_)
            | TokenError::KeyAttributeMismatch { .. }
            | TokenError::TemplateInconsistent(_) => ErrorCategory::Object,
            TokenError::OperationNotActive
            | TokenError::OperationActive
            | TokenError::MechanismNotSupported(_)
            | TokenError::DataLenRange { .. }
            | TokenError::SignatureInvalid
            | TokenError::SignatureLenRange { .. } => ErrorCategory::Operation,
            TokenError::DeviceUnavailable { .. }
            | TokenError::DeviceBusy(_)
            | TokenError::DeviceTimeout(_)
            | TokenError::DeviceError(_)
            | TokenError::DeviceNotResponsive(_) => ErrorCategory::Device,
        }
    }

    /// Host status code for this error
    pub fn return_value(&self) -> ReturnValue {
        match self {
            TokenError::NotInitialized => ReturnValue::CRYPTOKI_NOT_INITIALIZED,
            TokenError::AlreadyInitialized => ReturnValue::CRYPTOKI_ALREADY_INITIALIZED,
            TokenError::SlotIdInvalid(_) => ReturnValue::SLOT_ID_INVALID,
            TokenError::SessionHandleInvalid(_) => ReturnValue::SESSION_HANDLE_INVALID,
            TokenError::SessionReadOnly(_) => ReturnValue::SESSION_READ_ONLY,
            TokenError::SessionCount(_) => ReturnValue::SESSION_COUNT,
            TokenError::InvalidHandle(_) => ReturnValue::OBJECT_HANDLE_INVALID,
            TokenError::KeyAttributeMismatch { .. } => ReturnValue::KEY_FUNCTION_NOT_PERMITTED,
            TokenError::TemplateInconsistent(_) => ReturnValue::TEMPLATE_INCONSISTENT,
            TokenError::OperationNotActive => ReturnValue::OPERATION_NOT_INITIALIZED,
            TokenError::OperationActive => ReturnValue::OPERATION_ACTIVE,
            TokenError::MechanismNotSupported(_) => ReturnValue::MECHANISM_INVALID,
            TokenError::DataLenRange { .. } => ReturnValue::DATA_LEN_RANGE,
            TokenError::SignatureInvalid => ReturnValue::SIGNATURE_INVALID,
            TokenError::SignatureLenRange { .. } => ReturnValue::SIGNATURE_LEN_RANGE,
            TokenError::DeviceUnavailable { .. } => ReturnValue::DEVICE_REMOVED,
            TokenError::DeviceBusy(_) => ReturnValue::FUNCTION_FAILED,
            TokenError::DeviceTimeout(_)
            | TokenError::DeviceError(_)
            | TokenError::DeviceNotResponsive(_) => ReturnValue::DEVICE_ERROR,
        }
    }
}

/// Numeric status handed across the host boundary (`CK_RV`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReturnValue(pub u64);

impl ReturnValue {
    pub const OK: Self = Self(0x0000_0000);
    pub const SLOT_ID_INVALID: Self = Self(0x0000_0003);
    pub const FUNCTION_FAILED: Self = Self(0x0000_0006);
    pub const DATA_LEN_RANGE: Self = Self(0x0000_0021);
    pub const DEVICE_ERROR: Self = Self(0x0000_0030);
    pub const DEVICE_REMOVED: Self = Self(0x0000_0032);
    pub const KEY_FUNCTION_NOT_PERMITTED: Self = Self(0x0000_0068);
    pub const MECHANISM_INVALID: Self = Self(0x0000_0070);
    pub const OBJECT_HANDLE_INVALID: Self = Self(0x0000_0082);
    pub const OPERATION_ACTIVE: Self = Self(0x0000_0090);
    pub const OPERATION_NOT_INITIALIZED: Self = Self(0x0000_0091);
    pub const SESSION_COUNT: Self = Self(0x0000_00B1);
    pub const SESSION_HANDLE_INVALID: Self = Self(0x0000_00B3);
    pub const SESSION_READ_ONLY: Self = Self(0x0000_00B5);
    pub const SIGNATURE_INVALID: Self = Self(0x0000_00C0);
    pub const SIGNATURE_LEN_RANGE: Self = Self(0x0000_00C1);
    pub const TEMPLATE_INCONSISTENT: Self = Self(0x0000_00D1);
    pub const CRYPTOKI_NOT_INITIALIZED: Self = Self(0x0000_0190);
    pub const CRYPTOKI_ALREADY_INITIALIZED: Self = Self(0x0000_0191);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<TokenError> for ReturnValue {
    fn from(err: TokenError) -> Self {
        err.return_value()
    }
}

impl From<&TokenError> for ReturnValue {
    fn from(err: &TokenError) -> Self {
        err.return_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(TokenError::NotInitialized.category(), ErrorCategory::ModuleState);
        assert_eq!(
            TokenError::SlotIdInvalid(3).category(),
            ErrorCategory::SlotOrSession
        );
        assert_eq!(
            TokenError::InvalidHandle(ObjectHandle(9)).category(),
            ErrorCategory::Object
        );
        assert_eq!(TokenError::OperationActive.category(), ErrorCategory::Operation);
        assert_eq!(
            TokenError::DeviceTimeout(Duration::from_millis(5)).category(),
            ErrorCategory::Device
        );
    }

    #[test]
    fn test_return_values() {
        let rv: ReturnValue = TokenError::AlreadyInitialized.into();
        assert_eq!(rv, ReturnValue(0x191));
        assert_eq!(
            ReturnValue::from(TokenError::MechanismNotSupported("AES-GCM".into())),
            ReturnValue::MECHANISM_INVALID
        );
        assert_eq!(
            ReturnValue::from(TokenError::DeviceUnavailable {
                path: "/dev/ele_mu".into(),
                reason: "missing".into(),
            }),
            ReturnValue::DEVICE_REMOVED
        );
        assert!(ReturnValue::OK.is_ok());
        assert_eq!(ReturnValue::SESSION_HANDLE_INVALID.to_string(), "0x000000B3");
    }

    #[test]
    fn test_error_display() {
        let err = TokenError::KeyAttributeMismatch {
            handle: ObjectHandle(4),
            required: Capability::Sign,
        };
        assert!(err.to_string().contains("Sign"));
        assert!(TokenError::SessionHandleInvalid(SessionHandle(7))
            .to_string()
            .contains('7'));
    }
}
