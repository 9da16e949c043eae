//! ELE PKCS#11: token module for the i.MX93 EdgeLock Enclave
//!
//! Exposes the slot/session/object programming model over the enclave's
//! single serialized mailbox:
//! - **channel**: the serialized device channel, its wire format and a simulated enclave
//! - **object** / **session**: handle tables for keys and sessions
//! - **dispatcher**: per-verb sign/verify/keygen state machines
//! - **module**: the `Module` facade and its lifecycle
//! - **function_list**: the static entry-point table for host loaders

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod function_list;
pub mod logging;
pub mod mechanism;
pub mod module;
pub mod object;
pub mod session;

pub use channel::{DeviceChannel, SimulatedEnclave};
pub use config::{ConfigError, ModuleConfig};
pub use error::{ErrorCategory, ReturnValue, TokenError, TokenResult};
pub use function_list::{function_list, FunctionList, Rv, FUNCTION_LIST};
pub use mechanism::{EcCurve, Mechanism, PrivateKeyTemplate, PublicKeyTemplate};
pub use module::{Module, ModuleState, SlotId, SLOT_ID};
pub use object::{ObjectClass, ObjectFilter, ObjectHandle};
pub use session::{SessionHandle, SessionMode};

