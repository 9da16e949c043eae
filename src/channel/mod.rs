//! Device channel to the EdgeLock Enclave
//!
//! - **frame**: command/response wire encoding
//! - **transport**: connector and transport seams, plus the mailbox node transport
//! - **device**: the serialized `DeviceChannel`
//! - **simulated**: software enclave for development hosts and tests

pub mod device;
pub mod frame;
pub mod simulated;
pub mod transport;

pub use device::{ChannelTimeouts, DeviceChannel};
pub use frame::{Command, FrameError, Opcode, PayloadReader, PayloadWriter, Response, Status};
pub use simulated::{Fault, SimulatedEnclave};
pub use transport::{device_present, Connector, MailboxConnector, Transport};
