//! Transport seams between the channel and the physical mailbox
//!
//! A [`Connector`] produces a [`Transport`] each time the channel is opened.
//! The transport only moves frames: it writes one command and reads whatever
//! frame the mailbox yields next. Matching replies to commands, timeouts and
//! serialization belong to the channel.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Largest reply the mailbox driver hands back in one read
pub const MAX_RESPONSE_LEN: usize = 4096;

/// One open link to the enclave
pub trait Transport: Send {
    /// Write one encoded command
    fn send(&mut self, request: &[u8]) -> io::Result<()>;

    /// Block until the next encoded frame is read. It may answer an
    /// earlier command.
    fn receive(&mut self) -> io::Result<Vec<u8>>;

    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        self.send(request)?;
        self.receive()
    }
}

/// Factory for [`Transport`]s
pub trait Connector: Send + Sync {
    fn connect(&self) -> io::Result<Box<dyn Transport>>;

    /// Human-readable location for diagnostics
    fn location(&self) -> String;
}

/// Connector for the character device exposed by the ELE mailbox driver
#[derive(Debug, Clone)]
pub struct MailboxConnector {
    path: PathBuf,
}

impl MailboxConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for MailboxConnector {
    fn connect(&self) -> io::Result<Box<dyn Transport>> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        log::debug!("Opened enclave mailbox {}", self.path.display());
        Ok(Box::new(MailboxTransport {
            file,
            buf: vec![0u8; MAX_RESPONSE_LEN],
        }))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Blocking read/write transport over the mailbox node
struct MailboxTransport {
    file: File,
    buf: Vec<u8>,
}

impl Transport for MailboxTransport {
    fn send(&mut self, request: &[u8]) -> io::Result<()> {
        self.file.write_all(request)?;
        self.file.flush()
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        let n = self.file.read(&mut self.buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mailbox closed without a reply",
            ));
        }
        Ok(self.buf[..n].to_vec())
    }
}

/// Whether the enclave node exists, without opening it
pub fn device_present(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}
