//! Object table: host handles for enclave-resident keys
//!
//! Handles come from a monotonic counter that survives `clear()`, so a handle
//! is never handed out twice in one process. The enclave-side reference is
//! kept inside the crate and never returned to callers.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TokenError, TokenResult};
use crate::mechanism::EcCurve;

/// Opaque, process-scoped object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
    SecretKey,
}

/// A use a key can be put to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    Derive,
}

impl Capability {
    /// Object classes that may carry this capability at all
    fn permits_class(self, class: ObjectClass) -> bool {
        match self {
            Capability::Sign | Capability::Decrypt | Capability::Derive => {
                matches!(class, ObjectClass::PrivateKey | ObjectClass::SecretKey)
            }
            Capability::Verify | Capability::Encrypt => {
                matches!(class, ObjectClass::PublicKey | ObjectClass::SecretKey)
            }
        }
    }
}

/// Attributes mirrored from the enclave when the object was created
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyAttributes {
    pub label: String,
    pub id: Vec<u8>,
    pub curve: Option<EcCurve>,
    /// Uncompressed EC point, public keys only
    pub ec_point: Option<Vec<u8>>,
    pub sign: bool,
    pub verify: bool,
    pub encrypt: bool,
    pub decrypt: bool,
    pub derive: bool,
    pub extractable: bool,
    pub sensitive: bool,
}

impl KeyAttributes {
    pub fn permits(&self, capability: Capability) -> bool {
        match capability {
            Capability::Sign => self.sign,
            Capability::Verify => self.verify,
            Capability::Encrypt => self.encrypt,
            Capability::Decrypt => self.decrypt,
            Capability::Derive => self.derive,
        }
    }
}

/// Enclave-side key identifier; opaque outside the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnclaveRef(u32);

impl EnclaveRef {
    pub(crate) fn new(key_id: u32) -> Self {
        Self(key_id)
    }

    pub(crate) fn key_id(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub handle: ObjectHandle,
    pub class: ObjectClass,
    pub attributes: KeyAttributes,
    pub(crate) enclave_ref: EnclaveRef,
}

/// Search criteria for `find`; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFilter {
    pub class: Option<ObjectClass>,
    pub label: Option<String>,
    pub id: Option<Vec<u8>>,
}

impl ObjectFilter {
    fn matches(&self, entry: &ObjectEntry) -> bool {
        self.class.map_or(true, |c| c == entry.class)
            && self
                .label
                .as_ref()
                .map_or(true, |l| *l == entry.attributes.label)
            && self.id.as_ref().map_or(true, |id| *id == entry.attributes.id)
    }
}

struct TableInner {
    next_handle: u64,
    entries: BTreeMap<ObjectHandle, ObjectEntry>,
}

/// All objects known to the module
pub struct ObjectTable {
    inner: Mutex<TableInner>,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_handle: 1,
                entries: BTreeMap::new(),
            }),
        }
    }

    /// Register a new object under a fresh handle
    pub fn allocate(
        &self,
        class: ObjectClass,
        attributes: KeyAttributes,
        enclave_ref: EnclaveRef,
    ) -> ObjectHandle {
        let mut inner = self.inner.lock();
        inner.insert(class, attributes, enclave_ref)
    }

    /// Register both halves of a key pair in one step
    pub fn allocate_pair(
        &self,
        public: KeyAttributes,
        private: KeyAttributes,
        enclave_ref: EnclaveRef,
    ) -> (ObjectHandle, ObjectHandle) {
        let mut inner = self.inner.lock();
        let public = inner.insert(ObjectClass::PublicKey, public, enclave_ref);
        let private = inner.insert(ObjectClass::PrivateKey, private, enclave_ref);
        (public, private)
    }

    pub fn lookup(&self, handle: ObjectHandle) -> TokenResult<ObjectEntry> {
        self.inner
            .lock()
            .entries
            .get(&handle)
            .cloned()
            .ok_or(TokenError::InvalidHandle(handle))
    }

    pub fn destroy(&self, handle: ObjectHandle) -> TokenResult<ObjectEntry> {
        self.inner
            .lock()
            .entries
            .remove(&handle)
            .ok_or(TokenError::InvalidHandle(handle))
    }

    /// Remove `handle` and report whether it was the last object backed by
    /// its enclave key. Both happen under one lock, so of two concurrent
    /// detaches of a key pair exactly one sees itself as last.
    pub(crate) fn detach(&self, handle: ObjectHandle) -> TokenResult<(ObjectEntry, bool)> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .remove(&handle)
            .ok_or(TokenError::InvalidHandle(handle))?;
        let last = !inner
            .entries
            .values()
            .any(|e| e.enclave_ref == entry.enclave_ref);
        Ok((entry, last))
    }

    /// Put a detached entry back under its original handle
    pub(crate) fn restore(&self, entry: ObjectEntry) {
        self.inner.lock().entries.insert(entry.handle, entry);
    }

    /// Look up `handle` and require that it may be used for `required`
    pub fn attributes_match(
        &self,
        handle: ObjectHandle,
        required: Capability,
    ) -> TokenResult<ObjectEntry> {
        let entry = self.lookup(handle)?;
        if !required.permits_class(entry.class) || !entry.attributes.permits(required) {
            return Err(TokenError::KeyAttributeMismatch { handle, required });
        }
        Ok(entry)
    }

    /// Number of live objects sharing one enclave key
    pub fn references(&self, enclave_ref: EnclaveRef) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.enclave_ref == enclave_ref)
            .count()
    }

    /// Handles matching `filter`, in ascending order
    pub fn find(&self, filter: &ObjectFilter) -> Vec<ObjectHandle> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .map(|e| e.handle)
            .collect()
    }

    /// Drop every entry; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TableInner {
    fn insert(
        &mut self,
        class: ObjectClass,
        attributes: KeyAttributes,
        enclave_ref: EnclaveRef,
    ) -> ObjectHandle {
        let handle = ObjectHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(
            handle,
            ObjectEntry {
                handle,
                class,
                attributes,
                enclave_ref,
            },
        );
        handle
    }
}
