//! Session manager
//!
//! Every state transition happens under the table lock, so concurrent callers
//! on the same handle observe begin/end/close atomically. Closing a session
//! with a bound operation abandons the operation; nothing is finalized.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TokenError, TokenResult};
use crate::mechanism::{Accumulator, Mechanism};
use crate::module::{SlotId, SLOT_ID};
use crate::object::ObjectHandle;

/// Opaque session handle, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

impl SessionHandle {
    /// Session tag carried in mailbox frames
    pub fn wire_id(self) -> u32 {
        (self.0 & u64::from(u32::MAX)) as u32
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Sign,
    Verify,
}

/// The cryptographic operation bound to a session between init and final
#[derive(Debug, Clone)]
pub struct ActiveOperation {
    pub kind: OperationKind,
    pub mechanism: Mechanism,
    pub key: ObjectHandle,
    pub accumulator: Accumulator,
    /// Set once a multi-part update has been accepted
    pub updated: bool,
}

impl ActiveOperation {
    pub fn new(kind: OperationKind, mechanism: Mechanism, key: ObjectHandle) -> Self {
        Self {
            kind,
            mechanism,
            key,
            accumulator: mechanism.accumulator(),
            updated: false,
        }
    }
}

/// Snapshot returned by `session_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub slot_id: SlotId,
    pub mode: SessionMode,
    pub operation: Option<(OperationKind, Mechanism)>,
}

struct Session {
    slot_id: SlotId,
    mode: SessionMode,
    operation: Option<ActiveOperation>,
}

struct TableInner {
    next_handle: u64,
    sessions: BTreeMap<SessionHandle, Session>,
}

/// Open sessions and their bound operations
pub struct SessionTable {
    inner: Mutex<TableInner>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_handle: 1,
                sessions: BTreeMap::new(),
            }),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn open(&self, slot_id: SlotId, mode: SessionMode) -> TokenResult<SessionHandle> {
        if slot_id != SLOT_ID {
            return Err(TokenError::SlotIdInvalid(slot_id));
        }
        let mut inner = self.inner.lock();
        if inner.sessions.len() >= self.max_sessions {
            return Err(TokenError::SessionCount(self.max_sessions));
        }
        let handle = SessionHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.sessions.insert(
            handle,
            Session {
                slot_id,
                mode,
                operation: None,
            },
        );
        debug!("Opened session {} ({:?})", handle, mode);
        Ok(handle)
    }

    pub fn close(&self, handle: SessionHandle) -> TokenResult<()> {
        let session = self
            .inner
            .lock()
            .sessions
            .remove(&handle)
            .ok_or(TokenError::SessionHandleInvalid(handle))?;
        if let Some(op) = session.operation {
            debug!(
                "Session {} closed with {:?} {} still bound; abandoned",
                handle, op.kind, op.mechanism
            );
        }
        Ok(())
    }

    /// Force-close every session; returns how many were open
    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let abandoned = inner
            .sessions
            .values()
            .filter(|s| s.operation.is_some())
            .count();
        let closed = inner.sessions.len();
        inner.sessions.clear();
        if closed > 0 {
            debug!(
                "Closed {} session(s), abandoning {} operation(s)",
                closed, abandoned
            );
        }
        closed
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.inner.lock().sessions.contains_key(&handle)
    }

    pub fn info(&self, handle: SessionHandle) -> TokenResult<SessionInfo> {
        let inner = self.inner.lock();
        let session = inner
            .sessions
            .get(&handle)
            .ok_or(TokenError::SessionHandleInvalid(handle))?;
        Ok(SessionInfo {
            handle,
            slot_id: session.slot_id,
            mode: session.mode,
            operation: session.operation.as_ref().map(|op| (op.kind, op.mechanism)),
        })
    }

    /// Fail unless `handle` names an open session
    pub fn require(&self, handle: SessionHandle) -> TokenResult<SessionMode> {
        self.inner
            .lock()
            .sessions
            .get(&handle)
            .map(|s| s.mode)
            .ok_or(TokenError::SessionHandleInvalid(handle))
    }

    /// Fail unless `handle` names an open read-write session
    pub fn require_read_write(&self, handle: SessionHandle) -> TokenResult<()> {
        match self.require(handle)? {
            SessionMode::ReadWrite => Ok(()),
            SessionMode::ReadOnly => Err(TokenError::SessionReadOnly(handle)),
        }
    }

    /// Bind `operation` to the session
    pub fn begin_operation(
        &self,
        handle: SessionHandle,
        operation: ActiveOperation,
    ) -> TokenResult<()> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&handle)
            .ok_or(TokenError::SessionHandleInvalid(handle))?;
        if session.operation.is_some() {
            return Err(TokenError::OperationActive);
        }
        session.operation = Some(operation);
        Ok(())
    }

    /// Unbind whatever operation is bound
    pub fn end_operation(&self, handle: SessionHandle) -> TokenResult<ActiveOperation> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&handle)
            .ok_or(TokenError::SessionHandleInvalid(handle))?;
        session.operation.take().ok_or(TokenError::OperationNotActive)
    }

    /// Unbind the operation only if it is of `kind`
    pub fn take_operation(
        &self,
        handle: SessionHandle,
        kind: OperationKind,
    ) -> TokenResult<ActiveOperation> {
        self.take_where(handle, kind, false)
    }

    /// Unbind the operation of `kind` for a one-shot call. An operation that
    /// already took update data stays bound and answers `OperationActive`.
    pub fn take_single_part(
        &self,
        handle: SessionHandle,
        kind: OperationKind,
    ) -> TokenResult<ActiveOperation> {
        self.take_where(handle, kind, true)
    }

    fn take_where(
        &self,
        handle: SessionHandle,
        kind: OperationKind,
        single_part: bool,
    ) -> TokenResult<ActiveOperation> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&handle)
            .ok_or(TokenError::SessionHandleInvalid(handle))?;
        match &session.operation {
            Some(op) if op.kind != kind => return Err(TokenError::OperationNotActive),
            Some(op) if single_part && op.updated => return Err(TokenError::OperationActive),
            Some(_) => {}
            None => return Err(TokenError::OperationNotActive),
        }
        session.operation.take().ok_or(TokenError::OperationNotActive)
    }

    /// Run `f` against the bound operation of `kind` while holding the lock
    pub fn with_operation<R, F>(&self, handle: SessionHandle, kind: OperationKind, f: F) -> TokenResult<R>
    where
        F: FnOnce(&mut ActiveOperation) -> TokenResult<R>,
    {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&handle)
            .ok_or(TokenError::SessionHandleInvalid(handle))?;
        match session.operation.as_mut() {
            Some(op) if op.kind == kind => f(op),
            _ => Err(TokenError::OperationNotActive),
        }
    }

    /// `(total, read_write)` open session counts
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let rw = inner
            .sessions
            .values()
            .filter(|s| s.mode == SessionMode::ReadWrite)
            .count();
        (inner.sessions.len(), rw)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn sign_op() -> ActiveOperation {
        ActiveOperation::new(OperationKind::Sign, Mechanism::EcdsaSha256, ObjectHandle(2))
    }

    #[test]
    fn test_live_handles_never_collide() {
        let table = SessionTable::new(16);
        let mut live = Vec::new();
        let mut seen = HashSet::new();
        for round in 0..40 {
            if round % 3 == 2 {
                let h = live.remove(0);
                table.close(h).unwrap();
            } else {
                let h = table.open(SLOT_ID, SessionMode::ReadOnly).unwrap();
                assert!(seen.insert(h), "handle {} handed out twice", h);
                live.push(h);
            }
        }
        assert_eq!(table.counts().0, live.len());
    }

    #[test]
    fn test_invalid_slot_and_limit() {
        let table = SessionTable::new(2);
        assert!(matches!(
            table.open(1, SessionMode::ReadWrite),
            Err(TokenError::SlotIdInvalid(1))
        ));
        table.open(SLOT_ID, SessionMode::ReadWrite).unwrap();
        table.open(SLOT_ID, SessionMode::ReadOnly).unwrap();
        assert!(matches!(
            table.open(SLOT_ID, SessionMode::ReadOnly),
            Err(TokenError::SessionCount(2))
        ));
        assert_eq!(table.counts(), (2, 1));
    }

    #[test]
    fn test_operation_binding() {
        let table = SessionTable::new(4);
        let h = table.open(SLOT_ID, SessionMode::ReadWrite).unwrap();

        assert!(matches!(
            table.end_operation(h),
            Err(TokenError::OperationNotActive)
        ));
        table.begin_operation(h, sign_op()).unwrap();
        assert!(matches!(
            table.begin_operation(h, sign_op()),
            Err(TokenError::OperationActive)
        ));
        assert_eq!(
            table.info(h).unwrap().operation,
            Some((OperationKind::Sign, Mechanism::EcdsaSha256))
        );

        // wrong kind leaves the binding alone
        assert!(matches!(
            table.take_operation(h, OperationKind::Verify),
            Err(TokenError::OperationNotActive)
        ));
        let op = table.take_operation(h, OperationKind::Sign).unwrap();
        assert_eq!(op.key, ObjectHandle(2));
        assert!(table.info(h).unwrap().operation.is_none());
    }

    #[test]
    fn test_single_part_take_after_update() {
        let table = SessionTable::new(4);
        let h = table.open(SLOT_ID, SessionMode::ReadWrite).unwrap();
        table.begin_operation(h, sign_op()).unwrap();
        table
            .with_operation(h, OperationKind::Sign, |op| {
                op.updated = true;
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            table.take_single_part(h, OperationKind::Sign),
            Err(TokenError::OperationActive)
        ));
        assert!(table.info(h).unwrap().operation.is_some());
        assert!(table.take_operation(h, OperationKind::Sign).unwrap().updated);
    }

    #[test]
    fn test_close_abandons_operation() {
        let table = SessionTable::new(4);
        let h = table.open(SLOT_ID, SessionMode::ReadWrite).unwrap();
        table.begin_operation(h, sign_op()).unwrap();
        table.close(h).unwrap();

        assert!(matches!(
            table.close(h),
            Err(TokenError::SessionHandleInvalid(_))
        ));
        assert!(matches!(
            table.end_operation(h),
            Err(TokenError::SessionHandleInvalid(_))
        ));
    }

    #[test]
    fn test_close_all_and_read_only() {
        let table = SessionTable::new(4);
        let ro = table.open(SLOT_ID, SessionMode::ReadOnly).unwrap();
        let rw = table.open(SLOT_ID, SessionMode::ReadWrite).unwrap();
        table.begin_operation(rw, sign_op()).unwrap();

        assert!(matches!(
            table.require_read_write(ro),
            Err(TokenError::SessionReadOnly(_))
        ));
        assert!(table.require_read_write(rw).is_ok());

        assert_eq!(table.close_all(), 2);
        assert!(table.is_empty());
        let next = table.open(SLOT_ID, SessionMode::ReadOnly).unwrap();
        assert!(next > rw);
    }

    #[test]
    fn test_concurrent_begin_on_same_session() {
        let table = Arc::new(SessionTable::new(4));
        let h = table.open(SLOT_ID, SessionMode::ReadWrite).unwrap();

        let winners: usize = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.begin_operation(h, sign_op()).is_ok())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| usize::from(t.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }
}
