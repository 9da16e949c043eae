//! Mechanism dispatcher
//!
//! Per-verb state machine: `Idle -> Initialized(mechanism) -> [Update]* -> Finalized`.
//! Final steps always unbind the operation before talking to the enclave,
//! so a device failure can never leave a session stuck in `Initialized`.
//! Rejections of unsupported mechanisms happen before any state is touched.

use log::{debug, info, warn};

use crate::channel::{Command, DeviceChannel, Opcode, PayloadReader, PayloadWriter, Response, Status};
use crate::error::{TokenError, TokenResult};
use crate::mechanism::{EcCurve, Mechanism, PrivateKeyTemplate, PublicKeyTemplate, Usage};
use crate::object::{Capability, EnclaveRef, KeyAttributes, ObjectHandle, ObjectTable};
use crate::session::{ActiveOperation, OperationKind, SessionHandle, SessionTable};

/// Largest digest the enclave signs or verifies
pub const MAX_DIGEST_LEN: usize = 64;

/// Largest single `generate_random` request
pub const MAX_RANDOM_LEN: usize = 1024;

const USAGE_SIGN: u8 = 0x01;
const USAGE_VERIFY: u8 = 0x02;

/// Binds sessions, objects and the device channel for one call
pub struct Dispatcher<'a> {
    channel: &'a DeviceChannel,
    sessions: &'a SessionTable,
    objects: &'a ObjectTable,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        channel: &'a DeviceChannel,
        sessions: &'a SessionTable,
        objects: &'a ObjectTable,
    ) -> Self {
        Self {
            channel,
            sessions,
            objects,
        }
    }

    /// Generate a key pair inside the enclave and register both halves.
    ///
    /// Nothing is allocated unless the enclave succeeded and returned a
    /// well-formed public point.
    pub fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        public: &PublicKeyTemplate,
        private: &PrivateKeyTemplate,
    ) -> TokenResult<(ObjectHandle, ObjectHandle)> {
        self.sessions.require_read_write(session)?;
        if !mechanism.supports(Usage::GenerateKeyPair) {
            return Err(TokenError::MechanismNotSupported(format!(
                "{} cannot generate key pairs",
                mechanism
            )));
        }
        let curve = check_templates(public, private)?;

        let mut usage = 0;
        if private.sign {
            usage |= USAGE_SIGN;
        }
        if public.verify {
            usage |= USAGE_VERIFY;
        }
        let payload = PayloadWriter::new().u8(curve.wire_id()).u8(usage).finish();
        let response = self.execute(session, Opcode::GenerateKeyPair, payload)?;

        let mut reader = PayloadReader::new(&response.payload);
        let key_id = reader.u32()?;
        let point = reader.bytes16()?.to_vec();
        if point.len() != curve.point_len() || point[0] != 0x04 {
            warn!(
                "Enclave key 0x{:08X} returned a malformed {} point ({} bytes)",
                key_id,
                curve.name(),
                point.len()
            );
            return Err(TokenError::DeviceError(format!(
                "expected {} byte uncompressed point, got {} bytes",
                curve.point_len(),
                point.len()
            )));
        }

        let label = public
            .label
            .clone()
            .or_else(|| private.label.clone())
            .unwrap_or_default();
        let public_attrs = KeyAttributes {
            label: label.clone(),
            id: pick_id(&public.id, &private.id),
            curve: Some(curve),
            ec_point: Some(point),
            verify: public.verify,
            ..Default::default()
        };
        let private_attrs = KeyAttributes {
            label: private.label.clone().unwrap_or(label),
            id: pick_id(&private.id, &public.id),
            curve: Some(curve),
            sign: private.sign,
            sensitive: true,
            extractable: false,
            ..Default::default()
        };
        let (public_handle, private_handle) =
            self.objects
                .allocate_pair(public_attrs, private_attrs, EnclaveRef::new(key_id));
        info!(
            "Generated {} key pair pub={} priv={} in session {}",
            curve.name(),
            public_handle,
            private_handle,
            session
        );
        Ok((public_handle, private_handle))
    }

    /// Remove an object. The enclave key goes with the last object using it;
    /// if the enclave refuses the delete the object is put back.
    pub fn destroy_object(&self, session: SessionHandle, handle: ObjectHandle) -> TokenResult<()> {
        self.sessions.require_read_write(session)?;
        let (entry, last) = self.objects.detach(handle)?;

        if last {
            if let Err(e) = self.delete_enclave_key(session, entry.enclave_ref) {
                self.objects.restore(entry);
                return Err(e);
            }
        }
        debug!("Destroyed object {} in session {}", handle, session);
        Ok(())
    }

    fn delete_enclave_key(&self, session: SessionHandle, enclave_ref: EnclaveRef) -> TokenResult<()> {
        let payload = PayloadWriter::new().u32(enclave_ref.key_id()).finish();
        let response = self
            .channel
            .submit(Command::new(Opcode::DeleteKey, session.wire_id(), payload))?;
        match response.status {
            Status::InvalidKey => {
                warn!("Enclave key 0x{:08X} already gone", enclave_ref.key_id());
                Ok(())
            }
            _ => expect_ok(Opcode::DeleteKey, response).map(|_| ()),
        }
    }

    pub fn sign_init(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
    ) -> TokenResult<()> {
        self.init(session, OperationKind::Sign, mechanism, key)
    }

    pub fn sign_update(&self, session: SessionHandle, data: &[u8]) -> TokenResult<()> {
        self.update(session, OperationKind::Sign, data)
    }

    pub fn sign_final(&self, session: SessionHandle) -> TokenResult<Vec<u8>> {
        let op = self.sessions.take_operation(session, OperationKind::Sign)?;
        self.finish_sign(session, op)
    }

    /// Single-part sign over `data` using the bound operation
    pub fn sign(&self, session: SessionHandle, data: &[u8]) -> TokenResult<Vec<u8>> {
        let mut op = self.sessions.take_single_part(session, OperationKind::Sign)?;
        op.accumulator.update(data);
        self.finish_sign(session, op)
    }

    pub fn verify_init(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
    ) -> TokenResult<()> {
        self.init(session, OperationKind::Verify, mechanism, key)
    }

    pub fn verify_update(&self, session: SessionHandle, data: &[u8]) -> TokenResult<()> {
        self.update(session, OperationKind::Verify, data)
    }

    pub fn verify_final(&self, session: SessionHandle, signature: &[u8]) -> TokenResult<()> {
        let op = self.sessions.take_operation(session, OperationKind::Verify)?;
        self.finish_verify(session, op, signature)
    }

    pub fn verify(&self, session: SessionHandle, data: &[u8], signature: &[u8]) -> TokenResult<()> {
        let mut op = self.sessions.take_single_part(session, OperationKind::Verify)?;
        op.accumulator.update(data);
        self.finish_verify(session, op, signature)
    }

    /// Fetch `len` bytes from the enclave RNG
    pub fn generate_random(&self, session: SessionHandle, len: usize) -> TokenResult<Vec<u8>> {
        self.sessions.require(session)?;
        if len == 0 || len > MAX_RANDOM_LEN {
            return Err(TokenError::DataLenRange {
                actual: len,
                min: 1,
                max: MAX_RANDOM_LEN,
            });
        }
        // MAX_RANDOM_LEN fits in u16
        let payload = PayloadWriter::new().u16(len as u16).finish();
        let response = self.execute(session, Opcode::GetRandom, payload)?;
        if response.payload.len() != len {
            return Err(TokenError::DeviceError(format!(
                "asked for {} random bytes, got {}",
                len,
                response.payload.len()
            )));
        }
        Ok(response.payload)
    }

    /// Side-effect-free rejection for verbs this enclave generation lacks
    pub fn reject<T>(&self, verb: &str, mechanism: Option<Mechanism>) -> TokenResult<T> {
        let what = match mechanism {
            Some(mechanism) => format!("{} via {}", verb, mechanism),
            None => verb.to_string(),
        };
        debug!("Rejecting unsupported {}", what);
        Err(TokenError::MechanismNotSupported(what))
    }

    fn init(
        &self,
        session: SessionHandle,
        kind: OperationKind,
        mechanism: Mechanism,
        key: ObjectHandle,
    ) -> TokenResult<()> {
        self.sessions.require(session)?;
        let (usage, capability) = match kind {
            OperationKind::Sign => (Usage::Sign, Capability::Sign),
            OperationKind::Verify => (Usage::Verify, Capability::Verify),
        };
        if !mechanism.supports(usage) {
            return Err(TokenError::MechanismNotSupported(format!(
                "{} cannot {:?}",
                mechanism, usage
            )));
        }
        self.objects.attributes_match(key, capability)?;
        self.sessions
            .begin_operation(session, ActiveOperation::new(kind, mechanism, key))?;
        debug!(
            "Session {} bound {:?} {} with key {}",
            session, kind, mechanism, key
        );
        Ok(())
    }

    fn update(&self, session: SessionHandle, kind: OperationKind, data: &[u8]) -> TokenResult<()> {
        self.sessions.with_operation(session, kind, |op| {
            if !op.mechanism.is_multi_part() {
                return Err(TokenError::MechanismNotSupported(format!(
                    "{} is single-part",
                    op.mechanism
                )));
            }
            op.accumulator.update(data);
            op.updated = true;
            Ok(())
        })
    }

    fn finish_sign(&self, session: SessionHandle, op: ActiveOperation) -> TokenResult<Vec<u8>> {
        let entry = self.objects.lookup(op.key)?;
        let digest = checked_digest(op.accumulator.finish())?;
        let payload = PayloadWriter::new()
            .u32(entry.enclave_ref.key_id())
            .bytes16(&digest)?
            .finish();
        let response = self.execute(session, Opcode::Sign, payload)?;
        if response.payload.is_empty() {
            return Err(TokenError::DeviceError("enclave returned an empty signature".to_string()));
        }
        debug!(
            "Session {} signed {} byte digest with key {}",
            session,
            digest.len(),
            op.key
        );
        Ok(response.payload)
    }

    fn finish_verify(
        &self,
        session: SessionHandle,
        op: ActiveOperation,
        signature: &[u8],
    ) -> TokenResult<()> {
        let entry = self.objects.lookup(op.key)?;
        if let Some(curve) = entry.attributes.curve {
            check_signature_len(curve, signature)?;
        }
        let digest = checked_digest(op.accumulator.finish())?;
        let payload = PayloadWriter::new()
            .u32(entry.enclave_ref.key_id())
            .bytes16(&digest)?
            .bytes16(signature)?
            .finish();
        self.execute(session, Opcode::Verify, payload)?;
        Ok(())
    }

    fn execute(&self, session: SessionHandle, opcode: Opcode, payload: Vec<u8>) -> TokenResult<Response> {
        let response = self
            .channel
            .submit(Command::new(opcode, session.wire_id(), payload))?;
        expect_ok(opcode, response)
    }
}

fn check_templates(
    public: &PublicKeyTemplate,
    private: &PrivateKeyTemplate,
) -> TokenResult<EcCurve> {
    let curve = public.curve.ok_or_else(|| {
        TokenError::TemplateInconsistent("public key template names no curve".to_string())
    })?;
    if let Some(other) = private.curve {
        if other != curve {
            return Err(TokenError::TemplateInconsistent(format!(
                "public curve {} but private curve {}",
                curve.name(),
                other.name()
            )));
        }
    }
    if private.extractable {
        return Err(TokenError::TemplateInconsistent(
            "enclave private keys cannot be extractable".to_string(),
        ));
    }
    Ok(curve)
}

fn pick_id(own: &[u8], other: &[u8]) -> Vec<u8> {
    if own.is_empty() {
        other.to_vec()
    } else {
        own.to_vec()
    }
}

fn checked_digest(digest: Vec<u8>) -> TokenResult<Vec<u8>> {
    if digest.is_empty() || digest.len() > MAX_DIGEST_LEN {
        return Err(TokenError::DataLenRange {
            actual: digest.len(),
            min: 1,
            max: MAX_DIGEST_LEN,
        });
    }
    Ok(digest)
}

fn check_signature_len(curve: EcCurve, signature: &[u8]) -> TokenResult<()> {
    if signature.len() != curve.signature_len() {
        return Err(TokenError::SignatureLenRange {
            actual: signature.len(),
            expected: curve.signature_len(),
        });
    }
    Ok(())
}

/// Map a non-`Ok` enclave status onto the error taxonomy
fn expect_ok(opcode: Opcode, response: Response) -> TokenResult<Response> {
    match response.status {
        Status::Ok => Ok(response),
        Status::Unsupported => Err(TokenError::MechanismNotSupported(format!(
            "enclave refused {:?}",
            opcode
        ))),
        Status::BadSignature => Err(TokenError::SignatureInvalid),
        Status::InvalidKey => Err(TokenError::DeviceError(format!(
            "enclave does not hold the key for {:?}",
            opcode
        ))),
        Status::Failure => Err(TokenError::DeviceError(format!("{:?} failed in the enclave", opcode))),
    }
}
