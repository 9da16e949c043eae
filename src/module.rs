//! Module facade
//!
//! `Module` is the explicitly constructed context behind every entry point.
//! Its lifecycle is `Uninitialized -> Initialized -> Uninitialized`, and tests
//! may run as many independent instances as they like.
//!
//! Every entry point holds a shared guard on the module state for its whole
//! duration; `finalize` takes the exclusive guard, so it only tears down once
//! in-flight calls (and their device commands) have finished or timed out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{ChannelTimeouts, Connector, DeviceChannel, MailboxConnector, SimulatedEnclave};
use crate::config::{ConfigError, ModuleConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{TokenError, TokenResult};
use crate::logging;
use crate::mechanism::{
    Mechanism, MechanismInfo, PrivateKeyTemplate, PublicKeyTemplate, SUPPORTED_MECHANISMS,
};
use crate::object::{ObjectEntry, ObjectFilter, ObjectHandle, ObjectTable};
use crate::session::{SessionHandle, SessionInfo, SessionMode, SessionTable};

pub type SlotId = u64;

/// The one slot this module exposes
pub const SLOT_ID: SlotId = 0;

pub const MANUFACTURER_ID: &str = "NXP EdgeLock Enclave";
pub const TOKEN_MODEL: &str = "i.MX93 ELE";
const LIBRARY_DESCRIPTION: &str = "ELE PKCS#11 token module";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    Uninitialized,
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// Interface version implemented by the function table
pub const CRYPTOKI_VERSION: Version = Version {
    major: 2,
    minor: 40,
};

/// Static slot descriptor returned by `enumerate_slots`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub token_present: bool,
    pub supports_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub cryptoki_version: Version,
    pub manufacturer_id: String,
    pub library_description: String,
    pub library_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_id: SlotId,
    pub description: String,
    pub manufacturer_id: String,
    /// Where the enclave is reached, e.g. the mailbox node
    pub location: String,
    pub token_present: bool,
    pub hardware_slot: bool,
    pub removable_device: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFlags {
    pub rng: bool,
    pub token_initialized: bool,
    pub login_required: bool,
    pub write_protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: TokenFlags,
    pub session_count: usize,
    pub rw_session_count: usize,
    pub max_session_count: usize,
    pub utc_time: DateTime<Utc>,
}

/// One token module instance bound to one enclave channel
pub struct Module {
    id: Uuid,
    config: ModuleConfig,
    state: RwLock<ModuleState>,
    channel: DeviceChannel,
    sessions: SessionTable,
    objects: ObjectTable,
}

impl Module {
    pub fn new(config: ModuleConfig, connector: Arc<dyn Connector>) -> Self {
        let channel = DeviceChannel::new(connector, ChannelTimeouts::from_config(&config));
        let sessions = SessionTable::new(config.max_sessions);
        Self {
            id: Uuid::new_v4(),
            config,
            state: RwLock::new(ModuleState::Uninitialized),
            channel,
            sessions,
            objects: ObjectTable::new(),
        }
    }

    /// Module talking to the mailbox node named in `config`
    pub fn with_device(config: ModuleConfig) -> Self {
        let connector = MailboxConnector::new(config.device_path.clone());
        Self::new(config, Arc::new(connector))
    }

    /// Module configured from the process environment, with logging installed
    pub fn from_env() -> Result<Self, ConfigError> {
        logging::init();
        let config = ModuleConfig::from_env()?;
        Ok(Self::with_device(config))
    }

    /// Module backed by a software enclave
    pub fn simulated(enclave: &SimulatedEnclave) -> Self {
        Self::simulated_with(ModuleConfig::default(), enclave)
    }

    pub fn simulated_with(config: ModuleConfig, enclave: &SimulatedEnclave) -> Self {
        Self::new(config, Arc::new(enclave.clone()))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }

    pub fn channel(&self) -> &DeviceChannel {
        &self.channel
    }

    /// Object table, reachable in any state
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    // --- Lifecycle ---

    /// Open the device channel and probe the enclave
    pub fn initialize(&self) -> TokenResult<()> {
        let mut state = self.state.write();
        if *state == ModuleState::Initialized {
            return Err(TokenError::AlreadyInitialized);
        }
        self.channel.open()?;
        if let Err(e) = self.channel.probe() {
            warn!("Enclave probe failed on {}: {}", self.channel.location(), e);
            self.channel.close();
            return Err(e);
        }
        *state = ModuleState::Initialized;
        info!(
            "Module {} initialized on {}",
            self.id,
            self.channel.location()
        );
        Ok(())
    }

    /// Close every session, forget every object and release the channel
    pub fn finalize(&self) -> TokenResult<()> {
        let mut state = self.state.write();
        if *state == ModuleState::Uninitialized {
            return Err(TokenError::NotInitialized);
        }
        let sessions = self.sessions.close_all();
        let objects = self.objects.clear();
        self.channel.close();
        *state = ModuleState::Uninitialized;
        info!(
            "Module {} finalized ({} sessions closed, {} objects dropped)",
            self.id, sessions, objects
        );
        Ok(())
    }

    pub fn info(&self) -> TokenResult<ModuleInfo> {
        self.guarded(|| {
            Ok(ModuleInfo {
                cryptoki_version: CRYPTOKI_VERSION,
                manufacturer_id: MANUFACTURER_ID.to_string(),
                library_description: LIBRARY_DESCRIPTION.to_string(),
                library_version: env!("CARGO_PKG_VERSION").to_string(),
            })
        })
    }

    // --- Slots, token, mechanisms ---

    pub fn enumerate_slots(&self) -> TokenResult<Vec<Slot>> {
        self.guarded(|| {
            Ok(vec![Slot {
                id: SLOT_ID,
                token_present: self.channel.is_open(),
                supports_read_only: true,
            }])
        })
    }

    pub fn slot_info(&self, slot: SlotId) -> TokenResult<SlotInfo> {
        self.guarded(|| {
            check_slot(slot)?;
            Ok(SlotInfo {
                slot_id: SLOT_ID,
                description: "EdgeLock Enclave mailbox".to_string(),
                manufacturer_id: MANUFACTURER_ID.to_string(),
                location: self.channel.location(),
                token_present: self.channel.is_open(),
                hardware_slot: true,
                removable_device: false,
            })
        })
    }

    pub fn token_info(&self, slot: SlotId) -> TokenResult<TokenInfo> {
        self.guarded(|| {
            check_slot(slot)?;
            let (session_count, rw_session_count) = self.sessions.counts();
            Ok(TokenInfo {
                label: self.config.token_label.clone(),
                manufacturer_id: MANUFACTURER_ID.to_string(),
                model: TOKEN_MODEL.to_string(),
                serial_number: self.serial_number(),
                flags: TokenFlags {
                    rng: true,
                    token_initialized: true,
                    login_required: false,
                    write_protected: false,
                },
                session_count,
                rw_session_count,
                max_session_count: self.sessions.max_sessions(),
                utc_time: Utc::now(),
            })
        })
    }

    pub fn mechanism_list(&self, slot: SlotId) -> TokenResult<Vec<Mechanism>> {
        self.guarded(|| {
            check_slot(slot)?;
            Ok(SUPPORTED_MECHANISMS.to_vec())
        })
    }

    pub fn mechanism_info(&self, slot: SlotId, mechanism: Mechanism) -> TokenResult<MechanismInfo> {
        self.guarded(|| {
            check_slot(slot)?;
            mechanism
                .info()
                .ok_or_else(|| TokenError::MechanismNotSupported(mechanism.to_string()))
        })
    }

    // --- Sessions ---

    pub fn open_session(&self, slot: SlotId, mode: SessionMode) -> TokenResult<SessionHandle> {
        self.guarded(|| self.sessions.open(slot, mode))
    }

    pub fn close_session(&self, session: SessionHandle) -> TokenResult<()> {
        self.guarded(|| self.sessions.close(session))
    }

    pub fn close_all_sessions(&self, slot: SlotId) -> TokenResult<()> {
        self.guarded(|| {
            check_slot(slot)?;
            self.sessions.close_all();
            Ok(())
        })
    }

    pub fn session_info(&self, session: SessionHandle) -> TokenResult<SessionInfo> {
        self.guarded(|| self.sessions.info(session))
    }

    /// The enclave has no user PIN; login only validates the session
    pub fn login(&self, session: SessionHandle) -> TokenResult<()> {
        self.guarded(|| self.sessions.require(session).map(|_| ()))
    }

    pub fn logout(&self, session: SessionHandle) -> TokenResult<()> {
        self.guarded(|| self.sessions.require(session).map(|_| ()))
    }

    // --- Objects ---

    pub fn object_info(&self, handle: ObjectHandle) -> TokenResult<ObjectEntry> {
        self.guarded(|| self.objects.lookup(handle))
    }

    pub fn find_objects(
        &self,
        session: SessionHandle,
        filter: &ObjectFilter,
    ) -> TokenResult<Vec<ObjectHandle>> {
        self.guarded(|| {
            self.sessions.require(session)?;
            Ok(self.objects.find(filter))
        })
    }

    pub fn destroy_object(&self, session: SessionHandle, handle: ObjectHandle) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().destroy_object(session, handle))
    }

    // --- Cryptography ---

    pub fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        public: &PublicKeyTemplate,
        private: &PrivateKeyTemplate,
    ) -> TokenResult<(ObjectHandle, ObjectHandle)> {
        self.guarded(|| {
            self.dispatcher()
                .generate_key_pair(session, mechanism, public, private)
        })
    }

    pub fn sign_init(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
    ) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().sign_init(session, mechanism, key))
    }

    pub fn sign_update(&self, session: SessionHandle, data: &[u8]) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().sign_update(session, data))
    }

    pub fn sign_final(&self, session: SessionHandle) -> TokenResult<Vec<u8>> {
        self.guarded(|| self.dispatcher().sign_final(session))
    }

    pub fn sign(&self, session: SessionHandle, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.guarded(|| self.dispatcher().sign(session, data))
    }

    pub fn verify_init(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
    ) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().verify_init(session, mechanism, key))
    }

    pub fn verify_update(&self, session: SessionHandle, data: &[u8]) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().verify_update(session, data))
    }

    pub fn verify_final(&self, session: SessionHandle, signature: &[u8]) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().verify_final(session, signature))
    }

    pub fn verify(&self, session: SessionHandle, data: &[u8], signature: &[u8]) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().verify(session, data, signature))
    }

    pub fn generate_random(&self, session: SessionHandle, len: usize) -> TokenResult<Vec<u8>> {
        self.guarded(|| self.dispatcher().generate_random(session, len))
    }

    // --- Verbs this enclave generation does not offer ---

    pub fn encrypt_init(
        &self,
        _session: SessionHandle,
        mechanism: Mechanism,
        _key: ObjectHandle,
    ) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().reject("encrypt", Some(mechanism)))
    }

    pub fn encrypt(&self, _session: SessionHandle, _data: &[u8]) -> TokenResult<Vec<u8>> {
        self.guarded(|| self.dispatcher().reject("encrypt", None))
    }

    pub fn decrypt_init(
        &self,
        _session: SessionHandle,
        mechanism: Mechanism,
        _key: ObjectHandle,
    ) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().reject("decrypt", Some(mechanism)))
    }

    pub fn decrypt(&self, _session: SessionHandle, _data: &[u8]) -> TokenResult<Vec<u8>> {
        self.guarded(|| self.dispatcher().reject("decrypt", None))
    }

    pub fn digest_init(&self, _session: SessionHandle, mechanism: Mechanism) -> TokenResult<()> {
        self.guarded(|| self.dispatcher().reject("digest", Some(mechanism)))
    }

    pub fn digest(&self, _session: SessionHandle, _data: &[u8]) -> TokenResult<Vec<u8>> {
        self.guarded(|| self.dispatcher().reject("digest", None))
    }

    pub fn generate_key(
        &self,
        _session: SessionHandle,
        mechanism: Mechanism,
    ) -> TokenResult<ObjectHandle> {
        self.guarded(|| self.dispatcher().reject("generate_key", Some(mechanism)))
    }

    // --- Internals ---

    /// Run `f` under the shared state guard, failing unless initialized
    fn guarded<T, F>(&self, f: F) -> TokenResult<T>
    where
        F: FnOnce() -> TokenResult<T>,
    {
        let state = self.state.read();
        if *state != ModuleState::Initialized {
            return Err(TokenError::NotInitialized);
        }
        f()
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.channel, &self.sessions, &self.objects)
    }

    fn serial_number(&self) -> String {
        match &self.config.serial_number {
            Some(serial) => serial.clone(),
            None => self.id.simple().to_string()[..16].to_uppercase(),
        }
    }
}

fn check_slot(slot: SlotId) -> TokenResult<()> {
    if slot != SLOT_ID {
        return Err(TokenError::SlotIdInvalid(slot));
    }
    Ok(())
}
