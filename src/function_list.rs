//! Static dispatch table vended to host loaders
//!
//! Every entry point a conformant caller may invoke has a real handler here,
//! including the verbs this enclave generation cannot serve. Handlers collapse
//! `TokenError` into the numeric [`ReturnValue`] and log failures at the
//! boundary.

use log::error;

use crate::error::{ReturnValue, TokenResult};
use crate::mechanism::{Mechanism, MechanismInfo, PrivateKeyTemplate, PublicKeyTemplate};
use crate::module::{Module, ModuleInfo, Slot, SlotId, SlotInfo, TokenInfo, Version, CRYPTOKI_VERSION};
use crate::object::{ObjectEntry, ObjectFilter, ObjectHandle};
use crate::session::{SessionHandle, SessionInfo, SessionMode};

/// Host-facing result: output on success, status code on failure
pub type Rv<T = ()> = Result<T, ReturnValue>;

pub(crate) fn result_to_rv<T>(name: &str, result: TokenResult<T>) -> Rv<T> {
    result.map_err(|e| {
        error!("{}: {}", name, e);
        e.return_value()
    })
}

macro_rules! entry_point {
    (fn $name:ident ( $module:ident $(, $arg:ident : $type:ty)* $(,)? ) -> $ret:ty $body:block) => {
        fn $name($module: &Module $(, $arg: $type)*) -> Rv<$ret> {
            result_to_rv(stringify!($name), $body)
        }
    };
}

/// Fixed-shape table of entry points
pub struct FunctionList {
    pub version: Version,
    pub initialize: fn(&Module) -> Rv,
    pub finalize: fn(&Module) -> Rv,
    pub get_info: fn(&Module) -> Rv<ModuleInfo>,
    pub get_slot_list: fn(&Module) -> Rv<Vec<Slot>>,
    pub get_slot_info: fn(&Module, SlotId) -> Rv<SlotInfo>,
    pub get_token_info: fn(&Module, SlotId) -> Rv<TokenInfo>,
    pub get_mechanism_list: fn(&Module, SlotId) -> Rv<Vec<Mechanism>>,
    pub get_mechanism_info: fn(&Module, SlotId, Mechanism) -> Rv<MechanismInfo>,
    pub open_session: fn(&Module, SlotId, SessionMode) -> Rv<SessionHandle>,
    pub close_session: fn(&Module, SessionHandle) -> Rv,
    pub close_all_sessions: fn(&Module, SlotId) -> Rv,
    pub get_session_info: fn(&Module, SessionHandle) -> Rv<SessionInfo>,
    pub login: fn(&Module, SessionHandle) -> Rv,
    pub logout: fn(&Module, SessionHandle) -> Rv,
    pub destroy_object: fn(&Module, SessionHandle, ObjectHandle) -> Rv,
    pub get_object_info: fn(&Module, ObjectHandle) -> Rv<ObjectEntry>,
    pub find_objects: fn(&Module, SessionHandle, &ObjectFilter) -> Rv<Vec<ObjectHandle>>,
    pub encrypt_init: fn(&Module, SessionHandle, Mechanism, ObjectHandle) -> Rv,
    pub encrypt: fn(&Module, SessionHandle, &[u8]) -> Rv<Vec<u8>>,
    pub decrypt_init: fn(&Module, SessionHandle, Mechanism, ObjectHandle) -> Rv,
    pub decrypt: fn(&Module, SessionHandle, &[u8]) -> Rv<Vec<u8>>,
    pub digest_init: fn(&Module, SessionHandle, Mechanism) -> Rv,
    pub digest: fn(&Module, SessionHandle, &[u8]) -> Rv<Vec<u8>>,
    pub sign_init: fn(&Module, SessionHandle, Mechanism, ObjectHandle) -> Rv,
    pub sign: fn(&Module, SessionHandle, &[u8]) -> Rv<Vec<u8>>,
    pub sign_update: fn(&Module, SessionHandle, &[u8]) -> Rv,
    pub sign_final: fn(&Module, SessionHandle) -> Rv<Vec<u8>>,
    pub verify_init: fn(&Module, SessionHandle, Mechanism, ObjectHandle) -> Rv,
    pub verify: fn(&Module, SessionHandle, &[u8], &[u8]) -> Rv,
    pub verify_update: fn(&Module, SessionHandle, &[u8]) -> Rv,
    pub verify_final: fn(&Module, SessionHandle, &[u8]) -> Rv,
    pub generate_key: fn(&Module, SessionHandle, Mechanism) -> Rv<ObjectHandle>,
    pub generate_key_pair: fn(
        &Module,
        SessionHandle,
        Mechanism,
        &PublicKeyTemplate,
        &PrivateKeyTemplate,
    ) -> Rv<(ObjectHandle, ObjectHandle)>,
    pub generate_random: fn(&Module, SessionHandle, usize) -> Rv<Vec<u8>>,
}

pub static FUNCTION_LIST: FunctionList = FunctionList {
    version: CRYPTOKI_VERSION,
    initialize: c_initialize,
    finalize: c_finalize,
    get_info: c_get_info,
    get_slot_list: c_get_slot_list,
    get_slot_info: c_get_slot_info,
    get_token_info: c_get_token_info,
    get_mechanism_list: c_get_mechanism_list,
    get_mechanism_info: c_get_mechanism_info,
    open_session: c_open_session,
    close_session: c_close_session,
    close_all_sessions: c_close_all_sessions,
    get_session_info: c_get_session_info,
    login: c_login,
    logout: c_logout,
    destroy_object: c_destroy_object,
    get_object_info: c_get_object_info,
    find_objects: c_find_objects,
    encrypt_init: c_encrypt_init,
    encrypt: c_encrypt,
    decrypt_init: c_decrypt_init,
    decrypt: c_decrypt,
    digest_init: c_digest_init,
    digest: c_digest,
    sign_init: c_sign_init,
    sign: c_sign,
    sign_update: c_sign_update,
    sign_final: c_sign_final,
    verify_init: c_verify_init,
    verify: c_verify,
    verify_update: c_verify_update,
    verify_final: c_verify_final,
    generate_key: c_generate_key,
    generate_key_pair: c_generate_key_pair,
    generate_random: c_generate_random,
};

/// The table handed to host loaders
pub fn function_list() -> &'static FunctionList {
    &FUNCTION_LIST
}

entry_point!(fn c_initialize(m) -> () { m.initialize() });
entry_point!(fn c_finalize(m) -> () { m.finalize() });
entry_point!(fn c_get_info(m) -> ModuleInfo { m.info() });
entry_point!(fn c_get_slot_list(m) -> Vec<Slot> { m.enumerate_slots() });
entry_point!(fn c_get_slot_info(m, slot: SlotId) -> SlotInfo { m.slot_info(slot) });
entry_point!(fn c_get_token_info(m, slot: SlotId) -> TokenInfo { m.token_info(slot) });
entry_point!(fn c_get_mechanism_list(m, slot: SlotId) -> Vec<Mechanism> {
    m.mechanism_list(slot)
});
entry_point!(fn c_get_mechanism_info(m, slot: SlotId, mechanism: Mechanism) -> MechanismInfo {
    m.mechanism_info(slot, mechanism)
});

entry_point!(fn c_open_session(m, slot: SlotId, mode: SessionMode) -> SessionHandle {
    m.open_session(slot, mode)
});
entry_point!(fn c_close_session(m, session: SessionHandle) -> () { m.close_session(session) });
entry_point!(fn c_close_all_sessions(m, slot: SlotId) -> () { m.close_all_sessions(slot) });
entry_point!(fn c_get_session_info(m, session: SessionHandle) -> SessionInfo {
    m.session_info(session)
});
entry_point!(fn c_login(m, session: SessionHandle) -> () { m.login(session) });
entry_point!(fn c_logout(m, session: SessionHandle) -> () { m.logout(session) });

entry_point!(fn c_destroy_object(m, session: SessionHandle, object: ObjectHandle) -> () {
    m.destroy_object(session, object)
});
entry_point!(fn c_get_object_info(m, object: ObjectHandle) -> ObjectEntry { m.object_info(object) });
entry_point!(fn c_find_objects(m, session: SessionHandle, filter: &ObjectFilter) -> Vec<ObjectHandle> {
    m.find_objects(session, filter)
});

entry_point!(fn c_encrypt_init(m, session: SessionHandle, mechanism: Mechanism, key: ObjectHandle) -> () {
    m.encrypt_init(session, mechanism, key)
});
entry_point!(fn c_encrypt(m, session: SessionHandle, data: &[u8]) -> Vec<u8> { m.encrypt(session, data) });
entry_point!(fn c_decrypt_init(m, session: SessionHandle, mechanism: Mechanism, key: ObjectHandle) -> () {
    m.decrypt_init(session, mechanism, key)
});
entry_point!(fn c_decrypt(m, session: SessionHandle, data: &[u8]) -> Vec<u8> { m.decrypt(session, data) });
entry_point!(fn c_digest_init(m, session: SessionHandle, mechanism: Mechanism) -> () {
    m.digest_init(session, mechanism)
});
entry_point!(fn c_digest(m, session: SessionHandle, data: &[u8]) -> Vec<u8> { m.digest(session, data) });

entry_point!(fn c_sign_init(m, session: SessionHandle, mechanism: Mechanism, key: ObjectHandle) -> () {
    m.sign_init(session, mechanism, key)
});
entry_point!(fn c_sign(m, session: SessionHandle, data: &[u8]) -> Vec<u8> { m.sign(session, data) });
entry_point!(fn c_sign_update(m, session: SessionHandle, data: &[u8]) -> () {
    m.sign_update(session, data)
});
entry_point!(fn c_sign_final(m, session: SessionHandle) -> Vec<u8> { m.sign_final(session) });

entry_point!(fn c_verify_init(m, session: SessionHandle, mechanism: Mechanism, key: ObjectHandle) -> () {
    m.verify_init(session, mechanism, key)
});
entry_point!(fn c_verify(m, session: SessionHandle, data: &[u8], signature: &[u8]) -> () {
    m.verify(session, data, signature)
});
entry_point!(fn c_verify_update(m, session: SessionHandle, data: &[u8]) -> () {
    m.verify_update(session, data)
});
entry_point!(fn c_verify_final(m, session: SessionHandle, signature: &[u8]) -> () {
    m.verify_final(session, signature)
});

entry_point!(fn c_generate_key(m, session: SessionHandle, mechanism: Mechanism) -> ObjectHandle {
    m.generate_key(session, mechanism)
});
entry_point!(fn c_generate_key_pair(
    m,
    session: SessionHandle,
    mechanism: Mechanism,
    public: &PublicKeyTemplate,
    private: &PrivateKeyTemplate,
) -> (ObjectHandle, ObjectHandle) {
    m.generate_key_pair(session, mechanism, public, private)
});
entry_point!(fn c_generate_random(m, session: SessionHandle, len: usize) -> Vec<u8> {
    m.generate_random(session, len)
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimulatedEnclave;
    use crate::mechanism::EcCurve;
    use crate::module::SLOT_ID;

    #[test]
    fn test_table_version() {
        let table = function_list();
        assert_eq!(table.version, Version { major: 2, minor: 40 });
        assert!(std::ptr::eq(table, &FUNCTION_LIST));
    }

    #[test]
    fn test_lifecycle_codes() {
        let enclave = SimulatedEnclave::new();
        let module = Module::simulated(&enclave);
        let f = function_list();

        assert_eq!(
            (f.get_slot_list)(&module),
            Err(ReturnValue::CRYPTOKI_NOT_INITIALIZED)
        );
        assert_eq!((f.initialize)(&module), Ok(()));
        assert_eq!(
            (f.initialize)(&module),
            Err(ReturnValue::CRYPTOKI_ALREADY_INITIALIZED)
        );
        assert_eq!((f.get_slot_list)(&module).unwrap().len(), 1);
        assert_eq!(
            (f.get_slot_info)(&module, 5),
            Err(ReturnValue::SLOT_ID_INVALID)
        );
        assert_eq!((f.finalize)(&module), Ok(()));
        assert_eq!((f.finalize)(&module), Err(ReturnValue::CRYPTOKI_NOT_INITIALIZED));
    }

    #[test]
    fn test_sign_verify_through_table() {
        let enclave = SimulatedEnclave::new();
        let module = Module::simulated(&enclave);
        let f = function_list();
        (f.initialize)(&module).unwrap();

        let s = (f.open_session)(&module, SLOT_ID, SessionMode::ReadWrite).unwrap();
        let (public, private) = (f.generate_key_pair)(
            &module,
            s,
            Mechanism::EcKeyPairGen,
            &PublicKeyTemplate::for_curve(EcCurve::P384).with_label("ota"),
            &PrivateKeyTemplate::default().with_label("ota"),
        )
        .unwrap();

        (f.sign_init)(&module, s, Mechanism::EcdsaSha384, private).unwrap();
        (f.sign_update)(&module, s, b"image").unwrap();
        let signature = (f.sign_final)(&module, s).unwrap();
        assert_eq!(signature.len(), 96);

        (f.verify_init)(&module, s, Mechanism::EcdsaSha384, public).unwrap();
        assert_eq!((f.verify)(&module, s, b"image", &signature), Ok(()));
        (f.verify_init)(&module, s, Mechanism::EcdsaSha384, public).unwrap();
        assert_eq!(
            (f.verify)(&module, s, b"other", &signature),
            Err(ReturnValue::SIGNATURE_INVALID)
        );

        let found = (f.find_objects)(
            &module,
            s,
            &ObjectFilter {
                label: Some("ota".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(found, vec![public, private]);
        assert_eq!(
            (f.get_object_info)(&module, public).unwrap().attributes.curve,
            Some(EcCurve::P384)
        );
        assert_eq!((f.generate_random)(&module, s, 16).unwrap().len(), 16);
        assert_eq!(
            (f.generate_random)(&module, s, 0),
            Err(ReturnValue::DATA_LEN_RANGE)
        );

        (f.destroy_object)(&module, s, private).unwrap();
        assert_eq!(
            (f.sign_init)(&module, s, Mechanism::EcdsaSha384, private),
            Err(ReturnValue::OBJECT_HANDLE_INVALID)
        );
    }

    #[test]
    fn test_unsupported_entries_have_handlers() {
        let enclave = SimulatedEnclave::new();
        let module = Module::simulated(&enclave);
        let f = function_list();
        let s = SessionHandle(1);
        let key = ObjectHandle(1);

        assert_eq!(
            (f.digest)(&module, s, b"x"),
            Err(ReturnValue::CRYPTOKI_NOT_INITIALIZED)
        );

        (f.initialize)(&module).unwrap();
        let invalid = Err(ReturnValue::MECHANISM_INVALID);
        assert_eq!((f.encrypt_init)(&module, s, Mechanism::AesGcm, key), invalid);
        assert_eq!((f.decrypt_init)(&module, s, Mechanism::AesGcm, key), invalid);
        assert_eq!((f.digest_init)(&module, s, Mechanism::Other(0x250)), invalid);
        assert_eq!(
            (f.encrypt)(&module, s, b"x"),
            Err(ReturnValue::MECHANISM_INVALID)
        );
        assert_eq!(
            (f.decrypt)(&module, s, b"x"),
            Err(ReturnValue::MECHANISM_INVALID)
        );
        assert_eq!(
            (f.generate_key)(&module, s, Mechanism::AesGcm),
            Err(ReturnValue::MECHANISM_INVALID)
        );
    }

    #[test]
    fn test_session_entries() {
        let enclave = SimulatedEnclave::new();
        let module = Module::simulated(&enclave);
        let f = function_list();
        (f.initialize)(&module).unwrap();

        let s = (f.open_session)(&module, SLOT_ID, SessionMode::ReadOnly).unwrap();
        assert_eq!((f.login)(&module, s), Ok(()));
        assert_eq!((f.get_session_info)(&module, s).unwrap().mode, SessionMode::ReadOnly);
        assert_eq!(
            (f.get_token_info)(&module, SLOT_ID).unwrap().session_count,
            1
        );
        assert_eq!((f.get_mechanism_list)(&module, SLOT_ID).unwrap().len(), 4);
        assert!((f.get_mechanism_info)(&module, SLOT_ID, Mechanism::Ecdsa).is_ok());
        assert!((f.get_info)(&module).is_ok());
        assert_eq!((f.logout)(&module, s), Ok(()));
        assert_eq!((f.close_all_sessions)(&module, SLOT_ID), Ok(()));
        assert_eq!(
            (f.close_session)(&module, s),
            Err(ReturnValue::SESSION_HANDLE_INVALID)
        );
    }
}
