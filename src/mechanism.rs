//! Mechanisms, curves and key templates
//!
//! The current enclave generation offers EC key-pair generation and ECDSA on
//! NIST P-256/P-384. Everything else is recognized only so it can be rejected
//! with `MechanismNotSupported`.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};

/// Cryptographic algorithm selected at operation-init time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mechanism {
    EcKeyPairGen,
    /// Single-part ECDSA over a caller-supplied digest
    Ecdsa,
    EcdsaSha256,
    EcdsaSha384,
    AesGcm,
    RsaPkcs,
    RsaPkcsKeyPairGen,
    /// Any other `CKM_*` value
    Other(u64),
}

/// Mechanisms the enclave actually serves
pub const SUPPORTED_MECHANISMS: [Mechanism; 4] = [
    Mechanism::EcKeyPairGen,
    Mechanism::Ecdsa,
    Mechanism::EcdsaSha256,
    Mechanism::EcdsaSha384,
];

/// What a mechanism is being used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    GenerateKeyPair,
    Sign,
    Verify,
}

impl Mechanism {
    /// Numeric `CKM_*` value
    pub fn mechanism_type(self) -> u64 {
        match self {
            Mechanism::RsaPkcsKeyPairGen => 0x0000,
            Mechanism::RsaPkcs => 0x0001,
            Mechanism::EcKeyPairGen => 0x1040,
            Mechanism::Ecdsa => 0x1041,
            Mechanism::EcdsaSha256 => 0x1044,
            Mechanism::EcdsaSha384 => 0x1045,
            Mechanism::AesGcm => 0x1087,
            Mechanism::Other(value) => value,
        }
    }

    pub fn from_type(value: u64) -> Self {
        match value {
            0x0000 => Mechanism::RsaPkcsKeyPairGen,
            0x0001 => Mechanism::RsaPkcs,
            0x1040 => Mechanism::EcKeyPairGen,
            0x1041 => Mechanism::Ecdsa,
            0x1044 => Mechanism::EcdsaSha256,
            0x1045 => Mechanism::EcdsaSha384,
            0x1087 => Mechanism::AesGcm,
            other => Mechanism::Other(other),
        }
    }

    pub fn is_supported(self) -> bool {
        SUPPORTED_MECHANISMS.contains(&self)
    }

    pub fn supports(self, usage: Usage) -> bool {
        match usage {
            Usage::GenerateKeyPair => self == Mechanism::EcKeyPairGen,
            Usage::Sign | Usage::Verify => matches!(
                self,
                Mechanism::Ecdsa | Mechanism::EcdsaSha256 | Mechanism::EcdsaSha384
            ),
        }
    }

    /// Whether `*_update` is legal; single-part mechanisms go straight to final
    pub fn is_multi_part(self) -> bool {
        matches!(self, Mechanism::EcdsaSha256 | Mechanism::EcdsaSha384)
    }

    /// Fresh accumulation state for a sign/verify operation
    pub fn accumulator(self) -> Accumulator {
        match self {
            Mechanism::EcdsaSha256 => Accumulator::Sha256(Sha256::new()),
            Mechanism::EcdsaSha384 => Accumulator::Sha384(Sha384::new()),
            _ => Accumulator::Buffer(Vec::new()),
        }
    }

    /// Capabilities advertised through `mechanism_info`; `None` when unsupported
    pub fn info(self) -> Option<MechanismInfo> {
        let ec = |generate_key_pair: bool, sign_verify: bool| MechanismInfo {
            min_key_bits: EcCurve::P256.key_bits(),
            max_key_bits: EcCurve::P384.key_bits(),
            flags: MechanismFlags {
                hardware: true,
                sign: sign_verify,
                verify: sign_verify,
                generate_key_pair,
                ec_f_p: true,
                ec_uncompress: true,
            },
        };
        match self {
            Mechanism::EcKeyPairGen => Some(ec(true, false)),
            Mechanism::Ecdsa | Mechanism::EcdsaSha256 | Mechanism::EcdsaSha384 => {
                Some(ec(false, true))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::EcKeyPairGen => write!(f, "CKM_EC_KEY_PAIR_GEN"),
            Mechanism::Ecdsa => write!(f, "CKM_ECDSA"),
            Mechanism::EcdsaSha256 => write!(f, "CKM_ECDSA_SHA256"),
            Mechanism::EcdsaSha384 => write!(f, "CKM_ECDSA_SHA384"),
            Mechanism::AesGcm => write!(f, "CKM_AES_GCM"),
            Mechanism::RsaPkcs => write!(f, "CKM_RSA_PKCS"),
            Mechanism::RsaPkcsKeyPairGen => write!(f, "CKM_RSA_PKCS_KEY_PAIR_GEN"),
            Mechanism::Other(value) => write!(f, "CKM_0x{:08X}", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MechanismFlags {
    pub hardware: bool,
    pub sign: bool,
    pub verify: bool,
    pub generate_key_pair: bool,
    pub ec_f_p: bool,
    pub ec_uncompress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MechanismInfo {
    pub min_key_bits: u32,
    pub max_key_bits: u32,
    pub flags: MechanismFlags,
}

/// Curves the enclave can generate keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcCurve {
    P256,
    P384,
}

impl EcCurve {
    pub fn coordinate_len(self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
        }
    }

    /// Uncompressed SEC1 point length
    pub fn point_len(self) -> usize {
        1 + 2 * self.coordinate_len()
    }

    /// Raw `r || s` signature length
    pub fn signature_len(self) -> usize {
        2 * self.coordinate_len()
    }

    pub fn key_bits(self) -> u32 {
        match self {
            EcCurve::P256 => 256,
            EcCurve::P384 => 384,
        }
    }

    /// Curve selector used in the key generation payload
    pub fn wire_id(self) -> u8 {
        match self {
            EcCurve::P256 => 0x01,
            EcCurve::P384 => 0x02,
        }
    }

    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(EcCurve::P256),
            0x02 => Some(EcCurve::P384),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EcCurve::P256 => "P-256",
            EcCurve::P384 => "P-384",
        }
    }
}

/// Host-side state accumulated across `*_update` calls
#[derive(Clone)]
pub enum Accumulator {
    Sha256(Sha256),
    Sha384(Sha384),
    Buffer(Vec<u8>),
}

impl Accumulator {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Accumulator::Sha256(h) => h.update(data),
            Accumulator::Sha384(h) => h.update(data),
            Accumulator::Buffer(buf) => buf.extend_from_slice(data),
        }
    }

    /// Digest to hand to the enclave
    pub fn finish(self) -> Vec<u8> {
        match self {
            Accumulator::Sha256(h) => h.finalize().to_vec(),
            Accumulator::Sha384(h) => h.finalize().to_vec(),
            Accumulator::Buffer(buf) => buf,
        }
    }
}

impl fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accumulator::Sha256(_) => write!(f, "Accumulator::Sha256"),
            Accumulator::Sha384(_) => write!(f, "Accumulator::Sha384"),
            Accumulator::Buffer(buf) => write!(f, "Accumulator::Buffer({} bytes)", buf.len()),
        }
    }
}

/// Requested properties of the public half of a generated key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyTemplate {
    /// Required; selects the curve for the whole pair
    pub curve: Option<EcCurve>,
    pub label: Option<String>,
    pub id: Vec<u8>,
    pub verify: bool,
}

impl Default for PublicKeyTemplate {
    fn default() -> Self {
        Self {
            curve: None,
            label: None,
            id: Vec::new(),
            verify: true,
        }
    }
}

impl PublicKeyTemplate {
    pub fn for_curve(curve: EcCurve) -> Self {
        Self {
            curve: Some(curve),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Requested properties of the private half of a generated key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKeyTemplate {
    /// Optional; must agree with the public template when present
    pub curve: Option<EcCurve>,
    pub label: Option<String>,
    pub id: Vec<u8>,
    pub sign: bool,
    /// Must stay false: key material never leaves the enclave
    pub extractable: bool,
}

impl Default for PrivateKeyTemplate {
    fn default() -> Self {
        Self {
            curve: None,
            label: None,
            id: Vec::new(),
            sign: true,
            extractable: false,
        }
    }
}

impl PrivateKeyTemplate {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        for mech in SUPPORTED_MECHANISMS {
            assert_eq!(Mechanism::from_type(mech.mechanism_type()), mech);
        }
        assert_eq!(Mechanism::from_type(0x1087), Mechanism::AesGcm);
        assert_eq!(Mechanism::from_type(0xDEAD), Mechanism::Other(0xDEAD));
        assert_eq!(Mechanism::Other(0xDEAD).to_string(), "CKM_0x0000DEAD");
    }

    #[test]
    fn test_support_matrix() {
        assert!(Mechanism::EcKeyPairGen.supports(Usage::GenerateKeyPair));
        assert!(!Mechanism::EcKeyPairGen.supports(Usage::Sign));
        assert!(Mechanism::EcdsaSha256.supports(Usage::Verify));
        assert!(!Mechanism::AesGcm.is_supported());
        assert!(!Mechanism::RsaPkcs.supports(Usage::Sign));
        assert!(Mechanism::AesGcm.info().is_none());

        assert!(Mechanism::EcdsaSha384.is_multi_part());
        assert!(!Mechanism::Ecdsa.is_multi_part());

        let info = Mechanism::Ecdsa.info().unwrap();
        assert!(info.flags.sign && info.flags.verify && info.flags.hardware);
        assert!(!info.flags.generate_key_pair);
        assert_eq!((info.min_key_bits, info.max_key_bits), (256, 384));
    }

    #[test]
    fn test_curve_sizes() {
        assert_eq!(EcCurve::P256.point_len(), 65);
        assert_eq!(EcCurve::P384.signature_len(), 96);
        assert_eq!(EcCurve::from_wire(EcCurve::P384.wire_id()), Some(EcCurve::P384));
        assert_eq!(EcCurve::from_wire(9), None);
    }

    #[test]
    fn test_accumulators() {
        let mut multi = Mechanism::EcdsaSha256.accumulator();
        multi.update(b"hello ");
        multi.update(b"world");
        assert_eq!(multi.finish(), Sha256::digest(b"hello world").to_vec());

        let empty = Mechanism::EcdsaSha384.accumulator().finish();
        assert_eq!(empty.len(), 48);

        let mut raw = Mechanism::Ecdsa.accumulator();
        raw.update(&[1, 2, 3]);
        assert_eq!(raw.finish(), vec![1, 2, 3]);
    }

    #[test]
    fn test_template_defaults() {
        let public = PublicKeyTemplate::for_curve(EcCurve::P256).with_label("device");
        assert!(public.verify);
        assert_eq!(public.label.as_deref(), Some("device"));

        let private = PrivateKeyTemplate::default();
        assert!(private.sign);
        assert!(!private.extractable);
    }
}
