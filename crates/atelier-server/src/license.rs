//! Offline-issued admin licenses.
//!
//! Format: `base64url(payload).base64url(signature)` where `payload` is the
//! compact JSON `{"device_fingerprint","exp","issued_at","license_id"}` and
//! `signature` is RSA PKCS#1 v1.5 over SHA-256 of exactly those payload bytes.
//!
//! The issuer keeps the private key on an offline machine; the server only
//! ever sees the SPKI public key.

use std::path::{Path, PathBuf};

use base64::alphabet::URL_SAFE;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use constant_time_eq::constant_time_eq;
use rand::Rng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

/// File name the server looks for inside its data directory.
pub const PUBLIC_KEY_FILE: &str = "license_issuer_public.pem";
/// Validity used when the issuer asks for zero or negative days.
pub const DEFAULT_LICENSE_DAYS: i64 = 30;

/// base64url, emitted without padding, accepted with or without.
const B64URL: GeneralPurpose = GeneralPurpose::new(
    &URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LicenseError {
    #[error("incomplete license data")]
    Incomplete,
    #[error("malformed license string")]
    Malformed,
    #[error("license decoding failed")]
    Undecodable,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid license payload")]
    InvalidPayload,
    #[error("license expired")]
    Expired,
    #[error("license not issued for this device")]
    DeviceMismatch,
    #[error("could not persist login session")]
    Storage,
}

/// Signed license body. Field order is the canonical serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicensePayload {
    #[serde(default)]
    pub device_fingerprint: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub issued_at: i64,
    #[serde(default)]
    pub license_id: String,
}

impl LicensePayload {
    pub fn new(device_fingerprint: &str, days: i64, now: i64) -> Self {
        let days = if days < 1 { DEFAULT_LICENSE_DAYS } else { days };
        let mut id = [0u8; 8];
        rand::thread_rng().fill(&mut id);
        Self {
            device_fingerprint: device_fingerprint.to_owned(),
            exp: now + days * 24 * 60 * 60,
            issued_at: now,
            license_id: hex::encode(id),
        }
    }

    /// Compact JSON with deterministic key order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Serializing a plain struct of strings and integers cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Checks license strings against the issuer's public key.
#[derive(Debug, Clone)]
pub struct LicenseVerifier {
    public_key_path: PathBuf,
}

impl LicenseVerifier {
    pub fn new(public_key_path: impl Into<PathBuf>) -> Self {
        Self {
            public_key_path: public_key_path.into(),
        }
    }

    pub fn public_key_path(&self) -> &Path {
        &self.public_key_path
    }

    /// Validate `license` for `device_fingerprint` at time `now` and return the payload.
    pub fn verify(
        &self,
        license: &str,
        device_fingerprint: &str,
        now: i64,
    ) -> Result<LicensePayload, LicenseError> {
        let license = license.trim();
        let device_fingerprint = device_fingerprint.trim();
        if license.is_empty() || device_fingerprint.is_empty() {
            return Err(LicenseError::Incomplete);
        }

        let parts: Vec<&str> = license.split('.').collect();
        let [payload_b64, signature_b64] = parts.as_slice() else {
            return Err(LicenseError::Malformed);
        };

        let payload_bytes = b64url_decode(payload_b64);
        let signature_bytes = b64url_decode(signature_b64);
        if payload_bytes.is_empty() || signature_bytes.is_empty() {
            return Err(LicenseError::Undecodable);
        }

        if !self.signature_valid(&payload_bytes, &signature_bytes) {
            return Err(LicenseError::InvalidSignature);
        }

        let payload: LicensePayload =
            serde_json::from_slice(&payload_bytes).map_err(|_| LicenseError::InvalidPayload)?;

        if payload.exp <= now {
            return Err(LicenseError::Expired);
        }
        if payload.device_fingerprint.is_empty()
            || !constant_time_eq(
                payload.device_fingerprint.as_bytes(),
                device_fingerprint.as_bytes(),
            )
        {
            return Err(LicenseError::DeviceMismatch);
        }

        Ok(payload)
    }

    /// A missing or unreadable key looks exactly like a bad signature.
    fn signature_valid(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.load_public_key() else {
            return false;
        };
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(key)
            .verify(payload, &signature)
            .is_ok()
    }

    fn load_public_key(&self) -> Option<RsaPublicKey> {
        let pem = std::fs::read_to_string(&self.public_key_path).ok()?;
        match RsaPublicKey::from_public_key_pem(pem.trim()) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(error = %e, "license public key did not parse");
                None
            }
        }
    }
}

/// Offline signing side. Never deployed with the server.
pub struct LicenseIssuer {
    key: RsaPrivateKey,
}

impl LicenseIssuer {
    /// Accepts PKCS#8 (`PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let pem = pem.trim();
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| anyhow::anyhow!("invalid private key: {e}"))?;
        Ok(Self { key })
    }

    pub fn generate(bits: usize) -> anyhow::Result<Self> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| anyhow::anyhow!("generate rsa key: {e}"))?;
        Ok(Self { key })
    }

    pub fn private_key_pem(&self) -> anyhow::Result<String> {
        let pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("encode private key: {e}"))?;
        Ok(pem.to_string())
    }

    pub fn public_key_pem(&self) -> anyhow::Result<String> {
        self.key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("encode public key: {e}"))
    }

    pub fn sign(&self, payload: &LicensePayload) -> String {
        let bytes = payload.canonical_bytes();
        let signature = SigningKey::<Sha256>::new(self.key.clone()).sign(&bytes);
        format!(
            "{}.{}",
            B64URL.encode(&bytes),
            B64URL.encode(signature.to_bytes())
        )
    }

    /// Build and sign a license for `device_fingerprint` valid for `days`.
    pub fn issue(&self, device_fingerprint: &str, days: i64, now: i64) -> String {
        self.sign(&LicensePayload::new(device_fingerprint, days, now))
    }
}

/// Decoding failures collapse to empty output.
pub fn b64url_decode(s: &str) -> Vec<u8> {
    B64URL.decode(s.trim()).unwrap_or_default()
}

pub fn looks_like_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    pub const FP: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    pub const NOW: i64 = 1_700_000_000;

    /// Key generation is slow in debug builds; share one key across tests.
    pub fn issuer() -> &'static LicenseIssuer {
        static ISSUER: OnceLock<LicenseIssuer> = OnceLock::new();
        ISSUER.get_or_init(|| LicenseIssuer::generate(1024).unwrap())
    }

    pub fn verifier_in(dir: &Path) -> LicenseVerifier {
        let path = dir.join(PUBLIC_KEY_FILE);
        std::fs::write(&path, issuer().public_key_pem().unwrap()).unwrap();
        LicenseVerifier::new(path)
    }

    #[test]
    fn valid_license_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        let lic = issuer().issue(FP, 30, NOW);
        let payload = v.verify(&lic, FP, NOW + 60).unwrap();
        assert_eq!(payload.device_fingerprint, FP);
        assert_eq!(payload.exp, NOW + 30 * 86_400);
        assert_eq!(payload.license_id.len(), 16);
    }

    #[test]
    fn canonical_payload_is_compact_and_ordered() {
        let p = LicensePayload {
            device_fingerprint: "ab".into(),
            exp: 2,
            issued_at: 1,
            license_id: "ff".into(),
        };
        assert_eq!(
            String::from_utf8(p.canonical_bytes()).unwrap(),
            r#"{"device_fingerprint":"ab","exp":2,"issued_at":1,"license_id":"ff"}"#
        );
    }

    #[test]
    fn every_single_bit_flip_in_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        let lic = issuer().issue(FP, 30, NOW);
        let (p64, s64) = lic.split_once('.').unwrap();
        let sig = b64url_decode(s64);

        for byte in [0, sig.len() / 2, sig.len() - 1] {
            for bit in 0..8 {
                let mut mutated = sig.clone();
                mutated[byte] ^= 1 << bit;
                let forged = format!("{p64}.{}", B64URL.encode(&mutated));
                assert_eq!(
                    v.verify(&forged, FP, NOW),
                    Err(LicenseError::InvalidSignature)
                );
            }
        }
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        let lic = issuer().issue(FP, 30, NOW);
        let (_, s64) = lic.split_once('.').unwrap();
        let mut payload = LicensePayload::new(FP, 30, NOW);
        payload.exp += 365 * 86_400;
        let forged = format!("{}.{s64}", B64URL.encode(payload.canonical_bytes()));
        assert_eq!(
            v.verify(&forged, FP, NOW),
            Err(LicenseError::InvalidSignature)
        );
    }

    #[test]
    fn expired_license_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        let lic = issuer().issue(FP, 1, NOW);
        assert_eq!(
            v.verify(&lic, FP, NOW + 86_400),
            Err(LicenseError::Expired)
        );
    }

    #[test]
    fn other_device_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        let lic = issuer().issue(FP, 30, NOW);
        assert_eq!(
            v.verify(&lic, "0000", NOW),
            Err(LicenseError::DeviceMismatch)
        );
    }

    #[test]
    fn structural_errors_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        assert_eq!(v.verify("", FP, NOW), Err(LicenseError::Incomplete));
        assert_eq!(v.verify("abc.def", "  ", NOW), Err(LicenseError::Incomplete));
        assert_eq!(v.verify("abc", FP, NOW), Err(LicenseError::Malformed));
        assert_eq!(v.verify("a.b.c", FP, NOW), Err(LicenseError::Malformed));
        assert_eq!(v.verify(".abcd", FP, NOW), Err(LicenseError::Undecodable));
        assert_eq!(v.verify("!!!!.abcd", FP, NOW), Err(LicenseError::Undecodable));
    }

    #[test]
    fn signed_garbage_payload_is_invalid_payload() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        let body = b"not json".to_vec();
        let sig = SigningKey::<Sha256>::new(issuer().key.clone()).sign(&body);
        let lic = format!("{}.{}", B64URL.encode(&body), B64URL.encode(sig.to_bytes()));
        assert_eq!(v.verify(&lic, FP, NOW), Err(LicenseError::InvalidPayload));
    }

    #[test]
    fn missing_or_broken_public_key_reads_as_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let lic = issuer().issue(FP, 30, NOW);

        let missing = LicenseVerifier::new(dir.path().join("absent.pem"));
        assert_eq!(
            missing.verify(&lic, FP, NOW),
            Err(LicenseError::InvalidSignature)
        );

        let broken_path = dir.path().join("broken.pem");
        std::fs::write(&broken_path, "-----BEGIN PUBLIC KEY-----\nxx\n").unwrap();
        let broken = LicenseVerifier::new(broken_path);
        assert_eq!(
            broken.verify(&lic, FP, NOW),
            Err(LicenseError::InvalidSignature)
        );
    }

    #[test]
    fn padded_base64_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_in(dir.path());
        let lic = issuer().issue(FP, 30, NOW);
        let (p64, s64) = lic.split_once('.').unwrap();
        let pad = |s: &str| format!("{s}{}", "=".repeat((4 - s.len() % 4) % 4));
        let padded = format!("{}.{}", pad(p64), pad(s64));
        assert!(v.verify(&padded, FP, NOW).is_ok());
    }

    #[test]
    fn pem_round_trip_and_pkcs1_input() {
        let pem = issuer().private_key_pem().unwrap();
        let again = LicenseIssuer::from_pem(&pem).unwrap();
        assert_eq!(
            again.public_key_pem().unwrap(),
            issuer().public_key_pem().unwrap()
        );

        use rsa::pkcs1::EncodeRsaPrivateKey;
        let pkcs1 = issuer().key.to_pkcs1_pem(LineEnding::LF).unwrap();
        assert!(LicenseIssuer::from_pem(&pkcs1).is_ok());
        assert!(LicenseIssuer::from_pem("nope").is_err());
    }

    #[test]
    fn non_positive_days_fall_back_to_default() {
        let p = LicensePayload::new(FP, 0, NOW);
        assert_eq!(p.exp, NOW + DEFAULT_LICENSE_DAYS * 86_400);
    }

    #[test]
    fn hex_detection() {
        assert!(looks_like_hex("deadBEEF01"));
        assert!(!looks_like_hex("xyz"));
        assert!(!looks_like_hex(""));
    }
}
