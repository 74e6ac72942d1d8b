use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::core::errors::WalletError;
use crate::crypto::hash::sha256;

/// Normalize a compact signature to low-S (s <= n/2) so it cannot be malleated.
pub fn ensure_low_s(compact_sig: &[u8; 64]) -> Result<[u8; 64], WalletError> {
    let mut sig = Signature::from_compact(compact_sig)?;
    sig.normalize_s();
    Ok(sig.serialize_compact())
}

/// ECDSA over a 32-byte digest, compact (r || s) encoding, low-S.
pub fn sign_digest(secret: &SecretKey, digest: &[u8; 32]) -> Result<[u8; 64], WalletError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_slice(digest)?;
    let sig = secp.sign_ecdsa(&message, secret);
    ensure_low_s(&sig.serialize_compact())
}

pub fn verify_digest(public: &PublicKey, digest: &[u8; 32], signature: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(message) = Message::from_slice(digest) else {
        return false;
    };
    let Ok(sig) = Signature::from_compact(signature) else {
        return false;
    };
    secp.verify_ecdsa(&message, &sig, public).is_ok()
}

/// Signs SHA-256(message); used for identity payloads and master-key message signing.
pub fn sign_message(secret: &SecretKey, message: &[u8]) -> Result<[u8; 64], WalletError> {
    sign_digest(secret, &sha256(message))
}

pub fn verify_message(public: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    verify_digest(public, &sha256(message), signature)
}

pub fn parse_public_key(hex_str: &str) -> Result<PublicKey, WalletError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| WalletError::ValidationError(format!("Invalid public key hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| WalletError::ValidationError(format!("Invalid public key: {}", e)))
}
