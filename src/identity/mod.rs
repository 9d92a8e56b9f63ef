use bip39::{ Language, Mnemonic, MnemonicType };
use ed25519_dalek::{ Signature, SigningKey, Verifier, VerifyingKey };
use hmac::{ Hmac, Mac };
use sha2::{ Digest, Sha256 };
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Domain separation key for mnemonic -> Ed25519 seed derivation.
/// Clients must use the same key or their derived addresses will not match.
pub const DOMAIN_SEPARATION_KEY: &str = "coresend-auth";

/// Inbox addresses are the first 20 bytes of sha256(pubkey), hex encoded.
pub const ADDRESS_LENGTH: usize = 40;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid mnemonic")]
    InvalidMnemonic,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Invalid signature")]
    InvalidSignature,
}

/// Generate a new 12-word BIP39 mnemonic (128 bits of entropy).
pub fn generate_mnemonic() -> String {
    Mnemonic::new(MnemonicType::Words12, Language::English)
        .phrase()
        .to_string()
}

/// Check a phrase against the English wordlist and BIP39 checksum.
pub fn is_valid_mnemonic(mnemonic: &str) -> bool {
    Mnemonic::validate(&normalize_mnemonic(mnemonic), Language::English).is_ok()
}

fn normalize_mnemonic(mnemonic: &str) -> String {
    mnemonic.trim().to_lowercase()
}

/// Derive an Ed25519 key pair from a BIP39 mnemonic.
///
/// The seed is HMAC-SHA256 over the normalized (trimmed, lowercased)
/// mnemonic, keyed with [`DOMAIN_SEPARATION_KEY`] and truncated to 32 bytes.
/// Derivation is pure: the same mnemonic always yields the same pair.
pub fn derive_keypair(mnemonic: &str) -> Result<(SigningKey, VerifyingKey), IdentityError> {
    let normalized = normalize_mnemonic(mnemonic);
    Mnemonic::validate(&normalized, Language::English)
        .map_err(|_| IdentityError::InvalidMnemonic)?;

    let mut mac = HmacSha256::new_from_slice(DOMAIN_SEPARATION_KEY.as_bytes())
        .map_err(|_| IdentityError::InvalidKey)?;
    mac.update(normalized.as_bytes());
    let seed: [u8; 32] = mac.finalize().into_bytes().into();

    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();
    Ok((signing_key, verifying_key))
}

/// Compute the inbox address for a public key: hex(sha256(pubkey))[0..40].
pub fn address_from_pubkey(pubkey: &[u8]) -> String {
    let hash = Sha256::digest(pubkey);
    hex::encode(hash)[..ADDRESS_LENGTH].to_string()
}

/// Verify an Ed25519 signature over raw message bytes.
pub fn verify_signature(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
    let pubkey: &[u8; 32] = pubkey.try_into().map_err(|_| IdentityError::InvalidKey)?;
    let verifying_key = VerifyingKey::from_bytes(pubkey).map_err(|_| IdentityError::InvalidKey)?;

    let signature: &[u8; 64] = signature.try_into().map_err(|_| IdentityError::InvalidSignature)?;
    let signature = Signature::from_bytes(signature);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// An address is exactly 40 lowercase hex characters. Callers lowercase
/// user input before validating; mixed case never reaches storage keys.
pub fn is_valid_address(addr: &str) -> bool {
    addr.len() == ADDRESS_LENGTH
        && addr.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
}
