//! RSA-OAEP message envelope.
//!
//! Every chat message is encrypted individually for its recipient with
//! RSA-OAEP-SHA256, using the message's own id as the OAEP label. This binds
//! the ciphertext to the id it was encrypted under: decrypting with any
//! other label fails, which is what gives §3's "authenticated binding to
//! `id`" invariant.

use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

pub const RSA_KEY_BITS: usize = 2048;

pub fn generate_keypair() -> CoreResult<(RsaPrivateKey, RsaPublicKey)> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| CoreError::EncryptionFailure(format!("keygen: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok((private_key, public_key))
}

pub fn private_key_to_pem(key: &RsaPrivateKey) -> CoreResult<String> {
    key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map(|z| z.to_string())
        .map_err(|e| CoreError::EncryptionFailure(format!("private key pem: {e}")))
}

pub fn private_key_from_pem(pem: &str) -> CoreResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .map_err(|e| CoreError::EncryptionFailure(format!("private key parse: {e}")))
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> CoreResult<String> {
    key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| CoreError::EncryptionFailure(format!("public key pem: {e}")))
}

pub fn public_key_from_pem(pem: &str) -> CoreResult<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem)
        .map_err(|e| CoreError::EncryptionFailure(format!("public key parse: {e}")))
}

/// Encrypt `content`, labeling the OAEP padding with `label` (the message id),
/// then base64-encode the ciphertext for the wire form.
pub fn encrypt(content: &[u8], label: &str, recipient: &RsaPublicKey) -> CoreResult<String> {
    let mut rng = rand::thread_rng();
    let padding = Oaep::new_with_label::<Sha256, _>(label);
    let ciphertext = recipient
        .encrypt(&mut rng, padding, content)
        .map_err(|e| CoreError::EncryptionFailure(format!("encrypt: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
}

/// Decrypt a base64 ciphertext, requiring the OAEP label to match `label`
/// exactly. A mismatched label (or a tampered ciphertext) fails.
pub fn decrypt(ciphertext_b64: &str, label: &str, private_key: &RsaPrivateKey) -> CoreResult<Vec<u8>> {
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| CoreError::EncryptionFailure(format!("base64: {e}")))?;
    let padding = Oaep::new_with_label::<Sha256, _>(label);
    private_key
        .decrypt(padding, &ciphertext)
        .map_err(|e| CoreError::EncryptionFailure(format!("decrypt: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let (sk, pk) = generate_keypair().unwrap();
        let content = b"hello mesh";
        let wire = encrypt(content, "msg-1", &pk).unwrap();
        let back = decrypt(&wire, "msg-1", &sk).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn mismatched_label_fails() {
        let (sk, pk) = generate_keypair().unwrap();
        let wire = encrypt(b"hello", "msg-1", &pk).unwrap();
        assert!(decrypt(&wire, "msg-2", &sk).is_err());
    }

    #[test]
    fn pem_round_trip() {
        let (sk, pk) = generate_keypair().unwrap();
        let pem = public_key_to_pem(&pk).unwrap();
        let pk2 = public_key_from_pem(&pem).unwrap();
        assert_eq!(pk, pk2);
        let priv_pem = private_key_to_pem(&sk).unwrap();
        let sk2 = private_key_from_pem(&priv_pem).unwrap();
        assert_eq!(sk.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap().to_string(), priv_pem);
        let _ = sk2;
    }
}
