//! Cryptographic primitives for the network layer
//!
//! Provides identity keys, ephemeral ECDH and the session keys that seal
//! tunnel traffic.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Pluggable seal/open primitive used by tunnels
pub trait FrameCipher: Send {
    /// Seal `plaintext`, returning the nonce counter used and the ciphertext
    fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(u64, Vec<u8>), CryptoError>;

    /// Open a ciphertext sealed by the other end with nonce counter `iv`
    fn open(&self, iv: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// Directional session keys derived from ECDH
pub struct SessionKeys {
    /// Key for encrypting outgoing messages
    encrypt_key: [u8; 32],
    /// Key for decrypting incoming messages
    decrypt_key: [u8; 32],
    /// Nonce counter for outgoing messages
    nonce_counter: u64,
}

impl SessionKeys {
    /// Derive session keys from shared secret and role
    pub fn derive(
        shared_secret: &SharedSecret,
        our_public: &[u8; 32],
        their_public: &[u8; 32],
        context: &[u8],
    ) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());

        // Lower public key plays the initiator role
        let is_initiator = our_public < their_public;

        let (enc_info, dec_info) = if is_initiator {
            (b"initiator_to_responder", b"responder_to_initiator")
        } else {
            (b"responder_to_initiator", b"initiator_to_responder")
        };

        let mut encrypt_key = [0u8; 32];
        let mut decrypt_key = [0u8; 32];

        let mut enc_context = context.to_vec();
        enc_context.extend_from_slice(enc_info);
        hkdf.expand(&enc_context, &mut encrypt_key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut dec_context = context.to_vec();
        dec_context.extend_from_slice(dec_info);
        hkdf.expand(&dec_context, &mut decrypt_key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        Ok(Self {
            encrypt_key,
            decrypt_key,
            nonce_counter: 0,
        })
    }

    fn nonce(counter: u64) -> [u8; 12] {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
        nonce_bytes
    }
}

impl FrameCipher for SessionKeys {
    fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(u64, Vec<u8>), CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.encrypt_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let iv = self.nonce_counter;
        self.nonce_counter += 1;

        let nonce_bytes = Self::nonce(iv);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok((iv, ciphertext))
    }

    fn open(&self, iv: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.decrypt_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let nonce_bytes = Self::nonce(iv);
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// X25519 key exchange with a per-tunnel ephemeral secret
///
/// The secret is reusable so one tunnel endpoint can answer several key
/// exchanges (one per connection, or a restarted peer) with the same public
/// key.
pub struct EphemeralKeyExchange {
    secret: StaticSecret,
    public: X25519Public,
}

impl EphemeralKeyExchange {
    /// Generate new ephemeral keypair
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform key exchange and derive shared secret
    pub fn exchange(&self, their_public: &[u8; 32]) -> SharedSecret {
        let their_public = X25519Public::from(*their_public);
        self.secret.diffie_hellman(&their_public)
    }

    /// Complete the exchange straight into session keys
    pub fn session(
        &self,
        their_public: &[u8; 32],
        context: &[u8],
    ) -> Result<SessionKeys, CryptoError> {
        let shared = self.exchange(their_public);
        SessionKeys::derive(&shared, &self.public_key(), their_public, context)
    }
}

impl Default for EphemeralKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (SessionKeys, SessionKeys) {
        let alice = EphemeralKeyExchange::new();
        let bob = EphemeralKeyExchange::new();
        let alice_pub = alice.public_key();
        let bob_pub = bob.public_key();

        let alice_keys = alice.session(&bob_pub, b"ctx").unwrap();
        let bob_keys = bob.session(&alice_pub, b"ctx").unwrap();
        (alice_keys, bob_keys)
    }

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert!(KeyPair::verify(&kp.public_key(), b"other", &sig).is_err());
    }

    #[test]
    fn test_ephemeral_key_exchange() {
        let alice = EphemeralKeyExchange::new();
        let bob = EphemeralKeyExchange::new();

        let alice_pub = alice.public_key();
        let bob_pub = bob.public_key();

        let alice_shared = alice.exchange(&bob_pub);
        let bob_shared = bob.exchange(&alice_pub);

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_session_seal_open_both_ways() {
        let (mut alice, mut bob) = session_pair();

        let (iv, ct) = alice.seal(b"secret message", b"aad").unwrap();
        assert_eq!(iv, 0);
        assert_eq!(bob.open(iv, &ct, b"aad").unwrap(), b"secret message");

        let (iv, ct) = bob.seal(b"reply", b"aad").unwrap();
        assert_eq!(alice.open(iv, &ct, b"aad").unwrap(), b"reply");
    }

    #[test]
    fn test_nonce_counter_advances() {
        let (mut alice, bob) = session_pair();
        let (iv0, _) = alice.seal(b"a", b"").unwrap();
        let (iv1, ct1) = alice.seal(b"b", b"").unwrap();
        assert_eq!((iv0, iv1), (0, 1));
        assert!(bob.open(iv0, &ct1, b"").is_err());
        assert_eq!(bob.open(iv1, &ct1, b"").unwrap(), b"b");
    }

    #[test]
    fn test_secret_answers_several_peers() {
        let ours = EphemeralKeyExchange::new();
        let first = EphemeralKeyExchange::new();
        let second = EphemeralKeyExchange::new();

        let mut a = ours.session(&first.public_key(), b"ctx").unwrap();
        let b = first.session(&ours.public_key(), b"ctx").unwrap();
        let mut c = ours.session(&second.public_key(), b"ctx").unwrap();
        let d = second.session(&ours.public_key(), b"ctx").unwrap();

        let (iv, ct) = a.seal(b"one", b"").unwrap();
        assert_eq!(b.open(iv, &ct, b"").unwrap(), b"one");
        let (iv, ct) = c.seal(b"two", b"").unwrap();
        assert_eq!(d.open(iv, &ct, b"").unwrap(), b"two");
        assert!(b.open(iv, &ct, b"").is_err());
    }

    #[test]
    fn test_wrong_aad_rejected() {
        let (mut alice, bob) = session_pair();
        let (iv, ct) = alice.seal(b"payload", b"cid-1").unwrap();
        assert!(bob.open(iv, &ct, b"cid-2").is_err());
    }
}
