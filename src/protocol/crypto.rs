//! Diffie-Hellman key agreement and per-direction stream ciphers.
//!
//! Both peers draw an ephemeral exponent, exchange `g^x mod n`, and compute the same
//! shared value `k`. Two keys are derived from `k`:
//!
//! ```text
//! key(server->client) = SHA-256(k_be || "server->client")
//! key(client->server) = SHA-256(k_be || "client->server")
//! ```
//!
//! A server encrypts with the first and decrypts with the second; a client does the
//! opposite, so one side's outbound key is always the other side's inbound key. Each key
//! feeds a ChaCha20 keystream that is used for exactly one direction of one session.

use crate::error::{constants, HandshakeFailure, ProtocolError, Result};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Direction tag mixed into the key the server sends with
pub const SERVER_TO_CLIENT_TAG: &[u8] = b"server->client";

/// Direction tag mixed into the key the client sends with
pub const CLIENT_TO_SERVER_TAG: &[u8] = b"client->server";

/// Size of the random private exponent in bytes
const PRIVATE_EXPONENT_BYTES: usize = 32;

/// RFC 3526 2048-bit MODP group (group 14), generator 2
const MODP_2048_PRIME: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
    C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
    83655D23DCA3AD961C62F356208552BB9ED529077096966D\
    670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
    DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
    15728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// Which end of the connection a key set belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Group parameters shared by both ends of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    generator: BigUint,
    modulus: BigUint,
}

impl DhParams {
    /// # Errors
    /// Returns `ProtocolError::Config` when the modulus is too small or the generator is
    /// not in `(1, modulus - 1)`.
    pub fn new(generator: BigUint, modulus: BigUint) -> Result<Self> {
        if modulus <= BigUint::from(5u32) {
            return Err(ProtocolError::Config("DH modulus too small".into()));
        }
        if generator <= BigUint::from(1u32) || generator >= &modulus - 1u32 {
            return Err(ProtocolError::Config(
                "DH generator must lie in (1, modulus - 1)".into(),
            ));
        }
        Ok(Self {
            generator,
            modulus,
        })
    }

    /// Parameters from big-endian byte strings
    pub fn from_be_bytes(generator: &[u8], modulus: &[u8]) -> Result<Self> {
        Self::new(
            BigUint::from_bytes_be(generator),
            BigUint::from_bytes_be(modulus),
        )
    }

    /// The 2048-bit MODP group from RFC 3526 with generator 2
    pub fn modp_2048() -> Self {
        let modulus = BigUint::parse_bytes(MODP_2048_PRIME.as_bytes(), 16).unwrap_or_default();
        Self {
            generator: BigUint::from(2u32),
            modulus,
        }
    }

    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Byte length of the modulus, the largest public value on the wire
    pub fn modulus_len(&self) -> usize {
        self.modulus.bits().div_ceil(8) as usize
    }

    /// Whether a peer public value lies in `[1, modulus - 1]`
    pub fn accepts(&self, value: &BigUint) -> bool {
        *value >= BigUint::from(1u32) && *value < self.modulus
    }

    /// Draw a fresh ephemeral key pair
    pub fn generate_keypair(&self) -> DhKeyPair {
        let mut bytes = [0u8; PRIVATE_EXPONENT_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let private = BigUint::from_bytes_be(&bytes);
        bytes.zeroize();
        self.keypair_from_private(private)
    }

    /// Key pair from a chosen exponent, reduced into `[2, modulus - 2]`
    pub fn keypair_from_private(&self, private: BigUint) -> DhKeyPair {
        let span = &self.modulus - 3u32;
        let private = (private % span) + 2u32;
        let public = self.generator.modpow(&private, &self.modulus);
        DhKeyPair { private, public }
    }
}

/// Ephemeral exponent and the public value derived from it
pub struct DhKeyPair {
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    pub fn public(&self) -> &BigUint {
        &self.public
    }

    /// Compute `peer^private mod n` after checking the peer value's range.
    ///
    /// # Errors
    /// Returns `HandshakeFailure::DhValueOutOfRange` for values outside `[1, modulus - 1]`.
    pub fn shared_secret(&self, params: &DhParams, peer_public: &BigUint) -> Result<BigUint> {
        if !params.accepts(peer_public) {
            return Err(HandshakeFailure::DhValueOutOfRange.into());
        }
        Ok(peer_public.modpow(&self.private, &params.modulus))
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Inbound and outbound keys for one end of a session
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    inbound: [u8; 32],
    outbound: [u8; 32],
}

impl SessionKeys {
    /// Derive both direction keys from the shared value for the given role
    pub fn derive(shared: &BigUint, role: Role) -> Self {
        let mut secret = shared.to_bytes_be();
        let s2c = direction_key(&secret, SERVER_TO_CLIENT_TAG);
        let c2s = direction_key(&secret, CLIENT_TO_SERVER_TAG);
        secret.zeroize();

        match role {
            Role::Server => Self {
                inbound: c2s,
                outbound: s2c,
            },
            Role::Client => Self {
                inbound: s2c,
                outbound: c2s,
            },
        }
    }

    pub fn inbound(&self) -> &[u8; 32] {
        &self.inbound
    }

    pub fn outbound(&self) -> &[u8; 32] {
        &self.outbound
    }
}

fn direction_key(secret: &[u8], tag: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(tag);
    hasher.finalize().into()
}

/// Short non-secret identifier of a key, safe to log and compare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFingerprint(pub [u8; 8]);

impl KeyFingerprint {
    fn of(key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(key);
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        Self(out)
    }
}

/// One direction's keystream
struct StreamCrypt {
    cipher: ChaCha20,
    fingerprint: KeyFingerprint,
}

impl StreamCrypt {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20::new(Key::from_slice(key), Nonce::from_slice(&[0u8; 12])),
            fingerprint: KeyFingerprint::of(key),
        }
    }

    fn apply(&mut self, data: &mut [u8]) -> Result<()> {
        self.cipher
            .try_apply_keystream(data)
            .map_err(|_| ProtocolError::CryptoDesync(constants::ERR_KEYSTREAM_EXHAUSTED.into()))
    }
}

/// Per-connection cipher state. Plaintext sessions pass bytes through unchanged.
#[derive(Default)]
pub struct Encryptor {
    inbound: Option<StreamCrypt>,
    outbound: Option<StreamCrypt>,
}

impl Encryptor {
    pub fn plaintext() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: &SessionKeys) -> Self {
        Self {
            inbound: Some(StreamCrypt::new(&keys.inbound)),
            outbound: Some(StreamCrypt::new(&keys.outbound)),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.outbound.is_some()
    }

    /// Decrypt received bytes in place
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
        match self.inbound.as_mut() {
            Some(crypt) => crypt.apply(data),
            None => Ok(()),
        }
    }

    /// Encrypt outgoing bytes in place
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
        match self.outbound.as_mut() {
            Some(crypt) => crypt.apply(data),
            None => Ok(()),
        }
    }

    pub fn inbound_fingerprint(&self) -> Option<KeyFingerprint> {
        self.inbound.as_ref().map(|c| c.fingerprint)
    }

    pub fn outbound_fingerprint(&self) -> Option<KeyFingerprint> {
        self.outbound.as_ref().map(|c| c.fingerprint)
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("inbound", &self.inbound_fingerprint())
            .field("outbound", &self.outbound_fingerprint())
            .finish()
    }
}
