use aes::Aes256;
use cfb8::cipher::generic_array::GenericArray;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p256::ecdh;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Size of a session symmetric key (SHA-256 output).
pub const KEY_SIZE: usize = 32;
/// Size of the AES-CFB8 initialization vector.
pub const IV_SIZE: usize = 16;
/// Size of an uncompressed SEC1 point on the P-256 curve.
pub const POINT_SIZE: usize = 65;
/// Size of a SHA-256 digest.
pub const DIGEST_SIZE: usize = 32;
/// Size of a P-256 secret scalar.
pub const SCALAR_SIZE: usize = 32;

#[derive(Debug, Eq, PartialEq)]
pub enum CryptoError {
    /// The supplied bytes do not encode a valid curve point.
    Point,
    /// The supplied bytes do not encode a valid secret scalar.
    Scalar,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::Point => write!(f, "invalid public key point"),
            CryptoError::Scalar => write!(f, "invalid secret scalar"),
        }
    }
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// SHA-256 of the supplied bytes.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; DIGEST_SIZE] {
    Sha256::digest(data).into()
}

/// A long-term P-256 keypair. The public half travels on the wire as an
/// uncompressed SEC1 point; the hash of that encoding is the owner's identity.
#[derive(Clone)]
pub struct Keypair {
    secret: p256::SecretKey,
    public: p256::PublicKey,
}

impl Keypair {
    /// Generates a fresh keypair from the system entropy source.
    #[inline]
    pub fn generate() -> Keypair {
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key();

        Keypair { secret, public }
    }

    /// Reconstructs a keypair from a stored secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Keypair, CryptoError> {
        let secret = p256::SecretKey::from_slice(bytes).map_err(|_| CryptoError::Scalar)?;
        let public = secret.public_key();

        Ok(Keypair { secret, public })
    }

    /// The secret scalar, big-endian.
    #[inline]
    pub fn secret_bytes(&self) -> [u8; SCALAR_SIZE] {
        let mut out = [0u8; SCALAR_SIZE];
        out.copy_from_slice(&self.secret.to_bytes());
        out
    }

    /// The public key as an uncompressed SEC1 point.
    #[inline]
    pub fn public_bytes(&self) -> [u8; POINT_SIZE] {
        let point = self.public.to_encoded_point(false);
        let mut out = [0u8; POINT_SIZE];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Static-static ECDH against the supplied peer point, folded through
    /// SHA-256. Both parties arrive at the same digest, which makes it usable
    /// as a proof of private key possession.
    pub fn agree(&self, peer_public: &[u8]) -> Result<[u8; DIGEST_SIZE], CryptoError> {
        let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::Point)?;
        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        Ok(sha256(shared.raw_secret_bytes()))
    }
}

/// A single-use ephemeral secret for session key establishment. Consumed by
/// the agreement so a session key can never be derived twice.
pub struct Ephemeral {
    secret: ecdh::EphemeralSecret,
}

impl Ephemeral {
    #[inline]
    pub fn generate() -> Ephemeral {
        Ephemeral {
            secret: ecdh::EphemeralSecret::random(&mut OsRng),
        }
    }

    /// The ephemeral public key as an uncompressed SEC1 point.
    #[inline]
    pub fn public_bytes(&self) -> [u8; POINT_SIZE] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; POINT_SIZE];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Ephemeral-ephemeral ECDH against the peer's public point. The session
    /// key is the SHA-256 of the raw shared secret.
    pub fn agree(self, peer_public: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
        let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::Point)?;
        let shared = self.secret.diffie_hellman(&peer);

        Ok(sha256(shared.raw_secret_bytes()))
    }
}

/// Streaming AES-256-CFB8 encryptor. CFB8 operates on single bytes, so the
/// cipher can be applied to arbitrary chunk boundaries without padding.
pub struct StreamEncryptor {
    inner: cfb8::Encryptor<Aes256>,
}

impl StreamEncryptor {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> StreamEncryptor {
        StreamEncryptor {
            inner: cfb8::Encryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
        }
    }

    /// Encrypts the buffer in place, advancing the cipher state.
    #[inline]
    pub fn apply(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(1) {
            self.inner.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Streaming AES-256-CFB8 decryptor, the inbound counterpart of
/// [`StreamEncryptor`].
pub struct StreamDecryptor {
    inner: cfb8::Decryptor<Aes256>,
}

impl StreamDecryptor {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> StreamDecryptor {
        StreamDecryptor {
            inner: cfb8::Decryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
        }
    }

    /// Decrypts the buffer in place, advancing the cipher state.
    #[inline]
    pub fn apply(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(1) {
            self.inner.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}
