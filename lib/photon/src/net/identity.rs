use crate::value::{self, Value};
use glint::crypto::{self, Keypair};
use glint::encoding;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Derives the check-encoded identity string from a long-term public key
/// (uncompressed SEC1 bytes). The identity is the system's notion of "who".
#[inline]
pub fn identity_of(public: &[u8]) -> String {
    encoding::to_base58check(&crypto::sha256(public))
}

#[derive(Debug)]
pub enum KeyfileError {
    Io(io::Error),
    /// The file does not parse as a `(private . public)` pair of hex strings.
    Malformed,
    /// The decoded material is not a valid keypair.
    Crypto,
}

impl fmt::Display for KeyfileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyfileError::Io(err) => write!(f, "keyfile i/o error: {}", err),
            KeyfileError::Malformed => write!(f, "keyfile is not a (private . public) pair"),
            KeyfileError::Crypto => write!(f, "keyfile holds invalid key material"),
        }
    }
}

impl From<io::Error> for KeyfileError {
    fn from(err: io::Error) -> Self {
        KeyfileError::Io(err)
    }
}

/// A long-term identity key, persisted as the textual pair
/// `("<private-hex>" . "<public-hex>")`.
pub struct LongTermKey {
    keypair: Keypair,
}

impl LongTermKey {
    #[inline]
    pub fn generate() -> LongTermKey {
        LongTermKey {
            keypair: Keypair::generate(),
        }
    }

    #[inline]
    pub fn from_keypair(keypair: Keypair) -> LongTermKey {
        LongTermKey { keypair }
    }

    /// The check-encoded identity of this key.
    #[inline]
    pub fn identity(&self) -> String {
        identity_of(&self.keypair.public_bytes())
    }

    #[inline]
    pub fn public_bytes(&self) -> [u8; crypto::POINT_SIZE] {
        self.keypair.public_bytes()
    }

    /// Static-static agreement used for possession proofs; see
    /// [`Keypair::agree`].
    #[inline]
    pub fn agree(&self, peer_public: &[u8]) -> Result<[u8; crypto::DIGEST_SIZE], crypto::CryptoError> {
        self.keypair.agree(peer_public)
    }

    /// Writes the keypair file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), KeyfileError> {
        let pair = Value::pair(
            Value::Str(encoding::to_hex(&self.keypair.secret_bytes())),
            Value::Str(encoding::to_hex(&self.keypair.public_bytes())),
        );

        fs::write(path, format!("{}\n", pair))?;
        Ok(())
    }

    /// Loads a keypair file, re-deriving and cross-checking the public half.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LongTermKey, KeyfileError> {
        let text = fs::read_to_string(path)?;
        let parsed = value::parse_str(&text).map_err(|_| KeyfileError::Malformed)?;

        let (private, public) = parsed.as_pair().ok_or(KeyfileError::Malformed)?;
        let private = private.as_str().ok_or(KeyfileError::Malformed)?;
        let public = public.as_str().ok_or(KeyfileError::Malformed)?;

        let secret = encoding::from_hex(private).map_err(|_| KeyfileError::Malformed)?;
        let declared = encoding::from_hex(public).map_err(|_| KeyfileError::Malformed)?;

        let keypair = Keypair::from_secret_bytes(&secret).map_err(|_| KeyfileError::Crypto)?;

        if keypair.public_bytes()[..] != declared[..] {
            return Err(KeyfileError::Crypto);
        }

        Ok(LongTermKey { keypair })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;

    fn scratch_file(tag: &str) -> PathBuf {
        let mut suffix = [0u8; 8];
        crypto::random_bytes(&mut suffix);
        env::temp_dir().join(format!("photon-key-{}-{}", tag, encoding::to_hex(&suffix)))
    }

    #[test]
    fn test_identity_is_stable_and_checked() {
        let key = LongTermKey::generate();

        let identity = key.identity();
        assert_eq!(identity, identity_of(&key.public_bytes()));
        assert!(encoding::from_base58check(&identity).is_ok());
        assert_eq!(
            encoding::from_base58check(&identity).unwrap().len(),
            crypto::DIGEST_SIZE
        );
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = scratch_file("roundtrip");
        let key = LongTermKey::generate();

        key.save(&path).unwrap();
        let restored = LongTermKey::load(&path).unwrap();

        assert_eq!(key.identity(), restored.identity());
        assert_eq!(key.public_bytes()[..], restored.public_bytes()[..]);

        // The on-disk shape is the documented textual pair.
        let text = fs::read_to_string(&path).unwrap();
        let parsed = value::parse_str(&text).unwrap();
        assert!(parsed.as_pair().is_some());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_rejects_garbage() {
        let path = scratch_file("garbage");
        fs::write(&path, "(not-a-pair)").unwrap();

        match LongTermKey::load(&path) {
            Err(KeyfileError::Malformed) => {}
            other => panic!("Unexpected load result: {:?}", other.err()),
        }

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_rejects_mismatched_public_half() {
        let path = scratch_file("mismatch");
        let key = LongTermKey::generate();
        let other = LongTermKey::generate();

        let pair = Value::pair(
            Value::Str(encoding::to_hex(&key.keypair.secret_bytes())),
            Value::Str(encoding::to_hex(&other.public_bytes())),
        );
        fs::write(&path, format!("{}\n", pair)).unwrap();

        match LongTermKey::load(&path) {
            Err(KeyfileError::Crypto) => {}
            other => panic!("Unexpected load result: {:?}", other.err()),
        }

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_proof_agreement_is_symmetric() {
        let client = LongTermKey::generate();
        let server = LongTermKey::generate();

        let client_proof = client.agree(&server.public_bytes()).unwrap();
        let server_view = server.agree(&client.public_bytes()).unwrap();

        assert_eq!(client_proof, server_view);
    }
}
