use crate::config::Config;
use glint::crypto;
use glint::encoding;
use glint::logging::{self, Logger};
use std::fs;
use std::io;
use std::path::PathBuf;

/// Content-addressed state under `TWK_VAR`. Blobs are stored at
/// `data/blob/<xx>/<rest>` where `<xx>` is the first two hex digits of the
/// SHA-256 content hash; uploads land in `cache/upload/` and are renamed
/// into place so a blob path is only ever fully written.
pub struct Store {
    root: PathBuf,
    log: Logger,
}

impl Store {
    /// Opens the store, creating the directory layout beneath the
    /// configured var path.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(config: &Config, log: L) -> io::Result<Store> {
        let root = config.var_path.clone();

        fs::create_dir_all(root.join("data"))?;
        fs::create_dir_all(root.join("data").join("blob"))?;
        fs::create_dir_all(root.join("cache"))?;
        fs::create_dir_all(root.join("cache").join("upload"))?;

        Ok(Store {
            root,
            log: logging::branch(log),
        })
    }

    /// Stores a blob and returns its content hash.
    pub fn put(&self, bytes: &[u8]) -> io::Result<String> {
        let hash = encoding::to_hex(&crypto::sha256(bytes));
        let target = self.blob_path(&hash).expect("fresh hash is well-formed");

        if target.exists() {
            return Ok(hash);
        }

        let mut suffix = [0u8; 8];
        crypto::random_bytes(&mut suffix);
        let staging = self
            .root
            .join("cache")
            .join("upload")
            .join(format!("{}.{}", &hash[..16], encoding::to_hex(&suffix)));

        fs::write(&staging, bytes)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staging, &target)?;

        logging::debug!(self.log, "blob stored"; "hash" => %hash, "size" => bytes.len());

        Ok(hash)
    }

    /// Retrieves a blob by content hash.
    pub fn get(&self, hash: &str) -> io::Result<Option<Vec<u8>>> {
        let path = match self.blob_path(hash) {
            Some(path) => path,
            None => return Ok(None),
        };

        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blob_path(hash).map_or(false, |path| path.exists())
    }

    /// Resolves a hash to its blob path, rejecting anything that is not a
    /// full lowercase hex digest.
    fn blob_path(&self, hash: &str) -> Option<PathBuf> {
        if hash.len() != crypto::DIGEST_SIZE * 2 {
            return None;
        }
        if !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return None;
        }

        Some(
            self.root
                .join("data")
                .join("blob")
                .join(&hash[..2])
                .join(&hash[2..]),
        )
    }
}
