//! Key Registry: key-id to context / public key / secret key files.
//!
//! Each key-id owns three files in the key directory:
//! `ctxt_<id>.bin`, `pk_<id>.bin` and `sk_<id>.bin`. The server only ever
//! holds the first two, received from clients. Loaded public material is
//! cached since every query against a key needs it.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rand::Rng;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::dataset::{io_error, read_bytes, write_atomic, StorageError};
use crate::domain::{fingerprint, ContextSettings, KeyId, KeyKind};
use crate::ports::FheEngine;
use crate::{Result, SsesError};

/// Public material for one key-id.
pub struct PublicMaterial<E: FheEngine> {
    pub ctx: E::Context,
    pub pk: E::PublicKey,
}

pub struct KeyRegistry<E: FheEngine> {
    engine: Arc<E>,
    dir: PathBuf,
    registered: RwLock<BTreeSet<KeyId>>,
    cache: RwLock<HashMap<KeyId, Arc<PublicMaterial<E>>>>,
}

fn poisoned() -> SsesError {
    SsesError::WorkerFailure("key registry lock poisoned".into())
}

impl<E: FheEngine> KeyRegistry<E> {
    /// # Errors
    /// Returns `StorageError::Io` if the key directory cannot be created.
    pub fn new(engine: Arc<E>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self {
            engine,
            dir,
            registered: RwLock::new(BTreeSet::new()),
            cache: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of one key file.
    #[must_use]
    pub fn file_path(&self, key_id: KeyId, kind: KeyKind) -> PathBuf {
        self.dir.join(format!("{}_{key_id}.bin", kind.file_prefix()))
    }

    #[must_use]
    pub fn is_registered(&self, key_id: KeyId) -> bool {
        self.registered
            .read()
            .map(|r| r.contains(&key_id))
            .unwrap_or(false)
    }

    fn register(&self, key_id: KeyId) -> Result<()> {
        self.registered.write().map_err(|_| poisoned())?.insert(key_id);
        Ok(())
    }

    fn require_registered(&self, key_id: KeyId) -> Result<()> {
        if self.is_registered(key_id) {
            Ok(())
        } else {
            Err(SsesError::NotFound(format!("key {key_id} is not registered")))
        }
    }

    /// Generate a fresh key triple under a new random key-id.
    ///
    /// # Errors
    /// Returns an error if key generation or writing the files fails.
    pub fn create(&self, settings: &ContextSettings) -> Result<KeyId> {
        let key_id = self.fresh_key_id();
        let ctx = self.engine.create_context(settings)?;
        let (pk, sk) = self.engine.generate_keys(&ctx)?;

        let pk_bytes = self.engine.serialize_public_key(&pk)?;
        let sk_bytes = self.engine.serialize_secret_key(&sk)?;
        write_atomic(
            &self.file_path(key_id, KeyKind::Context),
            &self.engine.serialize_context(&ctx)?,
        )?;
        write_atomic(&self.file_path(key_id, KeyKind::PublicKey), &pk_bytes)?;
        write_secret(&self.file_path(key_id, KeyKind::SecretKey), &sk_bytes)?;

        self.register(key_id)?;
        info!(
            key_id,
            degree = settings.degree,
            pk_fingerprint = %fingerprint(&pk_bytes),
            dir = %self.dir.display(),
            "Key generation was successful"
        );
        Ok(key_id)
    }

    fn fresh_key_id(&self) -> KeyId {
        let mut rng = rand::thread_rng();
        loop {
            let key_id: KeyId = rng.gen_range(1..=KeyId::from(i32::MAX.unsigned_abs()));
            if !self.is_registered(key_id)
                && !self.file_path(key_id, KeyKind::Context).exists()
            {
                return key_id;
            }
        }
    }

    /// Register an existing key-id.
    ///
    /// With `check_files`, every key file must already exist.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` naming the first missing file.
    pub fn setup(&self, key_id: KeyId, check_files: bool) -> Result<()> {
        if check_files {
            for kind in KeyKind::ALL {
                let path = self.file_path(key_id, kind);
                if !path.exists() {
                    return Err(SsesError::NotFound(format!(
                        "{kind} file {}",
                        path.display()
                    )));
                }
            }
        }
        self.register(key_id)?;
        debug!(key_id, check_files, "Key registered");
        Ok(())
    }

    /// Store the public half of a client's keys.
    ///
    /// Both blobs are parsed before anything is written.
    ///
    /// # Errors
    /// Returns `SsesError::Crypto` if either blob does not deserialize.
    pub fn store_public(&self, key_id: KeyId, context: &[u8], public_key: &[u8]) -> Result<()> {
        let ctx = self.engine.deserialize_context(context)?;
        let pk = self.engine.deserialize_public_key(&ctx, public_key)?;

        write_atomic(&self.file_path(key_id, KeyKind::Context), context)?;
        write_atomic(&self.file_path(key_id, KeyKind::PublicKey), public_key)?;
        self.register(key_id)?;
        self.cache
            .write()
            .map_err(|_| poisoned())?
            .insert(key_id, Arc::new(PublicMaterial { ctx, pk }));

        info!(
            key_id,
            pk_fingerprint = %fingerprint(public_key),
            "Stored public keys"
        );
        Ok(())
    }

    /// Delete every key file of `key_id` and forget it.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the key is not registered.
    pub fn remove(&self, key_id: KeyId) -> Result<()> {
        self.require_registered(key_id)?;
        for kind in KeyKind::ALL {
            let path = self.file_path(key_id, kind);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(key_id, %kind, "Key file already absent");
                }
                Err(e) => return Err(io_error(&path)(e).into()),
            }
        }
        self.registered.write().map_err(|_| poisoned())?.remove(&key_id);
        self.cache.write().map_err(|_| poisoned())?.remove(&key_id);
        info!(key_id, "Removed key files");
        Ok(())
    }

    /// Raw bytes of one key file.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the key or its file is missing.
    pub fn read_raw(&self, key_id: KeyId, kind: KeyKind) -> Result<Vec<u8>> {
        self.require_registered(key_id)?;
        Ok(read_bytes(&self.file_path(key_id, kind))?)
    }

    /// Context and public key of `key_id`, loaded once and cached.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the key is unknown or its files are missing.
    pub fn public_material(&self, key_id: KeyId) -> Result<Arc<PublicMaterial<E>>> {
        if let Some(material) = self.cache.read().map_err(|_| poisoned())?.get(&key_id) {
            return Ok(Arc::clone(material));
        }

        let ctx = self.context(key_id)?;
        let pk_bytes = self.read_raw(key_id, KeyKind::PublicKey)?;
        let pk = self.engine.deserialize_public_key(&ctx, &pk_bytes)?;
        let material = Arc::new(PublicMaterial { ctx, pk });

        self.cache
            .write()
            .map_err(|_| poisoned())?
            .insert(key_id, Arc::clone(&material));
        Ok(material)
    }

    /// # Errors
    /// Returns `SsesError::NotFound` if the key is unknown or its file is missing.
    pub fn context(&self, key_id: KeyId) -> Result<E::Context> {
        let bytes = self.read_raw(key_id, KeyKind::Context)?;
        Ok(self.engine.deserialize_context(&bytes)?)
    }

    /// Load the secret key. Only meaningful on the client.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the key is unknown or its file is missing.
    pub fn secret_key(&self, key_id: KeyId, ctx: &E::Context) -> Result<E::SecretKey> {
        let bytes = Zeroizing::new(self.read_raw(key_id, KeyKind::SecretKey)?);
        Ok(self.engine.deserialize_secret_key(ctx, &bytes)?)
    }
}

fn write_secret(path: &Path, bytes: &[u8]) -> std::result::Result<(), StorageError> {
    write_atomic(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(io_error(path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bfv::BfvEngine;

    fn settings() -> ContextSettings {
        ContextSettings {
            degree: 2048,
            plaintext_modulus: 65537,
            moduli_sizes: vec![62, 62, 62],
        }
    }

    fn registry(dir: &Path) -> KeyRegistry<BfvEngine> {
        KeyRegistry::new(Arc::new(BfvEngine::new()), dir).expect("registry")
    }

    #[test]
    fn test_create_writes_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let keys = registry(dir.path());
        let key_id = keys.create(&settings()).unwrap();

        assert!(key_id > 0);
        assert!(keys.is_registered(key_id));
        for kind in KeyKind::ALL {
            assert!(keys.file_path(key_id, kind).exists(), "{kind} missing");
        }
        assert!(dir.path().join(format!("sk_{key_id}.bin")).exists());
    }

    #[test]
    fn test_created_keys_load_and_work() {
        let dir = tempfile::tempdir().unwrap();
        let keys = registry(dir.path());
        let key_id = keys.create(&settings()).unwrap();

        // A second registry over the same directory sees the same keys.
        let reopened = registry(dir.path());
        reopened.setup(key_id, true).unwrap();
        let material = reopened.public_material(key_id).unwrap();
        let sk = reopened.secret_key(key_id, &material.ctx).unwrap();

        let engine = reopened.engine();
        let ct = engine.encrypt(&material.ctx, &material.pk, 42).unwrap();
        assert_eq!(engine.decrypt(&material.ctx, &sk, &ct).unwrap()[0], 42);
    }

    #[test]
    fn test_setup_with_check_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let keys = registry(dir.path());
        assert!(matches!(keys.setup(12345, true), Err(SsesError::NotFound(_))));
        assert!(!keys.is_registered(12345));

        keys.setup(12345, false).unwrap();
        assert!(keys.is_registered(12345));
        assert!(matches!(
            keys.public_material(12345),
            Err(SsesError::NotFound(_))
        ));
    }

    #[test]
    fn test_store_public_on_server_side() {
        let client_dir = tempfile::tempdir().unwrap();
        let server_dir = tempfile::tempdir().unwrap();
        let client = registry(client_dir.path());
        let server = registry(server_dir.path());

        let key_id = client.create(&settings()).unwrap();
        let ctx = client.read_raw(key_id, KeyKind::Context).unwrap();
        let pk = client.read_raw(key_id, KeyKind::PublicKey).unwrap();

        server.store_public(key_id, &ctx, &pk).unwrap();
        assert!(server.public_material(key_id).is_ok());
        assert!(!server.file_path(key_id, KeyKind::SecretKey).exists());
    }

    #[test]
    fn test_store_public_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let keys = registry(dir.path());
        assert!(matches!(
            keys.store_public(3, b"not a context", b"nor a key"),
            Err(SsesError::Crypto(_))
        ));
        assert!(!keys.is_registered(3));
    }

    #[test]
    fn test_remove_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let keys = registry(dir.path());
        let key_id = keys.create(&settings()).unwrap();

        keys.remove(key_id).unwrap();
        assert!(!keys.is_registered(key_id));
        for kind in KeyKind::ALL {
            assert!(!keys.file_path(key_id, kind).exists());
        }
        assert!(matches!(keys.remove(key_id), Err(SsesError::NotFound(_))));
    }
}
