//! Dataset Store: per key-id inverted indexes, encrypted masks and aux files.
//!
//! Layout under the base directory:
//!
//! ```text
//! list.txt
//! db_<key id>/
//!     dbbasics.bin
//!     encdata/<patient id>.bin
//!     auxdata/<patient id>.bin
//!     auxdata/med.inv
//!     auxdata/side.inv
//! ```
//!
//! A dataset is built once per key-id from the source table, because the
//! masks must be encrypted under that key. Files are replaced atomically so a
//! worker reading an index never sees a half-written one.

mod files;
mod index;
mod source;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use rayon::prelude::*;
use tracing::{debug, info, warn};

pub use files::{DbBasics, ListFile};
pub use index::InvertedIndex;
pub use source::SourceTable;

use crate::domain::{AuxRecord, KeyId, PatientId, PatientRecord};
use crate::ports::FheEngine;
use crate::{Result, SsesError};

const LIST_FILENAME: &str = "list.txt";
const DBBASICS_FILENAME: &str = "dbbasics.bin";
const MEDINV_FILENAME: &str = "med.inv";
const SIDEINV_FILENAME: &str = "side.inv";
const ENCDATA_DIRNAME: &str = "encdata";
const AUXDATA_DIRNAME: &str = "auxdata";

/// Storage error type.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed file {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn read_text(path: &Path) -> std::result::Result<String, StorageError> {
    std::fs::read_to_string(path).map_err(io_error(path))
}

pub(crate) fn read_bytes(path: &Path) -> std::result::Result<Vec<u8>, StorageError> {
    if !path.exists() {
        return Err(StorageError::NotFound(path.display().to_string()));
    }
    std::fs::read(path).map_err(io_error(path))
}

/// Write through a sibling temp file and rename into place.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::result::Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents).map_err(io_error(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io_error(path))
}

/// File locations of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    pub root: PathBuf,
}

impl DatasetPaths {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn dbbasics(&self) -> PathBuf {
        self.root.join(DBBASICS_FILENAME)
    }

    #[must_use]
    pub fn encdata_dir(&self) -> PathBuf {
        self.root.join(ENCDATA_DIRNAME)
    }

    #[must_use]
    pub fn auxdata_dir(&self) -> PathBuf {
        self.root.join(AUXDATA_DIRNAME)
    }

    #[must_use]
    pub fn medicine_index(&self) -> PathBuf {
        self.auxdata_dir().join(MEDINV_FILENAME)
    }

    #[must_use]
    pub fn side_effect_index(&self) -> PathBuf {
        self.auxdata_dir().join(SIDEINV_FILENAME)
    }

    #[must_use]
    pub fn encrypted_mask(&self, patient: PatientId) -> PathBuf {
        self.encdata_dir().join(format!("{patient}.bin"))
    }

    #[must_use]
    pub fn aux(&self, patient: PatientId) -> PathBuf {
        self.auxdata_dir().join(format!("{patient}.bin"))
    }

    /// True iff the basics file exists and marks the dataset active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.root.is_dir()
            && DbBasics::load(&self.dbbasics())
                .map(|b| b.active)
                .unwrap_or(false)
    }
}

/// Shared store of all datasets, keyed by key-id.
#[derive(Debug)]
pub struct DatasetStore {
    base_dir: PathBuf,
    datasets: RwLock<BTreeMap<KeyId, PathBuf>>,
    // Serializes setup and update; readers rely on atomic file replacement.
    write_lock: Mutex<()>,
}

impl DatasetStore {
    /// Open the store, reloading the datasets listed in `list.txt`.
    ///
    /// # Errors
    /// Returns an error if the base directory cannot be created or the list
    /// file is malformed.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(io_error(&base_dir))?;
        let list = ListFile::load_or_default(&base_dir.join(LIST_FILENAME))?;

        for (key_id, dir) in &list.entries {
            let active = DatasetPaths::new(dir.clone()).is_active();
            info!(key_id, dir = %dir.display(), active, "Known dataset");
        }

        Ok(Self {
            base_dir,
            datasets: RwLock::new(list.entries),
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn list_path(&self) -> PathBuf {
        self.base_dir.join(LIST_FILENAME)
    }

    fn lookup(&self, key_id: KeyId) -> Result<Option<PathBuf>> {
        let datasets = self
            .datasets
            .read()
            .map_err(|_| SsesError::WorkerFailure("dataset registry lock poisoned".into()))?;
        Ok(datasets.get(&key_id).cloned())
    }

    /// True iff a dataset for `key_id` is registered and active.
    #[must_use]
    pub fn is_enabled(&self, key_id: KeyId) -> bool {
        match self.lookup(key_id) {
            Ok(Some(dir)) => DatasetPaths::new(dir).is_active(),
            _ => false,
        }
    }

    /// Paths of the dataset for `key_id`.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if no dataset is registered.
    pub fn paths(&self, key_id: KeyId) -> Result<DatasetPaths> {
        self.lookup(key_id)?
            .map(DatasetPaths::new)
            .ok_or_else(|| SsesError::NotFound(format!("dataset for key {key_id}")))
    }

    /// Basic counts of the dataset for `key_id`.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if no dataset is registered.
    pub fn basics(&self, key_id: KeyId) -> Result<DbBasics> {
        Ok(DbBasics::load(&self.paths(key_id)?.dbbasics())?)
    }

    /// Build the dataset for `key_id` from `source`. No-op if already enabled.
    ///
    /// Any stale directory for the key is removed first.
    ///
    /// # Errors
    /// Returns an error if the source table cannot be read or any file
    /// cannot be written. A failed setup leaves the dataset disabled.
    pub fn setup<E: FheEngine>(
        &self,
        engine: &E,
        key_id: KeyId,
        source: &Path,
        ctx: &E::Context,
        pk: &E::PublicKey,
    ) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| SsesError::WorkerFailure("dataset write lock poisoned".into()))?;
        if self.is_enabled(key_id) {
            debug!(key_id, "Dataset already enabled");
            return Ok(());
        }

        let paths = DatasetPaths::new(self.base_dir.join(format!("db_{key_id}")));
        if paths.root.exists() {
            warn!(key_id, dir = %paths.root.display(), "Removing stale dataset directory");
            std::fs::remove_dir_all(&paths.root).map_err(io_error(&paths.root))?;
        }
        for dir in [paths.root.clone(), paths.encdata_dir(), paths.auxdata_dir()] {
            std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        }

        info!(
            key_id,
            source = %source.display(),
            dir = %paths.root.display(),
            "Creating dataset"
        );
        let table = SourceTable::load(source)?;

        let mut medicine_index = InvertedIndex::new();
        let mut side_effect_index = InvertedIndex::new();
        for &id in &table.medicines {
            medicine_index.declare(id);
        }
        for &id in &table.side_effects {
            side_effect_index.declare(id);
        }
        for record in table.records.values() {
            index_record(&mut medicine_index, &mut side_effect_index, record);
        }

        table
            .records
            .par_iter()
            .try_for_each(|(_, record)| write_record(engine, &paths, ctx, pk, record))?;

        medicine_index.save(&paths.medicine_index())?;
        side_effect_index.save(&paths.side_effect_index())?;
        let basics = DbBasics::active(
            table.records.len(),
            table.medicines.len(),
            table.side_effects.len(),
        );
        basics.save(&paths.dbbasics())?;
        info!(key_id, %basics, "Dataset created");

        self.register(key_id, paths.root)
    }

    fn register(&self, key_id: KeyId, dir: PathBuf) -> Result<()> {
        let mut datasets = self
            .datasets
            .write()
            .map_err(|_| SsesError::WorkerFailure("dataset registry lock poisoned".into()))?;
        datasets.insert(key_id, dir);
        let list = ListFile {
            entries: datasets.clone(),
        };
        list.save(&self.list_path())?;
        debug!(key_id, list = %self.list_path().display(), "Updated list file");
        Ok(())
    }

    /// Add one patient to an existing dataset.
    ///
    /// The patient's mask is encrypted and stored, its aux file written, and
    /// its id merged into every postings list it belongs to.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the dataset is not enabled.
    pub fn add_record<E: FheEngine>(
        &self,
        engine: &E,
        key_id: KeyId,
        ctx: &E::Context,
        pk: &E::PublicKey,
        record: &PatientRecord,
    ) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| SsesError::WorkerFailure("dataset write lock poisoned".into()))?;
        if !self.is_enabled(key_id) {
            return Err(SsesError::NotFound(format!("enabled dataset for key {key_id}")));
        }
        let paths = self.paths(key_id)?;
        let is_new = !paths.encrypted_mask(record.id).exists();

        write_record(engine, &paths, ctx, pk, record)?;

        let (mut medicine_index, mut side_effect_index) = load_indexes(&paths)?;
        index_record(&mut medicine_index, &mut side_effect_index, record);
        medicine_index.save(&paths.medicine_index())?;
        side_effect_index.save(&paths.side_effect_index())?;

        let mut basics = DbBasics::load(&paths.dbbasics())?;
        if is_new {
            basics.records += 1;
        }
        basics.medicines = medicine_index.len();
        basics.side_effects = side_effect_index.len();
        basics.save(&paths.dbbasics())?;

        info!(key_id, patient = record.id, %basics, "Dataset updated");
        Ok(())
    }

    /// Medicine and side-effect indexes of the dataset for `key_id`.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the dataset is unknown.
    pub fn load_indexes(&self, key_id: KeyId) -> Result<(InvertedIndex, InvertedIndex)> {
        load_indexes(&self.paths(key_id)?)
    }

    /// Serialized encrypted mask of one patient.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the file is missing.
    pub fn read_encrypted_mask(&self, key_id: KeyId, patient: PatientId) -> Result<Vec<u8>> {
        Ok(read_bytes(&self.paths(key_id)?.encrypted_mask(patient))?)
    }

    /// Plaintext aux record of one patient.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if the file is missing.
    pub fn read_aux(&self, key_id: KeyId, patient: PatientId) -> Result<AuxRecord> {
        let path = self.paths(key_id)?.aux(patient);
        let bytes = read_bytes(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        AuxRecord::parse(&text).map_err(|reason| {
            StorageError::Malformed {
                path: path.clone(),
                reason,
            }
            .into()
        })
    }
}

fn index_record(
    medicine_index: &mut InvertedIndex,
    side_effect_index: &mut InvertedIndex,
    record: &PatientRecord,
) {
    for &id in &record.medicines {
        medicine_index.insert(id, record.id);
    }
    for &id in &record.side_effects {
        side_effect_index.insert(id, record.id);
    }
}

fn load_indexes(paths: &DatasetPaths) -> Result<(InvertedIndex, InvertedIndex)> {
    Ok((
        InvertedIndex::load(&paths.medicine_index())?,
        InvertedIndex::load(&paths.side_effect_index())?,
    ))
}

fn write_record<E: FheEngine>(
    engine: &E,
    paths: &DatasetPaths,
    ctx: &E::Context,
    pk: &E::PublicKey,
    record: &PatientRecord,
) -> Result<()> {
    let ct = engine.encrypt(ctx, pk, record.mask)?;
    write_atomic(
        &paths.encrypted_mask(record.id),
        &engine.serialize_ciphertext(&ct)?,
    )?;
    write_atomic(&paths.aux(record.id), record.aux().to_text().as_bytes())?;
    debug!(
        patient = record.id,
        medicines = record.medicines.len(),
        side_effects = record.side_effects.len(),
        "Stored record"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bfv::BfvEngine;
    use crate::domain::{ContextSettings, Gender};

    const TABLE: &str = "id,medicine,side_effect,c3,c4,c5,c6,c7,age,gender\n\
                         1,1,5,x,x,x,x,x,30,1\n\
                         1,2,5,x,x,x,x,x,30,1\n\
                         2,2,6,x,x,x,x,x,35,2\n\
                         3,1,5,x,x,x,x,x,30,1\n\
                         3,1,6,x,x,x,x,x,30,1\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        source: PathBuf,
        base: PathBuf,
        engine: BfvEngine,
        ctx: <BfvEngine as FheEngine>::Context,
        pk: <BfvEngine as FheEngine>::PublicKey,
        sk: <BfvEngine as FheEngine>::SecretKey,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("demo.csv");
        std::fs::write(&source, TABLE).unwrap();
        let base = dir.path().join("data");

        let engine = BfvEngine::new();
        let settings = ContextSettings {
            degree: 2048,
            plaintext_modulus: 65537,
            moduli_sizes: vec![62, 62, 62],
        };
        let ctx = engine.create_context(&settings).unwrap();
        let (pk, sk) = engine.generate_keys(&ctx).unwrap();
        Fixture {
            _dir: dir,
            source,
            base,
            engine,
            ctx,
            pk,
            sk,
        }
    }

    #[test]
    fn test_setup_writes_layout() {
        let f = fixture();
        let store = DatasetStore::open(&f.base).unwrap();
        assert!(!store.is_enabled(9));

        store.setup(&f.engine, 9, &f.source, &f.ctx, &f.pk).unwrap();
        assert!(store.is_enabled(9));

        let paths = store.paths(9).unwrap();
        assert_eq!(paths.root, f.base.join("db_9"));
        assert_eq!(store.basics(9).unwrap(), DbBasics::active(3, 2, 2));

        let (meds, sides) = store.load_indexes(9).unwrap();
        assert_eq!(meds.get(1), &[1, 3]);
        assert_eq!(meds.get(2), &[1, 2]);
        assert_eq!(sides.get(5), &[1, 3]);
        assert_eq!(sides.get(6), &[2, 3]);

        let aux = store.read_aux(9, 3).unwrap();
        assert_eq!(aux.medicines, vec![1]);
        assert_eq!(aux.side_effects, vec![5, 6]);

        let bytes = store.read_encrypted_mask(9, 2).unwrap();
        let ct = f.engine.deserialize_ciphertext(&f.ctx, &bytes).unwrap();
        let slots = f.engine.decrypt(&f.ctx, &f.sk, &ct).unwrap();
        assert!(slots.iter().all(|&v| v == 168));
    }

    #[test]
    fn test_setup_is_idempotent_and_survives_reopen() {
        let f = fixture();
        {
            let store = DatasetStore::open(&f.base).unwrap();
            store.setup(&f.engine, 4, &f.source, &f.ctx, &f.pk).unwrap();
        }
        // Source gone: a second setup must not touch it.
        std::fs::remove_file(&f.source).unwrap();

        let store = DatasetStore::open(&f.base).unwrap();
        assert!(store.is_enabled(4));
        store.setup(&f.engine, 4, &f.source, &f.ctx, &f.pk).unwrap();
        assert_eq!(store.basics(4).unwrap().records, 3);
    }

    #[test]
    fn test_unknown_dataset_is_not_found() {
        let f = fixture();
        let store = DatasetStore::open(&f.base).unwrap();
        assert!(matches!(store.paths(1), Err(SsesError::NotFound(_))));
        assert!(matches!(store.read_aux(1, 1), Err(SsesError::NotFound(_))));
    }

    #[test]
    fn test_missing_aux_file_is_not_found() {
        let f = fixture();
        let store = DatasetStore::open(&f.base).unwrap();
        store.setup(&f.engine, 2, &f.source, &f.ctx, &f.pk).unwrap();
        assert!(matches!(store.read_aux(2, 77), Err(SsesError::NotFound(_))));
    }

    #[test]
    fn test_add_record_updates_indexes() {
        let f = fixture();
        let store = DatasetStore::open(&f.base).unwrap();
        store.setup(&f.engine, 5, &f.source, &f.ctx, &f.pk).unwrap();

        let mut record = PatientRecord::new(10, 41, Gender::Other).unwrap();
        record.medicines.extend([2, 7]);
        record.side_effects.insert(5);
        store.add_record(&f.engine, 5, &f.ctx, &f.pk, &record).unwrap();

        let (meds, sides) = store.load_indexes(5).unwrap();
        assert_eq!(meds.get(2), &[1, 2, 10]);
        assert_eq!(meds.get(7), &[10]);
        assert_eq!(sides.get(5), &[1, 3, 10]);
        assert_eq!(store.basics(5).unwrap(), DbBasics::active(4, 3, 2));
        assert_eq!(store.read_aux(5, 10).unwrap().medicines, vec![2, 7]);
    }

    #[test]
    fn test_add_record_requires_dataset() {
        let f = fixture();
        let store = DatasetStore::open(&f.base).unwrap();
        let record = PatientRecord::new(1, 20, Gender::Male).unwrap();
        assert!(matches!(
            store.add_record(&f.engine, 3, &f.ctx, &f.pk, &record),
            Err(SsesError::NotFound(_))
        ));
    }
}
