//! Add one patient to the dataset of a registered key-id.
//!
//! The patient's mask is encrypted under the key's stored public key, its
//! aux file written and its id merged into the postings lists. Run it
//! against the same dataset and key directories as the server.
//!
//! ```bash
//! sses-update --dataset-dir . --key-id 1234 --record-id 42 \
//!     --age 51 --gender f --medicines 3:7 --side-effects 12
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use sses::adapters::bfv::BfvEngine;
use sses::adapters::dataset::{DatasetStore, DbBasics};
use sses::adapters::keystore::KeyRegistry;
use sses::domain::{parse_ids, Gender, KeyId, PatientId, PatientRecord};
use sses::ServerConfig;

#[derive(Parser)]
#[command(name = "sses-update")]
#[command(about = "Add a patient record to an sses dataset")]
#[command(version)]
struct Args {
    /// Server JSON config; supplies the dataset and key directories
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    dataset_dir: Option<PathBuf>,

    /// Key directory (default: <dataset-dir>/keys)
    #[arg(long)]
    key_dir: Option<PathBuf>,

    #[arg(short, long)]
    key_id: KeyId,

    #[arg(short, long)]
    record_id: PatientId,

    #[arg(short, long)]
    age: u8,

    /// m, f or o
    #[arg(short, long)]
    gender: Gender,

    /// ':'-delimited medicine ids
    #[arg(short, long)]
    medicines: String,

    /// ':'-delimited side-effect ids
    #[arg(short, long)]
    side_effects: String,
}

fn run(args: &Args) -> Result<DbBasics> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(dataset_dir) = &args.dataset_dir {
        config.dataset_dir.clone_from(dataset_dir);
    }
    if args.key_dir.is_some() {
        config.key_dir.clone_from(&args.key_dir);
    }

    let mut record = PatientRecord::new(args.record_id, i64::from(args.age), args.gender)?;
    record.medicines.extend(
        parse_ids(&args.medicines)
            .map_err(|token| anyhow::anyhow!("Invalid medicine id {token:?}"))?,
    );
    record.side_effects.extend(
        parse_ids(&args.side_effects)
            .map_err(|token| anyhow::anyhow!("Invalid side effect id {token:?}"))?,
    );

    let keys = KeyRegistry::new(Arc::new(BfvEngine::new()), config.key_dir())?;
    keys.setup(args.key_id, false)?;
    let material = keys
        .public_material(args.key_id)
        .with_context(|| format!("No public keys for key-id {}", args.key_id))?;

    let datasets = DatasetStore::open(&config.dataset_dir)?;
    datasets.add_record(
        keys.engine().as_ref(),
        args.key_id,
        &material.ctx,
        &material.pk,
        &record,
    )?;
    Ok(datasets.basics(args.key_id)?)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = sses::logging::init("logs/sses-update.log").context("Failed to open log file")?;

    let basics = run(&args)?;
    println!("key_id: {}", args.key_id);
    println!("records: {}", basics.records);
    println!("medicines: {}", basics.medicines);
    println!("side_effects: {}", basics.side_effects);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sses::domain::ContextSettings;
    use sses::ports::FheEngine;

    const TABLE: &str = "id,medicine,side_effect,c3,c4,c5,c6,c7,age,gender\n\
                         1,1,5,x,x,x,x,x,30,1\n\
                         2,2,6,x,x,x,x,x,40,2\n";

    fn args(dataset_dir: PathBuf, key_id: KeyId) -> Args {
        Args {
            config: None,
            dataset_dir: Some(dataset_dir),
            key_dir: None,
            key_id,
            record_id: 9,
            age: 51,
            gender: Gender::Female,
            medicines: "1:7".into(),
            side_effects: "6".into(),
        }
    }

    #[test]
    fn test_update_adds_record_to_server_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("demo.csv");
        std::fs::write(&source, TABLE).unwrap();
        let base = dir.path().join("data");

        let engine = Arc::new(BfvEngine::new());
        let keys = KeyRegistry::new(Arc::clone(&engine), base.join("keys")).unwrap();
        let key_id = keys
            .create(&ContextSettings {
                degree: 2048,
                plaintext_modulus: 65537,
                moduli_sizes: vec![62, 62, 62],
            })
            .unwrap();
        let material = keys.public_material(key_id).unwrap();
        DatasetStore::open(&base)
            .unwrap()
            .setup(engine.as_ref(), key_id, &source, &material.ctx, &material.pk)
            .unwrap();

        let basics = run(&args(base.clone(), key_id)).unwrap();
        assert_eq!(basics, DbBasics::active(3, 3, 2));

        let store = DatasetStore::open(&base).unwrap();
        let (meds, sides) = store.load_indexes(key_id).unwrap();
        assert_eq!(meds.get(1), &[1, 9]);
        assert_eq!(meds.get(7), &[9]);
        assert_eq!(sides.get(6), &[2, 9]);
        assert_eq!(store.read_aux(key_id, 9).unwrap().side_effects, vec![6]);

        let sk = keys.secret_key(key_id, &material.ctx).unwrap();
        let ct = engine
            .deserialize_ciphertext(&material.ctx, &store.read_encrypted_mask(key_id, 9).unwrap())
            .unwrap();
        let slots = engine.decrypt(&material.ctx, &sk, &ct).unwrap();
        assert!(slots.iter().all(|&v| v == 51 + 128 + 5));
    }

    #[test]
    fn test_update_without_dataset_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        let keys = KeyRegistry::new(Arc::new(BfvEngine::new()), base.join("keys")).unwrap();
        let key_id = keys
            .create(&ContextSettings {
                degree: 2048,
                plaintext_modulus: 65537,
                moduli_sizes: vec![62, 62, 62],
            })
            .unwrap();

        let err = run(&args(base, key_id)).unwrap_err();
        assert!(err.to_string().contains("Not found"));
    }

    #[test]
    fn test_update_rejects_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args(dir.path().to_path_buf(), 1);
        args.medicines = "1:x".into();
        assert!(run(&args).is_err());
    }
}
