//! BFV key triple generation for sses clients.
//!
//! Writes `ctxt_<id>.bin`, `pk_<id>.bin` and `sk_<id>.bin` under a new
//! random key-id and prints only the key-id and public fingerprint.
//!
//! ```bash
//! sses-keygen --key-dir keys --context-settings settings/context.json
//! ```
//!
//! The secret key file is written with 0600 permissions on Unix.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use sses::adapters::bfv::BfvEngine;
use sses::adapters::keystore::KeyRegistry;
use sses::domain::{fingerprint, ContextSettings, KeyKind};

#[derive(Parser)]
#[command(name = "sses-keygen")]
#[command(about = "Generate a BFV key triple for sses-client")]
#[command(version)]
struct Args {
    #[arg(long, default_value = "keys")]
    key_dir: PathBuf,

    #[arg(short = 'c', long, default_value = "settings/context.json")]
    context_settings: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = sses::logging::init("logs/sses-keygen.log").context("Failed to open log file")?;

    let settings = ContextSettings::load(&args.context_settings)
        .with_context(|| format!("Failed to load {}", args.context_settings.display()))?;
    let keys = KeyRegistry::new(Arc::new(BfvEngine::new()), &args.key_dir)?;
    let key_id = keys.create(&settings)?;

    let pk = keys.read_raw(key_id, KeyKind::PublicKey)?;
    println!("key_id: {key_id}");
    println!("pk_fingerprint: {}", fingerprint(&pk));
    Ok(())
}
