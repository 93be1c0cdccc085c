//! sses-client: run one encrypted search against an sses-server.
//!
//! ```bash
//! sses-client --host localhost --port 10001 --key-id 0 \
//!     --age 30 --gender m --medicines 1:2 --side-effects 5
//! ```
//!
//! Matching records are printed to stdout as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use sses::adapters::bfv::BfvEngine;
use sses::adapters::keystore::KeyRegistry;
use sses::client::{resolve_key_id, Client};
use sses::domain::{parse_ids, ComputationParam, ContextSettings, DisclosedRecord, Gender, KeyId};

#[derive(Parser)]
#[command(name = "sses-client")]
#[command(about = "Privacy-preserving symptom/medication search client")]
#[command(version)]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(short, long, default_value_t = 10001)]
    port: u16,

    /// Directory with ctxt_/pk_/sk_<key id>.bin
    #[arg(long, default_value = "keys")]
    key_dir: PathBuf,

    /// Scheme settings used when generating keys
    #[arg(short = 'c', long, default_value = "settings/context.json")]
    context_settings: PathBuf,

    /// Key-id to use; 0 generates a new key triple
    #[arg(short, long, default_value_t = 0)]
    key_id: KeyId,

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

    /// Seconds to keep retrying the connection
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
}

#[derive(Serialize)]
struct Output {
    key_id: KeyId,
    records: Vec<DisclosedRecord>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = sses::logging::init("logs/sses-client.log").context("Failed to open log file")?;

    for (label, list) in [("medicine", &args.medicines), ("side effect", &args.side_effects)] {
        parse_ids(list).map_err(|token| anyhow::anyhow!("Invalid {label} id {token:?}"))?;
    }
    let param = ComputationParam {
        age: Some(args.age),
        gender: Some(args.gender),
        medicines: args.medicines.clone(),
        side_effects: args.side_effects.clone(),
    };

    let keys = Arc::new(KeyRegistry::new(Arc::new(BfvEngine::new()), &args.key_dir)?);
    let key_id = if args.key_id == 0 {
        let settings = ContextSettings::load(&args.context_settings).with_context(|| {
            format!("Failed to load {}", args.context_settings.display())
        })?;
        resolve_key_id(&keys, 0, &settings)?
    } else {
        resolve_key_id(&keys, args.key_id, &ContextSettings::default())?
    };

    let addr = format!("{}:{}", args.host, args.port);
    let mut client = Client::connect(
        addr.as_str(),
        keys,
        Duration::from_millis(100),
        Duration::from_secs(args.connect_timeout),
    )
    .with_context(|| format!("Failed to connect to {addr}"))?;

    client.register_keys(key_id)?;
    let records = client.search(key_id, &param)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&Output { key_id, records })?
    );
    Ok(())
}
