//! Request handlers.
//!
//! Each handler checks the connection state first and returns
//! `ProtocolViolation` without touching shared state when the request comes
//! too early. State transitions happen only after the request succeeded.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::state::{Event, State, StateContext};
use crate::adapters::dataset::DatasetStore;
use crate::adapters::keystore::KeyRegistry;
use crate::application::{CalcManager, ManagerSettings};
use crate::config::ServerConfig;
use crate::domain::{DisclosedRecord, KeyId, Query, QueryId, QueryResult};
use crate::ports::FheEngine;
use crate::protocol::{
    CancelRequest, ChunkResultRequest, ChunkResults, RegisterKeys, ResultRequest, SubmitQuery,
    REJECTED_QUERY_ID,
};
use crate::{Result, SsesError};

/// Components shared by every connection.
pub struct ServerContext<E: FheEngine + 'static> {
    calc: CalcManager<E>,
    source_table: PathBuf,
}

impl<E: FheEngine + 'static> ServerContext<E> {
    /// Open the key registry and dataset store and start the Calc Workers.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created or a worker fails
    /// to start.
    pub fn new(engine: Arc<E>, config: &ServerConfig) -> Result<Self> {
        let config = config.clone().validate()?;
        let keys = Arc::new(KeyRegistry::new(engine, config.key_dir())?);
        let datasets = Arc::new(DatasetStore::open(&config.dataset_dir)?);
        let calc = CalcManager::new(keys, datasets, ManagerSettings::from(&config));
        calc.start_workers()?;
        Ok(Self {
            calc,
            source_table: config.source_table.clone(),
        })
    }

    #[must_use]
    pub fn calc(&self) -> &CalcManager<E> {
        &self.calc
    }

    fn keys(&self) -> &KeyRegistry<E> {
        self.calc.keys()
    }

    fn datasets(&self) -> &DatasetStore {
        self.calc.datasets()
    }
}

/// Scratch state of one connection.
#[derive(Debug, Default)]
pub struct Session {
    pub state: StateContext,
    key_id: Option<KeyId>,
    /// Queries submitted on this connection and not yet delivered.
    pending: BTreeSet<QueryId>,
    /// Chunk map of the last delivered result, kept for disclosure.
    delivered: Option<QueryResult>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key_id(&self) -> Option<KeyId> {
        self.key_id
    }
}

/// Store a client's public keys and build its dataset if needed.
///
/// # Errors
/// Returns an error if the keys do not parse or the dataset cannot be built.
pub fn register_keys<E: FheEngine + 'static>(
    ctx: &ServerContext<E>,
    session: &mut Session,
    request: RegisterKeys,
) -> Result<()> {
    session.state.require(State::Connected, "key registration")?;
    info!(
        key_id = request.key_id,
        context_bytes = request.context.len(),
        public_key_bytes = request.public_key.len(),
        "Start encryption key registration"
    );

    let keys = ctx.keys();
    keys.store_public(request.key_id, &request.context, &request.public_key)?;
    if !ctx.datasets().is_enabled(request.key_id) {
        let material = keys.public_material(request.key_id)?;
        ctx.datasets().setup(
            keys.engine().as_ref(),
            request.key_id,
            &ctx.source_table,
            &material.ctx,
            &material.pk,
        )?;
    }

    session.key_id = Some(request.key_id);
    session.state.set(Event::EncryptionKeyReceived);
    info!(key_id = request.key_id, "Finish encryption key registration");
    Ok(())
}

/// Hand a query to the Calc Manager.
///
/// A full queue answers [`REJECTED_QUERY_ID`] and leaves the state as is.
///
/// # Errors
/// Returns `ProtocolViolation` before key registration and `NotFound` for
/// a key-id without keys.
pub fn submit_query<E: FheEngine + 'static>(
    ctx: &ServerContext<E>,
    session: &mut Session,
    request: SubmitQuery,
) -> Result<QueryId> {
    session.state.require(State::Ready, "query")?;
    if !ctx.keys().is_registered(request.key_id) {
        return Err(SsesError::NotFound(format!(
            "keys for key-id {}",
            request.key_id
        )));
    }
    info!(
        key_id = request.key_id,
        medicines = %request.param.medicines,
        side_effects = %request.param.side_effects,
        enc_mask_bytes = request.enc_mask.size_bytes(),
        "Received query"
    );

    let query = Query {
        key_id: request.key_id,
        param: request.param,
        enc_mask: request.enc_mask,
    };
    match ctx.calc().push_query(query) {
        Ok(query_id) => {
            session.pending.insert(query_id);
            session.state.set(Event::QueryReceived);
            info!(query_id, "Put query in queue");
            Ok(query_id)
        }
        Err(SsesError::CapacityExceeded(reason)) => {
            warn!(%reason, "Query rejected");
            Ok(REJECTED_QUERY_ID)
        }
        Err(e) => Err(e),
    }
}

/// Wait for a query's chunk results and deliver them.
///
/// # Errors
/// Returns `ProtocolViolation` for a query this connection did not submit.
pub fn chunk_result<E: FheEngine + 'static>(
    ctx: &ServerContext<E>,
    session: &mut Session,
    request: ChunkResultRequest,
) -> Result<ChunkResults> {
    session.state.require(State::Computing, "chunk result request")?;
    let query_id = request.query_id;
    if !session.pending.contains(&query_id) {
        return Err(SsesError::ProtocolViolation(format!(
            "query {query_id} was not submitted on this connection"
        )));
    }

    info!(query_id, "Waiting for chunk computation");
    let mut result = ctx.calc().pop_result(query_id)?;
    session.pending.remove(&query_id);
    info!(
        query_id,
        key_id = result.key_id,
        status = ?result.status(),
        chunks = result.chunks.len(),
        "Sending chunk results"
    );

    let ciphertexts = std::mem::take(&mut result.chunk_results);
    let response = ChunkResults {
        status: result.status(),
        key_id: result.key_id,
        ciphertexts,
    };
    session.delivered = Some(result);
    session.state.set(Event::ChunkResultDelivered);
    Ok(response)
}

/// Disclose the records behind the slots the client selected.
///
/// Selections outside the delivered chunk map are dropped.
///
/// # Errors
/// Returns `ProtocolViolation` if the request does not match the delivered
/// result, and `NotFound` if an aux file is missing.
pub fn disclose<E: FheEngine + 'static>(
    ctx: &ServerContext<E>,
    session: &mut Session,
    request: ResultRequest,
) -> Result<Vec<DisclosedRecord>> {
    session.state.require(State::Computed, "result request")?;
    let delivered = session
        .delivered
        .as_ref()
        .filter(|r| r.query_id == request.query_id && r.key_id == request.key_id)
        .ok_or_else(|| {
            SsesError::ProtocolViolation(format!(
                "no delivered result for query {} under key-id {}",
                request.query_id, request.key_id
            ))
        })?;

    let selections: BTreeSet<_> = request.selections.into_iter().collect();
    let requested = selections.len();
    let records = selections
        .into_iter()
        .filter_map(|selection| delivered.resolve(selection))
        .map(|patient| {
            let aux = ctx.datasets().read_aux(delivered.key_id, patient)?;
            Ok(DisclosedRecord::new(patient, aux))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        query_id = request.query_id,
        requested,
        disclosed = records.len(),
        "Sending results"
    );
    session.delivered = None;
    session.state.set(Event::ResultDelivered);
    Ok(records)
}

/// Stop following a query.
///
/// A query no worker has claimed yet is dropped from the queue, and a
/// finished result nobody fetched is discarded. One still being computed
/// runs to completion and its result is left to eviction.
///
/// # Errors
/// Returns `ProtocolViolation` before the connection is ready.
pub fn cancel<E: FheEngine + 'static>(
    ctx: &ServerContext<E>,
    session: &mut Session,
    request: CancelRequest,
) -> Result<()> {
    session.state.require(State::Ready, "cancel")?;
    let query_id = request.query_id;

    let released = session.pending.remove(&query_id)
        && (ctx.calc().withdraw_query(query_id) || ctx.calc().try_pop_result(query_id).is_some());
    if session
        .delivered
        .as_ref()
        .is_some_and(|r| r.query_id == query_id)
    {
        session.delivered = None;
    }
    info!(query_id, released, "Canceled query");
    session.state.set(Event::CancelQuery);
    Ok(())
}
