//! Calc Worker: claims queries and runs the matching pipeline.
//!
//! Each worker is one OS thread plus its own rayon pool, so a query's
//! chunks are evaluated in parallel while other workers handle other
//! queries. A query that cannot be processed (unknown key, missing dataset,
//! corrupt ciphertext) yields a failed result and the worker moves on. Only
//! a broken result queue ends the thread; the error is returned through the
//! join handle.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, error, info};

use super::calc_manager::Shared;
use super::matching::MatchEvaluator;
use super::merge::{chunk, filter_candidates};
use crate::domain::{CiphertextBuffer, KeyId, PatientId, Query, QueryId, QueryResult};
use crate::ports::FheEngine;
use crate::{Result, SsesError};

pub(crate) struct CalcWorker<E: FheEngine> {
    id: usize,
    shared: Arc<Shared<E>>,
    pool: ThreadPool,
}

impl<E: FheEngine + 'static> CalcWorker<E> {
    /// Start worker `id` on its own thread.
    pub(crate) fn spawn(id: usize, shared: Arc<Shared<E>>) -> Result<JoinHandle<Result<()>>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(shared.settings.threads_per_query)
            .thread_name(move |i| format!("calc-{id}-chunk-{i}"))
            .build()
            .map_err(|e| SsesError::WorkerFailure(format!("chunk pool: {e}")))?;
        let worker = Self { id, shared, pool };

        let handle = thread::Builder::new()
            .name(format!("calc-{id}"))
            .spawn(move || worker.run())?;
        Ok(handle)
    }

    fn run(self) -> Result<()> {
        info!(worker = self.id, "Calc worker started");
        let wait = self.shared.settings.retry_interval;

        while self.shared.running.load(Ordering::Acquire) {
            let Some((query_id, query)) = self.shared.queries.pop_next_wait(wait) else {
                continue;
            };
            let started = Instant::now();

            let result = match self.compute(query_id, &query) {
                Ok(result) => {
                    info!(
                        worker = self.id,
                        query_id,
                        key_id = query.key_id,
                        chunks = result.chunks.len(),
                        elapsed_ms = started.elapsed().as_millis(),
                        "Query computed"
                    );
                    result
                }
                Err(e) => {
                    error!(
                        worker = self.id,
                        query_id,
                        key_id = query.key_id,
                        error = %e,
                        "Query failed"
                    );
                    QueryResult::failed(query.key_id, query_id)
                }
            };

            self.shared.results.push(query_id, result).map_err(|_| {
                SsesError::WorkerFailure(format!("result for query {query_id} already present"))
            })?;
        }

        info!(worker = self.id, "Calc worker stopped");
        Ok(())
    }

    fn compute(&self, query_id: QueryId, query: &Query) -> Result<QueryResult> {
        let key_id = query.key_id;
        let medicines = query
            .param
            .medicine_ids()
            .map_err(|token| SsesError::InvalidParameter(format!("medicine id {token:?}")))?;
        let side_effects = query
            .param
            .side_effect_ids()
            .map_err(|token| SsesError::InvalidParameter(format!("side effect id {token:?}")))?;

        let (medicine_index, side_effect_index) = self.shared.datasets.load_indexes(key_id)?;
        let candidates = filter_candidates(
            &medicine_index.lists(&medicines),
            &side_effect_index.lists(&side_effects),
        );
        let chunks = chunk(&candidates, self.shared.settings.chunk_size);
        debug!(
            worker = self.id,
            query_id,
            candidates = candidates.len(),
            chunks = chunks.len(),
            "Filtered candidates"
        );

        if chunks.is_empty() {
            return Ok(QueryResult::new(
                key_id,
                query_id,
                CiphertextBuffer::default(),
                chunks,
            ));
        }

        let material = self.shared.keys.public_material(key_id)?;
        let engine = self.shared.keys.engine().as_ref();
        let enc_mask = query
            .enc_mask
            .first()
            .ok_or_else(|| SsesError::InvalidParameter("query carries no encrypted mask".into()))?;
        let negated_query = engine.deserialize_ciphertext(&material.ctx, enc_mask)?;
        let evaluator = MatchEvaluator::new(
            engine,
            &material.ctx,
            &material.pk,
            self.shared.settings.chunk_size,
        )?;

        let ciphertexts = self.pool.install(|| {
            chunks
                .par_iter()
                .map(|ids| self.compute_chunk(&evaluator, key_id, ids, &negated_query))
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(QueryResult::new(
            key_id,
            query_id,
            CiphertextBuffer::new(ciphertexts),
            chunks,
        ))
    }

    fn compute_chunk(
        &self,
        evaluator: &MatchEvaluator<'_, E>,
        key_id: KeyId,
        ids: &[PatientId],
        negated_query: &E::Ciphertext,
    ) -> Result<Vec<u8>> {
        let engine = evaluator.engine();
        let ctx = evaluator.context();
        let masks = ids
            .iter()
            .map(|&patient| {
                let bytes = self.shared.datasets.read_encrypted_mask(key_id, patient)?;
                Ok(engine.deserialize_ciphertext(ctx, &bytes)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let ct = evaluator.evaluate_chunk(&masks, negated_query)?;
        Ok(engine.serialize_ciphertext(&ct)?)
    }
}
