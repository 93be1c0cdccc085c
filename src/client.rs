//! Client side of the search protocol.
//!
//! The client owns the secret key. It sends the server its public keys and
//! its negated profile mask (encrypted into every slot), decrypts the
//! blinded chunk results, and asks for exactly the records whose slots came
//! out zero.
//!
//! Chunk results can also be collected on a background thread: see
//! [`Client::send_query_with_callback`] and [`Client::wait`].

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapters::keystore::KeyRegistry;
use crate::domain::{
    compute_mask, CiphertextBuffer, ComputationParam, ContextSettings, DisclosedRecord, KeyId,
    KeyKind, QueryId, ResultStatus, SelectedPosition,
};
use crate::ports::FheEngine;
use crate::protocol::{
    read_frame, write_frame, CancelRequest, ChunkResultRequest, ChunkResults, ControlCode,
    RegisterKeys, Reply, ResultRequest, SubmitQuery, REJECTED_QUERY_ID,
};
use crate::{Result, SsesError};

/// Use the keys of `key_id`, or generate a fresh triple when it is 0.
///
/// # Errors
/// Returns `SsesError::NotFound` if an existing key-id lacks any key file.
pub fn resolve_key_id<E: FheEngine>(
    keys: &KeyRegistry<E>,
    key_id: KeyId,
    settings: &ContextSettings,
) -> Result<KeyId> {
    if key_id == 0 {
        keys.create(settings)
    } else {
        keys.setup(key_id, true)?;
        Ok(key_id)
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        code: ControlCode,
        request: &Req,
    ) -> Result<Resp> {
        exchange(&self.conn, code, request)
    }
}

// One request/reply exchange at a time, whichever thread sends it.
fn exchange<Req: Serialize, Resp: DeserializeOwned>(
    conn: &Mutex<Connection>,
    code: ControlCode,
    request: &Req,
) -> Result<Resp> {
    conn.lock()
        .map_err(|_| SsesError::WorkerFailure("connection lock poisoned".into()))?
        .call(code, request)
}

fn fetch_chunk_results(conn: &Mutex<Connection>, query_id: QueryId) -> Result<ChunkResults> {
    let results: ChunkResults = exchange(
        conn,
        ControlCode::UpDownloadChunkResult,
        &ChunkResultRequest { query_id },
    )?;
    debug!(
        query_id,
        status = ?results.status,
        chunks = results.ciphertexts.len(),
        "Received chunk results"
    );
    Ok(results)
}

pub struct Client<E: FheEngine> {
    keys: Arc<KeyRegistry<E>>,
    conn: Arc<Mutex<Connection>>,
    result_threads: BTreeMap<QueryId, JoinHandle<()>>,
}

impl<E: FheEngine> Client<E> {
    /// Connect, retrying every `retry_interval` until `timeout` has passed.
    ///
    /// # Errors
    /// Returns the last connection error once the timeout expires.
    pub fn connect(
        addr: impl ToSocketAddrs + std::fmt::Display,
        keys: Arc<KeyRegistry<E>>,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(%addr, error = %e, "Connect failed, retrying");
                    thread::sleep(retry_interval);
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nodelay(true)?;
        info!(%addr, "Connected to server");

        let conn = Connection {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        };
        Ok(Self {
            keys,
            conn: Arc::new(Mutex::new(conn)),
            result_threads: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn keys(&self) -> &Arc<KeyRegistry<E>> {
        &self.keys
    }

    fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        code: ControlCode,
        request: &Req,
    ) -> Result<Resp> {
        exchange(&self.conn, code, request)
    }

    /// Send the context and public key of `key_id`.
    ///
    /// # Errors
    /// Returns an error if the key files are missing or the server rejects them.
    pub fn register_keys(&mut self, key_id: KeyId) -> Result<()> {
        let request = RegisterKeys {
            key_id,
            context: self.keys.read_raw(key_id, KeyKind::Context)?,
            public_key: self.keys.read_raw(key_id, KeyKind::PublicKey)?,
        };
        info!(
            key_id,
            context_bytes = request.context.len(),
            public_key_bytes = request.public_key.len(),
            "Sending encryption keys"
        );
        self.call(ControlCode::EncKeys, &request)
    }

    /// Encrypt the profile of `param` and submit the query.
    ///
    /// Only the id lists leave the client in the clear.
    ///
    /// # Errors
    /// Returns `SsesError::InvalidParameter` if age or gender is missing,
    /// and `SsesError::CapacityExceeded` if the server turned the query away.
    pub fn send_query(&mut self, key_id: KeyId, param: &ComputationParam) -> Result<QueryId> {
        let (Some(age), Some(gender)) = (param.age, param.gender) else {
            return Err(SsesError::InvalidParameter(
                "query needs both age and gender".into(),
            ));
        };
        let mask = compute_mask(i64::from(age), gender)?;

        let material = self.keys.public_material(key_id)?;
        let engine = self.keys.engine();
        let enc_mask = engine.encrypt(&material.ctx, &material.pk, -mask)?;
        let request = SubmitQuery {
            key_id,
            param: ComputationParam {
                age: None,
                gender: None,
                ..param.clone()
            },
            enc_mask: CiphertextBuffer::single(engine.serialize_ciphertext(&enc_mask)?),
        };

        let query_id: QueryId = self.call(ControlCode::UpDownloadQuery, &request)?;
        if query_id == REJECTED_QUERY_ID {
            return Err(SsesError::CapacityExceeded(
                "server queues are full, retry later".into(),
            ));
        }
        info!(query_id, key_id, "Query accepted");
        Ok(query_id)
    }

    /// Wait for the blinded chunk results of `query_id`.
    ///
    /// # Errors
    /// Returns an error if the server rejects the request.
    pub fn recv_chunk_results(&mut self, query_id: QueryId) -> Result<ChunkResults> {
        fetch_chunk_results(&self.conn, query_id)
    }

    /// Submit a query and collect its chunk results on a background thread.
    ///
    /// `callback` runs on that thread once the results (or the error that
    /// ended the wait) arrive. Requests sent from this client meanwhile queue
    /// behind the pending reply. Join the thread with [`wait`](Self::wait).
    ///
    /// # Errors
    /// Returns the [`send_query`](Self::send_query) errors, or `SsesError::Io`
    /// if the thread cannot be spawned.
    pub fn send_query_with_callback<F>(
        &mut self,
        key_id: KeyId,
        param: &ComputationParam,
        callback: F,
    ) -> Result<QueryId>
    where
        F: FnOnce(QueryId, Result<ChunkResults>) + Send + 'static,
    {
        let query_id = self.send_query(key_id, param)?;
        let conn = Arc::clone(&self.conn);
        let handle = thread::Builder::new()
            .name(format!("sses-result-{query_id}"))
            .spawn(move || callback(query_id, fetch_chunk_results(&conn, query_id)))?;
        self.result_threads.insert(query_id, handle);
        Ok(query_id)
    }

    /// Block until the callback of `query_id` has returned.
    ///
    /// # Errors
    /// Returns `SsesError::NotFound` if no result thread runs for `query_id`
    /// and `SsesError::WorkerFailure` if the callback panicked.
    pub fn wait(&mut self, query_id: QueryId) -> Result<()> {
        let handle = self.result_threads.remove(&query_id).ok_or_else(|| {
            SsesError::NotFound(format!("result thread for query {query_id}"))
        })?;
        handle.join().map_err(|_| {
            SsesError::WorkerFailure(format!("result callback for query {query_id} panicked"))
        })
    }

    /// Decrypt chunk results and collect the zero slots.
    ///
    /// # Errors
    /// Returns an error if the secret key is missing or decryption fails.
    pub fn find_matches(
        &self,
        key_id: KeyId,
        results: &ChunkResults,
    ) -> Result<Vec<SelectedPosition>> {
        let engine = self.keys.engine();
        let ctx = self.keys.context(key_id)?;
        let sk = self.keys.secret_key(key_id, &ctx)?;

        let mut selections = Vec::new();
        for (chunk, bytes) in results.ciphertexts.iter().enumerate() {
            let ct = engine.deserialize_ciphertext(&ctx, bytes)?;
            let slots = engine.decrypt(&ctx, &sk, &ct)?;
            selections.extend(
                slots
                    .iter()
                    .enumerate()
                    .filter(|(_, &value)| value == 0)
                    .map(|(position, _)| SelectedPosition { chunk, position }),
            );
        }
        Ok(selections)
    }

    /// Ask for the records behind `selections`.
    ///
    /// # Errors
    /// Returns an error if the server rejects the request.
    pub fn request_records(
        &mut self,
        query_id: QueryId,
        key_id: KeyId,
        selections: Vec<SelectedPosition>,
    ) -> Result<Vec<DisclosedRecord>> {
        let request = ResultRequest {
            query_id,
            key_id,
            selections,
        };
        self.call(ControlCode::UpDownloadResult, &request)
    }

    /// # Errors
    /// Returns an error if the server rejects the request.
    pub fn cancel(&mut self, query_id: QueryId) -> Result<()> {
        self.call(ControlCode::CancelQuery, &CancelRequest { query_id })
    }

    /// Run one search end to end on an already registered key.
    ///
    /// A failed computation yields no records.
    ///
    /// # Errors
    /// Returns an error if any protocol step fails.
    pub fn search(&mut self, key_id: KeyId, param: &ComputationParam) -> Result<Vec<DisclosedRecord>> {
        let query_id = self.send_query(key_id, param)?;
        let results = self.recv_chunk_results(query_id)?;
        if results.status == ResultStatus::Failed {
            warn!(query_id, "The status of result is not success");
            self.cancel(query_id)?;
            return Ok(Vec::new());
        }

        let selections = self.find_matches(key_id, &results)?;
        info!(query_id, selected = selections.len(), "Requesting matched records");
        self.request_records(query_id, key_id, selections)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use super::*;
    use crate::adapters::bfv::BfvEngine;
    use crate::config::ServerConfig;
    use crate::domain::Gender;
    use crate::server::{Server, ServerContext};

    fn write_source(path: &Path) {
        let mut file = std::fs::File::create(path).unwrap();
        writeln!(file, "id,med,side,c3,c4,c5,c6,c7,age,gender").unwrap();
        writeln!(file, "1,1,5,,,,,,30,1").unwrap();
        writeln!(file, "1,2,5,,,,,,30,1").unwrap();
        writeln!(file, "2,2,6,,,,,,40,2").unwrap();
        writeln!(file, "3,1,5,,,,,,30,1").unwrap();
        writeln!(file, "3,1,6,,,,,,30,1").unwrap();
    }

    fn small_settings() -> ContextSettings {
        ContextSettings {
            degree: 2048,
            plaintext_modulus: 65537,
            moduli_sizes: vec![62; 5],
        }
    }

    fn start_server(dir: &Path) -> std::net::SocketAddr {
        let source = dir.join("source.csv");
        write_source(&source);
        let config = ServerConfig {
            source_table: source,
            dataset_dir: dir.join("server"),
            workers: 2,
            threads_per_query: 2,
            retry_interval_ms: 10,
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(Arc::new(BfvEngine::new()), &config).unwrap();
        let (addr, _handle) = Server::bind("127.0.0.1:0", Arc::new(ctx))
            .unwrap()
            .spawn()
            .unwrap();
        addr
    }

    fn connect(dir: &Path, addr: std::net::SocketAddr) -> (Client<BfvEngine>, KeyId) {
        let keys = Arc::new(KeyRegistry::new(Arc::new(BfvEngine::new()), dir.join("client")).unwrap());
        let key_id = resolve_key_id(&keys, 0, &small_settings()).unwrap();
        let client = Client::connect(
            addr,
            keys,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .unwrap();
        (client, key_id)
    }

    fn param(medicines: &str, side_effects: &str) -> ComputationParam {
        ComputationParam {
            age: Some(30),
            gender: Some(Gender::Male),
            medicines: medicines.into(),
            side_effects: side_effects.into(),
        }
    }

    #[test]
    fn test_search_discloses_only_matching_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(dir.path());
        let (mut client, key_id) = connect(dir.path(), addr);
        client.register_keys(key_id).unwrap();

        let mut records = client.search(key_id, &param("1", "5")).unwrap();
        records.sort_by_key(|r| r.id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].medicines, vec![1, 2]);
        assert_eq!(records[0].side_effects, vec![5]);
        assert_eq!(records[1].id, 3);
        assert_eq!(records[1].medicines, vec![1]);
        assert_eq!(records[1].side_effects, vec![5, 6]);

        // Same connection, back in Ready: no candidates at all.
        let records = client.search(key_id, &param("9", "5")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_callback_receives_chunk_results() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(dir.path());
        let (mut client, key_id) = connect(dir.path(), addr);
        client.register_keys(key_id).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let query_id = client
            .send_query_with_callback(key_id, &param("1", "5"), move |query_id, results| {
                tx.send((query_id, results)).unwrap();
            })
            .unwrap();
        client.wait(query_id).unwrap();
        assert!(matches!(client.wait(query_id), Err(SsesError::NotFound(_))));

        let (delivered_id, results) = rx.recv().unwrap();
        assert_eq!(delivered_id, query_id);
        let results = results.unwrap();
        assert_eq!(results.status, ResultStatus::Success);
        assert_eq!(results.ciphertexts.len(), 1);

        let selections = client.find_matches(key_id, &results).unwrap();
        let mut records = client.request_records(query_id, key_id, selections).unwrap();
        records.sort_by_key(|r| r.id);
        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_query_before_registration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(dir.path());
        let (mut client, key_id) = connect(dir.path(), addr);

        assert!(matches!(
            client.send_query(key_id, &param("1", "5")),
            Err(SsesError::ProtocolViolation(_))
        ));
        client.register_keys(key_id).unwrap();
        assert!(client.send_query(key_id, &param("1", "5")).is_ok());
    }

    #[test]
    fn test_query_without_profile_never_leaves_client() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(dir.path());
        let (mut client, key_id) = connect(dir.path(), addr);
        client.register_keys(key_id).unwrap();

        let missing_age = ComputationParam {
            age: None,
            ..param("1", "5")
        };
        assert!(matches!(
            client.send_query(key_id, &missing_age),
            Err(SsesError::InvalidParameter(_))
        ));
    }
}
