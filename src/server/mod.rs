//! TCP server: one thread per connection, each with its own [`Session`].
//!
//! The dispatcher routes frames by control code to the handlers in
//! [`callbacks`]. A failed request is answered with a [`Rejection`] and the
//! connection stays open; only transport errors close it.

pub mod callbacks;
pub mod state;

use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use callbacks::{ServerContext, Session};
pub use state::{Event, State, StateContext};

use crate::ports::FheEngine;
use crate::protocol::{
    read_frame, write_frame, CancelRequest, ChunkResultRequest, ControlCode, Frame, RegisterKeys,
    Rejection, Reply, ResultRequest, SubmitQuery,
};
use crate::{Result, SsesError};

pub struct Server<E: FheEngine + 'static> {
    ctx: Arc<ServerContext<E>>,
    listener: TcpListener,
}

impl<E: FheEngine + 'static> Server<E> {
    /// # Errors
    /// Returns `SsesError::Io` if the address cannot be bound.
    pub fn bind(addr: impl ToSocketAddrs, ctx: Arc<ServerContext<E>>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { ctx, listener })
    }

    /// # Errors
    /// Returns `SsesError::Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    ///
    /// # Errors
    /// Returns `SsesError::Io` if accepting fails.
    pub fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Server listening");
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            let spawned = thread::Builder::new()
                .name("sses-conn".into())
                .spawn(move || serve_connection(&ctx, stream));
            if let Err(e) = spawned {
                error!(error = %e, "Failed to spawn connection thread");
            }
        }
        Ok(())
    }

    /// Run on a background thread; returns the bound address.
    ///
    /// # Errors
    /// Returns `SsesError::Io` if the thread cannot be spawned.
    pub fn spawn(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let addr = self.local_addr()?;
        let handle = thread::Builder::new()
            .name("sses-accept".into())
            .spawn(move || self.run())?;
        Ok((addr, handle))
    }
}

fn serve_connection<E: FheEngine + 'static>(ctx: &ServerContext<E>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
    info!(%peer, "Connection accepted");

    match run_session(ctx, stream) {
        Ok(()) => info!(%peer, "Connection closed"),
        Err(e) => warn!(%peer, error = %e, "Connection dropped"),
    }
}

fn run_session<E: FheEngine + 'static>(ctx: &ServerContext<E>, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut session = Session::new();

    while let Some(frame) = read_frame(&mut reader)? {
        debug!(code = %frame.code, bytes = frame.body.len(), state = %session.state.current(), "Request");
        dispatch(ctx, &mut session, &frame, &mut writer)?;
    }
    Ok(())
}

fn dispatch<E: FheEngine + 'static, W: Write>(
    ctx: &ServerContext<E>,
    session: &mut Session,
    frame: &Frame,
    writer: &mut W,
) -> Result<()> {
    let code = frame.code;
    match code {
        ControlCode::EncKeys => {
            let outcome = frame
                .decode::<RegisterKeys>()
                .and_then(|request| callbacks::register_keys(ctx, session, request));
            respond(writer, code, outcome)
        }
        ControlCode::UpDownloadQuery => {
            let outcome = frame
                .decode::<SubmitQuery>()
                .and_then(|request| callbacks::submit_query(ctx, session, request));
            respond(writer, code, outcome)
        }
        ControlCode::UpDownloadChunkResult => {
            let outcome = frame
                .decode::<ChunkResultRequest>()
                .and_then(|request| callbacks::chunk_result(ctx, session, request));
            respond(writer, code, outcome)
        }
        ControlCode::UpDownloadResult => {
            let outcome = frame
                .decode::<ResultRequest>()
                .and_then(|request| callbacks::disclose(ctx, session, request));
            respond(writer, code, outcome)
        }
        ControlCode::CancelQuery => {
            let outcome = frame
                .decode::<CancelRequest>()
                .and_then(|request| callbacks::cancel(ctx, session, request));
            respond(writer, code, outcome)
        }
        ControlCode::QueryId | ControlCode::ChunkResult | ControlCode::Result => {
            let outcome: Result<()> = Err(SsesError::ProtocolViolation(format!(
                "{code} is a reply code"
            )));
            respond(writer, code, outcome)
        }
    }
}

fn respond<W: Write, T: Serialize>(writer: &mut W, code: ControlCode, outcome: Result<T>) -> Result<()> {
    let reply: Reply<T> = outcome.map_err(|e| {
        match &e {
            SsesError::ProtocolViolation(_) | SsesError::CapacityExceeded(_) => {
                warn!(%code, error = %e, "Request rejected");
            }
            _ => error!(%code, error = %e, "Request failed"),
        }
        Rejection::from(&e)
    });
    write_frame(writer, code.reply_code(), &reply)
}
