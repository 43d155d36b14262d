//! The per-connection protocol engine.
//!
//! An [`Endpoint`] owns both halves of one connection. Any number of tasks may
//! issue calls and notifications through it while a single dispatch loop
//! ([`Endpoint::serve`]) reads inbound envelopes and routes them:
//!
//! ```text
//!                  read half
//!                      │
//!                dispatch loop
//!                      │
//!      ┌───────────────┼────────────────┐
//!      │               │                │
//!   response        request        notification
//!      │               │                │
//!  pending table   call method     notify method
//!  wakes caller   writes response   (no reply)
//! ```
//!
//! Inbound methods run one at a time, inside the loop, in arrival order.

use crate::{
    codec::MsgpackCodec,
    net::Message,
    pending::PendingCalls,
    registry::{MethodInfo, Registry, Service},
    types::{decode, IntoParams},
    EndpointConfig, Error, RegisterError,
};
use futures::{SinkExt, StreamExt};
use rmpv::Value;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type FrameReader = FramedRead<BoxedReader, MsgpackCodec>;
type FrameWriter = FramedWrite<BoxedWriter, MsgpackCodec>;

/// One side of a msgpack-rpc connection.
///
/// Cheap to clone; clones share the same connection and state.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

struct Shared {
    config: EndpointConfig,
    writer: tokio::sync::Mutex<FrameWriter>,
    /// Taken by the dispatch loop, so it can only ever run once.
    reader: parking_lot::Mutex<Option<FrameReader>>,
    next_msgid: AtomicU32,
    pending: PendingCalls,
    registry: Registry,
    /// Why the endpoint stopped. Set once; every later send fails with it.
    terminal: OnceLock<Error>,
    close_requested: AtomicBool,
    /// Cancelled once a terminal error is recorded. Aborts blocked writes.
    shutdown: CancellationToken,
    write_shut: AtomicBool,
}

impl Endpoint {
    /// Bind an endpoint to an open connection. Nothing is read until
    /// [`serve`](Self::serve) runs.
    pub fn new<T>(io: T, config: EndpointConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        let codec = MsgpackCodec::new(config.max_message_size);
        let reader = FramedRead::with_capacity(
            Box::new(read) as BoxedReader,
            codec.clone(),
            config.read_buffer_capacity,
        );
        let writer = FramedWrite::new(Box::new(write) as BoxedWriter, codec);

        Self {
            shared: Arc::new(Shared {
                config,
                writer: tokio::sync::Mutex::new(writer),
                reader: parking_lot::Mutex::new(Some(reader)),
                next_msgid: AtomicU32::new(1),
                pending: PendingCalls::new(),
                registry: Registry::new(),
                terminal: OnceLock::new(),
                close_requested: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                write_shut: AtomicBool::new(false),
            }),
        }
    }

    /// Call `method` on the peer and wait for its result.
    ///
    /// Use `R = rmpv::Value` to get the result undecoded. A non-nil error in the
    /// response comes back as [`Error::Remote`].
    ///
    /// There is no deadline; see [`call_timeout`](Self::call_timeout).
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, Error>
    where
        P: IntoParams,
        R: DeserializeOwned,
    {
        let result = self.call_value(method, params).await?;
        decode(result).map_err(|err| Error::Decode(err.to_string()))
    }

    /// Like [`call`](Self::call) but gives up after `timeout`.
    ///
    /// A response that arrives after the deadline is discarded.
    pub async fn call_timeout<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        P: IntoParams,
        R: DeserializeOwned,
    {
        tokio::time::timeout(timeout, self.call(method, params))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Call `method` on the peer and return the raw result value.
    pub async fn call_value<P: IntoParams>(&self, method: &str, params: P) -> Result<Value, Error> {
        self.check_open()?;
        let params = params.into_params()?;

        let msgid = self.shared.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (mut guard, rx) = self.shared.pending.register(msgid)?;
        // The endpoint may have stopped between the check above and the
        // registration; fail_all would have missed this entry.
        self.check_open()?;

        trace!(msgid, method, "sending request");
        let request = Message::Request {
            msgid,
            method: method.to_owned(),
            params,
        };
        self.send(request).await?;

        let outcome = rx.await;
        guard.disarm();
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(self.stopped()),
        }
    }

    /// Send a notification. Returns once it is written; the peer never replies.
    pub async fn notify<P: IntoParams>(&self, method: &str, params: P) -> Result<(), Error> {
        self.check_open()?;
        let params = params.into_params()?;
        trace!(method, "sending notification");
        self.send(Message::Notification {
            method: method.to_owned(),
            params,
        })
        .await
    }

    /// Expose `receiver`'s methods to the peer under its type name.
    pub fn register<S: Service>(&self, receiver: S) -> Result<(), RegisterError> {
        self.shared.registry.register(receiver, None)
    }

    /// Expose `receiver`'s methods to the peer under an explicit service name.
    pub fn register_name<S: Service>(&self, name: &str, receiver: S) -> Result<(), RegisterError> {
        self.shared.registry.register(receiver, Some(name))
    }

    /// Expose a single function as the call method `name`.
    pub fn register_method<A, R, E, F>(&self, name: &str, method: F) -> Result<(), RegisterError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Default + 'static,
        E: fmt::Display + 'static,
        F: Fn(A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        self.shared.registry.register_method(name, method)
    }

    /// Expose a single function as the notify method `name`.
    pub fn register_notify<A, E, F>(&self, name: &str, method: F) -> Result<(), RegisterError>
    where
        A: DeserializeOwned + 'static,
        E: fmt::Display + 'static,
        F: Fn(A) -> Result<(), E> + Send + Sync + 'static,
    {
        self.shared.registry.register_notify(name, method)
    }

    /// The methods currently exposed to the peer.
    pub fn methods(&self) -> Vec<MethodInfo> {
        self.shared.registry.methods()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.terminal.get().is_some()
    }

    /// Why the endpoint stopped, if it has.
    pub fn terminal_error(&self) -> Option<Error> {
        self.shared.terminal.get().cloned()
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Close the endpoint.
    ///
    /// Every waiting call fails with [`Error::Closed`], including one stuck
    /// writing to a peer that stopped reading. The dispatch loop stops and the
    /// write half of the connection is shut down. Later calls are no-ops.
    pub async fn close(&self) {
        if self.shared.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let terminal = self.stop(Error::Closed);
        debug!(name = %self.shared.config.name, error = %terminal, "closing endpoint");
        self.shutdown_write().await;
    }

    /// Run the dispatch loop until the connection ends or the endpoint is closed.
    ///
    /// Returns `Ok(())` when the endpoint was closed locally or the peer hung up
    /// cleanly, and the read error otherwise. Fails with
    /// [`Error::AlreadyServing`] if the loop has already been started.
    pub async fn serve(&self) -> Result<(), Error> {
        let reader = self
            .shared
            .reader
            .lock()
            .take()
            .ok_or(Error::AlreadyServing)?;
        let span = info_span!("endpoint", name = %self.shared.config.name);
        self.dispatch(reader).instrument(span).await
    }

    async fn dispatch(&self, mut reader: FrameReader) -> Result<(), Error> {
        info!("dispatch loop started");
        let reason = loop {
            let next = tokio::select! {
                _ = self.shared.shutdown.cancelled() => break Error::Closed,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(value)) => self.route(value).await,
                Some(Err(err)) => {
                    warn!(error = %err, "reading from connection failed");
                    break Error::from(err);
                }
                None => {
                    debug!("peer closed the connection");
                    break Error::ConnectionClosed;
                }
            }
        };

        let terminal = self.stop(reason);
        info!(reason = %terminal, "dispatch loop stopped");
        self.shutdown_write().await;
        match terminal {
            Error::Closed | Error::ConnectionClosed => Ok(()),
            err => Err(err),
        }
    }

    async fn route(&self, value: Value) {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "discarding malformed message");
                return;
            }
        };

        match message {
            Message::Response {
                msgid,
                error,
                result,
            } => {
                let outcome = if error.is_nil() {
                    Ok(result)
                } else {
                    Err(Error::Remote(error))
                };
                if !self.shared.pending.complete(msgid, outcome) {
                    debug!(msgid, "discarding response with no pending call");
                }
            }

            Message::Request {
                msgid,
                method,
                params,
            } => {
                let response = match self.shared.registry.call(&method, params) {
                    Ok(result) => Message::Response {
                        msgid,
                        error: Value::Nil,
                        result,
                    },
                    Err(err) => {
                        debug!(msgid, method = %method, error = %err, "request failed");
                        Message::Response {
                            msgid,
                            error: Value::from(err.to_string()),
                            result: Value::Nil,
                        }
                    }
                };
                if let Err(err) = self.send(response).await {
                    warn!(msgid, method = %method, error = %err, "failed to write response");
                }
            }

            Message::Notification { method, params } => {
                if let Err(err) = self.shared.registry.notify(&method, params) {
                    warn!(method = %method, error = %err, "notification dropped");
                }
            }
        }
    }

    /// Write one envelope. Writers queue on the lock, so envelopes never interleave.
    ///
    /// Gives up with the terminal error as soon as the endpoint stops, whether
    /// still queued or in the middle of the write.
    async fn send(&self, message: Message) -> Result<(), Error> {
        let shutdown = &self.shared.shutdown;
        let mut writer = tokio::select! {
            _ = shutdown.cancelled() => return Err(self.stopped()),
            writer = self.shared.writer.lock() => writer,
        };
        self.check_open()?;
        tokio::select! {
            _ = shutdown.cancelled() => Err(self.stopped()),
            sent = writer.send(message.into_value()) => sent.map_err(Error::from),
        }
    }

    /// Shut down the write half, once. Anything still buffered from an aborted
    /// write is dropped rather than flushed.
    async fn shutdown_write(&self) {
        let mut writer = self.shared.writer.lock().await;
        if self.shared.write_shut.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = writer.get_mut().shutdown().await {
            debug!(error = %err, "shutting down write half failed");
        }
    }

    fn stopped(&self) -> Error {
        self.terminal_error().unwrap_or(Error::Closed)
    }

    fn check_open(&self) -> Result<(), Error> {
        match self.shared.terminal.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record why the endpoint stopped (first reason wins), fail every
    /// waiting call with it and abort blocked writes. Returns the recorded reason.
    fn stop(&self, reason: Error) -> Error {
        let terminal = self.shared.terminal.get_or_init(|| reason).clone();
        self.shared.pending.fail_all(&terminal);
        self.shared.shutdown.cancel();
        terminal
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.shared.config.name)
            .field("pending", &self.shared.pending.len())
            .field("terminal", &self.shared.terminal.get())
            .finish()
    }
}
