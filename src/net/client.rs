use crate::{
    registry::{MethodInfo, Service},
    types::IntoParams,
    Endpoint, EndpointConfig, Error, RegisterError,
};
use rmpv::Value;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tracing::debug;

/// The calling side of a connection.
///
/// The dispatch loop starts as soon as the client is built, so the peer may
/// also call methods registered on the client. A client dropped without
/// [`close`](Self::close) keeps its dispatch loop alive until the peer hangs up.
pub struct Client {
    endpoint: Endpoint,
    dispatch: JoinHandle<Result<(), Error>>,
}

impl Client {
    /// Wrap an open connection and start dispatching. Must be called within a
    /// tokio runtime.
    pub fn new<T>(io: T, config: EndpointConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let endpoint = Endpoint::new(io, config);
        let dispatch = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });
        Self { endpoint, dispatch }
    }

    /// Connect to a msgpack-rpc peer over TCP.
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let sock = TcpStream::connect(addr).await?;
        sock.set_nodelay(true)?;
        debug!(peer = ?sock.peer_addr().ok(), "connected");
        let config = EndpointConfig::builder().name("client".to_string()).build();
        Ok(Self::new(sock, config))
    }

    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, Error>
    where
        P: IntoParams,
        R: DeserializeOwned,
    {
        self.endpoint.call(method, params).await
    }

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
        self.endpoint.call_timeout(method, params, timeout).await
    }

    pub async fn call_value<P: IntoParams>(&self, method: &str, params: P) -> Result<Value, Error> {
        self.endpoint.call_value(method, params).await
    }

    pub async fn notify<P: IntoParams>(&self, method: &str, params: P) -> Result<(), Error> {
        self.endpoint.notify(method, params).await
    }

    pub fn register<S: Service>(&self, receiver: S) -> Result<(), RegisterError> {
        self.endpoint.register(receiver)
    }

    pub fn register_name<S: Service>(&self, name: &str, receiver: S) -> Result<(), RegisterError> {
        self.endpoint.register_name(name, receiver)
    }

    pub fn register_method<A, R, E, F>(&self, name: &str, method: F) -> Result<(), RegisterError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Default + 'static,
        E: fmt::Display + 'static,
        F: Fn(A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        self.endpoint.register_method(name, method)
    }

    pub fn register_notify<A, E, F>(&self, name: &str, method: F) -> Result<(), RegisterError>
    where
        A: DeserializeOwned + 'static,
        E: fmt::Display + 'static,
        F: Fn(A) -> Result<(), E> + Send + Sync + 'static,
    {
        self.endpoint.register_notify(name, method)
    }

    pub fn methods(&self) -> Vec<MethodInfo> {
        self.endpoint.methods()
    }

    pub async fn close(&self) {
        self.endpoint.close().await
    }

    /// Close the connection and wait for the dispatch loop to finish.
    pub async fn shutdown(self) -> Result<(), Error> {
        self.endpoint.close().await;
        let Self { endpoint: _, dispatch } = self;
        match dispatch.await {
            Ok(result) => result,
            Err(err) => Err(Error::from(io::Error::other(err))),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
