use crate::{
    registry::{MethodInfo, Service},
    types::IntoParams,
    Endpoint, EndpointConfig, Error, RegisterError,
};
use rmpv::Value;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};

/// The serving side of an accepted connection.
///
/// Unlike [`Client`](super::client::Client), nothing is read until
/// [`serve`](Self::serve) runs, so handlers can be registered first:
///
/// ```ignore
/// let (sock, _) = listener.accept().await?;
/// let conn = ServerConn::new(sock, EndpointConfig::default());
/// conn.register(Arith)?;
/// tokio::spawn(async move { conn.serve().await });
/// ```
///
/// The peer can be called back through the same connection while it is served.
#[derive(Debug, Clone)]
pub struct ServerConn {
    endpoint: Endpoint,
}

impl ServerConn {
    pub fn new<T>(io: T, config: EndpointConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            endpoint: Endpoint::new(io, config),
        }
    }

    /// Run the dispatch loop until the connection ends or is closed.
    pub async fn serve(&self) -> Result<(), Error> {
        self.endpoint.serve().await
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

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
