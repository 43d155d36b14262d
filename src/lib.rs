//! # mprpc
//!
//! Bidirectional [msgpack-rpc] over a single byte stream.
//!
//! Both sides of a connection can call methods on each other, send
//! notifications, and expose local methods, with any number of calls in
//! flight at once. Responses are matched to their calls by msgid, so they may
//! arrive in any order.
//!
//! ```ignore
//! use mprpc::{Client, EndpointConfig, Methods, Service};
//!
//! struct Arith;
//!
//! impl Arith {
//!     fn add(&self, (a, b): (i64, i64), reply: &mut i64) -> Result<(), String> {
//!         *reply = a + b;
//!         Ok(())
//!     }
//! }
//!
//! impl Service for Arith {
//!     fn methods(methods: &mut Methods<Self>) {
//!         methods.call("Add", Arith::add);
//!     }
//! }
//!
//! let client = Client::connect("127.0.0.1:18800").await?;
//! client.register(Arith)?;
//! let sum: i64 = client.call("Add", (2, 3)).await?;
//! ```
//!
//! [msgpack-rpc]: https://github.com/msgpack-rpc/msgpack-rpc/blob/master/spec.md

pub mod codec;
mod config;
mod endpoint;
mod error;
pub mod net;
mod pending;
mod registry;
pub mod types;

pub use config::EndpointConfig;
pub use endpoint::Endpoint;
pub use error::{Error, RegisterError};
pub use net::{client::Client, server::ServerConn, Message};
pub use registry::{DispatchError, MethodInfo, MethodKind, Methods, Service};
pub use rmpv::Value;
pub use types::{IntoParams, TypeMismatch};
