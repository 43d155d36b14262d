//! Services and the methods they expose to the peer.
//!
//! A receiver becomes a service by implementing [`Service`] and declaring its
//! methods on a [`Methods`] table. The table only accepts functions with the
//! RPC shape, so the compiler checks the calling convention:
//!
//! - call methods: `fn(&self, args: A, reply: &mut R) -> Result<(), E>`
//! - notify methods: `fn(&self, args: A) -> Result<(), E>`
//!
//! At registration the remaining checks are on names. All services share one
//! flat method namespace, since requests on the wire carry a bare method name.

use crate::{
    types::{decode_args, encode, TypeMismatch},
    RegisterError,
};
use parking_lot::RwLock;
use rmpv::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    any,
    collections::{BTreeMap, BTreeSet},
    fmt,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A receiver whose methods can be invoked by the peer.
///
/// ```ignore
/// struct Arith;
///
/// impl Arith {
///     fn add(&self, (a, b): (i64, i64), reply: &mut i64) -> Result<(), String> {
///         *reply = a + b;
///         Ok(())
///     }
/// }
///
/// impl Service for Arith {
///     fn methods(methods: &mut Methods<Self>) {
///         methods.call("Add", Arith::add);
///     }
/// }
/// ```
pub trait Service: Sized + Send + Sync + 'static {
    fn methods(methods: &mut Methods<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// Answered with a response envelope.
    Call,
    /// Fire-and-forget; never answered.
    Notify,
}

/// Snapshot of a registered method, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub service: String,
    pub kind: MethodKind,
    pub arg_type: String,
    pub reply_type: Option<String>,
    pub calls: u64,
}

/// Declared methods of one receiver, collected by [`Service::methods`].
pub struct Methods<S> {
    receiver: Arc<S>,
    declared: Vec<Declared>,
}

struct Declared {
    name: String,
    kind: MethodKind,
    arg_type: &'static str,
    reply_type: Option<&'static str>,
    handler: Arc<dyn ErasedMethod>,
}

impl<S> Methods<S>
where
    S: Send + Sync + 'static,
{
    fn new(receiver: Arc<S>) -> Self {
        Self {
            receiver,
            declared: Vec::new(),
        }
    }

    /// Declare a method that answers with a reply.
    ///
    /// `reply` starts out as `R::default()`; its final value is sent back when
    /// the method returns `Ok(())`. An `Err` is sent back as its `Display` text.
    pub fn call<A, R, E, F>(&mut self, name: &str, method: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Default + 'static,
        E: fmt::Display + 'static,
        F: Fn(&S, A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        let handler = TypedCall {
            receiver: Arc::clone(&self.receiver),
            method,
            _types: PhantomData,
        };
        self.declared.push(Declared {
            name: name.to_owned(),
            kind: MethodKind::Call,
            arg_type: any::type_name::<A>(),
            reply_type: Some(any::type_name::<R>()),
            handler: Arc::new(handler),
        });
        self
    }

    /// Declare a method invoked by notifications. Its outcome is never sent back.
    pub fn notify<A, E, F>(&mut self, name: &str, method: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        E: fmt::Display + 'static,
        F: Fn(&S, A) -> Result<(), E> + Send + Sync + 'static,
    {
        let handler = TypedNotify {
            receiver: Arc::clone(&self.receiver),
            method,
            _types: PhantomData,
        };
        self.declared.push(Declared {
            name: name.to_owned(),
            kind: MethodKind::Notify,
            arg_type: any::type_name::<A>(),
            reply_type: None,
            handler: Arc::new(handler),
        });
        self
    }
}

/// Why an inbound request could not be answered with a result.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("can't find method {0}")]
    NoSuchMethod(String),

    #[error("invalid params: {0}")]
    Args(TypeMismatch),

    #[error("(BUG in RPC method) encoding reply: {0}")]
    Reply(String),

    #[error("{0}")]
    Failed(String),

    #[error("(BUG in RPC method) {0} panicked")]
    Panicked(String),
}

/// A type-erased method, ready to be handed raw params.
trait ErasedMethod: Send + Sync {
    fn invoke(&self, params: Vec<Value>) -> Result<Value, DispatchError>;
}

struct TypedCall<S, A, R, E, F> {
    receiver: Arc<S>,
    method: F,
    _types: PhantomData<fn(A) -> (R, E)>,
}

impl<S, A, R, E, F> ErasedMethod for TypedCall<S, A, R, E, F>
where
    S: Send + Sync,
    A: DeserializeOwned,
    R: Serialize + Default,
    E: fmt::Display,
    F: Fn(&S, A, &mut R) -> Result<(), E> + Send + Sync,
{
    fn invoke(&self, params: Vec<Value>) -> Result<Value, DispatchError> {
        let args = decode_args::<A>(params).map_err(DispatchError::Args)?;
        let mut reply = R::default();
        (self.method)(&self.receiver, args, &mut reply)
            .map_err(|err| DispatchError::Failed(err.to_string()))?;
        encode(reply).map_err(|err| DispatchError::Reply(err.to_string()))
    }
}

struct TypedNotify<S, A, E, F> {
    receiver: Arc<S>,
    method: F,
    _types: PhantomData<fn(A) -> E>,
}

impl<S, A, E, F> ErasedMethod for TypedNotify<S, A, E, F>
where
    S: Send + Sync,
    A: DeserializeOwned,
    E: fmt::Display,
    F: Fn(&S, A) -> Result<(), E> + Send + Sync,
{
    fn invoke(&self, params: Vec<Value>) -> Result<Value, DispatchError> {
        let args = decode_args::<A>(params).map_err(DispatchError::Args)?;
        (self.method)(&self.receiver, args)
            .map_err(|err| DispatchError::Failed(err.to_string()))?;
        Ok(Value::Nil)
    }
}

struct RegisteredMethod {
    service: String,
    arg_type: &'static str,
    reply_type: Option<&'static str>,
    calls: AtomicU64,
    handler: Arc<dyn ErasedMethod>,
}

type Namespace = BTreeMap<String, Arc<RegisteredMethod>>;

#[derive(Default)]
struct RegistryState {
    services: BTreeSet<String>,
    call: Namespace,
    notify: Namespace,
}

impl RegistryState {
    fn namespace(&self, kind: MethodKind) -> &Namespace {
        match kind {
            MethodKind::Call => &self.call,
            MethodKind::Notify => &self.notify,
        }
    }

    fn namespace_mut(&mut self, kind: MethodKind) -> &mut Namespace {
        match kind {
            MethodKind::Call => &mut self.call,
            MethodKind::Notify => &mut self.notify,
        }
    }
}

/// Registered services, shared between registration and the dispatch loop.
#[derive(Default)]
pub(crate) struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `receiver` under its own type name, or under `name` if given.
    pub(crate) fn register<S: Service>(
        &self,
        receiver: S,
        name: Option<&str>,
    ) -> Result<(), RegisterError> {
        let type_name = any::type_name::<S>();
        let service = match name {
            Some(name) => name.to_owned(),
            None => short_type_name(type_name).to_owned(),
        };
        if service.is_empty() {
            return Err(RegisterError::NoServiceName { type_name });
        }
        if name.is_none() && !is_exported(&service) {
            warn!(service = %service, type_name, "service type is not exported");
            return Err(RegisterError::Unexported(service));
        }

        let mut methods = Methods::new(Arc::new(receiver));
        S::methods(&mut methods);
        self.install(service, methods.declared, true)
    }

    /// Register a single free-standing call method under `name`.
    pub(crate) fn register_method<A, R, E, F>(
        &self,
        name: &str,
        method: F,
    ) -> Result<(), RegisterError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Default + 'static,
        E: fmt::Display + 'static,
        F: Fn(A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(RegisterError::NoServiceName {
                type_name: any::type_name::<F>(),
            });
        }
        let mut methods = Methods::new(Arc::new(()));
        methods.call(name, move |_: &(), args: A, reply: &mut R| method(args, reply));
        self.install(name.to_owned(), methods.declared, false)
    }

    /// Register a single free-standing notify method under `name`.
    pub(crate) fn register_notify<A, E, F>(&self, name: &str, method: F) -> Result<(), RegisterError>
    where
        A: DeserializeOwned + 'static,
        E: fmt::Display + 'static,
        F: Fn(A) -> Result<(), E> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(RegisterError::NoServiceName {
                type_name: any::type_name::<F>(),
            });
        }
        let mut methods = Methods::new(Arc::new(()));
        methods.notify(name, move |_: &(), args: A| method(args));
        self.install(name.to_owned(), methods.declared, false)
    }

    /// Validate and install a service. Nothing is installed on failure.
    fn install(
        &self,
        service: String,
        declared: Vec<Declared>,
        require_exported: bool,
    ) -> Result<(), RegisterError> {
        let mut state = self.state.write();
        if state.services.contains(&service) {
            return Err(RegisterError::DuplicateService(service));
        }

        let (methods, unexported) = suitable_methods(&service, declared, require_exported);
        if methods.is_empty() {
            let hint =
                (unexported > 0).then_some("method names must start with an uppercase letter");
            warn!(service = %service, "service has no exported methods of suitable type");
            return Err(RegisterError::NoSuitableMethods { service, hint });
        }

        for method in &methods {
            if let Some(existing) = state.namespace(method.kind).get(&method.name) {
                return Err(RegisterError::DuplicateMethod {
                    method: method.name.clone(),
                    service,
                    existing: existing.service.clone(),
                });
            }
        }

        let count = methods.len();
        for method in methods {
            let registered = RegisteredMethod {
                service: service.clone(),
                arg_type: method.arg_type,
                reply_type: method.reply_type,
                calls: AtomicU64::new(0),
                handler: method.handler,
            };
            state
                .namespace_mut(method.kind)
                .insert(method.name, Arc::new(registered));
        }
        info!(service = %service, methods = count, "registered service");
        state.services.insert(service);
        Ok(())
    }

    /// Invoke a call method with raw params.
    pub(crate) fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, DispatchError> {
        self.invoke(MethodKind::Call, method, params)
    }

    /// Invoke a notify method with raw params.
    pub(crate) fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), DispatchError> {
        self.invoke(MethodKind::Notify, method, params).map(drop)
    }

    fn invoke(
        &self,
        kind: MethodKind,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, DispatchError> {
        // Clone out so the lock isn't held while user code runs.
        let registered = self
            .state
            .read()
            .namespace(kind)
            .get(method)
            .cloned()
            .ok_or_else(|| DispatchError::NoSuchMethod(method.to_owned()))?;
        registered.calls.fetch_add(1, Ordering::Relaxed);
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| registered.handler.invoke(params)));
        invoked.unwrap_or_else(|_| {
            tracing::error!(method, service = %registered.service, "method panicked");
            Err(DispatchError::Panicked(method.to_owned()))
        })
    }

    pub(crate) fn methods(&self) -> Vec<MethodInfo> {
        let state = self.state.read();
        let call = state.call.iter().map(|entry| (MethodKind::Call, entry));
        let notify = state.notify.iter().map(|entry| (MethodKind::Notify, entry));
        call.chain(notify)
            .map(|(kind, (name, method))| MethodInfo {
                name: name.clone(),
                service: method.service.clone(),
                kind,
                arg_type: method.arg_type.to_owned(),
                reply_type: method.reply_type.map(str::to_owned),
                calls: method.calls.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Is this an exported (upper case) name?
fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// `my_crate::arith::Arith<u8>` -> `Arith`
fn short_type_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Keep the declared methods that can be served, logging the ones skipped.
/// Also returns how many were skipped for being unexported.
fn suitable_methods(
    service: &str,
    declared: Vec<Declared>,
    require_exported: bool,
) -> (Vec<Declared>, usize) {
    let mut seen = BTreeSet::new();
    let mut unexported = 0;
    let mut methods = Vec::with_capacity(declared.len());
    for method in declared {
        if method.name.is_empty() {
            warn!(service, "skipping method with empty name");
            continue;
        }
        if require_exported && !is_exported(&method.name) {
            warn!(service, method = %method.name, "skipping method: name not exported");
            unexported += 1;
            continue;
        }
        if !seen.insert((method.kind, method.name.clone())) {
            warn!(service, method = %method.name, "skipping method: declared twice");
            continue;
        }
        debug!(service, method = %method.name, kind = ?method.kind, "method is suitable");
        methods.push(method);
    }
    (methods, unexported)
}
