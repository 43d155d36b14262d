use crate::Error;
use rmpv::{ext, Value};
use serde::{de::DeserializeOwned, Serialize};
use std::{any, fmt};

/// Things that can be sent as the `params` array of a request or notification.
///
/// Implemented for `()`, `Vec<Value>` and tuples of serializable values:
///
/// ```ignore
/// client.call::<_, i64>("Add", (2, 3)).await?;
/// client.notify("Log", ("started",)).await?;
/// ```
pub trait IntoParams {
    fn into_params(self) -> Result<Vec<Value>, Error>;
}

impl IntoParams for () {
    fn into_params(self) -> Result<Vec<Value>, Error> {
        Ok(Vec::new())
    }
}

impl IntoParams for Vec<Value> {
    fn into_params(self) -> Result<Vec<Value>, Error> {
        Ok(self)
    }
}

macro_rules! impl_into_params {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> IntoParams for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_params(self) -> Result<Vec<Value>, Error> {
                let ($($name,)+) = self;
                Ok(vec![$(encode($name).map_err(|err| Error::Encode(err.to_string()))?),+])
            }
        }
    };
}

impl_into_params!(A);
impl_into_params!(A, B);
impl_into_params!(A, B, C);
impl_into_params!(A, B, C, D);
impl_into_params!(A, B, C, D, E);
impl_into_params!(A, B, C, D, E, F);

/// A value that could not be converted to the Rust type a method expects.
#[derive(Debug, Clone)]
pub struct TypeMismatch {
    value: Value,
    expected_type: &'static str,
    reason: String,
}

impl TypeMismatch {
    fn new(value: Value, expected_type: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            value,
            expected_type,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Type error: {} :/: {} ({})",
            self.value, self.expected_type, self.reason
        )
    }
}

impl std::error::Error for TypeMismatch {}

pub(crate) fn encode<T: Serialize>(value: T) -> Result<Value, ext::Error> {
    ext::to_value(value)
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TypeMismatch> {
    ext::from_value(value.clone())
        .map_err(|err| TypeMismatch::new(value, any::type_name::<T>(), err))
}

/// Decode a method's argument from a `params` array.
///
/// The whole array is tried first, so tuple and sequence arguments line up
/// with positional params. A single param that does not fit that way is
/// decoded on its own, which lets `Echo(String)` accept `["hi"]`. An empty
/// array falls back to nil, so `()` arguments accept `[]`.
pub(crate) fn decode_args<A: DeserializeOwned>(params: Vec<Value>) -> Result<A, TypeMismatch> {
    let whole = Value::Array(params);
    match ext::from_value::<A>(whole.clone()) {
        Ok(args) => Ok(args),
        Err(err) => match whole {
            Value::Array(mut params) if params.len() == 1 => decode(params.remove(0)),
            Value::Array(params) if params.is_empty() => decode(Value::Nil),
            whole => Err(TypeMismatch::new(whole, any::type_name::<A>(), err)),
        },
    }
}
