//! Method dispatch.
//!
//! The transport hands every completed request or notification to a
//! [`Dispatcher`] as `(method, message id, argument cursor)` and gets back a
//! future of the result. Dispatch runs on its own task, so a slow method
//! never holds up parsing of the next frame.
//!
//! # Example
//!
//! ```
//! use msgrpc_common::codec::Arguments;
//! use msgrpc_common::RpcError;
//! use msgrpc_server::MethodRegistry;
//! use rmpv::Value;
//!
//! let registry = MethodRegistry::new()
//!     .with_method("echo", |mut args: Arguments| async move { args.next_value() })
//!     .with_method("add", |mut args: Arguments| async move {
//!         let a: i64 = args.next()?;
//!         let b: i64 = args.next()?;
//!         a.checked_add(b)
//!             .map(Value::from)
//!             .ok_or_else(|| RpcError::call_error("overflow"))
//!     });
//! assert!(registry.contains("add"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use msgrpc_common::codec::Arguments;
use msgrpc_common::{MessageId, RpcError};
use rmpv::Value;
use serde::Serialize;

/// Future produced by a dispatch.
pub type DispatchFuture = BoxFuture<'static, Result<Value, RpcError>>;

/// Maps a method name to executable code.
pub trait Dispatcher: Send + Sync + 'static {
    /// Starts executing `method`.
    ///
    /// `message_id` is `None` for notifications, whose result is discarded.
    /// Must return promptly; the work belongs in the returned future.
    fn dispatch(&self, method: &str, message_id: Option<MessageId>, args: Arguments) -> DispatchFuture;
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn dispatch(&self, method: &str, message_id: Option<MessageId>, args: Arguments) -> DispatchFuture {
        (**self).dispatch(method, message_id, args)
    }
}

/// One registered method.
pub trait RpcMethod: Send + Sync + 'static {
    fn call(&self, args: Arguments) -> DispatchFuture;
}

impl<F, Fut> RpcMethod for F
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    fn call(&self, args: Arguments) -> DispatchFuture {
        self(args).boxed()
    }
}

/// Encodes a serializable result as a wire value.
///
/// # Errors
///
/// `UnexpectedError` if the value cannot be represented in MessagePack.
pub fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    rmpv::ext::to_value(value)
        .map_err(|e| RpcError::unexpected(format!("result cannot be encoded: {}", e)))
}

/// Name to method map implementing [`Dispatcher`].
///
/// Unknown names resolve to `NoMethodError`.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn RpcMethod>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, method: impl RpcMethod) -> &mut Self {
        let name = name.into();
        if self.methods.insert(name.clone(), Arc::new(method)).is_some() {
            tracing::debug!(method = %name, "replaced registered method");
        }
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, method: impl RpcMethod) -> Self {
        self.register(name, method);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("MethodRegistry").field("methods", &names).finish()
    }
}

impl Dispatcher for MethodRegistry {
    fn dispatch(&self, method: &str, _message_id: Option<MessageId>, args: Arguments) -> DispatchFuture {
        match self.methods.get(method) {
            Some(handler) => handler.call(args),
            None => future::ready(Err(RpcError::no_method(method))).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgrpc_common::RpcErrorKind;

    fn registry() -> MethodRegistry {
        MethodRegistry::new()
            .with_method("echo", |mut args: Arguments| async move { args.next_value() })
            .with_method("fail", |_args: Arguments| async move {
                Err::<Value, _>(RpcError::call_error("nope"))
            })
    }

    #[tokio::test]
    async fn test_dispatch_registered_method() {
        let args = Arguments::from_values(&[Value::from("hi")]).unwrap();
        let result = registry().dispatch("echo", Some(1), args).await;
        assert_eq!(result.unwrap(), Value::from("hi"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = registry()
            .dispatch("missing", Some(1), Arguments::empty())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RpcErrorKind::NoMethod);
        assert!(err.message().contains("missing"));
    }

    #[tokio::test]
    async fn test_method_error_is_passed_through() {
        let err = registry()
            .dispatch("fail", None, Arguments::empty())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RpcErrorKind::Call);
    }

    #[tokio::test]
    async fn test_arc_dispatcher() {
        let shared: Arc<dyn Dispatcher> = Arc::new(registry());
        let args = Arguments::from_values(&[Value::from(3)]).unwrap();
        assert_eq!(shared.dispatch("echo", None, args).await.unwrap(), Value::from(3));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = registry();
        registry.register("echo", |_args: Arguments| async move { Ok(Value::Nil) });
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_to_value() {
        let value = to_value(vec![1u32, 2, 3]).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![Value::from(1u32), Value::from(2u32), Value::from(3u32)])
        );
        assert_eq!(to_value("hi").unwrap(), Value::from("hi"));
    }
}
