//! Local handlers the dispatcher runs relayed invocations against.
use crate::error::HandlerNotFound;
use crate::Error;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A function the dispatcher can invoke with the event of a relayed invocation.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn call(&self, event: Value) -> Result<Value, Error>;
}

/// Maps the logical function name from the invocation to a local handler.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, function_name: &str) -> Result<Arc<dyn LocalHandler>, HandlerNotFound>;
}

/// Wraps an async closure over raw JSON, see [handler_fn].
pub struct HandlerFn<F> {
    f: F,
}

/// Turns `async fn(Value) -> Result<Value, Error>` into a [LocalHandler].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Error>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> LocalHandler for HandlerFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Error>> + Send,
{
    async fn call(&self, event: Value) -> Result<Value, Error> {
        (self.f)(event).await
    }
}

/// Wraps an async function over typed request and response structs, see [typed_fn].
pub struct TypedFn<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

/// Turns `async fn(Req) -> Result<Resp, Error>` into a [LocalHandler]. The event is deserialized into `Req`
/// and the response serialized back to JSON the same way the Lambda runtime does it.
pub fn typed_fn<F, Fut, Req, Resp>(f: F) -> TypedFn<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, Error>> + Send,
    Req: DeserializeOwned + Send,
    Resp: Serialize + Send,
{
    TypedFn {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> LocalHandler for TypedFn<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, Error>> + Send,
    Req: DeserializeOwned + Send,
    Resp: Serialize + Send,
{
    async fn call(&self, event: Value) -> Result<Value, Error> {
        let request: Req = serde_json::from_value(event)?;
        let response = (self.f)(request).await?;
        Ok(serde_json::to_value(response)?)
    }
}

/// Local handlers registered by name. The name must match the function name the gateway sends,
/// i.e. LAMBDA_RELAY_FUNCTION or the Lambda function name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn LocalHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the handler for the function.
    pub fn register(&mut self, function_name: impl Into<String>, handler: impl LocalHandler + 'static) -> &mut Self {
        self.handlers.insert(function_name.into(), Arc::new(handler));
        self
    }

    pub fn with(mut self, function_name: impl Into<String>, handler: impl LocalHandler + 'static) -> Self {
        self.register(function_name, handler);
        self
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, function_name: &str) -> Result<Arc<dyn LocalHandler>, HandlerNotFound> {
        self.handlers
            .get(function_name)
            .cloned()
            .ok_or_else(|| HandlerNotFound(function_name.to_owned()))
    }
}
