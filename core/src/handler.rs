//! Handler dispatch.
//!
//! Applications register a decoder and a handler under a name; listeners in
//! the configuration refer to that name. Handler invocations are bounded by a
//! timeout and panics are converted into `HandlerError::Panicked`, so user code
//! can never stall or crash a worker.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task;
use tokio::time::timeout;

use crate::codec::{DecodedMessage, Decoder, Message};
use crate::errors::{ConfigError, DecodeError, HandlerError};
use crate::record::Record;

/// User processing logic for one decoded record.
#[async_trait]
pub trait Handler<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn handle(&self, message: &Message<T>) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into a [`Handler`].
///
/// The closure runs on tokio's blocking pool, so a closure that blocks the
/// thread is still cut off by the dispatcher's timeout. The blocking thread
/// itself keeps running until the closure returns.
pub struct FnHandler<F>(Arc<F>);

pub fn handler_fn<T, F>(f: F) -> FnHandler<F>
where
    F: Fn(&Message<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler(Arc::new(f))
}

#[async_trait]
impl<T, F> Handler<T> for FnHandler<F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&Message<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, message: &Message<T>) -> Result<(), HandlerError> {
        let f = Arc::clone(&self.0);
        let message = message.clone();
        match task::spawn_blocking(move || f(&message)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(HandlerError::failed(format!("handler task was cancelled: {e}"))),
        }
    }
}

#[async_trait]
impl<T, H> Handler<T> for Arc<H>
where
    T: Send + Sync + 'static,
    H: Handler<T> + ?Sized,
{
    async fn handle(&self, message: &Message<T>) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

/// Runs a handler with a time bound and panic isolation.
pub struct Dispatcher<H> {
    handler: H,
}

impl<H> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub async fn dispatch<T>(&self, message: &Message<T>, limit: Duration) -> Result<(), HandlerError>
    where
        T: Send + Sync + 'static,
        H: Handler<T>,
    {
        let invocation = AssertUnwindSafe(self.handler.handle(message)).catch_unwind();
        match timeout(limit, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
            Err(_) => Err(HandlerError::Timeout(limit)),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result of decoding and handling one record once.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Handled,
    DecodeFailed(DecodeError),
    HandlerFailed(HandlerError),
}

/// Type-erased decode + dispatch for one listener.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    fn payload_type(&self) -> &str;

    async fn process(&self, record: &Record, handler_timeout: Duration) -> ProcessOutcome;
}

pub struct Pipeline<D, H> {
    decoder: D,
    dispatcher: Dispatcher<H>,
}

impl<D, H> Pipeline<D, H>
where
    D: Decoder,
    H: Handler<D::Output>,
{
    pub fn new(decoder: D, handler: H) -> Self {
        Self {
            decoder,
            dispatcher: Dispatcher::new(handler),
        }
    }
}

#[async_trait]
impl<D, H> RecordProcessor for Pipeline<D, H>
where
    D: Decoder,
    H: Handler<D::Output>,
{
    fn payload_type(&self) -> &str {
        self.decoder.payload_type()
    }

    async fn process(&self, record: &Record, handler_timeout: Duration) -> ProcessOutcome {
        match self.decoder.decode(record) {
            DecodedMessage::Decoded(message) => {
                match self.dispatcher.dispatch(&message, handler_timeout).await {
                    Ok(()) => ProcessOutcome::Handled,
                    Err(e) => ProcessOutcome::HandlerFailed(e),
                }
            }
            DecodedMessage::Failed(failure) => ProcessOutcome::DecodeFailed(failure.error),
        }
    }
}

/// Named pipelines, resolved against listener configuration at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    processors: HashMap<String, Arc<dyn RecordProcessor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. A later registration with the same name replaces the earlier one.
    pub fn register<D, H>(&mut self, name: impl Into<String>, decoder: D, handler: H) -> &mut Self
    where
        D: Decoder + 'static,
        H: Handler<D::Output> + 'static,
    {
        self.processors
            .insert(name.into(), Arc::new(Pipeline::new(decoder, handler)));
        self
    }

    /// Look up a handler and check its decoder's type against the trusted list.
    pub fn resolve(
        &self,
        name: &str,
        trusted_types: &[String],
    ) -> Result<Arc<dyn RecordProcessor>, ConfigError> {
        let processor = self
            .processors
            .get(name)
            .ok_or_else(|| ConfigError::UnknownHandler {
                name: name.to_string(),
            })?;

        if !trusted_types.iter().any(|t| t == processor.payload_type()) {
            return Err(ConfigError::UntrustedType {
                type_id: processor.payload_type().to_string(),
            });
        }
        Ok(Arc::clone(processor))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }
}
