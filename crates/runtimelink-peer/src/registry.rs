use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::request::{Null, Request};

/// Error type handlers may return; anything implementing `Error` converts.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

type ErasedFn = dyn Fn(&[u8]) -> HandlerResult<Bytes> + Send + Sync;

/// A type-erased handler: payload bytes in, reply payload bytes out.
#[derive(Clone)]
pub struct Handler {
    invoke: Arc<ErasedFn>,
    replies: bool,
}

impl Handler {
    /// Wrap a raw byte-level handler.
    pub fn raw<F>(replies: bool, f: F) -> Self
    where
        F: Fn(&[u8]) -> HandlerResult<Bytes> + Send + Sync + 'static,
    {
        Self {
            invoke: Arc::new(f),
            replies,
        }
    }

    /// Wrap a typed handler. A `Res` of [`Null`] marks the handler as
    /// fire-and-forget: it runs but no reply is sent.
    pub fn typed<Req, Res, F>(f: F) -> Self
    where
        Req: DeserializeOwned + 'static,
        Res: Serialize + 'static,
        F: Fn(Req) -> HandlerResult<Res> + Send + Sync + 'static,
    {
        let replies = TypeId::of::<Res>() != TypeId::of::<Null>();
        Self::raw(replies, move |payload| {
            let request: Req = serde_json::from_slice(payload)?;
            let response = f(request)?;
            Ok(Bytes::from(serde_json::to_vec(&response)?))
        })
    }

    /// Whether a reply envelope is sent after a successful call.
    pub fn replies(&self) -> bool {
        self.replies
    }

    pub fn call(&self, payload: &[u8]) -> HandlerResult<Bytes> {
        (self.invoke)(payload)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("replies", &self.replies)
            .finish_non_exhaustive()
    }
}

/// Identifier to handler map shared by a connection's dispatch loop and
/// whoever registers handlers.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handler for `identifier`. Returns the handler
    /// it replaced, if any.
    pub fn insert(&self, identifier: impl Into<String>, handler: Handler) -> Option<Handler> {
        let identifier = identifier.into();
        debug!(identifier = %identifier, replies = handler.replies(), "registered handler");
        self.write().insert(identifier, handler)
    }

    pub fn get(&self, identifier: &str) -> Option<Handler> {
        self.read().get(identifier).cloned()
    }

    pub fn remove(&self, identifier: &str) -> Option<Handler> {
        let removed = self.write().remove(identifier);
        if removed.is_some() {
            debug!(identifier, "removed handler");
        }
        removed
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.read().contains_key(identifier)
    }

    /// Registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<_> = self.read().keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Request in, response out.
    pub fn register<Req, Res, F>(&self, identifier: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + 'static,
        Res: Serialize + 'static,
        F: Fn(Req) -> HandlerResult<Res> + Send + Sync + 'static,
    {
        self.insert(identifier, Handler::typed(f));
    }

    /// Request in, nothing sent back.
    pub fn register_void<Req, F>(&self, identifier: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + 'static,
        F: Fn(Req) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.insert(
            identifier,
            Handler::typed(move |request: Req| f(request).map(|()| Null {})),
        );
    }

    /// No request data, response out.
    pub fn register_responder<Res, F>(&self, identifier: impl Into<String>, f: F)
    where
        Res: Serialize + 'static,
        F: Fn() -> HandlerResult<Res> + Send + Sync + 'static,
    {
        self.insert(identifier, Handler::typed(move |_: Null| f()));
    }

    /// No request data, nothing sent back.
    pub fn register_action<F>(&self, identifier: impl Into<String>, f: F)
    where
        F: Fn() -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.insert(
            identifier,
            Handler::typed(move |_: Null| f().map(|()| Null {})),
        );
    }

    /// Register under `R::IDENTIFIER`.
    pub fn register_request<R, F>(&self, f: F)
    where
        R: Request,
        F: Fn(R) -> HandlerResult<R::Response> + Send + Sync + 'static,
    {
        self.insert(R::IDENTIFIER, Handler::typed(f));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Handler>> {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
