use super::{ByteSink, ByteSource, CallError, CallType, Method, Request};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Handles `async` calls: one request, one JSON reply.
#[async_trait]
pub trait AsyncHandler: Send + Sync {
    /// Produce the reply value.
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError>;
}

/// Handles `source` calls by writing into `sink`.
///
/// Returning ends the stream: `Ok` cleanly, `Err` with the error.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Stream values to the caller.
    async fn handle_source(&self, req: &Request, sink: ByteSink) -> Result<(), CallError>;
}

/// Handles `sink` calls by reading from `source`.
#[async_trait]
pub trait SinkHandler: Send + Sync {
    /// Consume values sent by the caller.
    async fn handle_sink(&self, req: &Request, source: ByteSource) -> Result<(), CallError>;
}

/// Handles `duplex` calls.
#[async_trait]
pub trait DuplexHandler: Send + Sync {
    /// Exchange values with the caller.
    async fn handle_duplex(
        &self,
        req: &Request,
        source: ByteSource,
        sink: ByteSink,
    ) -> Result<(), CallError>;
}

/// Decides whether a caller may use a method. Runs before the handler.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Err` refuses the call; the error is sent to the caller.
    async fn authorize(&self, req: &Request) -> Result<(), CallError>;
}

#[derive(Clone)]
pub(crate) enum Handler {
    Async(Arc<dyn AsyncHandler>),
    Source(Arc<dyn SourceHandler>),
    Sink(Arc<dyn SinkHandler>),
    Duplex(Arc<dyn DuplexHandler>),
}

impl Handler {
    pub(crate) fn call_type(&self) -> CallType {
        match self {
            Self::Async(_) => CallType::Async,
            Self::Source(_) => CallType::Source,
            Self::Sink(_) => CallType::Sink,
            Self::Duplex(_) => CallType::Duplex,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) handler: Handler,
    pub(crate) authorizer: Option<Arc<dyn Authorizer>>,
}

/// Method table shared by every session of a server.
///
/// Built once at startup and then only read, so sessions hold it in an
/// `Arc` without locking.
#[derive(Clone, Default)]
pub struct HandlerMux {
    routes: HashMap<Method, Route>,
}

impl HandlerMux {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, method: impl Into<Method>, handler: Handler) {
        self.routes.insert(
            method.into(),
            Route {
                handler,
                authorizer: None,
            },
        );
    }

    /// Register an `async` method. Replaces any earlier registration.
    pub fn register_async(&mut self, method: impl Into<Method>, h: Arc<dyn AsyncHandler>) {
        self.insert(method, Handler::Async(h));
    }

    /// Register a `source` method.
    pub fn register_source(&mut self, method: impl Into<Method>, h: Arc<dyn SourceHandler>) {
        self.insert(method, Handler::Source(h));
    }

    /// Register a `sink` method.
    pub fn register_sink(&mut self, method: impl Into<Method>, h: Arc<dyn SinkHandler>) {
        self.insert(method, Handler::Sink(h));
    }

    /// Register a `duplex` method.
    pub fn register_duplex(&mut self, method: impl Into<Method>, h: Arc<dyn DuplexHandler>) {
        self.insert(method, Handler::Duplex(h));
    }

    /// Guard an already registered method. Returns false if it is unknown.
    pub fn set_authorizer(&mut self, method: impl Into<Method>, auth: Arc<dyn Authorizer>) -> bool {
        match self.routes.get_mut(&method.into()) {
            Some(route) => {
                route.authorizer = Some(auth);
                true
            }
            None => false,
        }
    }

    pub(crate) fn route(&self, method: &Method) -> Option<&Route> {
        self.routes.get(method)
    }

    /// Whether `method` is registered.
    #[must_use]
    pub fn contains(&self, method: &Method) -> bool {
        self.routes.contains_key(method)
    }

    /// Nested object mapping every method path to its call type.
    #[must_use]
    pub fn manifest(&self) -> Value {
        let mut root = Map::new();
        let mut methods: Vec<_> = self.routes.iter().collect();
        methods.sort_by(|a, b| a.0.cmp(b.0));
        for (method, route) in methods {
            let kind = Value::String(route.handler.call_type().as_str().to_string());
            insert_path(&mut root, method.parts(), kind);
        }
        Value::Object(root)
    }
}

fn insert_path(node: &mut Map<String, Value>, parts: &[String], value: Value) {
    match parts {
        [] => {}
        [last] => {
            node.insert(last.clone(), value);
        }
        [first, rest @ ..] => {
            let child = node
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}
