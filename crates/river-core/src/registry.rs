// Procedure registry: services, procedure declarations, middleware, and the
// serialized registry document consumed by the offline compatibility checker.
//
// Declaration vocabulary is `init`/`input`/`output`/`error`; on the wire the
// envelope field is always `payload` (the open carries the init value, later
// data messages carry input values).

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use river_protocol::ErrorPayload;
use serde_json::Value;

use crate::channel::{Readable, Writable};
use crate::context::Ctx;
use crate::schema::Schema;

/// The four procedure shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Rpc,
    Upload,
    Subscription,
    Stream,
}

impl ProcedureKind {
    /// Whether the client may send payloads after the open.
    #[must_use]
    pub fn client_can_send(self) -> bool {
        matches!(self, ProcedureKind::Upload | ProcedureKind::Stream)
    }

    /// Whether the server response is a stream (no automatic final write).
    #[must_use]
    pub fn server_streams(self) -> bool {
        matches!(self, ProcedureKind::Subscription | ProcedureKind::Stream)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProcedureKind::Rpc => "rpc",
            ProcedureKind::Upload => "upload",
            ProcedureKind::Subscription => "subscription",
            ProcedureKind::Stream => "stream",
        }
    }
}

/// A finished rpc/upload invocation: the success value or a declared error.
pub type ProcedureResult = Result<Value, ErrorPayload>;

pub type RpcHandler = Arc<dyn Fn(Ctx, Value) -> BoxFuture<'static, ProcedureResult> + Send + Sync>;
pub type UploadHandler =
    Arc<dyn Fn(Ctx, Value, Readable) -> BoxFuture<'static, ProcedureResult> + Send + Sync>;
pub type SubscriptionHandler = Arc<
    dyn Fn(Ctx, Value, Writable) -> BoxFuture<'static, Result<(), ErrorPayload>> + Send + Sync,
>;
pub type StreamHandler = Arc<
    dyn Fn(Ctx, Value, Readable, Writable) -> BoxFuture<'static, Result<(), ErrorPayload>>
        + Send
        + Sync,
>;

/// Shape-specific handler, matching the readable/writable surface the
/// dispatcher hands out.
#[derive(Clone)]
pub enum ProcedureHandler {
    Rpc(RpcHandler),
    Upload(UploadHandler),
    Subscription(SubscriptionHandler),
    Stream(StreamHandler),
}

/// One declared procedure: shape, schemas, handler.
#[derive(Clone)]
pub struct ProcedureDef {
    pub kind: ProcedureKind,
    pub init: Schema,
    /// Present only for shapes with a client input channel.
    pub input: Option<Schema>,
    pub output: Schema,
    pub error: Schema,
    pub(crate) handler: ProcedureHandler,
}

impl ProcedureDef {
    pub fn rpc<F>(init: Schema, output: Schema, error: Schema, handler: F) -> Self
    where
        F: Fn(Ctx, Value) -> BoxFuture<'static, ProcedureResult> + Send + Sync + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Rpc,
            init,
            input: None,
            output,
            error,
            handler: ProcedureHandler::Rpc(Arc::new(handler)),
        }
    }

    pub fn upload<F>(init: Schema, input: Schema, output: Schema, error: Schema, handler: F) -> Self
    where
        F: Fn(Ctx, Value, Readable) -> BoxFuture<'static, ProcedureResult> + Send + Sync + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Upload,
            init,
            input: Some(input),
            output,
            error,
            handler: ProcedureHandler::Upload(Arc::new(handler)),
        }
    }

    pub fn subscription<F>(init: Schema, output: Schema, error: Schema, handler: F) -> Self
    where
        F: Fn(Ctx, Value, Writable) -> BoxFuture<'static, Result<(), ErrorPayload>>
            + Send
            + Sync
            + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Subscription,
            init,
            input: None,
            output,
            error,
            handler: ProcedureHandler::Subscription(Arc::new(handler)),
        }
    }

    pub fn stream<F>(init: Schema, input: Schema, output: Schema, error: Schema, handler: F) -> Self
    where
        F: Fn(Ctx, Value, Readable, Writable) -> BoxFuture<'static, Result<(), ErrorPayload>>
            + Send
            + Sync
            + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Stream,
            init,
            input: Some(input),
            output,
            error,
            handler: ProcedureHandler::Stream(Arc::new(handler)),
        }
    }
}

impl std::fmt::Debug for ProcedureDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureDef")
            .field("kind", &self.kind)
            .field("init", &self.init)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

/// A named service: shared state plus its procedures.
#[derive(Clone)]
pub struct ServiceDef {
    pub name: String,
    state: Arc<dyn Any + Send + Sync>,
    procedures: BTreeMap<String, ProcedureDef>,
}

impl ServiceDef {
    /// A service with shared state handlers can retrieve through
    /// [`Ctx::state`].
    pub fn with_state<T: Send + Sync + 'static>(name: &str, state: T) -> Self {
        ServiceDef {
            name: name.to_owned(),
            state: Arc::new(state),
            procedures: BTreeMap::new(),
        }
    }

    /// A stateless service.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_state(name, ())
    }

    #[must_use]
    pub fn procedure(mut self, name: &str, def: ProcedureDef) -> Self {
        self.procedures.insert(name.to_owned(), def);
        self
    }

    #[must_use]
    pub fn get(&self, procedure: &str) -> Option<&ProcedureDef> {
        self.procedures.get(procedure)
    }

    /// Typed access to the service state, mirroring [`Ctx::state`]. Handy
    /// for assertions against a service in tests.
    #[must_use]
    pub fn state<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.state).downcast::<T>().ok()
    }

    pub(crate) fn state_handle(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.state)
    }
}

impl std::fmt::Debug for ServiceDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDef")
            .field("name", &self.name)
            .field("procedures", &self.procedures.keys())
            .finish_non_exhaustive()
    }
}

/// Side-effect-only interceptor invoked before the handler, in declaration
/// order. May not mutate the init payload or short-circuit dispatch.
pub type Middleware = Arc<dyn Fn(&Ctx, &Value) + Send + Sync>;

/// All services a server exposes. Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDef>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        ServiceRegistry {
            services: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn service(mut self, def: ServiceDef) -> Self {
        self.services.insert(def.name.clone(), def);
        self
    }

    #[must_use]
    pub fn get(&self, service: &str) -> Option<&ServiceDef> {
        self.services.get(service)
    }

    /// The JSON-schema-shaped registry document two peers (or out-of-band
    /// tooling) compare for compatibility.
    #[must_use]
    pub fn serialize(&self) -> Value {
        let mut services = serde_json::Map::new();
        for (service_name, service) in &self.services {
            let mut procedures = serde_json::Map::new();
            for (proc_name, def) in &service.procedures {
                let mut doc = serde_json::Map::new();
                doc.insert("kind".to_owned(), Value::String(def.kind.as_str().to_owned()));
                doc.insert("init".to_owned(), def.init.describe());
                if let Some(input) = &def.input {
                    doc.insert("input".to_owned(), input.describe());
                }
                doc.insert("output".to_owned(), def.output.describe());
                doc.insert("error".to_owned(), def.error.describe());
                procedures.insert(proc_name.clone(), Value::Object(doc));
            }
            services.insert(
                service_name.clone(),
                serde_json::json!({ "procedures": procedures }),
            );
        }
        serde_json::json!({ "services": services })
    }
}
