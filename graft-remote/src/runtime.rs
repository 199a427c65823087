//! Remote runtime
//!
//! Serves master requests against an [`Engine`]. Objects and functions that
//! leave the process are pinned in a [`HandleTable`] until the master
//! releases them; a reverse index keeps at most one live handle per object.

use std::collections::HashMap;

use graft_core::{CodecError, CodecResult, Handle, MessageFormat, RefKey, References, Value, ValueCodec, Wire};
use graft_ipc::{identifiers, CallTarget, ErrorReply, IpcError, IpcTransport, Request, Response, TcpTransport};
use tracing::{debug, info, warn};

use crate::engine::{
    class_of, render, CallContext, Engine, FunctionRef, InterruptFlag, Kwargs, ObjectRef, OutputSink, RemoteValue,
};
use crate::error::{HandleError, RemoteFailure, RemoteResult};
use crate::handle_table::HandleTable;

/// Functions every engine gets for free
const INTRINSICS: &[&str] = &[
    "class",
    "properties",
    "methods",
    "capability",
    "display",
    "str2func",
    "feval",
];

#[derive(Debug, Clone)]
enum Entry {
    Object(ObjectRef),
    Function(FunctionRef),
}

impl Entry {
    fn identity(&self) -> Identity {
        match self {
            Entry::Object(object) => Identity::Object(object.address()),
            Entry::Function(function) => Identity::Function(function.name().to_string()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Entry::Object(_) => "object",
            Entry::Function(_) => "function",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identity {
    Object(usize),
    Function(String),
}

/// Handle table plus reverse index
#[derive(Debug, Default)]
struct Registry {
    table: HandleTable<Entry>,
    index: HashMap<Identity, Handle>,
}

impl Registry {
    fn register(&mut self, entry: Entry) -> Handle {
        let identity = entry.identity();
        if let Some(&handle) = self.index.get(&identity) {
            return handle;
        }
        let handle = self.table.allocate(entry);
        self.index.insert(identity, handle);
        handle
    }

    fn release(&mut self, handle: Handle) -> Result<(), HandleError> {
        let entry = self.table.release(handle)?;
        self.index.remove(&entry.identity());
        Ok(())
    }

    fn object(&self, handle: Handle) -> Result<ObjectRef, HandleError> {
        match self.table.resolve(handle)? {
            Entry::Object(object) => Ok(object.clone()),
            other => Err(HandleError::WrongKind {
                handle,
                expected: "object",
                actual: other.kind(),
            }),
        }
    }

    fn function(&self, handle: Handle) -> Result<FunctionRef, HandleError> {
        match self.table.resolve(handle)? {
            Entry::Function(function) => Ok(function.clone()),
            other => Err(HandleError::WrongKind {
                handle,
                expected: "function",
                actual: other.kind(),
            }),
        }
    }
}

impl References<ObjectRef, FunctionRef> for Registry {
    fn object_handle(&mut self, object: &ObjectRef) -> CodecResult<Handle> {
        Ok(self.register(Entry::Object(object.clone())))
    }

    fn function_key(&mut self, function: &FunctionRef) -> CodecResult<RefKey> {
        Ok(RefKey::Handle(self.register(Entry::Function(function.clone()))))
    }

    fn resolve_object(&mut self, handle: Handle) -> CodecResult<ObjectRef> {
        self.object(handle)
            .map_err(|e| CodecError::Reference(e.to_string()))
    }

    fn resolve_function(&mut self, key: RefKey) -> CodecResult<FunctionRef> {
        match key {
            RefKey::Handle(handle) => self
                .function(handle)
                .map_err(|e| CodecError::Reference(e.to_string())),
            RefKey::Name(name) => Ok(FunctionRef::named(name)),
        }
    }
}

/// Request loop state for one master connection
pub struct RemoteRuntime<E> {
    engine: E,
    registry: Registry,
    codec: ValueCodec,
    ctx: CallContext,
}

impl<E: Engine> RemoteRuntime<E> {
    pub fn new(engine: E, format: MessageFormat) -> Self {
        Self {
            engine,
            registry: Registry::default(),
            codec: ValueCodec::new(format),
            ctx: CallContext::default(),
        }
    }

    /// Send printed output somewhere other than stdout
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.ctx = CallContext::new(self.ctx.interrupt().clone(), output);
        self
    }

    /// Flag polled by long-running calls; raise it to interrupt them
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.ctx.interrupt().clone()
    }

    /// Number of handles the master currently holds
    pub fn live_handles(&self) -> usize {
        self.registry.table.len()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Answer one request. `die` is acknowledged here; stopping is up to
    /// the caller.
    ///
    /// An interrupt only applies to the request it arrives during. The
    /// master signals while it waits for a reply, so one still pending when
    /// the next request comes in belongs to a call that already answered
    /// and is dropped.
    pub async fn handle(&mut self, request: Request) -> Response {
        let kind = request.kind();
        if self.ctx.interrupt().clear() {
            debug!(request = kind, "Dropping interrupt left over from the previous request");
        }

        let outcome = match self.dispatch(request).await {
            Ok(Some(value)) => self.encode(&value).map(|value| Response::Value { value }),
            Ok(None) => Ok(Response::Ack),
            Err(failure) => Err(failure),
        };

        outcome.unwrap_or_else(|failure| {
            debug!(
                request = kind,
                identifier = %failure.identifier,
                "Request failed: {}",
                failure.message
            );
            Response::Error(failure.in_routine(kind).called_from(kind).into_reply())
        })
    }

    /// Serve requests until `die` or until the master goes away
    pub async fn serve<T: IpcTransport>(&mut self, transport: &mut T) -> Result<(), IpcError> {
        loop {
            let request: Request = match transport.receive().await {
                Ok(request) => request,
                Err(IpcError::ConnectionClosed) => {
                    info!("Master disconnected");
                    return Ok(());
                }
                Err(IpcError::DeserializationError(reason)) => {
                    warn!("Discarding undecodable request: {}", reason);
                    let reply = ErrorReply::new(identifiers::BAD_VALUE, reason);
                    transport.send(&Response::Error(reply)).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            debug!(kind = request.kind(), "Handling request");
            let stop = matches!(request, Request::Die);
            let response = self.handle(request).await;
            match transport.send(&response).await {
                Err(IpcError::SerializationError(reason)) => {
                    warn!("Reply could not be sent: {}", reason);
                    let reply = ErrorReply::new(identifiers::BAD_VALUE, reason);
                    transport.send(&Response::Error(reply)).await?;
                }
                sent => sent?,
            }

            if stop {
                info!("Shutting down on request");
                if let Err(e) = transport.close().await {
                    debug!("Error closing transport: {}", e);
                }
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> RemoteResult<Option<RemoteValue>> {
        match request {
            Request::Die => Ok(None),
            Request::SetGlobal { name, value } => {
                let value = self.decode(value)?;
                self.engine.set_global(&name, value)?;
                Ok(None)
            }
            Request::GetGlobal { name } => self.engine.get_global(&name).map(Some),
            Request::SetProxy {
                handle,
                name,
                value,
            } => {
                let object = self.registry.object(handle)?;
                let value = self.decode(value)?;
                object.set_property(&name, value)?;
                Ok(None)
            }
            Request::GetProxy { handle, name } => {
                let object = self.registry.object(handle)?;
                object.get_property(&name).map(Some)
            }
            Request::DelProxy { handle } => {
                self.registry.release(handle)?;
                Ok(None)
            }
            Request::Call {
                name,
                args,
                kwargs,
                nargout,
            } => {
                let function = match name {
                    CallTarget::Name(name) => FunctionRef::named(name),
                    CallTarget::Handle(handle) => self.registry.function(handle)?,
                };
                let args = args
                    .into_iter()
                    .map(|wire| self.decode(wire))
                    .collect::<RemoteResult<Vec<_>>>()?;
                let kwargs = kwargs
                    .into_iter()
                    .map(|(key, wire)| Ok((key, self.decode(wire)?)))
                    .collect::<RemoteResult<Kwargs>>()?;
                self.invoke(function.name().to_string(), args, kwargs, nargout)
                    .await
                    .map(Some)
            }
        }
    }

    async fn invoke(
        &mut self,
        mut name: String,
        mut args: Vec<RemoteValue>,
        kwargs: Kwargs,
        nargout: i64,
    ) -> RemoteResult<RemoteValue> {
        while name == "feval" {
            if args.is_empty() {
                return Err(RemoteFailure::bad_argument("feval requires a function"));
            }
            name = match args.remove(0) {
                Value::Function(function) => function.name().to_string(),
                Value::Str(target) => target,
                other => {
                    return Err(RemoteFailure::bad_argument(format!(
                        "feval cannot call a {}",
                        other.kind()
                    )))
                }
            };
        }

        if let Some(Value::Object(object)) = args.first() {
            if object.has_method(&name) {
                let object = object.clone();
                args.remove(0);
                return object
                    .call_method(&self.ctx, &name, args, nargout)
                    .map_err(|f| f.in_routine(&format!("{}.{}", object.class_name(), name)));
            }
        }

        let result = match name.as_str() {
            "class" => Ok(Value::Str(class_of(first(&args, &name)?))),
            "display" => Ok(Value::Str(render(first(&args, &name)?))),
            "properties" => match first(&args, &name)? {
                Value::Object(object) => Ok(string_list(object.properties())),
                Value::Map(fields) | Value::Struct(fields) => Ok(string_list(fields.keys().cloned().collect())),
                other => Err(RemoteFailure::bad_argument(format!(
                    "a {} has no properties",
                    other.kind()
                ))),
            },
            "methods" => match first(&args, &name)? {
                Value::Object(object) => Ok(string_list(object.methods())),
                _ => Ok(Value::List(Vec::new())),
            },
            "capability" => match args.as_slice() {
                [Value::Object(object), member] => {
                    let member = member
                        .as_str()
                        .ok_or_else(|| RemoteFailure::bad_argument("member name must be text"))?;
                    let capability = if object.has_property(member) {
                        "property"
                    } else if object.has_method(member) {
                        "method"
                    } else {
                        "undefined"
                    };
                    Ok(Value::from(capability))
                }
                _ => Err(RemoteFailure::bad_argument("capability(object, name)")),
            },
            "str2func" => {
                let target = first(&args, &name)?
                    .as_str()
                    .ok_or_else(|| RemoteFailure::bad_argument("str2func needs a function name"))?;
                if INTRINSICS.contains(&target) || self.engine.has_function(target) {
                    Ok(Value::Function(FunctionRef::named(target)))
                } else {
                    Err(RemoteFailure::no_function(target))
                }
            }
            _ => {
                self.engine
                    .call(&self.ctx, &name, args, kwargs, nargout)
                    .await
            }
        };
        result.map_err(|f| f.in_routine(&name))
    }

    fn decode(&mut self, wire: Wire) -> RemoteResult<RemoteValue> {
        Ok(self.codec.decode(wire, &mut self.registry)?)
    }

    fn encode(&mut self, value: &RemoteValue) -> RemoteResult<Wire> {
        Ok(self.codec.encode(value, &mut self.registry)?)
    }
}

fn first<'a>(args: &'a [RemoteValue], function: &str) -> RemoteResult<&'a RemoteValue> {
    args.first()
        .ok_or_else(|| RemoteFailure::bad_argument(format!("{} requires an argument", function)))
}

fn string_list(names: Vec<String>) -> RemoteValue {
    Value::List(names.into_iter().map(Value::Str).collect())
}

/// Connect to the master at `address` and serve until told to stop.
///
/// SIGINT raises the interrupt flag instead of terminating the process.
pub async fn run<E: Engine>(engine: E, address: &str, format: MessageFormat) -> Result<(), IpcError> {
    info!(address, format = %format, "Connecting to master");
    let mut transport = TcpTransport::connect(address, format).await?;
    let mut runtime = RemoteRuntime::new(engine, format);

    let flag = runtime.interrupt_flag();
    let watcher = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received");
            flag.raise();
        }
    });

    let result = runtime.serve(&mut transport).await;
    watcher.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinEngine;
    use graft_core::Matrix;
    use graft_ipc::FramedTransport;
    use std::collections::BTreeMap;
    use tokio::io::DuplexStream;

    fn runtime() -> RemoteRuntime<BuiltinEngine> {
        RemoteRuntime::new(BuiltinEngine::new(), MessageFormat::Json)
    }

    fn call(name: impl Into<CallTarget>, args: Vec<Wire>) -> Request {
        Request::call(name, args)
    }

    fn handle_of(response: &Response) -> Handle {
        match response {
            Response::Value { value } => {
                let items = value.as_array().expect("tagged list");
                Handle(items[1].as_u64().expect("handle"))
            }
            other => panic!("expected a value, got {:?}", other),
        }
    }

    fn error_of(response: Response) -> ErrorReply {
        match response {
            Response::Error(reply) => reply,
            other => panic!("expected an error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_globals_round_trip() {
        let mut rt = runtime();
        let put = Request::SetGlobal {
            name: "a".to_string(),
            value: Wire::Float(4.5),
        };
        assert_eq!(rt.handle(put).await, Response::Ack);
        let got = rt.handle(Request::GetGlobal { name: "a".to_string() }).await;
        assert_eq!(got, Response::Value { value: Wire::Float(4.5) });

        let missing = error_of(rt.handle(Request::GetGlobal { name: "b".to_string() }).await);
        assert_eq!(missing.identifier, identifiers::NO_VARIABLE);
        assert!(missing.stack.len() >= 2);
        assert_eq!(missing.stack.last().map(|f| f.name.as_str()), Some("get_global"));
    }

    #[tokio::test]
    async fn test_object_handles_are_deduplicated() {
        let mut rt = runtime();
        let first = rt.handle(call("Counter", vec![])).await;
        let second = rt.handle(call("Counter", vec![])).await;
        let h1 = handle_of(&first);
        let h2 = handle_of(&second);
        assert_ne!(h1, h2);

        let Response::Value { value } = first else {
            panic!("expected value");
        };
        let echoed = rt.handle(call("identity", vec![value])).await;
        assert_eq!(handle_of(&echoed), h1);
        assert_eq!(rt.live_handles(), 2);
    }

    #[tokio::test]
    async fn test_proxy_properties_and_methods() {
        let mut rt = runtime();
        let Response::Value { value: counter } = rt.handle(call("Counter", vec![Wire::Int(3)])).await else {
            panic!("expected value");
        };
        let handle = handle_of(&Response::Value { value: counter.clone() });

        let step = rt
            .handle(Request::GetProxy {
                handle,
                name: "step".to_string(),
            })
            .await;
        assert_eq!(step, Response::Value { value: Wire::Float(3.0) });

        let bumped = rt.handle(call("increment", vec![counter.clone()])).await;
        assert_eq!(bumped, Response::Value { value: Wire::Float(3.0) });

        let set = rt
            .handle(Request::SetProxy {
                handle,
                name: "count".to_string(),
                value: Wire::Int(10),
            })
            .await;
        assert_eq!(set, Response::Ack);
        let count = rt
            .handle(Request::GetProxy {
                handle,
                name: "count".to_string(),
            })
            .await;
        assert_eq!(count, Response::Value { value: Wire::Float(10.0) });

        let capability = rt
            .handle(call("capability", vec![counter, Wire::str("reset")]))
            .await;
        assert_eq!(capability, Response::Value { value: Wire::str("method") });
    }

    #[tokio::test]
    async fn test_release_is_checked() {
        let mut rt = runtime();
        let handle = handle_of(&rt.handle(call("Counter", vec![])).await);
        assert_eq!(rt.handle(Request::DelProxy { handle }).await, Response::Ack);
        assert_eq!(rt.live_handles(), 0);

        let again = error_of(rt.handle(Request::DelProxy { handle }).await);
        assert_eq!(again.identifier, identifiers::INVALID_HANDLE);

        let stale = error_of(
            rt.handle(Request::GetProxy {
                handle,
                name: "count".to_string(),
            })
            .await,
        );
        assert_eq!(stale.identifier, identifiers::INVALID_HANDLE);
    }

    #[tokio::test]
    async fn test_function_handles() {
        let mut rt = runtime();
        let response = rt.handle(call("str2func", vec![Wire::str("sum")])).await;
        let handle = handle_of(&response);
        let again = rt.handle(call("str2func", vec![Wire::str("sum")])).await;
        assert_eq!(handle_of(&again), handle);

        let codec = ValueCodec::new(MessageFormat::Json);
        let row = codec.encode_matrix(&Matrix::row(&[1.0f64, 2.0, 3.0]));
        let total = rt.handle(call(handle, vec![row])).await;
        assert_eq!(total, Response::Value { value: Wire::Float(6.0) });

        let unknown = error_of(rt.handle(call("str2func", vec![Wire::str("nope")])).await);
        assert_eq!(unknown.identifier, identifiers::NO_FUNCTION);

        let wrong = error_of(rt.handle(call(Handle(40), vec![])).await);
        assert_eq!(wrong.identifier, identifiers::INVALID_HANDLE);
    }

    #[tokio::test]
    async fn test_feval_and_kwargs() {
        let mut rt = runtime();
        let mut kwargs = BTreeMap::new();
        kwargs.insert("step".to_string(), Wire::Int(5));
        let request = Request::Call {
            name: CallTarget::from("feval"),
            args: vec![Wire::str("Counter")],
            kwargs,
            nargout: 1,
        };
        let handle = handle_of(&rt.handle(request).await);
        let step = rt
            .handle(Request::GetProxy {
                handle,
                name: "step".to_string(),
            })
            .await;
        assert_eq!(step, Response::Value { value: Wire::Float(5.0) });
    }

    #[tokio::test]
    async fn test_user_error_has_stack() {
        let mut rt = runtime();
        let reply = error_of(
            rt.handle(call(
                "error",
                vec![Wire::str("X:undefinedVariable"), Wire::str("boom")],
            ))
            .await,
        );
        assert_eq!(reply.identifier, "X:undefinedVariable");
        assert_eq!(reply.message, "boom");
        assert_eq!(reply.stack[0].name, "error");
        assert!(reply.stack[0].file.is_some());
    }

    #[tokio::test]
    async fn test_interrupt_applies_to_the_request_in_flight() {
        let mut rt = runtime();
        let flag = rt.interrupt_flag();

        // raised between requests: stale, the next call runs normally
        flag.raise();
        let response = rt.handle(call("pause", vec![Wire::Float(0.0)])).await;
        assert_eq!(response, Response::Value { value: Wire::Nil });
        assert!(!flag.is_raised());

        // raised while a call runs: that call stops
        let raiser = {
            let flag = flag.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                flag.raise();
            })
        };
        let response = rt.handle(call("pause", vec![Wire::Float(30.0)])).await;
        assert_eq!(error_of(response).identifier, identifiers::INTERRUPTED);
        raiser.await.unwrap();

        // and does not leak into the one after
        let response = rt.handle(call("pause", vec![Wire::Float(0.0)])).await;
        assert_eq!(response, Response::Value { value: Wire::Nil });
    }

    #[tokio::test]
    async fn test_serve_until_die() {
        let (client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let mut master = FramedTransport::new(client, MessageFormat::Cbor);
        let server_task = tokio::spawn(async move {
            let mut transport = FramedTransport::new(server, MessageFormat::Cbor);
            let mut rt = RemoteRuntime::new(BuiltinEngine::new(), MessageFormat::Cbor);
            rt.serve(&mut transport).await
        });

        master.send(&call("eval", vec![Wire::str("0;")])).await.unwrap();
        let reply: Response = master.receive().await.unwrap();
        assert_eq!(reply, Response::Value { value: Wire::Nil });

        master.send(&Request::Die).await.unwrap();
        let reply: Response = master.receive().await.unwrap();
        assert_eq!(reply, Response::Ack);
        assert!(server_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_returns_when_master_disconnects() {
        let (client, server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut transport = FramedTransport::new(server, MessageFormat::Json);
            runtime().serve(&mut transport).await
        });
        drop(client);
        assert!(server_task.await.unwrap().is_ok());
    }
}
