//! Session and RPC channel
//!
//! A [`Session`] owns the connection to one remote and its process. Every
//! request gets exactly one reply: the channel is either idle or awaiting the
//! reply to the single request in flight, and it only returns to idle once
//! that reply has been read, even when the call fails, is interrupted, or the
//! caller gives up on it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use graft_config::{SessionConfig, Validatable};
use graft_core::{CodecError, CodecResult, Handle, MessageFormat, RefKey, References, Value, ValueCodec, Wire};
use graft_ipc::{identifiers, CallTarget, FramedTransport, IpcError, IpcTransport, Request, Response, AUTO_NARGOUT};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{GraftError, GraftResult, RemoteError};
use crate::function::{Namespace, RemoteFunction};
use crate::launch::launch;
use crate::peer::{OutputEcho, PeerProcess};
use crate::proxy::{ProxyObject, RemoteRef};

/// Value as seen by the master
pub type MasterValue = Value<ProxyObject, RemoteFunction>;

/// Keyword arguments of a call
pub type MasterKwargs = BTreeMap<String, MasterValue>;

/// Byte stream a session can run over
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Wire state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    AwaitingReply,
}

struct Channel {
    transport: FramedTransport<Box<dyn PeerStream>>,
    peer: Box<dyn PeerProcess>,
    state: ChannelState,
}

/// Live proxies and releases waiting to be sent, guarded together so a
/// dying proxy and a newly decoded one for the same handle cannot race
#[derive(Default)]
pub(crate) struct ProxyBook {
    live: HashMap<Handle, Weak<RemoteRef>>,
    pending: Vec<Handle>,
}

pub(crate) struct SessionShared {
    channel: Mutex<Channel>,
    book: SyncMutex<ProxyBook>,
    closed: AtomicBool,
    torn_down: AtomicBool,
    codec: ValueCodec,
    config: SessionConfig,
    interrupt: Arc<Notify>,
}

impl SessionShared {
    /// Called when the last reference to a remote handle goes away
    pub(crate) fn release_later(&self, handle: Handle, dying: *const RemoteRef) {
        let mut book = self.book.lock();
        let ours = book
            .live
            .get(&handle)
            .is_some_and(|weak| weak.as_ptr() == dying);
        if !ours {
            // A newer reference owns the handle now
            return;
        }
        book.live.remove(&handle);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!(%handle, "Queueing release");
        book.pending.push(handle);
    }
}

/// Interrupts the call in flight on a session
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<Notify>);

impl InterruptHandle {
    /// Forward an interrupt to the remote if a call is in flight
    pub fn interrupt(&self) {
        self.0.notify_waiters();
    }
}

/// Result of [`Session::get_or_namespace`]
#[derive(Debug, Clone, PartialEq)]
pub enum Global {
    Value(MasterValue),
    Namespace(Namespace),
}

/// Connection to one remote engine
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Launch the configured remote and connect to it
    pub async fn launch(config: SessionConfig) -> GraftResult<Self> {
        let echo = if config.echo_output {
            OutputEcho::Console
        } else {
            OutputEcho::Discard
        };
        Self::launch_with_echo(config, echo).await
    }

    /// Launch with the remote's stdout sent to `echo`
    pub async fn launch_with_echo(config: SessionConfig, echo: OutputEcho) -> GraftResult<Self> {
        config.validate()?;
        let (stream, peer) = launch(&config, echo).await?;
        Self::connect(stream, peer, config).await
    }

    /// Start a session over an established stream and run the handshake
    pub async fn connect<S, P>(stream: S, peer: P, config: SessionConfig) -> GraftResult<Self>
    where
        S: PeerStream + 'static,
        P: PeerProcess + 'static,
    {
        let format = config.message_format;
        let channel = Channel {
            transport: FramedTransport::new(Box::new(stream) as Box<dyn PeerStream>, format),
            peer: Box::new(peer),
            state: ChannelState::Idle,
        };
        let session = Session {
            shared: Arc::new(SessionShared {
                channel: Mutex::new(channel),
                book: SyncMutex::new(ProxyBook::default()),
                closed: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                codec: ValueCodec::new(format),
                config,
                interrupt: Arc::new(Notify::new()),
            }),
        };

        let config = &session.shared.config;
        let handshake = session
            .call(
                config.handshake_function.as_str(),
                vec![Value::from(config.handshake_argument.as_str())],
            )
            .await;
        if let Err(e) = handshake {
            warn!("Handshake failed: {}", e);
            session.close().await;
            return Err(e);
        }
        info!(format = %format, "Session ready");
        Ok(session)
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn format(&self) -> MessageFormat {
        self.shared.config.message_format
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Handle for interrupting calls from another task or a signal handler
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.shared.interrupt.clone())
    }

    /// Read a global variable
    pub async fn get_global(&self, name: &str) -> GraftResult<MasterValue> {
        self.request_value(Request::GetGlobal {
            name: name.to_string(),
        })
        .await
    }

    /// Assign a global variable
    pub async fn set_global(&self, name: &str, value: &MasterValue) -> GraftResult<()> {
        let value = self.encode(value)?;
        self.request_ack(Request::SetGlobal {
            name: name.to_string(),
            value,
        })
        .await
    }

    /// A global variable, or a namespace when no variable has that name
    pub async fn get_or_namespace(&self, name: &str) -> GraftResult<Global> {
        match self.get_global(name).await {
            Ok(value) => Ok(Global::Value(value)),
            Err(GraftError::Remote(e)) if e.identifier == identifiers::NO_VARIABLE => {
                let namespace = Namespace::new(self, name);
                if namespace.members().await?.is_empty() {
                    Err(GraftError::Remote(e))
                } else {
                    Ok(Global::Namespace(namespace))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Call a function by name, letting the remote pick the output count
    pub async fn call(&self, name: &str, args: Vec<MasterValue>) -> GraftResult<MasterValue> {
        self.call_with(CallTarget::from(name), args, MasterKwargs::new(), AUTO_NARGOUT)
            .await
    }

    /// Call with keyword arguments and an explicit output count.
    ///
    /// With `nargout > 1` the result is a list of `nargout` values.
    pub async fn call_with(
        &self,
        target: CallTarget,
        args: Vec<MasterValue>,
        kwargs: MasterKwargs,
        nargout: i64,
    ) -> GraftResult<MasterValue> {
        let args = args
            .iter()
            .map(|arg| self.encode(arg))
            .collect::<GraftResult<Vec<_>>>()?;
        let kwargs = kwargs
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.encode(value)?)))
            .collect::<GraftResult<BTreeMap<_, _>>>()?;
        self.request_value(Request::Call {
            name: target,
            args,
            kwargs,
            nargout,
        })
        .await
    }

    /// A remote function bound by name
    pub fn function(&self, name: &str) -> RemoteFunction {
        RemoteFunction::named(self, name)
    }

    /// Documentation of a remote function, class or method
    pub async fn help(&self, topic: &str) -> GraftResult<String> {
        self.help_for(Value::from(topic)).await
    }

    pub(crate) async fn help_for(&self, topic: MasterValue) -> GraftResult<String> {
        match self.call("help", vec![topic]).await? {
            Value::Str(text) => Ok(text),
            other => Err(GraftError::Protocol(format!(
                "help returned a {}, expected text",
                other.kind()
            ))),
        }
    }

    pub(crate) async fn get_proxy(&self, handle: Handle, name: &str) -> GraftResult<MasterValue> {
        self.request_value(Request::GetProxy {
            handle,
            name: name.to_string(),
        })
        .await
    }

    pub(crate) async fn set_proxy(&self, handle: Handle, name: &str, value: &MasterValue) -> GraftResult<()> {
        let value = self.encode(value)?;
        self.request_ack(Request::SetProxy {
            handle,
            name: name.to_string(),
            value,
        })
        .await
    }

    /// Wire state once no call holds the channel
    pub async fn channel_state(&self) -> ChannelState {
        self.shared.channel.lock().await.state
    }

    /// Number of handles with a live proxy or function on this side
    pub fn live_references(&self) -> usize {
        self.shared
            .book
            .lock()
            .live
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of releases not yet sent
    pub fn pending_releases(&self) -> usize {
        self.shared.book.lock().pending.len()
    }

    /// Send queued releases now instead of before the next request
    pub async fn flush_releases(&self) -> GraftResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut channel = self.shared.channel.lock().await;
        self.send_releases(&mut channel).await
    }

    /// Shut the remote down. Safe to call repeatedly and after the remote
    /// died; failures are logged, never returned.
    pub async fn close(&self) {
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.book.lock().pending.clear();

        let mut channel = self.shared.channel.lock().await;
        let shutdown = self.shared.config.shutdown_timeout;
        if let Some(status) = channel.peer.try_exit_status() {
            debug!(%status, "Remote already exited");
        } else {
            match tokio::time::timeout(shutdown, self.exchange(&mut channel, &Request::Die)).await {
                Ok(Ok(_)) => debug!("Remote acknowledged shutdown"),
                Ok(Err(e)) => debug!("Shutdown request failed: {}", e),
                Err(_) => warn!("Remote did not acknowledge shutdown in time"),
            }
            match channel.peer.wait(shutdown).await {
                Some(status) => info!(%status, "Remote exited"),
                None => {
                    warn!("Remote still running after shutdown; killing it");
                    channel.peer.kill().await;
                }
            }
        }
        if let Err(e) = channel.transport.close().await {
            debug!("Error closing transport: {}", e);
        }
    }

    pub(crate) fn proxy_for(&self, handle: Handle) -> Arc<RemoteRef> {
        let mut book = self.shared.book.lock();
        if let Some(existing) = book.live.get(&handle).and_then(Weak::upgrade) {
            return existing;
        }
        let reference = Arc::new(RemoteRef::new(handle, self.downgrade()));
        book.live.insert(handle, Arc::downgrade(&reference));
        book.pending.retain(|pending| *pending != handle);
        reference
    }

    fn ensure_open(&self) -> GraftResult<()> {
        if self.is_closed() {
            Err(GraftError::Closed)
        } else {
            Ok(())
        }
    }

    fn encode(&self, value: &MasterValue) -> GraftResult<Wire> {
        Ok(self.shared.codec.encode(value, &mut SessionReferences { session: self })?)
    }

    fn decode(&self, wire: Wire) -> GraftResult<MasterValue> {
        Ok(self.shared.codec.decode(wire, &mut SessionReferences { session: self })?)
    }

    async fn request_value(&self, request: Request) -> GraftResult<MasterValue> {
        let kind = request.kind();
        self.request(request, |response| match response {
            Response::Value { value } => self.decode(value),
            other => Err(GraftError::Protocol(format!(
                "expected a value in reply to {}, got {}",
                kind,
                other.kind()
            ))),
        })
        .await
    }

    async fn request_ack(&self, request: Request) -> GraftResult<()> {
        let kind = request.kind();
        self.request(request, |response| match response {
            Response::Ack => Ok(()),
            other => Err(GraftError::Protocol(format!(
                "expected ack in reply to {}, got {}",
                kind,
                other.kind()
            ))),
        })
        .await
    }

    /// Send one request and hand its reply to `read`, turning error replies
    /// into [`RemoteError`]s.
    ///
    /// `read` runs with the channel still held, so proxies decoded from the
    /// reply are registered before any queued release can go out for the
    /// same handle.
    async fn request<T>(
        &self,
        request: Request,
        read: impl FnOnce(Response) -> GraftResult<T>,
    ) -> GraftResult<T> {
        self.ensure_open()?;
        let mut channel = self.shared.channel.lock().await;
        self.ensure_open()?;
        self.send_releases(&mut channel).await?;

        debug!(kind = request.kind(), "Sending request");
        let response = match self.exchange(&mut channel, &request).await? {
            Response::Error(reply) => {
                return Err(GraftError::Remote(RemoteError::from_reply(
                    reply,
                    &self.shared.config.source_extensions,
                )))
            }
            response => response,
        };
        let result = read(response);
        drop(channel);
        result
    }

    async fn send_releases(&self, channel: &mut Channel) -> GraftResult<()> {
        let pending = std::mem::take(&mut self.shared.book.lock().pending);
        for handle in pending {
            match self.exchange(channel, &Request::DelProxy { handle }).await? {
                Response::Ack => debug!(%handle, "Released"),
                Response::Error(reply) => warn!(%handle, "Release failed: {}", reply.message),
                other => warn!(%handle, "Unexpected reply to release: {}", other.kind()),
            }
        }
        Ok(())
    }

    /// One request, one reply
    async fn exchange(&self, channel: &mut Channel, request: &Request) -> GraftResult<Response> {
        if channel.state == ChannelState::AwaitingReply {
            warn!("Previous call was abandoned; draining its reply");
            let stale = self.await_reply(channel).await;
            debug!(ok = stale.is_ok(), "Discarded stale reply");
            match stale {
                Ok(_) | Err(GraftError::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = channel.transport.send(request).await {
            return Err(self.transport_failure(channel, e).await);
        }
        channel.state = ChannelState::AwaitingReply;
        self.await_reply(channel).await
    }

    /// Wait for the reply to the request in flight, polling peer liveness
    /// and forwarding interrupts. An interrupted call still consumes its
    /// reply before returning [`GraftError::Interrupted`].
    async fn await_reply(&self, channel: &mut Channel) -> GraftResult<Response> {
        let poll = self.shared.config.poll_interval;
        let notified = self.shared.interrupt.notified();
        tokio::pin!(notified);
        let mut interrupted = false;

        loop {
            tokio::select! {
                received = tokio::time::timeout(poll, channel.transport.receive::<Response>()) => {
                    match received {
                        Ok(Ok(response)) => {
                            channel.state = ChannelState::Idle;
                            return if interrupted {
                                debug!(kind = response.kind(), "Drained reply of interrupted call");
                                Err(GraftError::Interrupted)
                            } else {
                                Ok(response)
                            };
                        }
                        Ok(Err(IpcError::DeserializationError(reason))) => {
                            channel.state = ChannelState::Idle;
                            return Err(GraftError::Protocol(format!("undecodable reply: {}", reason)));
                        }
                        Ok(Err(e)) => return Err(self.transport_failure(channel, e).await),
                        Err(_) => {
                            if let Some(status) = channel.peer.try_exit_status() {
                                self.shared.closed.store(true, Ordering::SeqCst);
                                return Err(GraftError::RemoteDied { status });
                            }
                        }
                    }
                }
                _ = &mut notified, if !interrupted => {
                    interrupted = true;
                    info!("Interrupting remote call");
                    if let Err(e) = channel.peer.interrupt() {
                        warn!("Failed to forward interrupt: {}", e);
                    }
                }
            }
        }
    }

    /// A broken transport usually means the peer died; say so if it did
    async fn transport_failure(&self, channel: &mut Channel, err: IpcError) -> GraftError {
        if !err.is_fatal() {
            return GraftError::Ipc(err);
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        match channel.peer.wait(self.shared.config.poll_interval).await {
            Some(status) => GraftError::RemoteDied { status },
            None => GraftError::Ipc(err),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("format", &self.format())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolves proxies and functions against one session while coding values
struct SessionReferences<'a> {
    session: &'a Session,
}

impl References<ProxyObject, RemoteFunction> for SessionReferences<'_> {
    fn object_handle(&mut self, object: &ProxyObject) -> CodecResult<Handle> {
        if !object.belongs_to(self.session) {
            return Err(CodecError::Reference(format!(
                "object {} belongs to another session",
                object.handle()
            )));
        }
        Ok(object.handle())
    }

    fn function_key(&mut self, function: &RemoteFunction) -> CodecResult<RefKey> {
        match function.handle() {
            Some(handle) if !function.belongs_to(self.session) => Err(CodecError::Reference(format!(
                "function {} belongs to another session",
                handle
            ))),
            Some(handle) => Ok(RefKey::Handle(handle)),
            None => Ok(RefKey::Name(function.name().unwrap_or_default().to_string())),
        }
    }

    fn resolve_object(&mut self, handle: Handle) -> CodecResult<ProxyObject> {
        Ok(ProxyObject::from_ref(self.session.proxy_for(handle)))
    }

    fn resolve_function(&mut self, key: RefKey) -> CodecResult<RemoteFunction> {
        Ok(match key {
            RefKey::Handle(handle) => RemoteFunction::from_ref(self.session.proxy_for(handle)),
            RefKey::Name(name) => RemoteFunction::named(self.session, &name),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::Capability;
    use graft_core::{DType, Matrix, SparseMatrix};
    use graft_ipc::FramedTransport;
    use graft_remote::{BuiltinEngine, RemoteRuntime};
    use std::time::Duration;

    fn test_config(format: MessageFormat) -> SessionConfig {
        SessionConfig {
            message_format: format,
            poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Session backed by the builtin engine running in a task
    pub(crate) async fn in_process(format: MessageFormat) -> Session {
        let (master_end, remote_end) = tokio::io::duplex(1 << 20);
        let mut runtime = RemoteRuntime::new(BuiltinEngine::new(), format);
        let flag = runtime.interrupt_flag();
        let peer = crate::peer::TaskPeer::spawn(
            async move {
                let mut transport = FramedTransport::new(remote_end, format);
                if let Err(e) = runtime.serve(&mut transport).await {
                    warn!("Remote task failed: {}", e);
                }
            },
            move || flag.raise(),
        );
        Session::connect(master_end, peer, test_config(format))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_globals_round_trip() {
        for format in [MessageFormat::Json, MessageFormat::Cbor] {
            let session = in_process(format).await;
            let m = Matrix::from_elements(vec![2, 3], &[1i16, -2, 3, -4, 5, -6]).unwrap();
            session.set_global("m", &Value::Matrix(m.clone())).await.unwrap();
            assert_eq!(session.get_global("m").await.unwrap(), Value::Matrix(m));

            session.set_global("s", &Value::from("text")).await.unwrap();
            assert_eq!(session.get_global("s").await.unwrap(), Value::from("text"));
            session.close().await;
        }
    }

    #[tokio::test]
    async fn test_sum_of_zeros_dense_and_sparse() {
        for format in [MessageFormat::Json, MessageFormat::Cbor] {
            let session = in_process(format).await;
            let dense = Matrix::zeros(DType::Float64, vec![1, 256]).unwrap();
            let sparse = SparseMatrix::from_dense(&dense).unwrap();
            assert_eq!(
                session.call("sum", vec![Value::Matrix(dense)]).await.unwrap(),
                Value::Float(0.0)
            );
            assert_eq!(
                session.call("sum", vec![Value::Sparse(sparse)]).await.unwrap(),
                Value::Float(0.0)
            );
            session.close().await;
        }
    }

    #[tokio::test]
    async fn test_remote_error_structure() {
        let session = in_process(MessageFormat::Json).await;
        let err = session
            .call(
                "error",
                vec![Value::from("X:undefinedVariable"), Value::from("Undefined x")],
            )
            .await
            .unwrap_err();
        let GraftError::Remote(remote) = err else {
            panic!("expected a remote error");
        };
        assert_eq!(remote.identifier, "X:undefinedVariable");
        assert_eq!(remote.original_message, "Undefined x");
        assert!(!remote.stack.is_empty());
        assert!(remote.trace.starts_with("Remote traceback"));

        // The channel stays usable after an error reply
        assert_eq!(session.call("eval", vec![Value::from("2")]).await.unwrap(), Value::Float(2.0));
        session.close().await;
    }

    #[tokio::test]
    async fn test_missing_global_is_lookup() {
        let session = in_process(MessageFormat::Cbor).await;
        let err = session.get_global("nothing").await.unwrap_err();
        assert!(err.is_lookup());
        assert!(!err.is_fatal());
        session.close().await;
    }

    #[tokio::test]
    async fn test_nargout_and_kwargs() {
        let session = in_process(MessageFormat::Cbor).await;
        let values = Matrix::row(&[4.0f64, 11.0, 7.0]);
        let out = session
            .call_with(
                CallTarget::from("max"),
                vec![Value::Matrix(values)],
                MasterKwargs::new(),
                2,
            )
            .await
            .unwrap();
        assert_eq!(out, Value::List(vec![Value::Float(11.0), Value::Float(2.0)]));

        let mut kwargs = MasterKwargs::new();
        kwargs.insert("step".to_string(), Value::Int(4));
        let counter = session
            .call_with(CallTarget::from("Counter"), vec![], kwargs, 1)
            .await
            .unwrap();
        let counter = counter.as_object().unwrap();
        assert_eq!(counter.get_field("step").await.unwrap(), Value::Float(4.0));
        session.close().await;
    }

    #[tokio::test]
    async fn test_proxies_are_shared_and_released() {
        let session = in_process(MessageFormat::Json).await;
        let counter = session.call("Counter", vec![]).await.unwrap();
        let echoed = session.call("identity", vec![counter.clone()]).await.unwrap();
        assert_eq!(counter, echoed);
        assert_eq!(session.live_references(), 1);

        drop(echoed);
        assert_eq!(session.pending_releases(), 0);
        drop(counter);
        assert_eq!(session.pending_releases(), 1);
        assert_eq!(session.live_references(), 0);

        session.flush_releases().await.unwrap();
        assert_eq!(session.pending_releases(), 0);
        session.close().await;
    }

    #[tokio::test]
    async fn test_released_object_can_come_back() {
        let session = in_process(MessageFormat::Cbor).await;
        let counter = session.call("Counter", vec![]).await.unwrap();
        session.set_global("c", &counter).await.unwrap();
        drop(counter);
        assert_eq!(session.pending_releases(), 1);

        // get_global flushes the release first, so the remote hands out a
        // fresh handle that must still work
        let again = session.get_global("c").await.unwrap();
        let proxy = again.as_object().unwrap();
        assert_eq!(proxy.capability("count").await.unwrap(), Capability::Property);
        assert_eq!(session.pending_releases(), 0);
        session.close().await;
    }

    #[tokio::test]
    async fn test_reacquiring_a_dying_handle_cancels_its_release() {
        let session = in_process(MessageFormat::Json).await;
        let first = session.proxy_for(Handle(7));
        drop(first);
        assert_eq!(session.pending_releases(), 1);

        let second = session.proxy_for(Handle(7));
        assert_eq!(session.pending_releases(), 0);
        assert_eq!(second.handle(), Handle(7));
        session.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reacquire_and_release_keep_handles_valid() {
        let session = in_process(MessageFormat::Cbor).await;
        let counter = session.call("Counter", vec![]).await.unwrap();
        session.set_global("c", &counter).await.unwrap();
        drop(counter);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        let value = session.get_global("c").await.unwrap();
                        let proxy = value.as_object().unwrap().clone();
                        drop(value);
                        // a release queued by another worker must not have
                        // invalidated the handle this reply carried
                        proxy.get_field("count").await.unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }
        session.flush_releases().await.unwrap();
        assert_eq!(session.live_references(), 0);
        session.close().await;
    }

    #[tokio::test]
    async fn test_function_values_call_back() {
        let session = in_process(MessageFormat::Json).await;
        let sum = session.call("str2func", vec![Value::from("sum")]).await.unwrap();
        let sum = sum.as_function().unwrap();
        assert!(sum.handle().is_some());

        use crate::function::Invocable;
        let total = sum
            .call(vec![Value::Matrix(Matrix::row(&[1.0f64, 2.0, 3.5]))])
            .await
            .unwrap();
        assert_eq!(total, Value::Float(6.5));

        let named = session.function("numel");
        let count = named
            .call(vec![Value::Matrix(Matrix::zeros(DType::Int8, vec![3, 4]).unwrap())])
            .await
            .unwrap();
        assert_eq!(count, Value::Float(12.0));
        assert!(named.help().await.unwrap().starts_with("numel(x)"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_namespace_lookup() {
        let session = in_process(MessageFormat::Cbor).await;
        let Global::Namespace(stats) = session.get_or_namespace("stats").await.unwrap() else {
            panic!("expected a namespace");
        };
        assert_eq!(stats.members().await.unwrap(), vec!["mean", "var"]);
        let mean = stats
            .call("mean", vec![Value::Matrix(Matrix::row(&[2.0f64, 4.0]))])
            .await
            .unwrap();
        assert_eq!(mean, Value::Float(3.0));

        session.set_global("x", &Value::Float(1.0)).await.unwrap();
        assert_eq!(
            session.get_or_namespace("x").await.unwrap(),
            Global::Value(Value::Float(1.0))
        );
        assert!(session.get_or_namespace("nowhere").await.unwrap_err().is_lookup());
        session.close().await;
    }

    #[tokio::test]
    async fn test_interrupt_drains_reply() {
        let session = in_process(MessageFormat::Cbor).await;
        let handle = session.interrupt_handle();
        let caller = session.clone();
        let call = tokio::spawn(async move { caller.call("pause", vec![Value::Float(30.0)]).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.interrupt();
        let result = tokio::time::timeout(Duration::from_secs(10), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(GraftError::Interrupted)));
        assert_eq!(session.channel_state().await, ChannelState::Idle);

        assert_eq!(session.call("eval", vec![Value::from("5")]).await.unwrap(), Value::Float(5.0));
        session.close().await;
    }

    #[tokio::test]
    async fn test_abandoned_call_is_drained() {
        let session = in_process(MessageFormat::Json).await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            session.call("pause", vec![Value::Float(0.2)]),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(session.channel_state().await, ChannelState::AwaitingReply);

        session.set_global("after", &Value::Int(3)).await.unwrap();
        assert_eq!(session.channel_state().await, ChannelState::Idle);
        assert_eq!(session.get_global("after").await.unwrap(), Value::Int(3));
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = in_process(MessageFormat::Cbor).await;
        let counter = session.call("Counter", vec![]).await.unwrap();
        session.close().await;
        session.close().await;
        assert!(session.is_closed());

        drop(counter);
        assert_eq!(session.pending_releases(), 0);
        assert!(matches!(session.get_global("x").await, Err(GraftError::Closed)));
    }

    #[tokio::test]
    async fn test_dead_remote_is_fatal() {
        let (master_end, remote_end) = tokio::io::duplex(1 << 16);
        let format = MessageFormat::Json;
        let peer = crate::peer::TaskPeer::spawn(
            async move {
                let mut transport = FramedTransport::new(remote_end, format);
                // Answer the handshake, then vanish mid-call
                let _: Request = transport.receive().await.unwrap();
                transport.send(&Response::Value { value: Wire::Nil }).await.unwrap();
                let _: Request = transport.receive().await.unwrap();
            },
            || {},
        );
        let session = Session::connect(master_end, peer, test_config(format))
            .await
            .unwrap();

        let err = session.get_global("x").await.unwrap_err();
        assert!(matches!(err, GraftError::RemoteDied { .. }), "{:?}", err);
        assert!(err.is_fatal());
        assert!(session.is_closed());
        session.close().await;
    }

    #[tokio::test]
    async fn test_foreign_proxy_is_rejected() {
        let first = in_process(MessageFormat::Cbor).await;
        let second = in_process(MessageFormat::Cbor).await;
        let counter = first.call("Counter", vec![]).await.unwrap();
        let err = second.call("identity", vec![counter]).await.unwrap_err();
        assert!(matches!(err, GraftError::Codec(CodecError::Reference(_))));
        first.close().await;
        second.close().await;
    }
}
