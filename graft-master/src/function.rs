//! Remote functions and namespaces

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use graft_core::{Handle, Value};
use graft_ipc::{CallTarget, AUTO_NARGOUT};

use crate::error::{GraftError, GraftResult};
use crate::proxy::RemoteRef;
use crate::session::{MasterKwargs, MasterValue, Session, SessionShared};

/// Something that can be called on the remote
#[async_trait]
pub trait Invocable: Send + Sync {
    /// Call with keyword arguments and an explicit output count
    async fn call_with(
        &self,
        args: Vec<MasterValue>,
        kwargs: MasterKwargs,
        nargout: i64,
    ) -> GraftResult<MasterValue>;

    /// Call with positional arguments; the remote picks the output count
    async fn call(&self, args: Vec<MasterValue>) -> GraftResult<MasterValue> {
        self.call_with(args, MasterKwargs::new(), AUTO_NARGOUT).await
    }

    /// Documentation, fetched on demand
    async fn help(&self) -> GraftResult<String>;
}

/// A remote function, either looked up by name on every call or held by
/// handle
#[derive(Clone)]
pub enum RemoteFunction {
    Named {
        name: String,
        session: Weak<SessionShared>,
    },
    Handle(Arc<RemoteRef>),
}

impl RemoteFunction {
    pub(crate) fn named(session: &Session, name: &str) -> Self {
        RemoteFunction::Named {
            name: name.to_string(),
            session: session.downgrade(),
        }
    }

    pub(crate) fn from_ref(reference: Arc<RemoteRef>) -> Self {
        RemoteFunction::Handle(reference)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            RemoteFunction::Named { name, .. } => Some(name),
            RemoteFunction::Handle(_) => None,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            RemoteFunction::Named { .. } => None,
            RemoteFunction::Handle(reference) => Some(reference.handle()),
        }
    }

    pub(crate) fn belongs_to(&self, session: &Session) -> bool {
        match self {
            RemoteFunction::Named { session: own, .. } => Weak::ptr_eq(own, &session.downgrade()),
            RemoteFunction::Handle(reference) => reference.belongs_to(session),
        }
    }

    fn session(&self) -> GraftResult<Session> {
        match self {
            RemoteFunction::Named { session, .. } => session
                .upgrade()
                .map(Session::from_shared)
                .ok_or(GraftError::Closed),
            RemoteFunction::Handle(reference) => reference.session(),
        }
    }

    fn target(&self) -> CallTarget {
        match self {
            RemoteFunction::Named { name, .. } => CallTarget::Name(name.clone()),
            RemoteFunction::Handle(reference) => CallTarget::Handle(reference.handle()),
        }
    }
}

#[async_trait]
impl Invocable for RemoteFunction {
    async fn call_with(
        &self,
        args: Vec<MasterValue>,
        kwargs: MasterKwargs,
        nargout: i64,
    ) -> GraftResult<MasterValue> {
        self.session()?
            .call_with(self.target(), args, kwargs, nargout)
            .await
    }

    async fn help(&self) -> GraftResult<String> {
        let session = self.session()?;
        match self {
            RemoteFunction::Named { name, .. } => session.help(name).await,
            RemoteFunction::Handle(_) => session.help_for(Value::Function(self.clone())).await,
        }
    }
}

impl PartialEq for RemoteFunction {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RemoteFunction::Named { name: a, .. }, RemoteFunction::Named { name: b, .. }) => a == b,
            (RemoteFunction::Handle(a), RemoteFunction::Handle(b)) => a.handle() == b.handle(),
            _ => false,
        }
    }
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFunction::Named { name, .. } => write!(f, "RemoteFunction({})", name),
            RemoteFunction::Handle(reference) => write!(f, "RemoteFunction(#{})", reference.handle()),
        }
    }
}

/// A group of remote functions addressed as `namespace.member`
#[derive(Clone)]
pub struct Namespace {
    name: String,
    session: Session,
}

impl Namespace {
    pub(crate) fn new(session: &Session, name: &str) -> Self {
        Self {
            name: name.to_string(),
            session: session.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member names as reported by the remote
    pub async fn members(&self) -> GraftResult<Vec<String>> {
        let listing = self
            .session
            .call("what", vec![Value::from(self.name.as_str())])
            .await?;
        match listing {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Str(member) => Ok(member),
                    other => Err(GraftError::Protocol(format!(
                        "namespace member is a {}, expected text",
                        other.kind()
                    ))),
                })
                .collect(),
            Value::Null => Ok(Vec::new()),
            other => Err(GraftError::Protocol(format!(
                "what returned a {}, expected a list",
                other.kind()
            ))),
        }
    }

    /// Function `member` of this namespace
    pub fn function(&self, member: &str) -> RemoteFunction {
        self.session.function(&format!("{}.{}", self.name, member))
    }

    pub async fn call(&self, member: &str, args: Vec<MasterValue>) -> GraftResult<MasterValue> {
        self.function(member).call(args).await
    }
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.name)
    }
}
