//! Proxy objects
//!
//! A [`ProxyObject`] stands in for an object living in the remote. It holds
//! no state of its own: field access and method calls go through the
//! session. Clones share one [`RemoteRef`], and the session hands out the
//! same reference whenever it decodes the same handle, so a remote handle is
//! released exactly once, after the last clone is dropped.

use std::fmt;
use std::sync::{Arc, LazyLock, Weak};

use async_trait::async_trait;
use graft_core::{Handle, Value};
use graft_ipc::{identifiers, CallTarget};
use regex::Regex;

use crate::error::{GraftError, GraftResult, RemoteError};
use crate::function::Invocable;
use crate::session::{MasterKwargs, MasterValue, Session, SessionShared};

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?a\b[^>]*>").expect("markup pattern must compile"));

/// Ownership of one remote handle; dropping the last one queues a release
pub struct RemoteRef {
    handle: Handle,
    session: Weak<SessionShared>,
}

impl RemoteRef {
    pub(crate) fn new(handle: Handle, session: Weak<SessionShared>) -> Self {
        Self { handle, session }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn session(&self) -> GraftResult<Session> {
        self.session
            .upgrade()
            .map(Session::from_shared)
            .ok_or(GraftError::Closed)
    }

    pub(crate) fn belongs_to(&self, session: &Session) -> bool {
        Weak::ptr_eq(&self.session, &session.downgrade())
    }
}

impl Drop for RemoteRef {
    fn drop(&mut self) {
        if let Some(shared) = self.session.upgrade() {
            shared.release_later(self.handle, self as *const RemoteRef);
        }
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteRef({})", self.handle)
    }
}

/// What a name refers to on a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Property,
    Method,
    Undefined,
}

/// Result of reading a member: a property value, or a method to call
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Property(MasterValue),
    Method(BoundMethod),
}

/// Local stand-in for a remote object
#[derive(Clone)]
pub struct ProxyObject {
    inner: Arc<RemoteRef>,
}

impl ProxyObject {
    pub(crate) fn from_ref(inner: Arc<RemoteRef>) -> Self {
        Self { inner }
    }

    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    pub(crate) fn belongs_to(&self, session: &Session) -> bool {
        self.inner.belongs_to(session)
    }

    /// Whether `name` is a property, a method, or neither
    pub async fn capability(&self, name: &str) -> GraftResult<Capability> {
        let session = self.inner.session()?;
        let answer = session
            .call("capability", vec![self.value(), Value::from(name)])
            .await?;
        Ok(match answer.as_str() {
            Some("property") => Capability::Property,
            Some("method") => Capability::Method,
            _ => Capability::Undefined,
        })
    }

    /// Read a property
    pub async fn get_field(&self, name: &str) -> GraftResult<MasterValue> {
        self.inner.session()?.get_proxy(self.handle(), name).await
    }

    /// Assign a property
    pub async fn set_field(&self, name: &str, value: &MasterValue) -> GraftResult<()> {
        self.inner.session()?.set_proxy(self.handle(), name, value).await
    }

    /// Attribute-style access: a property's value, or a bound method
    pub async fn member(&self, name: &str) -> GraftResult<Member> {
        match self.capability(name).await? {
            Capability::Property => Ok(Member::Property(self.get_field(name).await?)),
            Capability::Method => Ok(Member::Method(self.method(name))),
            Capability::Undefined => Err(RemoteError::new(
                identifiers::NO_PROPERTY,
                format!("Remote object {} has no member '{}'", self.handle(), name),
            )
            .into()),
        }
    }

    /// Method bound to this object, without asking the remote first
    pub fn method(&self, name: &str) -> BoundMethod {
        BoundMethod {
            object: self.clone(),
            name: name.to_string(),
        }
    }

    /// Call a method with positional arguments
    pub async fn invoke(&self, method: &str, args: Vec<MasterValue>) -> GraftResult<MasterValue> {
        self.method(method).call(args).await
    }

    /// Class of the remote object
    pub async fn class_name(&self) -> GraftResult<String> {
        match self.inner.session()?.call("class", vec![self.value()]).await? {
            Value::Str(name) => Ok(name),
            other => Err(GraftError::Protocol(format!(
                "class returned a {}, expected text",
                other.kind()
            ))),
        }
    }

    /// The remote's display form with hyperlink markup removed
    pub async fn render(&self) -> GraftResult<String> {
        match self.inner.session()?.call("display", vec![self.value()]).await? {
            Value::Str(text) => Ok(strip_markup(&text)),
            other => Err(GraftError::Protocol(format!(
                "display returned a {}, expected text",
                other.kind()
            ))),
        }
    }

    /// Give up this reference and send the release now if it was the last
    pub async fn close(self) -> GraftResult<()> {
        let session = self.inner.session().ok();
        drop(self);
        match session {
            Some(session) => session.flush_releases().await,
            None => Ok(()),
        }
    }

    fn value(&self) -> MasterValue {
        Value::Object(self.clone())
    }
}

impl PartialEq for ProxyObject {
    fn eq(&self, other: &Self) -> bool {
        self.handle() == other.handle()
    }
}

impl fmt::Debug for ProxyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyObject({})", self.handle())
    }
}

/// A method of a remote object, ready to call
#[derive(Debug, Clone, PartialEq)]
pub struct BoundMethod {
    object: ProxyObject,
    name: String,
}

impl BoundMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object(&self) -> &ProxyObject {
        &self.object
    }
}

#[async_trait]
impl Invocable for BoundMethod {
    async fn call_with(
        &self,
        args: Vec<MasterValue>,
        kwargs: MasterKwargs,
        nargout: i64,
    ) -> GraftResult<MasterValue> {
        let session = self.object.inner.session()?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(self.object.value());
        full.extend(args);
        session
            .call_with(CallTarget::from(self.name.as_str()), full, kwargs, nargout)
            .await
    }

    async fn help(&self) -> GraftResult<String> {
        let class = self.object.class_name().await?;
        self.object
            .inner
            .session()?
            .help(&format!("{}.{}", class, self.name))
            .await
    }
}

/// Remove `<a ...>` and `</a>` tags from remote display text
pub fn strip_markup(text: &str) -> String {
    MARKUP.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::in_process;
    use graft_core::MessageFormat;

    fn object(value: MasterValue) -> ProxyObject {
        match value {
            Value::Object(object) => object,
            other => panic!("expected an object, got {:?}", other),
        }
    }

    #[test]
    fn test_strip_markup() {
        let text = "  <a href=\"matlab:helpPopup Counter\" style=\"font-weight:bold\">Counter</a> with properties:";
        assert_eq!(strip_markup(text), "  Counter with properties:");
        assert_eq!(strip_markup("a < b and <abbr>"), "a < b and <abbr>");
    }

    #[tokio::test]
    async fn test_members_of_a_counter() {
        let session = in_process(MessageFormat::Cbor).await;
        let counter = object(session.call("Counter", vec![Value::Int(2)]).await.unwrap());

        assert_eq!(counter.capability("count").await.unwrap(), Capability::Property);
        assert_eq!(counter.capability("increment").await.unwrap(), Capability::Method);
        assert_eq!(counter.capability("nope").await.unwrap(), Capability::Undefined);

        let Member::Method(increment) = counter.member("increment").await.unwrap() else {
            panic!("expected a method");
        };
        assert_eq!(increment.call(vec![]).await.unwrap(), Value::Float(2.0));
        assert_eq!(
            increment.call(vec![Value::Float(0.5)]).await.unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            counter.member("count").await.unwrap(),
            Member::Property(Value::Float(2.5))
        );
        assert!(counter.member("nope").await.unwrap_err().is_lookup());
        assert!(increment.help().await.unwrap().starts_with("increment(by)"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_fields_class_and_render() {
        let session = in_process(MessageFormat::Json).await;
        let counter = object(session.call("Counter", vec![]).await.unwrap());

        counter.set_field("count", &Value::Int(41)).await.unwrap();
        counter.invoke("increment", vec![]).await.unwrap();
        assert_eq!(counter.get_field("count").await.unwrap(), Value::Float(42.0));
        assert!(counter.get_field("missing").await.unwrap_err().is_lookup());

        assert_eq!(counter.class_name().await.unwrap(), "Counter");
        let shown = counter.render().await.unwrap();
        assert!(shown.contains("Counter with properties:"));
        assert!(shown.contains("count: 42"));
        assert!(!shown.contains("<a"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_copies_are_distinct_objects() {
        let session = in_process(MessageFormat::Cbor).await;
        let counter = object(session.call("Counter", vec![]).await.unwrap());
        let copy = object(counter.invoke("copy", vec![]).await.unwrap());
        assert_ne!(copy, counter);

        copy.invoke("increment", vec![]).await.unwrap();
        assert_eq!(counter.get_field("count").await.unwrap(), Value::Float(0.0));
        assert_eq!(session.live_references(), 2);

        copy.close().await.unwrap();
        assert_eq!(session.live_references(), 1);
        assert_eq!(session.pending_releases(), 0);
        session.close().await;
    }
}
