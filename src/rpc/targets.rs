//! Registry of remote targets and the proxies addressing them.

use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

use calliope_client_api_proto::{Functor, TargetId};
use derive_more::Display;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use tracerr::Traced;

use crate::rpc::CallError;

/// Injected send closure turning a `(target, functor)` pair into an
/// in-flight call on the owning connection.
pub type SendFn = Rc<
    dyn Fn(
        TargetId,
        Functor,
    ) -> LocalBoxFuture<'static, Result<Reply, Traced<CallError>>>,
>;

/// Resolved result of a call.
#[derive(Debug)]
pub enum Reply {
    /// Plain data value.
    Value(Value),

    /// The server answered with a [`Remote`] sentinel, materialized into a
    /// registered proxy.
    ///
    /// [`Remote`]: calliope_client_api_proto::Remote
    Target(TargetProxy),
}

impl Reply {
    /// Unwraps this [`Reply`] into its plain data value.
    ///
    /// # Errors
    ///
    /// With [`CallError::InvalidReply`] if the server answered with a proxy.
    pub fn into_value(self) -> Result<Value, Traced<CallError>> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Target(proxy) => Err(tracerr::new!(CallError::InvalidReply(
                format!("expected a value, got target {}", proxy.id()),
            ))),
        }
    }

    /// Unwraps this [`Reply`] into a target proxy.
    ///
    /// # Errors
    ///
    /// With [`CallError::InvalidReply`] if the server answered with plain
    /// data.
    pub fn into_target(self) -> Result<TargetProxy, Traced<CallError>> {
        match self {
            Self::Target(proxy) => Ok(proxy),
            Self::Value(value) => Err(tracerr::new!(CallError::InvalidReply(
                format!("expected a target, got value {}", value),
            ))),
        }
    }
}

struct ProxyInner {
    /// Target this proxy addresses.
    id: TargetId,

    /// Connection send hook.
    send: SendFn,
}

/// Call-forwarding handle for one remote target.
///
/// Invoking [`TargetProxy::call`] produces a [`Functor`] send on the
/// connection the owning [`Targets`] registry was built around.
#[derive(Clone)]
pub struct TargetProxy(Rc<ProxyInner>);

impl TargetProxy {
    /// Returns the id of the target this proxy addresses.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &TargetId {
        &self.0.id
    }

    /// Invokes the named method on the remote target.
    pub fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> LocalBoxFuture<'static, Result<Reply, Traced<CallError>>> {
        (self.0.send)(self.0.id.clone(), Functor::new(method, args))
    }

    /// Indicates whether `self` and `other` are the same proxy object.
    fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TargetProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TargetProxy").field(&self.0.id).finish()
    }
}

/// Attempt to bind a target id that is already bound.
#[derive(Clone, Debug, Display, PartialEq)]
#[display(fmt = "target {} is already bound", _0)]
pub struct AlreadyBoundError(pub TargetId);

/// Attempt to look up a target id that is not bound.
#[derive(Clone, Debug, Display, PartialEq)]
#[display(fmt = "target {} is not bound", _0)]
pub struct UnboundError(pub TargetId);

/// Registry of the targets known to one connection.
pub struct Targets {
    /// Send hook shared by every proxy this registry creates.
    send: SendFn,

    /// Bound proxies, keyed by target id.
    proxies: RefCell<HashMap<TargetId, TargetProxy>>,
}

impl Targets {
    /// Creates a new empty registry around the given send hook.
    #[must_use]
    pub fn new(send: SendFn) -> Self {
        Self {
            send,
            proxies: RefCell::new(HashMap::new()),
        }
    }

    /// Binds a new proxy for the given id.
    ///
    /// # Errors
    ///
    /// With [`AlreadyBoundError`] if the id is bound already.
    pub fn add(&self, id: TargetId) -> Result<TargetProxy, AlreadyBoundError> {
        let mut proxies = self.proxies.borrow_mut();
        if proxies.contains_key(&id) {
            return Err(AlreadyBoundError(id));
        }
        let proxy = TargetProxy(Rc::new(ProxyInner {
            id: id.clone(),
            send: Rc::clone(&self.send),
        }));
        drop(proxies.insert(id, proxy.clone()));
        Ok(proxy)
    }

    /// Returns the proxy bound to the given id, binding a fresh one if
    /// needed.
    #[must_use]
    pub fn add_or_get(&self, id: TargetId) -> TargetProxy {
        if let Some(proxy) = self.get_or_null(&id) {
            return proxy;
        }
        let proxy = TargetProxy(Rc::new(ProxyInner {
            id: id.clone(),
            send: Rc::clone(&self.send),
        }));
        drop(self.proxies.borrow_mut().insert(id, proxy.clone()));
        proxy
    }

    /// Returns the proxy bound to the given id.
    ///
    /// # Errors
    ///
    /// With [`UnboundError`] if the id is not bound.
    pub fn get(&self, id: &TargetId) -> Result<TargetProxy, UnboundError> {
        self.get_or_null(id).ok_or_else(|| UnboundError(id.clone()))
    }

    /// Returns the proxy bound to the given id, or [`None`].
    #[must_use]
    pub fn get_or_null(&self, id: &TargetId) -> Option<TargetProxy> {
        self.proxies.borrow().get(id).cloned()
    }

    /// Indicates whether the given id is bound.
    #[must_use]
    pub fn contains(&self, id: &TargetId) -> bool {
        self.proxies.borrow().contains_key(id)
    }

    /// Indicates whether the given proxy object is the one currently bound
    /// in this registry.
    ///
    /// A proxy left over from before a connection reset answers `false`
    /// here even when its id has been re-bound since.
    #[must_use]
    pub fn handles(&self, proxy: &TargetProxy) -> bool {
        self.get_or_null(proxy.id())
            .map_or(false, |bound| bound.ptr_eq(proxy))
    }

    /// Unbinds every target.
    pub fn clear(&self) {
        self.proxies.borrow_mut().clear();
    }
}

#[cfg(test)]
mod test {
    use futures::future;

    use super::*;

    fn registry() -> Targets {
        Targets::new(Rc::new(|_, _| {
            Box::pin(future::ok(Reply::Value(Value::Null)))
        }))
    }

    #[test]
    fn add_rejects_bound_ids() {
        let targets = registry();
        let id = TargetId::from("meta");

        assert!(targets.add(id.clone()).is_ok());
        assert_eq!(targets.add(id.clone()).unwrap_err(), AlreadyBoundError(id));
    }

    #[test]
    fn get_distinguishes_bound_from_unbound() {
        let targets = registry();
        let id = TargetId::from("author");

        assert_eq!(targets.get(&id).unwrap_err(), UnboundError(id.clone()));
        drop(targets.add_or_get(id.clone()));
        assert!(targets.get(&id).is_ok());
    }

    #[test]
    fn add_or_get_reuses_the_bound_proxy() {
        let targets = registry();
        let id = TargetId::from("s-1");

        let first = targets.add_or_get(id.clone());
        let second = targets.add_or_get(id);
        assert!(first.ptr_eq(&second));
    }

    #[test]
    fn handles_is_identity_not_id_equality() {
        let targets = registry();
        let id = TargetId::from("s-1");

        let proxy = targets.add_or_get(id.clone());
        assert!(targets.handles(&proxy));

        targets.clear();
        assert!(!targets.handles(&proxy));

        // Same id, different binding epoch.
        let rebound = targets.add_or_get(id);
        assert!(targets.handles(&rebound));
        assert!(!targets.handles(&proxy));
    }
}
