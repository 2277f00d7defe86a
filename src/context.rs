//! Per-request value propagation.
//!
//! A [`Context`] is created once per inbound request, threaded through the
//! interceptor chain and the handler, and discarded when the response is
//! finalized. Server-streaming handlers hold on to it across pushes until the
//! stream ends.

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

/// An immutable, copy-on-write carrier of request-scoped values.
///
/// Values are stored by type, like request extensions. `with_value` never
/// mutates the receiver: it returns a new `Context` whose entries structurally
/// share the old ones behind `Arc`, so concurrent requests can derive from a
/// common ancestor (the worker context) without ever sharing a mutable map.
///
/// ```
/// # use tenor::Context;
/// #[derive(Clone)]
/// struct RequestId(u64);
///
/// let root = Context::new();
/// let ctx = root.with_value(RequestId(7));
///
/// assert!(root.value::<RequestId>().is_none());
/// assert_eq!(ctx.value::<RequestId>().unwrap().0, 7);
/// ```
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Arc<Node>>,
}

struct Node {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    next: Option<Arc<Node>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a new context that additionally carries `value`.
    ///
    /// A later value of the same type shadows an earlier one; the earlier
    /// entry stays reachable from contexts derived before the shadowing.
    pub fn with_value<T: Send + Sync + 'static>(&self, value: T) -> Context {
        Context {
            head: Some(Arc::new(Node {
                key: TypeId::of::<T>(),
                value: Arc::new(value),
                next: self.head.clone(),
            })),
        }
    }

    /// Look up the most recently added value of type `T`.
    pub fn value<T: Send + Sync + 'static>(&self) -> Option<&T> {
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            if n.key == TypeId::of::<T>() {
                return n.value.downcast_ref();
            }
            node = n.next.as_deref();
        }
        None
    }

    /// Whether a value of type `T` is present.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.value::<T>().is_some()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut len = 0;
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            len += 1;
            node = n.next.as_deref();
        }
        f.debug_struct("Context").field("entries", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Peer(&'static str);

    #[derive(Debug, PartialEq)]
    struct Deadline(u32);

    #[test]
    fn empty_lookup() {
        let ctx = Context::new();
        assert!(ctx.value::<Peer>().is_none());
        assert!(!ctx.contains::<Peer>());
    }

    #[test]
    fn with_value_does_not_mutate_parent() {
        let parent = Context::new().with_value(Peer("a"));
        let child = parent.with_value(Deadline(30));

        assert!(parent.value::<Deadline>().is_none());
        assert_eq!(child.value::<Deadline>(), Some(&Deadline(30)));
        assert_eq!(child.value::<Peer>(), Some(&Peer("a")));
    }

    #[test]
    fn later_value_shadows_earlier() {
        let ctx = Context::new().with_value(Peer("a")).with_value(Peer("b"));
        assert_eq!(ctx.value::<Peer>(), Some(&Peer("b")));
    }

    #[test]
    fn siblings_are_isolated() {
        let root = Context::new().with_value(Peer("shared"));
        let a = root.with_value(Deadline(1));
        let b = root.with_value(Deadline(2));

        assert_eq!(a.value::<Deadline>(), Some(&Deadline(1)));
        assert_eq!(b.value::<Deadline>(), Some(&Deadline(2)));
        assert_eq!(a.value::<Peer>(), b.value::<Peer>());
    }
}
