//! # Capability Sets
//!
//! An exposed object is a named table from method name to async callable,
//! fixed when the object is built. The dispatcher never inspects application
//! types; it only looks names up in this table.
//!
//! ```rust,ignore
//! let duck_tester = Object::builder("DuckTester")
//!     .sync_method("is_it_a_duck", |args| {
//!         let obj = arg(&args, 0)?;
//!         Ok(Value::Bool(obj.get("quacks").and_then(Value::as_str) == Some("like a duck")))
//!     })
//!     .build();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::RemoteError;
use crate::value::Value;

/// What a method body resolves to.
pub type MethodResult = Result<Value, RemoteError>;

/// A dispatchable method: takes the decoded arguments, returns a future.
pub type Method = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

struct MethodEntry {
    func: Method,
    doc: Option<String>,
}

struct Capabilities {
    type_name: String,
    doc: Option<String>,
    methods: HashMap<String, MethodEntry>,
}

/// A shared handle to a capability set.
///
/// Clones refer to the same object; identity (and therefore the ObjectId it is
/// exported under) follows the handle, not the contents.
#[derive(Clone)]
pub struct Object {
    inner: Arc<Capabilities>,
}

/// A non-owning handle, used to observe when an object has been reclaimed.
#[derive(Clone)]
pub struct WeakObject {
    inner: Weak<Capabilities>,
}

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.inner.upgrade().map(|inner| Object { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl Object {
    pub fn builder(type_name: impl Into<String>) -> ObjectBuilder {
        ObjectBuilder {
            caps: Capabilities {
                type_name: type_name.into(),
                doc: None,
                methods: HashMap::new(),
            },
        }
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn doc(&self) -> Option<&str> {
        self.inner.doc.as_deref()
    }

    pub fn method_doc(&self, method: &str) -> Option<&str> {
        self.inner.methods.get(method).and_then(|m| m.doc.as_deref())
    }

    /// Method names in sorted order.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.contains_key(name)
    }

    pub(crate) fn method(&self, name: &str) -> Option<&Method> {
        self.inner.methods.get(name).map(|m| &m.func)
    }

    pub fn ptr_eq(a: &Object, b: &Object) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Identity key; stable while any handle is alive.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject { inner: Arc::downgrade(&self.inner) }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Object({}@{:#x})", self.inner.type_name, self.addr())
    }
}

pub struct ObjectBuilder {
    caps: Capabilities,
}

impl ObjectBuilder {
    /// Describes the object for `_help`.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.caps.doc = Some(doc.into());
        self
    }

    /// Adds an async method.
    pub fn method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.insert(name.into(), None, Arc::new(move |args| f(args).boxed()))
    }

    /// Adds an async method with a description for `_help`.
    pub fn method_with_doc<F, Fut>(self, name: impl Into<String>, doc: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.insert(name.into(), Some(doc.into()), Arc::new(move |args| f(args).boxed()))
    }

    /// Adds a method whose body completes without suspending.
    pub fn sync_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        self.insert(name.into(), None, Arc::new(move |args| {
            let out = f(args);
            async move { out }.boxed()
        }))
    }

    fn insert(mut self, name: String, doc: Option<String>, func: Method) -> Self {
        self.caps.methods.insert(name, MethodEntry { func, doc });
        self
    }

    pub fn build(self) -> Object {
        Object { inner: Arc::new(self.caps) }
    }
}

/// Fetches argument `index`, failing the call if the caller passed too few.
pub fn arg(args: &[Value], index: usize) -> Result<&Value, RemoteError> {
    args.get(index).ok_or_else(|| {
        RemoteError::invocation(format!(
            "expected at least {} argument(s), got {}", index + 1, args.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> Object {
        Object::builder("Counter")
            .doc("counts things")
            .method_with_doc("add", "adds two integers", |args| async move {
                let a = arg(&args, 0).map(|v| v.as_i64().unwrap_or_default());
                let b = arg(&args, 1).map(|v| v.as_i64().unwrap_or_default());
                match (a, b) {
                    (Ok(a), Ok(b)) => Ok(Value::Int(a + b)),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            })
            .sync_method("zero", |_| Ok(Value::Int(0)))
            .build()
    }

    #[tokio::test]
    async fn test_methods_are_callable_by_name() {
        let obj = counter();
        let add = obj.method("add").expect("add exists");
        let out = add(vec![Value::Int(2), Value::Int(40)]).await.unwrap();
        assert_eq!(out, Value::Int(42));

        let zero = obj.method("zero").expect("zero exists");
        assert_eq!(zero(vec![]).await.unwrap(), Value::Int(0));
        assert!(obj.method("quack").is_none());
    }

    #[tokio::test]
    async fn test_missing_argument_is_invocation_error() {
        let obj = counter();
        let add = obj.method("add").unwrap();
        let err = add(vec![Value::Int(1)]).await.unwrap_err();
        assert_eq!(err.kind, ternwire::ErrorKind::Invocation);
    }

    #[test]
    fn test_reflection() {
        let obj = counter();
        assert_eq!(obj.type_name(), "Counter");
        assert_eq!(obj.method_names(), vec!["add", "zero"]);
        assert_eq!(obj.doc(), Some("counts things"));
        assert_eq!(obj.method_doc("add"), Some("adds two integers"));
        assert_eq!(obj.method_doc("zero"), None);
    }

    #[test]
    fn test_identity_follows_handle() {
        let a = counter();
        let b = a.clone();
        let c = counter();
        assert!(Object::ptr_eq(&a, &b));
        assert!(!Object::ptr_eq(&a, &c));

        let weak = c.downgrade();
        assert!(weak.is_alive());
        drop(c);
        assert!(!weak.is_alive());
    }
}
