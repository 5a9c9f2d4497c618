//! Local objects exposed to peers.
//!
//! Anything implementing [`Context`] can be attached to a [`Router`] and
//! used by connected peers. [`ContextBuilder`] assembles a context out of
//! closures for the common case where a dedicated type is overkill.
//!
//! [`Router`]: crate::router::Router

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use protocol::{Capabilities, Capability, ProtocolError, RemoteError, RemoteErrorKind, Result, Value};

/// Boxed future returned by object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of invoking a method or reading a property.
pub enum Output {
    /// Plain value sent back as-is.
    Value(Value),
    /// Another local object; the router exposes it to the caller as a
    /// child definition.
    Context(Arc<dyn Context>),
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Output::Context(ctx) => f.debug_tuple("Context").field(&ctx.name()).finish(),
        }
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Value(value)
    }
}

/// An object that can be exposed to remote peers.
///
/// The capability map returned by [`Context::capabilities`] is copied when
/// the context is attached; members not listed there are unreachable.
pub trait Context: Send + Sync + 'static {
    /// Name used for child definitions created from this object.
    fn name(&self) -> String {
        "context".to_string()
    }

    /// Free-form description published with the definition.
    fn description(&self) -> String {
        String::new()
    }

    /// Members and how they may be used.
    fn capabilities(&self) -> Capabilities;

    /// Invoke a method.
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Output>>;

    /// Read a property.
    fn read<'a>(&'a self, property: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Output>>;

    /// Write a property.
    fn write<'a>(&'a self, property: &'a str, value: Value) -> BoxFuture<'a, Result<()>>;
}

/// Whether two handles point at the same object.
///
/// Compares data pointers only; vtable pointers for the same type may
/// differ between codegen units.
pub fn same_object(a: &Arc<dyn Context>, b: &Arc<dyn Context>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Error a context returns when its own logic fails.
pub fn failure(message: impl Into<String>) -> ProtocolError {
    ProtocolError::Remote(RemoteError::new(RemoteErrorKind::Internal, message))
}

/// Error a context returns when called with unusable arguments.
pub fn invalid_argument(message: impl Into<String>) -> ProtocolError {
    ProtocolError::Remote(RemoteError::new(RemoteErrorKind::InvalidArgument, message))
}

type MethodFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Output>> + Send + Sync>;
type ReaderFn = Arc<dyn Fn() -> Result<Value> + Send + Sync>;
type WriterFn = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

enum Member {
    Method(MethodFn),
    Property {
        reader: ReaderFn,
        writer: Option<WriterFn>,
    },
}

/// Builds a [`Context`] from closures.
///
/// ```
/// use node::context::{Context, ContextBuilder};
/// use protocol::{Capability, Value};
///
/// let ctx = ContextBuilder::new("greeter")
///     .sync_method("hello", |args| {
///         let who = args.first().and_then(Value::as_str).unwrap_or("world");
///         Ok(Value::from(format!("hello, {}", who)))
///     })
///     .readonly("version", || Ok(Value::from("1.0")))
///     .build();
/// assert_eq!(ctx.capabilities()["version"], Capability::readonly());
/// ```
pub struct ContextBuilder {
    name: String,
    description: String,
    members: BTreeMap<String, Member>,
}

impl ContextBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            members: BTreeMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add an async method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output>> + Send + 'static,
    {
        let method: MethodFn =
            Arc::new(move |args| -> BoxFuture<'static, Result<Output>> { Box::pin(f(args)) });
        self.members.insert(name.into(), Member::Method(method));
        self
    }

    /// Add a method that computes its value synchronously.
    pub fn sync_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.method(name, move |args| {
            let result = f(args).map(Output::Value);
            async move { result }
        })
    }

    /// Add a read-only property.
    pub fn readonly<R>(mut self, name: impl Into<String>, reader: R) -> Self
    where
        R: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        self.members.insert(
            name.into(),
            Member::Property {
                reader: Arc::new(reader),
                writer: None,
            },
        );
        self
    }

    /// Add a writable property backed by custom accessors.
    pub fn property<R, W>(mut self, name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: Fn() -> Result<Value> + Send + Sync + 'static,
        W: Fn(Value) -> Result<()> + Send + Sync + 'static,
    {
        self.members.insert(
            name.into(),
            Member::Property {
                reader: Arc::new(reader),
                writer: Some(Arc::new(writer)),
            },
        );
        self
    }

    /// Add a writable property that simply stores the last value written.
    pub fn stored(self, name: impl Into<String>, initial: Value) -> Self {
        let cell = Arc::new(Mutex::new(initial));
        let read_cell = Arc::clone(&cell);
        self.property(
            name,
            move || {
                let guard = read_cell.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(guard.clone())
            },
            move |value| {
                *cell.lock().unwrap_or_else(PoisonError::into_inner) = value;
                Ok(())
            },
        )
    }

    pub fn build(self) -> Arc<FnContext> {
        Arc::new(FnContext {
            name: self.name,
            description: self.description,
            members: self.members,
        })
    }
}

/// Context assembled by [`ContextBuilder`].
pub struct FnContext {
    name: String,
    description: String,
    members: BTreeMap<String, Member>,
}

impl FnContext {
    fn member(&self, name: &str) -> Result<&Member> {
        self.members
            .get(name)
            .ok_or_else(|| ProtocolError::NotExists(format!("member '{}'", name)))
    }
}

impl Context for FnContext {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.members
            .iter()
            .map(|(name, member)| {
                let cap = match member {
                    Member::Method(_) => Capability::Method,
                    Member::Property { writer, .. } => Capability::Property {
                        readonly: writer.is_none(),
                    },
                };
                (name.clone(), cap)
            })
            .collect()
    }

    fn invoke<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Output>> {
        Box::pin(async move {
            match self.member(method)? {
                Member::Method(f) => f(args).await,
                Member::Property { .. } => Err(ProtocolError::InvalidAccess(format!(
                    "'{}' is a property",
                    method
                ))),
            }
        })
    }

    fn read<'a>(&'a self, property: &'a str, _args: Vec<Value>) -> BoxFuture<'a, Result<Output>> {
        Box::pin(async move {
            match self.member(property)? {
                Member::Property { reader, .. } => reader().map(Output::Value),
                Member::Method(_) => Err(ProtocolError::InvalidAccess(format!(
                    "'{}' is a method",
                    property
                ))),
            }
        })
    }

    fn write<'a>(&'a self, property: &'a str, value: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.member(property)? {
                Member::Property {
                    writer: Some(writer),
                    ..
                } => writer(value),
                _ => Err(ProtocolError::InvalidAccess(format!(
                    "'{}' is not writable",
                    property
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<FnContext> {
        ContextBuilder::new("sample")
            .description("test object")
            .sync_method("add", |args| {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(Value::Int(sum))
            })
            .readonly("version", || Ok(Value::from("1.2.3")))
            .stored("label", Value::from("initial"))
            .build()
    }

    fn expect_value(output: Output) -> Value {
        match output {
            Output::Value(v) => v,
            Output::Context(_) => panic!("expected a plain value"),
        }
    }

    #[test]
    fn test_capabilities_reflect_members() {
        let ctx = sample();
        let caps = ctx.capabilities();
        assert_eq!(caps["add"], Capability::Method);
        assert_eq!(caps["version"], Capability::readonly());
        assert_eq!(caps["label"], Capability::property());
        assert_eq!(ctx.name(), "sample");
        assert_eq!(ctx.description(), "test object");
    }

    #[tokio::test]
    async fn test_invoke_method() {
        let ctx = sample();
        let out = ctx
            .invoke("add", vec![Value::Int(1), Value::UInt(2)])
            .await
            .unwrap();
        assert_eq!(expect_value(out), Value::Int(3));
    }

    #[tokio::test]
    async fn test_stored_property_write_then_read() {
        let ctx = sample();
        ctx.write("label", Value::from("changed")).await.unwrap();
        let out = ctx.read("label", vec![]).await.unwrap();
        assert_eq!(expect_value(out), Value::from("changed"));
    }

    #[tokio::test]
    async fn test_readonly_property_rejects_write() {
        let ctx = sample();
        let err = ctx.write("version", Value::Null).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAccess(_)));
    }

    #[tokio::test]
    async fn test_unknown_member() {
        let ctx = sample();
        assert!(matches!(
            ctx.invoke("nope", vec![]).await,
            Err(ProtocolError::NotExists(_))
        ));
    }

    #[tokio::test]
    async fn test_async_method_can_return_context() {
        let child = sample();
        let ctx = ContextBuilder::new("parent")
            .method("child", move |_| {
                let child: Arc<dyn Context> = child.clone();
                async move { Ok(Output::Context(child)) }
            })
            .build();
        let out = ctx.invoke("child", vec![]).await.unwrap();
        assert!(matches!(out, Output::Context(c) if c.name() == "sample"));
    }

    #[test]
    fn test_same_object() {
        let a: Arc<dyn Context> = sample();
        let b: Arc<dyn Context> = sample();
        let a2 = Arc::clone(&a);
        assert!(same_object(&a, &a2));
        assert!(!same_object(&a, &b));
    }
}
