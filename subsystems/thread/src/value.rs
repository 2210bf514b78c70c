//! # Runtime Values
//!
//! Opaque handles for collaborators the thread subsystem transports but does
//! not interpret: object references, exceptions, symbols and callables.

use crate::context::ExecutionContext;
use crate::ThreadError;
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Opaque reference to a managed object
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wrap a host value
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Borrow the wrapped value if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Object identity of the referenced value
    pub fn id(&self) -> ObjectId {
        ObjectId(Arc::as_ptr(&self.0) as *const () as usize)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&self.id()).finish()
    }
}

/// Identity of a managed object (its address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Identity of any referenced object
    pub fn of<T: ?Sized>(object: &T) -> Self {
        Self(object as *const T as *const () as usize)
    }

    /// Raw address
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Interned-style symbolic key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(Arc<str>);

impl Symbol {
    /// Create a symbol
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// Symbol name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// Opaque exception object
///
/// Equality is identity: two exceptions are equal only if they are the same
/// object, which is what a joiner needs to confirm it received the exception
/// the thread raised.
#[derive(Clone)]
pub struct Exception(Arc<ExceptionInner>);

struct ExceptionInner {
    class: Cow<'static, str>,
    message: String,
    payload: Option<Value>,
}

impl Exception {
    /// Create an exception
    pub fn new(class: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self(Arc::new(ExceptionInner {
            class: class.into(),
            message: message.into(),
            payload: None,
        }))
    }

    /// Create an exception carrying a managed object
    pub fn with_payload(
        class: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self(Arc::new(ExceptionInner {
            class: class.into(),
            message: message.into(),
            payload: Some(payload),
        }))
    }

    /// Build the exception recorded for a panicking thread body
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            String::from("thread panicked")
        };
        Self::new("fatal", message)
    }

    /// Exception class name
    pub fn class(&self) -> &str {
        &self.0.class
    }

    /// Exception message
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// Attached managed object, if any
    pub fn payload(&self) -> Option<&Value> {
        self.0.payload.as_ref()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Exception) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Exception {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Exception {}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("class", &self.class())
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class(), self.message())
    }
}

impl From<ThreadError> for Exception {
    fn from(err: ThreadError) -> Self {
        Exception::new("ThreadError", err.to_string())
    }
}

/// Non-local exit out of a thread body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwind {
    /// An exception is propagating
    Raise(Exception),
    /// The thread was killed
    Kill,
}

impl From<Exception> for Unwind {
    fn from(exception: Exception) -> Self {
        Unwind::Raise(exception)
    }
}

impl From<ThreadError> for Unwind {
    fn from(err: ThreadError) -> Self {
        Unwind::Raise(err.into())
    }
}

/// The callable a thread runs
pub type Block =
    Arc<dyn Fn(&ExecutionContext, &[Value]) -> Result<Value, Unwind> + Send + Sync + 'static>;

/// Wrap a closure as a [`Block`]
pub fn block<F>(f: F) -> Block
where
    F: Fn(&ExecutionContext, &[Value]) -> Result<Value, Unwind> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// How a thread ended
#[derive(Debug, Clone)]
pub enum Termination {
    /// The body returned normally
    Returned(Value),
    /// The body raised
    Raised(Exception),
    /// The thread honored a kill request
    Killed,
}

impl Termination {
    /// Return value, if the body returned normally
    pub fn value(&self) -> Option<&Value> {
        match self {
            Termination::Returned(value) => Some(value),
            _ => None,
        }
    }

    /// Terminating exception, if the body raised
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Termination::Raised(exception) => Some(exception),
            _ => None,
        }
    }

    /// Check if the thread was killed
    pub fn is_killed(&self) -> bool {
        matches!(self, Termination::Killed)
    }
}

impl From<Result<Value, Unwind>> for Termination {
    fn from(result: Result<Value, Unwind>) -> Self {
        match result {
            Ok(value) => Termination::Returned(value),
            Err(Unwind::Raise(exception)) => Termination::Raised(exception),
            Err(Unwind::Kill) => Termination::Killed,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
