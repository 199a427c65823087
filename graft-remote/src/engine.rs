//! Engine and native object interfaces
//!
//! An [`Engine`] is the evaluation environment the remote exposes: global
//! variables and callable functions. Objects it hands out implement
//! [`NativeObject`] and are kept alive in the handle table while the master
//! holds a proxy for them.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use graft_core::{DType, Value};
use tokio::sync::mpsc;

use crate::error::{RemoteFailure, RemoteResult};

/// Value as seen by the remote
pub type RemoteValue = Value<ObjectRef, FunctionRef>;

/// Keyword arguments of a call
pub type Kwargs = BTreeMap<String, RemoteValue>;

/// A native object that can be handed to the master by reference
pub trait NativeObject: Send + Sync + fmt::Debug {
    fn class_name(&self) -> &str;

    fn properties(&self) -> Vec<String>;

    fn methods(&self) -> Vec<String>;

    fn get_property(&self, name: &str) -> RemoteResult<RemoteValue>;

    fn set_property(&self, name: &str, value: RemoteValue) -> RemoteResult<()>;

    /// `args` excludes the object itself
    fn call_method(
        &self,
        ctx: &CallContext,
        name: &str,
        args: Vec<RemoteValue>,
        nargout: i64,
    ) -> RemoteResult<RemoteValue>;

    /// Native display form; may contain hyperlink markup
    fn display(&self) -> String;
}

/// Shared reference to a native object; equal only to itself
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn NativeObject>);

impl ObjectRef {
    pub fn new(object: impl NativeObject + 'static) -> Self {
        Self(Arc::new(object))
    }

    /// Stable identity while the object is alive
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.0.properties().iter().any(|p| p == name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.0.methods().iter().any(|m| m == name)
    }
}

impl std::ops::Deref for ObjectRef {
    type Target = dyn NativeObject;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}@{:#x})", self.0.class_name(), self.address())
    }
}

/// Reference to a function, resolved by name when called
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    name: String,
}

impl FunctionRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Interrupt flag set from the signal handler and polled by long calls
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Lower the flag, reporting whether it was up
    pub fn clear(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with an interrupt error if the flag is up
    #[track_caller]
    pub fn check(&self) -> RemoteResult<()> {
        if self.is_raised() {
            Err(RemoteFailure::interrupted())
        } else {
            Ok(())
        }
    }
}

/// Where printed output goes
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Process stdout, echoed by the master
    #[default]
    Stdout,
    /// In-process consumer
    Channel(mpsc::UnboundedSender<String>),
}

/// Per-call environment handed to engines and objects
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    interrupt: InterruptFlag,
    output: OutputSink,
}

impl CallContext {
    pub fn new(interrupt: InterruptFlag, output: OutputSink) -> Self {
        Self { interrupt, output }
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Print one line of program output
    pub fn print(&self, line: &str) {
        match &self.output {
            OutputSink::Stdout => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{}", line);
                let _ = stdout.flush();
            }
            OutputSink::Channel(tx) => {
                let _ = tx.send(line.to_string());
            }
        }
    }
}

/// Evaluation environment served by the remote runtime
#[async_trait]
pub trait Engine: Send {
    fn get_global(&self, name: &str) -> RemoteResult<RemoteValue>;

    fn set_global(&mut self, name: &str, value: RemoteValue) -> RemoteResult<()>;

    fn has_function(&self, name: &str) -> bool;

    /// Call a function. With `nargout > 1` the result is a list of exactly
    /// that many values.
    async fn call(
        &mut self,
        ctx: &CallContext,
        name: &str,
        args: Vec<RemoteValue>,
        kwargs: Kwargs,
        nargout: i64,
    ) -> RemoteResult<RemoteValue>;
}

/// Class name of a value, in the vocabulary of array languages
pub fn class_of(value: &RemoteValue) -> String {
    let name = match value {
        Value::Null | Value::Int(_) | Value::Float(_) | Value::Complex(_) => "double",
        Value::Bool(_) => "logical",
        Value::Str(_) => "char",
        Value::Bytes(_) => "uint8",
        Value::Matrix(m) => match m.dtype() {
            DType::Float64 | DType::Complex128 => "double",
            DType::Float32 | DType::Complex64 => "single",
            DType::Bool => "logical",
            other => other.name(),
        },
        Value::Sparse(_) => "double",
        Value::List(_) => "cell",
        Value::Map(_) | Value::Struct(_) => "struct",
        Value::Function(_) => "function_handle",
        Value::Object(object) => return object.class_name().to_string(),
    };
    name.to_string()
}

/// Human-readable rendering used by `display` and `disp`
pub fn render(value: &RemoteValue) -> String {
    match value {
        Value::Null => "[]".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        Value::Complex(c) => format!("{} + {}i", c.re, c.im),
        Value::Matrix(m) => match (m.shape(), m.to_f64_vec()) {
            ([rows, cols], Ok(values)) => values
                .chunks((*cols).max(1))
                .take(*rows)
                .map(|row| {
                    row.iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join("\n"),
            ([_], Ok(values)) => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            (shape, _) => format!("<{} {:?}>", m.dtype(), shape),
        },
        Value::Sparse(s) => {
            let (rows, cols) = s.shape();
            let mut lines = vec![format!("<{}x{} sparse, {} stored>", rows, cols, s.nnz())];
            if let Ok(values) = s.values().to_f64_vec() {
                for ((r, c), v) in s.rows().iter().zip(s.cols()).zip(values) {
                    lines.push(format!("  ({}, {})  {}", r, c, v));
                }
            }
            lines.join("\n")
        }
        Value::List(items) => format!(
            "{{{}}}",
            items.iter().map(render).collect::<Vec<_>>().join(", ")
        ),
        Value::Map(fields) | Value::Struct(fields) => fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, render(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(object) => object.display(),
        Value::Function(f) => format!("@{}", f.name()),
    }
}
