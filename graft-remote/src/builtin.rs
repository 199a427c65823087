//! Reference engine served by `graft remote`
//!
//! A small array-language flavoured environment: global variables, a
//! handful of numeric functions, an interruptible `pause`, a `stats`
//! namespace and a `Counter` class for exercising object proxies.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use graft_core::{Complex, Matrix, SparseMatrix, Value};
use graft_ipc::AUTO_NARGOUT;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::engine::{render, CallContext, Engine, Kwargs, NativeObject, ObjectRef, RemoteValue};
use crate::error::{RemoteFailure, RemoteResult};

const FUNCTIONS: &[(&str, &str)] = &[
    ("eval", "eval(code) evaluates a literal, a variable name or an assignment."),
    ("identity", "identity(x, ...) returns its arguments unchanged."),
    ("sum", "sum(x) adds up all elements of x."),
    ("size", "size(x) returns the dimensions of x."),
    ("numel", "numel(x) returns the number of elements of x."),
    ("max", "[m, i] = max(x) returns the largest element and its 1-based position."),
    ("issparse", "issparse(x) is true for sparse matrices."),
    ("sparse", "sparse(x) converts to sparse storage; sparse(m, n) is an empty m-by-n matrix."),
    ("full", "full(x) converts a sparse matrix to dense storage."),
    ("error", "error(identifier, message) raises an error."),
    ("disp", "disp(x) prints x."),
    ("pause", "pause(seconds) waits, and can be interrupted."),
    ("help", "help(name) returns the documentation of name."),
    ("what", "what(namespace) lists the members of a namespace."),
    ("Counter", "Counter(step) creates a counter that advances by step."),
    ("stats.mean", "stats.mean(x) is the arithmetic mean of x."),
    ("stats.var", "stats.var(x) is the sample variance of x."),
];

const COUNTER_METHODS: &[(&str, &str)] = &[
    ("copy", "copy() returns an independent counter with the same state."),
    ("increment", "increment(by) advances the count by `by`, or by step."),
    ("reset", "reset() sets the count back to zero."),
];

const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// Most outputs `size` pads to past the number of dimensions
const MAX_SIZE_OUTPUTS: usize = 32;

/// The engine behind `graft remote`
#[derive(Debug, Default)]
pub struct BuiltinEngine {
    globals: HashMap<String, RemoteValue>,
}

impl BuiltinEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn eval(&mut self, code: &str) -> RemoteResult<RemoteValue> {
        let code = code.trim();
        let quiet = code.ends_with(';');
        let statement = code.trim_end_matches(';').trim();
        if statement.is_empty() {
            return Ok(Value::Null);
        }

        if let Some((lhs, rhs)) = statement.split_once('=') {
            let lhs = lhs.trim();
            if is_identifier(lhs) && !rhs.starts_with('=') {
                let value = self.expression(rhs.trim())?;
                self.globals.insert(lhs.to_string(), value);
                return Ok(Value::Null);
            }
        }

        let value = self.expression(statement)?;
        Ok(if quiet { Value::Null } else { value })
    }

    fn expression(&self, text: &str) -> RemoteResult<RemoteValue> {
        if let Ok(number) = text.parse::<f64>() {
            return Ok(Value::Float(number));
        }
        match text {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "[]" => return Ok(Value::Null),
            _ => {}
        }
        for quote in ['\'', '"'] {
            if let Some(inner) = text
                .strip_prefix(quote)
                .and_then(|rest| rest.strip_suffix(quote))
            {
                return Ok(Value::Str(inner.to_string()));
            }
        }
        if is_identifier(text) {
            return self.get_global(text);
        }
        Err(RemoteFailure::bad_argument(format!(
            "Cannot evaluate '{}'",
            text
        )))
    }
}

#[async_trait]
impl Engine for BuiltinEngine {
    fn get_global(&self, name: &str) -> RemoteResult<RemoteValue> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteFailure::no_variable(name))
    }

    fn set_global(&mut self, name: &str, value: RemoteValue) -> RemoteResult<()> {
        if !is_identifier(name) {
            return Err(RemoteFailure::bad_argument(format!(
                "'{}' is not a valid variable name",
                name
            )));
        }
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    fn has_function(&self, name: &str) -> bool {
        FUNCTIONS.iter().any(|(f, _)| *f == name)
    }

    async fn call(
        &mut self,
        ctx: &CallContext,
        name: &str,
        args: Vec<RemoteValue>,
        kwargs: Kwargs,
        nargout: i64,
    ) -> RemoteResult<RemoteValue> {
        match name {
            "eval" => {
                let code = string_arg(&args, 0, name)?;
                self.eval(&code)
            }
            "identity" => outputs(args, nargout),
            "sum" => sum(arg(&args, 0, name)?),
            "size" => size(arg(&args, 0, name)?, nargout),
            "numel" => Ok(Value::Float(
                dimensions(arg(&args, 0, name)?).iter().map(|&d| d as f64).product(),
            )),
            "max" => max(arg(&args, 0, name)?, nargout),
            "issparse" => Ok(Value::Bool(matches!(
                arg(&args, 0, name)?,
                Value::Sparse(_)
            ))),
            "sparse" => to_sparse(&args),
            "full" => match arg(&args, 0, name)? {
                Value::Sparse(s) => Ok(Value::Matrix(s.to_dense()?)),
                other => Ok(other.clone()),
            },
            "error" => Err(match args.as_slice() {
                [message] => RemoteFailure::new("", render(message)),
                [identifier, message, ..] => RemoteFailure::new(render(identifier), render(message)),
                [] => RemoteFailure::bad_argument("error requires a message"),
            }),
            "disp" => {
                ctx.print(&render(arg(&args, 0, name)?));
                Ok(Value::Null)
            }
            "pause" => {
                let seconds = number_arg(&args, 0, name)?;
                if !(0.0..=86_400.0).contains(&seconds) {
                    return Err(RemoteFailure::bad_argument(format!(
                        "pause needs a duration between 0 and 86400 seconds, got {}",
                        seconds
                    )));
                }
                let deadline = Instant::now() + Duration::from_secs_f64(seconds);
                loop {
                    ctx.interrupt().check()?;
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Value::Null);
                    }
                    tokio::time::sleep((deadline - now).min(PAUSE_SLICE)).await;
                }
            }
            "help" => {
                let topic = match arg(&args, 0, name)? {
                    Value::Function(function) => function.name().to_string(),
                    _ => string_arg(&args, 0, name)?,
                };
                Ok(Value::Str(help_text(&topic)))
            }
            "what" => {
                let namespace = string_arg(&args, 0, name)?;
                let prefix = format!("{}.", namespace);
                let members = FUNCTIONS
                    .iter()
                    .filter_map(|(f, _)| f.strip_prefix(&prefix))
                    .map(|member| Value::Str(member.to_string()))
                    .collect();
                Ok(Value::List(members))
            }
            "Counter" => {
                let step = match (args.first(), kwargs.get("step")) {
                    (Some(step), _) | (None, Some(step)) => step.as_f64().ok_or_else(|| {
                        RemoteFailure::bad_argument("Counter step must be numeric")
                    })?,
                    (None, None) => 1.0,
                };
                Ok(Value::Object(ObjectRef::new(Counter::new(step))))
            }
            "stats.mean" => {
                let values = numeric_values(arg(&args, 0, name)?)?;
                if values.is_empty() {
                    return Ok(Value::Float(f64::NAN));
                }
                Ok(Value::Float(values.iter().sum::<f64>() / values.len() as f64))
            }
            "stats.var" => {
                let values = numeric_values(arg(&args, 0, name)?)?;
                if values.len() < 2 {
                    return Ok(Value::Float(0.0));
                }
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
                Ok(Value::Float(squares / (n - 1.0)))
            }
            _ => Err(RemoteFailure::no_function(name)),
        }
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn help_text(topic: &str) -> String {
    let documented = match topic.split_once('.') {
        Some(("Counter", method)) => COUNTER_METHODS.iter().find(|(m, _)| *m == method),
        _ => FUNCTIONS.iter().find(|(f, _)| *f == topic),
    };
    match documented {
        Some((_, doc)) => doc.to_string(),
        None => format!("No help found for {}.", topic),
    }
}

fn arg<'a>(args: &'a [RemoteValue], index: usize, function: &str) -> RemoteResult<&'a RemoteValue> {
    args.get(index).ok_or_else(|| {
        RemoteFailure::bad_argument(format!(
            "{} requires at least {} argument(s)",
            function,
            index + 1
        ))
    })
}

fn string_arg(args: &[RemoteValue], index: usize, function: &str) -> RemoteResult<String> {
    arg(args, index, function)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            RemoteFailure::bad_argument(format!("argument {} of {} must be text", index + 1, function))
        })
}

fn number_arg(args: &[RemoteValue], index: usize, function: &str) -> RemoteResult<f64> {
    arg(args, index, function)?.as_f64().ok_or_else(|| {
        RemoteFailure::bad_argument(format!(
            "argument {} of {} must be a number",
            index + 1,
            function
        ))
    })
}

/// Shape the result list for the requested number of outputs
fn outputs(mut values: Vec<RemoteValue>, nargout: i64) -> RemoteResult<RemoteValue> {
    if nargout > 1 {
        let wanted = nargout as usize;
        if values.len() < wanted {
            return Err(RemoteFailure::bad_argument(format!(
                "Too many output arguments: {} requested, {} available",
                wanted,
                values.len()
            )));
        }
        values.truncate(wanted);
        return Ok(Value::List(values));
    }
    if nargout == 0 || values.is_empty() {
        return Ok(Value::Null);
    }
    Ok(values.swap_remove(0))
}

fn numeric_values(value: &RemoteValue) -> RemoteResult<Vec<f64>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Matrix(m) => Ok(m.to_f64_vec()?),
        Value::Sparse(s) => Ok(s.to_dense()?.to_f64_vec()?),
        Value::List(items) => items.iter().try_fold(Vec::new(), |mut acc, item| {
            acc.extend(numeric_values(item)?);
            Ok(acc)
        }),
        other => other.as_f64().map(|v| vec![v]).ok_or_else(|| {
            RemoteFailure::bad_argument(format!("expected numeric data, got {}", other.kind()))
        }),
    }
}

fn sum(value: &RemoteValue) -> RemoteResult<RemoteValue> {
    match value {
        Value::Matrix(m) if m.dtype().is_complex() => {
            let total = m
                .to_complex_vec()
                .into_iter()
                .fold(Complex::default(), |acc, c| Complex::new(acc.re + c.re, acc.im + c.im));
            Ok(Value::Complex(total))
        }
        Value::Sparse(s) => Ok(Value::Float(s.values().to_f64_vec()?.iter().sum())),
        other => Ok(Value::Float(numeric_values(other)?.iter().sum())),
    }
}

fn dimensions(value: &RemoteValue) -> Vec<usize> {
    match value {
        Value::Null => vec![0, 0],
        Value::Matrix(m) => match m.shape() {
            [] => vec![1, 1],
            [n] => vec![1, *n],
            shape => shape.to_vec(),
        },
        Value::Sparse(s) => vec![s.shape().0, s.shape().1],
        Value::Str(s) => vec![1, s.chars().count()],
        Value::Bytes(b) => vec![1, b.len()],
        Value::List(items) => vec![1, items.len()],
        _ => vec![1, 1],
    }
}

fn size(value: &RemoteValue, nargout: i64) -> RemoteResult<RemoteValue> {
    let dims = dimensions(value);
    if nargout > 1 {
        let wanted = usize::try_from(nargout)
            .ok()
            .filter(|&n| n <= dims.len().max(MAX_SIZE_OUTPUTS))
            .ok_or_else(|| {
                RemoteFailure::bad_argument(format!(
                    "Too many output arguments: {} requested from size",
                    nargout
                ))
            })?;
        let mut outputs: Vec<RemoteValue> = dims.iter().map(|&d| Value::Float(d as f64)).collect();
        outputs.resize(wanted, Value::Float(1.0));
        return Ok(Value::List(outputs));
    }
    let row: Vec<f64> = dims.iter().map(|&d| d as f64).collect();
    Ok(Value::Matrix(Matrix::row(&row)))
}

fn max(value: &RemoteValue, nargout: i64) -> RemoteResult<RemoteValue> {
    let values = numeric_values(value)?;
    let (index, largest) = values
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .ok_or_else(|| RemoteFailure::bad_argument("max of an empty array"))?;
    let nargout = if nargout == AUTO_NARGOUT { 1 } else { nargout };
    outputs(
        vec![Value::Float(largest), Value::Float((index + 1) as f64)],
        nargout,
    )
}

fn to_sparse(args: &[RemoteValue]) -> RemoteResult<RemoteValue> {
    match args {
        [Value::Sparse(s)] => Ok(Value::Sparse(s.clone())),
        [Value::Matrix(m)] => {
            let m = match m.shape() {
                [n] => m.clone().reshape(vec![1, *n])?,
                _ => m.clone(),
            };
            Ok(Value::Sparse(SparseMatrix::from_dense(&m)?))
        }
        [rows, cols] => match (rows.as_i64(), cols.as_i64()) {
            (Some(r), Some(c)) if r >= 0 && c >= 0 => {
                Ok(Value::Sparse(SparseMatrix::empty(r as usize, c as usize)))
            }
            _ => Err(RemoteFailure::bad_argument("sparse(m, n) needs two sizes")),
        },
        [scalar] => {
            let v = scalar
                .as_f64()
                .ok_or_else(|| RemoteFailure::bad_argument("sparse needs numeric data"))?;
            Ok(Value::Sparse(SparseMatrix::from_dense(&Matrix::from_elements(
                vec![1, 1],
                &[v],
            )?)?))
        }
        _ => Err(RemoteFailure::bad_argument("sparse takes one or two arguments")),
    }
}

#[derive(Debug)]
struct CounterState {
    count: f64,
    step: f64,
}

/// Mutable object exposed by reference
#[derive(Debug)]
pub struct Counter {
    state: Mutex<CounterState>,
}

impl Counter {
    pub fn new(step: f64) -> Self {
        Self {
            state: Mutex::new(CounterState { count: 0.0, step }),
        }
    }
}

impl NativeObject for Counter {
    fn class_name(&self) -> &str {
        "Counter"
    }

    fn properties(&self) -> Vec<String> {
        vec!["count".to_string(), "step".to_string()]
    }

    fn methods(&self) -> Vec<String> {
        COUNTER_METHODS.iter().map(|(m, _)| m.to_string()).collect()
    }

    fn get_property(&self, name: &str) -> RemoteResult<RemoteValue> {
        let state = self.state.lock();
        match name {
            "count" => Ok(Value::Float(state.count)),
            "step" => Ok(Value::Float(state.step)),
            _ => Err(no_property(name)),
        }
    }

    fn set_property(&self, name: &str, value: RemoteValue) -> RemoteResult<()> {
        let number = value.as_f64().ok_or_else(|| {
            RemoteFailure::bad_argument(format!("Counter.{} must be numeric, got {}", name, value.kind()))
        })?;
        let mut state = self.state.lock();
        match name {
            "count" => state.count = number,
            "step" => state.step = number,
            _ => return Err(no_property(name)),
        }
        Ok(())
    }

    fn call_method(
        &self,
        _ctx: &CallContext,
        name: &str,
        args: Vec<RemoteValue>,
        _nargout: i64,
    ) -> RemoteResult<RemoteValue> {
        let mut state = self.state.lock();
        match name {
            "increment" => {
                let by = match args.first() {
                    Some(by) => by.as_f64().ok_or_else(|| {
                        RemoteFailure::bad_argument("increment amount must be numeric")
                    })?,
                    None => state.step,
                };
                state.count += by;
                Ok(Value::Float(state.count))
            }
            "reset" => {
                state.count = 0.0;
                Ok(Value::Null)
            }
            "copy" => {
                let copy = Counter::new(state.step);
                copy.state.lock().count = state.count;
                Ok(Value::Object(ObjectRef::new(copy)))
            }
            _ => Err(RemoteFailure::no_function(&format!("Counter.{}", name))),
        }
    }

    fn display(&self) -> String {
        let state = self.state.lock();
        format!(
            "  <a href=\"matlab:helpPopup Counter\" style=\"font-weight:bold\">Counter</a> with properties:\n\n    count: {}\n     step: {}\n",
            state.count, state.step
        )
    }
}

#[track_caller]
fn no_property(name: &str) -> RemoteFailure {
    RemoteFailure::new(
        graft_ipc::identifiers::NO_PROPERTY,
        format!("Unrecognized property '{}' for class 'Counter'", name),
    )
}
