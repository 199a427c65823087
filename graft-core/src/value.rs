//! The value model shared by both peers

use std::collections::BTreeMap;

use crate::matrix::{Complex, Matrix, SparseMatrix};

/// A value that can cross the wire.
///
/// `O` and `F` are the peer-specific representations of remote objects and
/// functions: live proxies on the master, table entries on the remote.
/// Everything else is passed by value and copied on every crossing.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<O, F> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Promoted to a one-element `complex128` matrix on the wire
    Complex(Complex),
    Matrix(Matrix),
    Sparse(SparseMatrix),
    List(Vec<Value<O, F>>),
    /// Generic key-value mapping
    Map(BTreeMap<String, Value<O, F>>),
    /// Mapping the remote must materialise as a native record
    Struct(BTreeMap<String, Value<O, F>>),
    Object(O),
    Function(F),
}

impl<O, F> Value<O, F> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of scalars and one-element real matrices
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Matrix(m) if m.len() == 1 => m.to_f64_vec().ok()?.first().copied(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => self
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => self.as_f64().map(|f| f != 0.0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&Matrix> {
        match self {
            Value::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sparse(&self) -> Option<&SparseMatrix> {
        match self {
            Value::Sparse(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value<O, F>]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&O> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&F> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Split a multi-output reply into its parts; a single value yields itself
    pub fn into_outputs(self) -> Vec<Value<O, F>> {
        match self {
            Value::List(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Complex(_) => "complex",
            Value::Matrix(_) => "matrix",
            Value::Sparse(_) => "sparse",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }
}

impl<O, F> From<bool> for Value<O, F> {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<O, F> From<i64> for Value<O, F> {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl<O, F> From<f64> for Value<O, F> {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl<O, F> From<&str> for Value<O, F> {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl<O, F> From<String> for Value<O, F> {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<O, F> From<Complex> for Value<O, F> {
    fn from(value: Complex) -> Self {
        Value::Complex(value)
    }
}

impl<O, F> From<Matrix> for Value<O, F> {
    fn from(value: Matrix) -> Self {
        Value::Matrix(value)
    }
}

impl<O, F> From<SparseMatrix> for Value<O, F> {
    fn from(value: SparseMatrix) -> Self {
        Value::Sparse(value)
    }
}

impl<O, F> From<Vec<Value<O, F>>> for Value<O, F> {
    fn from(value: Vec<Value<O, F>>) -> Self {
        Value::List(value)
    }
}

impl<O, F> From<BTreeMap<String, Value<O, F>>> for Value<O, F> {
    fn from(value: BTreeMap<String, Value<O, F>>) -> Self {
        Value::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Plain = Value<(), ()>;

    #[test]
    fn test_scalar_views() {
        assert_eq!(Plain::Int(3).as_f64(), Some(3.0));
        assert_eq!(Plain::Float(2.0).as_i64(), Some(2));
        assert_eq!(Plain::Float(2.5).as_i64(), None);
        assert_eq!(Plain::from(Matrix::scalar(7.0f64)).as_f64(), Some(7.0));
        assert_eq!(Plain::from(Matrix::scalar(1u8)).as_bool(), Some(true));
        assert_eq!(Plain::from("x").as_str(), Some("x"));
    }

    #[test]
    fn test_into_outputs() {
        let list = Plain::List(vec![Plain::Int(1), Plain::Int(2)]);
        assert_eq!(list.into_outputs().len(), 2);
        assert!(Plain::Null.into_outputs().is_empty());
        assert_eq!(Plain::Int(5).into_outputs(), vec![Plain::Int(5)]);
    }
}
