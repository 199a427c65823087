//! Value codec
//!
//! Converts between [`Value`] and the [`Wire`] tree. Anything without a pure
//! value representation becomes a tagged list:
//!
//! ```text
//! ["__matrix__", dtype, shape, bytes]        dense array
//! ["__sparse__", shape, rows, cols, values]  COO sparse array
//! ["__object__", handle]                     remote object
//! ["__function__", handle | name]            remote function
//! ["__struct__", {field: value}]             native record
//! ```
//!
//! Object and function references are translated by the peer through the
//! [`References`] trait, which is where the remote allocates handles and the
//! master builds proxies.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{CodecError, CodecResult};
use crate::format::{MessageFormat, PayloadEncoding};
use crate::matrix::{DType, Matrix, SparseMatrix};
use crate::value::Value;
use crate::wire::{Handle, Wire};

pub const MATRIX_TAG: &str = "__matrix__";
pub const SPARSE_TAG: &str = "__sparse__";
pub const OBJECT_TAG: &str = "__object__";
pub const FUNCTION_TAG: &str = "__function__";
pub const STRUCT_TAG: &str = "__struct__";

/// How a function reference is named on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefKey {
    /// Entry in the remote handle table
    Handle(Handle),
    /// Function looked up by name on every call
    Name(String),
}

impl RefKey {
    pub fn to_wire(&self) -> Wire {
        match self {
            RefKey::Handle(h) => Wire::from(*h),
            RefKey::Name(name) => Wire::str(name.as_str()),
        }
    }

    pub fn from_wire(wire: &Wire) -> CodecResult<Self> {
        match wire {
            Wire::Str(name) => Ok(RefKey::Name(name.clone())),
            other => other.as_u64().map(|h| RefKey::Handle(Handle(h))).ok_or_else(|| {
                CodecError::malformed(
                    FUNCTION_TAG,
                    format!("expected handle or name, got {}", other.kind()),
                )
            }),
        }
    }
}

/// Peer-specific translation of object and function references
pub trait References<O, F> {
    /// Handle for an object about to cross the wire
    fn object_handle(&mut self, object: &O) -> CodecResult<Handle>;

    /// Wire key for a function about to cross the wire
    fn function_key(&mut self, function: &F) -> CodecResult<RefKey>;

    fn resolve_object(&mut self, handle: Handle) -> CodecResult<O>;

    fn resolve_function(&mut self, key: RefKey) -> CodecResult<F>;
}

/// References for contexts where no object may appear
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferences;

impl<O, F> References<O, F> for NoReferences {
    fn object_handle(&mut self, _object: &O) -> CodecResult<Handle> {
        Err(CodecError::Reference("objects cannot be encoded here".to_string()))
    }

    fn function_key(&mut self, _function: &F) -> CodecResult<RefKey> {
        Err(CodecError::Reference("functions cannot be encoded here".to_string()))
    }

    fn resolve_object(&mut self, handle: Handle) -> CodecResult<O> {
        Err(CodecError::Reference(format!("unexpected object handle {}", handle)))
    }

    fn resolve_function(&mut self, key: RefKey) -> CodecResult<F> {
        Err(CodecError::Reference(format!("unexpected function {:?}", key)))
    }
}

/// Recursive value encoder/decoder, parameterised by payload encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCodec {
    payload: PayloadEncoding,
}

impl ValueCodec {
    pub fn new(format: MessageFormat) -> Self {
        Self {
            payload: format.payload_encoding(),
        }
    }

    pub fn payload_encoding(&self) -> PayloadEncoding {
        self.payload
    }

    pub fn encode<O, F, R>(&self, value: &Value<O, F>, refs: &mut R) -> CodecResult<Wire>
    where
        R: References<O, F> + ?Sized,
    {
        let wire = match value {
            Value::Null => Wire::Nil,
            Value::Bool(b) => Wire::Bool(*b),
            Value::Int(i) => Wire::Int(*i),
            // JSON has no NaN or infinity, so those travel as a one-element array
            Value::Float(f) if !f.is_finite() && self.payload == PayloadEncoding::Base64Text => {
                self.encode_matrix(&Matrix::scalar(*f))
            }
            Value::Float(f) => Wire::Float(*f),
            Value::Str(s) => Wire::Str(s.clone()),
            Value::Bytes(bytes) => match self.payload {
                PayloadEncoding::RawBytes => Wire::Bin(bytes.clone()),
                PayloadEncoding::Base64Text => self.encode_matrix(&Matrix::row(bytes)),
            },
            Value::Complex(c) => self.encode_matrix(&Matrix::scalar(*c)),
            Value::Matrix(m) => self.encode_matrix(m),
            Value::Sparse(s) => self.encode_sparse(s)?,
            Value::List(items) => Wire::Array(
                items
                    .iter()
                    .map(|item| self.encode(item, refs))
                    .collect::<CodecResult<_>>()?,
            ),
            Value::Map(fields) => Wire::Map(self.encode_fields(fields, refs)?),
            Value::Struct(fields) => Wire::Array(vec![
                Wire::str(STRUCT_TAG),
                Wire::Map(self.encode_fields(fields, refs)?),
            ]),
            Value::Object(object) => {
                let handle = refs.object_handle(object)?;
                Wire::Array(vec![Wire::str(OBJECT_TAG), Wire::from(handle)])
            }
            Value::Function(function) => {
                let key = refs.function_key(function)?;
                Wire::Array(vec![Wire::str(FUNCTION_TAG), key.to_wire()])
            }
        };
        Ok(wire)
    }

    fn encode_fields<O, F, R>(
        &self,
        fields: &BTreeMap<String, Value<O, F>>,
        refs: &mut R,
    ) -> CodecResult<BTreeMap<String, Wire>>
    where
        R: References<O, F> + ?Sized,
    {
        fields
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.encode(value, refs)?)))
            .collect()
    }

    pub fn decode<O, F, R>(&self, wire: Wire, refs: &mut R) -> CodecResult<Value<O, F>>
    where
        R: References<O, F> + ?Sized,
    {
        let value = match wire {
            Wire::Nil => Value::Null,
            Wire::Bool(b) => Value::Bool(b),
            Wire::Int(i) => Value::Int(i),
            Wire::Float(f) => Value::Float(f),
            Wire::Str(s) => Value::Str(s),
            Wire::Bin(bytes) => Value::Bytes(bytes),
            Wire::Map(fields) => Value::Map(self.decode_fields(fields, refs)?),
            Wire::Array(items) => match tag_of(&items) {
                Some(MATRIX_TAG) => Value::Matrix(self.decode_matrix(items)?),
                Some(SPARSE_TAG) => Value::Sparse(self.decode_sparse(items)?),
                Some(OBJECT_TAG) => {
                    let [_, handle] = fixed::<2>(OBJECT_TAG, items)?;
                    let handle = handle
                        .as_u64()
                        .map(Handle)
                        .ok_or_else(|| CodecError::malformed(OBJECT_TAG, "handle is not an integer"))?;
                    Value::Object(refs.resolve_object(handle)?)
                }
                Some(FUNCTION_TAG) => {
                    let [_, key] = fixed::<2>(FUNCTION_TAG, items)?;
                    Value::Function(refs.resolve_function(RefKey::from_wire(&key)?)?)
                }
                Some(STRUCT_TAG) => {
                    let [_, fields] = fixed::<2>(STRUCT_TAG, items)?;
                    let Wire::Map(fields) = fields else {
                        return Err(CodecError::malformed(STRUCT_TAG, "fields are not a map"));
                    };
                    Value::Struct(self.decode_fields(fields, refs)?)
                }
                _ => Value::List(
                    items
                        .into_iter()
                        .map(|item| self.decode(item, refs))
                        .collect::<CodecResult<_>>()?,
                ),
            },
        };
        Ok(value)
    }

    fn decode_fields<O, F, R>(
        &self,
        fields: BTreeMap<String, Wire>,
        refs: &mut R,
    ) -> CodecResult<BTreeMap<String, Value<O, F>>>
    where
        R: References<O, F> + ?Sized,
    {
        fields
            .into_iter()
            .map(|(key, wire)| Ok((key, self.decode(wire, refs)?)))
            .collect()
    }

    /// `["__matrix__", dtype, shape, data]`
    pub fn encode_matrix(&self, matrix: &Matrix) -> Wire {
        let shape = matrix.shape().iter().map(|&d| Wire::Int(d as i64)).collect();
        let data = match self.payload {
            PayloadEncoding::RawBytes => Wire::Bin(matrix.data().to_vec()),
            PayloadEncoding::Base64Text => Wire::Str(STANDARD.encode(matrix.data())),
        };
        Wire::Array(vec![
            Wire::str(MATRIX_TAG),
            Wire::str(matrix.dtype().name()),
            Wire::Array(shape),
            data,
        ])
    }

    /// Accepts both raw and base64 payloads regardless of the codec's own mode
    pub fn decode_matrix(&self, items: Vec<Wire>) -> CodecResult<Matrix> {
        let [_, dtype, shape, data] = fixed::<4>(MATRIX_TAG, items)?;
        let dtype = dtype
            .as_str()
            .ok_or_else(|| CodecError::malformed(MATRIX_TAG, "dtype is not a string"))
            .and_then(DType::from_name)?;
        let shape = decode_shape(MATRIX_TAG, &shape)?;
        let data = match data {
            Wire::Bin(bytes) => bytes,
            Wire::Str(text) => {
                let compact: String = text.split_whitespace().collect();
                STANDARD.decode(compact)?
            }
            Wire::Nil => Vec::new(),
            other => {
                return Err(CodecError::malformed(
                    MATRIX_TAG,
                    format!("data is {}, expected bytes or base64 text", other.kind()),
                ))
            }
        };
        Matrix::new(dtype, shape, data)
    }

    /// `["__sparse__", [rows, cols], rowMatrix, colMatrix, valueMatrix]`, with
    /// the three vectors as nil when there are no stored entries
    pub fn encode_sparse(&self, sparse: &SparseMatrix) -> CodecResult<Wire> {
        let (n_rows, n_cols) = sparse.shape();
        let mut items = vec![
            Wire::str(SPARSE_TAG),
            Wire::Array(vec![Wire::Int(n_rows as i64), Wire::Int(n_cols as i64)]),
        ];
        if sparse.nnz() == 0 {
            items.extend([Wire::Nil, Wire::Nil, Wire::Nil]);
        } else {
            let nnz = sparse.nnz();
            let rows: Vec<i64> = sparse.rows().iter().map(|&r| r as i64).collect();
            let cols: Vec<i64> = sparse.cols().iter().map(|&c| c as i64).collect();
            items.push(self.encode_matrix(&Matrix::from_elements(vec![nnz], &rows)?));
            items.push(self.encode_matrix(&Matrix::from_elements(vec![nnz], &cols)?));
            items.push(self.encode_matrix(sparse.values()));
        }
        Ok(Wire::Array(items))
    }

    pub fn decode_sparse(&self, items: Vec<Wire>) -> CodecResult<SparseMatrix> {
        let [_, shape, rows, cols, values] = fixed::<5>(SPARSE_TAG, items)?;
        let dims = decode_shape(SPARSE_TAG, &shape)?;
        let shape = match dims.as_slice() {
            &[r, c] => (r, c),
            other => {
                return Err(CodecError::malformed(
                    SPARSE_TAG,
                    format!("shape must have two dimensions, got {:?}", other),
                ))
            }
        };
        let rows = self.decode_indices(rows)?;
        let cols = self.decode_indices(cols)?;
        let values = match self.decode_vector(values)? {
            Some(values) => values,
            None => Matrix::empty(DType::Float64),
        };
        SparseMatrix::from_triplets(shape, rows, cols, values)
    }

    /// Nil or an array of any shape, raveled to one dimension
    fn decode_vector(&self, wire: Wire) -> CodecResult<Option<Matrix>> {
        match wire {
            Wire::Nil => Ok(None),
            Wire::Array(items) if items.is_empty() => Ok(None),
            Wire::Array(items) => {
                let matrix = self.decode_matrix(items)?;
                let len = matrix.len();
                matrix.reshape(vec![len]).map(Some)
            }
            other => Err(CodecError::malformed(
                SPARSE_TAG,
                format!("expected a matrix or nil, got {}", other.kind()),
            )),
        }
    }

    fn decode_indices(&self, wire: Wire) -> CodecResult<Vec<usize>> {
        let Some(matrix) = self.decode_vector(wire)? else {
            return Ok(Vec::new());
        };
        matrix
            .to_f64_vec()?
            .into_iter()
            .map(|v| {
                if v >= 0.0 && v.fract() == 0.0 {
                    Ok(v as usize)
                } else {
                    Err(CodecError::malformed(SPARSE_TAG, format!("invalid index {}", v)))
                }
            })
            .collect()
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(MessageFormat::default())
    }
}

fn tag_of(items: &[Wire]) -> Option<&str> {
    match items.first() {
        Some(Wire::Str(tag)) => Some(tag.as_str()),
        _ => None,
    }
}

fn fixed<const N: usize>(tag: &'static str, items: Vec<Wire>) -> CodecResult<[Wire; N]> {
    let len = items.len();
    items
        .try_into()
        .map_err(|_| CodecError::malformed(tag, format!("expected {} elements, got {}", N, len)))
}

/// Dimension sizes, coerced from floats where the sender only has doubles
fn decode_shape(tag: &'static str, wire: &Wire) -> CodecResult<Vec<usize>> {
    let dims = match wire {
        Wire::Array(dims) => dims.as_slice(),
        scalar @ (Wire::Int(_) | Wire::Float(_)) => std::slice::from_ref(scalar),
        other => {
            return Err(CodecError::malformed(
                tag,
                format!("shape is {}, expected an array", other.kind()),
            ))
        }
    };
    dims.iter()
        .map(|dim| {
            dim.as_u64()
                .and_then(|d| usize::try_from(d).ok())
                .ok_or_else(|| CodecError::malformed(tag, format!("invalid dimension {:?}", dim)))
        })
        .collect()
}
