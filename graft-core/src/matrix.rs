//! Dense and sparse numeric arrays
//!
//! Arrays are kept as raw little-endian buffers tagged with an element type,
//! which is exactly what travels on the wire. Typed access goes through the
//! [`Element`] trait.

use std::fmt;

use crate::error::{CodecError, CodecResult};

/// Element type of a dense array, named the way the wire names it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Complex64,
    Complex128,
}

impl DType {
    /// Wire name of the element type
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
        }
    }

    /// Parse a wire name. Class names used by array languages
    /// (`double`, `single`, `logical`) are accepted as aliases.
    pub fn from_name(name: &str) -> CodecResult<Self> {
        let dtype = match name {
            "bool" | "logical" => DType::Bool,
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "int64" => DType::Int64,
            "uint8" => DType::UInt8,
            "uint16" => DType::UInt16,
            "uint32" => DType::UInt32,
            "uint64" => DType::UInt64,
            "float32" | "single" => DType::Float32,
            "float64" | "double" => DType::Float64,
            "complex64" => DType::Complex64,
            "complex128" => DType::Complex128,
            other => return Err(CodecError::UnknownDType(other.to_string())),
        };
        Ok(dtype)
    }

    /// Size of one element in bytes
    pub fn item_size(self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 | DType::Complex64 => 8,
            DType::Complex128 => 16,
        }
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DType::Complex64 | DType::Complex128)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Complex scalar with double precision parts
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

/// Scalar types that can be stored in a [`Matrix`]
pub trait Element: Copy {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `DTYPE.item_size()` long
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = $dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element! {
    i8 => DType::Int8,
    i16 => DType::Int16,
    i32 => DType::Int32,
    i64 => DType::Int64,
    u8 => DType::UInt8,
    u16 => DType::UInt16,
    u32 => DType::UInt32,
    u64 => DType::UInt64,
    f32 => DType::Float32,
    f64 => DType::Float64,
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Element for Complex {
    const DTYPE: DType = DType::Complex128;

    fn write_le(self, out: &mut Vec<u8>) {
        self.re.write_le(out);
        self.im.write_le(out);
    }

    fn read_le(bytes: &[u8]) -> Self {
        Complex {
            re: f64::read_le(&bytes[..8]),
            im: f64::read_le(&bytes[8..16]),
        }
    }
}

/// Largest number of elements a sparse matrix is expanded to when made dense
pub const MAX_DENSE_ELEMENTS: usize = 1 << 27;

/// Number of elements described by a shape; a 0-d shape holds one element.
/// `None` when the count does not fit in `usize`.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
}

/// Bytes needed for `shape` elements of `dtype`
fn byte_len(dtype: DType, shape: &[usize]) -> CodecResult<usize> {
    element_count(shape)
        .and_then(|count| count.checked_mul(dtype.item_size()))
        .ok_or_else(|| {
            CodecError::malformed(
                "__matrix__",
                format!("shape {:?} of {} is too large", shape, dtype),
            )
        })
}

/// Dense n-dimensional array in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Matrix {
    /// Build a matrix from a raw little-endian buffer
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> CodecResult<Self> {
        let expected = byte_len(dtype, &shape)?;
        if data.len() != expected {
            return Err(CodecError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build a matrix from typed elements
    pub fn from_elements<T: Element>(shape: Vec<usize>, values: &[T]) -> CodecResult<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.item_size());
        for &value in values {
            value.write_le(&mut data);
        }
        Self::new(T::DTYPE, shape, data)
    }

    /// 1-by-n row vector
    pub fn row<T: Element>(values: &[T]) -> Self {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.item_size());
        for &value in values {
            value.write_le(&mut data);
        }
        Self {
            dtype: T::DTYPE,
            shape: vec![1, values.len()],
            data,
        }
    }

    /// Single element array of shape `[1]`
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut data = Vec::with_capacity(T::DTYPE.item_size());
        value.write_le(&mut data);
        Self {
            dtype: T::DTYPE,
            shape: vec![1],
            data,
        }
    }

    /// Zero-filled array
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> CodecResult<Self> {
        let data = vec![0u8; byte_len(dtype, &shape)?];
        Ok(Self { dtype, shape, data })
    }

    /// One-dimensional array with no elements
    pub fn empty(dtype: DType) -> Self {
        Self {
            dtype,
            shape: vec![0],
            data: Vec::new(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian element buffer
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.item_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(self) -> (DType, Vec<usize>, Vec<u8>) {
        (self.dtype, self.shape, self.data)
    }

    /// Same elements, new shape
    pub fn reshape(self, shape: Vec<usize>) -> CodecResult<Self> {
        Self::new(self.dtype, shape, self.data)
    }

    fn chunks(&self) -> std::slice::ChunksExact<'_, u8> {
        self.data.chunks_exact(self.dtype.item_size())
    }

    /// Typed copy of the elements; the element type must match exactly
    pub fn to_vec<T: Element>(&self) -> CodecResult<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(CodecError::DTypeMismatch {
                requested: T::DTYPE.name(),
                actual: self.dtype.name(),
            });
        }
        Ok(self.chunks().map(T::read_le).collect())
    }

    /// Elements of any real element type widened to `f64`
    pub fn to_f64_vec(&self) -> CodecResult<Vec<f64>> {
        if self.dtype.is_complex() {
            return Err(CodecError::DTypeMismatch {
                requested: DType::Float64.name(),
                actual: self.dtype.name(),
            });
        }
        Ok(self.chunks().map(|chunk| real_as_f64(self.dtype, chunk)).collect())
    }

    /// Elements widened to complex numbers, real types get a zero imaginary part
    pub fn to_complex_vec(&self) -> Vec<Complex> {
        self.chunks()
            .map(|chunk| match self.dtype {
                DType::Complex64 => Complex::new(
                    f64::from(f32::read_le(&chunk[..4])),
                    f64::from(f32::read_le(&chunk[4..8])),
                ),
                DType::Complex128 => Complex::read_le(chunk),
                dtype => Complex::new(real_as_f64(dtype, chunk), 0.0),
            })
            .collect()
    }

    /// Element at a row-major multi-index
    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() || self.dtype.is_complex() {
            return None;
        }
        let mut offset = 0;
        for (i, (&idx, &dim)) in index.iter().zip(&self.shape).enumerate() {
            if idx >= dim {
                return None;
            }
            offset = if i == 0 { idx } else { offset * dim + idx };
        }
        self.chunks()
            .nth(offset)
            .map(|chunk| real_as_f64(self.dtype, chunk))
    }

    fn element_is_zero(&self, chunk: &[u8]) -> bool {
        match self.dtype {
            DType::Complex64 => {
                f32::read_le(&chunk[..4]) == 0.0 && f32::read_le(&chunk[4..8]) == 0.0
            }
            DType::Complex128 => {
                let c = Complex::read_le(chunk);
                c.re == 0.0 && c.im == 0.0
            }
            dtype => real_as_f64(dtype, chunk) == 0.0,
        }
    }
}

fn real_as_f64(dtype: DType, chunk: &[u8]) -> f64 {
    match dtype {
        DType::Bool => f64::from(u8::from(bool::read_le(chunk))),
        DType::Int8 => f64::from(i8::read_le(chunk)),
        DType::Int16 => f64::from(i16::read_le(chunk)),
        DType::Int32 => f64::from(i32::read_le(chunk)),
        DType::Int64 => i64::read_le(chunk) as f64,
        DType::UInt8 => f64::from(u8::read_le(chunk)),
        DType::UInt16 => f64::from(u16::read_le(chunk)),
        DType::UInt32 => f64::from(u32::read_le(chunk)),
        DType::UInt64 => u64::read_le(chunk) as f64,
        DType::Float32 => f64::from(f32::read_le(chunk)),
        DType::Float64 => f64::read_le(chunk),
        DType::Complex64 | DType::Complex128 => f64::NAN,
    }
}

/// Two-dimensional sparse matrix in coordinate (COO) form.
///
/// Repeated coordinates are allowed; their values add up when the matrix is
/// read back, the same convention COO constructors use.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    shape: (usize, usize),
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Matrix,
}

impl SparseMatrix {
    /// Matrix with no stored entries
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            shape: (rows, cols),
            rows: Vec::new(),
            cols: Vec::new(),
            values: Matrix::empty(DType::Float64),
        }
    }

    /// Build from parallel row/column/value vectors. `values` is flattened.
    pub fn from_triplets(
        shape: (usize, usize),
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Matrix,
    ) -> CodecResult<Self> {
        let count = values.len();
        if rows.len() != count || cols.len() != count {
            return Err(CodecError::InvalidSparse(format!(
                "{} rows, {} columns and {} values",
                rows.len(),
                cols.len(),
                count
            )));
        }
        if let Some((r, c)) = rows
            .iter()
            .zip(&cols)
            .find(|(r, c)| **r >= shape.0 || **c >= shape.1)
        {
            return Err(CodecError::InvalidSparse(format!(
                "entry ({}, {}) outside {}x{}",
                r, c, shape.0, shape.1
            )));
        }
        let values = values.reshape(vec![count])?;
        Ok(Self {
            shape,
            rows,
            cols,
            values,
        })
    }

    /// Collect the nonzero entries of a 2-D dense matrix
    pub fn from_dense(dense: &Matrix) -> CodecResult<Self> {
        let &[n_rows, n_cols] = dense.shape() else {
            return Err(CodecError::InvalidSparse(format!(
                "expected a 2-D matrix, got shape {:?}",
                dense.shape()
            )));
        };
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut data = Vec::new();
        for (offset, chunk) in dense.chunks().enumerate() {
            if dense.element_is_zero(chunk) {
                continue;
            }
            rows.push(offset / n_cols);
            cols.push(offset % n_cols);
            data.extend_from_slice(chunk);
        }
        let values = Matrix::new(dense.dtype(), vec![rows.len()], data)?;
        Self::from_triplets((n_rows, n_cols), rows, cols, values)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of stored entries (duplicates counted separately)
    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Stored values as a 1-D matrix
    pub fn values(&self) -> &Matrix {
        &self.values
    }

    /// Value at `(row, col)`, summing repeated entries
    pub fn get(&self, row: usize, col: usize) -> CodecResult<f64> {
        let values = self.values.to_f64_vec()?;
        Ok(self
            .rows
            .iter()
            .zip(&self.cols)
            .zip(values)
            .filter(|((r, c), _)| **r == row && **c == col)
            .map(|(_, v)| v)
            .sum())
    }

    /// Dense `float64` copy, refused above [`MAX_DENSE_ELEMENTS`]
    pub fn to_dense(&self) -> CodecResult<Matrix> {
        let (n_rows, n_cols) = self.shape;
        let count = n_rows
            .checked_mul(n_cols)
            .filter(|&count| count <= MAX_DENSE_ELEMENTS)
            .ok_or_else(|| {
                CodecError::InvalidSparse(format!(
                    "{}x{} is too large to store densely",
                    n_rows, n_cols
                ))
            })?;
        let mut dense = vec![0.0f64; count];
        for ((&r, &c), v) in self.rows.iter().zip(&self.cols).zip(self.values.to_f64_vec()?) {
            dense[r * n_cols + c] += v;
        }
        Matrix::from_elements(vec![n_rows, n_cols], &dense)
    }
}
