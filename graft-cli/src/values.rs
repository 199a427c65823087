//! Turning command-line text into values and values back into text

use std::collections::BTreeMap;
use std::fmt::Write;

use anyhow::{Context, Result};
use graft_core::{Complex, Matrix, SparseMatrix, Value};
use graft_master::MasterValue;
use serde_json::Value as Json;

/// Interpret one command-line argument.
///
/// JSON literals map onto values: numbers become floats, an array of numbers
/// becomes a row vector and an array of equal-length numeric rows becomes a
/// matrix. Text that does not parse as JSON is passed through unchanged.
pub fn parse_argument(text: &str) -> Result<MasterValue> {
    match serde_json::from_str::<Json>(text) {
        Ok(json) => from_json(json).with_context(|| format!("Invalid argument: {}", text)),
        Err(_) => Ok(Value::Str(text.to_string())),
    }
}

fn from_json(json: Json) -> Result<MasterValue> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        Json::String(s) => Value::Str(s),
        Json::Array(items) => {
            if let Some(row) = numeric_row(&items) {
                Value::Matrix(Matrix::row(row.as_slice()))
            } else if let Some((rows, cols, data)) = numeric_grid(&items) {
                Value::Matrix(Matrix::from_elements(vec![rows, cols], data.as_slice())?)
            } else {
                Value::List(items.into_iter().map(from_json).collect::<Result<_>>()?)
            }
        }
        Json::Object(fields) => Value::Map(
            fields
                .into_iter()
                .map(|(k, v)| Ok((k, from_json(v)?)))
                .collect::<Result<BTreeMap<_, _>>>()?,
        ),
    })
}

fn numeric_row(items: &[Json]) -> Option<Vec<f64>> {
    if items.is_empty() {
        return None;
    }
    items.iter().map(Json::as_f64).collect()
}

fn numeric_grid(items: &[Json]) -> Option<(usize, usize, Vec<f64>)> {
    let rows = items
        .iter()
        .map(|item| numeric_row(item.as_array()?))
        .collect::<Option<Vec<_>>>()?;
    let cols = rows.first()?.len();
    if rows.iter().any(|row| row.len() != cols) {
        return None;
    }
    Some((rows.len(), cols, rows.concat()))
}

/// Plain-text rendering of a value. Proxies show only their handle;
/// callers ask the remote for a display when they want one.
pub fn describe(value: &MasterValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value, 0);
    out
}

fn write_value(out: &mut String, value: &MasterValue, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Null => out.push_str("[]"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) => out.push_str(&number(*f)),
        Value::Str(s) => out.push_str(s),
        Value::Bytes(bytes) => {
            let _ = write!(out, "<{} bytes>", bytes.len());
        }
        Value::Complex(c) => out.push_str(&complex(*c)),
        Value::Matrix(m) => write_matrix(out, m),
        Value::Sparse(s) => write_sparse(out, s, &pad),
        Value::List(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item, depth);
            }
            out.push('}');
        }
        Value::Map(fields) | Value::Struct(fields) => {
            for (i, (key, field)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                    out.push_str(&pad);
                }
                let _ = write!(out, "{}: ", key);
                write_value(out, field, depth + 1);
            }
        }
        Value::Object(object) => {
            let _ = write!(out, "<object #{}>", object.handle());
        }
        Value::Function(function) => match function.name() {
            Some(name) => {
                let _ = write!(out, "@{}", name);
            }
            None => {
                let handle = function.handle().map(|h| h.to_string()).unwrap_or_default();
                let _ = write!(out, "<function #{}>", handle);
            }
        },
    }
}

fn write_matrix(out: &mut String, matrix: &Matrix) {
    let cells: Vec<String> = if matrix.dtype().is_complex() {
        matrix.to_complex_vec().into_iter().map(complex).collect()
    } else {
        match matrix.to_f64_vec() {
            Ok(values) => values.into_iter().map(number).collect(),
            Err(_) => Vec::new(),
        }
    };
    let shape = matrix.shape();
    let cols = match shape {
        [_, cols] => (*cols).max(1),
        _ => cells.len().max(1),
    };
    if cells.is_empty() {
        let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
        let _ = write!(out, "[] ({} {})", dims.join("x"), matrix.dtype());
        return;
    }
    out.push('[');
    for (i, row) in cells.chunks(cols).enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&row.join(" "));
    }
    out.push(']');
}

fn write_sparse(out: &mut String, sparse: &SparseMatrix, pad: &str) {
    let (rows, cols) = sparse.shape();
    let _ = write!(out, "sparse {}x{}, {} stored", rows, cols, sparse.nnz());
    let values = sparse.values().to_f64_vec().unwrap_or_default();
    for ((r, c), v) in sparse.rows().iter().zip(sparse.cols()).zip(values) {
        let _ = write!(out, "\n{}  ({},{}) {}", pad, r + 1, c + 1, number(v));
    }
}

fn number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn complex(value: Complex) -> String {
    if value.im < 0.0 {
        format!("{}-{}i", number(value.re), number(-value.im))
    } else {
        format!("{}+{}i", number(value.re), number(value.im))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_argument("3").unwrap(), Value::Float(3.0));
        assert_eq!(parse_argument("true").unwrap(), Value::Bool(true));
        assert_eq!(parse_argument("null").unwrap(), Value::Null);
        assert_eq!(parse_argument("\"x\"").unwrap(), Value::from("x"));
        assert_eq!(parse_argument("hello world").unwrap(), Value::from("hello world"));
        assert_eq!(
            parse_argument("[1, 2, 3]").unwrap(),
            Value::Matrix(Matrix::row(&[1.0f64, 2.0, 3.0]))
        );
    }

    #[test]
    fn test_parse_grid_and_mixed_lists() {
        let grid = parse_argument("[[1, 2], [3, 4], [5, 6]]").unwrap();
        let matrix = grid.as_matrix().unwrap();
        assert_eq!(matrix.shape(), &[3, 2]);
        assert_eq!(matrix.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let ragged = parse_argument("[[1, 2], [3]]").unwrap();
        assert_eq!(ragged.as_list().map(<[_]>::len), Some(2));

        let mixed = parse_argument("[1, \"a\"]").unwrap();
        assert_eq!(
            mixed,
            Value::List(vec![Value::Float(1.0), Value::from("a")])
        );

        let empty = parse_argument("[]").unwrap();
        assert_eq!(empty, Value::List(vec![]));

        let map = parse_argument("{\"a\": 1}").unwrap();
        assert!(matches!(map, Value::Map(ref fields) if fields["a"] == Value::Float(1.0)));
    }

    #[test]
    fn test_describe_scalars_and_containers() {
        assert_eq!(describe(&Value::Float(3.0)), "3");
        assert_eq!(describe(&Value::Float(0.5)), "0.5");
        assert_eq!(describe(&Value::Null), "[]");
        assert_eq!(describe(&Value::Complex(Complex::new(1.0, -2.0))), "1-2i");
        assert_eq!(
            describe(&Value::List(vec![Value::Bool(true), Value::from("x")])),
            "{true, x}"
        );

        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), Value::Int(1));
        fields.insert("b".to_string(), Value::from("two"));
        assert_eq!(describe(&Value::Struct(fields)), "a: 1\nb: two");
    }

    #[test]
    fn test_describe_arrays() {
        let m = Matrix::from_elements(vec![2, 2], &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(describe(&Value::Matrix(m)), "[1 2; 3 4]");

        let empty = Matrix::zeros(graft_core::DType::Float64, vec![0, 3]).unwrap();
        assert_eq!(describe(&Value::Matrix(empty)), "[] (0x3 float64)");

        let sparse = SparseMatrix::from_dense(
            &Matrix::from_elements(vec![2, 2], &[0.0f64, 5.0, 0.0, 0.0]).unwrap(),
        )
        .unwrap();
        assert_eq!(describe(&Value::Sparse(sparse)), "sparse 2x2, 1 stored\n  (1,2) 5");
    }
}
