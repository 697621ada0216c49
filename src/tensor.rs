//! Dense row-major tensors of `f32` values
use std::fmt::{self, Display};

use thiserror::Error;

/// Errors raised when building or combining tensors
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shape {shape:?} holds {expected} elements but {got} were given")]
    DataLength {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("A tensor shape must have at least one dimension")]
    EmptyShape,
    #[error("Shape {shape:?} contains a zero dimension")]
    ZeroDimension { shape: Vec<usize> },
    #[error("All rows must have the same length. Received lengths {lengths:?}")]
    RaggedRows { lengths: Vec<usize> },
    #[error("Operation `{op}` is not defined for shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
}

/// An n-dimensional tensor, stored contiguously in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

fn check_shape(shape: &[usize]) -> Result<usize, TensorError> {
    if shape.is_empty() {
        return Err(TensorError::EmptyShape);
    }
    if shape.contains(&0) {
        return Err(TensorError::ZeroDimension {
            shape: shape.to_vec(),
        });
    }
    Ok(shape.iter().product())
}

impl Tensor {
    pub fn new(shape: &[usize], data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = check_shape(shape)?;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                shape: shape.to_vec(),
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn zeros(shape: &[usize]) -> Result<Self, TensorError> {
        let len = check_shape(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        })
    }

    /// A `(1,)` tensor
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![1],
            data: vec![value],
        }
    }

    /// Builds a `(rows, cols)` tensor from a list of rows
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self, TensorError> {
        let lengths = rows.iter().map(|r| r.as_ref().len()).collect::<Vec<_>>();
        let cols = lengths.first().copied().unwrap_or(0);
        if lengths.iter().any(|&l| l != cols) {
            return Err(TensorError::RaggedRows { lengths });
        }
        let data = rows
            .iter()
            .flat_map(|r| r.as_ref().iter().copied())
            .collect();
        Self::new(&[rows.len(), cols], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value of a one-element tensor, whatever its rank
    pub fn item(&self) -> Option<f32> {
        match self.data.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    fn dims2(&self) -> Option<(usize, usize)> {
        match self.shape.as_slice() {
            &[rows, cols] => Some((rows, cols)),
            _ => None,
        }
    }

    /// Element at `(row, col)` of a 2-D tensor
    pub fn at(&self, row: usize, col: usize) -> Option<f32> {
        let (rows, cols) = self.dims2()?;
        if row >= rows || col >= cols {
            return None;
        }
        Some(self.data[row * cols + col])
    }

    pub fn reshape(self, shape: &[usize]) -> Result<Self, TensorError> {
        Self::new(shape, self.data)
    }

    /// Matrix product of two 2-D tensors
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let mismatch = || TensorError::ShapeMismatch {
            op: "matmul",
            lhs: self.shape.clone(),
            rhs: other.shape.clone(),
        };
        let (n, k) = self.dims2().ok_or_else(mismatch)?;
        let (k2, m) = other.dims2().ok_or_else(mismatch)?;
        if k != k2 {
            return Err(mismatch());
        }
        let mut out = vec![0.0; n * m];
        for i in 0..n {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                let row = &other.data[p * m..(p + 1) * m];
                for (o, b) in out[i * m..(i + 1) * m].iter_mut().zip(row) {
                    *o += a * b;
                }
            }
        }
        Tensor::new(&[n, m], out)
    }

    pub fn transpose(&self) -> Result<Tensor, TensorError> {
        let (rows, cols) = self.dims2().ok_or_else(|| TensorError::ShapeMismatch {
            op: "transpose",
            lhs: self.shape.clone(),
            rhs: vec![],
        })?;
        let mut out = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = self.data[r * cols + c];
            }
        }
        Tensor::new(&[cols, rows], out)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Combines two tensors of identical shape element by element
    pub fn zip_map(
        &self,
        other: &Tensor,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                op: "zip_map",
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// Adds a `(1, cols)` row to every row of a `(rows, cols)` tensor
    pub fn add_row(&self, row: &Tensor) -> Result<Tensor, TensorError> {
        let mismatch = || TensorError::ShapeMismatch {
            op: "add_row",
            lhs: self.shape.clone(),
            rhs: row.shape.clone(),
        };
        let (_, cols) = self.dims2().ok_or_else(mismatch)?;
        if row.shape != [1, cols] {
            return Err(mismatch());
        }
        let mut out = self.clone();
        for chunk in out.data.chunks_mut(cols) {
            for (o, b) in chunk.iter_mut().zip(row.data.iter()) {
                *o += b;
            }
        }
        Ok(out)
    }

    /// Column sums of a 2-D tensor, as a `(1, cols)` row
    pub fn sum_rows(&self) -> Result<Tensor, TensorError> {
        let (_, cols) = self.dims2().ok_or_else(|| TensorError::ShapeMismatch {
            op: "sum_rows",
            lhs: self.shape.clone(),
            rhs: vec![],
        })?;
        let mut out = vec![0.0; cols];
        for chunk in self.data.chunks(cols) {
            for (o, v) in out.iter_mut().zip(chunk) {
                *o += v;
            }
        }
        Tensor::new(&[1, cols], out)
    }

    pub fn add_assign(&mut self, other: &Tensor) -> Result<(), TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                op: "add_assign",
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data={:?})", self.shape, self.data)
    }
}
