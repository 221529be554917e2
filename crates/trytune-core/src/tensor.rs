use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use half::f16;
use smallvec::SmallVec;

use crate::TensorError;

/// Tensors keyed by port or pipeline tensor name.
pub type TensorMap = BTreeMap<String, Tensor>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::I16 | DType::F16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// KServe v2 / Triton datatype name.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "BOOL",
            DType::U8 => "UINT8",
            DType::I8 => "INT8",
            DType::I16 => "INT16",
            DType::I32 => "INT32",
            DType::I64 => "INT64",
            DType::F16 => "FP16",
            DType::F32 => "FP32",
            DType::F64 => "FP64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = TensorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw {
            "BOOL" => DType::Bool,
            "UINT8" => DType::U8,
            "INT8" => DType::I8,
            "INT16" => DType::I16,
            "INT32" => DType::I32,
            "INT64" => DType::I64,
            "FP16" => DType::F16,
            "FP32" => DType::F32,
            "FP64" => DType::F64,
            other => return Err(TensorError::UnsupportedDType(other.to_string())),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    /// Element count. Saturates at `usize::MAX`; tensor constructors reject
    /// shapes whose element count overflows.
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }
    pub fn checked_numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Resolves a requested shape where `-1` marks a single dimension to infer
    /// from `numel`, the same way a numpy reshape does.
    pub fn resolve(requested: &[i64], numel: usize) -> Result<Self, TensorError> {
        let mut inferred = None;
        let mut known = 1usize;
        let mut dims = SmallVec::<[usize; 6]>::with_capacity(requested.len());

        for (idx, dim) in requested.iter().enumerate() {
            match *dim {
                -1 => {
                    if inferred.replace(idx).is_some() {
                        return Err(TensorError::AmbiguousShape(requested.to_vec()));
                    }
                    dims.push(0);
                }
                d if d >= 0 => {
                    let d = usize::try_from(d)
                        .map_err(|_| TensorError::InvalidShape(requested.to_vec()))?;
                    known = known
                        .checked_mul(d)
                        .ok_or_else(|| TensorError::InvalidShape(requested.to_vec()))?;
                    dims.push(d);
                }
                _ => return Err(TensorError::InvalidShape(requested.to_vec())),
            }
        }

        if let Some(idx) = inferred {
            if known == 0 || numel % known != 0 {
                return Err(TensorError::NumelMismatch {
                    shape: requested.to_vec(),
                    numel,
                });
            }
            dims[idx] = numel / known;
        } else if known != numel {
            return Err(TensorError::NumelMismatch {
                shape: requested.to_vec(),
                numel,
            });
        }

        Ok(Self(dims))
    }
}

fn signed_dims(shape: &Shape) -> Vec<i64> {
    shape.dims().iter().map(|d| *d as i64).collect()
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

/// A dense, row-major tensor. Element storage is little-endian.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    data: Bytes,
}

impl Tensor {
    pub fn from_bytes(dtype: DType, shape: Shape, data: Bytes) -> Result<Self, TensorError> {
        let expected = shape
            .checked_numel()
            .and_then(|n| n.checked_mul(dtype.byte_size()))
            .ok_or_else(|| TensorError::InvalidShape(signed_dims(&shape)))?;
        if data.len() != expected {
            return Err(TensorError::ByteLength {
                dtype,
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Encodes numeric values as `dtype`. Integer types truncate toward zero
    /// and reject values outside their range.
    pub fn from_values(dtype: DType, shape: Shape, values: &[f64]) -> Result<Self, TensorError> {
        let numel = shape
            .checked_numel()
            .ok_or_else(|| TensorError::InvalidShape(signed_dims(&shape)))?;
        if values.len() != numel {
            return Err(TensorError::NumelMismatch {
                shape: signed_dims(&shape),
                numel: values.len(),
            });
        }

        let int = |v: f64, min: f64, max: f64| {
            let t = v.trunc();
            // NaN fails both comparisons. `max + 1.0` keeps i64::MAX, which
            // rounds up to 2^63 as f64, exclusive.
            if t >= min && t < max + 1.0 {
                Ok(t)
            } else {
                Err(TensorError::OutOfRange { dtype, value: v })
            }
        };

        let mut buf = BytesMut::with_capacity(values.len() * dtype.byte_size());
        for &v in values {
            match dtype {
                DType::Bool => buf.extend_from_slice(&[(v != 0.0) as u8]),
                DType::U8 => {
                    buf.extend_from_slice(&(int(v, u8::MIN as f64, u8::MAX as f64)? as u8).to_le_bytes())
                }
                DType::I8 => {
                    buf.extend_from_slice(&(int(v, i8::MIN as f64, i8::MAX as f64)? as i8).to_le_bytes())
                }
                DType::I16 => buf
                    .extend_from_slice(&(int(v, i16::MIN as f64, i16::MAX as f64)? as i16).to_le_bytes()),
                DType::I32 => buf
                    .extend_from_slice(&(int(v, i32::MIN as f64, i32::MAX as f64)? as i32).to_le_bytes()),
                DType::I64 => buf
                    .extend_from_slice(&(int(v, i64::MIN as f64, i64::MAX as f64)? as i64).to_le_bytes()),
                DType::F16 => buf.extend_from_slice(&f16::from_f64(v).to_le_bytes()),
                DType::F32 => buf.extend_from_slice(&(v as f32).to_le_bytes()),
                DType::F64 => buf.extend_from_slice(&v.to_le_bytes()),
            }
        }

        Ok(Self {
            dtype,
            shape,
            data: buf.freeze(),
        })
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> Result<Self, TensorError> {
        let mut buf = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_bytes(DType::F32, shape, buf.freeze())
    }

    pub fn from_i64(shape: Shape, values: &[i64]) -> Result<Self, TensorError> {
        let mut buf = BytesMut::with_capacity(values.len() * 8);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_bytes(DType::I64, shape, buf.freeze())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Decodes every element as `f64`. INT64 values beyond 2^53 lose
    /// precision; use [`Tensor::to_i64`] for those.
    pub fn to_values(&self) -> Vec<f64> {
        let size = self.dtype.byte_size();
        self.data
            .chunks_exact(size)
            .map(|b| match self.dtype {
                DType::Bool | DType::U8 => b[0] as f64,
                DType::I8 => b[0] as i8 as f64,
                DType::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
                DType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
                DType::I64 => {
                    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
                }
                DType::F16 => f16::from_le_bytes([b[0], b[1]]).to_f64(),
                DType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
                DType::F64 => {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                }
            })
            .collect()
    }

    pub fn to_f32(&self) -> Result<Vec<f32>, TensorError> {
        self.expect_dtype(DType::F32)?;
        Ok(self
            .data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn to_i64(&self) -> Result<Vec<i64>, TensorError> {
        self.expect_dtype(DType::I64)?;
        Ok(self
            .data
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect())
    }

    fn expect_dtype(&self, dtype: DType) -> Result<(), TensorError> {
        if self.dtype != dtype {
            return Err(TensorError::DTypeMismatch {
                expected: dtype,
                got: self.dtype,
            });
        }
        Ok(())
    }

    /// Returns the same storage viewed with a new shape.
    pub fn reshape(&self, requested: &[i64]) -> Result<Self, TensorError> {
        let shape = Shape::resolve(requested, self.numel())?;
        Ok(Self {
            dtype: self.dtype,
            shape,
            data: self.data.clone(),
        })
    }

    /// Size of the leading (batch) dimension.
    pub fn batch_size(&self) -> usize {
        self.shape.0.first().copied().unwrap_or(1)
    }

    /// Concatenates tensors along dimension 0. All parts must share dtype and
    /// trailing dimensions.
    pub fn concat_batch(parts: &[&Tensor]) -> Result<Self, TensorError> {
        let Some(first) = parts.first() else {
            return Err(TensorError::EmptyBatch);
        };
        if first.shape.rank() == 0 {
            return Err(TensorError::ScalarBatch);
        }

        let mut rows = 0;
        let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for part in parts {
            if part.dtype != first.dtype
                || part.shape.rank() != first.shape.rank()
                || part.shape.0[1..] != first.shape.0[1..]
            {
                return Err(TensorError::IncompatibleBatch {
                    first: first.shape.clone(),
                    other: part.shape.clone(),
                });
            }
            rows += part.batch_size();
            buf.extend_from_slice(&part.data);
        }

        let mut dims = first.shape.0.clone();
        dims[0] = rows;
        Ok(Self {
            dtype: first.dtype,
            shape: Shape(dims),
            data: buf.freeze(),
        })
    }

    /// Splits along dimension 0 into chunks of `sizes` rows each.
    pub fn split_batch(&self, sizes: &[usize]) -> Result<Vec<Self>, TensorError> {
        if self.shape.rank() == 0 {
            return Err(TensorError::ScalarBatch);
        }
        let total: usize = sizes.iter().sum();
        if total != self.batch_size() {
            return Err(TensorError::BatchSplit {
                rows: self.batch_size(),
                requested: total,
            });
        }

        let row_bytes = self.shape.0[1..].iter().product::<usize>() * self.dtype.byte_size();
        let mut offset = 0;
        let mut out = Vec::with_capacity(sizes.len());
        for rows in sizes {
            let len = rows * row_bytes;
            let mut dims = self.shape.0.clone();
            dims[0] = *rows;
            out.push(Self {
                dtype: self.dtype,
                shape: Shape(dims),
                data: self.data.slice(offset..offset + len),
            });
            offset += len;
        }
        Ok(out)
    }
}

/// An inference request payload before it has been bound to a port contract:
/// flat numeric data plus an optional caller-declared shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensorPayload {
    pub data: Vec<f64>,
    pub shape: Option<Vec<i64>>,
}

impl TensorPayload {
    pub fn new(data: Vec<f64>) -> Self {
        Self { data, shape: None }
    }

    pub fn with_shape(mut self, shape: Vec<i64>) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Builds a tensor of `dtype`, using the explicit shape when present and
    /// falling back to `default_dims` (`None` = dynamic) otherwise.
    pub fn into_tensor(
        self,
        dtype: DType,
        default_dims: &[Option<usize>],
    ) -> Result<Tensor, TensorError> {
        let requested = match self.shape {
            Some(shape) => shape,
            None => default_dims
                .iter()
                .map(|d| d.map(|d| d as i64).unwrap_or(-1))
                .collect(),
        };
        let shape = Shape::resolve(&requested, self.data.len())?;
        Tensor::from_values(dtype, shape, &self.data)
    }
}
