//! Element types and compile-time tensor values.

use crate::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    I32,
    I64,
    U8,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
            DataType::I64 => 8,
            DataType::U8 | DataType::Bool => 1,
        }
    }
}

/// Raw tensor data for constant folding.
///
/// Separated from metadata (shape, dtype) so evaluators can build data first
/// and attach a shape afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I64(Vec<i64>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    Bool(Vec<bool>),
    U8(Vec<u8>),
}

impl TensorData {
    /// Get the number of elements in this tensor data.
    pub fn len(&self) -> usize {
        match self {
            TensorData::I64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    /// Check if this tensor data is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            TensorData::U8(v) => Some(v),
            _ => None,
        }
    }

    /// Get the inferred data type from this tensor data.
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::I64(_) => DataType::I64,
            TensorData::I32(_) => DataType::I32,
            TensorData::F32(_) => DataType::F32,
            TensorData::Bool(_) => DataType::Bool,
            TensorData::U8(_) => DataType::U8,
        }
    }

    /// Gather elements by flat index, preserving the variant.
    pub fn select(&self, indices: &[usize]) -> TensorData {
        match self {
            TensorData::I64(v) => TensorData::I64(indices.iter().map(|&i| v[i]).collect()),
            TensorData::I32(v) => TensorData::I32(indices.iter().map(|&i| v[i]).collect()),
            TensorData::F32(v) => TensorData::F32(indices.iter().map(|&i| v[i]).collect()),
            TensorData::Bool(v) => TensorData::Bool(indices.iter().map(|&i| v[i]).collect()),
            TensorData::U8(v) => TensorData::U8(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Read every element as i64 (integer and bool data only).
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            TensorData::I64(v) => Some(v.clone()),
            TensorData::I32(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TensorData::U8(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TensorData::Bool(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TensorData::F32(_) => None,
        }
    }
}

/// A tensor value known at compile time.
///
/// Bundles data, shape, and dtype together so evaluators for
/// shape-transforming operators (Reshape, Concat, Split) keep them
/// consistent.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    /// The raw tensor data.
    pub data: TensorData,

    /// The shape of the tensor (dimensions).
    pub shape: Vec<usize>,

    /// The data type of the tensor.
    pub dtype: DataType,
}

impl TensorValue {
    /// Create a new TensorValue with data, shape, and dtype.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the shape product or the data
    /// variant doesn't match `dtype`. Use [`TensorValue::try_new`] when the
    /// inputs are not known to be consistent.
    pub fn new(data: TensorData, shape: Vec<usize>, dtype: DataType) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (product = {})",
            data.len(),
            shape,
            expected_len
        );
        assert_eq!(
            data.dtype(),
            dtype,
            "Data type {:?} doesn't match declared dtype {:?}",
            data.dtype(),
            dtype
        );
        Self { data, shape, dtype }
    }

    /// Fallible constructor; the dtype is taken from the data variant.
    pub fn try_new(data: TensorData, shape: Vec<usize>) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(Error::Shape(format!(
                "Data length {} doesn't match shape {:?} (product = {})",
                data.len(),
                shape,
                expected_len
            )));
        }
        let dtype = data.dtype();
        Ok(Self { data, shape, dtype })
    }

    /// Create a one-dimensional f32 value.
    pub fn from_f32(values: Vec<f32>) -> Self {
        let len = values.len();
        Self::new(TensorData::F32(values), vec![len], DataType::F32)
    }

    /// Create a one-dimensional i64 value.
    pub fn from_i64(values: Vec<i64>) -> Self {
        let len = values.len();
        Self::new(TensorData::I64(values), vec![len], DataType::I64)
    }

    /// Create a scalar TensorValue (shape = []).
    pub fn scalar(data: TensorData, dtype: DataType) -> Self {
        Self::new(data, vec![], dtype)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        self.data.as_i64()
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        self.data.as_i32()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        self.data.as_f32()
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        self.data.as_bool()
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        self.data.as_u8()
    }

    /// Create a new TensorValue with a different shape (data unchanged).
    pub fn reshape(&self, new_shape: Vec<usize>) -> Result<Self> {
        Self::try_new(self.data.clone(), new_shape)
    }

    /// Parse a TensorValue from little-endian initializer bytes.
    pub fn from_bytes(bytes: &[u8], dtype: DataType, shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let expected = numel * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(Error::Fold(format!(
                "Invalid byte length for {:?} tensor: expected {}, got {}",
                dtype,
                expected,
                bytes.len()
            )));
        }

        let data = match dtype {
            DataType::I64 => TensorData::I64(bytemuck::pod_collect_to_vec(bytes)),
            DataType::I32 => TensorData::I32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::F32 => TensorData::F32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::U8 => TensorData::U8(bytes.to_vec()),
            DataType::Bool => TensorData::Bool(bytes.iter().map(|&b| b != 0).collect()),
            DataType::F16 => {
                return Err(Error::Fold(
                    "F16 initializers cannot be evaluated at compile time".to_string(),
                ));
            }
        };

        Ok(Self {
            data,
            shape: shape.to_vec(),
            dtype,
        })
    }

    /// Encode this value as little-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::I64(v) => bytemuck::cast_slice(v).to_vec(),
            TensorData::I32(v) => bytemuck::cast_slice(v).to_vec(),
            TensorData::F32(v) => bytemuck::cast_slice(v).to_vec(),
            TensorData::U8(v) => v.clone(),
            TensorData::Bool(v) => v.iter().map(|&b| b as u8).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_value_from_bytes() {
        let bytes = vec![1u8, 0, 0, 0, 2, 0, 0, 0];
        let value = TensorValue::from_bytes(&bytes, DataType::I32, &[2]).unwrap();
        assert_eq!(value.as_i32(), Some(&[1, 2][..]));
        assert_eq!(value.shape, vec![2]);

        // 1.0f32, 2.0f32 in little-endian
        let bytes = vec![0, 0, 128, 63, 0, 0, 0, 64];
        let value = TensorValue::from_bytes(&bytes, DataType::F32, &[2]).unwrap();
        assert_eq!(value.as_f32(), Some(&[1.0, 2.0][..]));
    }

    #[test]
    fn test_tensor_value_from_bytes_rejects_bad_length() {
        let result = TensorValue::from_bytes(&[0, 0, 128], DataType::F32, &[1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_tensor_value_reshape() {
        let value = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 3],
            DataType::F32,
        );

        let reshaped = value.reshape(vec![3, 2]).unwrap();
        assert_eq!(reshaped.shape, vec![3, 2]);
        assert_eq!(reshaped.as_f32(), Some(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0][..]));
        assert!(value.reshape(vec![4]).is_err());
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_tensor_value_new_validates_shape() {
        TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 4],
            DataType::F32,
        );
    }

    #[test]
    fn test_bytes_round_trip_for_i64() {
        let value = TensorValue::from_i64(vec![-3, 7]);
        let decoded = TensorValue::from_bytes(&value.to_bytes(), DataType::I64, &[2]).unwrap();
        assert_eq!(decoded, value);
    }
}
