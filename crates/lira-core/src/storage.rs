use std::sync::Arc;

use crate::element::FloatElement;
use crate::DType;

/// Shared, reference-counted tensor storage.
///
/// Storage is reference-counted (`Arc`) so multiple tensors can share the same
/// underlying bytes (e.g. reshaped views). Typed access goes through
/// `bytemuck`; widening to `f64` reads unaligned elements so it never fails.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<Vec<u8>>,
    dtype: DType,
    /// Number of logical elements (not bytes).
    numel: usize,
}

impl Storage {
    /// Allocate zeroed storage for `numel` elements of the given dtype.
    ///
    /// All supported dtypes encode `+0.0` as all-zero bytes.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        let nbytes = dtype.storage_bytes(numel);
        Self {
            data: Arc::new(vec![0u8; nbytes]),
            dtype,
            numel,
        }
    }

    /// Create storage from a typed slice.
    pub fn from_slice<T: FloatElement>(data: &[T]) -> Self {
        Self {
            data: Arc::new(bytemuck::cast_slice::<T, u8>(data).to_vec()),
            dtype: T::DTYPE,
            numel: data.len(),
        }
    }

    /// Narrow accumulation-precision values into storage of `dtype`.
    pub fn narrow_from_f64(data: &[f64], dtype: DType) -> Self {
        match dtype {
            DType::F16 => Self::from_slice(&narrow::<half::f16>(data)),
            DType::BF16 => Self::from_slice(&narrow::<half::bf16>(data)),
            DType::F32 => Self::from_slice(&narrow::<f32>(data)),
            DType::F64 => Self::from_slice(data),
        }
    }

    /// Get the dtype of this storage.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Get a read-only reference to the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Interpret storage as a typed slice.
    /// Returns None if the dtype differs or the bytes are misaligned for `T`.
    pub fn as_slice<T: FloatElement>(&self) -> Option<&[T]> {
        if self.dtype != T::DTYPE {
            return None;
        }
        bytemuck::try_cast_slice(self.as_bytes()).ok()
    }

    /// Interpret storage as a slice of f32 values.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.as_slice::<f32>()
    }

    /// Interpret storage as a slice of f64 values.
    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        self.as_slice::<f64>()
    }

    /// Read element `index` widened to f64.
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        if index >= self.numel {
            return None;
        }
        let size = self.dtype.element_size();
        let bytes = &self.as_bytes()[index * size..(index + 1) * size];
        Some(match self.dtype {
            DType::F16 => bytemuck::pod_read_unaligned::<half::f16>(bytes).to_f64(),
            DType::BF16 => bytemuck::pod_read_unaligned::<half::bf16>(bytes).to_f64(),
            DType::F32 => bytemuck::pod_read_unaligned::<f32>(bytes) as f64,
            DType::F64 => bytemuck::pod_read_unaligned::<f64>(bytes),
        })
    }

    /// Copy every element into a new `Vec<f64>` (widening).
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.dtype {
            DType::F16 => widen::<half::f16>(self.as_bytes()),
            DType::BF16 => widen::<half::bf16>(self.as_bytes()),
            DType::F32 => widen::<f32>(self.as_bytes()),
            DType::F64 => widen::<f64>(self.as_bytes()),
        }
    }
}

fn widen<T: FloatElement>(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(|chunk| bytemuck::pod_read_unaligned::<T>(chunk).to_f64())
        .collect()
}

fn narrow<T: FloatElement>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&v| T::from_f64(v)).collect()
}
