use crate::dtype::DType;
use ndarray::{ArrayD, IxDyn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Dense storage shared by one or more tensor views.
///
/// A `Storage` is a flat f32 buffer behind a mutex. Arena chunks, standalone
/// allocations and user-provided arrays all end up here; tensors address a
/// contiguous sub-range of it.
pub struct Storage {
    data: Mutex<Vec<f32>>,
    sparse: bool,
}

impl Storage {
    pub(crate) fn zeroed(len: usize) -> Arc<Storage> {
        Arc::new(Storage {
            data: Mutex::new(vec![0.0; len]),
            sparse: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<f32>> {
        match self.data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// An immutable handle to a contiguous view of shared dense storage.
///
/// The element layout is first-axis-fastest: the last axis is the
/// slowest-varying one. That makes `slice_last` and `slice_last_range`
/// plain sub-ranges of the buffer, which is what lets the arena hand out
/// views and the engine splice batches without copies.
///
/// Kernels operate on `ndarray` arrays obtained via [`Tensor::to_array`];
/// the array carries the dimensions in reversed order so it is a standard
/// row-major view of the same elements.
#[derive(Clone)]
pub struct Tensor {
    buf: Arc<Storage>,
    offset: usize,
    shape: Vec<usize>,
    dtype: DType,
}

impl Tensor {
    pub(crate) fn view_of(buf: Arc<Storage>, offset: usize, shape: Vec<usize>, dtype: DType) -> Tensor {
        Tensor {
            buf,
            offset,
            shape,
            dtype,
        }
    }

    /// Allocates a fresh zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize], dtype: DType) -> Tensor {
        let len: usize = shape.iter().product();
        Tensor {
            buf: Storage::zeroed(len),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Builds a tensor from an ndarray. The tensor's shape is the array's
    /// dimension list reversed, so that `to_array` round-trips.
    pub fn from_array(arr: &ArrayD<f32>) -> Tensor {
        let mut shape: Vec<usize> = arr.shape().to_vec();
        shape.reverse();
        let data: Vec<f32> = arr.as_standard_layout().iter().cloned().collect();
        Tensor {
            buf: Arc::new(Storage {
                data: Mutex::new(data),
                sparse: false,
            }),
            offset: 0,
            shape,
            dtype: DType::F32,
        }
    }

    /// Like [`Tensor::from_array`], but marks the storage as sparse.
    ///
    /// There are no sparse kernels; the marker only routes matrix products
    /// with this operand away from the batched execution path.
    pub fn sparse_from_array(arr: &ArrayD<f32>) -> Tensor {
        let mut t = Tensor::from_array(arr);
        let data = t.copy_out();
        t.buf = Arc::new(Storage {
            data: Mutex::new(data),
            sparse: true,
        });
        t.offset = 0;
        t
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_sparse(&self) -> bool {
        self.buf.sparse
    }

    /// True if both handles address the same storage range.
    pub fn same_view(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf) && self.offset == other.offset && self.shape == other.shape
    }

    fn inner_len(&self) -> usize {
        self.shape[..self.rank() - 1].iter().product()
    }

    /// A view of the `i`-th entry along the last axis; the axis is dropped.
    pub fn slice_last(&self, i: usize) -> Result<Tensor, String> {
        if self.rank() == 0 {
            return Err("slice_last: cannot slice a scalar tensor".to_string());
        }
        let last = self.shape[self.rank() - 1];
        if i >= last {
            return Err(format!("slice_last: index {} out of range for axis of extent {}", i, last));
        }
        let inner = self.inner_len();
        Ok(Tensor {
            buf: self.buf.clone(),
            offset: self.offset + i * inner,
            shape: self.shape[..self.rank() - 1].to_vec(),
            dtype: self.dtype,
        })
    }

    /// A view of the `[begin, end)` range of the last axis; the axis is kept
    /// with extent `end - begin`.
    pub fn slice_last_range(&self, begin: usize, end: usize) -> Result<Tensor, String> {
        if self.rank() == 0 {
            return Err("slice_last_range: cannot slice a scalar tensor".to_string());
        }
        let last = self.shape[self.rank() - 1];
        if begin > end || end > last {
            return Err(format!(
                "slice_last_range: range {}..{} out of bounds for axis of extent {}",
                begin, end, last
            ));
        }
        let inner = self.inner_len();
        let mut shape = self.shape.clone();
        shape[self.rank() - 1] = end - begin;
        Ok(Tensor {
            buf: self.buf.clone(),
            offset: self.offset + begin * inner,
            shape,
            dtype: self.dtype,
        })
    }

    /// Reinterprets the view with a new shape of the same element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor, String> {
        let new_len: usize = shape.iter().product();
        if new_len != self.len() {
            return Err(format!(
                "reshape: cannot reshape {:?} ({} elements) to {:?} ({} elements)",
                self.shape,
                self.len(),
                shape,
                new_len
            ));
        }
        Ok(Tensor {
            buf: self.buf.clone(),
            offset: self.offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        })
    }

    /// Copies the elements out as an ndarray with the dimensions reversed
    /// (a standard row-major view of the storage order).
    pub fn to_array(&self) -> ArrayD<f32> {
        let mut dims: Vec<usize> = self.shape.clone();
        dims.reverse();
        let data = self.copy_out();
        ArrayD::from_shape_vec(IxDyn(&dims), data).expect("storage length matches shape")
    }

    pub(crate) fn copy_out(&self) -> Vec<f32> {
        let guard = self.buf.lock();
        guard[self.offset..self.offset + self.len()].to_vec()
    }

    pub(crate) fn copy_in(&self, data: &[f32]) -> Result<(), String> {
        if data.len() != self.len() {
            return Err(format!(
                "copy_in: {} elements supplied for a view of {}",
                data.len(),
                self.len()
            ));
        }
        let mut guard = self.buf.lock();
        guard[self.offset..self.offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writes an ndarray result into this view. The array's dimensions must
    /// be the reverse of the view's shape.
    pub fn write_array(&self, arr: &ArrayD<f32>) -> Result<(), String> {
        let mut dims: Vec<usize> = self.shape.clone();
        dims.reverse();
        if arr.shape() != dims.as_slice() {
            return Err(format!(
                "write_array: array shape {:?} does not match view shape {:?} (reversed {:?})",
                arr.shape(),
                self.shape,
                dims
            ));
        }
        let std = arr.as_standard_layout();
        let data: Vec<f32> = std.iter().cloned().collect();
        self.copy_in(&data)
    }

    /// Fills the view with a scalar.
    pub fn set_all(&self, value: f32) {
        let mut guard = self.buf.lock();
        for x in guard[self.offset..self.offset + self.len()].iter_mut() {
            *x = value;
        }
    }

    /// Accumulates `contribution` into this view: `self = beta * self +
    /// contribution`, element by element. A beta of 0 overwrites. The
    /// contribution must have the same element count; its shape is ignored
    /// so that gradients of padded views can land directly.
    pub fn accumulate(&self, contribution: &ArrayD<f32>, beta: f32) -> Result<(), String> {
        if contribution.len() != self.len() {
            return Err(format!(
                "accumulate: contribution has {} elements, view has {}",
                contribution.len(),
                self.len()
            ));
        }
        let std = contribution.as_standard_layout();
        let mut guard = self.buf.lock();
        let slot = &mut guard[self.offset..self.offset + self.len()];
        if beta == 0.0 {
            for (dst, src) in slot.iter_mut().zip(std.iter()) {
                *dst = *src;
            }
        } else {
            for (dst, src) in slot.iter_mut().zip(std.iter()) {
                *dst = beta * *dst + *src;
            }
        }
        Ok(())
    }

    /// Stacks same-length tensors along a new last axis. When `out` is
    /// given, the result is written into it (its element count must be the
    /// sum of the parts); otherwise fresh storage is allocated with shape
    /// `parts[0].shape ++ [N]`.
    pub fn gather(parts: &[Tensor], out: Option<Tensor>) -> Result<Tensor, String> {
        if parts.is_empty() {
            return Err("gather: no tensors supplied".to_string());
        }
        let part_len = parts[0].len();
        for p in parts.iter() {
            if p.len() != part_len {
                return Err(format!(
                    "gather: mismatched part sizes {} vs {}",
                    part_len,
                    p.len()
                ));
            }
        }
        let out = match out {
            Some(t) => {
                if t.len() != part_len * parts.len() {
                    return Err(format!(
                        "gather: destination holds {} elements, need {}",
                        t.len(),
                        part_len * parts.len()
                    ));
                }
                t
            }
            None => {
                let mut shape = parts[0].shape().to_vec();
                shape.push(parts.len());
                Tensor::zeros(&shape, parts[0].dtype())
            }
        };
        for (j, part) in parts.iter().enumerate() {
            let data = part.copy_out();
            let mut guard = out.buf.lock();
            let start = out.offset + j * part_len;
            guard[start..start + part_len].copy_from_slice(&data);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("offset", &self.offset)
            .finish()
    }
}
