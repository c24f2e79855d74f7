use std::cell::RefCell;

use ndarray::{ArrayViewD, CowArray, IxDyn};
use rand::{
    distributions::Standard, prelude::Distribution, rngs::StdRng, thread_rng, Rng, SeedableRng,
};
use serde::{Deserialize, Serialize};

use crate::fixed_dim::FixedDimensions;

thread_local!(static RNG: RefCell<StdRng> =
    RefCell::new(StdRng::from_rng(thread_rng()).expect("Failed to seed StdRng.")));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorElemType {
    Bool,
    F32,
    I32,
    I64,
}

/// Typed element storage. The element type is carried by the variant rather
/// than by an out-of-band tag next to a raw byte buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Bool(Vec<bool>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// A dense constant tensor. Holds the out-of-band attribute values that
/// `GetAttr` nodes address.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: FixedDimensions,
    stride: FixedDimensions,
    data: TensorData,
}

pub trait TensorElemTypeExt: PartialEq + PartialOrd + Copy {
    fn get_type() -> TensorElemType;
    fn zero() -> Self;
    fn close(a: Self, b: Self) -> bool;
    fn wrap(data: Vec<Self>) -> TensorData;
    fn unwrap(data: &TensorData) -> Option<&[Self]>;
}

impl TensorElemType {
    pub fn is_bool(&self) -> bool {
        matches!(self, TensorElemType::Bool)
    }

    pub fn is_f32(&self) -> bool {
        matches!(self, TensorElemType::F32)
    }

    pub fn is_i32(&self) -> bool {
        matches!(self, TensorElemType::I32)
    }

    pub fn is_i64(&self) -> bool {
        matches!(self, TensorElemType::I64)
    }
}

impl TensorData {
    pub fn elem_ty(&self) -> TensorElemType {
        match self {
            TensorData::Bool(_) => TensorElemType::Bool,
            TensorData::F32(_) => TensorElemType::F32,
            TensorData::I32(_) => TensorElemType::I32,
            TensorData::I64(_) => TensorElemType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Tensor {
    pub fn new<T: TensorElemTypeExt>(dims: FixedDimensions, data: Vec<T>) -> Self {
        assert_eq!(
            dims.total_elems(),
            data.len(),
            "tensor data does not fill its shape"
        );
        Self {
            stride: dims.strides(),
            data: T::wrap(data),
            dims,
        }
    }

    pub fn zeros<T: TensorElemTypeExt>(dims: FixedDimensions) -> Self {
        let total_elems = dims.total_elems();
        Self::new(dims, vec![T::zero(); total_elems])
    }

    pub fn zeros_of_type(ty: TensorElemType, dims: FixedDimensions) -> Self {
        let total_elems = dims.total_elems();
        match ty {
            TensorElemType::Bool => Self::new(dims, vec![false; total_elems]),
            TensorElemType::F32 => Self::new(dims, vec![0.0f32; total_elems]),
            TensorElemType::I32 => Self::new(dims, vec![0i32; total_elems]),
            TensorElemType::I64 => Self::new(dims, vec![0i64; total_elems]),
        }
    }

    pub fn rand<T>(dims: FixedDimensions) -> Self
    where
        T: TensorElemTypeExt,
        Standard: Distribution<T>,
    {
        let total_elems = dims.total_elems();
        let data = RNG.with(|r| {
            let mut r = r.borrow_mut();
            (0..total_elems).map(|_| r.gen::<T>()).collect::<Vec<T>>()
        });
        Self::new(dims, data)
    }

    pub fn scalar<T: TensorElemTypeExt>(value: T) -> Self {
        Self::new(FixedDimensions(vec![]), vec![value])
    }

    pub fn dims(&self) -> &FixedDimensions {
        &self.dims
    }

    pub fn strides(&self) -> &FixedDimensions {
        &self.stride
    }

    pub fn elem_ty(&self) -> TensorElemType {
        self.data.elem_ty()
    }

    pub fn raw_data(&self) -> &TensorData {
        &self.data
    }

    /// Typed view of the elements. Panics when `T` does not match the stored
    /// element type; callers dispatch on `elem_ty()` first.
    pub fn data<T: TensorElemTypeExt>(&self) -> &[T] {
        T::unwrap(&self.data).expect("tensor element type mismatch")
    }

    pub fn allclose<T: TensorElemTypeExt>(&self, other: &[T]) -> bool {
        if T::get_type() != self.elem_ty() {
            return false;
        }
        let data = self.data::<T>();
        data.len() == other.len()
            && data
                .iter()
                .zip(other.iter())
                .all(|(&a, &b)| T::close(a, b))
    }

    pub fn allclose_tensor(&self, other: &Tensor) -> bool {
        if self.dims != other.dims || self.elem_ty() != other.elem_ty() {
            return false;
        }
        match &other.data {
            TensorData::Bool(v) => self.allclose(v),
            TensorData::F32(v) => self.allclose(v),
            TensorData::I32(v) => self.allclose(v),
            TensorData::I64(v) => self.allclose(v),
        }
    }

    pub fn as_ndarray<T: TensorElemTypeExt>(&self) -> ArrayViewD<'_, T> {
        ArrayViewD::from_shape(IxDyn(self.dims.as_slice()), self.data::<T>())
            .expect("tensor shape out of sync with its data")
    }
}

impl<T: TensorElemTypeExt> From<&CowArray<'_, T, IxDyn>> for Tensor {
    fn from(arr: &CowArray<T, IxDyn>) -> Self {
        Tensor::new(
            arr.shape().to_vec().into(),
            arr.as_standard_layout().iter().copied().collect(),
        )
    }
}

impl TensorElemTypeExt for bool {
    fn get_type() -> TensorElemType {
        TensorElemType::Bool
    }

    fn zero() -> Self {
        false
    }

    fn close(a: Self, b: Self) -> bool {
        a == b
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::Bool(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl TensorElemTypeExt for f32 {
    fn get_type() -> TensorElemType {
        TensorElemType::F32
    }

    fn zero() -> Self {
        0.
    }

    fn close(a: Self, b: Self) -> bool {
        (a - b).abs() <= 1e-6 + 1e-4 * b.abs()
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::F32(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }
}

impl TensorElemTypeExt for i32 {
    fn get_type() -> TensorElemType {
        TensorElemType::I32
    }

    fn zero() -> Self {
        0
    }

    fn close(a: Self, b: Self) -> bool {
        a == b
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::I32(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }
}

impl TensorElemTypeExt for i64 {
    fn get_type() -> TensorElemType {
        TensorElemType::I64
    }

    fn zero() -> Self {
        0
    }

    fn close(a: Self, b: Self) -> bool {
        a == b
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::I64(data)
    }

    fn unwrap(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }
}

#[test]
fn typed_access() {
    let t = Tensor::new(vec![2, 2].into(), vec![1i64, 2, 3, 4]);
    assert_eq!(t.elem_ty(), TensorElemType::I64);
    assert_eq!(t.data::<i64>(), &[1, 2, 3, 4]);
    assert_eq!(t.dims().total_elems(), 4);
}

#[test]
fn allclose_f32() {
    let t = Tensor::new(vec![2].into(), vec![1.0f32, 0.5]);
    assert!(t.allclose(&[1.0000001f32, 0.5]));
    assert!(!t.allclose(&[1.1f32, 0.5]));
}

#[test]
fn ndarray_view() {
    let t = Tensor::rand::<f32>(vec![2, 3].into());
    let view = t.as_ndarray::<f32>();
    assert_eq!(view.shape(), &[2, 3]);
}

#[test]
#[should_panic]
fn data_type_mismatch() {
    let t = Tensor::new(vec![1].into(), vec![1i64]);
    let _ = t.data::<f32>();
}
