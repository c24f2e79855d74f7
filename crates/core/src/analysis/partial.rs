use std::borrow::Cow;

use thiserror::Error;

use crate::{
    symdim::{SymbolicDimension, SymbolicDimensions},
    tensor::{Tensor, TensorData, TensorElemType},
};

/// Element tracking is limited to tensors at most this large. Only small
/// tensors (shapes, axis lists, scalars) benefit from element-level
/// propagation; everything bigger tracks its shape only.
pub const DEFAULT_MAX_TRACKED_ELEMS: usize = 32;

#[derive(Debug, Clone, Error)]
pub enum PartialError {
    #[error("division by a statically-known zero")]
    DivisionByZero,

    #[error("conflicting concrete values while merging: {0:?} vs {1:?}")]
    MergeConflict(Scalar, Scalar),

    #[error("element type mismatch: {0:?} vs {1:?}")]
    TypeMismatch(TensorElemType, TensorElemType),

    #[error("incompatible shapes: {0}")]
    IncompatibleShapes(Cow<'static, str>),

    #[error("index {0} out of range for length {1}")]
    IndexOutOfRange(i64, usize),

    #[error("Something went wrong: {0}")]
    Todo(Cow<'static, str>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
}

impl Scalar {
    pub fn elem_ty(&self) -> TensorElemType {
        match self {
            Scalar::Bool(_) => TensorElemType::Bool,
            Scalar::I32(_) => TensorElemType::I32,
            Scalar::I64(_) => TensorElemType::I64,
            Scalar::F32(_) => TensorElemType::F32,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Scalar::I32(0) | Scalar::I64(0) => true,
            Scalar::F32(x) => *x == 0.,
            _ => false,
        }
    }

    pub fn is_one(&self) -> bool {
        match self {
            Scalar::I32(1) | Scalar::I64(1) => true,
            Scalar::F32(x) => *x == 1.,
            _ => false,
        }
    }

    fn zero_like(&self) -> Scalar {
        match self {
            Scalar::Bool(_) => Scalar::Bool(false),
            Scalar::I32(_) => Scalar::I32(0),
            Scalar::I64(_) => Scalar::I64(0),
            Scalar::F32(_) => Scalar::F32(0.),
        }
    }

    fn one_of(ty: TensorElemType) -> Scalar {
        match ty {
            TensorElemType::Bool => Scalar::Bool(true),
            TensorElemType::I32 => Scalar::I32(1),
            TensorElemType::I64 => Scalar::I64(1),
            TensorElemType::F32 => Scalar::F32(1.),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Bool(b) => Some(*b as i64),
            Scalar::I32(x) => Some(*x as i64),
            Scalar::I64(x) => Some(*x),
            Scalar::F32(_) => None,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Scalar::Bool(b) => *b as u8 as f64,
            Scalar::I32(x) => *x as f64,
            Scalar::I64(x) => *x as f64,
            Scalar::F32(x) => *x as f64,
        }
    }

    pub fn cast(&self, to: TensorElemType) -> Scalar {
        match to {
            TensorElemType::Bool => Scalar::Bool(self.as_f64() != 0.),
            TensorElemType::I32 => Scalar::I32(self.as_f64() as i32),
            TensorElemType::I64 => Scalar::I64(self.as_f64() as i64),
            TensorElemType::F32 => Scalar::F32(self.as_f64() as f32),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Greater,
    Less,
    Equal,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(self, BinaryOp::Greater | BinaryOp::Less | BinaryOp::Equal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Prod,
    Min,
    Max,
}

fn scalar_binary(op: BinaryOp, a: Scalar, b: Scalar) -> Result<Scalar, PartialError> {
    use BinaryOp::*;
    use Scalar::*;
    Ok(match (a, b) {
        (I64(x), I64(y)) => match op {
            Add => I64(x + y),
            Sub => I64(x - y),
            Mul => I64(x * y),
            Div => {
                if y == 0 {
                    return Err(PartialError::DivisionByZero);
                }
                I64(x / y)
            }
            Pow => {
                if y < 0 {
                    return Err(PartialError::Todo("negative integer exponent".into()));
                }
                I64(x.pow(y as u32))
            }
            Greater => Bool(x > y),
            Less => Bool(x < y),
            Equal => Bool(x == y),
        },
        (I32(x), I32(y)) => {
            let wide = scalar_binary(op, I64(x as i64), I64(y as i64))?;
            match wide {
                I64(v) => I32(v as i32),
                other => other,
            }
        }
        (F32(x), F32(y)) => match op {
            Add => F32(x + y),
            Sub => F32(x - y),
            Mul => F32(x * y),
            Div => {
                if y == 0. {
                    return Err(PartialError::DivisionByZero);
                }
                F32(x / y)
            }
            Pow => F32(x.powf(y)),
            Greater => Bool(x > y),
            Less => Bool(x < y),
            Equal => Bool(x == y),
        },
        (Bool(x), Bool(y)) => match op {
            Equal => Bool(x == y),
            _ => return Err(PartialError::Todo("arithmetic on bool elements".into())),
        },
        (a, b) => return Err(PartialError::TypeMismatch(a.elem_ty(), b.elem_ty())),
    })
}

/// A single abstract element: entirely unknown, a concrete value, or a
/// named symbolic parameter. `Value` and `Param` are incomparable leaves
/// above `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialTensorElement {
    Unknown,
    Value(Scalar),
    Param(String),
}

impl PartialTensorElement {
    pub fn value(&self) -> Option<Scalar> {
        match self {
            PartialTensorElement::Value(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, PartialTensorElement::Unknown)
    }

    /// Elementwise binary op over the lattice. Zero/one algebraic
    /// identities short-circuit to exact results even when the other
    /// operand is unknown or symbolic; everything else requires both sides
    /// concrete. A symbolic term never collapses into a concrete result.
    fn binary(op: BinaryOp, a: &Self, b: &Self) -> Result<Self, PartialError> {
        use BinaryOp::*;
        use PartialTensorElement::*;

        if op == Div {
            if let Value(s) = b {
                if s.is_zero() {
                    return Err(PartialError::DivisionByZero);
                }
            }
        }
        match op {
            Add => match (a, b) {
                (Value(s), other) if s.is_zero() => return Ok(other.clone()),
                (other, Value(s)) if s.is_zero() => return Ok(other.clone()),
                _ => {}
            },
            Sub => {
                if let (other, Value(s)) = (a, b) {
                    if s.is_zero() {
                        return Ok(other.clone());
                    }
                }
            }
            Mul => match (a, b) {
                (Value(s), _) | (_, Value(s)) if s.is_zero() => {
                    return Ok(Value(s.zero_like()))
                }
                (Value(s), other) if s.is_one() => return Ok(other.clone()),
                (other, Value(s)) if s.is_one() => return Ok(other.clone()),
                _ => {}
            },
            Div => {
                if let (other, Value(s)) = (a, b) {
                    if s.is_one() {
                        return Ok(other.clone());
                    }
                }
            }
            Pow => match (a, b) {
                (_, Value(s)) if s.is_zero() => {
                    return Ok(Value(Scalar::one_of(s.elem_ty())))
                }
                (other, Value(s)) if s.is_one() => return Ok(other.clone()),
                (Value(s), _) if s.is_one() => return Ok(Value(*s)),
                _ => {}
            },
            _ => {}
        }
        match (a, b) {
            (Value(x), Value(y)) => Ok(Value(scalar_binary(op, *x, *y)?)),
            _ => Ok(Unknown),
        }
    }

    fn merge(&self, other: &Self) -> Result<Self, PartialError> {
        use PartialTensorElement::*;
        match (self, other) {
            (Value(x), Value(y)) => {
                if x == y {
                    Ok(Value(*x))
                } else {
                    Err(PartialError::MergeConflict(*x, *y))
                }
            }
            (Value(x), _) | (_, Value(x)) => Ok(Value(*x)),
            (Param(p), _) => Ok(Param(p.clone())),
            (_, Param(p)) => Ok(Param(p.clone())),
            (Unknown, Unknown) => Ok(Unknown),
        }
    }
}

/// Abstract value of one tensor: its element type, a symbolic shape and,
/// for small fully-static tensors, per-element lattice values.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialTensor {
    elem_ty: TensorElemType,
    shape: Option<SymbolicDimensions>,
    elems: Option<Vec<PartialTensorElement>>,
}

impl PartialTensor {
    /// Element vectors are kept only when the shape is fully static, the
    /// length matches and at least one element carries information.
    fn assemble(
        elem_ty: TensorElemType,
        shape: Option<SymbolicDimensions>,
        elems: Option<Vec<PartialTensorElement>>,
    ) -> Self {
        let elems = elems.filter(|es| {
            shape
                .as_ref()
                .and_then(SymbolicDimensions::total_elems)
                .is_some_and(|n| n == es.len())
                && es.iter().any(PartialTensorElement::is_known)
        });
        Self {
            elem_ty,
            shape,
            elems,
        }
    }

    pub fn elem_ty(&self) -> TensorElemType {
        self.elem_ty
    }

    pub fn shape(&self) -> Option<&SymbolicDimensions> {
        self.shape.as_ref()
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(SymbolicDimensions::len)
    }

    pub fn total_elems(&self) -> Option<usize> {
        self.shape.as_ref().and_then(SymbolicDimensions::total_elems)
    }

    pub fn elems(&self) -> Option<&[PartialTensorElement]> {
        self.elems.as_deref()
    }

    /// The `i`-th element in row-major order; `Unknown` when untracked.
    pub fn get(&self, i: usize) -> PartialTensorElement {
        self.elems
            .as_ref()
            .and_then(|es| es.get(i).cloned())
            .unwrap_or(PartialTensorElement::Unknown)
    }

    pub fn is_shape_static(&self) -> bool {
        self.shape
            .as_ref()
            .is_some_and(SymbolicDimensions::is_fully_static)
    }

    /// Fully static: the shape is concrete and every element is a concrete
    /// value.
    pub fn is_static(&self) -> bool {
        self.is_shape_static()
            && match (&self.elems, self.total_elems()) {
                (Some(es), _) => es.iter().all(|e| e.value().is_some()),
                (None, Some(0)) => true,
                _ => false,
            }
    }

    /// Materializes a fully static partial tensor back into a constant.
    pub fn to_tensor(&self) -> Option<Tensor> {
        if !self.is_static() {
            return None;
        }
        let dims = self.shape.as_ref()?.to_fixed()?;
        let empty = vec![];
        let es = self.elems.as_deref().unwrap_or(&empty);
        let data = match self.elem_ty {
            TensorElemType::Bool => TensorData::Bool(
                es.iter()
                    .map(|e| e.value().map(|s| s.as_f64() != 0.))
                    .collect::<Option<_>>()?,
            ),
            TensorElemType::F32 => TensorData::F32(
                es.iter()
                    .map(|e| match e.value()? {
                        Scalar::F32(x) => Some(x),
                        _ => None,
                    })
                    .collect::<Option<_>>()?,
            ),
            TensorElemType::I32 => TensorData::I32(
                es.iter()
                    .map(|e| e.value()?.as_i64().map(|x| x as i32))
                    .collect::<Option<_>>()?,
            ),
            TensorElemType::I64 => TensorData::I64(
                es.iter()
                    .map(|e| e.value()?.as_i64())
                    .collect::<Option<_>>()?,
            ),
        };
        match data {
            TensorData::Bool(v) => Some(Tensor::new(dims, v)),
            TensorData::F32(v) => Some(Tensor::new(dims, v)),
            TensorData::I32(v) => Some(Tensor::new(dims, v)),
            TensorData::I64(v) => Some(Tensor::new(dims, v)),
        }
    }

    /// Max-defined union of two partial tensors known to describe the same
    /// value: per dimension and per element the more concrete side wins,
    /// and two disagreeing concrete sides are an error.
    pub fn merge(&self, other: &Self) -> Result<Self, PartialError> {
        if self.elem_ty != other.elem_ty {
            return Err(PartialError::TypeMismatch(self.elem_ty, other.elem_ty));
        }
        let shape = match (&self.shape, &other.shape) {
            (None, s) | (s, None) => s.clone(),
            (Some(x), Some(y)) => {
                if x.len() != y.len() {
                    return Err(PartialError::IncompatibleShapes(
                        format!("rank {} vs {}", x.len(), y.len()).into(),
                    ));
                }
                let dims = x
                    .as_slice()
                    .iter()
                    .zip(y.as_slice())
                    .map(|(a, b)| {
                        a.merge(b).ok_or_else(|| {
                            PartialError::IncompatibleShapes(
                                format!("conflicting dimensions {a:?} vs {b:?}").into(),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Some(SymbolicDimensions(dims))
            }
        };
        let elems = match (&self.elems, &other.elems) {
            (Some(x), Some(y)) => {
                if x.len() != y.len() {
                    return Err(PartialError::IncompatibleShapes(
                        "tracked element counts differ".into(),
                    ));
                }
                Some(
                    x.iter()
                        .zip(y)
                        .map(|(a, b)| a.merge(b))
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
            (Some(x), None) | (None, Some(x)) => Some(x.clone()),
            (None, None) => None,
        };
        Ok(Self::assemble(self.elem_ty, shape, elems))
    }
}

fn strides_of(dims: &[usize]) -> Vec<usize> {
    (0..dims.len())
        .map(|i| dims[i + 1..].iter().product())
        .collect()
}

/// Fetches the element of `t` feeding flat output position `flat` under
/// numpy broadcasting of `t` against `out_dims`. Untracked or non-static
/// operands yield `Unknown`.
fn broadcast_fetch(
    t: &PartialTensor,
    out_dims: &[usize],
    out_strides: &[usize],
    flat: usize,
) -> PartialTensorElement {
    let Some(shape) = t.shape() else {
        return PartialTensorElement::Unknown;
    };
    let Some(fixed) = shape.to_fixed() else {
        return PartialTensorElement::Unknown;
    };
    let Some(elems) = t.elems() else {
        return PartialTensorElement::Unknown;
    };
    let offset = out_dims.len() - fixed.len();
    let own_strides = fixed.strides();
    let mut own_flat = 0;
    for k in 0..fixed.len() {
        let coord = (flat / out_strides[offset + k]) % out_dims[offset + k];
        let c = if fixed[k] == 1 { 0 } else { coord };
        own_flat += c * own_strides[k];
    }
    elems[own_flat].clone()
}

fn fold_values(op: ReduceOp, ty: TensorElemType, values: &[Scalar]) -> Option<Scalar> {
    match ty {
        TensorElemType::I64 | TensorElemType::I32 => {
            let xs: Vec<i64> = values.iter().map(|s| s.as_i64()).collect::<Option<_>>()?;
            let folded = match op {
                ReduceOp::Sum => xs.iter().sum::<i64>(),
                ReduceOp::Mean => xs.iter().sum::<i64>() / xs.len() as i64,
                ReduceOp::Prod => xs.iter().product::<i64>(),
                ReduceOp::Min => *xs.iter().min()?,
                ReduceOp::Max => *xs.iter().max()?,
            };
            Some(match ty {
                TensorElemType::I32 => Scalar::I32(folded as i32),
                _ => Scalar::I64(folded),
            })
        }
        TensorElemType::F32 => {
            let xs: Vec<f32> = values
                .iter()
                .map(|s| match s {
                    Scalar::F32(x) => Some(*x),
                    _ => None,
                })
                .collect::<Option<_>>()?;
            let folded = match op {
                ReduceOp::Sum => xs.iter().sum::<f32>(),
                ReduceOp::Mean => xs.iter().sum::<f32>() / xs.len() as f32,
                ReduceOp::Prod => xs.iter().product::<f32>(),
                ReduceOp::Min => xs.iter().copied().fold(f32::INFINITY, f32::min),
                ReduceOp::Max => xs.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            };
            Some(Scalar::F32(folded))
        }
        TensorElemType::Bool => None,
    }
}

/// The abstract-interpretation engine. Owns the element-tracking bound and
/// implements the per-operator transfer rules the graph builder applies
/// while constructing nodes.
#[derive(Debug, Clone)]
pub struct PartialInferenceContext {
    pub max_tracked_elems: usize,
}

impl Default for PartialInferenceContext {
    fn default() -> Self {
        Self {
            max_tracked_elems: DEFAULT_MAX_TRACKED_ELEMS,
        }
    }
}

impl PartialInferenceContext {
    fn track(&self, shape: &Option<SymbolicDimensions>) -> bool {
        shape
            .as_ref()
            .and_then(SymbolicDimensions::total_elems)
            .is_some_and(|n| n <= self.max_tracked_elems)
    }

    /// A fully concrete abstract value for a constant tensor.
    pub fn from_tensor(&self, t: &Tensor) -> PartialTensor {
        let shape = Some(SymbolicDimensions::from(t.dims()));
        let elems = (t.dims().total_elems() <= self.max_tracked_elems).then(|| {
            match t.raw_data() {
                TensorData::Bool(v) => v
                    .iter()
                    .map(|&x| PartialTensorElement::Value(Scalar::Bool(x)))
                    .collect(),
                TensorData::F32(v) => v
                    .iter()
                    .map(|&x| PartialTensorElement::Value(Scalar::F32(x)))
                    .collect(),
                TensorData::I32(v) => v
                    .iter()
                    .map(|&x| PartialTensorElement::Value(Scalar::I32(x)))
                    .collect(),
                TensorData::I64(v) => v
                    .iter()
                    .map(|&x| PartialTensorElement::Value(Scalar::I64(x)))
                    .collect(),
            }
        });
        PartialTensor::assemble(t.elem_ty(), shape, elems)
    }

    /// An abstract value for a graph input: known (possibly symbolic)
    /// shape, unknown elements.
    pub fn input(&self, elem_ty: TensorElemType, dims: SymbolicDimensions) -> PartialTensor {
        PartialTensor::assemble(elem_ty, Some(dims), None)
    }

    /// Entirely unknown value of a given element type.
    pub fn unknown(&self, elem_ty: TensorElemType) -> PartialTensor {
        PartialTensor::assemble(elem_ty, None, None)
    }

    /// Shape operator: a 1-D i64 tensor mirroring the input's dimensions,
    /// symbolic dimensions becoming symbolic elements.
    pub fn shape_of(&self, t: &PartialTensor) -> PartialTensor {
        let Some(shape) = t.shape() else {
            return PartialTensor::assemble(
                TensorElemType::I64,
                Some(SymbolicDimensions(vec![SymbolicDimension::Unknown])),
                None,
            );
        };
        let rank = shape.len();
        let elems = (rank <= self.max_tracked_elems).then(|| {
            shape
                .as_slice()
                .iter()
                .map(|d| match d {
                    SymbolicDimension::Fixed(n) => {
                        PartialTensorElement::Value(Scalar::I64(*n as i64))
                    }
                    SymbolicDimension::Param(p) => PartialTensorElement::Param(p.clone()),
                    SymbolicDimension::Unknown => PartialTensorElement::Unknown,
                })
                .collect()
        });
        PartialTensor::assemble(
            TensorElemType::I64,
            Some(SymbolicDimensions(vec![SymbolicDimension::Fixed(rank)])),
            elems,
        )
    }

    /// Shape-preserving, value-erasing rule for activations and other
    /// elementwise ops without a transfer function.
    pub fn passthrough(&self, t: &PartialTensor) -> PartialTensor {
        PartialTensor::assemble(t.elem_ty(), t.shape().cloned(), None)
    }

    pub fn cast(&self, t: &PartialTensor, to: TensorElemType) -> PartialTensor {
        let elems = t.elems().map(|es| {
            es.iter()
                .map(|e| match e {
                    PartialTensorElement::Value(s) => PartialTensorElement::Value(s.cast(to)),
                    other => other.clone(),
                })
                .collect()
        });
        PartialTensor::assemble(to, t.shape().cloned(), elems)
    }

    /// Elementwise arithmetic or comparison under numpy broadcasting.
    /// Division by a statically-known zero is an immediate error rather
    /// than an unknown result.
    pub fn binary(
        &self,
        op: BinaryOp,
        a: &PartialTensor,
        b: &PartialTensor,
    ) -> Result<PartialTensor, PartialError> {
        if a.elem_ty() != b.elem_ty() {
            return Err(PartialError::TypeMismatch(a.elem_ty(), b.elem_ty()));
        }
        if op == BinaryOp::Div {
            if let Some(es) = b.elems() {
                if es.iter().any(|e| e.value().is_some_and(|s| s.is_zero())) {
                    return Err(PartialError::DivisionByZero);
                }
            }
        }
        let out_ty = if op.is_comparison() {
            TensorElemType::Bool
        } else {
            a.elem_ty()
        };
        let shape = match (a.shape(), b.shape()) {
            (Some(x), Some(y)) => Some(x.broadcast(y).ok_or_else(|| {
                PartialError::IncompatibleShapes(format!("{x:?} vs {y:?}").into())
            })?),
            _ => None,
        };
        let elems = if self.track(&shape) {
            let dims = shape.as_ref().unwrap().to_fixed().unwrap();
            let out_strides = strides_of(&dims);
            let total = dims.total_elems();
            let mut es = Vec::with_capacity(total);
            for flat in 0..total {
                let ea = broadcast_fetch(a, &dims, &out_strides, flat);
                let eb = broadcast_fetch(b, &dims, &out_strides, flat);
                es.push(PartialTensorElement::binary(op, &ea, &eb)?);
            }
            Some(es)
        } else {
            None
        };
        Ok(PartialTensor::assemble(out_ty, shape, elems))
    }

    /// Reduction over the given axes. An empty axis list with
    /// `noop_with_empty_axes` set leaves the input untouched; without the
    /// flag it reduces over every axis. Any symbolic or unknown term
    /// poisons its output element to `Unknown`.
    pub fn reduce(
        &self,
        op: ReduceOp,
        t: &PartialTensor,
        axes: &[i64],
        keep_dims: bool,
        noop_with_empty_axes: bool,
    ) -> Result<PartialTensor, PartialError> {
        if axes.is_empty() && noop_with_empty_axes {
            return Ok(t.clone());
        }
        let Some(shape) = t.shape() else {
            return Ok(PartialTensor::assemble(t.elem_ty(), None, None));
        };
        let rank = shape.len();
        let reduced: Vec<usize> = if axes.is_empty() {
            (0..rank).collect()
        } else {
            axes.iter()
                .map(|&a| {
                    let a = if a < 0 { a + rank as i64 } else { a };
                    if a < 0 || a >= rank as i64 {
                        Err(PartialError::IndexOutOfRange(a, rank))
                    } else {
                        Ok(a as usize)
                    }
                })
                .collect::<Result<_, _>>()?
        };
        let mut out_dims = vec![];
        for (i, d) in shape.as_slice().iter().enumerate() {
            if reduced.contains(&i) {
                if keep_dims {
                    out_dims.push(SymbolicDimension::Fixed(1));
                }
            } else {
                out_dims.push(d.clone());
            }
        }
        let out_shape = Some(SymbolicDimensions(out_dims));
        let elems = if self.track(&out_shape) && t.elems().is_some() && t.is_shape_static() {
            let in_dims = shape.to_fixed().unwrap();
            let in_strides = in_dims.strides();
            let out_total = out_shape.as_ref().unwrap().total_elems().unwrap();
            let mut buckets: Vec<Vec<PartialTensorElement>> = vec![vec![]; out_total];
            // Row-major walk, binning every input element into its output slot.
            let out_fixed = out_shape.as_ref().unwrap().to_fixed().unwrap();
            let out_strides = strides_of(&out_fixed);
            for flat in 0..in_dims.total_elems() {
                let mut out_flat = 0;
                let mut k = 0;
                for i in 0..in_dims.len() {
                    let coord = (flat / in_strides[i]) % in_dims[i];
                    if reduced.contains(&i) {
                        if keep_dims {
                            k += 1;
                        }
                        continue;
                    }
                    out_flat += coord * out_strides[k];
                    k += 1;
                }
                buckets[out_flat].push(t.get(flat));
            }
            let es = buckets
                .into_iter()
                .map(|terms| {
                    if terms.is_empty() {
                        return PartialTensorElement::Unknown;
                    }
                    let values: Option<Vec<Scalar>> =
                        terms.iter().map(PartialTensorElement::value).collect();
                    match values.and_then(|vs| fold_values(op, t.elem_ty(), &vs)) {
                        Some(s) => PartialTensorElement::Value(s),
                        None => PartialTensorElement::Unknown,
                    }
                })
                .collect();
            Some(es)
        } else {
            None
        };
        Ok(PartialTensor::assemble(t.elem_ty(), out_shape, elems))
    }

    /// Reshape with `-1` inference: a single unresolved output dimension
    /// is solved from the known total element count, including the
    /// zero-length edge case. Symbolic entries flow through as symbolic
    /// dimensions.
    pub fn reshape(
        &self,
        t: &PartialTensor,
        spec: &[PartialTensorElement],
    ) -> Result<PartialTensor, PartialError> {
        let mut dims = Vec::with_capacity(spec.len());
        let mut infer_at = None;
        let mut known_product: usize = 1;
        let mut fully_known = true;
        for (i, e) in spec.iter().enumerate() {
            match e {
                PartialTensorElement::Value(s) => {
                    let v = s
                        .as_i64()
                        .ok_or(PartialError::TypeMismatch(s.elem_ty(), TensorElemType::I64))?;
                    if v == -1 {
                        if infer_at.is_some() {
                            return Err(PartialError::IncompatibleShapes(
                                "more than one inferred dimension".into(),
                            ));
                        }
                        infer_at = Some(i);
                        dims.push(SymbolicDimension::Unknown);
                    } else if v < 0 {
                        return Err(PartialError::IncompatibleShapes(
                            format!("negative dimension {v}").into(),
                        ));
                    } else {
                        known_product *= v as usize;
                        dims.push(SymbolicDimension::Fixed(v as usize));
                    }
                }
                PartialTensorElement::Param(p) => {
                    fully_known = false;
                    dims.push(SymbolicDimension::Param(p.clone()));
                }
                PartialTensorElement::Unknown => {
                    fully_known = false;
                    dims.push(SymbolicDimension::Unknown);
                }
            }
        }
        if let Some(idx) = infer_at {
            match t.total_elems() {
                Some(total) if fully_known => {
                    if known_product == 0 {
                        if total != 0 {
                            return Err(PartialError::IncompatibleShapes(
                                "cannot infer a dimension from a zero-sized remainder".into(),
                            ));
                        }
                        dims[idx] = SymbolicDimension::Fixed(0);
                    } else {
                        if total % known_product != 0 {
                            return Err(PartialError::IncompatibleShapes(
                                format!("{total} elements do not fill {known_product}").into(),
                            ));
                        }
                        dims[idx] = SymbolicDimension::Fixed(total / known_product);
                    }
                }
                _ => dims[idx] = SymbolicDimension::Unknown,
            }
        } else if fully_known {
            if let Some(total) = t.total_elems() {
                if total != known_product {
                    return Err(PartialError::IncompatibleShapes(
                        format!("cannot reshape {total} elements into {known_product}").into(),
                    ));
                }
            }
        }
        let shape = Some(SymbolicDimensions(dims));
        // Row-major order is unchanged by reshape, so tracked elements
        // carry over verbatim.
        let elems = if self.track(&shape) {
            t.elems().map(|es| es.to_vec())
        } else {
            None
        };
        Ok(PartialTensor::assemble(t.elem_ty(), shape, elems))
    }

    pub fn reshape_dims(
        &self,
        t: &PartialTensor,
        dims: &[i64],
    ) -> Result<PartialTensor, PartialError> {
        let spec: Vec<PartialTensorElement> = dims
            .iter()
            .map(|&d| PartialTensorElement::Value(Scalar::I64(d)))
            .collect();
        self.reshape(t, &spec)
    }

    /// Gather along `axis`. Elements are tracked for the 1-D axis-0 case,
    /// which is what Shape→Gather dimension extraction produces.
    pub fn gather(
        &self,
        data: &PartialTensor,
        indices: &PartialTensor,
        axis: i64,
    ) -> Result<PartialTensor, PartialError> {
        let (Some(dshape), Some(ishape)) = (data.shape(), indices.shape()) else {
            return Ok(PartialTensor::assemble(data.elem_ty(), None, None));
        };
        let rank = dshape.len() as i64;
        let axis = if axis < 0 { axis + rank } else { axis };
        if axis < 0 || axis >= rank {
            return Err(PartialError::IndexOutOfRange(axis, dshape.len()));
        }
        let axis = axis as usize;
        let mut dims = dshape.as_slice()[..axis].to_vec();
        dims.extend(ishape.as_slice().iter().cloned());
        dims.extend(dshape.as_slice()[axis + 1..].iter().cloned());
        let shape = Some(SymbolicDimensions(dims));
        let elems = if axis == 0 && dshape.len() == 1 && data.elems().is_some() && self.track(&shape)
        {
            let len = dshape.as_slice()[0].fixed().unwrap_or(0);
            let total = shape.as_ref().unwrap().total_elems().unwrap();
            let mut es = Vec::with_capacity(total);
            for i in 0..total {
                let e = match indices.get(i) {
                    PartialTensorElement::Value(s) => {
                        let mut idx = s.as_i64().ok_or(PartialError::TypeMismatch(
                            s.elem_ty(),
                            TensorElemType::I64,
                        ))?;
                        if idx < 0 {
                            idx += len as i64;
                        }
                        if idx < 0 || idx >= len as i64 {
                            return Err(PartialError::IndexOutOfRange(idx, len));
                        }
                        data.get(idx as usize)
                    }
                    _ => PartialTensorElement::Unknown,
                };
                es.push(e);
            }
            Some(es)
        } else {
            None
        };
        Ok(PartialTensor::assemble(data.elem_ty(), shape, elems))
    }

    /// Concatenation along `axis`. Elements are tracked for the 1-D case.
    pub fn concat(
        &self,
        inputs: &[&PartialTensor],
        axis: i64,
    ) -> Result<PartialTensor, PartialError> {
        let first = *inputs
            .first()
            .ok_or(PartialError::Todo("concat of nothing".into()))?;
        for t in inputs {
            if t.elem_ty() != first.elem_ty() {
                return Err(PartialError::TypeMismatch(first.elem_ty(), t.elem_ty()));
            }
        }
        let Some(rank) = first.rank() else {
            return Ok(PartialTensor::assemble(first.elem_ty(), None, None));
        };
        if inputs.iter().any(|t| t.rank() != Some(rank)) {
            return Err(PartialError::IncompatibleShapes(
                "concat inputs disagree on rank".into(),
            ));
        }
        let axis = if axis < 0 { axis + rank as i64 } else { axis };
        if axis < 0 || axis >= rank as i64 {
            return Err(PartialError::IndexOutOfRange(axis, rank));
        }
        let axis = axis as usize;
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            if i == axis {
                let mut sum = Some(0usize);
                for t in inputs {
                    sum = match (sum, t.shape().unwrap().as_slice()[i].fixed()) {
                        (Some(acc), Some(d)) => Some(acc + d),
                        _ => None,
                    };
                }
                dims.push(match sum {
                    Some(n) => SymbolicDimension::Fixed(n),
                    None => SymbolicDimension::Unknown,
                });
            } else {
                let mut merged = first.shape().unwrap().as_slice()[i].clone();
                for t in &inputs[1..] {
                    merged = merged
                        .merge(&t.shape().unwrap().as_slice()[i])
                        .ok_or_else(|| {
                            PartialError::IncompatibleShapes(
                                "concat inputs disagree off the concat axis".into(),
                            )
                        })?;
                }
                dims.push(merged);
            }
        }
        let shape = Some(SymbolicDimensions(dims));
        let elems = if rank == 1 && axis == 0 && self.track(&shape) {
            let mut es = vec![];
            for t in inputs {
                let Some(n) = t.total_elems() else {
                    es.clear();
                    break;
                };
                for i in 0..n {
                    es.push(t.get(i));
                }
            }
            (!es.is_empty()).then_some(es)
        } else {
            None
        };
        Ok(PartialTensor::assemble(first.elem_ty(), shape, elems))
    }

    /// See [`PartialTensor::merge`].
    pub fn merge(
        &self,
        a: &PartialTensor,
        b: &PartialTensor,
    ) -> Result<PartialTensor, PartialError> {
        a.merge(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PartialTensorElement::{Param, Unknown, Value};

    fn ctx() -> PartialInferenceContext {
        PartialInferenceContext::default()
    }

    fn batch_image() -> PartialTensor {
        ctx().input(
            TensorElemType::F32,
            SymbolicDimensions(vec![
                SymbolicDimension::Param("p0".into()),
                SymbolicDimension::Fixed(3),
                SymbolicDimension::Fixed(224),
                SymbolicDimension::Fixed(224),
            ]),
        )
    }

    #[test]
    fn shape_of_mixes_params_and_values() {
        let c = ctx();
        let shape = c.shape_of(&batch_image());
        assert_eq!(shape.elem_ty(), TensorElemType::I64);
        assert_eq!(shape.total_elems(), Some(4));
        assert_eq!(shape.get(0), Param("p0".into()));
        assert_eq!(shape.get(1), Value(Scalar::I64(3)));
        assert_eq!(shape.get(2), Value(Scalar::I64(224)));
    }

    #[test]
    fn reduce_over_param_never_fakes_a_value() {
        let c = ctx();
        let shape = c.shape_of(&batch_image());
        let sum = c
            .reduce(ReduceOp::Sum, &shape, &[], false, false)
            .unwrap();
        assert_eq!(sum.total_elems(), Some(1));
        assert_eq!(sum.get(0), Unknown);
    }

    #[test]
    fn reduce_of_concrete_values() {
        let c = ctx();
        let t = c.from_tensor(&Tensor::new(vec![2, 2].into(), vec![1i64, 2, 3, 4]));
        let sum = c.reduce(ReduceOp::Sum, &t, &[1], false, false).unwrap();
        assert_eq!(sum.shape().unwrap().as_slice().len(), 1);
        assert_eq!(sum.get(0), Value(Scalar::I64(3)));
        assert_eq!(sum.get(1), Value(Scalar::I64(7)));
        let max = c.reduce(ReduceOp::Max, &t, &[0], true, false).unwrap();
        assert_eq!(
            max.shape().unwrap().as_slice(),
            &[SymbolicDimension::Fixed(1), SymbolicDimension::Fixed(2)]
        );
        assert_eq!(max.get(1), Value(Scalar::I64(4)));
    }

    #[test]
    fn reduce_with_noop_flag_is_identity() {
        let c = ctx();
        let t = batch_image();
        let out = c.reduce(ReduceOp::Mean, &t, &[], false, true).unwrap();
        assert_eq!(out, t);
    }

    #[test]
    fn mul_by_zero_short_circuits_unknown_operands() {
        let c = ctx();
        let unknown = c.input(
            TensorElemType::F32,
            SymbolicDimensions(vec![SymbolicDimension::Fixed(2)]),
        );
        let zeros = c.from_tensor(&Tensor::zeros::<f32>(vec![2].into()));
        let out = c.binary(BinaryOp::Mul, &unknown, &zeros).unwrap();
        assert_eq!(out.get(0), Value(Scalar::F32(0.)));
        assert_eq!(out.get(1), Value(Scalar::F32(0.)));
    }

    #[test]
    fn div_by_one_keeps_operand_elements() {
        let c = ctx();
        let t = c.from_tensor(&Tensor::new(vec![2].into(), vec![4.0f32, 6.0]));
        let ones = c.from_tensor(&Tensor::new(vec![2].into(), vec![1.0f32, 1.0]));
        let out = c.binary(BinaryOp::Div, &t, &ones).unwrap();
        assert_eq!(out.get(0), Value(Scalar::F32(4.)));
        assert_eq!(out.get(1), Value(Scalar::F32(6.)));
    }

    #[test]
    fn div_by_known_zero_is_an_error() {
        let c = ctx();
        let t = c.from_tensor(&Tensor::new(vec![1].into(), vec![4.0f32]));
        let zero = c.from_tensor(&Tensor::zeros::<f32>(vec![1].into()));
        assert!(matches!(
            c.binary(BinaryOp::Div, &t, &zero),
            Err(PartialError::DivisionByZero)
        ));
    }

    #[test]
    fn binary_broadcasts_symbolic_shapes() {
        let c = ctx();
        let a = batch_image();
        let bias = c.input(
            TensorElemType::F32,
            SymbolicDimensions(vec![
                SymbolicDimension::Fixed(3),
                SymbolicDimension::Fixed(1),
                SymbolicDimension::Fixed(1),
            ]),
        );
        let out = c.binary(BinaryOp::Add, &a, &bias).unwrap();
        assert_eq!(out.shape(), a.shape());
    }

    #[test]
    fn comparison_yields_bool() {
        let c = ctx();
        let a = c.from_tensor(&Tensor::new(vec![2].into(), vec![1i64, 5]));
        let b = c.from_tensor(&Tensor::new(vec![2].into(), vec![3i64, 3]));
        let out = c.binary(BinaryOp::Greater, &a, &b).unwrap();
        assert_eq!(out.elem_ty(), TensorElemType::Bool);
        assert_eq!(out.get(0), Value(Scalar::Bool(false)));
        assert_eq!(out.get(1), Value(Scalar::Bool(true)));
    }

    #[test]
    fn reshape_roundtrip_restores_the_original() {
        let c = ctx();
        let t = c.from_tensor(&Tensor::new(vec![2, 3].into(), vec![1i64, 2, 3, 4, 5, 6]));
        let once = c.reshape_dims(&t, &[3, -1]).unwrap();
        assert_eq!(
            once.shape().unwrap().as_slice(),
            &[SymbolicDimension::Fixed(3), SymbolicDimension::Fixed(2)]
        );
        let back = c.reshape_dims(&once, &[2, 3]).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn reshape_zero_length_edge() {
        let c = ctx();
        let t = c.input(
            TensorElemType::F32,
            SymbolicDimensions(vec![SymbolicDimension::Fixed(0), SymbolicDimension::Fixed(4)]),
        );
        let out = c.reshape_dims(&t, &[0, -1]).unwrap();
        assert_eq!(
            out.shape().unwrap().as_slice(),
            &[SymbolicDimension::Fixed(0), SymbolicDimension::Fixed(0)]
        );
    }

    #[test]
    fn reshape_count_mismatch_is_an_error() {
        let c = ctx();
        let t = c.from_tensor(&Tensor::new(vec![4].into(), vec![1i64, 2, 3, 4]));
        assert!(c.reshape_dims(&t, &[3]).is_err());
        assert!(c.reshape_dims(&t, &[-1, -1]).is_err());
    }

    #[test]
    fn reshape_through_param_spec() {
        let c = ctx();
        let t = batch_image();
        let spec = vec![Param("p0".into()), Value(Scalar::I64(3 * 224 * 224))];
        let out = c.reshape(&t, &spec).unwrap();
        assert_eq!(
            out.shape().unwrap().as_slice(),
            &[
                SymbolicDimension::Param("p0".into()),
                SymbolicDimension::Fixed(3 * 224 * 224)
            ]
        );
    }

    #[test]
    fn gather_extracts_dimensions_from_a_shape() {
        let c = ctx();
        let shape = c.shape_of(&batch_image());
        let idx = c.from_tensor(&Tensor::new(vec![2].into(), vec![1i64, 2]));
        let picked = c.gather(&shape, &idx, 0).unwrap();
        assert_eq!(picked.get(0), Value(Scalar::I64(3)));
        assert_eq!(picked.get(1), Value(Scalar::I64(224)));

        let scalar_idx = c.from_tensor(&Tensor::scalar(0i64));
        let batch = c.gather(&shape, &scalar_idx, 0).unwrap();
        assert_eq!(batch.rank(), Some(0));
        assert_eq!(batch.get(0), Param("p0".into()));
    }

    #[test]
    fn gather_out_of_range_index() {
        let c = ctx();
        let shape = c.shape_of(&batch_image());
        let idx = c.from_tensor(&Tensor::scalar(9i64));
        assert!(matches!(
            c.gather(&shape, &idx, 0),
            Err(PartialError::IndexOutOfRange(9, 4))
        ));
    }

    #[test]
    fn concat_tracks_one_dimensional_elements() {
        let c = ctx();
        let a = c.from_tensor(&Tensor::new(vec![2].into(), vec![1i64, 2]));
        let b = c.from_tensor(&Tensor::new(vec![1].into(), vec![7i64]));
        let out = c.concat(&[&a, &b], 0).unwrap();
        assert_eq!(
            out.shape().unwrap().as_slice(),
            &[SymbolicDimension::Fixed(3)]
        );
        assert_eq!(out.get(2), Value(Scalar::I64(7)));
    }

    #[test]
    fn merge_keeps_the_most_defined_side() {
        let c = ctx();
        let concrete = c.from_tensor(&Tensor::new(vec![2].into(), vec![1i64, 2]));
        let vague = c.input(
            TensorElemType::I64,
            SymbolicDimensions(vec![SymbolicDimension::Param("n".into())]),
        );
        let merged = c.merge(&vague, &concrete).unwrap();
        assert_eq!(
            merged.shape().unwrap().as_slice(),
            &[SymbolicDimension::Fixed(2)]
        );
        assert_eq!(merged.get(0), Value(Scalar::I64(1)));
    }

    #[test]
    fn merge_rejects_conflicting_values() {
        let c = ctx();
        let a = c.from_tensor(&Tensor::new(vec![1].into(), vec![1i64]));
        let b = c.from_tensor(&Tensor::new(vec![1].into(), vec![2i64]));
        assert!(matches!(
            c.merge(&a, &b),
            Err(PartialError::MergeConflict(..))
        ));
    }

    #[test]
    fn cast_converts_values_and_keeps_params() {
        let c = ctx();
        let shape = c.shape_of(&batch_image());
        let as_f32 = c.cast(&shape, TensorElemType::F32);
        assert_eq!(as_f32.elem_ty(), TensorElemType::F32);
        assert_eq!(as_f32.get(0), Param("p0".into()));
        assert_eq!(as_f32.get(1), Value(Scalar::F32(3.)));
    }

    #[test]
    fn to_tensor_materializes_static_values() {
        let c = ctx();
        let t = Tensor::new(vec![2, 2].into(), vec![1i64, 2, 3, 4]);
        let p = c.from_tensor(&t);
        assert!(p.is_static());
        assert_eq!(p.to_tensor().unwrap(), t);
        assert!(c.shape_of(&batch_image()).to_tensor().is_none());
    }

    #[test]
    fn big_tensors_track_shape_only() {
        let c = ctx();
        let t = Tensor::zeros::<f32>(vec![64, 64].into());
        let p = c.from_tensor(&t);
        assert!(p.elems().is_none());
        assert!(p.is_shape_static());
        assert!(!p.is_static());
    }
}
