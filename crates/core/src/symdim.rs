use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fixed_dim::{FixedDimension, FixedDimensions};

/// A single dimension of a dynamic tensor shape. Dimensions are either
/// statically known, bound to a named parameter (e.g. a batch size), or
/// entirely unknown.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolicDimension {
    Unknown,
    Fixed(FixedDimension),
    Param(String),
}

#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolicDimensions(pub Vec<SymbolicDimension>);

impl SymbolicDimension {
    pub fn fixed(&self) -> Option<FixedDimension> {
        match self {
            SymbolicDimension::Fixed(d) => Some(*d),
            _ => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, SymbolicDimension::Fixed(_))
    }

    /// Broadcasts two dimensions. A known non-1 extent wins over a parameter
    /// or an unknown, on the assumption that the graph is valid at runtime.
    /// Two different fixed extents (both > 1) cannot broadcast.
    pub fn broadcast(&self, other: &SymbolicDimension) -> Option<SymbolicDimension> {
        use SymbolicDimension::*;
        match (self, other) {
            (Fixed(1), d) | (d, Fixed(1)) => Some(d.clone()),
            (a, b) if a == b => Some(a.clone()),
            (Fixed(m), Fixed(n)) if m != n => None,
            (Fixed(n), _) | (_, Fixed(n)) => Some(Fixed(*n)),
            _ => Some(Unknown),
        }
    }

    /// Keeps the more concrete of two dimensions known to describe the same
    /// extent. Fixed beats Param beats Unknown. Two distinct fixed extents
    /// are a contradiction and yield `None`.
    pub fn merge(&self, other: &SymbolicDimension) -> Option<SymbolicDimension> {
        use SymbolicDimension::*;
        match (self, other) {
            (Fixed(m), Fixed(n)) if m != n => None,
            (Fixed(n), _) | (_, Fixed(n)) => Some(Fixed(*n)),
            (Param(p), _) => Some(Param(p.clone())),
            (_, Param(p)) => Some(Param(p.clone())),
            (Unknown, Unknown) => Some(Unknown),
        }
    }
}

impl SymbolicDimensions {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[SymbolicDimension] {
        self.0.as_slice()
    }

    pub fn is_fully_static(&self) -> bool {
        self.0.iter().all(SymbolicDimension::is_fixed)
    }

    /// Total element count, available only when every dimension is fixed.
    pub fn total_elems(&self) -> Option<usize> {
        self.0
            .iter()
            .map(SymbolicDimension::fixed)
            .product::<Option<usize>>()
    }

    pub fn to_fixed(&self) -> Option<FixedDimensions> {
        self.0
            .iter()
            .map(SymbolicDimension::fixed)
            .collect::<Option<Vec<_>>>()
            .map(FixedDimensions)
    }

    /// Numpy-style broadcasting over symbolic dimensions. Shorter shapes are
    /// padded with 1 on the left. `None` means the shapes can never broadcast.
    pub fn broadcast(&self, other: &SymbolicDimensions) -> Option<SymbolicDimensions> {
        let max_len = self.len().max(other.len());
        let mut dims = vec![];
        for i in 0..max_len {
            let one = SymbolicDimension::Fixed(1);
            let x = if i < self.len() {
                &self.0[self.len() - i - 1]
            } else {
                &one
            };
            let y = if i < other.len() {
                &other.0[other.len() - i - 1]
            } else {
                &one
            };
            dims.push(x.broadcast(y)?);
        }
        dims.reverse();
        Some(SymbolicDimensions(dims))
    }
}

impl fmt::Debug for SymbolicDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolicDimension::Unknown => write!(f, "?"),
            SymbolicDimension::Fixed(d) => write!(f, "{}", d),
            SymbolicDimension::Param(s) => write!(f, "{}", s),
        }
    }
}

impl fmt::Debug for SymbolicDimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<Vec<SymbolicDimension>> for SymbolicDimensions {
    fn from(v: Vec<SymbolicDimension>) -> Self {
        SymbolicDimensions(v)
    }
}

impl From<&FixedDimensions> for SymbolicDimensions {
    fn from(dims: &FixedDimensions) -> Self {
        SymbolicDimensions(dims.iter().map(|&d| SymbolicDimension::Fixed(d)).collect())
    }
}

#[test]
fn broadcast_param_against_one() {
    use SymbolicDimension::*;
    let x = SymbolicDimensions(vec![Param("batch".into()), Fixed(3), Fixed(224)]);
    let y = SymbolicDimensions(vec![Fixed(1), Fixed(1)]);
    let out = x.broadcast(&y).unwrap();
    assert_eq!(
        out,
        SymbolicDimensions(vec![Param("batch".into()), Fixed(3), Fixed(224)])
    );
}

#[test]
fn broadcast_conflicting_fixed() {
    use SymbolicDimension::*;
    let x = SymbolicDimensions(vec![Fixed(3)]);
    let y = SymbolicDimensions(vec![Fixed(4)]);
    assert!(x.broadcast(&y).is_none());
}

#[test]
fn merge_prefers_concrete() {
    use SymbolicDimension::*;
    assert_eq!(Fixed(3).merge(&Param("n".into())), Some(Fixed(3)));
    assert_eq!(Param("n".into()).merge(&Unknown), Some(Param("n".into())));
    assert_eq!(Fixed(3).merge(&Fixed(4)), None);
}
