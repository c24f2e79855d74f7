use rustc_hash::FxHashMap;

use crate::{
    analysis::partial::DEFAULT_MAX_TRACKED_ELEMS,
    graph::Graph,
    node::{NodeId, OpKind},
    tensor::Tensor,
};

/// A graph together with its out-of-band constant attributes. `GetAttr`
/// nodes address tensors stored here by target name.
#[derive(Clone, Default)]
pub struct GraphModule {
    pub graph: Graph,
    attrs: FxHashMap<String, Tensor>,
}

impl GraphModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a tensor under a unique attribute name derived from `hint`
    /// and returns that name.
    pub fn add_attr(&mut self, hint: &str, tensor: Tensor) -> String {
        let mut name = hint.to_string();
        let mut i = 0u64;
        while self.attrs.contains_key(&name) {
            i += 1;
            name = format!("{hint}_{i}");
        }
        self.attrs.insert(name.clone(), tensor);
        name
    }

    pub fn attr(&self, name: &str) -> Option<&Tensor> {
        self.attrs.get(name)
    }

    pub fn set_attr(&mut self, name: &str, tensor: Tensor) {
        self.attrs.insert(name.to_string(), tensor);
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<Tensor> {
        self.attrs.remove(name)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.attrs.iter()
    }

    /// The tensor behind `n` when `n` is a `GetAttr` whose value is fully
    /// known and small enough for element-wise tracking.
    pub fn small_constant(&self, n: NodeId) -> Option<&Tensor> {
        let node = &self.graph[n];
        if node.op() != OpKind::GetAttr {
            return None;
        }
        let tensor = self.attrs.get(node.target())?;
        (tensor.dims().total_elems() <= DEFAULT_MAX_TRACKED_ELEMS).then_some(tensor)
    }

    /// The tensor behind `n` when `n` is a `GetAttr`, regardless of size.
    pub fn constant(&self, n: NodeId) -> Option<&Tensor> {
        let node = &self.graph[n];
        if node.op() != OpKind::GetAttr {
            return None;
        }
        self.attrs.get(node.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_names_are_deduplicated() {
        let mut m = GraphModule::new();
        let a = m.add_attr("w", Tensor::zeros::<f32>(vec![2].into()));
        let b = m.add_attr("w", Tensor::zeros::<f32>(vec![3].into()));
        assert_eq!(a, "w");
        assert_eq!(b, "w_1");
        assert_eq!(m.attr("w_1").unwrap().dims().total_elems(), 3);
    }

    #[test]
    fn small_constant_resolution() {
        let mut m = GraphModule::new();
        let name = m.add_attr("zero", Tensor::zeros::<f32>(vec![1].into()));
        let small = m.graph.get_attr(&name);
        let big_name = m.add_attr("big", Tensor::zeros::<f32>(vec![128, 128].into()));
        let big = m.graph.get_attr(&big_name);
        assert!(m.small_constant(small).is_some());
        assert!(m.small_constant(big).is_none());
        assert!(m.constant(big).is_some());
    }
}
