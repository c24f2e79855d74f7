use std::time::Instant;

use crate::{module::GraphModule, node::OpKind};

/// Folds every operator node whose abstract value is fully static into a
/// constant attribute. Chains like Shape→Gather collapse this way: the
/// builder already propagated concrete elements through them, so the nodes
/// only need swapping for a `GetAttr`. Producers that become dead are
/// swept afterwards.
pub fn fold_constants(gm: &mut GraphModule) -> usize {
    let start = Instant::now();
    let mut count = 0;
    for id in gm.graph.nodes_in_order() {
        let node = &gm.graph[id];
        if node.op() != OpKind::CallFunction {
            continue;
        }
        // Projections are structural; their producing layer is what folds.
        if node.target() == "getitem" {
            continue;
        }
        if node.users().is_empty() {
            continue;
        }
        let Some(partial) = &node.partial else {
            continue;
        };
        let Some(tensor) = partial.to_tensor() else {
            continue;
        };
        let partial = partial.clone();
        let hint = format!("folded_{}", node.name());
        let name = gm.add_attr(&hint, tensor);
        let attr = gm.graph.inserting_before(Some(id), |g| g.get_attr(&name));
        gm.graph[attr].partial = Some(partial);
        gm.graph.replace_all_uses_with(id, attr, None, true, false);
        gm.graph.erase_node(id);
        count += 1;
    }
    if count > 0 {
        gm.graph.eliminate_dead_code(None);
    }
    log::info!("fold_constants({count}): {:?}", start.elapsed());
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::GraphBuilder,
        symdim::SymbolicDimension,
        tensor::{Tensor, TensorElemType},
    };

    #[test]
    fn shape_gather_chain_folds_to_a_constant() {
        let mut b = GraphBuilder::new();
        let img = b.input(
            "image",
            TensorElemType::F32,
            vec![
                SymbolicDimension::Param("batch".into()),
                SymbolicDimension::Fixed(3),
                SymbolicDimension::Fixed(224),
                SymbolicDimension::Fixed(224),
            ],
        );
        let shape = b.layer("Shape", vec![img.into()]).unwrap()[0];
        let idx = b.constant(Tensor::scalar(1i64));
        let channels = b
            .layer("Gather", vec![shape.into(), idx.into(), 0i64.into()])
            .unwrap()[0];
        let relu = b.layer("Relu", vec![img.into()]).unwrap()[0];
        b.outputs(&[channels, relu]);
        let mut gm = b.finish();

        let folded = fold_constants(&mut gm);
        assert_eq!(folded, 1);
        assert!(gm.graph[channels].is_erased());
        // The Shape node fed only the folded Gather and must be swept.
        assert!(gm.graph[shape].is_erased());
        // The graph output now consumes a constant carrying the value 3.
        let out = gm.graph.output_node().unwrap();
        let first = gm.graph[out].input_nodes().as_slice()[0];
        assert_eq!(gm.graph[first].op(), OpKind::GetAttr);
        assert!(gm.constant(first).unwrap().allclose(&[3i64]));
        gm.graph.lint();
    }

    #[test]
    fn symbolic_values_do_not_fold() {
        let mut b = GraphBuilder::new();
        let img = b.input(
            "image",
            TensorElemType::F32,
            vec![
                SymbolicDimension::Param("batch".into()),
                SymbolicDimension::Fixed(3),
            ],
        );
        let shape = b.layer("Shape", vec![img.into()]).unwrap()[0];
        b.outputs(&[shape]);
        let mut gm = b.finish();

        // The shape still contains the symbolic batch entry.
        assert_eq!(fold_constants(&mut gm), 0);
        assert!(!gm.graph[shape].is_erased());
    }
}
