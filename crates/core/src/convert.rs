use std::borrow::Cow;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    arg::{for_each_node_ref, Argument},
    module::GraphModule,
    node::{NodeId, OpKind},
    symdim::SymbolicDimension,
    tensor::{TensorData, TensorElemType},
};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("node '{0}' carries no shape metadata")]
    MissingPartial(String),

    #[error("graph has no Output node")]
    NoOutput,

    #[error("Something went wrong: {0}")]
    Todo(Cow<'static, str>),
}

/// Metadata of one value in the flat tensor table. The element type and
/// dimensions come exclusively from the producing node's partial tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatValue {
    pub name: String,
    pub index: usize,
    pub elem_ty: TensorElemType,
    /// `None` when even the rank is unknown.
    pub dims: Option<Vec<SymbolicDimension>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatConstant {
    pub name: String,
    pub index: usize,
    pub dims: Vec<usize>,
    pub data: TensorData,
}

/// A literal operator attribute, kept apart from the tensor inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlatField {
    Int(i64),
    Float(f32),
    Str(String),
    Bool(bool),
    List(Vec<FlatField>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatLayer {
    pub name: String,
    pub target: String,
    /// Tensor-table indices of the consumed values, in argument order.
    pub inputs: Vec<usize>,
    pub outputs: Vec<FlatValue>,
    pub fields: Vec<FlatField>,
}

/// The flat, serializable form a finished graph lowers into: one forward
/// walk, no graph structure left beyond table indices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlatModel {
    pub inputs: Vec<FlatValue>,
    pub constants: Vec<FlatConstant>,
    pub layers: Vec<FlatLayer>,
    pub outputs: Vec<usize>,
}

fn contains_node(arg: &Argument) -> bool {
    let mut found = false;
    for_each_node_ref(arg, &mut |_| found = true);
    found
}

fn to_field(arg: &Argument) -> FlatField {
    match arg {
        Argument::Int(i) => FlatField::Int(*i),
        Argument::Float(x) => FlatField::Float(*x),
        Argument::Str(s) => FlatField::Str(s.clone()),
        Argument::Bool(b) => FlatField::Bool(*b),
        Argument::List(xs) => FlatField::List(xs.iter().map(to_field).collect()),
        Argument::Node(_) => unreachable!("node arguments are inputs, not fields"),
    }
}

fn value_of(gm: &GraphModule, id: NodeId, index: usize) -> Result<FlatValue, ConvertError> {
    let node = &gm.graph[id];
    let partial = node
        .partial
        .as_ref()
        .ok_or_else(|| ConvertError::MissingPartial(node.name().into()))?;
    Ok(FlatValue {
        name: node.name().into(),
        index,
        elem_ty: partial.elem_ty(),
        dims: partial.shape().map(|s| s.as_slice().to_vec()),
    })
}

/// Lowers a finished graph into its flat form with a single walk in list
/// order.
pub fn convert(gm: &GraphModule) -> Result<FlatModel, ConvertError> {
    let mut model = FlatModel::default();
    let mut index_of: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut next_index = 0usize;
    let mut seen_output = false;

    for id in gm.graph.nodes_in_order() {
        let node = &gm.graph[id];
        match node.op() {
            OpKind::Placeholder => {
                model.inputs.push(value_of(gm, id, next_index)?);
                index_of.insert(id, next_index);
                next_index += 1;
            }
            OpKind::GetAttr => {
                let tensor = gm.constant(id).ok_or_else(|| {
                    ConvertError::Todo(
                        format!("attribute '{}' is unresolved", node.target()).into(),
                    )
                })?;
                model.constants.push(FlatConstant {
                    name: node.name().into(),
                    index: next_index,
                    dims: tensor.dims().0.clone(),
                    data: tensor.raw_data().clone(),
                });
                index_of.insert(id, next_index);
                next_index += 1;
            }
            OpKind::CallFunction if node.target() == "getitem" => {
                // Assigned when its producing layer was emitted.
                if !index_of.contains_key(&id) {
                    return Err(ConvertError::Todo(
                        format!("projection '{}' without a producing layer", node.name()).into(),
                    ));
                }
            }
            OpKind::CallFunction => {
                let mut inputs = vec![];
                let mut missing = None;
                for a in node.args() {
                    for_each_node_ref(a, &mut |nid| match index_of.get(&nid) {
                        Some(&i) => inputs.push(i),
                        None => missing = Some(nid),
                    });
                }
                if let Some(nid) = missing {
                    return Err(ConvertError::Todo(
                        format!(
                            "'{}' consumes '{}' before its definition",
                            node.name(),
                            gm.graph[nid].name()
                        )
                        .into(),
                    ));
                }
                let fields = node
                    .args()
                    .iter()
                    .filter(|a| !contains_node(a))
                    .map(to_field)
                    .collect();

                // Multi-output layers surface through getitem projections.
                let mut projections: Vec<(i64, NodeId)> = node
                    .users()
                    .iter()
                    .filter(|&&u| {
                        let user = &gm.graph[u];
                        user.op() == OpKind::CallFunction
                            && user.target() == "getitem"
                            && user.args().first() == Some(&Argument::Node(id))
                    })
                    .map(|&u| {
                        (
                            gm.graph[u].args().get(1).and_then(Argument::as_int).unwrap_or(0),
                            u,
                        )
                    })
                    .collect();
                projections.sort_by_key(|&(i, _)| i);

                let outputs = if projections.is_empty() {
                    let v = value_of(gm, id, next_index)?;
                    index_of.insert(id, next_index);
                    next_index += 1;
                    vec![v]
                } else {
                    let mut outs = vec![];
                    for (k, &(i, proj)) in projections.iter().enumerate() {
                        if i != k as i64 {
                            return Err(ConvertError::Todo(
                                format!("'{}' is missing projection {k}", node.name()).into(),
                            ));
                        }
                        outs.push(value_of(gm, proj, next_index)?);
                        index_of.insert(proj, next_index);
                        next_index += 1;
                    }
                    outs
                };
                model.layers.push(FlatLayer {
                    name: node.name().into(),
                    target: node.target().into(),
                    inputs,
                    outputs,
                    fields,
                });
            }
            OpKind::Output => {
                seen_output = true;
                let mut outs = vec![];
                let mut missing = None;
                for a in node.args() {
                    for_each_node_ref(a, &mut |nid| match index_of.get(&nid) {
                        Some(&i) => outs.push(i),
                        None => missing = Some(nid),
                    });
                }
                if missing.is_some() {
                    return Err(ConvertError::Todo("output references an unindexed node".into()));
                }
                model.outputs = outs;
            }
            OpKind::Root => unreachable!("the sentinel never appears in list order"),
        }
    }
    if !seen_output {
        return Err(ConvertError::NoOutput);
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::GraphBuilder,
        symdim::SymbolicDimension,
        tensor::{Tensor, TensorElemType},
    };

    fn small_model() -> GraphModule {
        let mut b = GraphBuilder::new();
        let x = b.input(
            "x",
            TensorElemType::F32,
            vec![
                SymbolicDimension::Param("batch".into()),
                SymbolicDimension::Fixed(4),
            ],
        );
        let bias = b.constant(Tensor::new(vec![4].into(), vec![1.0f32, 2., 3., 4.]));
        let add = b.layer("Add", vec![x.into(), bias.into()]).unwrap()[0];
        let relu = b.layer("Relu", vec![add.into()]).unwrap()[0];
        b.outputs(&[relu]);
        b.finish()
    }

    #[test]
    fn flat_model_indices_resolve() {
        let gm = small_model();
        let flat = convert(&gm).unwrap();

        assert_eq!(flat.inputs.len(), 1);
        assert_eq!(flat.constants.len(), 1);
        assert_eq!(flat.layers.len(), 2);
        assert_eq!(flat.inputs[0].index, 0);
        assert_eq!(flat.constants[0].index, 1);

        let add = &flat.layers[0];
        assert_eq!(add.target, "Add");
        assert_eq!(add.inputs, vec![0, 1]);
        assert_eq!(add.outputs[0].index, 2);
        assert_eq!(
            add.outputs[0].dims.as_ref().unwrap()[0],
            SymbolicDimension::Param("batch".into())
        );

        let relu = &flat.layers[1];
        assert_eq!(relu.inputs, vec![2]);
        assert_eq!(flat.outputs, vec![relu.outputs[0].index]);
    }

    #[test]
    fn literal_attributes_become_fields() {
        let mut b = GraphBuilder::new();
        let x = b.constant(Tensor::new(vec![2].into(), vec![1i64, 2]));
        let y = b.constant(Tensor::new(vec![1].into(), vec![3i64]));
        let cat = b
            .layer(
                "Concat",
                vec![Argument::List(vec![x.into(), y.into()]), 0i64.into()],
            )
            .unwrap()[0];
        b.outputs(&[cat]);
        let flat = convert(&b.finish()).unwrap();

        let layer = &flat.layers[0];
        assert_eq!(layer.inputs, vec![0, 1]);
        assert_eq!(layer.fields, vec![FlatField::Int(0)]);
    }

    #[test]
    fn projections_share_their_layer() {
        let mut b = GraphBuilder::new();
        b.registry_mut().register("Halves", |ctx, ins, _| {
            Ok(vec![ctx.passthrough(ins[0]), ctx.passthrough(ins[0])])
        });
        let x = b.input(
            "x",
            TensorElemType::F32,
            vec![SymbolicDimension::Fixed(8)],
        );
        let halves = b.layer("Halves", vec![x.into()]).unwrap();
        b.outputs(&halves);
        let flat = convert(&b.finish()).unwrap();

        assert_eq!(flat.layers.len(), 1);
        assert_eq!(flat.layers[0].outputs.len(), 2);
        assert_eq!(flat.outputs.len(), 2);
        assert_eq!(
            flat.outputs,
            flat.layers[0]
                .outputs
                .iter()
                .map(|v| v.index)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn missing_output_is_an_error() {
        let mut b = GraphBuilder::new();
        b.input(
            "x",
            TensorElemType::F32,
            vec![SymbolicDimension::Fixed(1)],
        );
        assert!(matches!(
            convert(&b.finish()),
            Err(ConvertError::NoOutput)
        ));
    }

    #[test]
    fn metadata_comes_from_the_partial_tensor() {
        let gm = small_model();
        let flat = convert(&gm).unwrap();
        assert_eq!(flat.inputs[0].elem_ty, TensorElemType::F32);
        assert_eq!(
            flat.inputs[0].dims.as_ref().unwrap().as_slice(),
            &[
                SymbolicDimension::Param("batch".into()),
                SymbolicDimension::Fixed(4)
            ]
        );
    }
}
