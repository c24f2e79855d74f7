use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    analysis::partial::{
        BinaryOp, PartialError, PartialInferenceContext, PartialTensor, PartialTensorElement,
        ReduceOp,
    },
    arg::{for_each_node_ref, Argument},
    module::GraphModule,
    node::NodeId,
    symdim::{SymbolicDimension, SymbolicDimensions},
    tensor::{Tensor, TensorElemType},
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("node '{0}' carries no abstract value")]
    MissingPartial(String),

    #[error(transparent)]
    Inference(#[from] PartialError),
}

/// Transfer rule of one operator: abstract input values plus the node's
/// raw arguments in, one abstract value per output out.
pub type InferFn = fn(
    &PartialInferenceContext,
    &[&PartialTensor],
    &[Argument],
) -> Result<Vec<PartialTensor>, PartialError>;

fn need<'a, 'b>(
    inputs: &'a [&'b PartialTensor],
    n: usize,
) -> Result<&'a [&'b PartialTensor], PartialError> {
    if inputs.len() < n {
        return Err(PartialError::Todo(
            format!("expected {n} inputs, got {}", inputs.len()).into(),
        ));
    }
    Ok(inputs)
}

fn parse_elem_ty(s: &str) -> Result<TensorElemType, PartialError> {
    match s {
        "bool" => Ok(TensorElemType::Bool),
        "f32" => Ok(TensorElemType::F32),
        "i32" => Ok(TensorElemType::I32),
        "i64" => Ok(TensorElemType::I64),
        other => Err(PartialError::Todo(
            format!("unknown element type '{other}'").into(),
        )),
    }
}

fn int_list(arg: Option<&Argument>) -> Vec<i64> {
    arg.and_then(Argument::as_list)
        .map(|xs| xs.iter().filter_map(Argument::as_int).collect())
        .unwrap_or_default()
}

fn bool_arg(arg: Option<&Argument>, default: bool) -> bool {
    match arg {
        Some(Argument::Bool(b)) => *b,
        Some(Argument::Int(i)) => *i != 0,
        _ => default,
    }
}

/// Explicit operator registry: the string target dispatches to a transfer
/// rule, openly extensible instead of being wired into the node types.
pub struct OpRegistry {
    rules: FxHashMap<String, InferFn>,
}

fn binary_rule(op: BinaryOp) -> InferFn {
    match op {
        BinaryOp::Add => |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Add, need(ins, 2)?[0], ins[1])?]),
        BinaryOp::Sub => |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Sub, need(ins, 2)?[0], ins[1])?]),
        BinaryOp::Mul => |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Mul, need(ins, 2)?[0], ins[1])?]),
        BinaryOp::Div => |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Div, need(ins, 2)?[0], ins[1])?]),
        BinaryOp::Pow => |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Pow, need(ins, 2)?[0], ins[1])?]),
        BinaryOp::Greater => {
            |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Greater, need(ins, 2)?[0], ins[1])?])
        }
        BinaryOp::Less => {
            |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Less, need(ins, 2)?[0], ins[1])?])
        }
        BinaryOp::Equal => {
            |ctx, ins, _| Ok(vec![ctx.binary(BinaryOp::Equal, need(ins, 2)?[0], ins[1])?])
        }
    }
}

fn reduce_rule(op: ReduceOp) -> InferFn {
    fn run(
        op: ReduceOp,
        ctx: &PartialInferenceContext,
        ins: &[&PartialTensor],
        args: &[Argument],
    ) -> Result<Vec<PartialTensor>, PartialError> {
        let axes = int_list(args.get(1));
        let keep_dims = bool_arg(args.get(2), true);
        let noop_with_empty_axes = bool_arg(args.get(3), false);
        Ok(vec![ctx.reduce(
            op,
            need(ins, 1)?[0],
            &axes,
            keep_dims,
            noop_with_empty_axes,
        )?])
    }
    match op {
        ReduceOp::Sum => |ctx, ins, args| run(ReduceOp::Sum, ctx, ins, args),
        ReduceOp::Mean => |ctx, ins, args| run(ReduceOp::Mean, ctx, ins, args),
        ReduceOp::Prod => |ctx, ins, args| run(ReduceOp::Prod, ctx, ins, args),
        ReduceOp::Min => |ctx, ins, args| run(ReduceOp::Min, ctx, ins, args),
        ReduceOp::Max => |ctx, ins, args| run(ReduceOp::Max, ctx, ins, args),
    }
}

fn passthrough_rule(ctx: &PartialInferenceContext, ins: &[&PartialTensor], _: &[Argument])
    -> Result<Vec<PartialTensor>, PartialError>
{
    Ok(vec![ctx.passthrough(need(ins, 1)?[0])])
}

fn matmul_rule(
    ctx: &PartialInferenceContext,
    ins: &[&PartialTensor],
    _: &[Argument],
) -> Result<Vec<PartialTensor>, PartialError> {
    let ins = need(ins, 2)?;
    let (a, b) = (ins[0], ins[1]);
    let (Some(sa), Some(sb)) = (a.shape(), b.shape()) else {
        return Ok(vec![ctx.unknown(a.elem_ty())]);
    };
    if sa.len() < 2 || sb.len() < 2 {
        return Err(PartialError::Todo("1-D matmul operand".into()));
    }
    let (ra, rb) = (sa.as_slice(), sb.as_slice());
    let k_a = &ra[ra.len() - 1];
    let k_b = &rb[rb.len() - 2];
    if k_a.merge(k_b).is_none() {
        return Err(PartialError::IncompatibleShapes(
            format!("matmul contraction {k_a:?} vs {k_b:?}").into(),
        ));
    }
    let batch_a = SymbolicDimensions(ra[..ra.len() - 2].to_vec());
    let batch_b = SymbolicDimensions(rb[..rb.len() - 2].to_vec());
    let batch = batch_a.broadcast(&batch_b).ok_or_else(|| {
        PartialError::IncompatibleShapes("matmul batch dimensions do not broadcast".into())
    })?;
    let mut dims = batch.0;
    dims.push(ra[ra.len() - 2].clone());
    dims.push(rb[rb.len() - 1].clone());
    Ok(vec![ctx.input(a.elem_ty(), SymbolicDimensions(dims))])
}

fn transpose_rule(
    ctx: &PartialInferenceContext,
    ins: &[&PartialTensor],
    args: &[Argument],
) -> Result<Vec<PartialTensor>, PartialError> {
    let t = need(ins, 1)?[0];
    let Some(shape) = t.shape() else {
        return Ok(vec![ctx.unknown(t.elem_ty())]);
    };
    let rank = shape.len();
    let perm = {
        let given = int_list(args.get(1));
        if given.is_empty() {
            (0..rank as i64).rev().collect()
        } else {
            given
        }
    };
    if perm.len() != rank {
        return Err(PartialError::IncompatibleShapes(
            format!("permutation of length {} over rank {rank}", perm.len()).into(),
        ));
    }
    let mut dims = Vec::with_capacity(rank);
    for &p in &perm {
        let p = if p < 0 { p + rank as i64 } else { p };
        if p < 0 || p >= rank as i64 {
            return Err(PartialError::IndexOutOfRange(p, rank));
        }
        dims.push(shape.as_slice()[p as usize].clone());
    }
    Ok(vec![ctx.input(t.elem_ty(), SymbolicDimensions(dims))])
}

impl Default for OpRegistry {
    fn default() -> Self {
        let mut r = Self {
            rules: FxHashMap::default(),
        };
        for (name, op) in [
            ("Add", BinaryOp::Add),
            ("Sub", BinaryOp::Sub),
            ("Mul", BinaryOp::Mul),
            ("Div", BinaryOp::Div),
            ("Pow", BinaryOp::Pow),
            ("Greater", BinaryOp::Greater),
            ("Less", BinaryOp::Less),
            ("Equal", BinaryOp::Equal),
        ] {
            r.register(name, binary_rule(op));
        }
        for name in [
            "Relu", "Gelu", "Sigmoid", "Tanh", "Erf", "Sqrt", "Exp", "Softmax",
        ] {
            r.register(name, passthrough_rule);
        }
        for (name, op) in [
            ("ReduceSum", ReduceOp::Sum),
            ("ReduceMean", ReduceOp::Mean),
            ("ReduceProd", ReduceOp::Prod),
            ("ReduceMin", ReduceOp::Min),
            ("ReduceMax", ReduceOp::Max),
        ] {
            r.register(name, reduce_rule(op));
        }
        r.register("Shape", |ctx, ins, _| {
            Ok(vec![ctx.shape_of(need(ins, 1)?[0])])
        });
        r.register("Cast", |ctx, ins, args| {
            let to = args
                .get(1)
                .and_then(Argument::as_str)
                .map(parse_elem_ty)
                .transpose()?
                .ok_or(PartialError::Todo("Cast without a target type".into()))?;
            Ok(vec![ctx.cast(need(ins, 1)?[0], to)])
        });
        r.register("Gather", |ctx, ins, args| {
            let ins = need(ins, 2)?;
            let axis = args.get(2).and_then(Argument::as_int).unwrap_or(0);
            Ok(vec![ctx.gather(ins[0], ins[1], axis)?])
        });
        r.register("Reshape", |ctx, ins, _| {
            let ins = need(ins, 2)?;
            let (data, shape) = (ins[0], ins[1]);
            let Some(n) = shape.total_elems() else {
                return Ok(vec![ctx.unknown(data.elem_ty())]);
            };
            let spec: Vec<PartialTensorElement> = (0..n).map(|i| shape.get(i)).collect();
            Ok(vec![ctx.reshape(data, &spec)?])
        });
        r.register("Concat", |ctx, ins, args| {
            let axis = args
                .iter()
                .find_map(Argument::as_int)
                .unwrap_or(0);
            Ok(vec![ctx.concat(ins, axis)?])
        });
        r.register("MatMul", matmul_rule);
        r.register("Transpose", transpose_rule);
        r
    }
}

impl OpRegistry {
    pub fn register(&mut self, target: &str, rule: InferFn) {
        self.rules.insert(target.to_string(), rule);
    }

    pub fn get(&self, target: &str) -> Option<InferFn> {
        self.rules.get(target).copied()
    }
}

/// The construction surface the model-format front end drives. Every node
/// it produces carries its abstract value before being handed back.
pub struct GraphBuilder {
    pub module: GraphModule,
    ctx: PartialInferenceContext,
    registry: OpRegistry,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::with_context(PartialInferenceContext::default())
    }

    pub fn with_context(ctx: PartialInferenceContext) -> Self {
        Self {
            module: GraphModule::new(),
            ctx,
            registry: OpRegistry::default(),
        }
    }

    pub fn ctx(&self) -> &PartialInferenceContext {
        &self.ctx
    }

    pub fn registry_mut(&mut self) -> &mut OpRegistry {
        &mut self.registry
    }

    pub fn input(
        &mut self,
        name: &str,
        elem_ty: TensorElemType,
        dims: Vec<SymbolicDimension>,
    ) -> NodeId {
        let id = self.module.graph.placeholder(name);
        self.module.graph[id].partial = Some(self.ctx.input(elem_ty, SymbolicDimensions(dims)));
        id
    }

    pub fn constant(&mut self, tensor: Tensor) -> NodeId {
        let partial = self.ctx.from_tensor(&tensor);
        let name = self.module.add_attr("const", tensor);
        let id = self.module.graph.get_attr(&name);
        self.module.graph[id].partial = Some(partial);
        id
    }

    /// Adds one operator invocation. Node arguments come first (nested
    /// lists for variadic inputs), literal attributes after. Multi-output
    /// operators come back as one projection node per output.
    pub fn layer(&mut self, target: &str, args: Vec<Argument>) -> Result<Vec<NodeId>, BuildError> {
        let mut input_ids = vec![];
        for a in &args {
            for_each_node_ref(a, &mut |id| input_ids.push(id));
        }
        let partials: Vec<PartialTensor> = input_ids
            .iter()
            .map(|&id| {
                self.module.graph[id]
                    .partial
                    .clone()
                    .ok_or_else(|| BuildError::MissingPartial(self.module.graph[id].name().into()))
            })
            .collect::<Result<_, _>>()?;
        let refs: Vec<&PartialTensor> = partials.iter().collect();
        let outs = match self.registry.get(target) {
            Some(rule) => rule(&self.ctx, &refs, &args)?,
            // Unknown operators still flow: shape-erased, type carried
            // from the first input.
            None => vec![self.ctx.unknown(
                refs.first()
                    .map(|p| p.elem_ty())
                    .unwrap_or(TensorElemType::F32),
            )],
        };
        let node = self.module.graph.call_function(target, args);
        if outs.len() == 1 {
            self.module.graph[node].partial = Some(outs.into_iter().next().unwrap());
            Ok(vec![node])
        } else {
            let mut projections = vec![];
            for (i, p) in outs.into_iter().enumerate() {
                let proj = self
                    .module
                    .graph
                    .call_function("getitem", vec![node.into(), (i as i64).into()]);
                self.module.graph[proj].partial = Some(p);
                projections.push(proj);
            }
            Ok(projections)
        }
    }

    pub fn outputs(&mut self, nodes: &[NodeId]) -> NodeId {
        let arg = match nodes {
            [single] => Argument::Node(*single),
            many => Argument::List(many.iter().map(|&n| Argument::Node(n)).collect()),
        };
        self.module.graph.output(arg)
    }

    /// Like [`outputs`](Self::outputs), additionally recording the public
    /// names of the result tensors on the Output node's side table.
    pub fn outputs_named(&mut self, names: &[&str], nodes: &[NodeId]) -> NodeId {
        assert_eq!(names.len(), nodes.len(), "one name per output");
        let out = self.outputs(nodes);
        self.module.graph[out].meta.insert(
            "output_names".into(),
            Argument::List(names.iter().map(|&n| Argument::Str(n.into())).collect()),
        );
        out
    }

    pub fn finish(self) -> GraphModule {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::partial::Scalar;

    fn batch_input(b: &mut GraphBuilder) -> NodeId {
        b.input(
            "image",
            TensorElemType::F32,
            vec![
                SymbolicDimension::Param("batch".into()),
                SymbolicDimension::Fixed(3),
                SymbolicDimension::Fixed(224),
                SymbolicDimension::Fixed(224),
            ],
        )
    }

    #[test]
    fn every_built_node_carries_its_abstract_value() {
        let mut b = GraphBuilder::new();
        let img = batch_input(&mut b);
        let shape = b.layer("Shape", vec![img.into()]).unwrap()[0];
        let idx = b.constant(Tensor::scalar(0i64));
        let batch = b
            .layer("Gather", vec![shape.into(), idx.into(), 0i64.into()])
            .unwrap()[0];
        b.outputs(&[batch]);

        let p = b.module.graph[batch].partial.as_ref().unwrap();
        assert_eq!(p.get(0), PartialTensorElement::Param("batch".into()));
        let p = b.module.graph[shape].partial.as_ref().unwrap();
        assert_eq!(p.get(1), PartialTensorElement::Value(Scalar::I64(3)));
        b.module.graph.lint();
    }

    #[test]
    fn elementwise_chain_keeps_the_symbolic_shape() {
        let mut b = GraphBuilder::new();
        let img = batch_input(&mut b);
        let bias = b.constant(Tensor::zeros::<f32>(vec![3, 1, 1].into()));
        let add = b.layer("Add", vec![img.into(), bias.into()]).unwrap()[0];
        let relu = b.layer("Relu", vec![add.into()]).unwrap()[0];
        b.outputs(&[relu]);

        let p = b.module.graph[relu].partial.as_ref().unwrap();
        assert_eq!(
            p.shape().unwrap().as_slice()[0],
            SymbolicDimension::Param("batch".into())
        );
        assert_eq!(p.shape().unwrap().as_slice()[1], SymbolicDimension::Fixed(3));
    }

    #[test]
    fn unknown_targets_fall_back_to_a_shape_erased_value() {
        let mut b = GraphBuilder::new();
        let img = batch_input(&mut b);
        let mystery = b.layer("FancyNewOp", vec![img.into()]).unwrap()[0];
        let p = b.module.graph[mystery].partial.as_ref().unwrap();
        assert_eq!(p.elem_ty(), TensorElemType::F32);
        assert!(p.shape().is_none());
    }

    #[test]
    fn multi_output_rules_come_back_as_projections() {
        let mut b = GraphBuilder::new();
        b.registry_mut().register("TwoHalves", |ctx, ins, _| {
            let t = need(ins, 1)?[0];
            Ok(vec![ctx.passthrough(t), ctx.passthrough(t)])
        });
        let img = batch_input(&mut b);
        let halves = b.layer("TwoHalves", vec![img.into()]).unwrap();
        assert_eq!(halves.len(), 2);
        for (i, &h) in halves.iter().enumerate() {
            assert_eq!(b.module.graph[h].target(), "getitem");
            assert_eq!(b.module.graph[h].args()[1], Argument::Int(i as i64));
            assert!(b.module.graph[h].partial.is_some());
        }
        b.outputs(&halves);
        b.module.graph.lint();
    }

    #[test]
    fn variadic_inputs_nest_in_a_list() {
        let mut b = GraphBuilder::new();
        let x = b.constant(Tensor::new(vec![2].into(), vec![1i64, 2]));
        let y = b.constant(Tensor::new(vec![1].into(), vec![3i64]));
        let cat = b
            .layer(
                "Concat",
                vec![Argument::List(vec![x.into(), y.into()]), 0i64.into()],
            )
            .unwrap()[0];
        let p = b.module.graph[cat].partial.as_ref().unwrap();
        assert_eq!(p.total_elems(), Some(3));
        assert_eq!(p.get(2), PartialTensorElement::Value(Scalar::I64(3)));
    }

    #[test]
    fn nodes_without_partials_are_rejected() {
        let mut b = GraphBuilder::new();
        let raw = b.module.graph.placeholder("raw");
        let err = b.layer("Relu", vec![raw.into()]).unwrap_err();
        assert!(matches!(err, BuildError::MissingPartial(name) if name == "raw"));
    }

    #[test]
    fn division_by_zero_surfaces_at_build_time() {
        let mut b = GraphBuilder::new();
        let x = b.constant(Tensor::new(vec![1].into(), vec![1.0f32]));
        let zero = b.constant(Tensor::zeros::<f32>(vec![1].into()));
        let err = b.layer("Div", vec![x.into(), zero.into()]).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Inference(PartialError::DivisionByZero)
        ));
    }

    #[test]
    fn matmul_shapes() {
        let mut b = GraphBuilder::new();
        let x = b.input(
            "x",
            TensorElemType::F32,
            vec![
                SymbolicDimension::Param("batch".into()),
                SymbolicDimension::Fixed(16),
                SymbolicDimension::Fixed(64),
            ],
        );
        let w = b.constant(Tensor::zeros::<f32>(vec![64, 32].into()));
        let y = b.layer("MatMul", vec![x.into(), w.into()]).unwrap()[0];
        let p = b.module.graph[y].partial.as_ref().unwrap();
        assert_eq!(
            p.shape().unwrap().as_slice(),
            &[
                SymbolicDimension::Param("batch".into()),
                SymbolicDimension::Fixed(16),
                SymbolicDimension::Fixed(32)
            ]
        );
    }
}
