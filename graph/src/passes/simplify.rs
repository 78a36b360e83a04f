use anyhow::{Context, ensure};

use crate::TractResult;
use crate::pb::*;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimplifyStats {
    pub constants_folded: usize,
    pub identities_removed: usize,
    pub outputs_typed: usize,
}

/// Move `Constant` node payloads to initializers.
pub fn fold_constants(graph: &mut GraphProto) -> usize {
    let mut folded = 0;
    let mut ix = 0;
    while ix < graph.node.len() {
        let n = &graph.node[ix];
        let payload = (n.op_type == "Constant" && n.output.len() == 1)
            .then(|| n.get_attr_opt_tensor("value").cloned())
            .flatten();
        match payload {
            Some(mut t) => {
                t.name = n.output[0].clone();
                graph.node.remove(ix);
                graph.initializer.push(t);
                folded += 1;
            }
            None => ix += 1,
        }
    }
    folded
}

/// Simplify a model in place: constant folding, identity elimination and
/// output shape inference.
///
/// Shape inference types the whole model with tract, so it fails on
/// operators tract does not know about (runtime plugins). The caller is
/// expected to keep its previous model in that case.
pub fn simplify(model: &mut ModelProto) -> TractResult<SimplifyStats> {
    let mut stats = SimplifyStats::default();
    let graph = model.graph_mut()?;
    stats.constants_folded = fold_constants(graph);
    stats.identities_removed = super::eval_mode::to_eval_mode(graph);
    crate::checker::check_model(model).context("Model is invalid after folding")?;

    let outputs = crate::runtime::infer_outputs(model)?;
    let graph = model.graph_mut()?;
    ensure!(outputs.len() == graph.output.len(), "Shape inference lost outputs");
    for (declared, inferred) in graph.output.iter_mut().zip(outputs) {
        *declared = merge_declared(declared, inferred);
        stats.outputs_typed += 1;
    }
    Ok(stats)
}

/// Inferred dims replace declared ones, except that a declared symbolic
/// dimension (a dynamic axis) always wins.
fn merge_declared(declared: &ValueInfoProto, mut inferred: ValueInfoProto) -> ValueInfoProto {
    use crate::pb::tensor_shape_proto::dimension::Value;
    let (Some(d), Some(i)) = (
        declared.tensor_type().and_then(|t| t.shape.as_ref()),
        inferred.tensor_type_mut().and_then(|t| t.shape.as_mut()),
    ) else {
        return declared.clone();
    };
    if d.dim.len() != i.dim.len() {
        return declared.clone();
    }
    for (dd, id) in d.dim.iter().zip(i.dim.iter_mut()) {
        if matches!(dd.value, Some(Value::DimParam(_))) {
            *id = dd.clone();
        }
    }
    inferred.doc_string = declared.doc_string.clone();
    inferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::tensor_proto::DataType;
    use crate::pb_helpers::*;

    #[test]
    fn constants_move_to_initializers() {
        let mut g = graph("g")
            .node(
                node("Constant").name("c").attr("value", tensor_f32("", &[1], &[4.0])).output("k"),
            )
            .node(node("Mul").input("x").input("k").output("y"));
        assert_eq!(fold_constants(&mut g), 1);
        assert_eq!(g.node.len(), 1);
        assert_eq!(g.get_initializer("k").unwrap().to_f32_vec().unwrap(), vec![4.0]);
    }

    #[test]
    fn declared_symbols_survive_inference() {
        let declared = value_info("y", DataType::Float, &["batch".into(), 3usize.into()]);
        let inferred = value_info("y", DataType::Float, &[1usize.into(), 3usize.into()]);
        let merged = merge_declared(&declared, inferred);
        assert_eq!(merged.dims().unwrap(), vec![Dim::Param("batch".into()), Dim::Value(3)]);
    }
}
