use std::collections::HashSet;

use crate::TractResult;
use crate::pb::tensor_proto::DataType;
use crate::pb::*;
use crate::pb_helpers::*;

/// Operator inputs that must stay single precision whatever the graph
/// float type is (`Resize` roi and scales, `Upsample` scales).
fn float_only_inputs(graph: &GraphProto) -> HashSet<String> {
    let mut set = HashSet::new();
    for n in &graph.node {
        let slots: &[usize] = match &*n.op_type {
            "Resize" => &[1, 2],
            "Upsample" => &[1],
            _ => &[],
        };
        for &s in slots {
            if let Some(name) = n.input.get(s).filter(|s| !s.is_empty()) {
                set.insert(name.clone());
            }
        }
    }
    set
}

fn halve(t: &TensorProto) -> TractResult<TensorProto> {
    let data = t.to_f32_vec()?;
    let mut halved = tensor_f16(&t.name, &t.shape(), &data);
    halved.doc_string = t.doc_string.clone();
    Ok(halved)
}

fn halve_value_info(v: &mut ValueInfoProto) {
    if let Some(t) = v.tensor_type_mut() {
        if t.elem_type == DataType::Float as i32 {
            t.elem_type = DataType::Float16 as i32;
        }
    }
}

/// Convert a single precision graph to half precision: float initializers,
/// constant payloads, casts to float, and the graph interface.
///
/// Intermediate value infos are dropped as their types would be stale.
pub fn to_half(graph: &mut GraphProto) -> TractResult<()> {
    let keep = float_only_inputs(graph);
    for init in graph.initializer.iter_mut() {
        if init.elem_type() == Some(DataType::Float) && !keep.contains(&init.name) {
            *init = halve(init)?;
        }
    }
    for n in graph.node.iter_mut() {
        match &*n.op_type {
            "Constant" if !n.output.iter().any(|o| keep.contains(o)) => {
                if let Some(t) = n.get_attr_opt_tensor("value").cloned() {
                    if t.elem_type() == Some(DataType::Float) {
                        n.set_attr("value", halve(&t)?);
                    }
                }
            }
            "ConstantOfShape" => {
                if let Some(t) = n.get_attr_opt_tensor("value").cloned() {
                    if t.elem_type() == Some(DataType::Float) {
                        n.set_attr("value", halve(&t)?);
                    }
                }
            }
            "Cast" if n.get_attr_opt_int("to") == Some(DataType::Float as i64) => {
                n.set_attr("to", DataType::Float16 as i64);
            }
            _ => (),
        }
    }
    graph.input.iter_mut().for_each(halve_value_info);
    graph.output.iter_mut().for_each(halve_value_info);
    graph.value_info.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_and_interface_become_half() {
        let mut g = graph("g")
            .input(value_info("x", DataType::Float, &[1usize.into()]))
            .initializer(tensor_f32("w", &[1], &[2.0]))
            .initializer(tensor_f32("scales", &[4], &[1.0, 1.0, 2.0, 2.0]))
            .initializer(tensor_i64("shape", &[1], &[1]))
            .node(node("Mul").input("x").input("w").output("m"))
            .node(node("Resize").input("m").input("").input("scales").output("r"))
            .node(node("Cast").input("r").attr("to", DataType::Float as i64).output("y"))
            .output(value_info("y", DataType::Float, &[1usize.into()]));
        to_half(&mut g).unwrap();
        assert_eq!(g.get_initializer("w").unwrap().elem_type(), Some(DataType::Float16));
        assert_eq!(g.get_initializer("scales").unwrap().elem_type(), Some(DataType::Float));
        assert_eq!(g.get_initializer("shape").unwrap().elem_type(), Some(DataType::Int64));
        assert_eq!(g.node[2].get_attr_opt_int("to"), Some(DataType::Float16 as i64));
        assert_eq!(g.input[0].elem_type(), Some(DataType::Float16));
        assert_eq!(g.output[0].elem_type(), Some(DataType::Float16));
    }
}
