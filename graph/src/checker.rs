use std::collections::HashSet;

use anyhow::{bail, ensure};

use crate::TractResult;
use crate::pb::*;

/// Structural validation of a model before it is handed to consumers.
///
/// Nodes must be in topological order, every consumed value must be defined
/// exactly once, and every operator domain must be imported.
pub fn check_model(model: &ModelProto) -> TractResult<()> {
    ensure!(model.ir_version > 0, "Model has no IR version");
    ensure!(model.opset_version("").is_some(), "Model does not import the default ONNX opset");
    let graph = model.graph()?;
    ensure!(!graph.input.is_empty(), "Graph {} has no input", graph.name);
    ensure!(!graph.output.is_empty(), "Graph {} has no output", graph.name);

    let mut defined: HashSet<&str> = HashSet::new();
    for init in &graph.initializer {
        ensure!(!init.name.is_empty(), "Unnamed initializer");
        if !defined.insert(&init.name) {
            bail!("Initializer {} is defined twice", init.name);
        }
    }
    for input in &graph.input {
        // initializers may legitimately be listed as inputs (IR < 4)
        defined.insert(&input.name);
    }

    let mut node_names = HashSet::new();
    for node in &graph.node {
        ensure!(!node.op_type.is_empty(), "Node {} has no operator", node.name);
        if !node.name.is_empty() && !node_names.insert(&*node.name) {
            bail!("Node name {} is used twice", node.name);
        }
        if model.opset_version(&node.domain).is_none() {
            bail!("Node {} uses domain {:?} which is not imported", node, node.domain);
        }
        for input in node.wired_inputs() {
            if !defined.contains(input) {
                bail!("Node {} consumes {} before it is defined", node, input);
            }
        }
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !defined.insert(output) {
                bail!("Node {} redefines {}", node, output);
            }
        }
    }
    for output in &graph.output {
        ensure!(defined.contains(&*output.name), "Graph output {} is never computed", output.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::tensor_proto::DataType;
    use crate::pb_helpers::*;

    fn wrap(g: GraphProto) -> ModelProto {
        let mut m = model();
        m.ir_version = 7;
        m.ensure_opset("", 12);
        m.graph = Some(g);
        m
    }

    fn io(name: &str) -> ValueInfoProto {
        value_info(name, DataType::Float, &[1usize.into()])
    }

    #[test]
    fn accepts_well_formed() {
        let g = graph("g")
            .input(io("x"))
            .node(node("Relu").name("a").input("x").output("y"))
            .node(node("Relu").name("b").input("y").output("z"))
            .output(io("z"));
        check_model(&wrap(g)).unwrap();
    }

    #[test]
    fn rejects_unsorted() {
        let g = graph("g")
            .input(io("x"))
            .node(node("Relu").name("b").input("y").output("z"))
            .node(node("Relu").name("a").input("x").output("y"))
            .output(io("z"));
        assert!(check_model(&wrap(g)).is_err());
    }

    #[test]
    fn rejects_missing_output() {
        let g = graph("g").input(io("x")).node(node("Relu").input("x").output("y")).output(io("w"));
        assert!(check_model(&wrap(g)).is_err());
    }

    #[test]
    fn rejects_undeclared_domain() {
        let g = graph("g")
            .input(io("x"))
            .node(node("EfficientNMSX_TRT").domain("TRT").input("x").output("y"))
            .output(io("y"));
        let mut m = wrap(g);
        assert!(check_model(&m).is_err());
        m.ensure_opset("TRT", 1);
        check_model(&m).unwrap();
    }

    #[test]
    fn optional_empty_inputs_are_fine() {
        let g = graph("g")
            .input(io("x"))
            .node(node("Resize").input("x").input("").input("").output("y"))
            .output(io("y"));
        check_model(&wrap(g)).unwrap();
    }
}
