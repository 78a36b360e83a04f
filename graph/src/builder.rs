use std::collections::HashSet;

use crate::pb::tensor_proto::DataType;
use crate::pb::*;
use crate::pb_helpers::*;

/// Appends nodes to an existing graph, naming them after the scope prefix
/// the way exporters do (`/end2end/Concat_3`, `/end2end/Concat_3_output_0`).
///
/// Operator forms that changed across opsets (`Unsqueeze`, `Squeeze`,
/// `ReduceMax`, `RoiAlign`) are picked from `opset`. Float constants are
/// emitted in `float_type`, so a half-precision graph stays homogeneous.
pub struct GraphBuilder<'g> {
    pub graph: &'g mut GraphProto,
    pub opset: i64,
    pub float_type: DataType,
    prefix: String,
    taken: HashSet<String>,
    counter: usize,
}

impl<'g> GraphBuilder<'g> {
    pub fn new(graph: &'g mut GraphProto, prefix: &str, opset: i64) -> GraphBuilder<'g> {
        let mut taken = HashSet::new();
        for n in &graph.node {
            taken.insert(n.name.clone());
            taken.extend(n.output.iter().cloned());
        }
        taken.extend(graph.input.iter().map(|i| i.name.clone()));
        taken.extend(graph.initializer.iter().map(|i| i.name.clone()));
        GraphBuilder {
            graph,
            opset,
            float_type: DataType::Float,
            prefix: prefix.trim_end_matches('/').to_string(),
            taken,
            counter: 0,
        }
    }

    pub fn with_float_type(mut self, dt: DataType) -> GraphBuilder<'g> {
        self.float_type = dt;
        self
    }

    /// A graph-wide unique name derived from `hint`.
    pub fn fresh(&mut self, hint: &str) -> String {
        let base = format!("{}/{}", self.prefix, hint);
        let mut name = base.clone();
        while self.taken.contains(&name) {
            self.counter += 1;
            name = format!("{}_{}", base, self.counter);
        }
        self.taken.insert(name.clone());
        name
    }

    /// Reserve an exact name, typically a graph output.
    pub fn claim(&mut self, name: &str) -> bool {
        self.taken.insert(name.to_string())
    }

    /// Add a node with `outputs` fresh outputs, returning their names.
    pub fn wire(&mut self, mut node: NodeProto, outputs: usize) -> Vec<String> {
        let name = self.fresh(&node.op_type.clone());
        node.name = name.clone();
        node.output = (0..outputs)
            .map(|ix| {
                let candidate = format!("{name}_output_{ix}");
                self.taken.insert(candidate.clone());
                candidate
            })
            .collect();
        let outputs = node.output.clone();
        self.graph.node.push(node);
        outputs
    }

    pub fn op(&mut self, node: NodeProto) -> String {
        self.wire(node, 1).remove(0)
    }

    pub fn const_i64(&mut self, hint: &str, shape: &[usize], data: &[i64]) -> String {
        let name = self.fresh(hint);
        self.graph.initializer.push(tensor_i64(&name, shape, data));
        name
    }

    pub fn const_ints(&mut self, hint: &str, data: &[i64]) -> String {
        self.const_i64(hint, &[data.len()], data)
    }

    pub fn const_float(&mut self, hint: &str, shape: &[usize], data: &[f32]) -> String {
        let name = self.fresh(hint);
        self.graph.initializer.push(tensor_float(&name, self.float_type, shape, data));
        name
    }

    pub fn const_f32(&mut self, hint: &str, shape: &[usize], data: &[f32]) -> String {
        let name = self.fresh(hint);
        self.graph.initializer.push(tensor_f32(&name, shape, data));
        name
    }

    pub fn slice(&mut self, x: &str, axis: i64, start: i64, end: i64) -> String {
        let starts = self.const_ints("starts", &[start]);
        let ends = self.const_ints("ends", &[end]);
        let axes = self.const_ints("axes", &[axis]);
        self.op(node("Slice").input(x).input(starts).input(ends).input(axes))
    }

    pub fn unsqueeze(&mut self, x: &str, axes: &[i64]) -> String {
        if self.opset < 13 {
            self.op(node("Unsqueeze").input(x).attr("axes", axes.to_vec()))
        } else {
            let axes = self.const_ints("axes", axes);
            self.op(node("Unsqueeze").input(x).input(axes))
        }
    }

    pub fn squeeze(&mut self, x: &str, axes: &[i64]) -> String {
        if self.opset < 13 {
            self.op(node("Squeeze").input(x).attr("axes", axes.to_vec()))
        } else {
            let axes = self.const_ints("axes", axes);
            self.op(node("Squeeze").input(x).input(axes))
        }
    }

    pub fn reduce_max(&mut self, x: &str, axes: &[i64], keepdims: bool) -> String {
        if self.opset < 18 {
            self.op(
                node("ReduceMax")
                    .input(x)
                    .attr("axes", axes.to_vec())
                    .attr("keepdims", keepdims as i64),
            )
        } else {
            let axes = self.const_ints("axes", axes);
            self.op(node("ReduceMax").input(x).input(axes).attr("keepdims", keepdims as i64))
        }
    }

    pub fn arg_max(&mut self, x: &str, axis: i64, keepdims: bool) -> String {
        self.op(node("ArgMax").input(x).attr("axis", axis).attr("keepdims", keepdims as i64))
    }

    pub fn reshape(&mut self, x: &str, shape: &[i64]) -> String {
        let shape = self.const_ints("shape", shape);
        self.op(node("Reshape").input(x).input(shape))
    }

    pub fn transpose(&mut self, x: &str, perm: &[i64]) -> String {
        self.op(node("Transpose").input(x).attr("perm", perm.to_vec()))
    }

    pub fn concat(&mut self, inputs: &[&str], axis: i64) -> String {
        let mut n = node("Concat").attr("axis", axis);
        for i in inputs {
            n = n.input(i);
        }
        self.op(n)
    }

    pub fn gather(&mut self, x: &str, indices: &str, axis: i64) -> String {
        self.op(node("Gather").input(x).input(indices).attr("axis", axis))
    }

    pub fn binary(&mut self, op: &str, a: &str, b: &str) -> String {
        self.op(node(op).input(a).input(b))
    }

    pub fn unary(&mut self, op: &str, x: &str) -> String {
        self.op(node(op).input(x))
    }

    pub fn cast(&mut self, x: &str, to: DataType) -> String {
        self.op(node("Cast").input(x).attr("to", to as i64))
    }

    /// `Shape(x)[axis]` as a 1-element int64 tensor.
    pub fn dim(&mut self, x: &str, axis: i64) -> String {
        let shape = self.unary("Shape", x);
        let ix = self.const_ints("dim", &[axis]);
        self.gather(&shape, &ix, 0)
    }

    pub fn constant_of_shape(&mut self, shape: &str, value: f32) -> String {
        let value = tensor_float("value", self.float_type, &[1], &[value]);
        self.op(node("ConstantOfShape").input(shape).attr("value", value))
    }

    /// `Range(0, limit, 1)` over int64, `limit` being a scalar.
    pub fn range(&mut self, limit: &str) -> String {
        let start = self.const_i64("start", &[], &[0]);
        let delta = self.const_i64("delta", &[], &[1]);
        self.op(node("Range").input(start).input(limit).input(delta))
    }

    /// Bilinear resize by per-axis scale factors.
    pub fn resize_bilinear_scales(&mut self, x: &str, scales: &[f32]) -> String {
        let roi = self.const_f32("roi", &[0], &[]);
        let scales = self.const_f32("scales", &[scales.len()], scales);
        self.op(
            node("Resize")
                .input(x)
                .input(roi)
                .input(scales)
                .attr("mode", "linear")
                .attr("coordinate_transformation_mode", "half_pixel"),
        )
    }

    /// Give the value produced by one of our nodes its public name.
    pub fn publish(&mut self, value: &str, name: &str) -> String {
        self.claim(name);
        self.graph.rename_everywhere(value, name);
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_scoped() {
        let mut g = graph("g").node(node("Relu").name("/e2e/Relu").input("x").output("y"));
        let mut b = GraphBuilder::new(&mut g, "/e2e", 12);
        let a = b.unary("Relu", "y");
        let c = b.unary("Relu", &a);
        assert_ne!(a, c);
        assert!(a.starts_with("/e2e/Relu_"));
        assert_eq!(g.node.len(), 3);
        assert_eq!(g.node[2].input, vec![a]);
    }

    #[test]
    fn unsqueeze_form_follows_opset() {
        let mut g = graph("g");
        GraphBuilder::new(&mut g, "/a", 12).unsqueeze("x", &[0]);
        assert_eq!(g.node[0].get_attr_opt_ints("axes"), Some(&[0i64][..]));
        assert!(g.initializer.is_empty());

        let mut g = graph("g");
        GraphBuilder::new(&mut g, "/a", 13).unsqueeze("x", &[0]);
        assert!(g.node[0].get_attr_opt("axes").is_none());
        assert_eq!(g.node[0].input.len(), 2);
        assert_eq!(g.initializer[0].to_i64_vec().unwrap(), vec![0]);
    }

    #[test]
    fn float_constants_follow_float_type() {
        let mut g = graph("g");
        let mut b = GraphBuilder::new(&mut g, "/a", 12).with_float_type(DataType::Float16);
        b.const_float("k", &[2], &[1.0, 2.0]);
        assert_eq!(g.initializer[0].elem_type(), Some(DataType::Float16));
    }
}
