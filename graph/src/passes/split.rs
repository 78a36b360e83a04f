use crate::pb::*;
use crate::pb_helpers::*;

/// Static split sizes of a `Split` node, when they can be known without
/// shape information: the `split` attribute (opset < 13) or a constant
/// initializer second input (opset >= 13).
pub fn static_split_sizes(graph: &GraphProto, split: &NodeProto) -> Option<Vec<i64>> {
    if let Some(sizes) = split.get_attr_opt_ints("split") {
        return Some(sizes.to_vec());
    }
    let sizes = split.input.get(1).filter(|s| !s.is_empty())?;
    graph.get_initializer(sizes)?.to_i64_vec().ok()
}

/// Replace the `Split` node at `ix` by one `Slice` per output, keeping the
/// output names. The slices are inserted in place so the graph stays sorted.
pub fn split_as_slices(graph: &mut GraphProto, ix: usize, sizes: &[i64]) {
    let split = graph.node.remove(ix);
    let axis = split.get_attr_opt_int("axis").unwrap_or(0);
    let mut start = 0i64;
    let mut slices = vec![];
    for (k, (output, size)) in split.output.iter().zip(sizes).enumerate() {
        let end = start + size;
        let prefix = format!("{}/slice_{}", split.name, k);
        let consts = [("starts", start), ("ends", end), ("axes", axis)];
        for (suffix, v) in consts {
            graph.initializer.push(tensor_i64(format!("{prefix}/{suffix}"), &[1], &[v]));
        }
        slices.push(
            node("Slice")
                .name(&prefix)
                .input(&split.input[0])
                .input(format!("{prefix}/starts"))
                .input(format!("{prefix}/ends"))
                .input(format!("{prefix}/axes"))
                .output(output),
        );
        start = end;
    }
    for (offset, s) in slices.into_iter().enumerate() {
        graph.node.insert(ix + offset, s);
    }
}
