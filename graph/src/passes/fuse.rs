use anyhow::{Context, ensure};

use crate::TractResult;
use crate::pb::*;
use crate::pb_helpers::*;

/// Fold every `BatchNormalization` that directly follows a `Conv` into the
/// convolution weights and bias.
///
/// Only applies when the convolution output feeds the normalization alone and
/// every parameter is a constant initializer. Returns the number of folded
/// normalizations.
pub fn fuse_conv_bn(graph: &mut GraphProto) -> TractResult<usize> {
    let mut fused = 0;
    let mut ix = 0;
    while ix < graph.node.len() {
        if graph.node[ix].op_type != "BatchNormalization" {
            ix += 1;
            continue;
        }
        let Some(conv_ix) = foldable_conv(graph, ix) else {
            ix += 1;
            continue;
        };
        fold(graph, conv_ix, ix)
            .with_context(|| format!("Folding {} into {}", graph.node[ix], graph.node[conv_ix]))?;
        graph.node.remove(ix);
        fused += 1;
    }
    if fused > 0 {
        debug!("Folded {fused} batch normalizations into convolutions");
    }
    Ok(fused)
}

fn foldable_conv(graph: &GraphProto, bn_ix: usize) -> Option<usize> {
    let bn = &graph.node[bn_ix];
    if bn.input.len() != 5 || bn.output.iter().skip(1).any(|o| !o.is_empty()) {
        return None;
    }
    if !bn.input[1..].iter().all(|i| graph.get_initializer(i).is_some()) {
        return None;
    }
    let conv_ix = *graph.producers().get(&*bn.input[0])?;
    let conv = &graph.node[conv_ix];
    if conv.op_type != "Conv" || conv.output.len() != 1 {
        return None;
    }
    if graph.consumers(&conv.output[0]).len() != 1 || graph.is_graph_output(&conv.output[0]) {
        return None;
    }
    if !conv.wired_inputs().skip(1).all(|i| graph.get_initializer(i).is_some()) {
        return None;
    }
    Some(conv_ix)
}

fn fold(graph: &mut GraphProto, conv_ix: usize, bn_ix: usize) -> TractResult<()> {
    let bn = graph.node[bn_ix].clone();
    let conv = graph.node[conv_ix].clone();
    let epsilon = bn.get_attr_opt_float("epsilon").unwrap_or(1e-5);
    let param = |name: &str| -> TractResult<Vec<f32>> {
        graph.get_initializer(name).context("missing initializer")?.to_f32_vec()
    };
    let gamma = param(&bn.input[1])?;
    let beta = param(&bn.input[2])?;
    let mean = param(&bn.input[3])?;
    let var = param(&bn.input[4])?;
    let weight_proto = graph.get_initializer(&conv.input[1]).context("missing weights")?;
    let weight_shape = weight_proto.shape();
    let mut weight = weight_proto.to_f32_vec()?;
    let out_channels = weight_shape[0];
    ensure!(gamma.len() == out_channels, "channel mismatch");
    let bias = match conv.input.get(2).filter(|s| !s.is_empty()) {
        Some(b) => param(b)?,
        None => vec![0.0; out_channels],
    };

    let per_channel = weight.len() / out_channels;
    let mut new_bias = Vec::with_capacity(out_channels);
    for o in 0..out_channels {
        let scale = gamma[o] / (var[o] + epsilon).sqrt();
        weight[o * per_channel..(o + 1) * per_channel].iter_mut().for_each(|w| *w *= scale);
        new_bias.push((bias[o] - mean[o]) * scale + beta[o]);
    }

    let weight_name = format!("{}_fused", conv.input[1]);
    let bias_name = format!("{}_fused_bias", conv.name);
    graph.initializer.push(tensor_f32(&weight_name, &weight_shape, &weight));
    graph.initializer.push(tensor_f32(&bias_name, &[out_channels], &new_bias));
    let conv = &mut graph.node[conv_ix];
    conv.input.truncate(1);
    conv.input.push(weight_name);
    conv.input.push(bias_name);
    conv.output[0] = bn.output[0].clone();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::tensor_proto::DataType;
    use approx::assert_abs_diff_eq;

    #[test]
    fn conv_bn_is_folded() {
        let io = |n: &str| value_info(n, DataType::Float, &[1usize.into()]);
        let mut g = graph("g")
            .input(io("x"))
            .initializer(tensor_f32("w", &[2, 1, 1, 1], &[1.0, 2.0]))
            .initializer(tensor_f32("gamma", &[2], &[2.0, 1.0]))
            .initializer(tensor_f32("beta", &[2], &[0.5, 0.0]))
            .initializer(tensor_f32("mean", &[2], &[1.0, -1.0]))
            .initializer(tensor_f32("var", &[2], &[3.0, 0.0]))
            .node(node("Conv").name("conv").input("x").input("w").output("c"))
            .node(
                node("BatchNormalization")
                    .name("bn")
                    .input("c")
                    .input("gamma")
                    .input("beta")
                    .input("mean")
                    .input("var")
                    .attr("epsilon", 1.0f32)
                    .output("y"),
            )
            .output(io("y"));
        assert_eq!(fuse_conv_bn(&mut g).unwrap(), 1);
        assert_eq!(g.node.len(), 1);
        let conv = &g.node[0];
        assert_eq!(conv.output, vec!["y".to_string()]);
        let w = g.get_initializer(&conv.input[1]).unwrap().to_f32_vec().unwrap();
        let b = g.get_initializer(&conv.input[2]).unwrap().to_f32_vec().unwrap();
        // scales: 2/sqrt(4) = 1, 1/sqrt(1) = 1
        assert_abs_diff_eq!(w[0], 1.0);
        assert_abs_diff_eq!(w[1], 2.0);
        assert_abs_diff_eq!(b[0], -0.5);
        assert_abs_diff_eq!(b[1], 1.0);
    }

    #[test]
    fn shared_conv_output_is_not_folded() {
        let io = |n: &str| value_info(n, DataType::Float, &[1usize.into()]);
        let mut g = graph("g")
            .input(io("x"))
            .initializer(tensor_f32("w", &[1, 1, 1, 1], &[1.0]))
            .initializer(tensor_f32("p", &[1], &[1.0]))
            .node(node("Conv").name("conv").input("x").input("w").output("c"))
            .node(
                node("BatchNormalization")
                    .name("bn")
                    .input("c")
                    .input("p")
                    .input("p")
                    .input("p")
                    .input("p")
                    .output("y"),
            )
            .node(node("Relu").name("relu").input("c").output("z"))
            .output(io("y"))
            .output(io("z"));
        assert_eq!(fuse_conv_bn(&mut g).unwrap(), 0);
        assert_eq!(g.node.len(), 3);
    }
}
