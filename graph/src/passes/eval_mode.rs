use crate::pb::*;

/// Strip training-only behaviour: `Dropout` becomes a pass-through and
/// `Identity` nodes are bypassed. Nodes whose output is part of the graph
/// interface are kept so output names do not change.
///
/// Returns the number of bypassed nodes.
pub fn to_eval_mode(graph: &mut GraphProto) -> usize {
    let mut bypassed = 0;
    let mut ix = 0;
    while ix < graph.node.len() {
        let n = &graph.node[ix];
        let passthrough = match &*n.op_type {
            "Identity" => true,
            // the optional mask output must be unused
            "Dropout" => {
                n.output.iter().skip(1).all(|o| o.is_empty() || graph.consumers(o).is_empty())
            }
            _ => false,
        };
        if passthrough && !n.input.is_empty() && !graph.is_graph_output(&n.output[0]) {
            let from = n.output[0].clone();
            let to = n.input[0].clone();
            graph.node.remove(ix);
            graph.rename_value(&from, &to);
            bypassed += 1;
            debug!("Bypassed {from} in eval mode");
        } else {
            ix += 1;
        }
    }
    bypassed
}
