//! Turn a raw detection checkpoint into a graph with the canonical output
//! contract: `output (N, A, 4 + 1 + nc + nm)` and, for segmentation models,
//! `proto (N, nm, Hp, Wp)`.
use std::path::Path;

use anyhow::{Context, bail, ensure, format_err};
use ndarray::{Array3, Array4, ArrayD, Ix3, Ix4};

use crate::TractResult;
use crate::metadata::{Metadata, Names};
use tract_e2e_graph::passes;
use tract_e2e_graph::prelude::*;
use tract_e2e_graph::runtime;

pub const INPUT_NAME: &str = "images";
pub const OUTPUT_NAME: &str = "output";
pub const PROTO_NAME: &str = "proto";

/// Layout of the raw detection head output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadFamily {
    /// `(N, 4 + nc + nm, A)`, boxes in input pixels.
    Detect,
    /// `(N, A, 4 + nc)`, boxes normalized to the input size.
    RtDetrDecoder,
}

/// How a `Split` node is exported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SplitStrategy {
    /// One `Slice` per output, for the given static sizes.
    Slices(Vec<i64>),
    /// Left untouched.
    Native,
}

/// What a node or graph output is to the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    DetectionHead(HeadFamily),
    PrototypeHead,
    AuxiliaryOutput,
    SplitComputation(SplitStrategy),
    TrainingOnly,
}

/// A capability, attached to the value it was resolved for: the first
/// output of a node, or a graph output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tagged {
    pub value: String,
    pub capability: Capability,
}

/// Flags set on the detection head for export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadFlags {
    /// Full dynamic axes requested. The exporter reads it and rejects the
    /// export.
    pub dynamic: bool,
    /// Drop auxiliary training outputs. Without it they are kept after the
    /// canonical outputs.
    pub export: bool,
    /// Target format, recorded in the producer name.
    pub format: String,
}

impl Default for HeadFlags {
    fn default() -> HeadFlags {
        HeadFlags { dynamic: false, export: true, format: "onnx".to_string() }
    }
}

/// Dry run results, in canonical layout.
#[derive(Clone, Debug, new)]
pub struct CanonicalOutputs {
    pub preds: Array3<f32>,
    pub proto: Option<Array4<f32>>,
}

impl CanonicalOutputs {
    pub fn mask_dim(&self) -> usize {
        self.proto.as_ref().map(|p| p.shape()[1]).unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct ModelAdapter {
    model: ModelProto,
    metadata: Metadata,
    nc: usize,
    family: HeadFamily,
    has_proto: bool,
    flags: HeadFlags,
    tags: Vec<Tagged>,
}

impl ModelAdapter {
    pub fn load(path: impl AsRef<Path>, nc: usize, flags: HeadFlags) -> TractResult<ModelAdapter> {
        let path = path.as_ref();
        let model = ModelProto::for_path(path)?;
        ModelAdapter::from_proto(model, nc, flags).with_context(|| format!("Adapting {path:?}"))
    }

    pub fn from_proto(
        mut model: ModelProto,
        nc: usize,
        flags: HeadFlags,
    ) -> TractResult<ModelAdapter> {
        let metadata = Metadata::from_model(&model, nc)?;
        let graph = model.graph_mut()?;
        ensure!(!graph.output.is_empty(), "Checkpoint graph has no output");
        graph.value_info.clear();

        let tags = resolve_capabilities(graph, nc);
        let family = tags
            .iter()
            .find_map(|t| match t.capability {
                Capability::DetectionHead(f) => Some(f),
                _ => None,
            })
            .context("No detection head found")?;
        let has_proto = tags.iter().any(|t| t.capability == Capability::PrototypeHead);

        apply_split_strategies(graph, &tags);
        let bypassed = passes::to_eval_mode(graph);
        let fused = passes::fuse_conv_bn(graph)?;
        debug!("Eval mode bypassed {bypassed} nodes, fused {fused} batch normalizations");

        if flags.export {
            let aux: Vec<&str> = tags
                .iter()
                .filter(|t| t.capability == Capability::AuxiliaryOutput)
                .map(|t| &*t.value)
                .collect();
            if !aux.is_empty() {
                debug!("Pruning auxiliary outputs {aux:?}");
            }
            graph.output.retain(|o| !aux.contains(&&*o.name));
        }

        let mut adapter = ModelAdapter { model, metadata, nc, family, has_proto, flags, tags };
        adapter.emit_canonical_head()?;
        Ok(adapter)
    }

    pub fn stride(&self) -> usize {
        self.metadata.stride
    }

    pub fn names(&self) -> &Names {
        &self.metadata.names
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn nc(&self) -> usize {
        self.nc
    }

    pub fn family(&self) -> HeadFamily {
        self.family
    }

    pub fn has_proto(&self) -> bool {
        self.has_proto
    }

    pub fn flags(&self) -> &HeadFlags {
        &self.flags
    }

    pub fn capabilities(&self) -> &[Tagged] {
        &self.tags
    }

    pub fn model(&self) -> &ModelProto {
        &self.model
    }

    pub fn into_model(self) -> ModelProto {
        self.model
    }

    /// Default domain opset of the checkpoint.
    pub fn opset(&self) -> Option<i64> {
        self.model.opset_version("").or_else(|| self.model.opset_version("ai.onnx"))
    }

    /// Static `(h, w)` the checkpoint declares for its input, if any.
    pub fn declared_image_size(&self) -> Option<[usize; 2]> {
        let input = self.model.graph().ok()?.input.iter().find(|i| i.name == INPUT_NAME)?;
        match input.dims()?.as_slice() {
            [_, _, Dim::Value(h), Dim::Value(w)] if *h > 0 && *w > 0 => {
                Some([*h as usize, *w as usize])
            }
            _ => None,
        }
    }

    pub fn forward(&self, images: &ArrayD<f32>) -> TractResult<CanonicalOutputs> {
        let data: Vec<f32> = images.iter().copied().collect();
        self.run(images.shape(), &data, 1)
    }

    /// Run `runs` times on a zero batch of `shape`.
    pub fn warm_up(&self, shape: [usize; 4], runs: usize) -> TractResult<CanonicalOutputs> {
        let data = vec![0f32; shape.iter().product()];
        self.run(&shape, &data, runs)
    }

    fn run(&self, shape: &[usize], data: &[f32], runs: usize) -> TractResult<CanonicalOutputs> {
        ensure!(shape.len() == 4 && shape[1] == 3, "Expected a (N, 3, H, W) batch, got {shape:?}");
        let mut outputs = runtime::run_f32(&self.model, shape, data, runs)?.into_iter();
        let preds = outputs
            .next()
            .context("Model produced no output")?
            .into_dimensionality::<Ix3>()
            .map_err(|e| format_err!("Canonical predictions must have rank 3: {e}"))?;
        let proto = if self.has_proto {
            let proto = outputs.next().context("Model produced no prototype output")?;
            Some(
                proto
                    .into_dimensionality::<Ix4>()
                    .map_err(|e| format_err!("Prototypes must have rank 4: {e}"))?,
            )
        } else {
            None
        };
        let canonical = CanonicalOutputs::new(preds, proto);
        let expected = 5 + self.nc + canonical.mask_dim();
        ensure!(
            canonical.preds.shape()[2] == expected,
            "Model outputs {} channels per anchor, expected 4 + 1 + {} classes + {} coefficients",
            canonical.preds.shape()[2],
            self.nc,
            canonical.mask_dim()
        );
        Ok(canonical)
    }

    /// Convert weights and interface to half precision.
    pub fn to_half(&mut self) -> TractResult<()> {
        passes::to_half(self.model.graph_mut()?)
    }

    fn emit_canonical_head(&mut self) -> TractResult<()> {
        let nc = self.nc as i64;
        let (family, has_proto) = (self.family, self.has_proto);
        let opset = self.opset().unwrap_or(crate::config::DEFAULT_OPSET);
        let auxiliary: Vec<String> = if self.flags.export {
            vec![]
        } else {
            self.tags
                .iter()
                .filter(|t| t.capability == Capability::AuxiliaryOutput)
                .map(|t| t.value.clone())
                .collect()
        };
        let graph = self.model.graph_mut()?;
        let kept: Vec<ValueInfoProto> =
            graph.output.iter().filter(|o| auxiliary.contains(&o.name)).cloned().collect();

        for reserved in [INPUT_NAME, OUTPUT_NAME, PROTO_NAME] {
            let is_interface = graph.input.first().is_some_and(|i| i.name == reserved);
            if graph.defines(reserved) && !(reserved == INPUT_NAME && is_interface) {
                graph.rename_everywhere(reserved, &format!("{reserved}_raw"));
            }
        }
        let initializers: Vec<String> = graph.initializer.iter().map(|i| i.name.clone()).collect();
        let inputs: Vec<String> = graph
            .input
            .iter()
            .filter(|i| !initializers.contains(&i.name))
            .map(|i| i.name.clone())
            .collect();
        let [input] = inputs.as_slice() else {
            bail!("Expected a single image input, found {inputs:?}");
        };
        if input != INPUT_NAME {
            graph.rename_everywhere(input, INPUT_NAME);
        }

        let raw = graph.output[0].name.clone();
        let raw_proto = if has_proto { Some(graph.output[1].name.clone()) } else { None };

        let mut b = GraphBuilder::new(graph, "/adapter", opset);
        let anchors_last = match family {
            HeadFamily::Detect => b.transpose(&raw, &[0, 2, 1]),
            HeadFamily::RtDetrDecoder => raw.clone(),
        };
        let mut boxes = b.slice(&anchors_last, 2, 0, 4);
        if family == HeadFamily::RtDetrDecoder {
            let h = b.dim(INPUT_NAME, 2);
            let w = b.dim(INPUT_NAME, 3);
            let whwh = b.concat(&[&w, &h, &w, &h], 0);
            let whwh = b.cast(&whwh, DataType::Float);
            boxes = b.binary("Mul", &boxes, &whwh);
        }
        let classes = b.slice(&anchors_last, 2, 4, 4 + nc);

        let shape = b.unary("Shape", &boxes);
        let leading = b.slice(&shape, 0, 0, 2);
        let one = b.const_ints("one", &[1]);
        let ones_shape = b.concat(&[&leading, &one], 0);
        let objectness = b.constant_of_shape(&ones_shape, 1.0);

        let mut fields = vec![boxes, objectness, classes];
        if has_proto {
            fields.push(b.slice(&anchors_last, 2, 4 + nc, i64::MAX));
        }
        let fields: Vec<&str> = fields.iter().map(|s| &**s).collect();
        let output = b.concat(&fields, 2);
        b.publish(&output, OUTPUT_NAME);

        let mut outputs = vec![value_info_unshaped(OUTPUT_NAME)];
        if let Some(raw_proto) = raw_proto {
            graph.rename_everywhere(&raw_proto, PROTO_NAME);
            outputs.push(value_info_unshaped(PROTO_NAME));
        }
        outputs.extend(kept);
        graph.output = outputs;
        Ok(())
    }
}

fn value_info_unshaped(name: &str) -> ValueInfoProto {
    let mut v = value_info(name, DataType::Float, &[]);
    if let Some(t) = v.tensor_type_mut() {
        t.shape = None;
    }
    v
}

/// Tag the checkpoint once: graph outputs by role, nodes by the way they
/// must be exported.
pub fn resolve_capabilities(graph: &GraphProto, nc: usize) -> Vec<Tagged> {
    let mut tags = vec![];
    let mut has_proto = false;
    for (ix, output) in graph.output.iter().enumerate() {
        let rank = output.dims().map(|d| d.len());
        let capability = match ix {
            1 if rank.is_none_or(|r| r == 4) => {
                has_proto = true;
                Capability::PrototypeHead
            }
            0 => continue,
            _ => Capability::AuxiliaryOutput,
        };
        tags.push(Tagged { value: output.name.clone(), capability });
    }
    if let Some(head) = graph.output.first() {
        let capability = Capability::DetectionHead(head_family(head, nc, has_proto));
        tags.insert(0, Tagged { value: head.name.clone(), capability });
    }

    for n in &graph.node {
        let Some(value) = n.output.first() else { continue };
        let capability = match &*n.op_type {
            "Split" => {
                let strategy = match passes::static_split_sizes(graph, n) {
                    Some(sizes) if sizes.len() == n.output.len() => SplitStrategy::Slices(sizes),
                    _ => {
                        debug!("Keeping {n} native, split sizes are not static");
                        SplitStrategy::Native
                    }
                };
                Capability::SplitComputation(strategy)
            }
            "Dropout" | "Identity" => Capability::TrainingOnly,
            _ => continue,
        };
        tags.push(Tagged { value: value.clone(), capability });
    }
    tags
}

/// The axis holding `4 + nc` channels tells the layout apart. Anchor counts
/// of small inputs can be below the channel count, so axis sizes are only
/// compared when neither matches.
fn head_family(raw: &ValueInfoProto, nc: usize, has_proto: bool) -> HeadFamily {
    if has_proto {
        return HeadFamily::Detect;
    }
    let channels = 4 + nc as i64;
    match raw.dims().as_deref() {
        Some([_, Dim::Value(c), Dim::Value(a)]) if *c == channels && *a != channels => {
            HeadFamily::Detect
        }
        Some([_, Dim::Value(a), Dim::Value(c)]) if *c == channels && *a != channels => {
            HeadFamily::RtDetrDecoder
        }
        Some([_, Dim::Value(a), Dim::Value(b)]) => {
            warn!(
                "Output {} is ({a}, {b}), no axis of 4 + {nc} channels, larger one is anchors",
                raw.name
            );
            if a > b { HeadFamily::RtDetrDecoder } else { HeadFamily::Detect }
        }
        _ => {
            warn!("Output {} has no static shape, assuming a channels first Detect head", raw.name);
            HeadFamily::Detect
        }
    }
}

fn apply_split_strategies(graph: &mut GraphProto, tags: &[Tagged]) {
    for tag in tags {
        let Capability::SplitComputation(SplitStrategy::Slices(sizes)) = &tag.capability else {
            continue;
        };
        let ix = graph
            .node
            .iter()
            .position(|n| n.op_type == "Split" && n.output.first() == Some(&tag.value));
        if let Some(ix) = ix {
            passes::split_as_slices(graph, ix, sizes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(d: &[usize]) -> Vec<Dim> {
        d.iter().map(|&d| d.into()).collect()
    }

    fn checkpoint(outputs: Vec<ValueInfoProto>) -> GraphProto {
        let mut g = graph("g")
            .input(value_info("x", DataType::Float, &[1usize.into(), 3usize.into()]))
            .initializer(tensor_i64("sizes", &[2], &[2, 1]))
            .node(
                node("Split")
                    .name("split")
                    .input("x")
                    .input("sizes")
                    .attr("axis", 1i64)
                    .output("a")
                    .output("b"),
            )
            .node(node("Dropout").name("drop").input("a").output("a_d"));
        g.output = outputs;
        g
    }

    #[test]
    fn capabilities_are_resolved_once() {
        let g = checkpoint(vec![
            value_info("output0", DataType::Float, &dims(&[1, 116, 8400])),
            value_info("output1", DataType::Float, &dims(&[1, 32, 160, 160])),
            value_info("aux", DataType::Float, &dims(&[1, 2])),
        ]);
        let tags = resolve_capabilities(&g, 80);
        let caps: Vec<&Capability> = tags.iter().map(|t| &t.capability).collect();
        assert_eq!(
            caps,
            vec![
                &Capability::DetectionHead(HeadFamily::Detect),
                &Capability::PrototypeHead,
                &Capability::AuxiliaryOutput,
                &Capability::SplitComputation(SplitStrategy::Slices(vec![2, 1])),
                &Capability::TrainingOnly,
            ]
        );
    }

    #[test]
    fn rt_detr_is_anchor_first() {
        let g = checkpoint(vec![value_info("output0", DataType::Float, &dims(&[1, 300, 84]))]);
        assert_eq!(
            resolve_capabilities(&g, 80)[0].capability,
            Capability::DetectionHead(HeadFamily::RtDetrDecoder)
        );
    }

    #[test]
    fn small_detect_heads_stay_channels_first() {
        // 64x64 input: 84 anchors for 4 + 90 channels
        let g = checkpoint(vec![value_info("output0", DataType::Float, &dims(&[1, 94, 84]))]);
        assert_eq!(
            resolve_capabilities(&g, 90)[0].capability,
            Capability::DetectionHead(HeadFamily::Detect)
        );
        let g = checkpoint(vec![value_info("output0", DataType::Float, &dims(&[1, 84, 94]))]);
        assert_eq!(
            resolve_capabilities(&g, 90)[0].capability,
            Capability::DetectionHead(HeadFamily::RtDetrDecoder)
        );
    }

    #[test]
    fn dynamic_split_stays_native() {
        let g = graph("g")
            .node(node("Split").name("s").input("x").input("sizes").output("a").output("b"))
            .output(value_info("a", DataType::Float, &["n".into(), 8usize.into(), 2usize.into()]));
        let tags = resolve_capabilities(&g, 80);
        assert!(tags.contains(&Tagged {
            value: "a".into(),
            capability: Capability::SplitComputation(SplitStrategy::Native)
        }));
    }
}
