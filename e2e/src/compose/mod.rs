//! End-to-end head: NMS and masks appended to the canonical outputs.
//!
//! Every composition exists twice. `End2End::forward` evaluates it on host
//! arrays and fixes the output shapes of the export. `End2End::emit` writes
//! the same computation as ONNX nodes.
use anyhow::{Context, ensure};
use ndarray::{Array2, Array3, Array4, Axis, s};

use crate::TractResult;
use crate::adapter::CanonicalOutputs;
use crate::config::{ExportConfig, RoiAlignType};
use tract_e2e_graph::pb::tensor_proto::DataType;

mod emit;
pub mod masks;
pub mod nms;

pub use emit::{ProtoInput, TRT_DOMAIN};

pub const PLUGIN_OUTPUTS: [&str; 5] =
    ["num_dets", "det_boxes", "det_scores", "det_classes", "det_masks"];
pub const PACKED_OUTPUT: &str = "output";
/// Leading columns of a packed row: batch index, box, class, score.
pub const PACKED_FIELDS: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmsBackend {
    /// `EfficientNMSX_TRT`, one tensor per field padded to `topk`.
    Plugin,
    /// ONNX `NonMaxSuppression`, packed rows.
    Onnx,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MaskHead {
    /// Coarse masks resized to the full input resolution.
    Upsample,
    /// Coarse masks cropped to their box at a fixed resolution.
    RoiAlign { resolution: usize, pooler_scale: f32, sampling_ratio: usize, kind: RoiAlignType },
}

#[derive(Clone, Debug, PartialEq)]
pub struct End2End {
    pub topk: usize,
    pub iou_thres: f32,
    pub score_thres: f32,
    pub nc: usize,
    pub max_wh: f32,
    pub backend: NmsBackend,
    pub mask_head: MaskHead,
    pub image_size: [usize; 2],
}

/// Evaluated end-to-end outputs.
#[derive(Clone, Debug, PartialEq)]
pub enum E2eOutputs {
    Plugin {
        num_dets: Array2<i32>,
        boxes: Array3<f32>,
        scores: Array2<f32>,
        classes: Array2<i32>,
        masks: Option<Array4<f32>>,
    },
    /// `(num_dets, 7 + mask_size)` rows.
    Packed(Array2<f32>),
}

/// Name, type and shape of a graph output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    pub elem_type: DataType,
    pub shape: Vec<usize>,
}

impl OutputSpec {
    fn new(name: &str, elem_type: DataType, shape: &[usize]) -> OutputSpec {
        OutputSpec { name: name.to_string(), elem_type, shape: shape.to_vec() }
    }
}

impl E2eOutputs {
    /// Output specs, float outputs being declared as `float_type`.
    pub fn specs(&self, float_type: DataType) -> Vec<OutputSpec> {
        match self {
            E2eOutputs::Plugin { num_dets, boxes, scores, classes, masks } => {
                let mut specs = vec![
                    OutputSpec::new(PLUGIN_OUTPUTS[0], DataType::Int32, num_dets.shape()),
                    OutputSpec::new(PLUGIN_OUTPUTS[1], float_type, boxes.shape()),
                    OutputSpec::new(PLUGIN_OUTPUTS[2], float_type, scores.shape()),
                    OutputSpec::new(PLUGIN_OUTPUTS[3], DataType::Int32, classes.shape()),
                ];
                if let Some(masks) = masks {
                    specs.push(OutputSpec::new(PLUGIN_OUTPUTS[4], float_type, masks.shape()));
                }
                specs
            }
            E2eOutputs::Packed(rows) => {
                vec![OutputSpec::new(PACKED_OUTPUT, float_type, rows.shape())]
            }
        }
    }
}

impl End2End {
    pub fn from_config(config: &ExportConfig, nc: usize, image_size: [usize; 2]) -> End2End {
        let mask_head = if config.roi_align {
            MaskHead::RoiAlign {
                resolution: config.mask_resolution,
                pooler_scale: config.pooler_scale,
                sampling_ratio: config.sampling_ratio.max(0) as usize,
                kind: config.roi_align_type,
            }
        } else {
            MaskHead::Upsample
        };
        End2End {
            topk: config.topk_all,
            iou_thres: config.iou_thres,
            score_thres: config.conf_thres,
            nc,
            max_wh: image_size[0].max(image_size[1]) as f32,
            backend: if config.trt { NmsBackend::Plugin } else { NmsBackend::Onnx },
            mask_head,
            image_size,
        }
    }

    pub fn output_names(&self, with_masks: bool) -> Vec<&'static str> {
        match self.backend {
            NmsBackend::Plugin if with_masks => PLUGIN_OUTPUTS.to_vec(),
            NmsBackend::Plugin => PLUGIN_OUTPUTS[..4].to_vec(),
            NmsBackend::Onnx => vec![PACKED_OUTPUT],
        }
    }

    /// Side of a mask as emitted, `(h, w)`.
    pub fn mask_size(&self) -> (usize, usize) {
        match self.mask_head {
            MaskHead::Upsample => (self.image_size[0], self.image_size[1]),
            MaskHead::RoiAlign { resolution, .. } => (resolution, resolution),
        }
    }

    /// Whether the class offset trick stays sub-pixel accurate for this
    /// image size and class count.
    pub fn offset_is_precise(&self) -> bool {
        nms::offset_is_precise(self.max_wh, self.nc, nms::OFFSET_TYPE)
    }

    /// Host evaluation of the composed head.
    pub fn forward(&self, canonical: &CanonicalOutputs) -> TractResult<E2eOutputs> {
        let preds = canonical.preds.view();
        let (n, a, c) = preds.dim();
        ensure!(
            c >= PACKED_FIELDS - 2 + self.nc,
            "Predictions have {c} channels for {} classes",
            self.nc
        );
        let nm = canonical.mask_dim();

        let centers = preds.slice(s![.., .., 0..4]).to_shape((n * a, 4))?.to_owned();
        let boxes = nms::to_corners(centers.view()).into_shape_with_order((n, a, 4))?;
        let scores = preds.slice(s![.., .., 5..5 + self.nc]);
        let dets = nms::batched_nms(
            boxes.view(),
            scores,
            self.iou_thres,
            self.score_thres,
            self.topk,
            self.max_wh,
        )?;

        let (mh, mw) = self.mask_size();
        let mask_of = |det: &nms::Detection| -> TractResult<Option<Array2<f32>>> {
            let Some(proto) = &canonical.proto else { return Ok(None) };
            let coeffs = preds.slice(s![det.batch, det.anchor, 5 + self.nc..]).insert_axis(Axis(0));
            let coarse = masks::coarse_masks(coeffs, proto.index_axis(Axis(0), det.batch))?;
            let coarse = coarse.index_axis(Axis(0), 0);
            let b = boxes.slice(s![det.batch, det.anchor, ..]);
            Ok(Some(match &self.mask_head {
                MaskHead::Upsample => masks::resize_bilinear(coarse, (mh, mw)),
                MaskHead::RoiAlign { resolution, pooler_scale, sampling_ratio, .. } => {
                    masks::roi_align(
                        coarse,
                        [b[0], b[1], b[2], b[3]],
                        *pooler_scale,
                        *resolution,
                        *sampling_ratio,
                    )
                }
            }))
        };

        match self.backend {
            NmsBackend::Onnx => {
                let mask_cols = if nm > 0 { mh * mw } else { 0 };
                let width = PACKED_FIELDS + mask_cols;
                let mut rows = vec![];
                for det in dets.iter().flatten() {
                    let b = boxes.slice(s![det.batch, det.anchor, ..]);
                    rows.extend([det.batch as f32, b[0], b[1], b[2], b[3]]);
                    rows.extend([det.class as f32, det.score]);
                    if let Some(mask) = mask_of(det)? {
                        rows.extend(mask.iter().copied());
                    }
                }
                let count = rows.len() / width;
                Ok(E2eOutputs::Packed(Array2::from_shape_vec((count, width), rows)?))
            }
            NmsBackend::Plugin => {
                let k = self.topk;
                let mut num_dets = Array2::<i32>::zeros((n, 1));
                let mut out_boxes = Array3::<f32>::zeros((n, k, 4));
                let mut out_scores = Array2::<f32>::zeros((n, k));
                let mut out_classes = Array2::<i32>::zeros((n, k));
                let mut out_masks = (nm > 0).then(|| Array4::<f32>::zeros((n, k, mh, mw)));
                for (batch, kept) in dets.iter().enumerate() {
                    num_dets[(batch, 0)] = kept.len() as i32;
                    for (slot, det) in kept.iter().enumerate() {
                        out_boxes
                            .slice_mut(s![batch, slot, ..])
                            .assign(&boxes.slice(s![det.batch, det.anchor, ..]));
                        out_scores[(batch, slot)] = det.score;
                        out_classes[(batch, slot)] = det.class as i32;
                        if let (Some(out), Some(mask)) = (out_masks.as_mut(), mask_of(det)?) {
                            out.slice_mut(s![batch, slot, .., ..]).assign(&mask);
                        }
                    }
                }
                Ok(E2eOutputs::Plugin {
                    num_dets,
                    boxes: out_boxes,
                    scores: out_scores,
                    classes: out_classes,
                    masks: out_masks,
                })
            }
        }
    }

    /// Check the prototype resolution against the configured pooler scale.
    pub fn check_pooler_scale(&self, proto_hw: [usize; 2]) {
        if let MaskHead::RoiAlign { pooler_scale, .. } = self.mask_head {
            let actual = proto_hw[0] as f32 / self.image_size[0] as f32;
            if (actual - pooler_scale).abs() > 1e-6 {
                let [h, w] = self.image_size;
                warn!(
                    "--pooler-scale is {pooler_scale}, prototypes are {}x{} for {h}x{w} ({actual})",
                    proto_hw[0], proto_hw[1]
                );
            }
        }
    }

    pub(crate) fn roi_params(&self) -> TractResult<(usize, f32, usize, RoiAlignType)> {
        match self.mask_head {
            MaskHead::RoiAlign { resolution, pooler_scale, sampling_ratio, kind } => {
                Ok((resolution, pooler_scale, sampling_ratio, kind))
            }
            MaskHead::Upsample => None.context("Not a roi align head"),
        }
    }
}
