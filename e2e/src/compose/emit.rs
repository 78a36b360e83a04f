use anyhow::ensure;

use super::nms::{CONVERT_MATRIX, OFFSET_TYPE};
use super::{End2End, MaskHead, NmsBackend, PACKED_OUTPUT, PLUGIN_OUTPUTS};
use crate::TractResult;
use crate::config::RoiAlignType;
use tract_e2e_graph::prelude::*;

pub const TRT_DOMAIN: &str = "TRT";

/// Prototype tensor feeding the mask branch.
#[derive(Clone, Copy, Debug)]
pub struct ProtoInput<'a> {
    pub name: &'a str,
    pub channels: usize,
    pub hw: [usize; 2],
}

/// Per anchor values shared by both backends.
struct Decoded {
    boxes: String,
    best: String,
    class_id: String,
    class_f: String,
    nms_boxes: String,
    coeffs: Option<String>,
}

impl End2End {
    /// Append the head after the canonical `preds`, returning the names of
    /// the new graph outputs.
    pub fn emit(
        &self,
        b: &mut GraphBuilder,
        preds: &str,
        proto: Option<ProtoInput>,
    ) -> TractResult<Vec<String>> {
        ensure!(b.opset >= 11, "End-to-end export needs opset 11 or later, got {}", b.opset);
        let decoded = self.emit_decode(b, preds, proto.is_some());
        match self.backend {
            NmsBackend::Plugin => self.emit_plugin(b, preds, &decoded, proto),
            NmsBackend::Onnx => self.emit_generic(b, preds, &decoded, proto),
        }
    }

    fn emit_decode(&self, b: &mut GraphBuilder, preds: &str, with_masks: bool) -> Decoded {
        let nc = self.nc as i64;
        let ft = b.float_type;
        let centers = b.slice(preds, 2, 0, 4);
        let convert: Vec<f32> = CONVERT_MATRIX.iter().flatten().copied().collect();
        let convert = b.const_float("convert_matrix", &[4, 4], &convert);
        let boxes = b.binary("MatMul", &centers, &convert);

        let scores = b.slice(preds, 2, 5, 5 + nc);
        let best = b.reduce_max(&scores, &[2], true);
        let class_id = b.arg_max(&scores, 2, true);
        let class_f = b.cast(&class_id, ft);

        // f16 can not hold max_wh * nc offsets at pixel precision.
        let (boxes_o, class_o) = if ft == OFFSET_TYPE {
            (boxes.clone(), class_f.clone())
        } else {
            (b.cast(&boxes, OFFSET_TYPE), b.cast(&class_id, OFFSET_TYPE))
        };
        let max_wh = b.const_f32("max_wh", &[1], &[self.max_wh]);
        let offset = b.binary("Mul", &class_o, &max_wh);
        let nms_boxes = b.binary("Add", &boxes_o, &offset);

        let coeffs = with_masks.then(|| b.slice(preds, 2, 5 + nc, i64::MAX));
        Decoded { boxes, best, class_id, class_f, nms_boxes, coeffs }
    }

    fn emit_plugin(
        &self,
        b: &mut GraphBuilder,
        preds: &str,
        d: &Decoded,
        proto: Option<ProtoInput>,
    ) -> TractResult<Vec<String>> {
        let ft = b.float_type;
        let k = self.topk as i64;
        let scores = to_offset_type(b, &d.best);
        let nms = b.wire(
            node("EfficientNMSX_TRT")
                .domain(TRT_DOMAIN)
                .input(&d.nms_boxes)
                .input(&scores)
                .attr("background_class", -1i64)
                .attr("box_coding", 0i64)
                .attr("iou_threshold", self.iou_thres)
                .attr("max_output_boxes", k)
                .attr("plugin_version", "1")
                .attr("score_activation", 0i64)
                .attr("score_threshold", self.score_thres),
            5,
        );
        let (num_dets, det_indices) = (&nms[0], &nms[4]);
        let det_scores = if ft == OFFSET_TYPE { nms[2].clone() } else { b.cast(&nms[2], ft) };

        // Indices of kept anchors in the flattened (N * A) anchor list.
        let idx = b.cast(det_indices, DataType::Int64);
        let zero = b.const_i64("zero", &[], &[0]);
        let padding = b.binary("Less", &idx, &zero);
        let idx = b.op(node("Where").input(&padding).input(&zero).input(&idx));
        let n = b.dim(preds, 0);
        let n = b.squeeze(&n, &[0]);
        let anchors = b.dim(preds, 1);
        let batches = b.range(&n);
        let base = b.binary("Mul", &batches, &anchors);
        let base = b.unsqueeze(&base, &[1]);
        let flat = b.binary("Add", &idx, &base);

        let boxes_flat = b.reshape(&d.boxes, &[-1, 4]);
        let det_boxes = b.gather(&boxes_flat, &flat, 0);
        let class_flat = b.reshape(&d.class_id, &[-1]);
        let det_classes = b.gather(&class_flat, &flat, 0);

        // Rows past num_dets are zeroed.
        let slots: Vec<i64> = (0..k).collect();
        let slots = b.const_i64("slots", &[1, self.topk], &slots);
        let count = b.cast(num_dets, DataType::Int64);
        let valid = b.binary("Less", &slots, &count);
        let valid_f = b.cast(&valid, ft);
        let valid_i = b.cast(&valid, DataType::Int64);
        let valid_boxes = b.unsqueeze(&valid_f, &[2]);
        let det_boxes_masked = b.binary("Mul", &det_boxes, &valid_boxes);
        let det_classes = b.binary("Mul", &det_classes, &valid_i);
        let det_classes = b.cast(&det_classes, DataType::Int32);

        let det_masks = match (&d.coeffs, proto) {
            (Some(coeffs), Some(proto)) => {
                let nm = proto.channels as i64;
                let [hp, wp] = proto.hw.map(|x| x as i64);
                let coeffs_flat = b.reshape(coeffs, &[-1, nm]);
                let det_coeffs = b.gather(&coeffs_flat, &flat, 0);
                let proto_flat = b.reshape(proto.name, &[0, nm, hp * wp]);
                let masks = b.binary("MatMul", &det_coeffs, &proto_flat);
                let masks = b.unary("Sigmoid", &masks);
                let masks = match &self.mask_head {
                    MaskHead::Upsample => {
                        let masks = b.reshape(&masks, &[0, k, hp, wp]);
                        let [h, w] = self.image_size.map(|x| x as f32);
                        b.resize_bilinear_scales(&masks, &[1.0, 1.0, h / hp as f32, w / wp as f32])
                    }
                    MaskHead::RoiAlign { resolution, .. } => {
                        let r = *resolution as i64;
                        let masks = b.reshape(&masks, &[-1, 1, hp, wp]);
                        let rois = b.reshape(&det_boxes, &[-1, 4]);
                        let rows = b.dim(&masks, 0);
                        let rows = b.squeeze(&rows, &[0]);
                        let indices = b.range(&rows);
                        let pooled = self.emit_roi_align(b, &masks, &rois, &indices)?;
                        b.reshape(&pooled, &[-1, k, r, r])
                    }
                };
                let valid_masks = b.unsqueeze(&valid_f, &[2, 3]);
                Some(b.binary("Mul", &masks, &valid_masks))
            }
            _ => None,
        };

        let mut outputs = vec![
            b.publish(num_dets, PLUGIN_OUTPUTS[0]),
            b.publish(&det_boxes_masked, PLUGIN_OUTPUTS[1]),
            b.publish(&det_scores, PLUGIN_OUTPUTS[2]),
            b.publish(&det_classes, PLUGIN_OUTPUTS[3]),
        ];
        if let Some(masks) = det_masks {
            outputs.push(b.publish(&masks, PLUGIN_OUTPUTS[4]));
        }
        Ok(outputs)
    }

    fn emit_generic(
        &self,
        b: &mut GraphBuilder,
        preds: &str,
        d: &Decoded,
        proto: Option<ProtoInput>,
    ) -> TractResult<Vec<String>> {
        let ft = b.float_type;
        let nms_scores = b.transpose(&d.best, &[0, 2, 1]);
        let nms_scores = to_offset_type(b, &nms_scores);
        let max_out = b.const_ints("max_output_boxes_per_class", &[self.topk as i64]);
        let iou = b.const_f32("iou_threshold", &[1], &[self.iou_thres]);
        let score = b.const_f32("score_threshold", &[1], &[self.score_thres]);
        let selected = b.op(
            node("NonMaxSuppression")
                .input(&d.nms_boxes)
                .input(&nms_scores)
                .input(&max_out)
                .input(&iou)
                .input(&score)
                .attr("center_point_box", 0i64),
        );

        let batch_col = b.const_i64("batch_column", &[], &[0]);
        let batch_ix = b.gather(&selected, &batch_col, 1);
        let anchor_col = b.const_i64("anchor_column", &[], &[2]);
        let anchor_ix = b.gather(&selected, &anchor_col, 1);
        let anchors = b.dim(preds, 1);
        let base = b.binary("Mul", &batch_ix, &anchors);
        let flat = b.binary("Add", &base, &anchor_ix);

        let boxes_flat = b.reshape(&d.boxes, &[-1, 4]);
        let det_boxes = b.gather(&boxes_flat, &flat, 0);
        let best_flat = b.reshape(&d.best, &[-1, 1]);
        let det_scores = b.gather(&best_flat, &flat, 0);
        let class_flat = b.reshape(&d.class_f, &[-1, 1]);
        let det_classes = b.gather(&class_flat, &flat, 0);
        let batch_f = b.unsqueeze(&batch_ix, &[1]);
        let batch_f = b.cast(&batch_f, ft);

        let mut fields = vec![batch_f, det_boxes.clone(), det_classes, det_scores];
        if let (Some(coeffs), Some(proto)) = (&d.coeffs, proto) {
            let nm = proto.channels as i64;
            let [hp, wp] = proto.hw.map(|x| x as i64);
            let coeffs_flat = b.reshape(coeffs, &[-1, nm]);
            let det_coeffs = b.gather(&coeffs_flat, &flat, 0);
            let det_coeffs = b.unsqueeze(&det_coeffs, &[1]);
            let protos = b.gather(proto.name, &batch_ix, 0);
            let protos = b.reshape(&protos, &[0, nm, hp * wp]);
            let masks = b.binary("MatMul", &det_coeffs, &protos);
            let masks = b.unary("Sigmoid", &masks);
            let masks = b.reshape(&masks, &[0, 1, hp, wp]);
            let masks = match &self.mask_head {
                MaskHead::Upsample => {
                    let [h, w] = self.image_size.map(|x| x as f32);
                    let scales = [1.0, 1.0, h / hp as f32, w / wp as f32];
                    let up = b.resize_bilinear_scales(&masks, &scales);
                    b.reshape(&up, &[0, (self.image_size[0] * self.image_size[1]) as i64])
                }
                MaskHead::RoiAlign { resolution, .. } => {
                    let rows = b.dim(&masks, 0);
                    let rows = b.squeeze(&rows, &[0]);
                    let indices = b.range(&rows);
                    let pooled = self.emit_roi_align(b, &masks, &det_boxes, &indices)?;
                    b.reshape(&pooled, &[0, (resolution * resolution) as i64])
                }
            };
            fields.push(masks);
        }
        let fields: Vec<&str> = fields.iter().map(|s| &**s).collect();
        let output = b.concat(&fields, 1);
        Ok(vec![b.publish(&output, PACKED_OUTPUT)])
    }

    /// One pooled mask per roi. `indices` picks the mask of each roi.
    fn emit_roi_align(
        &self,
        b: &mut GraphBuilder,
        masks: &str,
        rois: &str,
        indices: &str,
    ) -> TractResult<String> {
        let (resolution, pooler_scale, sampling_ratio, kind) = self.roi_params()?;
        let ft = b.float_type;
        let mut n = match kind {
            RoiAlignType::Onnx | RoiAlignType::DynamicTrt => {
                node(kind.op_type()).input(masks).input(rois).input(indices)
            }
            RoiAlignType::Dynamic2Trt => {
                let ix = b.cast(indices, ft);
                let ix = b.unsqueeze(&ix, &[1]);
                let rois = b.concat(&[&ix, rois], 1);
                node(kind.op_type()).input(masks).input(rois)
            }
        };
        n = n
            .attr("output_height", resolution as i64)
            .attr("output_width", resolution as i64)
            .attr("spatial_scale", pooler_scale)
            .attr("sampling_ratio", sampling_ratio as i64)
            .attr("mode", "avg");
        if kind.is_plugin() {
            n = n.domain(TRT_DOMAIN);
        } else if b.opset >= 16 {
            n = n.attr("coordinate_transformation_mode", "output_half_pixel");
        }
        Ok(b.op(n))
    }
}

fn to_offset_type(b: &mut GraphBuilder, x: &str) -> String {
    if b.float_type == OFFSET_TYPE { x.to_string() } else { b.cast(x, OFFSET_TYPE) }
}
