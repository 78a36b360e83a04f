#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tract_e2e::config::ExportConfig;
use tract_e2e_graph::prelude::*;

pub fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("TRACT_LOG").is_test(true).try_init();
}

/// A tiny Detect-style checkpoint: one strided convolution flattened to
/// `output0 (N, 4 + nc + nm, A)`, and for segmentation a second one for
/// `output1 (N, nm, H / 4, W / 4)`.
///
/// Weights are zero, so on a zero batch every anchor predicts the biases:
/// the same box, `class_score` for class 0 and -1 for the other classes.
///
/// A `wired` head reads its anchors from the image instead, see
/// [`Checkpoint::image`]. An `anchors_first` head outputs
/// `(N, A, 4 + nc)` with boxes normalized to the input size.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub nc: usize,
    pub nm: usize,
    pub stride: usize,
    pub imgsz: [usize; 2],
    pub class_score: f32,
    pub wired: bool,
    pub anchors_first: bool,
}

/// One anchor of a wired head: its center and its class scores.
#[derive(Clone, Debug)]
pub struct Anchor {
    pub batch: usize,
    pub anchor: usize,
    pub center: [f32; 2],
    pub scores: Vec<f32>,
}

impl Checkpoint {
    pub fn detect(nc: usize) -> Checkpoint {
        Checkpoint {
            nc,
            nm: 0,
            stride: 32,
            imgsz: [64, 64],
            class_score: 0.9,
            wired: false,
            anchors_first: false,
        }
    }

    pub fn segment(nc: usize, nm: usize) -> Checkpoint {
        Checkpoint { nm, ..Checkpoint::detect(nc) }
    }

    /// 16x16 boxes whose centers and class scores are pixels of the image.
    pub fn wired(nc: usize, nm: usize) -> Checkpoint {
        Checkpoint { stride: 8, wired: true, ..Checkpoint::segment(nc, nm) }
    }

    pub fn rt_detr(nc: usize) -> Checkpoint {
        Checkpoint { stride: 8, anchors_first: true, ..Checkpoint::detect(nc) }
    }

    pub fn anchors(&self) -> usize {
        (self.imgsz[0] / self.stride) * (self.imgsz[1] / self.stride)
    }

    /// A `(batch, 3, H, W)` image for a wired head. Anchor `i * W / s + j`
    /// reads its center from pixel `(i * s, j * s)` of channels 0 and 1,
    /// and the score of class `k` from pixel `(i * s, j * s + k)` of
    /// channel 2. Other anchors score 0.
    pub fn image(&self, batch: usize, anchors: &[Anchor]) -> Vec<f32> {
        assert!(self.wired && self.stride > self.nc);
        let [h, w] = self.imgsz;
        let s = self.stride;
        let mut data = vec![0f32; batch * 3 * h * w];
        for a in anchors {
            let (i, j) = (a.anchor / (w / s), a.anchor % (w / s));
            let at = |c: usize, dx: usize| ((a.batch * 3 + c) * h + i * s) * w + j * s + dx;
            data[at(0, 0)] = a.center[0];
            data[at(1, 0)] = a.center[1];
            for (k, score) in a.scores.iter().enumerate() {
                data[at(2, k)] = *score;
            }
        }
        data
    }

    fn weights(&self) -> Vec<f32> {
        let (c, s) = (self.channels(), self.stride);
        let mut weights = vec![0.0; c * 3 * s * s];
        if self.wired {
            let at = |out: usize, input: usize, dx: usize| ((out * 3 + input) * s) * s + dx;
            weights[at(0, 0, 0)] = 1.0;
            weights[at(1, 1, 0)] = 1.0;
            for k in 0..self.nc {
                weights[at(4 + k, 2, k)] = 1.0;
            }
        }
        weights
    }

    fn biases(&self) -> Vec<f32> {
        let mut bias = if self.wired {
            vec![0.0, 0.0, 16.0, 16.0]
        } else if self.anchors_first {
            vec![0.5, 0.25, 0.25, 0.125]
        } else {
            vec![32.0, 32.0, 16.0, 16.0]
        };
        let class_bias = |i| match (self.wired, i) {
            (true, _) => 0.0,
            (false, 0) => self.class_score,
            _ => -1.0,
        };
        bias.extend((0..self.nc).map(class_bias));
        bias.extend(std::iter::repeat_n(0.1, self.nm));
        bias
    }

    pub fn channels(&self) -> usize {
        4 + self.nc + self.nm
    }

    pub fn model(&self) -> ModelProto {
        let [h, w] = self.imgsz;
        let (c, s) = (self.channels(), self.stride);
        let input: [Dim; 4] = [1usize.into(), 3usize.into(), h.into(), w.into()];
        let mut g = graph("checkpoint")
            .input(value_info("x", DataType::Float, &input))
            .initializer(tensor_f32("head.weight", &[c, 3, s, s], &self.weights()))
            .initializer(tensor_f32("head.bias", &[c], &self.biases()))
            .initializer(tensor_i64("head.shape", &[3], &[0, c as i64, -1]))
            .node(
                node("Conv")
                    .name("/head/conv")
                    .input("x")
                    .input("head.weight")
                    .input("head.bias")
                    .attr("kernel_shape", vec![s as i64, s as i64])
                    .attr("strides", vec![s as i64, s as i64])
                    .output("/head/conv_out"),
            )
            .node(
                node("Reshape")
                    .name("/head/flatten")
                    .input("/head/conv_out")
                    .input("head.shape")
                    .output("/head/flat"),
            );
        if self.anchors_first {
            let dims: [Dim; 3] = ["batch".into(), self.anchors().into(), c.into()];
            g = g
                .node(
                    node("Transpose")
                        .name("/head/transpose")
                        .input("/head/flat")
                        .attr("perm", vec![0i64, 2, 1])
                        .output("output0"),
                )
                .output(value_info("output0", DataType::Float, &dims));
        } else {
            g.rename_everywhere("/head/flat", "output0");
            g = g.output(value_info(
                "output0",
                DataType::Float,
                &["batch".into(), c.into(), "anchors".into()],
            ));
        }
        if self.nm > 0 {
            let nm = self.nm;
            g = g
                .initializer(tensor_f32("proto.weight", &[nm, 3, 4, 4], &vec![0.0; nm * 3 * 16]))
                .initializer(tensor_f32("proto.bias", &[nm], &vec![0.5; nm]))
                .node(
                    node("Conv")
                        .name("/proto/conv")
                        .input("x")
                        .input("proto.weight")
                        .input("proto.bias")
                        .attr("kernel_shape", vec![4i64, 4])
                        .attr("strides", vec![4i64, 4])
                        .output("output1"),
                )
                .output(value_info(
                    "output1",
                    DataType::Float,
                    &["batch".into(), nm.into(), (h / 4).into(), (w / 4).into()],
                ));
        }

        let mut m = model();
        m.ir_version = 7;
        m.producer_name = "synthetic".to_string();
        m.opset_import.push(OperatorSetIdProto { domain: String::new(), version: 12 });
        m.graph = Some(g);
        m.set_metadata("stride", self.stride);
        let names =
            (0..self.nc).map(|i| format!("{i}: 'class{i}'")).collect::<Vec<_>>().join(", ");
        m.set_metadata("names", format!("{{{names}}}"));
        m
    }

    pub fn save(&self, dir: &Path) -> PathBuf {
        let stem = match (self.wired, self.nm > 0) {
            (true, _) => "wired",
            (false, true) => "seg",
            (false, false) => "det",
        };
        let path = dir.join(format!("{stem}.pt"));
        self.model().save_to(&path).unwrap();
        path
    }

    pub fn config(&self, weights: &Path) -> ExportConfig {
        ExportConfig {
            weights: weights.display().to_string(),
            imgsz: self.imgsz.to_vec(),
            nc: self.nc,
            topk_all: 10,
            ..ExportConfig::default()
        }
    }
}
