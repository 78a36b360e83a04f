use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure, format_err};
use itertools::Itertools;
use serde::Serialize;

use crate::TractResult;

pub const DEFAULT_OPSET: i64 = 12;
pub const SUPPORTED_OPSETS: std::ops::RangeInclusive<i64> = 11..=17;

/// Where the exported model is meant to run. The dry run itself always
/// executes on the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Device {
    Cpu,
    Cuda(Vec<usize>),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> TractResult<Device> {
        let s = s.trim().to_lowercase();
        let s = s.strip_prefix("cuda:").unwrap_or(&s);
        if s == "cpu" || s.is_empty() {
            return Ok(Device::Cpu);
        }
        let ids = s
            .split(',')
            .map(|id| id.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format_err!("Invalid device {s:?}, expected cpu, 0 or 0,1,2,3"))?;
        Ok(Device::Cuda(ids))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ids) => write!(f, "cuda:{}", ids.iter().join(",")),
        }
    }
}

/// Operator used to crop masks to their detection box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RoiAlignType {
    /// Standard ONNX `RoiAlign`.
    Onnx,
    /// `RoIAlignDynamic_TRT` plugin, same inputs as the ONNX operator.
    DynamicTrt,
    /// `RoIAlign2Dynamic_TRT` plugin, batch index folded in the rois.
    Dynamic2Trt,
}

impl RoiAlignType {
    pub fn op_type(&self) -> &'static str {
        match self {
            RoiAlignType::Onnx => "RoiAlign",
            RoiAlignType::DynamicTrt => "RoIAlignDynamic_TRT",
            RoiAlignType::Dynamic2Trt => "RoIAlign2Dynamic_TRT",
        }
    }

    pub fn is_plugin(&self) -> bool {
        !matches!(self, RoiAlignType::Onnx)
    }
}

impl TryFrom<i64> for RoiAlignType {
    type Error = anyhow::Error;
    fn try_from(v: i64) -> TractResult<RoiAlignType> {
        Ok(match v {
            0 => RoiAlignType::Onnx,
            1 => RoiAlignType::DynamicTrt,
            2 => RoiAlignType::Dynamic2Trt,
            _ => bail!("Invalid roi align type {v}, expected 0 (RoiAlign) or 1, 2 (TRT plugins)"),
        })
    }
}

/// Everything one export run needs, resolved once per weights file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportConfig {
    pub weights: String,
    /// Requested image size, `(h, w)` or a single value for a square.
    pub imgsz: Vec<usize>,
    pub nc: usize,
    pub batch_size: usize,
    pub device: Device,
    pub half: bool,
    pub dynamic: bool,
    pub dynamic_batch: bool,
    pub simplify: bool,
    pub cleanup: bool,
    pub opset: i64,
    pub topk_all: usize,
    pub iou_thres: f32,
    pub conf_thres: f32,
    pub mask_resolution: usize,
    pub pooler_scale: f32,
    pub sampling_ratio: i64,
    pub end2end: bool,
    pub trt: bool,
    pub roi_align: bool,
    pub roi_align_type: RoiAlignType,
}

impl Default for ExportConfig {
    fn default() -> ExportConfig {
        ExportConfig {
            weights: "yolov8s-seg.onnx".to_string(),
            imgsz: vec![640, 640],
            nc: 80,
            batch_size: 1,
            device: Device::Cpu,
            half: false,
            dynamic: false,
            dynamic_batch: false,
            simplify: false,
            cleanup: false,
            opset: DEFAULT_OPSET,
            topk_all: 100,
            iou_thres: 0.45,
            conf_thres: 0.25,
            mask_resolution: 56,
            pooler_scale: 0.25,
            sampling_ratio: 0,
            end2end: false,
            trt: false,
            roi_align: false,
            roi_align_type: RoiAlignType::Onnx,
        }
    }
}

impl ExportConfig {
    /// Reject incompatible combinations before any model work happens.
    pub fn validate(&self) -> TractResult<()> {
        if self.half {
            ensure!(
                !self.device.is_cpu(),
                "--half only compatible with GPU export, i.e. use --device 0"
            );
            ensure!(
                !self.dynamic,
                "--half not compatible with --dynamic, use either --half or --dynamic"
            );
        }
        ensure!(
            SUPPORTED_OPSETS.contains(&self.opset),
            "Unsupported opset {}, expected {}..={}",
            self.opset,
            SUPPORTED_OPSETS.start(),
            SUPPORTED_OPSETS.end()
        );
        ensure!(
            matches!(self.imgsz.len(), 1 | 2),
            "--imgsz expects one or two values, got {:?}",
            self.imgsz
        );
        ensure!(self.imgsz.iter().all(|&d| d > 0), "Image size must be positive");
        ensure!(self.batch_size > 0, "Batch size must be positive");
        ensure!(self.nc > 0, "Number of classes must be positive");
        ensure!(self.topk_all > 0, "--topk-all must be positive");
        ensure!((0.0..=1.0).contains(&self.iou_thres), "--iou-thres must be in [0, 1]");
        ensure!((0.0..=1.0).contains(&self.conf_thres), "--conf-thres must be in [0, 1]");
        ensure!(self.mask_resolution > 0, "--mask-resolution must be positive");
        ensure!(self.pooler_scale > 0.0, "--pooler-scale must be positive");
        ensure!(self.sampling_ratio >= 0, "--sampling-ratio must not be negative");
        Ok(())
    }

    /// `(h, w)`, a single value being broadcast to a square.
    pub fn image_size(&self) -> [usize; 2] {
        match self.imgsz.as_slice() {
            [s] => [*s, *s],
            [h, w, ..] => [*h, *w],
            [] => [640, 640],
        }
    }

    /// Full dynamic axes are superseded by batch dynamicity and by end to
    /// end export.
    pub fn resolved_dynamic(&self) -> bool {
        self.dynamic && !self.dynamic_batch && !self.end2end
    }
}

/// Round `size` up to a multiple of `stride`, warning when it changes.
pub fn check_imgsz(size: usize, stride: usize) -> usize {
    let stride = stride.max(1);
    let rounded = size.div_ceil(stride).max(1) * stride;
    if rounded != size {
        warn!("--img-size {size} must be multiple of max stride {stride}, updating to {rounded}");
    }
    rounded
}
