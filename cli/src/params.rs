use std::str::FromStr;

use anyhow::Context;
use clap::ArgMatches;
use tract_e2e::TractResult;
use tract_e2e::config::{ExportConfig, RoiAlignType};

fn parsed<T>(matches: &ArgMatches, name: &str) -> TractResult<Option<T>>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    matches
        .value_of(name)
        .map(|v| {
            v.parse::<T>()
                .map_err(Into::<anyhow::Error>::into)
                .with_context(|| format!("Invalid --{name} {v:?}"))
        })
        .transpose()
}

/// Export configuration for one of the `--weights` files. Options left
/// unset keep their `ExportConfig` default.
pub fn export_config(matches: &ArgMatches, weights: &str) -> TractResult<ExportConfig> {
    let mut config = ExportConfig { weights: weights.to_string(), ..ExportConfig::default() };
    if let Some(sizes) = matches.values_of("imgsz") {
        config.imgsz = sizes
            .map(|s| s.parse::<usize>().with_context(|| format!("Invalid --img-size {s:?}")))
            .collect::<TractResult<_>>()?;
    }
    macro_rules! set {
        ($($field: ident: $name: literal),*) => {
            $(if let Some(v) = parsed(matches, $name)? {
                config.$field = v;
            })*
        };
    }
    set!(
        nc: "nc",
        batch_size: "batch-size",
        device: "device",
        opset: "opset",
        topk_all: "topk-all",
        iou_thres: "iou-thres",
        conf_thres: "conf-thres",
        mask_resolution: "mask-resolution",
        pooler_scale: "pooler-scale",
        sampling_ratio: "sampling-ratio"
    );
    if let Some(kind) = parsed::<i64>(matches, "roi-align-type")? {
        config.roi_align_type = RoiAlignType::try_from(kind)?;
    }
    config.half = matches.is_present("half");
    config.dynamic = matches.is_present("dynamic");
    config.dynamic_batch = matches.is_present("dynamic-batch");
    config.simplify = matches.is_present("simplify");
    config.cleanup = matches.is_present("cleanup");
    config.end2end = matches.is_present("end2end");
    config.trt = matches.is_present("trt");
    config.roi_align = matches.is_present("roi-align");
    Ok(config)
}
