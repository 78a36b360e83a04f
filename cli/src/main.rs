#[macro_use]
extern crate log;

use std::process;

use clap::{Arg, ArgMatches, Command, crate_version};
use nu_ansi_term::Color;
use tract_e2e::TractResult;
use tract_e2e::export;

mod params;

fn command() -> Command<'static> {
    Command::new("tract-e2e")
        .version(crate_version!())
        .about("Export detection and segmentation checkpoints to ONNX, NMS included")
        .arg(
            Arg::new("weights")
                .long("weights")
                .takes_value(true)
                .multiple_values(true)
                .default_value("yolov8s-seg.pt")
                .help("Checkpoint paths or URLs, exported one after the other"),
        )
        .arg(
            Arg::new("imgsz")
                .long("img-size")
                .visible_aliases(&["imgsz", "img"])
                .takes_value(true)
                .min_values(1)
                .max_values(2)
                .help("Image size, h w or a single value for a square [default: 640 640]"),
        )
        .arg(Arg::new("nc").long("nc").takes_value(true).help("Number of classes [default: 80]"))
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .takes_value(true)
                .help("Batch size [default: 1]"),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .takes_value(true)
                .help("Target device, cuda device i.e. 0 or 0,1,2,3 or cpu [default: cpu]"),
        )
        .arg(Arg::new("half").long("half").help("FP16 half-precision export"))
        .arg(Arg::new("dynamic").long("dynamic").help("Dynamic axes"))
        .arg(Arg::new("dynamic-batch").long("dynamic-batch").help("Dynamic batch size"))
        .arg(Arg::new("simplify").long("simplify").help("Simplify the exported model"))
        .arg(Arg::new("cleanup").long("cleanup").help("Remove dead nodes and re-sort the graph"))
        .arg(
            Arg::new("opset")
                .long("opset")
                .takes_value(true)
                .help("ONNX opset version [default: 12]"),
        )
        .arg(Arg::new("end2end").long("end2end").help("Append NMS and mask decoding to the graph"))
        .arg(Arg::new("trt").long("trt").help("Use TensorRT plugins for NMS"))
        .arg(
            Arg::new("topk-all")
                .long("topk-all")
                .takes_value(true)
                .help("Detections kept per image [default: 100]"),
        )
        .arg(
            Arg::new("iou-thres")
                .long("iou-thres")
                .takes_value(true)
                .help("NMS IoU threshold [default: 0.45]"),
        )
        .arg(
            Arg::new("conf-thres")
                .long("conf-thres")
                .takes_value(true)
                .help("NMS confidence threshold [default: 0.25]"),
        )
        .arg(Arg::new("roi-align").long("roi-align").help("Crop masks to their box with RoiAlign"))
        .arg(
            Arg::new("roi-align-type")
                .long("roi-align-type")
                .takes_value(true)
                .possible_values(["0", "1", "2"])
                .help("0: RoiAlign, 1: RoIAlignDynamic_TRT, 2: RoIAlign2Dynamic_TRT [default: 0]"),
        )
        .arg(
            Arg::new("mask-resolution")
                .long("mask-resolution")
                .takes_value(true)
                .help("Side of RoiAlign masks [default: 56]"),
        )
        .arg(
            Arg::new("pooler-scale")
                .long("pooler-scale")
                .takes_value(true)
                .help("Prototype to input resolution ratio [default: 0.25]"),
        )
        .arg(
            Arg::new("sampling-ratio")
                .long("sampling-ratio")
                .takes_value(true)
                .help("RoiAlign sampling ratio, 0 for adaptive [default: 0]"),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of verbosity"),
        )
}

fn init_logger(matches: &ArgMatches) {
    let level = match matches.occurrences_of("verbosity") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level);
    env_logger::Builder::from_env(env).format_timestamp(None).format_target(false).init();
}

/// Export every weights file in turn. Returns the number of failures.
fn handle(matches: &ArgMatches) -> TractResult<usize> {
    let mut failures = 0;
    for weights in matches.values_of("weights").into_iter().flatten() {
        let config = params::export_config(matches, weights)?;
        info!("{} {}", Color::Blue.bold().paint("export:"), serde_json::to_string(&config)?);
        match export::run(&config) {
            Ok(Some(_)) => (),
            Ok(None) => failures += 1,
            Err(e) => {
                error!("{weights}: {e:?}");
                failures += 1;
            }
        }
    }
    Ok(failures)
}

fn main() {
    let matches = command().get_matches();
    init_logger(&matches);

    match handle(&matches) {
        Ok(0) => (),
        Ok(failures) => {
            warn!("{failures} export(s) failed");
            process::exit(1)
        }
        Err(e) => {
            error!("{e:?}");
            process::exit(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tract_e2e::config::{Device, RoiAlignType};

    fn config_for(args: &[&str]) -> Vec<tract_e2e::config::ExportConfig> {
        let matches = command().try_get_matches_from(args).unwrap();
        matches
            .values_of("weights")
            .unwrap()
            .map(|w| params::export_config(&matches, w).unwrap())
            .collect()
    }

    #[test]
    fn defaults() {
        let configs = config_for(&["tract-e2e"]);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].weights, "yolov8s-seg.pt");
        assert_eq!(configs[0].image_size(), [640, 640]);
        assert!(!configs[0].end2end);
    }

    #[test]
    fn every_weights_file_gets_a_config() {
        let configs = config_for(&[
            "tract-e2e",
            "--weights",
            "a.pt",
            "b.pt",
            "--img-size",
            "320",
            "--end2end",
            "--roi-align",
            "--roi-align-type",
            "2",
            "--device",
            "0",
            "--iou-thres",
            "0.5",
        ]);
        assert_eq!(configs.iter().map(|c| &*c.weights).collect::<Vec<_>>(), vec!["a.pt", "b.pt"]);
        for c in &configs {
            assert_eq!(c.image_size(), [320, 320]);
            assert!(c.end2end && c.roi_align);
            assert_eq!(c.roi_align_type, RoiAlignType::Dynamic2Trt);
            assert_eq!(c.device, Device::Cuda(vec![0]));
            assert_eq!(c.iou_thres, 0.5);
        }
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let matches = command().try_get_matches_from(["tract-e2e", "--topk-all", "many"]).unwrap();
        let err = params::export_config(&matches, "a.pt").unwrap_err();
        assert!(format!("{err:#}").contains("--topk-all"));
    }
}
