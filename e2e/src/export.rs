//! Export orchestration: load, validate, dry run, compose, persist.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, ensure};
use nu_ansi_term::Color;

use crate::TractResult;
use crate::adapter::{
    CanonicalOutputs, HeadFlags, INPUT_NAME, ModelAdapter, OUTPUT_NAME, PROTO_NAME,
};
use crate::compose::{End2End, NmsBackend, OutputSpec, ProtoInput, TRT_DOMAIN};
use crate::config::{ExportConfig, check_imgsz};
use crate::step::{StepArtifact, run_step};
use crate::weights;
use tract_e2e_graph::passes;
use tract_e2e_graph::prelude::*;
use tract_e2e_graph::{check_model, ir_version_for_opset};

pub const FORMAT: &str = "onnx";
const CANONICAL_OUTPUT: &str = "/adapter/output";
const CANONICAL_PROTO: &str = "/adapter/proto";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Loading,
    ValidatingInput,
    WarmingUp,
    Tracing,
    PostProcessing,
    Done,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ExportedArtifact {
    pub path: PathBuf,
    pub model: ModelProto,
}

impl StepArtifact for ExportedArtifact {
    fn describe(&self) -> String {
        format!("saved as {} ({:.1} MB)", self.path.display(), file_size(&self.path))
    }
}

/// Symbolic dims per tensor name.
pub type DynamicAxes = BTreeMap<String, BTreeMap<usize, String>>;

/// File size in MB, 0 if it can not be read.
pub fn file_size(path: &Path) -> f64 {
    fs_err::metadata(path).map(|m| m.len() as f64 / (1 << 20) as f64).unwrap_or(0.0)
}

fn paint(prefix: &str) -> String {
    Color::Blue.bold().paint(prefix).to_string()
}

/// Symbolic axes requested by `--dynamic-batch`. The packed end-to-end
/// output is indexed by detection, not by image.
pub fn dynamic_axes(config: &ExportConfig, output_names: &[&str]) -> Option<DynamicAxes> {
    if !config.dynamic_batch {
        return None;
    }
    let axis = |name: &str| BTreeMap::from([(0, name.to_string())]);
    let mut axes = DynamicAxes::new();
    axes.insert(INPUT_NAME.to_string(), axis("batch"));
    for name in output_names {
        let dim = if config.end2end && !config.trt { "num_dets" } else { "batch" };
        axes.insert(name.to_string(), axis(dim));
    }
    Some(axes)
}

/// Output path for a checkpoint: `<stem>.onnx` next to it, unless that is
/// the checkpoint itself.
pub fn artifact_path(checkpoint: &Path) -> PathBuf {
    let f = checkpoint.with_extension(FORMAT);
    if f == checkpoint {
        let stem = checkpoint.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
        checkpoint.with_file_name(format!("{stem}-export.{FORMAT}"))
    } else {
        f
    }
}

/// Default opset for the exported graph. Checkpoint operators are not
/// converted across opsets, so its own opset wins.
fn resolve_opset(checkpoint: Option<i64>, requested: i64) -> i64 {
    match checkpoint {
        Some(opset) if opset != requested => {
            info!("Checkpoint uses opset {opset}, exporting with it instead of {requested}");
            opset
        }
        _ => requested,
    }
}

fn declared(
    spec: &OutputSpec,
    axes: Option<&DynamicAxes>,
    forced: &[(usize, &str)],
) -> ValueInfoProto {
    let symbols = axes.and_then(|a| a.get(&spec.name));
    let dims: Vec<Dim> = spec
        .shape
        .iter()
        .enumerate()
        .map(|(ix, &d)| {
            if let Some((_, sym)) = forced.iter().find(|(f, _)| *f == ix) {
                Dim::from(*sym)
            } else if let Some(sym) = symbols.and_then(|s| s.get(&ix)) {
                Dim::Param(sym.clone())
            } else {
                Dim::from(d)
            }
        })
        .collect();
    value_info(&spec.name, spec.elem_type, &dims)
}

/// Replace a model with a transformed copy, saved to `path`. Any failure
/// leaves both the model and the file as they were.
fn best_effort<F>(what: &str, path: &Path, model: ModelProto, transform: F) -> ModelProto
where
    F: FnOnce(&mut ModelProto) -> TractResult<()>,
{
    let mut candidate = model.clone();
    match transform(&mut candidate).and_then(|_| candidate.save_to(path)) {
        Ok(()) => candidate,
        Err(e) => {
            warn!("{} {what} failure: {e:#}", paint("ONNX:"));
            model
        }
    }
}

/// Human readable report of a successful export.
pub fn summary(artifact: &ExportedArtifact, config: &ExportConfig, elapsed: Duration) -> String {
    let f = artifact.path.display();
    let dir = artifact
        .path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let [h, w] = config.image_size();
    let dt = if config.half { "f16" } else { "f32" };
    let mut lines = vec![
        format!("Export complete ({:.1}s)", elapsed.as_secs_f32()),
        format!("Results saved to {}", Color::White.bold().paint(dir.display().to_string())),
        format!("Inspect:         tract {f} dump"),
        format!("Run:             tract {f} -i {},3,{h},{w},{dt} run", config.batch_size),
        "Visualize:       https://netron.app".to_string(),
    ];
    if config.half {
        lines.push("Half:            exported with --half, feed f16 images".to_string());
    }
    lines.join("\n")
}

/// One export run over one weights file.
#[derive(Debug)]
pub struct Exporter<'c> {
    config: &'c ExportConfig,
    history: Vec<Stage>,
}

impl<'c> Exporter<'c> {
    pub fn new(config: &'c ExportConfig) -> Exporter<'c> {
        Exporter { config, history: vec![] }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.history.last().copied()
    }

    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    fn enter(&mut self, stage: Stage) {
        debug!("{:?} -> {stage:?}", self.stage());
        self.history.push(stage);
    }

    /// Export the configured weights. Errors raised before the export step
    /// propagate; a failing export step yields `Ok(None)`.
    pub fn run(&mut self) -> TractResult<Option<ExportedArtifact>> {
        let started = Instant::now();
        let result = self.export();
        match &result {
            Ok(Some(artifact)) => {
                self.enter(Stage::Done);
                info!("{}", summary(artifact, self.config, started.elapsed()));
            }
            _ => self.enter(Stage::Failed),
        }
        result
    }

    fn export(&mut self) -> TractResult<Option<ExportedArtifact>> {
        let config = self.config;
        self.enter(Stage::Loading);
        config.validate()?;
        let file = weights::resolve(&config.weights)?;
        let flags = HeadFlags {
            dynamic: config.resolved_dynamic(),
            export: true,
            format: FORMAT.to_string(),
        };
        let mut adapter = ModelAdapter::load(&file, config.nc, flags)?;
        if adapter.names().len() != config.nc {
            let named = adapter.names().len();
            warn!("--nc is {} but the checkpoint names {named} classes", config.nc);
        }
        if !config.device.is_cpu() {
            debug!("Dry run executes on the host, {} is the export target", config.device);
        }

        self.enter(Stage::ValidatingInput);
        let gs = adapter.stride();
        let [h, w] = config.image_size();
        let imgsz = [check_imgsz(h, gs), check_imgsz(w, gs)];
        if let Some(declared) = adapter.declared_image_size() {
            if declared != imgsz {
                warn!("Checkpoint input is {declared:?}, constants may not match {imgsz:?}");
            }
        }

        self.enter(Stage::WarmingUp);
        let canonical = adapter.warm_up([config.batch_size, 3, imgsz[0], imgsz[1]], 2)?;
        if config.half {
            adapter.to_half()?;
        }
        info!(
            "{} starting from {} with output shape {:?} ({:.1} MB)",
            paint("Checkpoint:"),
            file.display(),
            canonical.preds.shape(),
            file_size(&file)
        );

        let outcome =
            run_step(paint("ONNX:"), || self.export_onnx(&adapter, &canonical, &file, imgsz));
        Ok(outcome.artifact())
    }

    fn export_onnx(
        &mut self,
        adapter: &ModelAdapter,
        canonical: &CanonicalOutputs,
        file: &Path,
        imgsz: [usize; 2],
    ) -> TractResult<ExportedArtifact> {
        let config = self.config;
        info!("{} starting export with tract-e2e {}...", paint("ONNX:"), env!("CARGO_PKG_VERSION"));
        let f = artifact_path(file);
        if adapter.flags().dynamic {
            bail!("Full dynamic axes are not implemented, use --dynamic-batch");
        }

        self.enter(Stage::Tracing);
        let float_type = if config.half { DataType::Float16 } else { DataType::Float };
        let opset = resolve_opset(adapter.opset(), config.opset);
        let mut model = adapter.model().clone();
        let graph = model.graph_mut()?;

        let (specs, forced) = if config.end2end {
            let e2e = End2End::from_config(config, adapter.nc(), imgsz);
            if !e2e.offset_is_precise() {
                warn!(
                    "Class offsets of {} x {} classes exceed float precision, NMS may degrade",
                    e2e.max_wh, e2e.nc
                );
            }
            let evaluated = e2e.forward(canonical)?;
            graph.rename_everywhere(OUTPUT_NAME, CANONICAL_OUTPUT);
            graph.rename_everywhere(PROTO_NAME, CANONICAL_PROTO);
            graph.output.clear();
            let proto = canonical.proto.as_ref().map(|p| {
                let hw = [p.shape()[2], p.shape()[3]];
                e2e.check_pooler_scale(hw);
                ProtoInput { name: CANONICAL_PROTO, channels: p.shape()[1], hw }
            });
            let mut b = GraphBuilder::new(graph, "/end2end", opset).with_float_type(float_type);
            let names = e2e.emit(&mut b, CANONICAL_OUTPUT, proto)?;
            let specs = evaluated.specs(float_type);
            ensure!(
                names.iter().eq(specs.iter().map(|s| &s.name)),
                "Emitted outputs {names:?} do not match evaluated outputs"
            );
            let forced: &[(usize, &str)] =
                if e2e.backend == NmsBackend::Onnx { &[(0, "num_dets")] } else { &[] };
            (specs, forced)
        } else {
            let mut specs = vec![OutputSpec {
                name: OUTPUT_NAME.to_string(),
                elem_type: float_type,
                shape: canonical.preds.shape().to_vec(),
            }];
            if let Some(p) = &canonical.proto {
                specs.push(OutputSpec {
                    name: PROTO_NAME.to_string(),
                    elem_type: float_type,
                    shape: p.shape().to_vec(),
                });
            }
            (specs, &[][..])
        };

        let names: Vec<&str> = specs.iter().map(|s| &*s.name).collect();
        let axes = dynamic_axes(config, &names);
        let input = OutputSpec {
            name: INPUT_NAME.to_string(),
            elem_type: float_type,
            shape: vec![config.batch_size, 3, imgsz[0], imgsz[1]],
        };
        graph.input.retain(|i| i.name != INPUT_NAME);
        graph.input.insert(0, declared(&input, axes.as_ref(), &[]));
        graph.output = specs.iter().map(|s| declared(s, axes.as_ref(), forced)).collect();
        graph.value_info.clear();
        if graph.name.is_empty() {
            graph.name = "main_graph".to_string();
        }
        let uses_trt = graph.node.iter().any(|n| n.domain == TRT_DOMAIN);

        model.ir_version = ir_version_for_opset(opset);
        model.opset_import.retain(|o| !o.domain.is_empty() && o.domain != "ai.onnx");
        model.opset_import.insert(0, OperatorSetIdProto { domain: String::new(), version: opset });
        if uses_trt {
            model.ensure_opset(TRT_DOMAIN, 1);
        }
        model.producer_name = format!("tract-e2e.{}", adapter.flags().format);
        model.producer_version = env!("CARGO_PKG_VERSION").to_string();
        model.metadata_props.clear();
        model.save_to(&f)?;

        self.enter(Stage::PostProcessing);
        let mut model = ModelProto::for_path(&f)?;
        check_model(&model)?;
        adapter.metadata().write_to(&mut model);
        model.save_to(&f)?;

        if config.simplify {
            info!("{} simplifying with tract {}...", paint("ONNX:"), env!("CARGO_PKG_VERSION"));
            model = best_effort("simplifier", &f, model, |m| {
                let stats = passes::simplify(m)?;
                debug!("Simplified: {stats:?}");
                Ok(())
            });
        }
        if config.cleanup {
            info!("Starting to cleanup ONNX graph...");
            model = best_effort("cleanup", &f, model, |m| {
                let stats = passes::cleanup(m.graph_mut()?)?;
                debug!("Cleaned up: {stats:?}");
                check_model(m)
            });
        }
        Ok(ExportedArtifact { path: f, model })
    }
}

/// Export one weights file.
pub fn run(config: &ExportConfig) -> TractResult<Option<ExportedArtifact>> {
    Exporter::new(config).run()
}
