//! Bridge to the tract runtime, used to execute and type exported graphs.
use anyhow::{Context, bail, format_err};
use ndarray::{ArrayD, IxDyn};
use tract_onnx::prelude::*;

use crate::pb::tensor_proto::DataType;
use crate::pb::{ModelProto, ValueInfoProto};
use crate::pb_helpers::{Dim, value_info};

fn load(model: &ModelProto) -> TractResult<InferenceModel> {
    let bytes = model.write_to_bytes()?;
    tract_onnx::onnx().model_for_read(&mut &*bytes).context("Loading model in tract")
}

/// Run a single-input float model `times` times on the same input and
/// return the outputs of the last run.
pub fn run_f32(
    model: &ModelProto,
    shape: &[usize],
    data: &[f32],
    times: usize,
) -> TractResult<Vec<ArrayD<f32>>> {
    let plan = load(model)?
        .with_input_fact(0, f32::fact(shape.to_vec()).into())?
        .into_optimized()?
        .into_runnable()?;
    let input = Tensor::from_shape(shape, data)?;
    let mut outputs = tvec!();
    for _ in 0..times.max(1) {
        outputs = plan.run(tvec!(input.clone().into()))?;
    }
    outputs
        .iter()
        .map(|o| {
            let o = o.cast_to::<f32>()?;
            let data = o.as_slice::<f32>()?.to_vec();
            ArrayD::from_shape_vec(IxDyn(o.shape()), data).map_err(|e| format_err!("{e}"))
        })
        .collect()
}

fn onnx_data_type(dt: DatumType) -> TractResult<DataType> {
    Ok(match dt {
        DatumType::Bool => DataType::Bool,
        DatumType::U8 => DataType::Uint8,
        DatumType::I8 => DataType::Int8,
        DatumType::I32 => DataType::Int32,
        DatumType::I64 => DataType::Int64,
        DatumType::F16 => DataType::Float16,
        DatumType::F32 => DataType::Float,
        DatumType::F64 => DataType::Double,
        other => bail!("No ONNX equivalent for {other:?}"),
    })
}

/// Type the model with tract and report the inferred output value infos,
/// in graph output order. Static dimensions become values, symbolic ones
/// become params named after the tract expression.
pub fn infer_outputs(model: &ModelProto) -> TractResult<Vec<ValueInfoProto>> {
    let graph = model.graph()?;
    let typed = load(model)?.into_typed().context("Typing model in tract")?;
    graph
        .output
        .iter()
        .enumerate()
        .map(|(ix, output)| {
            let fact = typed.output_fact(ix)?;
            let shape: Vec<Dim> = fact
                .shape
                .iter()
                .map(|d| match d.to_i64() {
                    Ok(v) => Dim::Value(v),
                    Err(_) => Dim::Param(d.to_string()),
                })
                .collect();
            Ok(value_info(&output.name, onnx_data_type(fact.datum_type)?, &shape))
        })
        .collect()
}
