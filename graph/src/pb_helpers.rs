use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, bail, format_err};
use prost::Message;

use crate::TractResult;
use crate::pb::attribute_proto::AttributeType;
use crate::pb::tensor_proto::DataType;
use crate::pb::tensor_shape_proto::{Dimension, dimension};
use crate::pb::*;

pub fn model() -> ModelProto {
    ModelProto::default()
}

pub fn graph<S: ToString>(name: S) -> GraphProto {
    GraphProto { name: name.to_string(), ..GraphProto::default() }
}

pub fn node<S: ToString>(op_type: S) -> NodeProto {
    NodeProto { op_type: op_type.to_string(), ..NodeProto::default() }
}

/// A symbolic or static dimension in a declared shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Dim {
    Value(i64),
    Param(String),
}

impl From<usize> for Dim {
    fn from(v: usize) -> Dim {
        Dim::Value(v as i64)
    }
}

impl From<&str> for Dim {
    fn from(s: &str) -> Dim {
        Dim::Param(s.to_string())
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Dim::Value(v) => write!(f, "{v}"),
            Dim::Param(p) => write!(f, "{p}"),
        }
    }
}

pub fn value_info<S: ToString>(name: S, elem_type: DataType, shape: &[Dim]) -> ValueInfoProto {
    let dim = shape
        .iter()
        .map(|d| Dimension {
            denotation: String::new(),
            value: Some(match d {
                Dim::Value(v) => dimension::Value::DimValue(*v),
                Dim::Param(p) => dimension::Value::DimParam(p.clone()),
            }),
        })
        .collect();
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
        doc_string: String::new(),
    }
}

impl ValueInfoProto {
    pub fn tensor_type(&self) -> Option<&type_proto::Tensor> {
        match self.r#type.as_ref()?.value.as_ref()? {
            type_proto::Value::TensorType(t) => Some(t),
        }
    }

    pub fn tensor_type_mut(&mut self) -> Option<&mut type_proto::Tensor> {
        match self.r#type.as_mut()?.value.as_mut()? {
            type_proto::Value::TensorType(t) => Some(t),
        }
    }

    pub fn elem_type(&self) -> Option<DataType> {
        self.tensor_type().and_then(|t| DataType::from_i32(t.elem_type))
    }

    /// Declared shape, `None` if unknown. Dimensions without a value are
    /// reported as empty params.
    pub fn dims(&self) -> Option<Vec<Dim>> {
        let shape = self.tensor_type()?.shape.as_ref()?;
        Some(
            shape
                .dim
                .iter()
                .map(|d| match &d.value {
                    Some(dimension::Value::DimValue(v)) => Dim::Value(*v),
                    Some(dimension::Value::DimParam(p)) => Dim::Param(p.clone()),
                    None => Dim::Param(String::new()),
                })
                .collect(),
        )
    }

    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims()?
            .into_iter()
            .map(|d| match d {
                Dim::Value(v) if v >= 0 => Some(v as usize),
                _ => None,
            })
            .collect()
    }
}

/// Attribute payload, named when attached to a node.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Tensor(TensorProto),
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> AttrValue {
        AttrValue::Int(v)
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> AttrValue {
        AttrValue::Int(v as i64)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> AttrValue {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> AttrValue {
        AttrValue::String(v.to_string())
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> AttrValue {
        AttrValue::Ints(v)
    }
}

impl From<Vec<f32>> for AttrValue {
    fn from(v: Vec<f32>) -> AttrValue {
        AttrValue::Floats(v)
    }
}

impl From<TensorProto> for AttrValue {
    fn from(v: TensorProto) -> AttrValue {
        AttrValue::Tensor(v)
    }
}

impl AttrValue {
    pub fn into_proto(self, name: &str) -> AttributeProto {
        let mut attr = AttributeProto { name: name.to_string(), ..AttributeProto::default() };
        match self {
            AttrValue::Int(i) => {
                attr.r#type = AttributeType::Int as i32;
                attr.i = i;
            }
            AttrValue::Float(f) => {
                attr.r#type = AttributeType::Float as i32;
                attr.f = f;
            }
            AttrValue::String(s) => {
                attr.r#type = AttributeType::String as i32;
                attr.s = s.into_bytes();
            }
            AttrValue::Ints(ints) => {
                attr.r#type = AttributeType::Ints as i32;
                attr.ints = ints;
            }
            AttrValue::Floats(floats) => {
                attr.r#type = AttributeType::Floats as i32;
                attr.floats = floats;
            }
            AttrValue::Tensor(t) => {
                attr.r#type = AttributeType::Tensor as i32;
                attr.t = Some(t);
            }
        }
        attr
    }
}

impl NodeProto {
    pub fn name<S: ToString>(mut self, n: S) -> NodeProto {
        self.name = n.to_string();
        self
    }

    pub fn domain<S: ToString>(mut self, d: S) -> NodeProto {
        self.domain = d.to_string();
        self
    }

    pub fn input<S: ToString>(mut self, n: S) -> NodeProto {
        self.input.push(n.to_string());
        self
    }

    pub fn output<S: ToString>(mut self, n: S) -> NodeProto {
        self.output.push(n.to_string());
        self
    }

    pub fn attr<V: Into<AttrValue>>(mut self, name: &str, v: V) -> NodeProto {
        self.set_attr(name, v);
        self
    }

    pub fn set_attr<V: Into<AttrValue>>(&mut self, name: &str, v: V) {
        let attr = v.into().into_proto(name);
        if let Some(existing) = self.attribute.iter_mut().find(|a| a.name == name) {
            *existing = attr;
        } else {
            self.attribute.push(attr);
        }
    }

    pub fn get_attr_opt(&self, name: &str) -> Option<&AttributeProto> {
        self.attribute.iter().find(|a| a.name == name)
    }

    pub fn get_attr_opt_int(&self, name: &str) -> Option<i64> {
        self.get_attr_opt(name).map(|a| a.i)
    }

    pub fn get_attr_opt_float(&self, name: &str) -> Option<f32> {
        self.get_attr_opt(name).map(|a| a.f)
    }

    pub fn get_attr_opt_ints(&self, name: &str) -> Option<&[i64]> {
        self.get_attr_opt(name).map(|a| &*a.ints)
    }

    pub fn get_attr_opt_str(&self, name: &str) -> TractResult<Option<&str>> {
        self.get_attr_opt(name)
            .map(|a| std::str::from_utf8(&a.s))
            .transpose()
            .with_context(|| {
                format!("Node {} ({}) attribute {name} is not UTF-8", self.name, self.op_type)
            })
    }

    pub fn get_attr_opt_tensor(&self, name: &str) -> Option<&TensorProto> {
        self.get_attr_opt(name).and_then(|a| a.t.as_ref())
    }

    /// Inputs actually wired, skipping empty optional slots.
    pub fn wired_inputs(&self) -> impl Iterator<Item = &str> {
        self.input.iter().map(|s| &**s).filter(|s| !s.is_empty())
    }
}

impl fmt::Display for NodeProto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.op_type)
    }
}

impl GraphProto {
    pub fn node(mut self, n: NodeProto) -> GraphProto {
        self.node.push(n);
        self
    }

    pub fn input(mut self, v: ValueInfoProto) -> GraphProto {
        self.input.push(v);
        self
    }

    pub fn output(mut self, v: ValueInfoProto) -> GraphProto {
        self.output.push(v);
        self
    }

    pub fn initializer(mut self, t: TensorProto) -> GraphProto {
        self.initializer.push(t);
        self
    }

    pub fn get_initializer(&self, name: &str) -> Option<&TensorProto> {
        self.initializer.iter().find(|t| t.name == name)
    }

    /// Map from value name to the index of the node producing it.
    pub fn producers(&self) -> HashMap<&str, usize> {
        let mut map = HashMap::new();
        for (ix, n) in self.node.iter().enumerate() {
            for o in &n.output {
                map.insert(&**o, ix);
            }
        }
        map
    }

    /// Indices of nodes consuming a value, in graph order.
    pub fn consumers(&self, value: &str) -> Vec<usize> {
        self.node
            .iter()
            .enumerate()
            .filter(|(_, n)| n.input.iter().any(|i| i == value))
            .map(|(ix, _)| ix)
            .collect()
    }

    pub fn is_graph_output(&self, value: &str) -> bool {
        self.output.iter().any(|o| o.name == value)
    }

    /// Replace every use of `from` by `to`, in nodes and graph outputs.
    pub fn rename_value(&mut self, from: &str, to: &str) {
        for n in &mut self.node {
            for i in &mut n.input {
                if i == from {
                    *i = to.to_string();
                }
            }
        }
        for o in &mut self.output {
            if o.name == from {
                o.name = to.to_string();
            }
        }
    }

    /// Rename a value at its definition site too: producing node, graph
    /// input, initializer, and value info.
    pub fn rename_everywhere(&mut self, from: &str, to: &str) {
        self.rename_value(from, to);
        for n in &mut self.node {
            for o in &mut n.output {
                if o == from {
                    *o = to.to_string();
                }
            }
        }
        for v in self.input.iter_mut().chain(self.value_info.iter_mut()) {
            if v.name == from {
                v.name = to.to_string();
            }
        }
        for t in &mut self.initializer {
            if t.name == from {
                t.name = to.to_string();
            }
        }
    }

    /// Whether any node, input or initializer already defines `name`.
    pub fn defines(&self, name: &str) -> bool {
        self.node.iter().any(|n| n.output.iter().any(|o| o == name))
            || self.input.iter().any(|i| i.name == name)
            || self.initializer.iter().any(|i| i.name == name)
    }
}

impl ModelProto {
    pub fn read_from_bytes(bytes: &[u8]) -> TractResult<ModelProto> {
        ModelProto::decode(bytes).map_err(|e| format_err!("Protobuf decoding error: {e:?}"))
    }

    pub fn for_path(p: impl AsRef<Path>) -> TractResult<ModelProto> {
        let p = p.as_ref();
        let bytes = fs_err::read(p)?;
        ModelProto::read_from_bytes(&bytes).with_context(|| format!("Parsing {p:?}"))
    }

    pub fn write_to_bytes(&self) -> TractResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf).map_err(|e| format_err!("Protobuf encoding error: {e:?}"))?;
        Ok(buf)
    }

    /// Persist to `p`, going through a sibling temporary file so an error
    /// never leaves a truncated model behind.
    pub fn save_to(&self, p: impl AsRef<Path>) -> TractResult<()> {
        let p = p.as_ref();
        let bytes = self.write_to_bytes()?;
        let dir = match p.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Creating temporary file in {dir:?}"))?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(p).map_err(|e| format_err!("Persisting {p:?}: {}", e.error))?;
        Ok(())
    }

    pub fn graph(&self) -> TractResult<&GraphProto> {
        self.graph.as_ref().ok_or_else(|| format_err!("Model has no graph"))
    }

    pub fn graph_mut(&mut self) -> TractResult<&mut GraphProto> {
        self.graph.as_mut().ok_or_else(|| format_err!("Model has no graph"))
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata_props.iter().find(|p| p.key == key).map(|p| &*p.value)
    }

    pub fn set_metadata(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        if let Some(p) = self.metadata_props.iter_mut().find(|p| p.key == key) {
            p.value = value;
        } else {
            self.metadata_props.push(StringStringEntryProto { key: key.to_string(), value });
        }
    }

    pub fn opset_version(&self, domain: &str) -> Option<i64> {
        self.opset_import.iter().find(|o| o.domain == domain).map(|o| o.version)
    }

    pub fn ensure_opset(&mut self, domain: &str, version: i64) {
        if self.opset_version(domain).is_none() {
            self.opset_import.push(OperatorSetIdProto { domain: domain.to_string(), version });
        }
    }
}

impl TensorProto {
    pub fn elem_type(&self) -> Option<DataType> {
        DataType::from_i32(self.data_type)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|&d| d as usize).collect()
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product::<i64>() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f32_vec(&self) -> TractResult<Vec<f32>> {
        match self.elem_type() {
            Some(DataType::Float) => {
                if !self.raw_data.is_empty() {
                    Ok(self
                        .raw_data
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect())
                } else {
                    Ok(self.float_data.clone())
                }
            }
            Some(DataType::Float16) => {
                let bits: Vec<u16> = if !self.raw_data.is_empty() {
                    self.raw_data
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect()
                } else {
                    self.int32_data.iter().map(|&i| i as u16).collect()
                };
                Ok(bits.into_iter().map(|b| half::f16::from_bits(b).to_f32()).collect())
            }
            Some(DataType::Double) => Ok(self.double_data.iter().map(|&d| d as f32).collect()),
            other => bail!("Tensor {} can not be read as float (found {:?})", self.name, other),
        }
    }

    pub fn to_i64_vec(&self) -> TractResult<Vec<i64>> {
        match self.elem_type() {
            Some(DataType::Int64) => {
                if !self.raw_data.is_empty() {
                    Ok(self
                        .raw_data
                        .chunks_exact(8)
                        .map(|c| i64::from_le_bytes(std::array::from_fn(|i| c[i])))
                        .collect())
                } else {
                    Ok(self.int64_data.clone())
                }
            }
            Some(DataType::Int32) => {
                if !self.raw_data.is_empty() {
                    Ok(self
                        .raw_data
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                        .collect())
                } else {
                    Ok(self.int32_data.iter().map(|&i| i as i64).collect())
                }
            }
            other => bail!("Tensor {} can not be read as integers (found {:?})", self.name, other),
        }
    }
}

pub fn tensor_f32<S: ToString>(name: S, shape: &[usize], data: &[f32]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: shape.iter().map(|&d| d as i64).collect(),
        data_type: DataType::Float as i32,
        raw_data: data.iter().flat_map(|f| f.to_le_bytes()).collect(),
        ..TensorProto::default()
    }
}

pub fn tensor_f16<S: ToString>(name: S, shape: &[usize], data: &[f32]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: shape.iter().map(|&d| d as i64).collect(),
        data_type: DataType::Float16 as i32,
        raw_data: data.iter().flat_map(|f| half::f16::from_f32(*f).to_le_bytes()).collect(),
        ..TensorProto::default()
    }
}

pub fn tensor_i64<S: ToString>(name: S, shape: &[usize], data: &[i64]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: shape.iter().map(|&d| d as i64).collect(),
        data_type: DataType::Int64 as i32,
        raw_data: data.iter().flat_map(|i| i.to_le_bytes()).collect(),
        ..TensorProto::default()
    }
}

/// Float tensor in the requested element type (FLOAT or FLOAT16).
pub fn tensor_float<S: ToString>(
    name: S,
    dt: DataType,
    shape: &[usize],
    data: &[f32],
) -> TensorProto {
    if dt == DataType::Float16 {
        tensor_f16(name, shape, data)
    } else {
        tensor_f32(name, shape, data)
    }
}
