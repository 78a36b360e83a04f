//! `stride` and `names` metadata, stored as strings in the model the way the
//! training framework writes them: `"32"` and `"{0: 'person', 1: 'bicycle'}"`.
use std::collections::BTreeMap;

use anyhow::{Context, bail, format_err};
use itertools::Itertools;
use py_literal::Value;

use crate::TractResult;
use tract_e2e_graph::pb::ModelProto;

pub type Names = BTreeMap<usize, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub stride: usize,
    pub names: Names,
}

impl Metadata {
    /// Read the metadata of a checkpoint. A missing stride is an error, as
    /// image sizes can not be validated without it; missing names default
    /// to `class0`, `class1`... for `nc` classes.
    pub fn from_model(model: &ModelProto, nc: usize) -> TractResult<Metadata> {
        let stride = model
            .metadata("stride")
            .context("Checkpoint has no \"stride\" metadata")
            .and_then(parse_stride)?;
        let names = match model.metadata("names") {
            Some(names) => parse_names(names)?,
            None => {
                warn!("Checkpoint has no \"names\" metadata, using generic class names");
                (0..nc).map(|i| (i, format!("class{i}"))).collect()
            }
        };
        Ok(Metadata { stride, names })
    }

    pub fn write_to(&self, model: &mut ModelProto) {
        model.set_metadata("stride", self.stride);
        model.set_metadata("names", format_names(&self.names));
    }
}

fn integer(v: &Value) -> TractResult<i64> {
    match v {
        Value::Integer(i) => {
            i.to_string().parse().with_context(|| format!("Integer {i} overflows"))
        }
        Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
        Value::Boolean(b) => Ok(*b as i64),
        other => bail!("Expected an integer, found {other:?}"),
    }
}

fn literal(s: &str) -> TractResult<Value> {
    s.trim().parse::<Value>().map_err(|e| format_err!("Invalid python literal {s:?}: {e}"))
}

/// Parse a stride. Per-level strides (`[8, 16, 32]`) reduce to their max.
pub fn parse_stride(s: &str) -> TractResult<usize> {
    let stride = match literal(s)? {
        Value::List(items) | Value::Tuple(items) => items
            .iter()
            .map(integer)
            .collect::<TractResult<Vec<_>>>()?
            .into_iter()
            .max()
            .context("Empty stride list")?,
        scalar => integer(&scalar)?,
    };
    if stride <= 0 {
        bail!("Invalid stride {stride}");
    }
    Ok(stride as usize)
}

/// Parse a label mapping, either a dict literal or a plain list.
pub fn parse_names(s: &str) -> TractResult<Names> {
    let as_string = |v: &Value| -> TractResult<String> {
        match v {
            Value::String(s) => Ok(s.clone()),
            other => bail!("Expected a class name, found {other:?}"),
        }
    };
    match literal(s)? {
        Value::Dict(entries) => entries
            .iter()
            .map(|(k, v)| Ok((usize::try_from(integer(k)?)?, as_string(v)?)))
            .collect(),
        Value::List(items) | Value::Tuple(items) => {
            items.iter().enumerate().map(|(ix, v)| Ok((ix, as_string(v)?))).collect()
        }
        other => bail!("Invalid names metadata: {other:?}"),
    }
}

fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push(delim);
    for c in s.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            c if c == delim => {
                quoted.push('\\');
                quoted.push(c);
            }
            c => quoted.push(c),
        }
    }
    quoted.push(delim);
    quoted
}

pub fn format_names(names: &Names) -> String {
    format!("{{{}}}", names.iter().map(|(k, v)| format!("{k}: {}", quote(v))).join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tract_e2e_graph::pb_helpers::model;

    #[test]
    fn names_from_dict() {
        let names = parse_names("{0: 'person', 1: 'bicycle', 2: \"it's\"}").unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names[&1], "bicycle");
        assert_eq!(names[&2], "it's");
    }

    #[test]
    fn names_from_list() {
        let names = parse_names("['a', 'b']").unwrap();
        assert_eq!(names[&0], "a");
        assert_eq!(names[&1], "b");
    }

    #[test]
    fn names_format_like_python() {
        let names: Names =
            [(0, "person".to_string()), (1, "it's".to_string())].into_iter().collect();
        let s = format_names(&names);
        assert_eq!(s, "{0: 'person', 1: \"it's\"}");
        assert_eq!(parse_names(&s).unwrap(), names);
    }

    #[test]
    fn strides() {
        assert_eq!(parse_stride("32").unwrap(), 32);
        assert_eq!(parse_stride("[8, 16, 32]").unwrap(), 32);
        assert_eq!(parse_stride("32.0").unwrap(), 32);
        assert!(parse_stride("0").is_err());
        assert!(parse_stride("'x'").is_err());
    }

    #[test]
    fn metadata_roundtrip_through_model() {
        let mut m = model();
        assert!(Metadata::from_model(&m, 2).is_err());
        m.set_metadata("stride", "[8, 16, 32]");
        let meta = Metadata::from_model(&m, 2).unwrap();
        assert_eq!(meta.stride, 32);
        assert_eq!(meta.names[&1], "class1");
        meta.write_to(&mut m);
        assert_eq!(m.metadata("stride"), Some("32"));
        assert_eq!(m.metadata("names"), Some("{0: 'class0', 1: 'class1'}"));
    }
}
