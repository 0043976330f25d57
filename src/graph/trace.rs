//! Serialized execution trace as produced by the host tracing runtime.
//!
//! Values are referred to by trace-wide integer ids: graph input `i` is
//! value `i`, and every op names the value ids of its own output slots.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufReader, Read},
    path::Path,
    sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    graph::Shape,
};

pub type ValueRef = usize;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceInput {
    /// Declared dimension sizes; `None` when the tracer could not infer them.
    #[serde(default)]
    pub sizes: Option<Vec<u64>>,
}

impl TraceInput {
    pub fn new(sizes: impl Into<Vec<u64>>) -> Self {
        TraceInput {
            sizes: Some(sizes.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceOp {
    pub inputs: Vec<ValueRef>,
    pub outputs: Vec<ValueRef>,
    /// Nested module scope the op executed in, e.g. `Net/Sequential[body]/Linear[0]`.
    pub scope: String,
    /// Operator kind, e.g. `aten::addmm`.
    pub kind: String,
    /// Type string of the first output, e.g. `Float(8, 128)`.
    #[serde(default)]
    pub output_type: String,
}

impl TraceOp {
    pub fn new(
        scope: impl ToString,
        kind: impl ToString,
        inputs: impl Into<Vec<ValueRef>>,
        outputs: impl Into<Vec<ValueRef>>,
    ) -> Self {
        TraceOp {
            inputs: inputs.into(),
            outputs: outputs.into(),
            scope: scope.to_string(),
            kind: kind.to_string(),
            output_type: String::new(),
        }
    }

    pub fn with_output_type(mut self, output_type: impl ToString) -> Self {
        self.output_type = output_type.to_string();
        self
    }

    /// Shape of the first output when the type string is a float tensor
    /// literal, `[1]` otherwise.
    pub fn output_shape(&self) -> Shape {
        parse_float_shape(&self.output_type).unwrap_or_else(|| vec![1])
    }
}

fn parse_float_shape(output_type: &str) -> Option<Shape> {
    static FLOAT_TENSOR: OnceLock<Regex> = OnceLock::new();
    let re = FLOAT_TENSOR.get_or_init(|| {
        Regex::new(r"Float\(([\d\s,]+)\)").expect("float tensor pattern is valid")
    });
    let dims = re.captures(output_type)?.get(1)?.as_str();
    dims.split(',')
        .map(|d| d.trim().parse::<u64>().ok())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub inputs: Vec<TraceInput>,
    pub ops: Vec<TraceOp>,
    /// Values returned by the traced forward pass.
    pub outputs: Vec<ValueRef>,
}

impl Trace {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks that every value is defined once and only referenced after its
    /// definition.
    pub fn validate(&self) -> Result<()> {
        let mut defined: BTreeSet<ValueRef> = (0..self.inputs.len()).collect();
        for (seq, op) in self.ops.iter().enumerate() {
            if let Some(&value) = op.inputs.iter().find(|v| !defined.contains(v)) {
                return Err(Error::DanglingReference {
                    value,
                    reason: format!("operand of op {} ({}) is not defined yet", seq, op.kind),
                });
            }
            for &value in &op.outputs {
                if !defined.insert(value) {
                    return Err(Error::DanglingReference {
                        value,
                        reason: format!("redefined by op {} ({})", seq, op.kind),
                    });
                }
            }
        }
        match self.outputs.iter().find(|v| !defined.contains(v)) {
            Some(&value) => Err(Error::DanglingReference {
                value,
                reason: "graph output is never defined".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_shape_parsing() {
        let op = TraceOp::new("Net", "aten::addmm", [0], [1]);
        assert_eq!(op.clone().with_output_type("Float(8, 128)").output_shape(), vec![8, 128]);
        assert_eq!(
            op.clone().with_output_type("Float(1, 3, 224, 224), %x").output_shape(),
            vec![1, 3, 224, 224]
        );
        assert_eq!(op.clone().with_output_type("Long(4)").output_shape(), vec![1]);
        assert_eq!(op.clone().with_output_type("Float(4, )").output_shape(), vec![1]);
        assert_eq!(op.output_shape(), vec![1]);
    }

    #[test]
    fn test_json_round_trip_keeps_defaults() {
        let json = r#"{
            "inputs": [{"sizes": [2, 4]}, {}],
            "ops": [{"inputs": [0, 1], "outputs": [2], "scope": "Net", "kind": "aten::mul"}],
            "outputs": [2]
        }"#;
        let trace = Trace::from_reader(json.as_bytes()).unwrap();
        assert_eq!(trace.inputs[1].sizes, None);
        assert_eq!(trace.ops[0].output_type, "");
        assert!(trace.validate().is_ok());
        let again = Trace::from_reader(trace.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(again, trace);
    }

    #[test]
    fn test_validate_rejects_forward_references() {
        let trace = Trace {
            inputs: vec![TraceInput::new([1])],
            ops: vec![
                TraceOp::new("Net", "aten::relu", [2], [1]),
                TraceOp::new("Net", "aten::relu", [0], [2]),
            ],
            outputs: vec![2],
        };
        assert!(matches!(
            trace.validate(),
            Err(Error::DanglingReference { value: 2, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_redefinition_and_unknown_output() {
        let redefined = Trace {
            inputs: vec![TraceInput::new([1])],
            ops: vec![TraceOp::new("Net", "aten::relu", [0], [0])],
            outputs: vec![0],
        };
        assert!(redefined.validate().is_err());
        let unknown_output = Trace {
            inputs: vec![TraceInput::new([1])],
            ops: vec![],
            outputs: vec![5],
        };
        assert!(matches!(
            unknown_output.validate(),
            Err(Error::DanglingReference { value: 5, .. })
        ));
    }
}
