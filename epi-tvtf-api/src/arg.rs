use serde::{Deserialize, Serialize};

pub type Args = Vec<Arg>;
pub type NamedArgs = Vec<(String, Arg)>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
#[serde(rename_all = "lowercase")]
pub enum Arg {
    Int(i64),
    String(String),
    Bool(bool),
    Float(f64),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Column(String),
}

/// One entry of the JSON parameter list; named when `name` is present.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Param {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub arg: Arg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArgType {
    Int,
    String,
    Bool,
    Float,
    Timestamp,
    Column,
}

impl Arg {
    /// Numbers, and strings that parse as one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Float(f) => Some(*f),
            Arg::Int(i) => Some(*i as f64),
            Arg::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(i) => Some(*i),
            Arg::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(b) => Some(*b),
            Arg::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "1" => Some(true),
                "false" | "f" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Text of a string or the name of a column.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(s) | Arg::Column(s) => Some(s),
            _ => None,
        }
    }
}
