use anyhow::Context;
use arg::{Args, NamedArgs, Param};
use arrow::array::RecordBatch;
use derive_builder::Builder;
use serde::Serialize;
use std::sync::Arc;

use crate::arg::ArgType;

pub mod arg;

/// Parses the JSON parameter list and initializes the registered function.
///
/// Entries carrying a `name` become named arguments, the rest stay
/// positional in their original order.
pub fn create(
    registry: &FunctionRegistry,
    parameters: Option<&str>,
    timezone: &str,
) -> anyhow::Result<Box<dyn TableFunction>> {
    let create_closure = &(registry.init);
    let params: Option<Vec<Param>> = if let Some(param) = parameters {
        serde_json::from_str(param).context("serde json failed")?
    } else {
        None
    };
    let mut positional: Option<Args> = None;
    let mut named_arguments = NamedArgs::new();
    for param in params.into_iter().flatten() {
        match param.name {
            Some(name) => named_arguments.push((name, param.arg)),
            None => positional.get_or_insert_with(Vec::new).push(param.arg),
        }
    }
    let ctx = FunctionContext {
        parameters: positional,
        named_arguments,
        timezone: String::from(timezone),
    };
    create_closure(ctx)
}

/// Feeds every batch through `process`, then `finalize`, collecting output.
pub fn run(
    func: &mut dyn TableFunction,
    batches: impl IntoIterator<Item = RecordBatch>,
) -> anyhow::Result<Vec<RecordBatch>> {
    let mut output = Vec::new();
    for batch in batches {
        if let Some(result) = func.process(batch)? {
            output.push(result);
        }
    }
    if let Some(result) = func.finalize()? {
        output.push(result);
    }
    Ok(output)
}

type TableFunctionInitialize =
    Arc<dyn Fn(FunctionContext) -> anyhow::Result<Box<dyn TableFunction>> + Send + Sync>;

#[derive(Builder)]
pub struct FunctionRegistry {
    #[builder(setter(into))]
    name: &'static str,
    init: TableFunctionInitialize,
    #[builder(setter(strip_option, each(name = "signature", into)))]
    signatures: Option<Vec<Signature>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("name", &self.name)
            .field("init", &Arc::as_ptr(&self.init))
            .field("signatures", &self.signatures)
            .finish()
    }
}

impl FunctionRegistry {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signatures(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.signatures).context("Failed to get signatures")
    }

    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder::default()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Signature {
    pub args: Vec<ArgType>,
}

impl From<Vec<ArgType>> for Signature {
    fn from(value: Vec<ArgType>) -> Self {
        Signature { args: value }
    }
}

pub struct FunctionContext {
    pub parameters: Option<Args>,
    pub named_arguments: NamedArgs,
    pub timezone: String,
}

pub trait TableFunction {
    fn process(&mut self, input: RecordBatch) -> anyhow::Result<Option<RecordBatch>>;

    fn finalize(&mut self) -> anyhow::Result<Option<RecordBatch>> {
        Ok(None)
    }
}
