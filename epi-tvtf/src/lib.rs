use std::sync::Arc;

use anyhow::Context;
use epi_tvtf_api::{FunctionRegistry, TableFunction, arg::ArgType};

use crate::funcs::*;

pub mod funcs;

pub fn get_function_registries() -> anyhow::Result<Vec<FunctionRegistry>> {
    Ok(vec![
        FunctionRegistry::builder()
            .name("epi_forecast")
            .init(Arc::new(|ctx| {
                EpiForecast::new(ctx.parameters, ctx.named_arguments)
                    .map(|f| Box::new(f) as Box<dyn TableFunction>)
            }))
            .signature(vec![])
            .signature(vec![ArgType::Column])
            .build()
            .context("create `epi_forecast` registry failed")?,
    ])
}
