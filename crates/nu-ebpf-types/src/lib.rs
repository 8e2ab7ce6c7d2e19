#![doc = include_str!("../README.md")]

pub mod error;
pub mod header;
pub mod kernel_btf;
pub mod resolve;
pub mod types;

use std::sync::Arc;

use log::debug;

pub use error::{Diagnostic, LayoutError, SourceLocation};
pub use header::HeaderAdapter;
pub use kernel_btf::{BtfAdapter, BtfGraph, KernelBtf};
pub use resolve::{
    DemandCollector, DemandSource, MemberDecl, RecordDecl, ResolveReport, ResolveState, Resolver,
    ResolverConfig, SourcePreference, TypeAdapter,
};
pub use types::{AddrSpace, Bitfield, Field, SizedType, Struct, StructRegistry, TypeKind};

/// Pick the frontend for a program's `definitions`, loading kernel BTF
/// from the configured path or the usual locations.
///
/// Debug info that cannot be loaded only matters when it is required:
/// with [`SourcePreference::DebugInfo`] the load error is returned,
/// otherwise the headers are used.
pub fn select_adapter(config: &ResolverConfig, definitions: &str) -> Result<Box<dyn TypeAdapter>, LayoutError> {
    let debug_info = KernelBtf::load(config.btf_path.as_deref());
    match debug_info {
        Ok(graph) => select_adapter_with(config, definitions, Some(graph)),
        Err(e) if config.source == SourcePreference::DebugInfo => Err(e.into()),
        Err(e) => {
            debug!("no kernel BTF: {e}");
            select_adapter_with(config, definitions, None)
        }
    }
}

/// [`select_adapter`] over an already loaded graph
pub fn select_adapter_with(
    config: &ResolverConfig,
    definitions: &str,
    debug_info: Option<Arc<BtfGraph>>,
) -> Result<Box<dyn TypeAdapter>, LayoutError> {
    let headers = HeaderAdapter::from_config(definitions, config);
    let use_debug_info = config
        .source
        .use_debug_info(headers.defines_records(), debug_info.is_some());

    match (use_debug_info, debug_info) {
        (true, Some(graph)) => {
            debug!("resolving records from BTF");
            Ok(Box::new(BtfAdapter::new(graph)))
        }
        (true, None) => Err(LayoutError::adapter_failure(
            "btf",
            "debug info was requested but none is available",
        )),
        (false, Some(graph)) => {
            debug!("resolving records from {}", config.unit_name);
            Ok(Box::new(headers.with_debug_info(graph)))
        }
        (false, None) => Ok(Box::new(headers)),
    }
}
