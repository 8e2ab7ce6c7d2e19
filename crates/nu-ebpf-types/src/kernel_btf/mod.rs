//! Kernel BTF (BPF Type Format) frontend
//!
//! This module provides record layouts from kernel debug information,
//! normally `/sys/kernel/btf/vmlinux`. It contains:
//! - the parsed type graph and its lookups ([`BtfGraph`])
//! - the process-wide kernel graph ([`KernelBtf`])
//! - the [`BtfAdapter`] answering record lookups for the resolver

mod adapter;
#[cfg(test)]
pub(crate) mod builder;
mod graph;
mod service;

pub use adapter::BtfAdapter;
pub use graph::{BtfError, BtfGraph, Peeled, TypeId, TypedefShape, record_kind};
pub use service::KernelBtf;
