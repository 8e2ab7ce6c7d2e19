//! Demand-driven record resolution
//!
//! The pieces, in the order they run:
//! - [`DemandCollector`] gathers the record names a traced program can
//!   dereference (cast targets, typed variables whose fields are read)
//! - [`Resolver`] feeds those names to one [`TypeAdapter`] and keeps
//!   following record names found in the resolved fields until nothing new
//!   turns up
//! - the resulting [`StructRegistry`](crate::types::StructRegistry) is handed
//!   to the code generator
//!
//! Adapters only describe records ([`RecordDecl`]); turning those
//! descriptions into fields, bit-field windows and flattened anonymous
//! members happens in the registry, so both frontends share one layout path.

mod config;
mod demand;
mod driver;

pub use config::{ResolverConfig, SourcePreference};
pub use demand::{DemandCollector, DemandSet, DemandSource, builtin_record, normalize_type_name};
pub use driver::{ResolveReport, ResolveState, Resolver, UnresolvedType};

use crate::error::LayoutError;
use crate::types::SizedType;

/// One member as reported by a frontend
#[derive(Debug, Clone, PartialEq)]
pub struct MemberDecl {
    /// `None` for anonymous struct/union members and unnamed bit-fields
    pub name: Option<String>,
    pub ty: SizedType,
    /// Absolute bit offset from the start of the record, as decided by the
    /// source compiler
    pub bit_offset: usize,
    /// Declared width for bit-fields
    pub bit_width: Option<usize>,
}

impl MemberDecl {
    pub fn named(name: impl Into<String>, ty: SizedType, bit_offset: usize) -> Self {
        Self {
            name: Some(name.into()),
            ty,
            bit_offset,
            bit_width: None,
        }
    }

    pub fn bitfield(name: impl Into<String>, ty: SizedType, bit_offset: usize, width: usize) -> Self {
        Self {
            name: Some(name.into()),
            ty,
            bit_offset,
            bit_width: Some(width),
        }
    }

    /// Unnamed inline struct/union whose fields belong to the parent
    pub fn anonymous(ty: SizedType, bit_offset: usize) -> Self {
        Self {
            name: None,
            ty,
            bit_offset,
            bit_width: None,
        }
    }
}

/// A record as reported by a frontend
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDecl {
    pub name: String,
    /// Size in bytes including trailing padding
    pub size: usize,
    pub members: Vec<MemberDecl>,
}

impl RecordDecl {
    pub fn new(name: impl Into<String>, size: usize, members: Vec<MemberDecl>) -> Self {
        Self {
            name: name.into(),
            size,
            members,
        }
    }
}

/// A source of record layouts
///
/// There are two implementations: the header frontend
/// ([`HeaderAdapter`](crate::header::HeaderAdapter)) and the kernel debug-info
/// frontend ([`BtfAdapter`](crate::kernel_btf::BtfAdapter)). A compilation
/// picks one and hands it to the [`Resolver`].
pub trait TypeAdapter {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Records known up front. A header unit declares all of its records
    /// eagerly; debug info has none.
    fn preload(&mut self) -> Result<Vec<RecordDecl>, LayoutError> {
        Ok(Vec::new())
    }

    /// Describe the record registered as `name`.
    ///
    /// On success the requested record comes last, preceded by any
    /// anonymous records it embeds. `Ok(None)` means the name is unknown to
    /// this adapter, which is not an error for the pass as a whole.
    fn resolve(&mut self, name: &str) -> Result<Option<Vec<RecordDecl>>, LayoutError>;
}
