//! Record layouts from kernel debug info
//!
//! Unlike headers, BTF already carries the compiler's layout: member bit
//! offsets and record sizes are taken as they are. The adapter only maps
//! BTF types onto [`SizedType`]s and names records the way the registry
//! expects.
//!
//! Records reached through a pointer are only named; the resolver queues
//! them like any other demand. Anonymous records embedded in a parent have
//! no other way to be found, so they are described along with it.

use std::collections::HashSet;
use std::sync::Arc;

use btf_rs::{BtfType, Type};
use log::{debug, warn};

use super::graph::{BtfError, BtfGraph, TypeId, record_kind};
use super::service::KernelBtf;
use crate::error::LayoutError;
use crate::resolve::{MemberDecl, RecordDecl, ResolverConfig, TypeAdapter};
use crate::types::{AddrSpace, RecordKind, SizedType, anonymous_record_name};

/// Type tag the kernel puts on `__user` pointees
const USER_TAG: &str = "user";

const ADAPTER_NAME: &str = "btf";

impl From<BtfError> for LayoutError {
    fn from(e: BtfError) -> Self {
        LayoutError::adapter_failure(ADAPTER_NAME, e.to_string())
    }
}

/// Declarations produced for one demand
#[derive(Default)]
struct Walk {
    out: Vec<RecordDecl>,
    /// Records whose members are being described
    open: HashSet<TypeId>,
}

impl Walk {
    fn knows(&self, id: TypeId, name: &str) -> bool {
        self.open.contains(&id) || self.out.iter().any(|d| d.name == name)
    }
}

/// Record layouts from a BTF graph
pub struct BtfAdapter {
    graph: Arc<BtfGraph>,
}

impl BtfAdapter {
    pub fn new(graph: Arc<BtfGraph>) -> Self {
        Self { graph }
    }

    /// Kernel BTF, or the file named by `btf_path`
    pub fn from_config(config: &ResolverConfig) -> Result<Self, LayoutError> {
        Ok(Self::new(KernelBtf::load(config.btf_path.as_deref())?))
    }

    pub fn graph(&self) -> &Arc<BtfGraph> {
        &self.graph
    }

    /// Type id of the record a demand name refers to
    fn lookup(&self, name: &str) -> Option<TypeId> {
        if let Some((kind, tag)) = RecordKind::split_name(name) {
            if let Some(id) = anonymous_id(tag) {
                let found = self.graph.get(id).as_ref().and_then(record_kind);
                return (found == Some(kind)).then_some(id);
            }
            return self.graph.record(kind, tag);
        }

        // A typedef naming a record is registered under the typedef name
        let id = self.graph.skip_modifiers(self.graph.typedef(name)?);
        match self.graph.get(id)? {
            Type::Struct(_) | Type::Union(_) => Some(id),
            Type::Fwd(fwd) => self.graph.record(fwd_kind(&fwd), &self.graph.name(&fwd)?),
            _ => None,
        }
    }

    /// Push the declaration of record `id` as `name`, preceded by the
    /// anonymous records embedded in it
    fn describe(&self, id: TypeId, name: &str, walk: &mut Walk) {
        let Some(Type::Struct(record) | Type::Union(record)) = self.graph.get(id) else {
            return;
        };
        walk.open.insert(id);

        let mut decls = Vec::with_capacity(record.members.len());
        for member in &record.members {
            let ty = self.sized(member.get_type_id().unwrap_or(0), name, true, walk);
            let bit_offset = member.bit_offset() as usize;
            let Some(member_name) = self.graph.name(member) else {
                if ty.is_record() {
                    decls.push(MemberDecl::anonymous(ty, bit_offset));
                }
                continue;
            };

            // kind_flag records report width 0 for plain members
            let decl = match member.bitfield_size().filter(|&width| width > 0) {
                Some(width) => MemberDecl::bitfield(member_name, ty, bit_offset, width as usize),
                None => MemberDecl::named(member_name, ty, bit_offset),
            };
            decls.push(decl);
        }

        walk.open.remove(&id);
        walk.out.push(RecordDecl::new(name, record.size(), decls));
    }

    /// Map type `id` of a member of `enclosing`. With `embedded`, untagged
    /// records are described into `walk` as well.
    fn sized(&self, id: TypeId, enclosing: &str, embedded: bool, walk: &mut Walk) -> SizedType {
        let peeled = self.graph.peel(id);
        let Some(ty) = self.graph.get(peeled.id) else {
            return SizedType::none();
        };
        match &ty {
            Type::Int(int) => SizedType::integer(int.size() * 8, int.is_signed()),
            Type::Enum(e) => SizedType::integer(e.size() * 8, e.is_signed()),
            Type::Enum64(e) => SizedType::integer(e.size() * 8, e.is_signed()),
            Type::Float(float) => SizedType::opaque(float.size()),
            Type::Ptr(ptr) => {
                let pointee = ptr.get_type_id().unwrap_or(0);
                let space = if self.graph.has_type_tag(pointee, USER_TAG) {
                    AddrSpace::User
                } else {
                    AddrSpace::Kernel
                };
                SizedType::pointer(self.sized(pointee, enclosing, false, walk), space)
            }
            Type::Array(array) => {
                let element = array.get_type_id().unwrap_or(0);
                match self.graph.get(self.graph.skip_modifiers(element)) {
                    Some(Type::Int(int)) if int.size() == 1 => SizedType::string(array.len()),
                    _ => SizedType::array(array.len(), self.sized(element, enclosing, embedded, walk))
                        .unwrap_or_else(|| {
                            warn!("BTF array type {} is too large", peeled.id);
                            SizedType::none()
                        }),
                }
            }
            Type::Struct(record) | Type::Union(record) => {
                let kind = record_kind(&ty).unwrap_or(RecordKind::Struct);
                if let Some(tag) = self.graph.name(record) {
                    return SizedType::record(record.size(), format!("{kind} {tag}"));
                }
                let name = peeled.typedef.unwrap_or_else(|| {
                    anonymous_record_name(kind, Some(enclosing), &format!("btf:{}", peeled.id))
                });
                if embedded && !walk.knows(peeled.id, &name) {
                    self.describe(peeled.id, &name, walk);
                }
                SizedType::record(record.size(), name)
            }
            Type::Fwd(fwd) => {
                let kind = fwd_kind(fwd);
                let tag = self.graph.name(fwd).unwrap_or_default();
                let size = self
                    .graph
                    .record(kind, &tag)
                    .and_then(|id| match self.graph.get(id)? {
                        Type::Struct(record) | Type::Union(record) => Some(record.size()),
                        _ => None,
                    })
                    .unwrap_or(0);
                SizedType::record(size, format!("{kind} {tag}"))
            }
            _ => SizedType::none(),
        }
    }
}

fn fwd_kind(fwd: &btf_rs::Fwd) -> RecordKind {
    if fwd.is_union() {
        RecordKind::Union
    } else {
        RecordKind::Struct
    }
}

/// Type id inside a synthesized `Outer::(anonymous at btf:<id>)` tag
fn anonymous_id(tag: &str) -> Option<TypeId> {
    let (_, rest) = tag.rsplit_once("(anonymous at btf:")?;
    rest.strip_suffix(')')?.parse().ok()
}

impl TypeAdapter for BtfAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn resolve(&mut self, name: &str) -> Result<Option<Vec<RecordDecl>>, LayoutError> {
        let Some(id) = self.lookup(name) else {
            debug!("{name} not found in BTF");
            return Ok(None);
        };
        let mut walk = Walk::default();
        self.describe(id, name, &mut walk);
        debug!("{name}: BTF type {id}, {} declaration(s)", walk.out.len());
        Ok(Some(walk.out))
    }
}
