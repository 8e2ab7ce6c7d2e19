//! Kernel type graph
//!
//! Parsing is left to `btf-rs`. This wraps a parsed [`Btf`] with the
//! queries the adapter needs: record definitions by tag, typedefs, modifier
//! chains and `__user` type tags. ELF images (`vmlinux` under `/boot`) have
//! their `.BTF` section extracted with `object` first.

use std::fmt;
use std::fs;
use std::path::Path;

use btf_rs::{Btf, BtfType, Type};
use log::debug;
use object::{Object, ObjectSection};
use thiserror::Error;

use crate::types::RecordKind;

/// Index of a type in the graph. 0 is `void`.
pub type TypeId = u32;

/// Longest typedef/qualifier chain followed before giving up
const MAX_CHAIN: usize = 64;

/// Errors that can occur when loading BTF
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BtfError {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid BTF: {0}")]
    Parse(String),

    #[error("Invalid ELF object: {0}")]
    Elf(String),

    #[error("ELF object has no .BTF section")]
    MissingSection,

    #[error("Kernel type information not available (tried {})", tried.join(", "))]
    NotAvailable { tried: Vec<String> },
}

/// The scalar a typedef stands for, as far as header text needs to know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedefShape {
    Int { size: usize, signed: bool },
    Bool,
    Pointer,
}

/// A type with its typedefs, qualifiers and tags stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peeled {
    pub id: TypeId,
    /// First typedef on the way down
    pub typedef: Option<String>,
}

/// A parsed BTF blob
pub struct BtfGraph {
    btf: Btf,
}

impl fmt::Debug for BtfGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtfGraph").finish_non_exhaustive()
    }
}

impl BtfGraph {
    /// Parse a raw blob or an ELF object carrying a `.BTF` section
    pub fn from_bytes(data: &[u8]) -> Result<Self, BtfError> {
        let raw = if data.starts_with(b"\x7fELF") {
            let file = object::File::parse(data).map_err(|e| BtfError::Elf(e.to_string()))?;
            let section = file.section_by_name(".BTF").ok_or(BtfError::MissingSection)?;
            section.data().map_err(|e| BtfError::Elf(e.to_string()))?
        } else {
            data
        };
        let btf = Btf::from_bytes(raw).map_err(|e| BtfError::Parse(format!("{e:#}")))?;
        Ok(Self { btf })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BtfError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| BtfError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let graph = Self::from_bytes(&data)?;
        debug!("loaded BTF from {}", path.display());
        Ok(graph)
    }

    pub fn get(&self, id: TypeId) -> Option<Type> {
        self.btf.resolve_type_by_id(id).ok()
    }

    /// Name of a type or member; `None` when anonymous
    pub fn name<T: BtfType + ?Sized>(&self, ty: &T) -> Option<String> {
        self.btf.resolve_name(ty).ok().filter(|name| !name.is_empty())
    }

    /// All types carrying `name`, in id order
    pub fn ids_by_name(&self, name: &str) -> Vec<TypeId> {
        self.btf.resolve_ids_by_name(name).unwrap_or_default()
    }

    /// Complete definition of `struct tag` / `union tag`
    pub fn record(&self, kind: RecordKind, tag: &str) -> Option<TypeId> {
        self.ids_by_name(tag)
            .into_iter()
            .find(|&id| self.get(id).as_ref().and_then(record_kind) == Some(kind))
    }

    pub fn typedef(&self, name: &str) -> Option<TypeId> {
        self.ids_by_name(name)
            .into_iter()
            .find(|&id| matches!(self.get(id), Some(Type::Typedef(_))))
    }

    /// Follow typedefs, qualifiers and type tags down to the underlying type
    pub fn peel(&self, mut id: TypeId) -> Peeled {
        let mut typedef = None;
        for _ in 0..MAX_CHAIN {
            let Some(ty) = self.get(id) else { break };
            if typedef.is_none() {
                if let Type::Typedef(td) = &ty {
                    typedef = self.name(td);
                }
            }
            match modifier_target(&ty) {
                Some(next) => id = next,
                None => break,
            }
        }
        Peeled { id, typedef }
    }

    pub fn skip_modifiers(&self, id: TypeId) -> TypeId {
        self.peel(id).id
    }

    /// Whether a type tag named `tag` appears before the underlying type
    pub fn has_type_tag(&self, mut id: TypeId, tag: &str) -> bool {
        for _ in 0..MAX_CHAIN {
            let Some(ty) = self.get(id) else { return false };
            if let Type::TypeTag(tt) = &ty {
                if self.name(tt).as_deref() == Some(tag) {
                    return true;
                }
            }
            match modifier_target(&ty) {
                Some(next) => id = next,
                None => return false,
            }
        }
        false
    }

    /// The scalar a typedef names, if it names one
    pub fn typedef_shape(&self, name: &str) -> Option<TypedefShape> {
        let id = self.typedef(name)?;
        match self.get(self.skip_modifiers(id))? {
            Type::Int(int) if int.is_bool() => Some(TypedefShape::Bool),
            Type::Int(int) => Some(TypedefShape::Int {
                size: int.size(),
                signed: int.is_signed(),
            }),
            Type::Enum(e) => Some(TypedefShape::Int {
                size: e.size(),
                signed: e.is_signed(),
            }),
            Type::Enum64(e) => Some(TypedefShape::Int {
                size: e.size(),
                signed: e.is_signed(),
            }),
            Type::Ptr(_) => Some(TypedefShape::Pointer),
            _ => None,
        }
    }
}

/// Struct or union, for record types
pub fn record_kind(ty: &Type) -> Option<RecordKind> {
    match ty {
        Type::Struct(_) => Some(RecordKind::Struct),
        Type::Union(_) => Some(RecordKind::Union),
        _ => None,
    }
}

fn modifier_target(ty: &Type) -> Option<TypeId> {
    match ty {
        Type::Typedef(t) | Type::TypeTag(t) => t.get_type_id().ok(),
        Type::Const(q) | Type::Volatile(q) | Type::Restrict(q) => q.get_type_id().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::builder::BtfBuilder;
    use super::*;

    fn sample() -> BtfBuilder {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4, true);
        let ulong = b.int("unsigned long", 8, false);
        b.typedef("size_t", ulong);
        let cint = b.const_(int);
        b.typedef("cint_t", cint);
        let char_ = b.int("char", 1, true);
        let chars = b.array(char_, 16);
        let fwd = b.fwd(RecordKind::Struct, "Foo");
        let fwd_ptr = b.ptr(fwd);
        b.record(
            RecordKind::Struct,
            "Foo",
            32,
            &[("a", int, 0, 0), ("name", chars, 32, 0), ("next", fwd_ptr, 192, 0)],
        );
        b.enum_("E", 4, 2);
        b
    }

    fn members(graph: &BtfGraph, id: TypeId) -> Vec<(String, u32, Option<u32>)> {
        let Some(Type::Struct(s) | Type::Union(s)) = graph.get(id) else {
            panic!("type {id} is not a record");
        };
        s.members
            .iter()
            .map(|m| (graph.name(m).unwrap_or_default(), m.bit_offset(), m.bitfield_size()))
            .collect()
    }

    #[test]
    fn test_records_by_tag() {
        let graph = BtfGraph::from_bytes(&sample().build()).unwrap();

        let foo = graph.record(RecordKind::Struct, "Foo").unwrap();
        let names: Vec<_> = members(&graph, foo).into_iter().map(|m| (m.0, m.1)).collect();
        assert_eq!(
            names,
            vec![("a".to_string(), 0), ("name".to_string(), 32), ("next".to_string(), 192)]
        );

        // the forward declaration is not a definition
        assert_eq!(graph.ids_by_name("Foo").len(), 2);
        assert!(graph.record(RecordKind::Union, "Foo").is_none());
        assert!(graph.ids_by_name("missing").is_empty());
    }

    #[test]
    fn test_big_endian() {
        let graph = BtfGraph::from_bytes(&sample().build_big_endian()).unwrap();
        let foo = graph.record(RecordKind::Struct, "Foo").unwrap();
        assert_eq!(members(&graph, foo)[2].1, 192);
        assert!(graph.typedef("size_t").is_some());
    }

    #[test]
    fn test_typedef_shapes() {
        let mut b = sample();
        let bool_ = b.bool_("_Bool");
        b.typedef("bool", bool_);
        let void_ptr = b.ptr(0);
        b.typedef("uintptr", void_ptr);
        let e = b.enum_("state", 4, 2);
        b.typedef("state_t", e);
        let graph = BtfGraph::from_bytes(&b.build()).unwrap();

        assert_eq!(
            graph.typedef_shape("size_t"),
            Some(TypedefShape::Int {
                size: 8,
                signed: false
            })
        );
        assert_eq!(
            graph.typedef_shape("cint_t"),
            Some(TypedefShape::Int { size: 4, signed: true })
        );
        assert_eq!(graph.typedef_shape("bool"), Some(TypedefShape::Bool));
        assert_eq!(graph.typedef_shape("uintptr"), Some(TypedefShape::Pointer));
        assert_eq!(
            graph.typedef_shape("state_t"),
            Some(TypedefShape::Int {
                size: 4,
                signed: false
            })
        );
        assert_eq!(graph.typedef_shape("missing"), None);
    }

    #[test]
    fn test_peel_keeps_outer_typedef() {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4, true);
        let anon = b.record(RecordKind::Struct, "", 4, &[("v", int, 0, 0)]);
        let inner = b.typedef("inner_t", anon);
        let cq = b.const_(inner);
        let outer = b.typedef("outer_t", cq);
        let graph = BtfGraph::from_bytes(&b.build()).unwrap();

        let peeled = graph.peel(outer);
        assert_eq!(peeled.id, anon);
        assert_eq!(peeled.typedef.as_deref(), Some("outer_t"));
        assert_eq!(graph.peel(int), Peeled { id: int, typedef: None });
    }

    #[test]
    fn test_type_tags() {
        let mut b = BtfBuilder::new();
        let char_ = b.int("char", 1, true);
        let tagged = b.type_tag("user", char_);
        let cq = b.const_(tagged);
        let graph = BtfGraph::from_bytes(&b.build()).unwrap();
        assert!(graph.has_type_tag(cq, "user"));
        assert!(!graph.has_type_tag(char_, "user"));
        assert_eq!(graph.skip_modifiers(cq), char_);
    }

    #[test]
    fn test_kind_flag_bitfields() {
        let mut b = BtfBuilder::new();
        let uint = b.int("unsigned int", 4, false);
        let long = b.int("long", 8, true);
        let flags = b.record(
            RecordKind::Struct,
            "Flags",
            16,
            &[("a", uint, 0, 3), ("b", uint, 3, 5), ("c", long, 64, 0)],
        );
        let graph = BtfGraph::from_bytes(&b.build()).unwrap();
        let members = members(&graph, flags);
        assert_eq!((members[1].1, members[1].2), (3, Some(5)));
        // plain members of a kind_flag record report width 0
        assert_eq!((members[2].1, members[2].2), (64, Some(0)));
    }

    #[test]
    fn test_elf_section() {
        let blob = sample().build();
        let elf = BtfBuilder::wrap_in_elf(&blob);
        let graph = BtfGraph::from_bytes(&elf).unwrap();
        assert!(graph.record(RecordKind::Struct, "Foo").is_some());

        let other = BtfBuilder::elf_with_section(".BTF.ext", &blob);
        assert_eq!(BtfGraph::from_bytes(&other).unwrap_err(), BtfError::MissingSection);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmlinux");
        std::fs::write(&path, sample().build()).unwrap();
        let graph = BtfGraph::from_file(&path).unwrap();
        assert!(graph.typedef("size_t").is_some());

        let err = BtfGraph::from_file(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, BtfError::Io { .. }));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(BtfGraph::from_bytes(&[1, 2, 3, 4]), Err(BtfError::Parse(_))));
        assert!(matches!(BtfGraph::from_bytes(&[]), Err(BtfError::Parse(_))));

        let mut blob = sample().build();
        blob.truncate(blob.len() - 8);
        assert!(matches!(BtfGraph::from_bytes(&blob), Err(BtfError::Parse(_))));
    }
}
