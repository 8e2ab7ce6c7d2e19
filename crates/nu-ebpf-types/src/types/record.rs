//! Struct registry
//!
//! Every struct or union the tracing program may dereference ends up here,
//! keyed by its full name (`struct task_struct`, `union Foo`, a typedef
//! name, or a synthesized name for anonymous records). Record-typed fields
//! refer to entries by name only, so self-referential and mutually
//! referential records need no special handling.
//!
//! The registry is append-only: once a name is registered its entry is
//! never replaced.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use log::{debug, warn};

use super::field::Field;
use crate::error::LayoutError;
use crate::resolve::RecordDecl;

/// Whether a record is a struct or a union
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Struct,
    Union,
}

impl RecordKind {
    pub fn keyword(self) -> &'static str {
        match self {
            RecordKind::Struct => "struct",
            RecordKind::Union => "union",
        }
    }

    /// Split `struct foo` / `union foo` into kind and tag
    pub fn split_name(name: &str) -> Option<(RecordKind, &str)> {
        if let Some(tag) = name.strip_prefix("struct ") {
            Some((RecordKind::Struct, tag.trim()))
        } else if let Some(tag) = name.strip_prefix("union ") {
            Some((RecordKind::Union, tag.trim()))
        } else {
            None
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Name for a record without a tag.
///
/// `enclosing` is the registry name of the record the anonymous one is
/// declared in; its leading keyword is dropped, giving names such as
/// `struct Foo::(anonymous at definitions.h:2:14)`.
pub fn anonymous_record_name(kind: RecordKind, enclosing: Option<&str>, location: &str) -> String {
    match enclosing {
        Some(outer) => {
            let outer = RecordKind::split_name(outer).map_or(outer, |(_, tag)| tag);
            format!("{} {}::(anonymous at {})", kind, outer, location)
        }
        None => format!("{} (anonymous at {})", kind, location),
    }
}

/// Layout of one registered record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Struct {
    pub name: String,
    /// Size in bytes, including trailing padding
    pub size: usize,
    pub fields: HashMap<String, Field>,
}

impl Struct {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            fields: HashMap::new(),
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Fields ordered by offset, then by name
    pub fn sorted_fields(&self) -> Vec<(&str, &Field)> {
        let mut fields: Vec<_> = self
            .fields
            .iter()
            .map(|(name, field)| (name.as_str(), field))
            .collect();
        fields.sort_by(|a, b| a.1.offset.cmp(&b.1.offset).then(a.0.cmp(b.0)));
        fields
    }
}

impl fmt::Display for Struct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {{ // size {}", self.name, self.size)?;
        for (name, field) in self.sorted_fields() {
            match field.bitfield {
                Some(bf) => writeln!(
                    f,
                    "    {} {}; // offset {}, bits {}..{}",
                    field.ty,
                    name,
                    field.offset,
                    bf.access_rshift,
                    bf.access_rshift + bf.mask.count_ones() as usize
                )?,
                None => writeln!(f, "    {} {}; // offset {}", field.ty, name, field.offset)?,
            }
        }
        write!(f, "}}")
    }
}

/// Name-keyed table of resolved records
#[derive(Debug, Clone, Default)]
pub struct StructRegistry {
    structs: HashMap<String, Struct>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Struct> {
        self.structs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.structs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Struct)> {
        self.structs.iter().map(|(name, s)| (name.as_str(), s))
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.structs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Register an already-built entry. Returns `false`, leaving the
    /// existing entry untouched, if the name is taken.
    pub fn insert(&mut self, record: Struct) -> bool {
        match self.structs.entry(record.name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Turn an adapter's record description into a registry entry.
    ///
    /// Named members become fields, bit-fields get their load window
    /// computed, and unnamed record-typed members are flattened: the nested
    /// record's fields are copied in with their offsets moved by the
    /// member's own offset. The nested record must already be registered,
    /// which adapters guarantee by listing inner records first.
    ///
    /// Returns `Ok(false)` if the name was already registered.
    pub fn insert_decl(&mut self, decl: RecordDecl) -> Result<bool, LayoutError> {
        if self.structs.contains_key(&decl.name) {
            return Ok(false);
        }

        let mut record = Struct::new(decl.name, decl.size);
        for member in decl.members {
            match member.name {
                Some(name) => {
                    let field = match member.bit_width {
                        Some(width) => Field::bitfield(member.ty, member.bit_offset, width)
                            .ok_or_else(|| LayoutError::UnsupportedBitfield {
                                record: record.name.clone(),
                                member: name.clone(),
                                bit_offset: member.bit_offset,
                                width,
                            })?,
                        None => Field::new(member.ty, member.bit_offset / 8),
                    };
                    record.fields.insert(name, field);
                }
                None if member.ty.is_record() => {
                    let nested_name = member.ty.record_name();
                    let Some(nested) = self.structs.get(nested_name) else {
                        warn!(
                            "{}: anonymous member {} is not registered, its fields are skipped",
                            record.name, nested_name
                        );
                        continue;
                    };
                    let base = member.bit_offset / 8;
                    for (name, field) in &nested.fields {
                        record.fields.insert(name.clone(), field.shifted(base));
                    }
                }
                // Unnamed bit-fields only pad
                None => {}
            }
        }

        debug!(
            "registered {} (size {}, {} fields)",
            record.name,
            record.size,
            record.fields.len()
        );
        self.structs.insert(record.name.clone(), record);
        Ok(true)
    }
}

impl fmt::Display for StructRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names().into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            if let Some(record) = self.structs.get(name) {
                writeln!(f, "{}", record)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::MemberDecl;
    use crate::types::SizedType;

    fn int_member(name: &str, bit_offset: usize) -> MemberDecl {
        MemberDecl::named(name, SizedType::int32(), bit_offset)
    }

    #[test]
    fn test_anonymous_names() {
        assert_eq!(
            anonymous_record_name(RecordKind::Struct, Some("struct Foo"), "definitions.h:2:14"),
            "struct Foo::(anonymous at definitions.h:2:14)"
        );
        assert_eq!(
            anonymous_record_name(
                RecordKind::Union,
                Some("struct Foo::(anonymous at definitions.h:1:1)"),
                "definitions.h:1:20"
            ),
            "union Foo::(anonymous at definitions.h:1:1)::(anonymous at definitions.h:1:20)"
        );
        assert_eq!(
            anonymous_record_name(RecordKind::Struct, None, "a.h:3:1"),
            "struct (anonymous at a.h:3:1)"
        );
    }

    #[test]
    fn test_insert_is_memoized() {
        let mut registry = StructRegistry::new();
        let decl = RecordDecl::new("struct Foo", 4, vec![int_member("x", 0)]);
        assert!(registry.insert_decl(decl).unwrap());

        let other = RecordDecl::new("struct Foo", 8, vec![int_member("y", 32)]);
        assert!(!registry.insert_decl(other).unwrap());

        let foo = registry.get("struct Foo").unwrap();
        assert_eq!(foo.size, 4);
        assert!(foo.has_field("x"));
        assert!(!foo.has_field("y"));
    }

    #[test]
    fn test_flattening_moves_offsets() {
        let mut registry = StructRegistry::new();
        let inner_name = "struct Foo::(anonymous at t.h:1:20)";
        let inner = RecordDecl::new(
            inner_name,
            8,
            vec![int_member("x", 0), int_member("y", 32)],
        );
        let outer = RecordDecl::new(
            "struct Foo",
            16,
            vec![
                int_member("a", 0),
                MemberDecl::anonymous(SizedType::record(8, inner_name), 64),
            ],
        );
        registry.insert_decl(inner).unwrap();
        registry.insert_decl(outer).unwrap();

        let foo = registry.get("struct Foo").unwrap();
        assert_eq!(foo.fields.len(), 3);
        assert_eq!(foo.get_field("x").unwrap().offset, 8);
        assert_eq!(foo.get_field("y").unwrap().offset, 12);
        // The anonymous record stays queryable on its own
        assert_eq!(registry.get(inner_name).unwrap().fields.len(), 2);
    }

    #[test]
    fn test_named_record_member_not_flattened() {
        let mut registry = StructRegistry::new();
        registry
            .insert_decl(RecordDecl::new("struct Bar", 4, vec![int_member("x", 0)]))
            .unwrap();
        registry
            .insert_decl(RecordDecl::new(
                "struct Foo",
                4,
                vec![MemberDecl::named(
                    "bar",
                    SizedType::record(4, "struct Bar"),
                    0,
                )],
            ))
            .unwrap();

        let foo = registry.get("struct Foo").unwrap();
        assert_eq!(foo.fields.len(), 1);
        assert!(foo.get_field("bar").unwrap().ty.is_record());
        assert!(!foo.has_field("x"));
    }

    #[test]
    fn test_bitfield_members() {
        let mut registry = StructRegistry::new();
        let decl = RecordDecl::new(
            "struct Foo",
            4,
            vec![
                MemberDecl::bitfield("a", SizedType::int32(), 0, 8),
                MemberDecl::bitfield("c", SizedType::int32(), 16, 16),
                MemberDecl {
                    name: None,
                    ty: SizedType::int32(),
                    bit_offset: 8,
                    bit_width: Some(8),
                },
            ],
        );
        registry.insert_decl(decl).unwrap();
        let foo = registry.get("struct Foo").unwrap();
        assert_eq!(foo.fields.len(), 2);
        let c = foo.get_field("c").unwrap();
        assert_eq!(c.offset, 2);
        assert_eq!(c.bitfield.unwrap().read_bytes, 2);
    }

    #[test]
    fn test_unsupported_bitfield() {
        let mut registry = StructRegistry::new();
        let decl = RecordDecl::new(
            "struct Packed",
            16,
            vec![MemberDecl::bitfield("wide", SizedType::uint64(), 60, 64)],
        );
        let err = registry.insert_decl(decl).unwrap_err();
        assert!(matches!(err, LayoutError::UnsupportedBitfield { .. }));
        assert!(!registry.contains("struct Packed"));
    }

    #[test]
    fn test_display_sorted_by_offset() {
        let mut registry = StructRegistry::new();
        registry
            .insert_decl(RecordDecl::new(
                "struct Foo",
                8,
                vec![int_member("b", 32), int_member("a", 0)],
            ))
            .unwrap();
        let text = registry.to_string();
        let a = text.find("int32 a;").unwrap();
        let b = text.find("int32 b;").unwrap();
        assert!(a < b);
        assert!(text.starts_with("struct Foo { // size 8"));
    }
}
