//! Header frontend
//!
//! Compiles the C definitions a traced program carries at its top and
//! reports every record they define. The unit is compiled once, on first
//! use; all records are handed to the resolver up front through
//! [`TypeAdapter::preload`], so demand lookups only ever see names the unit
//! does not define.
//!
//! The compiler is deliberately small: a preprocessor serving a fixed set
//! of built-in headers, a declaration parser, and an LP64 layout engine.

mod builtins;
mod layout;
mod lexer;
mod parser;
mod preprocess;

use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Diagnostic, LayoutError};
use crate::kernel_btf::{BtfGraph, TypedefShape};
use crate::resolve::{MemberDecl, RecordDecl, ResolverConfig, TypeAdapter};
use crate::types::{AddrSpace, SizedType, anonymous_record_name};
use layout::{CType, RecordDef};
use parser::{TypedefFallback, Unit};

/// Result of compiling the unit
#[derive(Debug, Default)]
struct Compiled {
    /// Complete records, each preceded by the anonymous records it embeds
    decls: Vec<RecordDecl>,
    index: HashMap<String, usize>,
    macros: BTreeMap<String, String>,
    diagnostics: Vec<Diagnostic>,
}

/// Record layouts from header text
pub struct HeaderAdapter {
    unit_name: Arc<str>,
    source: String,
    debug_info: Option<Arc<BtfGraph>>,
    compiled: OnceCell<Compiled>,
}

impl HeaderAdapter {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            unit_name: Arc::from(ResolverConfig::default().unit_name.as_str()),
            source: source.into(),
            debug_info: None,
            compiled: OnceCell::new(),
        }
    }

    pub fn from_config(source: impl Into<String>, config: &ResolverConfig) -> Self {
        Self::new(source).with_unit_name(&config.unit_name)
    }

    /// File name used in diagnostics and anonymous record names
    pub fn with_unit_name(mut self, name: &str) -> Self {
        self.unit_name = Arc::from(name);
        self.compiled = OnceCell::new();
        self
    }

    /// Resolve type names the text uses but never defines (`size_t`
    /// without `#include <stddef.h>`) from debug-info typedefs.
    pub fn with_debug_info(mut self, graph: Arc<BtfGraph>) -> Self {
        self.debug_info = Some(graph);
        self.compiled = OnceCell::new();
        self
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// Object-like and function-like macros defined by the text itself,
    /// with their replacement text
    pub fn macros(&self) -> &BTreeMap<String, String> {
        &self.compiled().macros
    }

    /// Problems found while compiling. Empty when the text is well formed.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.compiled().diagnostics
    }

    /// Whether the text defines any record, or fails trying to
    pub fn defines_records(&self) -> bool {
        let compiled = self.compiled();
        !compiled.decls.is_empty() || !compiled.diagnostics.is_empty()
    }

    fn compiled(&self) -> &Compiled {
        self.compiled.get_or_init(|| self.compile())
    }

    fn compile(&self) -> Compiled {
        let pre = preprocess::preprocess(&self.unit_name, &self.source);
        let mut compiled = Compiled {
            macros: pre.macros,
            diagnostics: pre.diagnostics,
            ..Compiled::default()
        };
        if !compiled.diagnostics.is_empty() {
            return compiled;
        }

        let fallback = self.debug_info.as_deref().map(DebugInfoTypedefs);
        let unit = match parser::parse_unit(pre.tokens, fallback.as_ref().map(|f| f as &dyn TypedefFallback)) {
            Ok(unit) => unit,
            Err(diagnostic) => {
                compiled.diagnostics.push(diagnostic);
                return compiled;
            }
        };

        let mut emitter = Emitter::new(&unit);
        for id in 0..unit.records.len() {
            emitter.emit(id);
        }
        compiled.decls = emitter.decls;
        compiled.index = compiled
            .decls
            .iter()
            .enumerate()
            .map(|(i, decl)| (decl.name.clone(), i))
            .collect();
        debug!(
            "{}: {} record(s), {} macro(s)",
            self.unit_name,
            compiled.decls.len(),
            compiled.macros.len()
        );
        compiled
    }

    fn malformed(&self) -> LayoutError {
        LayoutError::MalformedSource {
            unit: self.unit_name.to_string(),
            diagnostics: self.compiled().diagnostics.clone(),
        }
    }

    /// `decl` preceded by the anonymous records it embeds, innermost first
    fn with_embedded(&self, compiled: &Compiled, at: usize, out: &mut Vec<RecordDecl>) {
        let decl = &compiled.decls[at];
        for member in decl.members.iter().filter(|m| m.name.is_none() && m.ty.is_record()) {
            if let Some(&inner) = compiled.index.get(member.ty.record_name()) {
                self.with_embedded(compiled, inner, out);
            }
        }
        out.push(decl.clone());
    }
}

impl TypeAdapter for HeaderAdapter {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn preload(&mut self) -> Result<Vec<RecordDecl>, LayoutError> {
        let compiled = self.compiled();
        if !compiled.diagnostics.is_empty() {
            return Err(self.malformed());
        }
        Ok(compiled.decls.clone())
    }

    fn resolve(&mut self, name: &str) -> Result<Option<Vec<RecordDecl>>, LayoutError> {
        let compiled = self.compiled();
        if !compiled.diagnostics.is_empty() {
            return Ok(None);
        }
        let Some(&at) = compiled.index.get(name) else {
            return Ok(None);
        };
        let mut out = Vec::new();
        self.with_embedded(compiled, at, &mut out);
        Ok(Some(out))
    }
}

/// Typedefs of integer or pointer shape from a debug-info graph
struct DebugInfoTypedefs<'a>(&'a BtfGraph);

impl TypedefFallback for DebugInfoTypedefs<'_> {
    fn typedef(&self, name: &str) -> Option<CType> {
        let shape = self.0.typedef_shape(name)?;
        debug!("typedef {name} taken from debug info");
        Some(match shape {
            TypedefShape::Int { size, signed } => CType::Int { size, signed },
            TypedefShape::Bool => CType::Bool,
            TypedefShape::Pointer => CType::Pointer(Box::new(CType::Void)),
        })
    }
}

/// Turns parsed records into declarations, registry names included
struct Emitter<'u> {
    records: &'u [RecordDef],
    names: Vec<String>,
    emitted: Vec<bool>,
    decls: Vec<RecordDecl>,
}

impl<'u> Emitter<'u> {
    fn new(unit: &'u Unit) -> Self {
        // Enclosing records always come first in the table
        let mut names: Vec<String> = Vec::with_capacity(unit.records.len());
        for def in &unit.records {
            let name = match (&def.tag, &def.typedef_name) {
                (Some(tag), _) => format!("{} {tag}", def.kind),
                (None, Some(typedef)) => typedef.clone(),
                (None, None) => anonymous_record_name(
                    def.kind,
                    def.enclosing.map(|e| names[e].as_str()),
                    &def.location.to_string(),
                ),
            };
            names.push(name);
        }
        Self {
            records: &unit.records,
            names,
            emitted: vec![false; unit.records.len()],
            decls: Vec::new(),
        }
    }

    fn emit(&mut self, id: usize) {
        if self.emitted[id] {
            return;
        }
        self.emitted[id] = true;
        let records = self.records;
        let def = &records[id];
        let Some(layout) = &def.layout else {
            return;
        };

        let mut members = Vec::with_capacity(def.members.len());
        for (member, &bit_offset) in def.members.iter().zip(&layout.bit_offsets) {
            let ty = self.sized(&member.ty);
            match (&member.name, member.bit_width) {
                (Some(name), Some(width)) => members.push(MemberDecl::bitfield(name, ty, bit_offset, width)),
                (Some(name), None) => members.push(MemberDecl::named(name, ty, bit_offset)),
                (None, None) => {
                    if let CType::Record(inner) = member.ty {
                        self.emit(inner);
                    }
                    members.push(MemberDecl::anonymous(ty, bit_offset));
                }
                // Unnamed bit-fields only pad
                (None, Some(_)) => {}
            }
        }
        self.decls.push(RecordDecl::new(self.names[id].clone(), layout.size, members));
    }

    fn sized(&self, ty: &CType) -> SizedType {
        match ty {
            CType::Void | CType::Function => SizedType::none(),
            CType::Float(size) => SizedType::opaque(*size),
            CType::Bool => SizedType::integer(8, false),
            CType::Int { size, signed } => SizedType::integer(size * 8, *signed),
            CType::Enum => SizedType::uint32(),
            CType::Pointer(inner) => SizedType::pointer(self.sized(inner), AddrSpace::None),
            CType::Array(element, count) => {
                let count = count.unwrap_or(0);
                match element.as_ref() {
                    CType::Int { size: 1, .. } => SizedType::string(count),
                    // laid out already, so the size fits
                    element => SizedType::array(count, self.sized(element)).unwrap_or_else(SizedType::none),
                }
            }
            CType::Record(id) => {
                let size = self.records[*id].layout.as_ref().map_or(0, |l| l.size);
                if size == 0 && self.records[*id].layout.is_none() {
                    warn!("{} is incomplete, its size is unknown", self.names[*id]);
                }
                SizedType::record(size, self.names[*id].as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Struct, StructRegistry, TypeKind};

    fn registry(text: &str) -> StructRegistry {
        let mut adapter = HeaderAdapter::new(text);
        let mut registry = StructRegistry::new();
        for decl in adapter.preload().unwrap() {
            registry.insert_decl(decl).unwrap();
        }
        registry
    }

    fn record<'r>(registry: &'r StructRegistry, name: &str) -> &'r Struct {
        registry
            .get(name)
            .unwrap_or_else(|| panic!("{name} missing from {:?}", registry.names()))
    }

    fn assert_int(record: &Struct, field: &str, size: usize, offset: usize) {
        let f = record.get_field(field).unwrap();
        assert_eq!(f.ty.kind(), TypeKind::Integer, "{field}");
        assert_eq!(f.ty.size(), size, "{field}");
        assert_eq!(f.offset, offset, "{field}");
    }

    fn assert_bits(record: &Struct, field: &str, offset: usize, read_bytes: usize, rshift: usize, mask: u64) {
        let f = record.get_field(field).unwrap();
        assert_eq!(f.ty.size(), 4, "{field}");
        assert_eq!(f.offset, offset, "{field}");
        let bf = f.bitfield.unwrap();
        assert_eq!((bf.read_bytes, bf.access_rshift, bf.mask), (read_bytes, rshift, mask), "{field}");
    }

    #[test]
    fn test_integers() {
        let r = registry("struct Foo { int x; int y, z; }");
        assert_eq!(r.len(), 1);
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 12);
        assert_eq!(foo.fields.len(), 3);
        assert_int(foo, "x", 4, 0);
        assert_int(foo, "y", 4, 4);
        assert_int(foo, "z", 4, 8);
    }

    #[test]
    fn test_union() {
        let r = registry("union Foo { char c; short s; int i; long l; }");
        let foo = record(&r, "union Foo");
        assert_eq!(foo.size, 8);
        assert_int(foo, "c", 1, 0);
        assert_int(foo, "s", 2, 0);
        assert_int(foo, "i", 4, 0);
        assert_int(foo, "l", 8, 0);
    }

    #[test]
    fn test_enum_member() {
        let r = registry("enum E {NONE}; struct Foo { enum E e; }");
        assert_eq!(r.len(), 1);
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 4);
        assert_int(foo, "e", 4, 0);
        assert!(!foo.get_field("e").unwrap().ty.is_signed());
    }

    #[test]
    fn test_pointers() {
        let r = registry("struct Foo { int *x; char *str; void (*cb)(int); }");
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 24);

        let x = &foo.get_field("x").unwrap().ty;
        assert!(x.is_ptr());
        assert_eq!(x.pointee().int_bit_width(), 32);
        assert_eq!(x.addr_space(), AddrSpace::None);

        let s = &foo.get_field("str").unwrap().ty;
        assert!(s.pointee().is_int());
        assert_eq!(s.pointee().int_bit_width(), 8);

        let cb = foo.get_field("cb").unwrap();
        assert!(cb.ty.is_ptr());
        assert!(cb.ty.pointee().is_none());
        assert_eq!(cb.offset, 16);
    }

    #[test]
    fn test_arrays() {
        let r = registry("struct Foo { char str[32]; int v[3]; double d; }");
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 56);

        let s = foo.get_field("str").unwrap();
        assert!(s.ty.is_string());
        assert_eq!(s.ty.size(), 32);

        let v = foo.get_field("v").unwrap();
        assert!(v.ty.is_array());
        assert_eq!(v.ty.num_elements(), 3);
        assert_eq!(v.offset, 32);

        // floating point has no representation, the offset is still exact
        let d = foo.get_field("d").unwrap();
        assert!(d.ty.is_none());
        assert_eq!(d.offset, 48);
    }

    #[test]
    fn test_nested_named_records() {
        let r = registry("struct Bar { int x; } struct Foo { struct Bar bar; struct Bar *ptr; }");
        assert_eq!(r.len(), 2);
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 16);

        let bar = foo.get_field("bar").unwrap();
        assert!(bar.ty.is_record());
        assert_eq!(bar.ty.record_name(), "struct Bar");
        assert_eq!(bar.ty.size(), 4);

        let ptr = foo.get_field("ptr").unwrap();
        assert!(ptr.ty.pointee().is_record());
        assert_eq!(ptr.ty.pointee().record_name(), "struct Bar");
        assert_eq!(ptr.ty.pointee().size(), 4);
        assert_eq!(ptr.offset, 8);
    }

    #[test]
    fn test_untagged_member_records() {
        let r = registry("struct Foo { struct { int x; } bar; union { int y; } baz; }");
        let bar = "struct Foo::(anonymous at definitions.h:1:14)";
        let baz = "union Foo::(anonymous at definitions.h:1:37)";
        assert_eq!(r.len(), 3);

        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 8);
        assert_eq!(foo.fields.len(), 2);
        let f = foo.get_field("bar").unwrap();
        assert_eq!(f.ty.record_name(), bar);
        assert_eq!((f.ty.size(), f.offset), (4, 0));
        let f = foo.get_field("baz").unwrap();
        assert_eq!(f.ty.record_name(), baz);
        assert_eq!((f.ty.size(), f.offset), (4, 4));

        assert_int(record(&r, bar), "x", 4, 0);
        assert_int(record(&r, baz), "y", 4, 0);
    }

    #[test]
    fn test_anonymous_members_flatten() {
        let r = registry(
            "struct Foo {\
               struct { int x; int y; };\
               int a;\
               struct Bar { int z; };\
             }",
        );
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 12);
        assert_eq!(foo.fields.len(), 3);
        assert_int(foo, "x", 4, 0);
        assert_int(foo, "y", 4, 4);
        assert_int(foo, "a", 4, 8);

        // a definition inside the body is not a member
        let bar = record(&r, "struct Bar");
        assert_eq!(bar.size, 4);
        assert_int(bar, "z", 4, 0);
        // the anonymous struct is registered too
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_anonymous_members_nested() {
        let r = registry(
            "struct Foo {\
               union {\
                 long long _xy;\
                 struct { int x; int y;};\
               };\
               int a;\
               struct { int z; };\
             }",
        );
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 16);
        assert_eq!(foo.fields.len(), 5);
        assert_int(foo, "_xy", 8, 0);
        assert_int(foo, "x", 4, 0);
        assert_int(foo, "y", 4, 4);
        assert_int(foo, "a", 4, 8);
        assert_int(foo, "z", 4, 12);
    }

    #[test]
    fn test_bitfields() {
        let r = registry("struct Foo { int a:8, b:8, c:16; }");
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 4);
        assert_bits(foo, "a", 0, 1, 0, 0xFF);
        assert_bits(foo, "b", 1, 1, 0, 0xFF);
        assert_bits(foo, "c", 2, 2, 0, 0xFFFF);
    }

    #[test]
    fn test_bitfields_uneven() {
        let r = registry("struct Foo { int a:1, b:1, c:3, d:20, e:7; }");
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 4);
        assert_bits(foo, "a", 0, 1, 0, 0x1);
        assert_bits(foo, "b", 0, 1, 1, 0x1);
        assert_bits(foo, "c", 0, 1, 2, 0x7);
        assert_bits(foo, "d", 0, 4, 5, 0xFFFFF);
        assert_bits(foo, "e", 3, 1, 1, 0x7F);
    }

    #[test]
    fn test_bitfields_with_padding() {
        let r = registry("struct Foo { int pad; int a:28, b:4; long int end;}");
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 16);
        assert_eq!(foo.fields.len(), 4);
        assert_bits(foo, "a", 4, 4, 0, 0xFFFFFFF);
        assert_bits(foo, "b", 7, 1, 4, 0xF);
        assert_int(foo, "end", 8, 8);
    }

    #[test]
    fn test_unnamed_bitfields_are_not_members() {
        let r = registry("struct Foo { char a:3; int :0; char b:2; }");
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.fields.len(), 2);
        assert_eq!(foo.get_field("b").unwrap().offset, 4);
    }

    #[test]
    fn test_builtin_headers() {
        let r = registry("#include <stddef.h>\nstruct Foo { size_t x, y, z; }");
        let foo = record(&r, "struct Foo");
        assert_eq!(foo.size, 24);
        assert_int(foo, "x", 8, 0);
        assert_int(foo, "y", 8, 8);
        assert_int(foo, "z", 8, 16);
        assert!(!foo.get_field("x").unwrap().ty.is_signed());
    }

    #[test]
    fn test_struct_and_typedef_share_a_tag() {
        let r = registry("#include <__stddef_max_align_t.h>\nstruct max_align_t { int x; };");
        assert_eq!(r.len(), 2);

        let tagged = record(&r, "struct max_align_t");
        assert_eq!(tagged.size, 4);
        assert_int(tagged, "x", 4, 0);

        let typedef = record(&r, "max_align_t");
        assert_eq!(typedef.size, 32);
        assert_eq!(typedef.fields.len(), 2);
        assert_int(typedef, "__clang_max_align_nonce1", 8, 0);
        let nonce2 = typedef.get_field("__clang_max_align_nonce2").unwrap();
        assert!(nonce2.ty.is_none());
        assert_eq!(nonce2.ty.size(), 16);
        assert_eq!(nonce2.offset, 16);
    }

    #[test]
    fn test_qualifiers() {
        let r = registry(
            "struct a {int a} struct b { volatile const struct a* restrict a; const struct a a2; };",
        );
        let b = record(&r, "struct b");
        assert_eq!(b.size, 16);
        assert_eq!(b.fields.len(), 2);
        let a = &b.get_field("a").unwrap().ty;
        assert!(a.is_ptr());
        assert_eq!(a.pointee().record_name(), "struct a");
        let a2 = &b.get_field("a2").unwrap().ty;
        assert!(a2.is_record());
        assert_eq!(a2.record_name(), "struct a");
    }

    #[test]
    fn test_macros() {
        let adapter = HeaderAdapter::new("#define FOO size_t\n#define _UNDERSCORE 314\n");
        assert_eq!(adapter.macros().get("FOO").map(String::as_str), Some("size_t"));
        assert_eq!(adapter.macros().get("_UNDERSCORE").map(String::as_str), Some("314"));
        assert!(!adapter.defines_records());
    }

    #[test]
    fn test_malformed_source() {
        let mut adapter = HeaderAdapter::new("struct a { int a; struct b b; };");
        assert!(adapter.defines_records());
        match adapter.preload() {
            Err(LayoutError::MalformedSource { unit, diagnostics }) => {
                assert_eq!(unit, "definitions.h");
                assert_eq!(diagnostics.len(), 1);
                assert_eq!(
                    diagnostics[0].to_string(),
                    "definitions.h:1:28: error: field has incomplete type 'struct b'"
                );
            }
            other => panic!("expected MalformedSource, got {other:?}"),
        }
        // demand lookups against a broken unit are soft
        assert!(adapter.resolve("struct a").unwrap().is_none());
    }

    #[test]
    fn test_array_too_large() {
        let mut adapter = HeaderAdapter::new("struct Foo { long x[1L << 61]; long y; };");
        match adapter.preload() {
            Err(LayoutError::MalformedSource { diagnostics, .. }) => {
                assert_eq!(diagnostics.len(), 1);
                assert_eq!(
                    diagnostics[0].to_string(),
                    "definitions.h:1:19: error: array is too large"
                );
            }
            other => panic!("expected MalformedSource, got {other:?}"),
        }
    }

    /// Member sizes plus padding add up to the record size, and no gap is
    /// as wide as the largest alignment
    fn assert_sizes_add_up(record: &Struct) {
        const MAX_ALIGN: usize = 16;
        if record.name.starts_with("union ") {
            let largest = record.fields.values().map(|f| f.ty.size()).max().unwrap_or(0);
            assert!(record.fields.values().all(|f| f.offset == 0), "{record}");
            assert!(record.size >= largest && record.size - largest < MAX_ALIGN, "{record}");
            return;
        }

        let (mut end, mut members, mut padding) = (0, 0, 0);
        for (name, field) in record.sorted_fields() {
            assert!(field.bitfield.is_none(), "{}.{name}", record.name);
            assert!(field.offset >= end, "{}.{name} overlaps", record.name);
            assert!(field.offset - end < MAX_ALIGN, "{}.{name}", record.name);
            padding += field.offset - end;
            members += field.ty.size();
            end = field.offset + field.ty.size();
        }
        assert!(record.size >= end && record.size - end < MAX_ALIGN, "{record}");
        padding += record.size - end;
        assert_eq!(members + padding, record.size, "{record}");
    }

    #[test]
    fn test_sizes_add_up() {
        let r = registry(
            "#include <__stddef_max_align_t.h>
            struct Pad { char c; long l; int i; };
            struct Arrays { char tag; short s[3]; long l[2]; char name[5]; };
            union U { char c; int i[3]; long l; };
            struct Outer { char c; struct Pad pad; union U u; max_align_t m; };",
        );
        assert_eq!(r.len(), 5);
        assert_eq!(record(&r, "struct Arrays").size, 32);
        assert_eq!(record(&r, "union U").size, 16);
        let outer = record(&r, "struct Outer");
        assert_eq!(outer.get_field("m").unwrap().offset, 48);
        assert_eq!(outer.size, 80);

        for (_, s) in r.iter() {
            assert_sizes_add_up(s);
        }
    }

    #[test]
    fn test_resolve_includes_embedded_records() {
        let mut adapter = HeaderAdapter::new("struct Foo { struct { int x; }; int y; };").with_unit_name("program.h");
        let decls = adapter.resolve("struct Foo").unwrap().unwrap();
        let names: Vec<_> = decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["struct Foo::(anonymous at program.h:1:14)", "struct Foo"]);
        assert!(adapter.resolve("struct Missing").unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_name() {
        let adapter = HeaderAdapter::new("struct Foo { size_t x; };");
        assert_eq!(
            adapter.diagnostics()[0].to_string(),
            "definitions.h:1:14: error: unknown type name 'size_t'"
        );
    }
}
