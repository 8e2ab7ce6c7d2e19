//! In-memory BTF blobs for tests

use object::write::Object;
use object::{Architecture, BinaryFormat, Endianness, SectionKind};

use super::graph::TypeId;
use crate::types::RecordKind;

/// Member as (name, type, bit offset, bit-field width); "" is unnamed and
/// width 0 is not a bit-field
pub type MemberSpec<'a> = (&'a str, TypeId, u32, u32);

pub struct BtfBuilder {
    /// Type section as 32-bit words, serialized at build time
    words: Vec<u32>,
    strings: Vec<u8>,
    next_id: TypeId,
}

impl BtfBuilder {
    pub fn new() -> Self {
        Self {
            words: Vec::new(),
            strings: vec![0],
            next_id: 1,
        }
    }

    fn name(&mut self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        offset
    }

    fn add(&mut self, name: &str, kind: u32, vlen: usize, kind_flag: bool, size_or_type: u32, extra: &[u32]) -> TypeId {
        let name_off = self.name(name);
        let info = (u32::from(kind_flag) << 31) | (kind << 24) | vlen as u32;
        self.words.extend_from_slice(&[name_off, info, size_or_type]);
        self.words.extend_from_slice(extra);
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn int(&mut self, name: &str, size: u32, signed: bool) -> TypeId {
        let encoding = (u32::from(signed) << 24) | (size * 8);
        self.add(name, 1, 0, false, size, &[encoding])
    }

    pub fn bool_(&mut self, name: &str) -> TypeId {
        self.add(name, 1, 0, false, 1, &[(4 << 24) | 8])
    }

    pub fn ptr(&mut self, target: TypeId) -> TypeId {
        self.add("", 2, 0, false, target, &[])
    }

    pub fn array(&mut self, element: TypeId, count: u32) -> TypeId {
        self.add("", 3, 0, false, 0, &[element, element, count])
    }

    pub fn record(&mut self, kind: RecordKind, name: &str, size: u32, members: &[MemberSpec<'_>]) -> TypeId {
        let kind_flag = members.iter().any(|m| m.3 != 0);
        let mut extra = Vec::with_capacity(members.len() * 3);
        for &(member, ty, bit_offset, width) in members {
            let offset = if kind_flag { (width << 24) | bit_offset } else { bit_offset };
            extra.extend_from_slice(&[self.name(member), ty, offset]);
        }
        let code = match kind {
            RecordKind::Struct => 4,
            RecordKind::Union => 5,
        };
        self.add(name, code, members.len(), kind_flag, size, &extra)
    }

    pub fn enum_(&mut self, name: &str, size: u32, values: usize) -> TypeId {
        let mut extra = Vec::with_capacity(values * 2);
        for value in 0..values {
            let label = self.name(&format!("{name}_{value}"));
            extra.extend_from_slice(&[label, value as u32]);
        }
        self.add(name, 6, values, false, size, &extra)
    }

    pub fn fwd(&mut self, kind: RecordKind, name: &str) -> TypeId {
        self.add(name, 7, 0, kind == RecordKind::Union, 0, &[])
    }

    pub fn typedef(&mut self, name: &str, target: TypeId) -> TypeId {
        self.add(name, 8, 0, false, target, &[])
    }

    pub fn const_(&mut self, target: TypeId) -> TypeId {
        self.add("", 10, 0, false, target, &[])
    }

    pub fn float(&mut self, name: &str, size: u32) -> TypeId {
        self.add(name, 16, 0, false, size, &[])
    }

    pub fn type_tag(&mut self, tag: &str, target: TypeId) -> TypeId {
        self.add(tag, 18, 0, false, target, &[])
    }

    /// A function prototype; only pointers to it are ever mapped
    pub fn func_proto(&mut self, ret: TypeId, params: &[TypeId]) -> TypeId {
        let extra: Vec<u32> = params.iter().flat_map(|&p| [0, p]).collect();
        self.add("", 13, params.len(), false, ret, &extra)
    }

    pub fn build(&self) -> Vec<u8> {
        self.serialize(u32::to_le_bytes)
    }

    pub fn build_big_endian(&self) -> Vec<u8> {
        self.serialize(u32::to_be_bytes)
    }

    fn serialize(&self, word: fn(u32) -> [u8; 4]) -> Vec<u8> {
        let type_len = self.words.len() as u32 * 4;
        let mut out = Vec::new();
        // magic, version 1, flags 0; the magic is a u16 in the same order
        let magic = word(0xEB9F);
        if word(1)[0] == 1 {
            out.extend_from_slice(&[magic[0], magic[1]]);
        } else {
            out.extend_from_slice(&[magic[2], magic[3]]);
        }
        out.extend_from_slice(&[1, 0]);
        for field in [24, 0, type_len, type_len, self.strings.len() as u32] {
            out.extend_from_slice(&word(field));
        }
        for &w in &self.words {
            out.extend_from_slice(&word(w));
        }
        out.extend_from_slice(&self.strings);
        out
    }

    /// A BPF ELF object carrying `blob` as its `.BTF` section
    pub fn wrap_in_elf(blob: &[u8]) -> Vec<u8> {
        Self::elf_with_section(".BTF", blob)
    }

    pub fn elf_with_section(name: &str, blob: &[u8]) -> Vec<u8> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);
        let section = obj.add_section(vec![], name.as_bytes().to_vec(), SectionKind::Metadata);
        obj.append_section_data(section, blob, 1);
        obj.write().unwrap()
    }
}
