//! C type model and LP64 record layout
//!
//! Layout follows the SysV x86-64 rules, which are also what clang and gcc
//! use on the other LP64 Linux targets:
//! - members are placed at the next multiple of their alignment
//! - a bit-field that would straddle a storage unit of its declared type
//!   moves to the start of the next unit
//! - a zero-width bit-field pads to the alignment of its type
//! - unnamed bit-fields do not affect the record's alignment
//! - `packed` drops member alignment to 1, `aligned(N)` raises it

use crate::error::SourceLocation;
use crate::types::RecordKind;

/// Index into the unit's record table
pub type RecordId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum CType {
    Void,
    Bool,
    Int { size: usize, signed: bool },
    Float(usize),
    Enum,
    Pointer(Box<CType>),
    Function,
    /// `None` count is a flexible array member
    Array(Box<CType>, Option<usize>),
    Record(RecordId),
}

impl CType {
    pub fn is_integral(&self) -> bool {
        matches!(self, CType::Bool | CType::Int { .. } | CType::Enum)
    }

    /// Spelling used in diagnostics
    pub fn describe(&self, records: &[RecordDef]) -> String {
        match self {
            CType::Void => "void".into(),
            CType::Bool => "_Bool".into(),
            CType::Int { size, signed } => {
                let base = match size {
                    1 => "char",
                    2 => "short",
                    4 => "int",
                    8 => "long",
                    _ => "__int128",
                };
                if *signed {
                    base.to_string()
                } else {
                    format!("unsigned {base}")
                }
            }
            CType::Float(4) => "float".into(),
            CType::Float(8) => "double".into(),
            CType::Float(_) => "long double".into(),
            CType::Enum => "enum".into(),
            CType::Pointer(inner) => format!("{} *", inner.describe(records)),
            CType::Function => "function".into(),
            CType::Array(inner, Some(n)) => format!("{}[{n}]", inner.describe(records)),
            CType::Array(inner, None) => format!("{}[]", inner.describe(records)),
            CType::Record(id) => {
                let record = &records[*id];
                match (&record.tag, &record.typedef_name) {
                    (Some(tag), _) => format!("{} {tag}", record.kind),
                    (None, Some(name)) => name.clone(),
                    (None, None) => format!("{} (anonymous)", record.kind),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberDef {
    /// `None` for anonymous records and unnamed bit-fields
    pub name: Option<String>,
    pub ty: CType,
    pub bit_width: Option<usize>,
    /// `aligned(N)` on the member
    pub align: Option<usize>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct RecordDef {
    pub kind: RecordKind,
    pub tag: Option<String>,
    /// Set when an untagged record is named by a typedef
    pub typedef_name: Option<String>,
    /// Record whose body contains this definition
    pub enclosing: Option<RecordId>,
    pub location: SourceLocation,
    pub members: Vec<MemberDef>,
    pub packed: bool,
    pub align: Option<usize>,
    /// Present once the definition is complete
    pub layout: Option<RecordLayout>,
}

impl RecordDef {
    pub fn new(kind: RecordKind, tag: Option<String>, location: SourceLocation) -> Self {
        Self {
            kind,
            tag,
            typedef_name: None,
            enclosing: None,
            location,
            members: Vec::new(),
            packed: false,
            align: None,
            layout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub size: usize,
    pub align: usize,
    /// Bit offset of each member, parallel to `RecordDef::members`
    pub bit_offsets: Vec<usize>,
}

/// Why a type has no size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSize {
    Incomplete,
    /// An array whose size does not fit in a `usize`
    TooLarge,
}

/// Size and alignment in bytes
pub fn size_align(ty: &CType, records: &[RecordDef]) -> Result<(usize, usize), NoSize> {
    match ty {
        CType::Void | CType::Function => Err(NoSize::Incomplete),
        CType::Bool => Ok((1, 1)),
        CType::Int { size, .. } | CType::Float(size) => Ok((*size, *size)),
        CType::Enum => Ok((4, 4)),
        CType::Pointer(_) => Ok((8, 8)),
        CType::Array(element, count) => {
            let (size, align) = size_align(element, records)?;
            let size = size.checked_mul(count.unwrap_or(0)).ok_or(NoSize::TooLarge)?;
            Ok((size, align))
        }
        CType::Record(id) => records[*id]
            .layout
            .as_ref()
            .map(|l| (l.size, l.align))
            .ok_or(NoSize::Incomplete),
    }
}

fn round_up(value: usize, multiple: usize) -> Option<usize> {
    value.div_ceil(multiple).checked_mul(multiple)
}

/// Round a bit offset up to a byte alignment
fn align_bits(offset: usize, align: usize) -> Option<usize> {
    round_up(offset, align.checked_mul(8)?)
}

/// A member that cannot be laid out, by index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberError {
    pub member: usize,
    pub message: String,
}

/// Compute the layout of a complete record definition
pub fn layout_record(def: &RecordDef, records: &[RecordDef]) -> Result<RecordLayout, MemberError> {
    let mut bit_offsets = Vec::with_capacity(def.members.len());
    let mut offset = 0usize; // in bits
    let mut end = 0usize; // in bits, for unions
    let mut align = 1usize;

    for (index, member) in def.members.iter().enumerate() {
        let fail = |message: String| MemberError {
            member: index,
            message,
        };
        let too_large = || fail("record is too large".to_string());
        let (size, natural) = match size_align(&member.ty, records) {
            Ok(found) => found,
            Err(NoSize::TooLarge) => return Err(fail("array is too large".to_string())),
            Err(NoSize::Incomplete) => {
                return Err(fail(format!(
                    "field has incomplete type '{}'",
                    member.ty.describe(records)
                )));
            }
        };
        let mut member_align = if def.packed { 1 } else { natural };
        if let Some(explicit) = member.align {
            member_align = member_align.max(explicit);
        }

        let Some(width) = member.bit_width else {
            let at = if def.kind == RecordKind::Union {
                0
            } else {
                align_bits(offset, member_align).ok_or_else(too_large)?
            };
            bit_offsets.push(at);
            offset = size
                .checked_mul(8)
                .and_then(|bits| at.checked_add(bits))
                .ok_or_else(too_large)?;
            end = end.max(offset);
            align = align.max(member_align);
            continue;
        };

        let name = member.name.as_deref().unwrap_or("<anonymous>");
        if !member.ty.is_integral() {
            return Err(fail(format!(
                "bit-field '{name}' has non-integral type '{}'",
                member.ty.describe(records)
            )));
        }
        let unit = size * 8;
        if width > unit {
            return Err(fail(format!(
                "width of bit-field '{name}' ({width} bits) exceeds the width of its type ({unit} bits)"
            )));
        }
        if width == 0 {
            if member.name.is_some() {
                return Err(fail(format!("named bit-field '{name}' has zero width")));
            }
            if def.kind == RecordKind::Struct {
                offset = align_bits(offset, natural).ok_or_else(too_large)?;
            }
            bit_offsets.push(offset);
            continue;
        }

        let at = if def.kind == RecordKind::Union {
            0
        } else if !def.packed && offset / unit != offset.saturating_add(width - 1) / unit {
            round_up(offset, unit).ok_or_else(too_large)?
        } else {
            offset
        };
        bit_offsets.push(at);
        offset = at.checked_add(width).ok_or_else(too_large)?;
        end = end.max(offset);
        if member.name.is_some() {
            align = align.max(member_align);
        }
    }

    if let Some(explicit) = def.align {
        align = align.max(explicit);
    }
    Ok(RecordLayout {
        size: round_up(end.div_ceil(8), align).ok_or(MemberError {
            member: def.members.len().saturating_sub(1),
            message: "record is too large".to_string(),
        })?,
        align,
        bit_offsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int() -> CType {
        CType::Int {
            size: 4,
            signed: true,
        }
    }

    fn long() -> CType {
        CType::Int {
            size: 8,
            signed: true,
        }
    }

    fn char_() -> CType {
        CType::Int {
            size: 1,
            signed: true,
        }
    }

    fn member(name: &str, ty: CType) -> MemberDef {
        MemberDef {
            name: Some(name.to_string()),
            ty,
            bit_width: None,
            align: None,
            location: SourceLocation::default(),
        }
    }

    fn bits(name: Option<&str>, ty: CType, width: usize) -> MemberDef {
        MemberDef {
            name: name.map(str::to_string),
            bit_width: Some(width),
            ..member("", ty)
        }
    }

    fn record(kind: RecordKind, members: Vec<MemberDef>) -> RecordDef {
        RecordDef {
            members,
            ..RecordDef::new(kind, Some("Foo".into()), SourceLocation::default())
        }
    }

    fn layout(def: &RecordDef) -> RecordLayout {
        layout_record(def, &[]).unwrap()
    }

    #[test]
    fn test_padding() {
        let def = record(
            RecordKind::Struct,
            vec![member("c", char_()), member("l", long()), member("i", int())],
        );
        let l = layout(&def);
        assert_eq!(l.bit_offsets, vec![0, 64, 128]);
        assert_eq!((l.size, l.align), (24, 8));
    }

    #[test]
    fn test_union() {
        let def = record(
            RecordKind::Union,
            vec![member("c", char_()), member("i", int()), member("l", long())],
        );
        let l = layout(&def);
        assert_eq!(l.bit_offsets, vec![0, 0, 0]);
        assert_eq!(l.size, 8);
    }

    #[test]
    fn test_bitfield_straddle() {
        // int a:28, b:6 -> b does not fit the rest of the first int
        let def = record(
            RecordKind::Struct,
            vec![bits(Some("a"), int(), 28), bits(Some("b"), int(), 6)],
        );
        let l = layout(&def);
        assert_eq!(l.bit_offsets, vec![0, 32]);
        assert_eq!(l.size, 8);
    }

    #[test]
    fn test_zero_width_and_unnamed_bitfields() {
        // char a:3; int :0; char b:2; long :5;
        let def = record(
            RecordKind::Struct,
            vec![
                bits(Some("a"), char_(), 3),
                bits(None, int(), 0),
                bits(Some("b"), char_(), 2),
                bits(None, long(), 5),
            ],
        );
        let l = layout(&def);
        assert_eq!(l.bit_offsets, vec![0, 32, 32, 34]);
        // the unnamed long does not raise the alignment
        assert_eq!((l.size, l.align), (5, 1));
    }

    #[test]
    fn test_packed_and_aligned() {
        let mut def = record(RecordKind::Struct, vec![member("c", char_()), member("l", long())]);
        def.packed = true;
        let l = layout(&def);
        assert_eq!(l.bit_offsets, vec![0, 8]);
        assert_eq!(l.size, 9);

        let mut def = record(RecordKind::Struct, vec![member("c", char_()), member("i", int())]);
        def.members[1].align = Some(16);
        let l = layout(&def);
        assert_eq!(l.bit_offsets, vec![0, 128]);
        assert_eq!((l.size, l.align), (32, 16));

        let mut def = record(RecordKind::Struct, vec![member("c", char_())]);
        def.align = Some(8);
        assert_eq!(layout(&def).size, 8);
    }

    #[test]
    fn test_flexible_array() {
        let def = record(
            RecordKind::Struct,
            vec![
                member("len", int()),
                member("data", CType::Array(Box::new(long()), None)),
            ],
        );
        let l = layout(&def);
        assert_eq!(l.bit_offsets, vec![0, 64]);
        assert_eq!(l.size, 8);
    }

    #[test]
    fn test_invalid_members() {
        let incomplete = RecordDef::new(RecordKind::Struct, Some("b".into()), SourceLocation::default());
        let records = vec![incomplete];
        let def = record(RecordKind::Struct, vec![member("a", int()), member("b", CType::Record(0))]);
        let err = layout_record(&def, &records).unwrap_err();
        assert_eq!(err.member, 1);
        assert_eq!(err.message, "field has incomplete type 'struct b'");

        let def = record(RecordKind::Struct, vec![bits(Some("x"), int(), 33)]);
        assert!(layout_record(&def, &[]).is_err());
        let def = record(RecordKind::Struct, vec![bits(Some("x"), CType::Float(8), 3)]);
        assert!(layout_record(&def, &[]).is_err());
        let def = record(RecordKind::Struct, vec![bits(Some("x"), int(), 0)]);
        assert!(layout_record(&def, &[]).is_err());
    }
}
