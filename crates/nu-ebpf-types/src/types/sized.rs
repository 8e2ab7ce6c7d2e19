//! Sized type values
//!
//! A [`SizedType`] describes one value the tracing language can hold: its
//! kind, its size in bytes and, for composite kinds, what it points to or
//! contains. Values are only built through the factory functions at the
//! bottom of this file so that the size invariants always hold:
//!
//! - integer size is `ceil(bits / 8)`
//! - pointer size is the host pointer width
//! - array size is `element.size * count`
//! - record size is whatever the registry entry says; it is never re-derived
//!
//! Kind-specific accessors (`int_bit_width`, `pointee`, `element`,
//! `record_name`, ...) assert the kind first. Calling them on the wrong kind
//! is a caller bug and panics.

use std::fmt;
use std::sync::Arc;

/// Default number of frames captured by a stack
pub const DEFAULT_STACK_SIZE: usize = 127;

/// Upper bound on the number of frames a stack may request
pub const MAX_STACK_SIZE: usize = 1024;

/// Width of a pointer on the host, which is assumed to equal the target
pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Discriminant of a [`SizedType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    None,
    Integer,
    Pointer,
    /// Struct or union, looked up by name in the registry
    Record,
    Hist,
    Lhist,
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Stats,
    Kstack,
    Ustack,
    String,
    Ksym,
    Usym,
    Join,
    Probe,
    Username,
    Inet,
    StackMode,
    Array,
    Buffer,
    Tuple,
    Timestamp,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::None => "none",
            TypeKind::Integer => "integer",
            TypeKind::Pointer => "pointer",
            TypeKind::Record => "record",
            TypeKind::Hist => "hist",
            TypeKind::Lhist => "lhist",
            TypeKind::Count => "count",
            TypeKind::Sum => "sum",
            TypeKind::Min => "min",
            TypeKind::Max => "max",
            TypeKind::Avg => "avg",
            TypeKind::Stats => "stats",
            TypeKind::Kstack => "kstack",
            TypeKind::Ustack => "ustack",
            TypeKind::String => "string",
            TypeKind::Ksym => "ksym",
            TypeKind::Usym => "usym",
            TypeKind::Join => "join",
            TypeKind::Probe => "probe",
            TypeKind::Username => "username",
            TypeKind::Inet => "inet",
            TypeKind::StackMode => "stack_mode",
            TypeKind::Array => "array",
            TypeKind::Buffer => "buffer",
            TypeKind::Tuple => "tuple",
            TypeKind::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Which memory a pointer refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrSpace {
    #[default]
    None,
    /// Kernel memory, read with bpf_probe_read_kernel
    Kernel,
    /// User memory, read with bpf_probe_read_user
    User,
}

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrSpace::None => f.write_str("none"),
            AddrSpace::Kernel => f.write_str("kernel"),
            AddrSpace::User => f.write_str("user"),
        }
    }
}

/// Output format of a captured stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StackMode {
    #[default]
    Bpftrace,
    Perf,
}

/// Frame limit and output format of a stack value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackType {
    pub limit: usize,
    pub mode: StackMode,
}

impl Default for StackType {
    fn default() -> Self {
        Self {
            limit: DEFAULT_STACK_SIZE,
            mode: StackMode::Bpftrace,
        }
    }
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            StackMode::Bpftrace => "bpftrace",
            StackMode::Perf => "perf",
        };
        write!(f, "{}#{}", mode, self.limit)
    }
}

/// Kind-specific payload. Kept private so that nothing outside the
/// factories can put a `SizedType` into an inconsistent state.
#[derive(Debug, Clone)]
enum Detail {
    Plain,
    Signed(bool),
    Integer { bits: usize, signed: bool },
    Pointer { pointee: Arc<SizedType>, addr_space: AddrSpace },
    Record { name: Arc<str> },
    Array { element: Arc<SizedType>, count: usize },
    Stack(StackType),
    Tuple(Arc<[SizedType]>),
}

/// A type together with its size in bytes
#[derive(Debug, Clone)]
pub struct SizedType {
    kind: TypeKind,
    size: usize,
    detail: Detail,
}

impl Default for SizedType {
    fn default() -> Self {
        SizedType::none()
    }
}

impl SizedType {
    fn plain(kind: TypeKind, size: usize) -> Self {
        Self {
            kind,
            size,
            detail: Detail::Plain,
        }
    }

    fn signed_kind(kind: TypeKind, size: usize, signed: bool) -> Self {
        Self {
            kind,
            size,
            detail: Detail::Signed(signed),
        }
    }

    /// The discriminant of this type
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_none(&self) -> bool {
        self.kind == TypeKind::None
    }

    pub fn is_int(&self) -> bool {
        self.kind == TypeKind::Integer
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.detail, Detail::Integer { bits: 1, .. })
    }

    pub fn is_ptr(&self) -> bool {
        self.kind == TypeKind::Pointer
    }

    pub fn is_record(&self) -> bool {
        self.kind == TypeKind::Record
    }

    pub fn is_array(&self) -> bool {
        self.kind == TypeKind::Array
    }

    pub fn is_string(&self) -> bool {
        self.kind == TypeKind::String
    }

    pub fn is_buffer(&self) -> bool {
        self.kind == TypeKind::Buffer
    }

    pub fn is_tuple(&self) -> bool {
        self.kind == TypeKind::Tuple
    }

    pub fn is_timestamp(&self) -> bool {
        self.kind == TypeKind::Timestamp
    }

    pub fn is_stack_mode(&self) -> bool {
        self.kind == TypeKind::StackMode
    }

    pub fn is_ksym(&self) -> bool {
        self.kind == TypeKind::Ksym
    }

    pub fn is_usym(&self) -> bool {
        self.kind == TypeKind::Usym
    }

    pub fn is_username(&self) -> bool {
        self.kind == TypeKind::Username
    }

    pub fn is_inet(&self) -> bool {
        self.kind == TypeKind::Inet
    }

    pub fn is_probe(&self) -> bool {
        self.kind == TypeKind::Probe
    }

    pub fn is_join(&self) -> bool {
        self.kind == TypeKind::Join
    }

    /// Kernel or user stack
    pub fn is_stack(&self) -> bool {
        matches!(self.kind, TypeKind::Kstack | TypeKind::Ustack)
    }

    /// Map aggregation kinds (`count()`, `hist()`, ...)
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Count
                | TypeKind::Sum
                | TypeKind::Min
                | TypeKind::Max
                | TypeKind::Avg
                | TypeKind::Stats
                | TypeKind::Hist
                | TypeKind::Lhist
        )
    }

    /// Whether a value of this type can be handed to print()/printf()
    pub fn is_printable(&self) -> bool {
        !matches!(
            self.kind,
            TypeKind::None
                | TypeKind::Record
                | TypeKind::Pointer
                | TypeKind::StackMode
                | TypeKind::Array
        )
    }

    /// Signedness of integers and of signed aggregations. Every other kind
    /// reports unsigned.
    pub fn is_signed(&self) -> bool {
        match self.detail {
            Detail::Integer { signed, .. } | Detail::Signed(signed) => signed,
            _ => false,
        }
    }

    /// Width of an integer in bits
    ///
    /// # Panics
    ///
    /// Panics if this is not an integer.
    pub fn int_bit_width(&self) -> usize {
        assert!(self.is_int(), "int_bit_width() called on {}", self.kind);
        match self.detail {
            Detail::Integer { bits, .. } => bits,
            _ => unreachable!("integer without bit width"),
        }
    }

    /// The type a pointer refers to
    ///
    /// # Panics
    ///
    /// Panics if this is not a pointer.
    pub fn pointee(&self) -> &SizedType {
        assert!(self.is_ptr(), "pointee() called on {}", self.kind);
        match &self.detail {
            Detail::Pointer { pointee, .. } => pointee,
            _ => unreachable!("pointer without pointee"),
        }
    }

    /// Address space of a pointer
    ///
    /// # Panics
    ///
    /// Panics if this is not a pointer.
    pub fn addr_space(&self) -> AddrSpace {
        assert!(self.is_ptr(), "addr_space() called on {}", self.kind);
        match &self.detail {
            Detail::Pointer { addr_space, .. } => *addr_space,
            _ => unreachable!("pointer without address space"),
        }
    }

    /// Element type of an array
    ///
    /// # Panics
    ///
    /// Panics if this is not an array.
    pub fn element(&self) -> &SizedType {
        assert!(self.is_array(), "element() called on {}", self.kind);
        match &self.detail {
            Detail::Array { element, .. } => element,
            _ => unreachable!("array without element"),
        }
    }

    /// Element count of an array, or capacity of a string
    ///
    /// # Panics
    ///
    /// Panics if this is neither an array nor a string.
    pub fn num_elements(&self) -> usize {
        assert!(
            self.is_array() || self.is_string(),
            "num_elements() called on {}",
            self.kind
        );
        match &self.detail {
            Detail::Array { count, .. } => *count,
            _ => self.size,
        }
    }

    /// Registry key of a record
    ///
    /// # Panics
    ///
    /// Panics if this is not a record.
    pub fn record_name(&self) -> &str {
        assert!(self.is_record(), "record_name() called on {}", self.kind);
        match &self.detail {
            Detail::Record { name } => name,
            _ => unreachable!("record without name"),
        }
    }

    /// Frame limit and mode of a stack
    ///
    /// # Panics
    ///
    /// Panics if this is not a kernel or user stack.
    pub fn stack_type(&self) -> StackType {
        assert!(self.is_stack(), "stack_type() called on {}", self.kind);
        match &self.detail {
            Detail::Stack(st) => *st,
            _ => unreachable!("stack without stack type"),
        }
    }

    /// Elements of a tuple, in order
    ///
    /// # Panics
    ///
    /// Panics if this is not a tuple.
    pub fn tuple_elems(&self) -> &[SizedType] {
        assert!(self.is_tuple(), "tuple_elems() called on {}", self.kind);
        match &self.detail {
            Detail::Tuple(elems) => elems,
            _ => unreachable!("tuple without elements"),
        }
    }

    /// Only the discriminants are compared.
    ///
    /// Use this when asking "is it a pointer?" about two values; use
    /// [`SizedType::is_equal`] (or `==`) when the full shape matters.
    pub fn same_kind(&self, other: &SizedType) -> bool {
        self.kind == other.kind
    }

    /// Deep structural equality: kind, size, signedness, record name and,
    /// recursively, pointee/element/tuple elements.
    pub fn is_equal(&self, other: &SizedType) -> bool {
        if self.kind != other.kind || self.size != other.size {
            return false;
        }
        match (&self.detail, &other.detail) {
            (Detail::Plain, Detail::Plain) => true,
            (Detail::Signed(a), Detail::Signed(b)) => a == b,
            (
                Detail::Integer { bits: ab, signed: asg },
                Detail::Integer { bits: bb, signed: bsg },
            ) => ab == bb && asg == bsg,
            (
                Detail::Pointer { pointee: a, addr_space: aas },
                Detail::Pointer { pointee: b, addr_space: bas },
            ) => aas == bas && (Arc::ptr_eq(a, b) || a.is_equal(b)),
            (Detail::Record { name: a }, Detail::Record { name: b }) => a == b,
            (
                Detail::Array { element: a, count: ac },
                Detail::Array { element: b, count: bc },
            ) => ac == bc && (Arc::ptr_eq(a, b) || a.is_equal(b)),
            (Detail::Stack(a), Detail::Stack(b)) => a == b,
            (Detail::Tuple(a), Detail::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_equal(y))
            }
            _ => false,
        }
    }

    /// Record names this type mentions, looking through pointers, arrays
    /// and tuples.
    pub fn referenced_records(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_records(&mut names);
        names
    }

    fn collect_records<'a>(&'a self, out: &mut Vec<&'a str>) {
        match &self.detail {
            Detail::Record { name } => out.push(name),
            Detail::Pointer { pointee, .. } => pointee.collect_records(out),
            Detail::Array { element, .. } => element.collect_records(out),
            Detail::Tuple(elems) => {
                for elem in elems.iter() {
                    elem.collect_records(out);
                }
            }
            _ => {}
        }
    }
}

impl PartialEq for SizedType {
    /// Same as [`SizedType::is_equal`]
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl Eq for SizedType {}

impl fmt::Display for SizedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detail, self.kind) {
            (Detail::Integer { bits, signed }, _) => {
                write!(f, "{}int{}", if *signed { "" } else { "u" }, bits)
            }
            (Detail::Pointer { pointee, .. }, _) => write!(f, "{} *", pointee),
            (Detail::Record { name }, _) => f.write_str(name),
            (Detail::Array { element, count }, _) => write!(f, "{}[{}]", element, count),
            (Detail::Tuple(elems), _) => {
                f.write_str("(")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", elem)?;
                }
                f.write_str(")")
            }
            (Detail::Stack(st), kind) if st.mode == StackMode::Perf => {
                write!(f, "{}({})", kind, st)
            }
            (_, TypeKind::String) => write!(f, "string[{}]", self.size),
            (_, TypeKind::Buffer) => write!(f, "buffer[{}]", self.size),
            (_, kind) => write!(f, "{}", kind),
        }
    }
}

// Factories

impl SizedType {
    pub fn none() -> Self {
        Self::plain(TypeKind::None, 0)
    }

    /// `none` that still occupies `size` bytes, for members the tracing
    /// language cannot read, like floating point
    pub fn opaque(size: usize) -> Self {
        Self::plain(TypeKind::None, size)
    }

    pub fn bool() -> Self {
        Self::integer(1, false)
    }

    /// Integer of `bits` width; size is rounded up to whole bytes
    pub fn integer(bits: usize, signed: bool) -> Self {
        Self {
            kind: TypeKind::Integer,
            size: bits.div_ceil(8),
            detail: Detail::Integer { bits, signed },
        }
    }

    pub fn int(bits: usize) -> Self {
        Self::integer(bits, true)
    }

    pub fn uint(bits: usize) -> Self {
        Self::integer(bits, false)
    }

    pub fn int8() -> Self {
        Self::int(8)
    }

    pub fn int16() -> Self {
        Self::int(16)
    }

    pub fn int32() -> Self {
        Self::int(32)
    }

    pub fn int64() -> Self {
        Self::int(64)
    }

    pub fn uint8() -> Self {
        Self::uint(8)
    }

    pub fn uint16() -> Self {
        Self::uint(16)
    }

    pub fn uint32() -> Self {
        Self::uint(32)
    }

    pub fn uint64() -> Self {
        Self::uint(64)
    }

    /// Fixed-capacity string of `size` bytes
    pub fn string(size: usize) -> Self {
        Self::plain(TypeKind::String, size)
    }

    /// `None` when the total size does not fit in a `usize`
    pub fn array(count: usize, element: SizedType) -> Option<Self> {
        Self::array_of(count, Arc::new(element))
    }

    /// Array over an element allocation that may be shared with other types
    pub fn array_of(count: usize, element: Arc<SizedType>) -> Option<Self> {
        Some(Self {
            kind: TypeKind::Array,
            size: element.size.checked_mul(count)?,
            detail: Detail::Array { element, count },
        })
    }

    pub fn pointer(pointee: SizedType, addr_space: AddrSpace) -> Self {
        Self::pointer_to(Arc::new(pointee), addr_space)
    }

    /// Pointer over a pointee allocation that may be shared with other types
    pub fn pointer_to(pointee: Arc<SizedType>, addr_space: AddrSpace) -> Self {
        Self {
            kind: TypeKind::Pointer,
            size: POINTER_SIZE,
            detail: Detail::Pointer {
                pointee,
                addr_space,
            },
        }
    }

    /// Struct or union reference; `size` must match the registry entry
    pub fn record(size: usize, name: impl Into<Arc<str>>) -> Self {
        Self {
            kind: TypeKind::Record,
            size,
            detail: Detail::Record { name: name.into() },
        }
    }

    pub fn stack_mode() -> Self {
        Self::plain(TypeKind::StackMode, 0)
    }

    /// Kernel (`kernel == true`) or user stack
    ///
    /// # Panics
    ///
    /// Panics if the frame limit exceeds [`MAX_STACK_SIZE`].
    pub fn stack(kernel: bool, stack: StackType) -> Self {
        assert!(
            stack.limit <= MAX_STACK_SIZE,
            "stack limit {} exceeds {}",
            stack.limit,
            MAX_STACK_SIZE
        );
        Self {
            kind: if kernel {
                TypeKind::Kstack
            } else {
                TypeKind::Ustack
            },
            size: 8,
            detail: Detail::Stack(stack),
        }
    }

    pub fn min(signed: bool) -> Self {
        Self::signed_kind(TypeKind::Min, 8, signed)
    }

    pub fn max(signed: bool) -> Self {
        Self::signed_kind(TypeKind::Max, 8, signed)
    }

    pub fn sum(signed: bool) -> Self {
        Self::signed_kind(TypeKind::Sum, 8, signed)
    }

    pub fn count(signed: bool) -> Self {
        Self::signed_kind(TypeKind::Count, 8, signed)
    }

    pub fn avg(signed: bool) -> Self {
        Self::signed_kind(TypeKind::Avg, 8, signed)
    }

    pub fn stats(signed: bool) -> Self {
        Self::signed_kind(TypeKind::Stats, 8, signed)
    }

    pub fn probe() -> Self {
        Self::plain(TypeKind::Probe, 8)
    }

    pub fn username() -> Self {
        Self::plain(TypeKind::Username, 8)
    }

    pub fn inet(size: usize) -> Self {
        Self::plain(TypeKind::Inet, size)
    }

    pub fn lhist() -> Self {
        Self::plain(TypeKind::Lhist, 8)
    }

    pub fn hist() -> Self {
        Self::plain(TypeKind::Hist, 8)
    }

    pub fn usym() -> Self {
        Self::plain(TypeKind::Usym, 16)
    }

    pub fn ksym() -> Self {
        Self::plain(TypeKind::Ksym, 8)
    }

    /// join() output: an 8-byte id, an 8-byte pid and `argnum` slots
    pub fn join(argnum: usize, argsize: usize) -> Self {
        Self::plain(TypeKind::Join, 8 + 8 + argnum * argsize)
    }

    pub fn buffer(size: usize) -> Self {
        Self::plain(TypeKind::Buffer, size)
    }

    pub fn timestamp() -> Self {
        Self::plain(TypeKind::Timestamp, 16)
    }

    /// Tuples are packed; the size is the sum of element sizes.
    pub fn tuple(elems: Vec<SizedType>) -> Self {
        let size = elems.iter().map(SizedType::size).sum();
        Self {
            kind: TypeKind::Tuple,
            size,
            detail: Detail::Tuple(elems.into()),
        }
    }
}
