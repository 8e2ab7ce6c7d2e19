//! Normalized type representation
//!
//! These are the values handed to the code generator: [`SizedType`] for
//! every value, [`Field`] for each member of a record, and the
//! [`StructRegistry`] mapping record names to their layouts.

mod field;
mod record;
mod sized;

pub use field::{Bitfield, Field};
pub use record::{RecordKind, Struct, StructRegistry, anonymous_record_name};
pub use sized::{
    AddrSpace, DEFAULT_STACK_SIZE, MAX_STACK_SIZE, POINTER_SIZE, SizedType, StackMode,
    StackType, TypeKind,
};
