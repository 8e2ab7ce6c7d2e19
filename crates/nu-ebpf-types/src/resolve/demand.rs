//! Demand-set discovery
//!
//! Kernel debug info describes tens of thousands of records; resolving all
//! of them up front is far too slow. Instead the caller walks the traced
//! program once and reports, through the hooks on [`DemandCollector`], the
//! places where a record type shows up:
//!
//! - explicit casts, `(struct task_struct *)arg0`
//! - builtins with a record type, `curtask`
//! - variables holding a record (pointer) whose fields are read later,
//!   `$t = (struct sock *)arg0; $t->sk_state`
//!
//! The collected names seed the [`Resolver`](super::Resolver), which then
//! follows record names found in fields on its own.

use std::collections::{BTreeSet, HashMap};

/// Record names a program needs, sorted for stable processing order
pub type DemandSet = BTreeSet<String>;

/// A program representation the collector can be run over.
///
/// The AST belongs to the caller; implementors call the collector's hooks
/// for each cast, builtin, assignment and field access they encounter.
pub trait DemandSource {
    fn walk_demands(&self, collector: &mut DemandCollector);
}

/// Record type of a builtin variable, if it has one
pub fn builtin_record(name: &str) -> Option<&'static str> {
    match name {
        "curtask" => Some("struct task_struct"),
        _ => None,
    }
}

const QUALIFIERS: &[&str] = &["const", "volatile", "restrict", "__restrict", "_Atomic"];

const BASE_WORDS: &[&str] = &[
    "void", "char", "short", "int", "long", "signed", "unsigned", "_Bool", "bool", "float",
    "double", "__int128",
];

/// Integer typedefs that are never records
const SCALAR_TYPEDEFS: &[&str] = &[
    "size_t", "ssize_t", "ptrdiff_t", "uintptr_t", "intptr_t", "pid_t", "uid_t", "gid_t",
    "off_t", "loff_t", "u8", "u16", "u32", "u64", "s8", "s16", "s32", "s64", "__u8", "__u16",
    "__u32", "__u64", "__s8", "__s16", "__s32", "__s64", "int8_t", "int16_t", "int32_t",
    "int64_t", "uint8_t", "uint16_t", "uint32_t", "uint64_t",
];

/// Reduce a type spelling to the name a record is registered under.
///
/// Pointer and reference markers, array suffixes and qualifiers are
/// dropped and whitespace runs collapsed: `const struct  sock * *`
/// becomes `struct sock`.
pub fn normalize_type_name(raw: &str) -> String {
    let without_suffix = raw.split('[').next().unwrap_or(raw);
    without_suffix
        .replace(['*', '&'], " ")
        .split_whitespace()
        .filter(|word| !QUALIFIERS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a normalized name can name a record at all
fn may_be_record(name: &str) -> bool {
    if name.is_empty() || SCALAR_TYPEDEFS.contains(&name) {
        return false;
    }
    if name.starts_with("struct ") || name.starts_with("union ") {
        return true;
    }
    if name.starts_with("enum ") {
        return false;
    }
    // Anything built only from base type words is a scalar
    !name.split_whitespace().all(|word| BASE_WORDS.contains(&word))
}

/// Collects record names while the caller walks a program
#[derive(Debug, Default)]
pub struct DemandCollector {
    demanded: DemandSet,
    /// Record type of each variable, by variable name
    variables: HashMap<String, String>,
}

impl DemandCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name directly. Returns the normalized name if it can be a
    /// record.
    pub fn demand(&mut self, type_name: &str) -> Option<String> {
        let name = normalize_type_name(type_name);
        if !may_be_record(&name) {
            return None;
        }
        self.demanded.insert(name.clone());
        Some(name)
    }

    /// A cast expression with the given target type
    pub fn on_cast(&mut self, target: &str) -> Option<String> {
        self.demand(target)
    }

    /// A reference to a builtin variable
    pub fn on_builtin(&mut self, builtin: &str) -> Option<String> {
        builtin_record(builtin).and_then(|name| self.demand(name))
    }

    /// An assignment to `variable` of a value whose static type is
    /// `type_name`, or of something untyped (`None`). Nothing is demanded
    /// until the variable's fields are accessed.
    pub fn on_assign(&mut self, variable: &str, type_name: Option<&str>) {
        let record = type_name
            .map(normalize_type_name)
            .filter(|name| may_be_record(name));
        match record {
            Some(name) => {
                self.variables.insert(variable.to_string(), name);
            }
            None => {
                self.variables.remove(variable);
            }
        }
    }

    /// A field access (`.` or `->`) whose base is `variable`
    pub fn on_field_access(&mut self, variable: &str) -> Option<String> {
        let name = self.variables.get(variable)?.clone();
        self.demanded.insert(name.clone());
        Some(name)
    }

    /// Record type last assigned to a variable
    pub fn variable_type(&self, variable: &str) -> Option<&str> {
        self.variables.get(variable).map(String::as_str)
    }

    pub fn demanded(&self) -> &DemandSet {
        &self.demanded
    }

    /// Run a full walk over `source` and return what it demanded
    pub fn collect(source: &dyn DemandSource) -> DemandSet {
        let mut collector = Self::new();
        source.walk_demands(&mut collector);
        collector.finish()
    }

    pub fn finish(self) -> DemandSet {
        self.demanded
    }
}
