//! Fixed-point resolution driver
//!
//! Starting from the demanded names, each pass asks the adapter for every
//! pending record, registers what comes back and queues the record names
//! found in the new fields (through pointers and arrays as well). The loop
//! stops at the first pass that queues nothing.
//!
//! Every name is handed to the adapter at most once, whether it resolved or
//! not, which is what keeps self-referential records (`struct list_head`)
//! from looping forever.
//!
//! ```text
//! Idle -> Seeding -> Resolving (while names are pending) -> Done
//!                         \-> Error (adapter failure only)
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use log::{debug, trace, warn};

use super::demand::{DemandCollector, DemandSource, normalize_type_name};
use super::{RecordDecl, TypeAdapter};
use crate::error::{Diagnostic, LayoutError};
use crate::types::StructRegistry;

/// Where the driver currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Idle,
    Seeding,
    Resolving,
    Done,
    Error,
}

/// A demanded name that no record could be produced for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedType {
    pub name: String,
    pub reason: String,
}

impl fmt::Display for UnresolvedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

/// Outcome of one [`Resolver::resolve`] call
#[derive(Debug, Clone, Default)]
pub struct ResolveReport {
    /// Names registered during this call, in registration order
    pub resolved: Vec<String>,
    /// Names that failed during this call
    pub unresolved: Vec<UnresolvedType>,
    /// Number of passes until the fixed point
    pub passes: usize,
    /// Header diagnostics collected while seeding
    pub diagnostics: Vec<Diagnostic>,
}

impl ResolveReport {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty() && self.diagnostics.is_empty()
    }
}

/// Drives one adapter to a fixed point over a demand set
pub struct Resolver<'a> {
    adapter: &'a mut dyn TypeAdapter,
    registry: StructRegistry,
    state: ResolveState,
    /// Every name ever handed to the adapter
    attempted: HashSet<String>,
    unresolved: Vec<UnresolvedType>,
    preloaded: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(adapter: &'a mut dyn TypeAdapter) -> Self {
        Self::with_registry(adapter, StructRegistry::new())
    }

    /// Continue filling an existing registry. Names already in it are never
    /// requested again.
    pub fn with_registry(adapter: &'a mut dyn TypeAdapter, registry: StructRegistry) -> Self {
        Self {
            adapter,
            registry,
            state: ResolveState::Idle,
            attempted: HashSet::new(),
            unresolved: Vec::new(),
            preloaded: false,
        }
    }

    pub fn state(&self) -> ResolveState {
        self.state
    }

    pub fn registry(&self) -> &StructRegistry {
        &self.registry
    }

    /// Every failure since the resolver was created
    pub fn unresolved(&self) -> &[UnresolvedType] {
        &self.unresolved
    }

    /// Hand the registry to the code generator
    pub fn into_registry(self) -> StructRegistry {
        self.registry
    }

    /// Collect the demand set of `program` and resolve it
    pub fn resolve_program(
        &mut self,
        program: &dyn DemandSource,
    ) -> Result<ResolveReport, LayoutError> {
        let demanded = DemandCollector::collect(program);
        self.resolve(demanded)
    }

    /// Resolve `seeds` and everything reachable from them.
    ///
    /// Unknown names end up in [`ResolveReport::unresolved`]; only an
    /// adapter failure is returned as an error, leaving the resolver in
    /// [`ResolveState::Error`]. Records registered before the failure stay
    /// valid.
    pub fn resolve<I, S>(&mut self, seeds: I) -> Result<ResolveReport, LayoutError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = ResolveReport::default();

        self.state = ResolveState::Seeding;
        let mut pending = BTreeSet::new();
        if let Err(e) = self.seed(&mut report, &mut pending) {
            self.state = ResolveState::Error;
            return Err(e);
        }
        pending.extend(seeds.into_iter().map(|s| normalize_type_name(s.as_ref())));

        self.state = ResolveState::Resolving;
        loop {
            pending.retain(|name| !self.registry.contains(name) && !self.attempted.contains(name));
            if pending.is_empty() {
                break;
            }
            report.passes += 1;
            trace!("resolution pass {}: {} pending", report.passes, pending.len());

            let mut discovered = BTreeSet::new();
            for name in std::mem::take(&mut pending) {
                if let Err(e) = self.resolve_one(&name, &mut report, &mut discovered) {
                    self.state = ResolveState::Error;
                    return Err(e);
                }
            }
            pending = discovered;
        }

        self.state = ResolveState::Done;
        debug!(
            "resolution done after {} pass(es): {} registered, {} unresolved",
            report.passes,
            report.resolved.len(),
            report.unresolved.len()
        );
        Ok(report)
    }

    /// Register whatever the adapter declares up front, once
    fn seed(
        &mut self,
        report: &mut ResolveReport,
        pending: &mut BTreeSet<String>,
    ) -> Result<(), LayoutError> {
        if self.preloaded {
            return Ok(());
        }
        self.preloaded = true;

        match self.adapter.preload() {
            Ok(decls) => {
                for decl in decls {
                    let name = decl.name.clone();
                    if let Err(e) = self.register(decl, report, pending) {
                        self.fail(&name, e.to_string(), report);
                    }
                }
                Ok(())
            }
            Err(LayoutError::MalformedSource { unit, diagnostics }) => {
                warn!("{}: definitions discarded after {} error(s)", unit, diagnostics.len());
                report.diagnostics.extend(diagnostics);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("{} preload: {}", self.adapter.name(), e);
                Ok(())
            }
        }
    }

    fn resolve_one(
        &mut self,
        name: &str,
        report: &mut ResolveReport,
        discovered: &mut BTreeSet<String>,
    ) -> Result<(), LayoutError> {
        self.attempted.insert(name.to_string());
        debug!("resolving {} with {}", name, self.adapter.name());

        match self.adapter.resolve(name) {
            Ok(Some(decls)) => {
                for decl in decls {
                    if let Err(e) = self.register(decl, report, discovered) {
                        self.fail(name, e.to_string(), report);
                        return Ok(());
                    }
                }
                if !self.registry.contains(name) {
                    let reason = format!("{} returned no record of that name", self.adapter.name());
                    self.fail(name, reason, report);
                }
                Ok(())
            }
            Ok(None) | Err(LayoutError::UnknownType(_)) => {
                let reason = LayoutError::UnknownType(name.to_string()).to_string();
                self.fail(name, reason, report);
                Ok(())
            }
            Err(LayoutError::MalformedSource { diagnostics, .. }) => {
                report.diagnostics.extend(diagnostics);
                self.fail(name, "definitions failed to parse".to_string(), report);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.fail(name, e.to_string(), report);
                Ok(())
            }
        }
    }

    fn register(
        &mut self,
        decl: RecordDecl,
        report: &mut ResolveReport,
        discovered: &mut BTreeSet<String>,
    ) -> Result<(), LayoutError> {
        let name = decl.name.clone();
        let referenced: Vec<String> = decl
            .members
            .iter()
            .flat_map(|m| m.ty.referenced_records())
            .filter(|r| !self.registry.contains(r))
            .map(str::to_string)
            .collect();

        if self.registry.insert_decl(decl)? {
            report.resolved.push(name);
            discovered.extend(referenced);
        }
        Ok(())
    }

    fn fail(&mut self, name: &str, reason: String, report: &mut ResolveReport) {
        warn!("could not resolve {}: {}", name, reason);
        let unresolved = UnresolvedType {
            name: name.to_string(),
            reason,
        };
        report.unresolved.push(unresolved.clone());
        self.unresolved.push(unresolved);
    }
}
