//! Kernel BTF service
//!
//! Finds and loads the running kernel's type information once per process.
//! Sources, in order:
//! - `/sys/kernel/btf/vmlinux` (raw BTF exported by the kernel)
//! - `/boot/vmlinux-<release>` and `/usr/lib/debug/boot/vmlinux-<release>`
//!   (ELF images with a `.BTF` section)
//!
//! An explicit path from the configuration bypasses the search.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::{debug, warn};

use super::graph::{BtfError, BtfGraph};

/// Global kernel BTF instance
static KERNEL_BTF: OnceLock<KernelBtf> = OnceLock::new();

/// Lazily loaded kernel type graph
pub struct KernelBtf {
    /// Files tried in order
    candidates: Vec<PathBuf>,
    /// Loaded on first use, errors included
    graph: OnceLock<Result<Arc<BtfGraph>, BtfError>>,
}

impl KernelBtf {
    /// Get the global kernel BTF instance
    pub fn get() -> &'static KernelBtf {
        KERNEL_BTF.get_or_init(|| KernelBtf::with_candidates(Self::default_candidates()))
    }

    /// A service searching `candidates` instead of the usual locations
    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        Self {
            candidates,
            graph: OnceLock::new(),
        }
    }

    /// Load the graph at `path`, or the kernel's own when `None`
    pub fn load(path: Option<&Path>) -> Result<Arc<BtfGraph>, BtfError> {
        match path {
            Some(path) => BtfGraph::from_file(path).map(Arc::new),
            None => Self::get().graph(),
        }
    }

    fn default_candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/sys/kernel/btf/vmlinux")];
        if let Some(release) = Self::kernel_release() {
            paths.push(PathBuf::from(format!("/boot/vmlinux-{release}")));
            paths.push(PathBuf::from(format!("/usr/lib/debug/boot/vmlinux-{release}")));
        }
        paths
    }

    fn kernel_release() -> Option<String> {
        let release = fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
        let release = release.trim();
        (!release.is_empty()).then(|| release.to_string())
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Whether any candidate file exists. Does not parse it.
    pub fn is_available(&self) -> bool {
        self.candidates.iter().any(|p| p.is_file())
    }

    /// The type graph, loaded from the first candidate that parses
    pub fn graph(&self) -> Result<Arc<BtfGraph>, BtfError> {
        self.graph.get_or_init(|| self.load_first()).clone()
    }

    fn load_first(&self) -> Result<Arc<BtfGraph>, BtfError> {
        for path in &self.candidates {
            if !path.is_file() {
                continue;
            }
            match BtfGraph::from_file(path) {
                Ok(graph) => {
                    debug!("kernel BTF loaded from {}", path.display());
                    return Ok(Arc::new(graph));
                }
                Err(e) => warn!("skipping {}: {e}", path.display()),
            }
        }
        Err(BtfError::NotAvailable {
            tried: self.candidates.iter().map(|p| p.display().to_string()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::builder::BtfBuilder;
    use super::*;
    use crate::types::RecordKind;

    fn blob() -> Vec<u8> {
        let mut b = BtfBuilder::new();
        let int = b.int("int", 4, true);
        b.record(RecordKind::Struct, "task_struct", 4, &[("pid", int, 0, 0)]);
        b.build()
    }

    #[test]
    fn test_first_parsable_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage");
        let good = dir.path().join("vmlinux");
        fs::write(&garbage, b"not btf").unwrap();
        fs::write(&good, blob()).unwrap();

        let service = KernelBtf::with_candidates(vec![dir.path().join("missing"), garbage, good]);
        assert!(service.is_available());
        let graph = service.graph().unwrap();
        assert!(graph.record(RecordKind::Struct, "task_struct").is_some());
        // cached
        assert!(Arc::ptr_eq(&graph, &service.graph().unwrap()));
    }

    #[test]
    fn test_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let service = KernelBtf::with_candidates(vec![dir.path().join("vmlinux")]);
        assert!(!service.is_available());
        match service.graph() {
            Err(BtfError::NotAvailable { tried }) => assert_eq!(tried.len(), 1),
            other => panic!("expected NotAvailable, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.btf");
        fs::write(&path, blob()).unwrap();
        let graph = KernelBtf::load(Some(&path)).unwrap();
        assert!(graph.record(RecordKind::Struct, "task_struct").is_some());
    }

    #[test]
    fn test_default_candidates() {
        let paths = KernelBtf::default_candidates();
        assert_eq!(paths[0], PathBuf::from("/sys/kernel/btf/vmlinux"));
    }
}
