//! Resolver configuration

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// Environment variable overriding the kernel BTF location
pub const BTF_PATH_ENV: &str = "NU_EBPF_BTF";

/// Environment variable forcing debug info over header definitions
pub const FORCE_BTF_ENV: &str = "NU_EBPF_FORCE_BTF";

/// Which frontend resolves record names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePreference {
    /// Debug info when the headers define nothing and it is available,
    /// headers otherwise
    #[default]
    Auto,
    Headers,
    DebugInfo,
}

impl SourcePreference {
    /// Pick the frontend for one compilation.
    ///
    /// Returns `true` for debug info, `false` for headers.
    pub fn use_debug_info(self, headers_define_records: bool, debug_info_available: bool) -> bool {
        match self {
            SourcePreference::Headers => false,
            SourcePreference::DebugInfo => true,
            SourcePreference::Auto => !headers_define_records && debug_info_available,
        }
    }
}

/// Settings for one resolution pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub source: SourcePreference,
    /// Kernel BTF file; the usual locations are searched when unset
    pub btf_path: Option<PathBuf>,
    /// File name used in locations of header diagnostics and anonymous
    /// record names
    pub unit_name: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            source: SourcePreference::Auto,
            btf_path: None,
            unit_name: "definitions.h".into(),
        }
    }
}

impl ResolverConfig {
    /// Defaults, adjusted by `NU_EBPF_BTF` and `NU_EBPF_FORCE_BTF`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env::var_os(BTF_PATH_ENV).filter(|p| !p.is_empty()) {
            config.btf_path = Some(PathBuf::from(path));
        }
        if env::var(FORCE_BTF_ENV).is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes")) {
            config.source = SourcePreference::DebugInfo;
        }
        config
    }

    pub fn from_json(text: &str) -> Result<Self, LayoutError> {
        Ok(serde_json::from_str(text)?)
    }
}
