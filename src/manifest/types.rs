//! Build manifest and artifact bundle

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Only bundle format the gate knows how to inspect and execute
pub const LUA_BUNDLE_FORMAT: &str = "lua-bundle";

/// Metadata produced by the build step; consumed, never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub entry_point: String,
    pub handler_export: String,
    pub format: String,
    pub artifact_hash: String,
}

/// Compiled workflow bundle: relative path → Lua source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub files: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self { files }
    }

    /// Convenience builder used by tooling and tests
    pub fn with_file(mut self, path: &str, source: &str) -> Self {
        self.files.insert(path.to_string(), source.to_string());
        self
    }

    pub fn source(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Lowercase hex SHA-256 over `path \0 source \0` for every file in path order
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, source) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(source.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Bundle path a dotted module name resolves to (`lib.util` → `lib/util.lua`)
    pub fn module_path(&self, module: &str) -> Option<String> {
        let relative = module.replace('.', "/");
        [format!("{}.lua", relative), format!("{}/init.lua", relative)]
            .into_iter()
            .find(|candidate| self.files.contains_key(candidate))
    }
}
