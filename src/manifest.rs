//! Per-module dependency manifests.
//!
//! Every module directory carries a `deps.json` declaring its builder-time and
//! module-artifact dependencies by name. Parse errors and schema violations are fatal;
//! unknown keys are silently ignored.

use crate::{fs, path::AbsPath, ForgeError, Result};
use serde::Deserialize;

/// The file name of a module's dependency manifest.
pub const DEPS_JSON: &str = "deps.json";

/// The parsed `deps.json` of one module.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ModuleManifest {
    /// Modules whose builder plugins are linked into this module's plugin.
    pub builder_deps: Vec<String>,
    /// Modules whose exported libraries this module's artifacts link against.
    pub module_deps: Vec<String>,
}

impl ModuleManifest {
    /// Reads and validates the manifest at `path`.
    pub fn read(path: &AbsPath) -> Result<Self> {
        if !fs::exists(path) {
            return Err(ForgeError::Manifest {
                path: path.as_std_path().into(),
                detail: "file does not exist".to_string(),
            })
        }
        let content = std::fs::read_to_string(path).map_err(|err| ForgeError::io(err, path))?;
        let manifest: ModuleManifest =
            serde_json::from_str(&content).map_err(|err| ForgeError::Manifest {
                path: path.as_std_path().into(),
                detail: err.to_string(),
            })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &AbsPath) -> Result<()> {
        validate_dep_array(path, "builder_deps", &self.builder_deps)?;
        validate_dep_array(path, "module_deps", &self.module_deps)
    }
}

fn validate_dep_array(path: &AbsPath, key: &str, deps: &[String]) -> Result<()> {
    let manifest_err = |detail: String| ForgeError::Manifest {
        path: path.as_std_path().into(),
        detail,
    };

    let mut seen = std::collections::HashSet::new();
    for dep in deps {
        if dep.is_empty() {
            return Err(manifest_err(format!("'{key}' array must not contain empty strings")))
        }
        // dependency names are directory stems; anything path-like would escape the
        // modules dir when joined
        if dep.contains('/') || dep == "." || dep == ".." {
            return Err(manifest_err(format!(
                "'{key}' array contains invalid module name '{dep}'"
            )))
        }
        if !seen.insert(dep.as_str()) {
            return Err(manifest_err(format!("'{key}' array has duplicates")))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RelPath;
    use pretty_assertions::assert_eq;

    fn write_manifest(dir: &AbsPath, content: &str) -> AbsPath {
        let path = dir.join(&RelPath::new(DEPS_JSON).unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_a_well_formed_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsPath::new(tmp.path()).unwrap();
        let path =
            write_manifest(&dir, r#"{"builder_deps": ["gfx"], "module_deps": ["core", "gfx"]}"#);
        let manifest = ModuleManifest::read(&path).unwrap();
        assert_eq!(manifest.builder_deps, vec!["gfx"]);
        assert_eq!(manifest.module_deps, vec!["core", "gfx"]);
    }

    #[test]
    fn empty_arrays_are_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsPath::new(tmp.path()).unwrap();
        let path = write_manifest(&dir, r#"{"builder_deps": [], "module_deps": []}"#);
        assert_eq!(ModuleManifest::read(&path).unwrap(), ModuleManifest::default());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsPath::new(tmp.path()).unwrap();
        let path = write_manifest(
            &dir,
            r#"{"builder_deps": [], "module_deps": [], "future_extension": {"x": 1}}"#,
        );
        assert!(ModuleManifest::read(&path).is_ok());
    }

    #[test]
    fn missing_keys_are_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsPath::new(tmp.path()).unwrap();
        let path = write_manifest(&dir, r#"{"builder_deps": []}"#);
        let err = ModuleManifest::read(&path).unwrap_err();
        assert!(err.to_string().contains("module_deps"));
    }

    #[test]
    fn rejects_schema_violations() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsPath::new(tmp.path()).unwrap();

        for (content, expected) in [
            (r#"not json"#, "expected"),
            (r#"{"builder_deps": "m1", "module_deps": []}"#, "expected a sequence"),
            (r#"{"builder_deps": [1], "module_deps": []}"#, "expected a string"),
            (r#"{"builder_deps": ["m1", "m1"], "module_deps": []}"#, "duplicates"),
            (r#"{"builder_deps": [""], "module_deps": []}"#, "empty strings"),
            (r#"{"builder_deps": ["../escape"], "module_deps": []}"#, "invalid module name"),
        ] {
            let path = write_manifest(&dir, content);
            let err = ModuleManifest::read(&path).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "for {content}: expected {expected:?} in {err}"
            );
        }
    }

    #[test]
    fn missing_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsPath::new(tmp.path()).unwrap();
        let path = dir.join(&RelPath::new(DEPS_JSON).unwrap()).unwrap();
        assert!(ModuleManifest::read(&path).is_err());
    }
}
