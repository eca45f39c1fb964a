//! Workspace manifest checks: every member inherits the workspace version
//! and the internal `modgate-*` dependency pins agree with it.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml"))
        .unwrap_or_else(|e| panic!("{}: {e}", dir.display()));
    text.parse().unwrap()
}

#[test]
fn every_member_has_a_manifest_inheriting_the_version() {
    let root = workspace_root();
    let members: Vec<String> = manifest(&root)["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect();
    assert!(members.iter().any(|m| m == "crates/modgate-core"));

    for krate in &members {
        let dir = root.join(krate);
        assert!(
            dir.join("Cargo.toml").exists(),
            "{krate} is listed as a member but has no Cargo.toml"
        );
        let inherits = manifest(&dir)["package"]["version"]
            .get("workspace")
            .and_then(toml::Value::as_bool);
        assert_eq!(inherits, Some(true), "{krate} should use version.workspace = true");
    }
}

#[test]
fn internal_dependency_pins_match_the_workspace_version() {
    let doc = manifest(&workspace_root());
    let version = doc["workspace"]["package"]["version"].as_str().unwrap();
    assert_eq!(version, env!("CARGO_PKG_VERSION"));

    let deps = doc["workspace"]["dependencies"].as_table().unwrap();
    let internal: Vec<_> = deps.iter().filter(|(name, _)| name.starts_with("modgate-")).collect();
    assert!(!internal.is_empty());
    for (name, spec) in internal {
        assert_eq!(spec["version"].as_str(), Some(version), "{name} pins a stale version");
        assert!(spec.get("path").is_some(), "{name} should be a path dependency");
    }
}
