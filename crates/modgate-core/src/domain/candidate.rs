//! Staged candidate files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A staged, not-yet-promoted set of generated files for one module.
///
/// `files` are paths relative to `root`, sorted. Once [`Candidate::seal`] has
/// run the files are read-only and nothing in the pipeline writes them again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub module_id: String,
    pub category: String,
    pub driver: String,
    pub run_id: Uuid,
    pub root: PathBuf,
    pub files: Vec<String>,
    /// Build provenance carried into the registry entry.
    #[serde(default)]
    pub manifest: serde_json::Value,
}

impl Candidate {
    /// Absolute path of a candidate file.
    pub fn path_of(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Read every candidate file as `(relative path, bytes)`, in manifest order.
    pub fn read_files(&self) -> std::io::Result<Vec<(String, Vec<u8>)>> {
        self.files
            .iter()
            .map(|rel| Ok((rel.clone(), fs::read(self.path_of(rel))?)))
            .collect()
    }

    /// Mark every file read-only before inspection begins.
    pub fn seal(&self) -> std::io::Result<()> {
        for rel in &self.files {
            let path = self.path_of(rel);
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&path, perms)?;
        }
        Ok(())
    }

    /// Remove the staging directory.
    pub fn discard(&self) -> std::io::Result<()> {
        remove_tree(&self.root)
    }
}

/// List regular files under `root` as sorted relative paths with `/` separators.
pub fn list_relative_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    if root.exists() {
        collect(root, root, &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let ty = entry.file_type()?;
        if ty.is_dir() {
            collect(root, &path, out)?;
        } else if ty.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(rel.join("/"));
            }
        }
    }
    Ok(())
}

pub(crate) fn remove_tree(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
