//! File-level promotion steps.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};

use crate::domain::candidate::{list_relative_files, remove_tree};
use crate::domain::Candidate;

/// Store namespace holding the signature of each live module.
pub const SIGNATURES_PREFIX: &str = "signatures/";

pub fn signature_key(module_id: &str) -> String {
    format!("{SIGNATURES_PREFIX}{module_id}")
}

/// Hex sha256 over `(path, bytes)` pairs taken in path order.
///
/// Each pair is framed by its lengths so different splits of the same bytes
/// never collide.
pub fn sign_files(files: &[(String, Vec<u8>)]) -> String {
    let mut sorted: Vec<&(String, Vec<u8>)> = files.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = Sha256::new();
    for (path, bytes) in sorted {
        hasher.update((path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

/// Candidate bytes captured once, before inspection.
///
/// Inspection reads these bytes, every sandbox run gets its own copy of them,
/// and promotion installs them. The staging tree is only compared against
/// the captured signature.
#[derive(Debug, Clone)]
pub struct FrozenCandidate {
    pub files: Vec<(String, Vec<u8>)>,
    pub signature: String,
}

impl FrozenCandidate {
    /// Seal the staged files and read them.
    pub fn capture(candidate: &Candidate) -> io::Result<Self> {
        candidate.seal()?;
        let files = candidate.read_files()?;
        let signature = sign_files(&files);
        Ok(Self { files, signature })
    }

    /// Python sources as the inspector takes them.
    pub fn sources(&self) -> Vec<(String, String)> {
        self.files
            .iter()
            .filter(|(rel, _)| rel.ends_with(".py"))
            .map(|(rel, bytes)| (rel.clone(), String::from_utf8_lossy(bytes).into_owned()))
            .collect()
    }

    /// True when `root` holds exactly the captured files and bytes.
    pub fn matches(&self, root: &Path) -> io::Result<bool> {
        let mut current = Vec::with_capacity(self.files.len());
        for rel in list_relative_files(root)? {
            let bytes = fs::read(root.join(&rel))?;
            current.push((rel, bytes));
        }
        Ok(sign_files(&current) == self.signature)
    }

    /// Write the captured files under `dir` as read-only files.
    pub fn materialize(&self, dir: &Path) -> io::Result<()> {
        for (rel, bytes) in &self.files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, bytes)?;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&path, perms)?;
        }
        Ok(())
    }
}

fn sibling(live_dir: &Path, tag: &str) -> PathBuf {
    let name = live_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    live_dir.with_file_name(format!(".{name}.{tag}"))
}

/// Replace `live_dir` with exactly `files`.
///
/// The new tree is written next to the live one and swapped in by rename, so
/// readers see either the old version or the new one.
pub fn install(live_dir: &Path, files: &[(String, Vec<u8>)], run_tag: &str) -> std::io::Result<()> {
    let incoming = sibling(live_dir, &format!("incoming-{run_tag}"));
    let outgoing = sibling(live_dir, &format!("outgoing-{run_tag}"));
    remove_tree(&incoming)?;
    for (rel, bytes) in files {
        let path = incoming.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
    }
    fs::create_dir_all(&incoming)?;

    let had_live = live_dir.exists();
    if had_live {
        fs::rename(live_dir, &outgoing)?;
    }
    if let Err(e) = fs::rename(&incoming, live_dir) {
        if had_live {
            fs::rename(&outgoing, live_dir)?;
        }
        remove_tree(&incoming)?;
        return Err(e);
    }
    remove_tree(&outgoing)
}
