//! Candidate generators.
//!
//! A generator materializes a candidate's files in its own staging
//! directory, `<staging_root>/<category>/<module_id>-<run_id>/`, and returns
//! the [`Candidate`] describing them.

use std::path::{Component, Path};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::candidate::{list_relative_files, remove_tree};
use crate::domain::Candidate;
use crate::registry::validate_identifier;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("generator io: {0}")]
    Io(#[from] std::io::Error),
}

pub type GenerateResult<T> = std::result::Result<T, GenerateError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub module_id: String,
    pub category: String,
    pub driver: String,
    pub run_id: Uuid,
}

impl GenerateRequest {
    pub fn new(
        module_id: impl Into<String>,
        category: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            category: category.into(),
            driver: driver.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn validate(&self) -> GenerateResult<()> {
        for (what, value) in [("module id", &self.module_id), ("category", &self.category)] {
            validate_identifier(what, value)
                .map_err(|e| GenerateError::InvalidRequest(e.to_string()))?;
        }
        if self.driver.trim().is_empty() {
            return Err(GenerateError::InvalidRequest("driver must not be empty".into()));
        }
        Ok(())
    }

    fn staging_dir(&self, staging_root: &Path) -> std::path::PathBuf {
        staging_root
            .join(&self.category)
            .join(format!("{}-{}", self.module_id, self.run_id))
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerateRequest,
        staging_root: &Path,
    ) -> GenerateResult<Candidate>;
}

/// Write `files` into a fresh staging directory and describe the result.
fn stage(
    request: &GenerateRequest,
    staging_root: &Path,
    files: &[(String, String)],
    generator: &str,
) -> GenerateResult<Candidate> {
    request.validate()?;
    if files.is_empty() {
        return Err(GenerateError::InvalidRequest("candidate has no files".into()));
    }
    let root = request.staging_dir(staging_root);
    remove_tree(&root)?;
    std::fs::create_dir_all(&root)?;
    for (rel, body) in files {
        let path = Path::new(rel);
        if path.is_absolute() || path.components().any(|c| !matches!(c, Component::Normal(_))) {
            remove_tree(&root)?;
            return Err(GenerateError::InvalidRequest(format!(
                "file path `{rel}` must stay inside the candidate"
            )));
        }
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, body)?;
    }
    Ok(Candidate {
        module_id: request.module_id.clone(),
        category: request.category.clone(),
        driver: request.driver.clone(),
        run_id: request.run_id,
        files: list_relative_files(&root)?,
        root,
        manifest: serde_json::json!({
            "generator": generator,
            "driver": request.driver,
            "run_id": request.run_id,
            "generated_at": chrono::Utc::now(),
        }),
    })
}

// ---------------------------------------------------------------------------
// TemplateGenerator
// ---------------------------------------------------------------------------

/// Writes `{category}_{module_id}_{init,execute,cleanup}.py` from templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator;

impl TemplateGenerator {
    pub fn render(request: &GenerateRequest) -> Vec<(String, String)> {
        let stem = format!("{}_{}", request.category, request.module_id);
        let header = format!(
            "\"\"\"Module {stem}\n\nCategory: {}\nDriver: {}\n\"\"\"\n",
            request.category,
            python_str(&request.driver)
        );
        let driver = python_str(&request.driver);
        vec![
            (
                format!("{stem}_init.py"),
                format!(
                    "{header}\nDRIVER = \"{driver}\"\n\n\ndef init(config=None):\n    config = config or {{}}\n    return {{\n        \"status\": \"initialized\",\n        \"driver\": DRIVER,\n        \"timeout_ms\": config.get(\"timeout_ms\", 30000),\n    }}\n"
                ),
            ),
            (
                format!("{stem}_execute.py"),
                format!(
                    "{header}\nDRIVER = \"{driver}\"\n\n\ndef execute(payload=None):\n    payload = payload or {{}}\n    action = payload.get(\"action\", \"default\")\n    data = payload.get(\"data\", {{}})\n    return {{\n        \"status\": \"ok\",\n        \"driver\": DRIVER,\n        \"action\": action,\n        \"items\": len(data) if hasattr(data, \"__len__\") else 1,\n    }}\n"
                ),
            ),
            (
                format!("{stem}_cleanup.py"),
                format!(
                    "{header}\n\ndef cleanup(payload=None):\n    return {{\"status\": \"cleaned\", \"driver\": \"{driver}\"}}\n"
                ),
            ),
        ]
    }
}

/// Escape for a double-quoted Python string literal.
fn python_str(s: &str) -> String {
    s.chars()
        .flat_map(|c| match c {
            '\\' => vec!['\\', '\\'],
            '"' => vec!['\\', '"'],
            '\n' => vec!['\\', 'n'],
            c if c.is_control() => Vec::new(),
            c => vec![c],
        })
        .collect()
}

#[async_trait]
impl Generator for TemplateGenerator {
    async fn generate(
        &self,
        request: &GenerateRequest,
        staging_root: &Path,
    ) -> GenerateResult<Candidate> {
        let files = Self::render(request);
        let request = request.clone();
        let staging_root = staging_root.to_path_buf();
        tokio::task::spawn_blocking(move || stage(&request, &staging_root, &files, "template"))
            .await
            .map_err(|e| GenerateError::Io(std::io::Error::other(e)))?
    }
}

// ---------------------------------------------------------------------------
// SourceGenerator
// ---------------------------------------------------------------------------

/// Materializes caller-supplied source files.
#[derive(Debug, Clone, Default)]
pub struct SourceGenerator {
    files: Vec<(String, String)>,
}

impl SourceGenerator {
    pub fn new(files: Vec<(String, String)>) -> Self {
        Self { files }
    }

    /// Single-file candidate.
    pub fn single(file_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(vec![(file_name.into(), source.into())])
    }

    /// Load every file under `dir`.
    pub fn from_dir(dir: &Path) -> GenerateResult<Self> {
        let mut files = Vec::new();
        for rel in list_relative_files(dir)? {
            let body = std::fs::read_to_string(dir.join(&rel))?;
            files.push((rel, body));
        }
        if files.is_empty() {
            return Err(GenerateError::InvalidRequest(format!(
                "{} contains no files",
                dir.display()
            )));
        }
        Ok(Self { files })
    }
}

#[async_trait]
impl Generator for SourceGenerator {
    async fn generate(
        &self,
        request: &GenerateRequest,
        staging_root: &Path,
    ) -> GenerateResult<Candidate> {
        stage(request, staging_root, &self.files, "source")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::Inspector;

    #[tokio::test]
    async fn template_writes_three_entry_files() {
        let tmp = tempfile::tempdir().unwrap();
        let req = GenerateRequest::new("m1", "connector", "tcp");
        let candidate = TemplateGenerator.generate(&req, tmp.path()).await.unwrap();
        assert_eq!(
            candidate.files,
            vec![
                "connector_m1_cleanup.py",
                "connector_m1_execute.py",
                "connector_m1_init.py"
            ]
        );
        assert!(candidate
            .root
            .starts_with(tmp.path().join("connector")));
        assert!(candidate.root.ends_with(format!("m1-{}", req.run_id)));
    }

    #[tokio::test]
    async fn template_output_passes_inspection() {
        let tmp = tempfile::tempdir().unwrap();
        let req = GenerateRequest::new("m1", "sensor", "i2c \"bus\"");
        let candidate = TemplateGenerator.generate(&req, tmp.path()).await.unwrap();
        let report = Inspector::default().inspect(&candidate.root).unwrap();
        assert!(report.ok, "{:?}", report.issues);
        assert_eq!(report.entry_file(), Some("sensor_m1_execute.py"));
    }

    #[tokio::test]
    async fn source_generator_rejects_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let gen = SourceGenerator::single("../evil.py", "x = 1\n");
        let req = GenerateRequest::new("m1", "connector", "src");
        match gen.generate(&req, tmp.path()).await {
            Err(GenerateError::InvalidRequest(msg)) => assert!(msg.contains("evil")),
            other => panic!("expected InvalidRequest, got {:?}", other),
        }
        assert!(!tmp.path().join("evil.py").exists());
    }

    #[tokio::test]
    async fn invalid_module_id_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let req = GenerateRequest::new("a/b", "connector", "x");
        assert!(matches!(
            TemplateGenerator.generate(&req, tmp.path()).await,
            Err(GenerateError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn runs_get_separate_staging_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let gen = SourceGenerator::single("m.py", "def execute(p):\n    return p\n");
        let a = gen
            .generate(&GenerateRequest::new("m1", "c", "d"), tmp.path())
            .await
            .unwrap();
        let b = gen
            .generate(&GenerateRequest::new("m1", "c", "d"), tmp.path())
            .await
            .unwrap();
        assert_ne!(a.root, b.root);
        assert!(a.root.exists() && b.root.exists());
    }
}
