//! The pipeline manager.
//!
//! Candidates flow `Generated -> Inspected -> SandboxTested -> Promoted`, or
//! stop at `Rejected` / `Failed`. Generation, inspection and sandbox testing
//! run without any lock; only promotion and repairs take the per-module
//! `promote-<module_id>` lock. Sandbox runs hold a permit from a shared
//! semaphore of `workers` permits.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use modgate_state::{open_store, CoordinationStore, HeldLock};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{warn, Instrument};
use uuid::Uuid;

use super::promote::{install, sign_files, signature_key, FrozenCandidate};
use super::rate_limit::RateLimiter;
use super::repair::{select_action, PendingRepair, RepairAction, RepairResult, APPROVALS_PREFIX};
use super::result::{ErrorKind, PipelineOutcome, PipelineResult, PipelineStage};
use super::PipelineRequest;
use crate::audit::{AuditLog, AuditRecord};
use crate::config::{Layout, ModgateConfig, RateLimit, RepairSettings, SnapshotBackend};
use crate::domain::candidate::list_relative_files;
use crate::domain::{Candidate, ErrorClass, Incident, PipelineError, Result};
use crate::generator::{GenerateError, GenerateRequest, Generator, TemplateGenerator};
use crate::inspector::{InspectError, InspectionReport, Inspector, InspectorConfig};
use crate::metrics::METRICS;
use crate::notify::{FileNotifier, Notifier};
use crate::obs;
use crate::registry::{
    promote_lock_key, validate_identifier, ModuleRegistry, ModuleStatus, Promotion, RegistryEntry,
};
use crate::sandbox::{
    ExecutionState, IsolationMode, ProcessSandbox, ResourceLimits, SandboxError, SandboxInvocation,
    SandboxResult, SandboxRunner,
};
use crate::snapshot::{FsSnapshotStore, GitSnapshotStore, SnapshotError, SnapshotRef, SnapshotStore};

const INSPECTION_FAILED: &str = "failed inspection";
const TESTING_FAILED: &str = "failed testing";

/// Runtime knobs, usually taken from [`ModgateConfig`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub workers: usize,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub test_payloads: Vec<Value>,
    pub limits: ResourceLimits,
    pub sandbox_timeout: Duration,
    pub strict_inspection: bool,
    /// Candidates may open network connections while tested.
    pub allow_network: bool,
    /// Runs without full confinement fail testing.
    pub require_isolation: bool,
    pub repair: RepairSettings,
    pub rate_limits: BTreeMap<String, RateLimit>,
}

impl ManagerSettings {
    pub fn from_config(config: &ModgateConfig) -> Self {
        Self {
            workers: config.pipeline.workers,
            lock_ttl: config.pipeline.lock_ttl(),
            lock_wait: config.pipeline.lock_wait(),
            test_payloads: config.pipeline.test_payloads.clone(),
            limits: config.sandbox.limits(),
            sandbox_timeout: config.sandbox.timeout(),
            strict_inspection: config.pipeline.strict_inspection,
            allow_network: config.sandbox.allow_network,
            require_isolation: config.sandbox.isolation == IsolationMode::Required,
            repair: config.repair.clone(),
            rate_limits: config.rate_limits.clone(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&ModgateConfig::default())
    }
}

struct Inner {
    store: CoordinationStore,
    registry: ModuleRegistry,
    layout: Layout,
    settings: ManagerSettings,
    generator: Arc<dyn Generator>,
    inspector: Inspector,
    sandbox: Arc<dyn SandboxRunner>,
    snapshots: Arc<dyn SnapshotStore>,
    notifier: Arc<dyn Notifier>,
    audit: AuditLog,
    limiter: RateLimiter,
    workers: Arc<Semaphore>,
}

/// Every collaborator is injected; see [`PipelineManager::builder`].
#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("root", &self.inner.layout.root)
            .field("workers", &self.inner.settings.workers)
            .finish()
    }
}

pub struct PipelineManagerBuilder {
    store: CoordinationStore,
    layout: Layout,
    settings: ManagerSettings,
    generator: Option<Arc<dyn Generator>>,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PipelineManagerBuilder {
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Unset collaborators default to the template generator, the process
    /// sandbox, file-copy snapshots and file notifications under the layout.
    pub fn build(self) -> PipelineManager {
        let layout = self.layout;
        let settings = self.settings;
        let inspector = Inspector::new(InspectorConfig {
            strict: settings.strict_inspection,
            ..InspectorConfig::default()
        });
        let inner = Inner {
            registry: ModuleRegistry::new(self.store.clone()),
            store: self.store,
            generator: self.generator.unwrap_or_else(|| Arc::new(TemplateGenerator)),
            sandbox: self
                .sandbox
                .unwrap_or_else(|| Arc::new(ProcessSandbox::default())),
            snapshots: self
                .snapshots
                .unwrap_or_else(|| Arc::new(FsSnapshotStore::new(layout.snapshots()))),
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(FileNotifier::new(layout.notifications()))),
            audit: AuditLog::new(layout.audit_log()),
            limiter: RateLimiter::new(settings.rate_limits.clone()),
            workers: Arc::new(Semaphore::new(settings.workers.max(1))),
            inspector,
            layout,
            settings,
        };
        PipelineManager {
            inner: Arc::new(inner),
        }
    }
}

type Verdict = (PipelineOutcome, Option<String>);

struct Promoted {
    version: u64,
    snapshot_id: String,
    signature: String,
}

fn error_kind(err: &PipelineError) -> ErrorKind {
    if err.is_lock_timeout() {
        ErrorKind::LockTimeout
    } else if err.is_store_unavailable() {
        ErrorKind::StoreUnavailable
    } else if matches!(err, PipelineError::Sandbox(SandboxError::CrashedOnLaunch { .. })) {
        ErrorKind::SandboxLaunch
    } else {
        ErrorKind::Internal
    }
}

fn error_details(err: &PipelineError) -> Value {
    json!({ "error": err.to_string(), "class": err.kind() })
}

/// Add `key` to an object, wrapping a non-object value first.
fn attach(details: &mut Value, key: &str, value: Value) {
    if details.is_null() {
        *details = json!({});
    } else if !details.is_object() {
        *details = json!({ "detail": details.take() });
    }
    if let Some(map) = details.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

impl PipelineManager {
    pub fn builder(store: CoordinationStore, layout: Layout) -> PipelineManagerBuilder {
        PipelineManagerBuilder {
            store,
            layout,
            settings: ManagerSettings::default(),
            generator: None,
            sandbox: None,
            snapshots: None,
            notifier: None,
        }
    }

    /// Open the configured store and wire the production collaborators.
    pub async fn from_config(config: &ModgateConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.store_config()).await?;
        let layout = config.layout();
        let snapshots: Arc<dyn SnapshotStore> = match config.snapshots.backend {
            SnapshotBackend::Files => Arc::new(FsSnapshotStore::new(layout.snapshots())),
            SnapshotBackend::Git => {
                Arc::new(GitSnapshotStore::new(layout.modules(), layout.snapshots()))
            }
        };
        Ok(Self::builder(store, layout)
            .settings(ManagerSettings::from_config(config))
            .sandbox(Arc::new(ProcessSandbox::new(config.sandbox.process_config())))
            .snapshots(snapshots)
            .build())
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub fn snapshots(&self) -> &dyn SnapshotStore {
        self.inner.snapshots.as_ref()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    async fn audit(&self, record: AuditRecord) {
        if let Err(e) = self.inner.audit.append(record).await {
            warn!(error = %e, "failed to append audit record");
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline runs
    // -----------------------------------------------------------------------

    /// Run one candidate from the configured generator to a terminal outcome.
    pub async fn run_pipeline(&self, module_id: &str, category: &str, driver: &str) -> PipelineResult {
        let request = PipelineRequest::new(module_id, category, driver);
        self.run_with(self.inner.generator.as_ref(), &request).await
    }

    /// Same as [`PipelineManager::run_pipeline`] with an explicit generator.
    pub async fn run_with(&self, generator: &dyn Generator, request: &PipelineRequest) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let span = obs::pipeline_span(&request.module_id, &run_id.to_string());
        self.execute(generator, request, run_id).instrument(span).await
    }

    /// Run many pipelines concurrently with the configured generator.
    pub async fn run_many(&self, requests: Vec<PipelineRequest>) -> Vec<PipelineResult> {
        let handles: Vec<_> = requests
            .iter()
            .cloned()
            .map(|request| {
                let this = self.clone();
                tokio::spawn(async move {
                    let generator = this.inner.generator.clone();
                    this.run_with(generator.as_ref(), &request).await
                })
            })
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for (request, joined) in requests.iter().zip(join_all(handles).await) {
            results.push(joined.unwrap_or_else(|e| {
                let mut result =
                    PipelineResult::new(&request.module_id, &request.category, Uuid::nil());
                result.details = json!({ "error": e.to_string() });
                result.finish(
                    PipelineOutcome::Error {
                        kind: ErrorKind::Internal,
                    },
                    Some(format!("pipeline task failed: {e}")),
                );
                result
            }));
        }
        results
    }

    async fn execute(
        &self,
        generator: &dyn Generator,
        request: &PipelineRequest,
        run_id: Uuid,
    ) -> PipelineResult {
        let started = Instant::now();
        METRICS.inc_pipelines_started();
        obs::emit_pipeline_started(&request.module_id, &request.category, &request.driver);

        let mut result = PipelineResult::new(&request.module_id, &request.category, run_id);
        let (outcome, reason) = match self.drive(generator, request, &mut result).await {
            Ok(verdict) => verdict,
            Err(err) => {
                attach(&mut result.details, "error", error_details(&err));
                match err.kind() {
                    _ if matches!(err, PipelineError::RateLimited { .. }) => {
                        (PipelineOutcome::RateLimited, Some(err.to_string()))
                    }
                    ErrorClass::Policy | ErrorClass::Candidate => {
                        (PipelineOutcome::Rejected, Some(err.to_string()))
                    }
                    ErrorClass::Infrastructure => (
                        PipelineOutcome::Error {
                            kind: error_kind(&err),
                        },
                        Some(err.to_string()),
                    ),
                }
            }
        };
        self.conclude(result, outcome, reason, started).await
    }

    async fn conclude(
        &self,
        mut result: PipelineResult,
        outcome: PipelineOutcome,
        reason: Option<String>,
        started: Instant,
    ) -> PipelineResult {
        match &outcome {
            PipelineOutcome::Promoted => METRICS.inc_promotions(),
            PipelineOutcome::Rejected => METRICS.inc_rejections(),
            PipelineOutcome::Failed => METRICS.inc_testing_failures(),
            PipelineOutcome::RateLimited => METRICS.inc_rate_limited(),
            PipelineOutcome::Error { kind } => {
                if *kind == ErrorKind::LockTimeout {
                    METRICS.inc_lock_timeouts();
                }
            }
        }
        result.finish(outcome, reason);
        result.duration_ms = started.elapsed().as_millis() as u64;
        let reason = result.reason.clone().unwrap_or_default();
        obs::emit_pipeline_finished(
            &result.module_id,
            result.outcome.label(),
            result.duration_ms,
            &reason,
        );
        self.audit(
            AuditRecord::new("pipeline.finished", &result.module_id, result.outcome.label())
                .with_run(result.run_id)
                .with_details(json!({
                    "reason": result.reason,
                    "version": result.version,
                    "snapshot_id": result.snapshot_id,
                    "signature": result.signature,
                    "details": result.details,
                    "duration_ms": result.duration_ms,
                })),
        )
        .await;
        result
    }

    async fn stage(&self, result: &mut PipelineResult, stage: PipelineStage) {
        result.record(stage);
        obs::emit_stage(&result.module_id, stage.as_str());
        self.audit(
            AuditRecord::new("pipeline.stage", &result.module_id, stage.as_str()).with_run(result.run_id),
        )
        .await;
    }

    async fn drive(
        &self,
        generator: &dyn Generator,
        request: &PipelineRequest,
        result: &mut PipelineResult,
    ) -> Result<Verdict> {
        self.inner.limiter.admit("pipeline")?;

        let generate = GenerateRequest {
            module_id: request.module_id.clone(),
            category: request.category.clone(),
            driver: request.driver.clone(),
            run_id: result.run_id,
        };
        let candidate = match generator
            .generate(&generate, &self.inner.layout.candidates())
            .await
        {
            Ok(candidate) => candidate,
            Err(GenerateError::InvalidRequest(msg)) => {
                attach(&mut result.details, "error", json!(msg));
                return Ok((
                    PipelineOutcome::Rejected,
                    Some(format!("failed generation: {msg}")),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        self.stage(result, PipelineStage::Generated).await;

        let verdict = self.evaluate(&candidate, result).await;
        if let Err(e) = candidate.discard() {
            warn!(root = %candidate.root.display(), error = %e, "failed to remove staging directory");
        }
        verdict
    }

    async fn evaluate(&self, candidate: &Candidate, result: &mut PipelineResult) -> Result<Verdict> {
        let frozen = Arc::new(FrozenCandidate::capture(candidate)?);

        let report = match self.inspect(candidate, &frozen).await {
            Ok(report) => report,
            Err(PipelineError::Inspect(InspectError::NoSources(path))) => {
                attach(
                    &mut result.details,
                    "issues",
                    json!([format!("no source files under {}", path.display())]),
                );
                self.stage(result, PipelineStage::Rejected).await;
                return Ok((PipelineOutcome::Rejected, Some(INSPECTION_FAILED.into())));
            }
            Err(e) => return Err(e),
        };
        let entry_file = report.entry_file().map(str::to_string);
        let passed = report.ok;
        attach(&mut result.details, "issues", json!(report.issue_messages()));
        result.inspection = Some(report);
        let Some(entry_file) = entry_file.filter(|_| passed) else {
            self.stage(result, PipelineStage::Rejected).await;
            return Ok((PipelineOutcome::Rejected, Some(INSPECTION_FAILED.into())));
        };
        self.stage(result, PipelineStage::Inspected).await;

        let tests = self.sandbox_test(&frozen, &entry_file).await?;
        let failure = tests.iter().find(|t| !t.ok).map(SandboxResult::summary);
        result.tests = tests;
        if let Some(summary) = failure {
            attach(&mut result.details, "failure", json!(summary));
            self.stage(result, PipelineStage::Failed).await;
            return Ok((PipelineOutcome::Failed, Some(TESTING_FAILED.into())));
        }
        self.stage(result, PipelineStage::SandboxTested).await;

        let promoted = self.promote(candidate, &frozen).await?;
        result.version = Some(promoted.version);
        result.snapshot_id = Some(promoted.snapshot_id);
        result.signature = Some(promoted.signature);
        self.stage(result, PipelineStage::Promoted).await;
        Ok((PipelineOutcome::Promoted, None))
    }

    /// Inspect the captured bytes, never the staging tree.
    async fn inspect(&self, candidate: &Candidate, frozen: &FrozenCandidate) -> Result<InspectionReport> {
        let sources = frozen.sources();
        if sources.is_empty() {
            return Err(InspectError::NoSources(candidate.root.clone()).into());
        }
        let inspector = self.inner.inspector.clone();
        let report = tokio::task::spawn_blocking(move || inspector.inspect_sources(&sources))
            .await
            .map_err(|e| PipelineError::Task(format!("inspection task failed: {e}")))?;
        Ok(report)
    }

    /// Run `execute` once per test payload, each on its own task and its own
    /// read-only copy of the candidate.
    async fn sandbox_test(
        &self,
        frozen: &Arc<FrozenCandidate>,
        entry_file: &str,
    ) -> Result<Vec<SandboxResult>> {
        let settings = &self.inner.settings;
        let handles: Vec<_> = settings
            .test_payloads
            .iter()
            .map(|payload| {
                let payload = payload.clone();
                let entry_file = entry_file.to_string();
                let frozen = Arc::clone(frozen);
                let limits = settings.limits.clone();
                let timeout = settings.sandbox_timeout;
                let runner = self.inner.sandbox.clone();
                let workers = self.inner.workers.clone();
                tokio::spawn(
                    async move {
                        let _permit = workers
                            .acquire_owned()
                            .await
                            .map_err(|_| SandboxError::launch("worker pool closed"))?;
                        let staged = Arc::clone(&frozen);
                        let run_dir = tokio::task::spawn_blocking(move || {
                            let dir = tempfile::Builder::new().prefix("modgate-run-").tempdir()?;
                            staged.materialize(dir.path())?;
                            Ok::<_, std::io::Error>(dir)
                        })
                        .await
                        .map_err(|e| PipelineError::Task(format!("staging task failed: {e}")))??;

                        let invocation = SandboxInvocation::new(run_dir.path(), &entry_file, "execute")
                            .with_payload(payload)
                            .with_limits(limits)
                            .with_timeout(timeout);
                        let run = runner.run(invocation).await?;

                        let unchanged = tokio::task::spawn_blocking(move || frozen.matches(run_dir.path()))
                            .await
                            .map_err(|e| PipelineError::Task(format!("verification task failed: {e}")))??;
                        Ok::<_, PipelineError>(if unchanged {
                            run
                        } else {
                            run.into_violation("candidate modified its own files while running")
                        })
                    }
                    .in_current_span(),
                )
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            let run = joined.map_err(|e| PipelineError::Task(format!("sandbox task failed: {e}")))?;
            let run = match run {
                Ok(run) => run,
                Err(e) => {
                    if let PipelineError::Sandbox(launch) = &e {
                        obs::emit_sandbox_launch_failed(entry_file, launch);
                    }
                    return Err(e);
                }
            };
            let isolation = run.isolation;
            let run = if settings.require_isolation && !isolation.satisfies(settings.allow_network) {
                run.into_violation(format!(
                    "ran without required isolation (network_isolated={}, filesystem_confined={})",
                    isolation.network_isolated, isolation.filesystem_confined
                ))
            } else {
                run
            };
            METRICS.inc_sandbox_runs();
            match run.state {
                ExecutionState::TimedOut => METRICS.inc_sandbox_timeouts(),
                ExecutionState::LimitExceeded => METRICS.inc_limit_kills(),
                _ => {}
            }
            obs::emit_sandbox_finished(
                entry_file,
                &format!("{:?}", run.state),
                run.ok,
                run.execution_time_ms,
            );
            results.push(run);
        }
        Ok(results)
    }

    /// Run `f` under `promote-<module_id>`, auditing acquisition and release.
    async fn with_module_lock<T, F, Fut>(&self, module_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(HeldLock) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = promote_lock_key(module_id);
        let settings = &self.inner.settings;
        let acquired = AtomicBool::new(false);
        let flag = &acquired;
        let outcome: Result<T> = self
            .inner
            .store
            .with_lock(&key, settings.lock_ttl, settings.lock_wait, |lock| async move {
                flag.store(true, Ordering::SeqCst);
                obs::emit_lock_acquired(lock.key(), lock.holder());
                self.audit(
                    AuditRecord::new("lock.acquire", module_id, "acquired")
                        .with_details(json!({ "key": lock.key(), "holder": lock.holder() })),
                )
                .await;
                f(lock).await
            })
            .await;

        if acquired.load(Ordering::SeqCst) {
            obs::emit_lock_released(&key);
            self.audit(
                AuditRecord::new("lock.release", module_id, "released").with_details(json!({ "key": key })),
            )
            .await;
        } else if let Err(e) = &outcome {
            if e.is_lock_timeout() {
                obs::emit_lock_timeout(&key);
                self.audit(
                    AuditRecord::new("lock.acquire", module_id, "timeout").with_details(json!({ "key": key })),
                )
                .await;
            }
        }
        outcome
    }

    async fn promote(&self, candidate: &Candidate, frozen: &Arc<FrozenCandidate>) -> Result<Promoted> {
        self.with_module_lock(&candidate.module_id, |lock| async move {
            self.promote_locked(&lock, candidate, frozen).await
        })
        .await
    }

    /// Install the captured bytes; the staging tree must still match them.
    async fn promote_locked(
        &self,
        lock: &HeldLock,
        candidate: &Candidate,
        frozen: &Arc<FrozenCandidate>,
    ) -> Result<Promoted> {
        let module_id = candidate.module_id.as_str();
        let staged = Arc::clone(frozen);
        let root = candidate.root.clone();
        let intact = tokio::task::spawn_blocking(move || staged.matches(&root))
            .await
            .map_err(|e| PipelineError::Task(format!("verification task failed: {e}")))??;
        if !intact {
            return Err(PipelineError::CandidateModified(module_id.to_string()));
        }

        if let Some(existing) = self.inner.registry.get(module_id).await? {
            if existing.category != candidate.category {
                return Err(PipelineError::NotPermitted(format!(
                    "module {module_id} is registered under category {}",
                    existing.category
                )));
            }
        }

        let live_dir = self.inner.layout.live_dir(&candidate.category, module_id);
        let snapshot = self.inner.snapshots.snapshot(module_id, &live_dir).await?;
        self.audit(
            AuditRecord::new("snapshot.taken", module_id, "ok")
                .with_run(candidate.run_id)
                .with_details(json!({ "snapshot_id": snapshot.snapshot_id, "files": snapshot.files.len() })),
        )
        .await;

        let signature = frozen.signature.clone();
        let previous_signature = self.inner.store.get(&signature_key(module_id)).await?;

        let tag = candidate.run_id.simple().to_string();
        let target = live_dir.clone();
        let staged = Arc::clone(frozen);
        tokio::task::spawn_blocking(move || install(&target, &staged.files, &tag))
            .await
            .map_err(|e| PipelineError::Task(format!("install task failed: {e}")))??;

        match self.commit(lock, candidate, &snapshot, &signature).await {
            Ok(entry) => Ok(Promoted {
                version: entry.version,
                snapshot_id: snapshot.snapshot_id,
                signature,
            }),
            Err(e) => {
                self.compensate(module_id, &snapshot, previous_signature).await;
                Err(e)
            }
        }
    }

    async fn commit(
        &self,
        lock: &HeldLock,
        candidate: &Candidate,
        snapshot: &SnapshotRef,
        signature: &str,
    ) -> Result<RegistryEntry> {
        self.inner
            .store
            .put_json(
                &signature_key(&candidate.module_id),
                &json!({
                    "signature": signature,
                    "run_id": candidate.run_id,
                    "signed_at": Utc::now(),
                }),
                None,
            )
            .await?;
        let entry = self
            .inner
            .registry
            .record_promotion(
                lock,
                Promotion {
                    module_id: candidate.module_id.clone(),
                    category: candidate.category.clone(),
                    file_manifest: candidate.files.clone(),
                    manifest: candidate.manifest.clone(),
                    signature: signature.to_string(),
                    previous_snapshot: Some(snapshot.snapshot_id.clone()),
                },
            )
            .await?;
        Ok(entry)
    }

    /// Undo a promotion whose files were installed but whose bookkeeping failed.
    async fn compensate(&self, module_id: &str, snapshot: &SnapshotRef, previous_signature: Option<Value>) {
        let restored = self.inner.snapshots.restore(snapshot).await;
        if let Err(e) = &restored {
            obs::emit_rollback_failed(module_id, e);
        }
        let key = signature_key(module_id);
        let reverted = match previous_signature {
            Some(value) => self.inner.store.put(&key, value, None).await,
            None => self.inner.store.delete(&key).await,
        };
        if let Err(e) = &reverted {
            warn!(module_id = %module_id, error = %e, "failed to revert signature");
        }
        let outcome = if restored.is_ok() { "restored" } else { "restore_failed" };
        self.audit(
            AuditRecord::new("pipeline.compensate", module_id, outcome)
                .with_details(json!({ "snapshot_id": snapshot.snapshot_id })),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Enable or disable a registered module.
    pub async fn set_module_status(&self, module_id: &str, status: ModuleStatus) -> Result<RegistryEntry> {
        let entry = self
            .with_module_lock(module_id, |lock| async move {
                Ok(self.inner.registry.set_status(&lock, module_id, status).await?)
            })
            .await?;
        self.audit(
            AuditRecord::new("registry.status", module_id, status.to_string())
                .with_details(json!({ "version": entry.version })),
        )
        .await;
        Ok(entry)
    }

    /// Restore a snapshot of a registered module and record the rollback.
    ///
    /// Without `snapshot_id` the snapshot taken before the current version
    /// was promoted is used, falling back to the module's latest snapshot.
    /// After a rollback the default target is the snapshot preceding the one
    /// restored.
    /// Restoring an empty snapshot removes the live files and disables the
    /// module.
    pub async fn rollback(
        &self,
        module_id: &str,
        snapshot_id: Option<&str>,
    ) -> Result<(SnapshotRef, RegistryEntry)> {
        let (snapshot, entry) = self
            .with_module_lock(module_id, |lock| async move {
                let current = self.inner.registry.require(module_id).await?;
                let target = match snapshot_id
                    .map(str::to_string)
                    .or(current.previous_snapshot.clone())
                {
                    Some(id) => self.inner.snapshots.get(module_id, &id).await?,
                    None => self.inner.snapshots.latest(module_id).await?.ok_or_else(|| {
                        SnapshotError::NotFound {
                            module_id: module_id.to_string(),
                            snapshot_id: "latest".to_string(),
                        }
                    })?,
                };
                self.inner.snapshots.restore(&target).await?;
                self.inner.store.delete(&signature_key(module_id)).await?;
                let entry = if target.is_empty() {
                    self.inner
                        .registry
                        .set_status(&lock, module_id, ModuleStatus::Disabled)
                        .await?
                } else {
                    let earlier = self
                        .inner
                        .snapshots
                        .list(module_id)
                        .await?
                        .into_iter()
                        .take_while(|s| s.snapshot_id != target.snapshot_id)
                        .last()
                        .map(|s| s.snapshot_id);
                    self.inner
                        .registry
                        .record_rollback(
                            &lock,
                            module_id,
                            target.file_manifest(),
                            &target.snapshot_id,
                            earlier,
                        )
                        .await?
                };
                Ok((target, entry))
            })
            .await?;
        self.audit(
            AuditRecord::new("snapshot.restore", module_id, "restored").with_details(json!({
                "snapshot_id": snapshot.snapshot_id,
                "version": entry.version,
                "status": entry.status,
            })),
        )
        .await;
        Ok((snapshot, entry))
    }

    /// Check the live files of a module against its stored signature.
    pub async fn verify_module(&self, module_id: &str) -> Result<String> {
        let entry = self.inner.registry.require(module_id).await?;
        let stored: Option<Value> = self.inner.store.get(&signature_key(module_id)).await?;
        let expected = stored
            .as_ref()
            .and_then(|v| v.get("signature"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::NotPermitted(format!("module {module_id} has no signature")))?;
        let live_dir = self.inner.layout.live_dir(&entry.category, module_id);
        let actual = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut files = Vec::new();
            for rel in list_relative_files(&live_dir)? {
                let bytes = std::fs::read(live_dir.join(&rel))?;
                files.push((rel, bytes));
            }
            Ok(sign_files(&files))
        })
        .await
        .map_err(|e| PipelineError::Task(format!("verify task failed: {e}")))??;
        if actual != expected {
            return Err(PipelineError::DigestMismatch { expected, actual });
        }
        Ok(actual)
    }

    // -----------------------------------------------------------------------
    // Incidents
    // -----------------------------------------------------------------------

    /// Choose and run the repair action for an incident.
    ///
    /// Repair failures are reported in the result, never retried here.
    pub async fn handle_incident(&self, incident: Incident) -> Result<RepairResult> {
        validate_identifier("module id", &incident.module_id)?;
        let severity = incident.effective_severity();
        let selected = select_action(severity, &self.inner.settings.repair.thresholds);
        obs::emit_repair_decided(&incident.module_id, severity, selected.as_str());
        METRICS.inc_repairs();

        let result = self.decide(&incident, severity, selected).await?;
        self.record_repair(&result, "repair").await;
        Ok(result)
    }

    async fn record_repair(&self, result: &RepairResult, prefix: &str) {
        obs::emit_repair_finished(&result.module_id, result.action.as_str(), result.success);
        let outcome = if result.pending_approval {
            "pending_approval"
        } else if result.rate_limited {
            "rate_limited"
        } else if result.success {
            "success"
        } else {
            "failed"
        };
        self.audit(
            AuditRecord::new(format!("{prefix}.{}", result.action), &result.module_id, outcome)
                .with_details(json!({
                    "severity": result.severity,
                    "attempts": result.attempts,
                    "reason": result.reason,
                    "details": result.details,
                })),
        )
        .await;
    }

    async fn decide(&self, incident: &Incident, severity: u8, selected: RepairAction) -> Result<RepairResult> {
        let module_id = incident.module_id.as_str();
        let policy = &self.inner.settings.repair;

        if policy.protected_modules.iter().any(|m| m == module_id) {
            let correlation_id = self
                .inner
                .notifier
                .notify(json!({
                    "kind": "protected_module",
                    "incident": incident,
                    "severity": severity,
                    "selected_action": selected,
                }))
                .await?;
            return Ok(RepairResult::new(module_id, severity, RepairAction::Notify).succeeded(
                "module is protected; operator notified",
                json!({ "correlation_id": correlation_id, "selected_action": selected }),
            ));
        }

        // Parked repairs are counted when they are approved.
        let buckets = ["repair", selected.as_str()];
        let parks = policy.require_approval.contains(&selected);
        let admitted = if parks {
            self.inner.limiter.check_all(&buckets)
        } else {
            self.inner.limiter.admit_all(&buckets)
        };
        if let Err(e) = admitted {
            METRICS.inc_rate_limited();
            let mut result =
                RepairResult::new(module_id, severity, selected).failed(e.to_string(), Value::Null);
            result.rate_limited = true;
            return Ok(result);
        }

        if parks {
            return self.park(incident, severity, selected).await;
        }

        let mut result = self.execute_repair(incident, severity, selected).await;
        if !result.success && policy.notify_on_failure {
            self.escalate(incident, &mut result).await;
        }
        Ok(result)
    }

    async fn park(&self, incident: &Incident, severity: u8, action: RepairAction) -> Result<RepairResult> {
        let correlation_id = self
            .inner
            .notifier
            .notify(json!({
                "kind": "approval_required",
                "incident": incident,
                "severity": severity,
                "action": action,
            }))
            .await?;
        let pending = PendingRepair {
            correlation_id: correlation_id.clone(),
            incident: incident.clone(),
            severity,
            action,
            requested_at: Utc::now(),
        };
        self.inner
            .store
            .put_json(&format!("{APPROVALS_PREFIX}{correlation_id}"), &pending, None)
            .await?;
        let mut result = RepairResult::new(&incident.module_id, severity, action).failed(
            format!("{action} awaits approval"),
            json!({ "correlation_id": correlation_id }),
        );
        result.pending_approval = true;
        Ok(result)
    }

    async fn escalate(&self, incident: &Incident, result: &mut RepairResult) {
        let sent = self
            .inner
            .notifier
            .notify(json!({
                "kind": "repair_failed",
                "incident": incident,
                "action": result.action,
                "reason": result.reason,
            }))
            .await;
        match sent {
            Ok(correlation_id) => attach(&mut result.details, "escalation", json!(correlation_id)),
            Err(e) => warn!(module_id = %incident.module_id, error = %e, "failed to escalate repair failure"),
        }
    }

    async fn execute_repair(&self, incident: &Incident, severity: u8, action: RepairAction) -> RepairResult {
        let module_id = incident.module_id.as_str();
        let mut result = RepairResult::new(module_id, severity, action);
        result.attempts = 1;
        let outcome = match action {
            RepairAction::Disable => self.repair_disable(module_id).await,
            RepairAction::Rollback => self.repair_rollback(module_id).await,
            RepairAction::Regenerate => return self.repair_regenerate(module_id, result).await,
            RepairAction::Notify => self.repair_notify(incident, severity).await,
        };
        match outcome {
            Ok((reason, details)) => result.succeeded(reason, details),
            Err(e) => result.failed(format!("{action} failed: {e}"), error_details(&e)),
        }
    }

    async fn repair_disable(&self, module_id: &str) -> Result<(String, Value)> {
        let entry = self.set_module_status(module_id, ModuleStatus::Disabled).await?;
        Ok((
            "module disabled".to_string(),
            json!({ "version": entry.version, "status": entry.status }),
        ))
    }

    async fn repair_rollback(&self, module_id: &str) -> Result<(String, Value)> {
        let (snapshot, entry) = self.rollback(module_id, None).await?;
        Ok((
            format!("restored snapshot {}", snapshot.snapshot_id),
            json!({
                "snapshot_id": snapshot.snapshot_id,
                "version": entry.version,
                "status": entry.status,
            }),
        ))
    }

    async fn repair_regenerate(&self, module_id: &str, mut result: RepairResult) -> RepairResult {
        let entry = match self.inner.registry.require(module_id).await {
            Ok(entry) => entry,
            Err(e) => {
                let err = PipelineError::from(e);
                return result.failed(format!("regenerate failed: {err}"), error_details(&err));
            }
        };
        let driver = entry
            .manifest
            .get("driver")
            .and_then(Value::as_str)
            .unwrap_or("template")
            .to_string();
        let request = PipelineRequest::new(module_id, &entry.category, driver);

        let mut runs = Vec::new();
        for attempt in 1..=self.inner.settings.repair.max_repair_attempts.max(1) {
            result.attempts = attempt;
            let run = self
                .run_with(self.inner.generator.as_ref(), &request)
                .await;
            let summary = json!({
                "run_id": run.run_id,
                "outcome": run.outcome.label(),
                "reason": run.reason,
                "version": run.version,
            });
            if run.promoted {
                return result.succeeded("regenerated and promoted", summary);
            }
            runs.push(summary);
        }
        let reason = runs
            .last()
            .and_then(|r| r.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("no promotion")
            .to_string();
        result.failed(format!("regenerate failed: {reason}"), json!({ "runs": runs }))
    }

    async fn repair_notify(&self, incident: &Incident, severity: u8) -> Result<(String, Value)> {
        let correlation_id = self
            .inner
            .notifier
            .notify(json!({ "kind": "incident", "incident": incident, "severity": severity }))
            .await?;
        Ok((
            "operator notified".to_string(),
            json!({ "correlation_id": correlation_id }),
        ))
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    pub async fn pending_approvals(&self) -> Result<Vec<PendingRepair>> {
        let mut pending = Vec::new();
        for key in self.inner.store.list_keys(APPROVALS_PREFIX).await? {
            if let Some(repair) = self.inner.store.get_json::<PendingRepair>(&key).await? {
                pending.push(repair);
            }
        }
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(pending)
    }

    /// Take a pending repair out of the store; at most one caller wins.
    async fn claim(&self, correlation_id: &str) -> Result<PendingRepair> {
        let key = format!("{APPROVALS_PREFIX}{correlation_id}");
        let lock_key = format!("approval-{correlation_id}");
        let settings = &self.inner.settings;
        self.inner
            .store
            .with_lock(&lock_key, settings.lock_ttl, settings.lock_wait, |_lock| async {
                let pending: PendingRepair = self
                    .inner
                    .store
                    .get_json(&key)
                    .await?
                    .ok_or_else(|| PipelineError::ApprovalNotFound(correlation_id.to_string()))?;
                self.inner.store.delete(&key).await?;
                Ok(pending)
            })
            .await
    }

    /// Execute a parked repair. A rate-limited approval leaves the repair
    /// parked.
    pub async fn approve(&self, correlation_id: &str) -> Result<RepairResult> {
        let pending = self.claim(correlation_id).await?;
        if let Err(e) = self
            .inner
            .limiter
            .admit_all(&["repair", pending.action.as_str()])
        {
            METRICS.inc_rate_limited();
            self.inner
                .store
                .put_json(&format!("{APPROVALS_PREFIX}{correlation_id}"), &pending, None)
                .await?;
            return Err(e);
        }
        let mut result = self
            .execute_repair(&pending.incident, pending.severity, pending.action)
            .await;
        attach(&mut result.details, "correlation_id", json!(correlation_id));
        if !result.success && self.inner.settings.repair.notify_on_failure {
            self.escalate(&pending.incident, &mut result).await;
        }
        self.record_repair(&result, "approval").await;
        Ok(result)
    }

    /// Discard a parked repair.
    pub async fn reject(&self, correlation_id: &str) -> Result<PendingRepair> {
        let pending = self.claim(correlation_id).await?;
        self.audit(
            AuditRecord::new(
                format!("approval.{}", pending.action),
                &pending.incident.module_id,
                "rejected",
            )
            .with_details(json!({ "correlation_id": correlation_id })),
        )
        .await;
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_wraps_scalars() {
        let mut v = Value::Null;
        attach(&mut v, "a", json!(1));
        assert_eq!(v, json!({ "a": 1 }));

        let mut v = json!("text");
        attach(&mut v, "b", json!(2));
        assert_eq!(v, json!({ "detail": "text", "b": 2 }));
    }

    #[test]
    fn lock_timeout_maps_to_its_kind() {
        let err = PipelineError::from(modgate_state::StoreError::LockTimeout {
            key: "promote-m".into(),
            waited_ms: 5,
        });
        assert_eq!(error_kind(&err), ErrorKind::LockTimeout);
        let err = PipelineError::from(modgate_state::StoreError::Unavailable("disk".into()));
        assert_eq!(error_kind(&err), ErrorKind::StoreUnavailable);
        let err = PipelineError::from(SandboxError::CrashedOnLaunch { reason: "x".into() });
        assert_eq!(error_kind(&err), ErrorKind::SandboxLaunch);
    }

    #[test]
    fn settings_follow_config() {
        let mut config = ModgateConfig::default();
        config.pipeline.workers = 2;
        config.sandbox.timeout_secs = 3;
        let settings = ManagerSettings::from_config(&config);
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.sandbox_timeout, Duration::from_secs(3));
        assert_eq!(settings.test_payloads.len(), 1);
    }
}
