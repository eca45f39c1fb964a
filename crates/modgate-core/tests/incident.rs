//! Incident handling: severity-driven repair actions, approvals and limits.

use std::sync::Arc;

use modgate_core::config::Layout;
use modgate_core::{
    CoordinationStore, FileNotifier, Incident, ManagerSettings, ModuleStatus, PipelineError,
    PipelineManager, PipelineRequest, RateLimit, RepairAction, RepairResult, ScriptedSandbox,
    SourceGenerator,
};
use modgate_state::fakes::MemoryBackend;
use serde_json::json;
use tempfile::TempDir;

const V1: &str = "def init(config=None):\n    return {}\n\ndef execute(payload=None):\n    return {'v': 1}\n\ndef cleanup(payload=None):\n    return None\n";
const V2: &str = "def init(config=None):\n    return {}\n\ndef execute(payload=None):\n    return {'v': 2}\n\ndef cleanup(payload=None):\n    return None\n";

struct Harness {
    _tmp: TempDir,
    layout: Layout,
    manager: PipelineManager,
}

impl Harness {
    fn new(settings: ManagerSettings) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        let manager = PipelineManager::builder(
            CoordinationStore::new(Arc::new(MemoryBackend::new())),
            layout.clone(),
        )
        .settings(settings)
        .sandbox(Arc::new(ScriptedSandbox::passing(json!({}))))
        .build();
        Self {
            _tmp: tmp,
            layout,
            manager,
        }
    }

    async fn promote(&self, module_id: &str, source: &str) {
        let gen = SourceGenerator::single(format!("{module_id}.py"), source);
        let result = self
            .manager
            .run_with(&gen, &PipelineRequest::new(module_id, "connector", "tcp"))
            .await;
        assert!(result.promoted, "{:?}", result.reason);
    }

    fn live_source(&self, module_id: &str) -> String {
        std::fs::read_to_string(
            self.layout
                .live_dir("connector", module_id)
                .join(format!("{module_id}.py")),
        )
        .unwrap()
    }

    fn notifications(&self) -> Vec<modgate_core::Notification> {
        FileNotifier::new(self.layout.notifications()).list().unwrap()
    }
}

fn incident(module_id: &str, severity: u8) -> Incident {
    Incident::new(module_id, "module misbehaved").with_severity(severity)
}

#[tokio::test]
async fn low_severity_notifies_an_operator() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;

    let result = h.manager.handle_incident(incident("m1", 2)).await.unwrap();
    assert_eq!(result.action, RepairAction::Notify);
    assert!(result.success);

    let cid = result.details["correlation_id"].as_str().unwrap();
    let notes = h.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].correlation_id, cid);
    assert_eq!(notes[0].status, "pending");
    assert_eq!(notes[0].payload["incident"]["module_id"], "m1");
}

#[tokio::test]
async fn critical_incident_disables_the_module() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;

    let result = h
        .manager
        .handle_incident(Incident::new("m1", "security breach detected"))
        .await
        .unwrap();
    assert_eq!(result.severity, 9);
    assert_eq!(result.action, RepairAction::Disable);
    assert!(result.success, "{}", result.reason);

    let entry = h.manager.registry().require("m1").await.unwrap();
    assert_eq!(entry.status, ModuleStatus::Disabled);
    assert!(h.layout.live_dir("connector", "m1").exists());
}

#[tokio::test]
async fn rollback_restores_the_previous_version() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;
    h.promote("m1", V2).await;
    assert!(h.live_source("m1").contains("'v': 2"));

    let result = h.manager.handle_incident(incident("m1", 7)).await.unwrap();
    assert_eq!(result.action, RepairAction::Rollback);
    assert!(result.success, "{}", result.reason);
    assert!(h.live_source("m1").contains("'v': 1"));

    let entry = h.manager.registry().require("m1").await.unwrap();
    assert_eq!(entry.version, 3);
    assert_eq!(entry.status, ModuleStatus::Active);
    assert_eq!(entry.signature, None);
    assert_eq!(entry.manifest["driver"], "tcp");
    assert_eq!(
        entry.manifest["restored_from"].as_str(),
        result.details["snapshot_id"].as_str()
    );
}

#[tokio::test]
async fn repeated_rollbacks_step_back_through_history() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;
    h.promote("m1", V2).await;
    h.promote("m1", V1).await;
    assert!(h.live_source("m1").contains("'v': 1"));

    let snapshots = h.manager.snapshots().list("m1").await.unwrap();
    let (first, entry) = h.manager.rollback("m1", None).await.unwrap();
    assert_eq!(first.snapshot_id, snapshots[2].snapshot_id);
    assert!(h.live_source("m1").contains("'v': 2"));
    assert_eq!(entry.previous_snapshot.as_deref(), Some(snapshots[1].snapshot_id.as_str()));

    let (second, _) = h.manager.rollback("m1", None).await.unwrap();
    assert_eq!(second.snapshot_id, snapshots[1].snapshot_id);
    assert!(h.live_source("m1").contains("'v': 1"));

    let (third, entry) = h.manager.rollback("m1", None).await.unwrap();
    assert!(third.is_empty());
    assert_eq!(entry.status, ModuleStatus::Disabled);
}

#[tokio::test]
async fn rolling_back_a_first_version_disables_it() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;

    let (snapshot, entry) = h.manager.rollback("m1", None).await.unwrap();
    assert!(snapshot.is_empty());
    assert_eq!(entry.status, ModuleStatus::Disabled);
    assert!(!h.layout.live_dir("connector", "m1").exists());
}

#[tokio::test]
async fn explicit_snapshot_rollback() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;
    h.promote("m1", V2).await;
    h.promote("m1", V1).await;

    let snapshots = h.manager.snapshots().list("m1").await.unwrap();
    assert_eq!(snapshots.len(), 3);
    // Taken before the third promotion, so it holds V2.
    let target = &snapshots[2];
    h.manager
        .rollback("m1", Some(&target.snapshot_id))
        .await
        .unwrap();
    assert!(h.live_source("m1").contains("'v': 2"));
}

#[tokio::test]
async fn moderate_incident_regenerates() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;

    let result = h.manager.handle_incident(incident("m1", 5)).await.unwrap();
    assert_eq!(result.action, RepairAction::Regenerate);
    assert!(result.success, "{}", result.reason);
    assert_eq!(result.attempts, 1);

    let entry = h.manager.registry().require("m1").await.unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.manifest["generator"], "template");
    assert_eq!(entry.manifest["driver"], "tcp");
    assert!(h
        .layout
        .live_dir("connector", "m1")
        .join("connector_m1_execute.py")
        .exists());
}

#[tokio::test]
async fn protected_modules_are_only_reported() {
    let mut settings = ManagerSettings::default();
    settings.repair.protected_modules = vec!["core".into()];
    let h = Harness::new(settings);
    h.promote("core", V1).await;

    let result = h.manager.handle_incident(incident("core", 10)).await.unwrap();
    assert_eq!(result.action, RepairAction::Notify);
    assert_eq!(result.details["selected_action"], "disable");
    assert_eq!(
        h.manager.registry().require("core").await.unwrap().status,
        ModuleStatus::Active
    );
    assert_eq!(h.notifications().len(), 1);
}

#[tokio::test]
async fn approval_gates_the_repair() {
    let mut settings = ManagerSettings::default();
    settings.repair.require_approval = vec![RepairAction::Disable];
    let h = Harness::new(settings);
    h.promote("m1", V1).await;

    let parked = h.manager.handle_incident(incident("m1", 9)).await.unwrap();
    assert!(parked.pending_approval);
    assert!(!parked.success);
    assert_eq!(
        h.manager.registry().require("m1").await.unwrap().status,
        ModuleStatus::Active
    );

    let pending = h.manager.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    let cid = pending[0].correlation_id.clone();
    assert_eq!(parked.details["correlation_id"], cid.as_str());

    let approved = h.manager.approve(&cid).await.unwrap();
    assert!(approved.success, "{}", approved.reason);
    assert_eq!(
        h.manager.registry().require("m1").await.unwrap().status,
        ModuleStatus::Disabled
    );
    assert!(h.manager.pending_approvals().await.unwrap().is_empty());

    match h.manager.approve(&cid).await {
        Err(PipelineError::ApprovalNotFound(id)) => assert_eq!(id, cid),
        other => panic!("expected ApprovalNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn rejected_approval_does_nothing() {
    let mut settings = ManagerSettings::default();
    settings.repair.require_approval = vec![RepairAction::Rollback];
    let h = Harness::new(settings);
    h.promote("m1", V1).await;
    h.promote("m1", V2).await;

    let parked = h.manager.handle_incident(incident("m1", 7)).await.unwrap();
    let cid = parked.details["correlation_id"].as_str().unwrap().to_string();
    let pending = h.manager.reject(&cid).await.unwrap();
    assert_eq!(pending.action, RepairAction::Rollback);
    assert!(h.live_source("m1").contains("'v': 2"));
    assert!(h.manager.pending_approvals().await.unwrap().is_empty());
}

#[tokio::test]
async fn repair_rate_limit_refuses_without_acting() {
    let mut settings = ManagerSettings::default();
    settings.rate_limits.insert(
        "disable".into(),
        RateLimit {
            per_hour: Some(1),
            per_day: None,
        },
    );
    let h = Harness::new(settings);
    h.promote("m1", V1).await;
    h.promote("m2", V1).await;

    assert!(h.manager.handle_incident(incident("m1", 9)).await.unwrap().success);
    let refused = h.manager.handle_incident(incident("m2", 9)).await.unwrap();
    assert!(refused.rate_limited);
    assert!(!refused.success);
    assert!(refused.reason.contains("disable"));
    assert_eq!(
        h.manager.registry().require("m2").await.unwrap().status,
        ModuleStatus::Active
    );
}

#[tokio::test]
async fn refused_action_does_not_use_a_repair_slot() {
    let mut settings = ManagerSettings::default();
    settings.rate_limits.insert(
        "repair".into(),
        RateLimit {
            per_hour: Some(2),
            per_day: None,
        },
    );
    settings.rate_limits.insert(
        "disable".into(),
        RateLimit {
            per_hour: Some(1),
            per_day: None,
        },
    );
    let h = Harness::new(settings);
    h.promote("m1", V1).await;
    h.promote("m2", V1).await;

    assert!(h.manager.handle_incident(incident("m1", 9)).await.unwrap().success);
    for _ in 0..3 {
        assert!(h.manager.handle_incident(incident("m2", 9)).await.unwrap().rate_limited);
    }
    let notified = h.manager.handle_incident(incident("m2", 2)).await.unwrap();
    assert_eq!(notified.action, RepairAction::Notify);
    assert!(!notified.rate_limited, "{}", notified.reason);
    assert!(h.manager.handle_incident(incident("m2", 2)).await.unwrap().rate_limited);
}

#[tokio::test]
async fn approval_rechecks_rate_limits() {
    let mut settings = ManagerSettings::default();
    settings.repair.require_approval = vec![RepairAction::Disable];
    settings.rate_limits.insert(
        "disable".into(),
        RateLimit {
            per_hour: Some(1),
            per_day: None,
        },
    );
    let h = Harness::new(settings);
    h.promote("m1", V1).await;
    h.promote("m2", V1).await;

    let first = h.manager.handle_incident(incident("m1", 9)).await.unwrap();
    let second = h.manager.handle_incident(incident("m2", 9)).await.unwrap();
    assert!(first.pending_approval && second.pending_approval);

    let cid = |r: &RepairResult| r.details["correlation_id"].as_str().unwrap().to_string();
    assert!(h.manager.approve(&cid(&first)).await.unwrap().success);
    match h.manager.approve(&cid(&second)).await {
        Err(PipelineError::RateLimited { action, .. }) => assert_eq!(action, "disable"),
        other => panic!("expected RateLimited, got {:?}", other),
    }
    let pending = h.manager.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].incident.module_id, "m2");
    assert_eq!(
        h.manager.registry().require("m2").await.unwrap().status,
        ModuleStatus::Active
    );
}

#[tokio::test]
async fn failed_repair_is_escalated() {
    let h = Harness::new(ManagerSettings::default());

    let result = h.manager.handle_incident(incident("ghost", 7)).await.unwrap();
    assert_eq!(result.action, RepairAction::Rollback);
    assert!(!result.success);
    assert!(result.reason.contains("ghost"));

    let cid = result.details["escalation"].as_str().unwrap();
    let note = FileNotifier::new(h.layout.notifications())
        .read(cid)
        .unwrap()
        .unwrap();
    assert_eq!(note.payload["kind"], "repair_failed");
}

#[tokio::test]
async fn invalid_module_id_is_an_error() {
    let h = Harness::new(ManagerSettings::default());
    assert!(matches!(
        h.manager.handle_incident(incident("a/b", 9)).await,
        Err(PipelineError::Registry(_))
    ));
}

#[tokio::test]
async fn operator_can_reenable_a_module() {
    let h = Harness::new(ManagerSettings::default());
    h.promote("m1", V1).await;
    h.manager
        .set_module_status("m1", ModuleStatus::Disabled)
        .await
        .unwrap();
    let entry = h
        .manager
        .set_module_status("m1", ModuleStatus::Active)
        .await
        .unwrap();
    assert!(entry.is_active());

    let actions: Vec<_> = h
        .manager
        .audit_log()
        .tail(100)
        .unwrap()
        .into_iter()
        .filter(|r| r.action == "registry.status")
        .map(|r| r.outcome)
        .collect();
    assert_eq!(actions, vec!["disabled", "active"]);
}
