//! Pipeline manager: generate, inspect, sandbox-test, promote; plus the
//! incident repair path.
//!
//! - [`manager`]: `PipelineManager` and its builder
//! - [`result`]: `PipelineResult`, `PipelineOutcome`, stages
//! - [`repair`]: `RepairAction` selection and `RepairResult`
//! - [`promote`]: file install and content signatures
//! - [`rate_limit`]: hourly/daily action ceilings

pub mod manager;
pub mod promote;
pub mod rate_limit;
pub mod repair;
pub mod result;

use serde::{Deserialize, Serialize};

pub use manager::{ManagerSettings, PipelineManager, PipelineManagerBuilder};
pub use promote::{sign_files, signature_key, FrozenCandidate};
pub use rate_limit::RateLimiter;
pub use repair::{select_action, PendingRepair, RepairAction, RepairResult, RepairThresholds};
pub use result::{ErrorKind, PipelineOutcome, PipelineResult, PipelineStage, StageRecord};

/// One pipeline run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub module_id: String,
    pub category: String,
    pub driver: String,
}

impl PipelineRequest {
    pub fn new(
        module_id: impl Into<String>,
        category: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            category: category.into(),
            driver: driver.into(),
        }
    }
}
