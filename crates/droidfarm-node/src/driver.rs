//! Device driver abstraction
//!
//! Real drivers (ADB control, screen capture, input simulation) live outside
//! this repository; the executor only needs this seam. The simulated driver
//! keeps the dispatch path fully exercisable without hardware.

use async_trait::async_trait;
use droidfarm_core::workflow::WorkflowStep;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("device {0} not available")]
    DeviceUnavailable(String),

    #[error("script {script} failed on {device_id}: {reason}")]
    ScriptFailed {
        device_id: String,
        script: String,
        reason: String,
    },
}

/// Progress callback, 0-100
pub type ProgressFn = dyn Fn(u8) + Send + Sync;

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Run one agent step on one device. `params` is the job params merged
    /// with the step params.
    async fn run_step(
        &self,
        device_id: &str,
        step: &WorkflowStep,
        params: &serde_json::Value,
        progress: &ProgressFn,
    ) -> Result<serde_json::Value, DriverError>;
}

/// Driver used when no hardware is attached
///
/// Behaviour is steerable through params so failure paths stay testable:
/// `{"simulate_fail": true}` fails the step, `{"simulate_delay_ms": 50}`
/// stretches it.
pub struct SimulatedDriver;

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    async fn run_step(
        &self,
        device_id: &str,
        step: &WorkflowStep,
        params: &serde_json::Value,
        progress: &ProgressFn,
    ) -> Result<serde_json::Value, DriverError> {
        let delay_ms = params
            .get("simulate_delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(10);

        progress(25);
        tokio::time::sleep(Duration::from_millis(delay_ms / 2)).await;
        progress(75);
        tokio::time::sleep(Duration::from_millis(delay_ms / 2)).await;

        if params
            .get("simulate_fail")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(DriverError::ScriptFailed {
                device_id: device_id.to_string(),
                script: step.id.clone(),
                reason: "simulated failure".to_string(),
            });
        }

        progress(100);
        Ok(serde_json::json!({ "step": step.id, "device": device_id, "ok": true }))
    }
}
