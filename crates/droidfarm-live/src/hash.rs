//! Per-entity hash codecs
//!
//! Hash fields serialise scalars as plain strings, timestamps as epoch
//! milliseconds, and structured values as JSON text. Conversion is explicit
//! per entity: a corrupt field names itself in the error instead of failing
//! somewhere inside a generic deserializer.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use droidfarm_core::device::{DeviceState, DeviceStatus};
use droidfarm_core::execution::{ExecutionStatus, WorkflowExecution};
use droidfarm_core::node::{NodeState, NodeStatus, SystemGauges};
use uuid::Uuid;

use crate::store::LiveStoreError;

fn corrupt(key: &str, reason: impl Into<String>) -> LiveStoreError {
    LiveStoreError::Corrupt {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn req<'a>(
    key: &str,
    fields: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a str, LiveStoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| corrupt(key, format!("missing field {name}")))
}

fn parse<T: FromStr>(key: &str, name: &str, raw: &str) -> Result<T, LiveStoreError> {
    raw.parse()
        .map_err(|_| corrupt(key, format!("bad {name}: {raw}")))
}

fn req_parse<T: FromStr>(
    key: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<T, LiveStoreError> {
    parse(key, name, req(key, fields, name)?)
}

fn opt_parse<T: FromStr>(
    key: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, LiveStoreError> {
    match fields.get(name) {
        Some(raw) => Ok(Some(parse(key, name, raw)?)),
        None => Ok(None),
    }
}

fn millis(ts: DateTime<Utc>) -> String {
    ts.timestamp_millis().to_string()
}

fn parse_millis(key: &str, name: &str, raw: &str) -> Result<DateTime<Utc>, LiveStoreError> {
    let ms: i64 = parse(key, name, raw)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt(key, format!("bad {name}: {raw}")))
}

fn json_field<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn put(fields: &mut Vec<(String, String)>, name: &str, value: impl Into<String>) {
    fields.push((name.to_string(), value.into()));
}

fn put_opt(fields: &mut Vec<(String, String)>, name: &str, value: Option<impl Into<String>>) {
    if let Some(v) = value {
        fields.push((name.to_string(), v.into()));
    }
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

pub fn node_to_hash(state: &NodeState) -> Vec<(String, String)> {
    let mut f = Vec::with_capacity(10);
    put(&mut f, "node_id", &state.node_id);
    put_opt(&mut f, "label", state.label.as_deref());
    put(&mut f, "status", state.status.to_string());
    put_opt(&mut f, "network_addr", state.network_addr.as_deref());
    put(&mut f, "cpu", state.system.cpu.to_string());
    put(&mut f, "memory", state.system.memory.to_string());
    put(&mut f, "connected_devices", state.connected_devices.to_string());
    put(&mut f, "active_jobs", state.active_jobs.to_string());
    put(&mut f, "last_seen", millis(state.last_seen));
    if !state.metadata.is_null() {
        put(&mut f, "metadata", json_field(&state.metadata));
    }
    f
}

pub fn node_from_hash(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<NodeState, LiveStoreError> {
    let status = match req(key, fields, "status")? {
        "online" => NodeStatus::Online,
        "offline" => NodeStatus::Offline,
        "error" => NodeStatus::Error,
        other => return Err(corrupt(key, format!("bad status: {other}"))),
    };
    let metadata = match fields.get("metadata") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| corrupt(key, format!("bad metadata: {e}")))?,
        None => serde_json::Value::Null,
    };
    Ok(NodeState {
        node_id: req(key, fields, "node_id")?.to_string(),
        label: fields.get("label").cloned(),
        status,
        network_addr: fields.get("network_addr").cloned(),
        system: SystemGauges {
            cpu: req_parse(key, fields, "cpu")?,
            memory: req_parse(key, fields, "memory")?,
        },
        connected_devices: req_parse(key, fields, "connected_devices")?,
        active_jobs: req_parse(key, fields, "active_jobs")?,
        last_seen: parse_millis(key, "last_seen", req(key, fields, "last_seen")?)?,
        metadata,
    })
}

// ---------------------------------------------------------------------------
// DeviceState
// ---------------------------------------------------------------------------

pub fn device_to_hash(state: &DeviceState) -> Vec<(String, String)> {
    let mut f = Vec::with_capacity(14);
    put(&mut f, "device_id", &state.device_id);
    put_opt(&mut f, "node_id", state.node_id.as_deref());
    put(&mut f, "status", state.status.to_string());
    put_opt(&mut f, "model", state.model.as_deref());
    put_opt(&mut f, "android_version", state.android_version.as_deref());
    if let Some(battery) = state.battery {
        put(&mut f, "battery", battery.to_string());
    }
    put_opt(&mut f, "ip_address", state.ip_address.as_deref());
    put_opt(&mut f, "usb_port", state.usb_port.as_deref());
    put_opt(&mut f, "workflow_id", state.workflow_id.as_deref());
    put_opt(&mut f, "current_step", state.current_step.as_deref());
    put(&mut f, "progress", state.progress.to_string());
    put(&mut f, "error_count", state.error_count.to_string());
    put_opt(&mut f, "last_error", state.last_error.as_deref());
    if let Some(at) = state.last_error_at {
        put(&mut f, "last_error_at", millis(at));
    }
    put(&mut f, "last_heartbeat", millis(state.last_heartbeat));
    f
}

pub fn device_from_hash(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<DeviceState, LiveStoreError> {
    let status: DeviceStatus = req(key, fields, "status")?
        .parse()
        .map_err(|e: String| corrupt(key, e))?;
    let last_error_at = match fields.get("last_error_at") {
        Some(raw) => Some(parse_millis(key, "last_error_at", raw)?),
        None => None,
    };
    Ok(DeviceState {
        device_id: req(key, fields, "device_id")?.to_string(),
        node_id: fields.get("node_id").cloned(),
        status,
        model: fields.get("model").cloned(),
        android_version: fields.get("android_version").cloned(),
        battery: opt_parse(key, fields, "battery")?,
        ip_address: fields.get("ip_address").cloned(),
        usb_port: fields.get("usb_port").cloned(),
        workflow_id: fields.get("workflow_id").cloned(),
        current_step: fields.get("current_step").cloned(),
        progress: req_parse(key, fields, "progress")?,
        error_count: req_parse(key, fields, "error_count")?,
        last_error: fields.get("last_error").cloned(),
        last_error_at,
        last_heartbeat: parse_millis(key, "last_heartbeat", req(key, fields, "last_heartbeat")?)?,
    })
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

pub fn execution_to_hash(exec: &WorkflowExecution) -> Vec<(String, String)> {
    let mut f = Vec::with_capacity(18);
    put(&mut f, "execution_id", exec.execution_id.to_string());
    put(&mut f, "execution_key", &exec.execution_key);
    put(&mut f, "workflow_id", &exec.workflow_id);
    put(&mut f, "workflow_version", exec.workflow_version.to_string());
    put_opt(&mut f, "node_id", exec.node_id.as_deref());
    put(&mut f, "device_ids", json_field(&exec.device_ids));
    if !exec.params.is_null() {
        put(&mut f, "params", json_field(&exec.params));
    }
    put(&mut f, "status", exec.status.to_string());
    put_opt(&mut f, "current_step", exec.current_step.as_deref());
    put(&mut f, "progress", exec.progress.to_string());
    put(&mut f, "total_devices", exec.total_devices.to_string());
    put(&mut f, "completed_devices", exec.completed_devices.to_string());
    put(&mut f, "failed_devices", exec.failed_devices.to_string());
    if let Some(at) = exec.started_at {
        put(&mut f, "started_at", millis(at));
    }
    if let Some(at) = exec.completed_at {
        put(&mut f, "completed_at", millis(at));
    }
    if !exec.result.is_null() {
        put(&mut f, "result", json_field(&exec.result));
    }
    put_opt(&mut f, "error_message", exec.error_message.as_deref());
    put(&mut f, "created_at", millis(exec.created_at));
    f
}

pub fn execution_from_hash(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<WorkflowExecution, LiveStoreError> {
    let status = match req(key, fields, "status")? {
        "queued" => ExecutionStatus::Queued,
        "pending" => ExecutionStatus::Pending,
        "running" => ExecutionStatus::Running,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        "cancelled" => ExecutionStatus::Cancelled,
        "partial" => ExecutionStatus::Partial,
        other => return Err(corrupt(key, format!("bad status: {other}"))),
    };
    let execution_id = Uuid::parse_str(req(key, fields, "execution_id")?)
        .map_err(|e| corrupt(key, format!("bad execution_id: {e}")))?;
    let device_ids: Vec<String> = serde_json::from_str(req(key, fields, "device_ids")?)
        .map_err(|e| corrupt(key, format!("bad device_ids: {e}")))?;
    let json_opt = |name: &str| -> Result<serde_json::Value, LiveStoreError> {
        match fields.get(name) {
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| corrupt(key, format!("bad {name}: {e}")))
            }
            None => Ok(serde_json::Value::Null),
        }
    };
    let ts_opt = |name: &str| -> Result<Option<DateTime<Utc>>, LiveStoreError> {
        match fields.get(name) {
            Some(raw) => Ok(Some(parse_millis(key, name, raw)?)),
            None => Ok(None),
        }
    };
    Ok(WorkflowExecution {
        execution_id,
        execution_key: req(key, fields, "execution_key")?.to_string(),
        workflow_id: req(key, fields, "workflow_id")?.to_string(),
        workflow_version: req_parse(key, fields, "workflow_version")?,
        node_id: fields.get("node_id").cloned(),
        device_ids,
        params: json_opt("params")?,
        status,
        current_step: fields.get("current_step").cloned(),
        progress: req_parse(key, fields, "progress")?,
        total_devices: req_parse(key, fields, "total_devices")?,
        completed_devices: req_parse(key, fields, "completed_devices")?,
        failed_devices: req_parse(key, fields, "failed_devices")?,
        started_at: ts_opt("started_at")?,
        completed_at: ts_opt("completed_at")?,
        result: json_opt("result")?,
        error_message: fields.get("error_message").cloned(),
        created_at: parse_millis(key, "created_at", req(key, fields, "created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn as_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn node_round_trip_preserves_semantic_fields() {
        let mut state = NodeState::registered("node-1", Utc::now());
        state.label = Some("rack-3".into());
        state.system = SystemGauges { cpu: 12.5, memory: 40.0 };
        state.connected_devices = 6;
        state.metadata = serde_json::json!({"region": "eu", "slots": 8});

        let decoded =
            node_from_hash("live:node:node-1", &as_map(node_to_hash(&state))).unwrap();

        // millisecond truncation is the only tolerated loss
        assert_eq!(decoded.node_id, state.node_id);
        assert_eq!(decoded.label, state.label);
        assert_eq!(decoded.status, state.status);
        assert_eq!(decoded.system, state.system);
        assert_eq!(decoded.connected_devices, 6);
        assert_eq!(decoded.metadata, state.metadata);
        assert_eq!(
            decoded.last_seen.timestamp_millis(),
            state.last_seen.timestamp_millis()
        );
    }

    #[test]
    fn device_round_trip_with_numeric_serial() {
        // ADB serials can be purely numeric; they must survive as strings
        let mut state = DeviceState::discovered("4785231", "node-1", Utc::now());
        state.battery = Some(77);
        state.last_error = Some("tap failed".into());
        state.error_count = 2;
        state.status = DeviceStatus::Error;

        let decoded =
            device_from_hash("live:device:4785231", &as_map(device_to_hash(&state))).unwrap();
        assert_eq!(decoded.device_id, "4785231");
        assert_eq!(decoded.status, DeviceStatus::Error);
        assert_eq!(decoded.error_count, 2);
        assert_eq!(decoded.battery, Some(77));
        assert_eq!(decoded.last_error.as_deref(), Some("tap failed"));
    }

    #[test]
    fn execution_round_trip() {
        let exec = WorkflowExecution::enqueued(
            "wf-9",
            3,
            "node-2",
            vec!["D1".into(), "D2".into()],
            serde_json::json!({"video": "abc"}),
        );
        let decoded = execution_from_hash(
            "live:execution:x",
            &as_map(execution_to_hash(&exec)),
        )
        .unwrap();
        assert_eq!(decoded.execution_id, exec.execution_id);
        assert_eq!(decoded.execution_key, exec.execution_key);
        assert_eq!(decoded.device_ids, exec.device_ids);
        assert_eq!(decoded.params, exec.params);
        assert_eq!(decoded.total_devices, 2);
        assert!(decoded.started_at.is_none());
    }

    #[test]
    fn missing_field_names_itself() {
        let mut fields = as_map(node_to_hash(&NodeState::registered("n", Utc::now())));
        fields.remove("status");
        let err = node_from_hash("live:node:n", &fields).unwrap_err();
        assert!(err.to_string().contains("missing field status"), "{err}");
    }
}
