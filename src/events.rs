//! Event names exchanged with the dashboard server, and helpers for its
//! `{"success": bool, ...}` response envelope.

use serde_json::Value;

use crate::error::{DashError, Result};

// Connection lifecycle signals, dispatched locally by the connection.
pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";
pub const CONNECT_ERROR: &str = "connect_error";
pub const RECONNECT: &str = "reconnect";

// Requests
pub const JOIN_SLURM_ROOM: &str = "join_slurm_room";
pub const GET_JOBS: &str = "get_jobs";
pub const GET_JOB: &str = "get_job";
pub const REQUEST_JOB_UPDATE: &str = "request_job_update";
pub const SUBMIT_JOB: &str = "submit_job";
pub const CANCEL_JOB: &str = "cancel_job";
pub const GET_JOB_OUTPUT: &str = "get_job_output";
pub const GET_JOB_SCRIPT: &str = "get_job_script";
pub const GET_PARTITIONS: &str = "get_partitions";
pub const GET_QOS: &str = "get_qos";
pub const GET_RESOURCES: &str = "get_resources";
pub const GET_STATS: &str = "get_stats";
pub const GET_METRICS_HISTORY: &str = "get_metrics_history";
pub const GET_METRICS_STATISTICS: &str = "get_metrics_statistics";

// Responses
pub const CONNECTED: &str = "connected";
pub const JOINED: &str = "joined";
pub const JOBS_LIST: &str = "jobs_list";
pub const JOB_DETAILS: &str = "job_details";
pub const SUBMIT_RESULT: &str = "submit_result";
pub const CANCEL_RESULT: &str = "cancel_result";
pub const JOB_OUTPUT: &str = "job_output";
pub const JOB_SCRIPT: &str = "job_script";
pub const PARTITIONS_LIST: &str = "partitions_list";
pub const QOS_LIST: &str = "qos_list";
pub const RESOURCES_LIST: &str = "resources_list";
pub const STATS_LIST: &str = "stats_list";
pub const METRICS_HISTORY: &str = "metrics_history";
pub const METRICS_STATISTICS: &str = "metrics_statistics";
pub const ERROR: &str = "error";

// Room broadcasts
pub const JOB_SUBMITTED: &str = "job_submitted";
pub const JOB_CANCELLED: &str = "job_cancelled";
pub const NEW_JOB_NOTIFICATION: &str = "new_job_notification";
pub const NEW_METRIC_POINT: &str = "new_metric_point";

/// Default number of output lines requested by `get_job_output`.
pub const DEFAULT_TAIL_LINES: u64 = 1000;

/// Response event the server answers `request` with.
pub fn response_for(request: &str) -> Option<&'static str> {
    let response = match request {
        JOIN_SLURM_ROOM => JOINED,
        GET_JOBS => JOBS_LIST,
        GET_JOB | REQUEST_JOB_UPDATE => JOB_DETAILS,
        SUBMIT_JOB => SUBMIT_RESULT,
        CANCEL_JOB => CANCEL_RESULT,
        GET_JOB_OUTPUT => JOB_OUTPUT,
        GET_JOB_SCRIPT => JOB_SCRIPT,
        GET_PARTITIONS => PARTITIONS_LIST,
        GET_QOS => QOS_LIST,
        GET_RESOURCES => RESOURCES_LIST,
        GET_STATS => STATS_LIST,
        GET_METRICS_HISTORY => METRICS_HISTORY,
        GET_METRICS_STATISTICS => METRICS_STATISTICS,
        _ => return None,
    };
    Some(response)
}

/// Whether `event` is a connection lifecycle signal rather than server data.
pub fn is_lifecycle(event: &str) -> bool {
    matches!(event, CONNECT | DISCONNECT | CONNECT_ERROR | RECONNECT)
}

/// Check a response envelope.
///
/// Payloads without a `success` field (broadcasts, `joined`) pass through.
/// `success: false` becomes [`DashError::Server`] with the server's `error`
/// or `message` text.
pub fn check_response(payload: &Value) -> Result<&Value> {
    match payload.get("success").and_then(Value::as_bool) {
        Some(false) => Err(DashError::Server(failure_message(payload))),
        _ => Ok(payload),
    }
}

/// Message carried by a failed response or an `error` event.
pub fn failure_message(payload: &Value) -> String {
    payload
        .get("error")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "unknown error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_map_to_responses() {
        assert_eq!(response_for(GET_JOBS), Some(JOBS_LIST));
        assert_eq!(response_for(REQUEST_JOB_UPDATE), Some(JOB_DETAILS));
        assert_eq!(response_for(GET_METRICS_HISTORY), Some(METRICS_HISTORY));
        assert_eq!(response_for(JOBS_LIST), None);
    }

    #[test]
    fn lifecycle_events() {
        assert!(is_lifecycle(CONNECT));
        assert!(is_lifecycle(RECONNECT));
        assert!(!is_lifecycle(JOBS_LIST));
    }

    #[test]
    fn successful_envelope_passes() {
        let payload = json!({"success": true, "jobs": [], "count": 0});
        assert_eq!(check_response(&payload).unwrap()["count"], 0);
    }

    #[test]
    fn envelope_without_success_passes() {
        let payload = json!({"job_id": "42"});
        assert!(check_response(&payload).is_ok());
    }

    #[test]
    fn failed_envelope_reports_error_text() {
        let payload = json!({"success": false, "error": "Job not found"});
        match check_response(&payload) {
            Err(DashError::Server(msg)) => assert_eq!(msg, "Job not found"),
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn failure_message_falls_back() {
        assert_eq!(failure_message(&json!({"message": "boom"})), "boom");
        assert_eq!(failure_message(&json!({"success": false})), "unknown error");
    }
}
