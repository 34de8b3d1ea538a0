//! Backrest API endpoint registry
//!
//! Static descriptions of the server's v1 endpoints: what each call does,
//! what it expects, and what it returns. Loaded once, shared process-wide,
//! never mutated after initialization.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};

/// Path prefix shared by every Backrest v1 endpoint
pub const SERVICE_PREFIX: &str = "/v1.Backrest/";

/// Shape of an endpoint's request or response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    None,
    Object,
    Array,
    Boolean,
    /// Server-streaming response; not callable through the query client
    Stream,
}

/// Description of one API endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointDescriptor {
    pub path: &'static str,
    pub description: &'static str,
    pub input: PayloadKind,
    /// Example request body, when the endpoint takes one
    pub example: Option<Value>,
    pub output: PayloadKind,
    pub output_description: &'static str,
}

impl EndpointDescriptor {
    /// True when the response is a stream rather than a single message
    pub fn is_streaming(&self) -> bool {
        self.output == PayloadKind::Stream
    }
}

static REGISTRY: Lazy<HashMap<&'static str, EndpointDescriptor>> = Lazy::new(build_registry);

/// Look up an endpoint by its full path, e.g. `/v1.Backrest/GetOperations`
pub fn lookup(path: &str) -> Option<&'static EndpointDescriptor> {
    REGISTRY.get(path)
}

/// Every known endpoint, sorted by path for stable listings
pub fn endpoints() -> Vec<&'static EndpointDescriptor> {
    let mut all: Vec<_> = REGISTRY.values().collect();
    all.sort_by_key(|descriptor| descriptor.path);
    all
}

fn build_registry() -> HashMap<&'static str, EndpointDescriptor> {
    let descriptors = [
        EndpointDescriptor {
            path: "/v1.Backrest/GetOperations",
            description: "Fetch the list of operations from the Backrest server.",
            input: PayloadKind::Object,
            example: Some(json!({"lastN": 1000, "selector": {"repoId": "repo-id"}})),
            output: PayloadKind::Array,
            output_description: "Array of operations with their details (e.g., type, status).",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/GetConfig",
            description: "Retrieve the Backrest server configuration.",
            input: PayloadKind::None,
            example: None,
            output: PayloadKind::Object,
            output_description: "The configuration object describing the Backrest setup.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/SetConfig",
            description: "Update the Backrest server configuration.",
            input: PayloadKind::Object,
            example: Some(json!({"key": "value"})),
            output: PayloadKind::Object,
            output_description: "The updated configuration object.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/CheckRepoExists",
            description: "Check if a repository exists on the Backrest server.",
            input: PayloadKind::Object,
            example: Some(json!({"id": "repo-id"})),
            output: PayloadKind::Boolean,
            output_description: "Returns true if the repository exists, false otherwise.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/AddRepo",
            description: "Add a new repository to the Backrest server.",
            input: PayloadKind::Object,
            example: Some(json!({"id": "repo-id", "path": "/path/to/repo"})),
            output: PayloadKind::Object,
            output_description: "The updated configuration object including the new repository.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/GetOperationEvents",
            description: "Stream real-time operation changes (created, updated, or deleted).",
            input: PayloadKind::None,
            example: None,
            output: PayloadKind::Stream,
            output_description: "A stream of operation events (created, updated, deleted).",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/ListSnapshots",
            description: "List snapshots for a repository or plan.",
            input: PayloadKind::Object,
            example: Some(json!({"repoId": "repo-id", "planId": "plan-id"})),
            output: PayloadKind::Array,
            output_description: "Array of snapshots with metadata (e.g., ID, paths, tags).",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/ListSnapshotFiles",
            description: "List files within a snapshot at a specific path.",
            input: PayloadKind::Object,
            example: Some(json!({
                "repoId": "repository-id",
                "snapshotId": "snapshot-id",
                "path": "target/path"
            })),
            output: PayloadKind::Object,
            output_description:
                "Returns the path queried and an array of file entries (name, type, size, etc.).",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/Backup",
            description: "Schedule a backup operation.",
            input: PayloadKind::Object,
            example: Some(json!({"value": "plan-id"})),
            output: PayloadKind::None,
            output_description: "No response body, indicates the operation was successfully enqueued.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/DoRepoTask",
            description: "Schedule a repository task (e.g., prune, stats).",
            input: PayloadKind::Object,
            example: Some(json!({"repoId": "repo-id", "task": "TASK_PRUNE"})),
            output: PayloadKind::None,
            output_description: "No response body, indicates the task was successfully enqueued.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/Forget",
            description: "Schedule a forget operation to clean up snapshots.",
            input: PayloadKind::Object,
            example: Some(json!({
                "repoId": "repo-id",
                "planId": "plan-id",
                "snapshotId": "snap-id"
            })),
            output: PayloadKind::None,
            output_description: "No response body, indicates the operation was successfully enqueued.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/Restore",
            description: "Schedule a restore operation for a snapshot.",
            input: PayloadKind::Object,
            example: Some(json!({
                "planId": "plan-id",
                "repoId": "repo-id",
                "snapshotId": "snapshot-id",
                "path": "/source/path",
                "target": "/restore/path"
            })),
            output: PayloadKind::None,
            output_description: "No response body, indicates the operation was successfully enqueued.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/Cancel",
            description: "Attempt to cancel an operation by its ID.",
            input: PayloadKind::Object,
            example: Some(json!({"value": 12345})),
            output: PayloadKind::None,
            output_description:
                "No response body, indicates the cancellation request was submitted.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/GetLogs",
            description: "Stream logs for a specific operation.",
            input: PayloadKind::Object,
            example: Some(json!({"ref": "operation-ref"})),
            output: PayloadKind::Stream,
            output_description: "Stream of log data for the specified operation.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/RunCommand",
            description: "Execute a custom Restic command on a repository.",
            input: PayloadKind::Object,
            example: Some(json!({"repoId": "repo-id", "command": "restic-command"})),
            output: PayloadKind::Object,
            output_description: "Operation ID of the submitted command.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/GetDownloadURL",
            description: "Retrieve a signed URL for downloading forget operation results.",
            input: PayloadKind::Object,
            example: Some(json!({"value": 12345})),
            output: PayloadKind::Object,
            output_description: "Signed URL for downloading the results.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/ClearHistory",
            description: "Clear operation history on the server.",
            input: PayloadKind::Object,
            example: Some(json!({"selector": {"planId": "plan-id"}, "onlyFailed": true})),
            output: PayloadKind::None,
            output_description: "No response body, indicates the history was successfully cleared.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/PathAutocomplete",
            description: "Provide path autocomplete suggestions for a given path.",
            input: PayloadKind::Object,
            example: Some(json!({"value": "/base/path"})),
            output: PayloadKind::Array,
            output_description: "List of autocomplete suggestions.",
        },
        EndpointDescriptor {
            path: "/v1.Backrest/GetSummaryDashboard",
            description: "Retrieve summary data for the dashboard view.",
            input: PayloadKind::None,
            example: None,
            output: PayloadKind::Object,
            output_description: "Summary metrics and statistics for the dashboard.",
        },
    ];

    descriptors
        .into_iter()
        .map(|descriptor| (descriptor.path, descriptor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_endpoint() {
        let descriptor = lookup("/v1.Backrest/GetOperations").unwrap();
        assert_eq!(descriptor.input, PayloadKind::Object);
        assert_eq!(descriptor.output, PayloadKind::Array);
        assert!(!descriptor.is_streaming());
    }

    #[test]
    fn test_lookup_unknown_endpoint() {
        assert!(lookup("/v1.Backrest/DoesNotExist").is_none());
        assert!(lookup("GetOperations").is_none());
    }

    #[test]
    fn test_streaming_endpoints_flagged() {
        assert!(lookup("/v1.Backrest/GetOperationEvents").unwrap().is_streaming());
        assert!(lookup("/v1.Backrest/GetLogs").unwrap().is_streaming());
    }

    #[test]
    fn test_registry_is_complete_and_sorted() {
        let all = endpoints();
        assert_eq!(all.len(), 19);
        let paths: Vec<_> = all.iter().map(|d| d.path).collect();
        let mut sorted = paths.clone();
        sorted.sort_unstable();
        assert_eq!(paths, sorted);
        assert!(paths.iter().all(|path| path.starts_with(SERVICE_PREFIX)));
    }
}
