//! Visibility index.
//!
//! Indexes execution metadata for list/count queries, separate from the
//! event log. Updated synchronously on open and close, which is stronger
//! than the eventually-consistent minimum the engine requires of a real
//! document-store backend.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ExecutionStatus;

/// One indexed execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub memo: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub search_attributes: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continued_from_run_id: Option<Uuid>,
}

/// Filter for list and count queries. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    /// `WorkflowId STARTS_WITH` semantics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id_prefix: Option<String>,
}

impl ListFilter {
    fn matches(&self, info: &ExecutionInfo) -> bool {
        if let Some(ns) = &self.namespace {
            if &info.namespace != ns {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if &info.status != status {
                return false;
            }
        }
        if let Some(wt) = &self.workflow_type {
            if &info.workflow_type != wt {
                return false;
            }
        }
        if let Some(prefix) = &self.workflow_id_prefix {
            if !info.workflow_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// In-memory visibility store keyed by run id.
#[derive(Default)]
pub struct VisibilityIndex {
    records: Mutex<HashMap<Uuid, ExecutionInfo>>,
}

impl VisibilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, info: ExecutionInfo) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.insert(info.run_id, info);
    }

    /// Record a close: status transition plus close time.
    pub fn close(&self, run_id: Uuid, status: ExecutionStatus, close_time: DateTime<Utc>) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(info) = records.get_mut(&run_id) {
            info.status = status;
            info.close_time = Some(close_time);
        }
    }

    pub fn get(&self, run_id: Uuid) -> Option<ExecutionInfo> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.get(&run_id).cloned()
    }

    /// Matching records, newest start first.
    pub fn list(&self, filter: &ListFilter) -> Vec<ExecutionInfo> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<ExecutionInfo> = records
            .values()
            .filter(|info| filter.matches(info))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        out
    }

    pub fn count(&self, filter: &ListFilter) -> usize {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.values().filter(|info| filter.matches(info)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(workflow_id: &str, workflow_type: &str, status: ExecutionStatus) -> ExecutionInfo {
        ExecutionInfo {
            namespace: "default".to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: Uuid::new_v4(),
            workflow_type: workflow_type.to_string(),
            task_queue: "main".to_string(),
            status,
            start_time: Utc::now(),
            close_time: None,
            memo: HashMap::new(),
            search_attributes: HashMap::new(),
            parent_run_id: None,
            continued_from_run_id: None,
        }
    }

    #[test]
    fn test_prefix_and_status_filters() {
        let index = VisibilityIndex::new();
        index.upsert(info("order-1", "order", ExecutionStatus::Running));
        index.upsert(info("order-2", "order", ExecutionStatus::Completed));
        index.upsert(info("billing-1", "billing", ExecutionStatus::Running));

        let filter = ListFilter {
            workflow_id_prefix: Some("order-".to_string()),
            ..ListFilter::default()
        };
        assert_eq!(index.count(&filter), 2);

        let filter = ListFilter {
            status: Some(ExecutionStatus::Running),
            ..ListFilter::default()
        };
        let running = index.list(&filter);
        assert_eq!(running.len(), 2);
        assert!(running.iter().all(|i| i.status == ExecutionStatus::Running));

        let filter = ListFilter {
            workflow_type: Some("billing".to_string()),
            status: Some(ExecutionStatus::Running),
            ..ListFilter::default()
        };
        assert_eq!(index.count(&filter), 1);
    }

    #[test]
    fn test_close_updates_record() {
        let index = VisibilityIndex::new();
        let record = info("order-1", "order", ExecutionStatus::Running);
        let run_id = record.run_id;
        index.upsert(record);

        index.close(run_id, ExecutionStatus::Completed, Utc::now());
        let got = index.get(run_id).unwrap();
        assert_eq!(got.status, ExecutionStatus::Completed);
        assert!(got.close_time.is_some());
    }
}
