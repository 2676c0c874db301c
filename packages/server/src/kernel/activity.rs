//! Bounded ring of recent lifecycle activity for dashboard hydration.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::common::time::ts_millis;

/// How loud an activity item is on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A denormalised, human-readable record of one lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityItem {
    pub id: Uuid,
    #[serde(with = "ts_millis")]
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ActivityItem {
    pub fn new(
        event_type: impl Into<String>,
        pipeline_id: impl Into<String>,
        pipeline_name: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            pipeline_id: pipeline_id.into(),
            pipeline_name: pipeline_name.into(),
            job_id: None,
            message: message.into(),
            severity,
            details: None,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Insertion-ordered ring of fixed capacity; the oldest item drops first.
///
/// `record` never blocks on I/O and never fails; a poisoned lock just
/// loses the item.
pub struct ActivityFeed {
    items: Mutex<VecDeque<ActivityItem>>,
    capacity: usize,
}

pub const DEFAULT_CAPACITY: usize = 50;

impl ActivityFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, item: ActivityItem) {
        if let Ok(mut items) = self.items.lock() {
            if items.len() == self.capacity {
                items.pop_front();
            }
            items.push_back(item);
        }
    }

    /// Most recent items, newest first, clamped to the ring capacity.
    pub fn recent(&self, n: usize) -> Vec<ActivityItem> {
        match self.items.lock() {
            Ok(items) => items.iter().rev().take(n.min(self.capacity)).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for ActivityFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: usize) -> ActivityItem {
        ActivityItem::new("job:completed", "p", "Pipeline", format!("run {n}"), Severity::Info)
    }

    #[test]
    fn recent_returns_newest_first() {
        let feed = ActivityFeed::new(10);
        for n in 0..3 {
            feed.record(item(n));
        }
        let recent = feed.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "run 2");
        assert_eq!(recent[2].message, "run 0");
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let feed = ActivityFeed::new(5);
        for n in 0..12 {
            feed.record(item(n));
        }
        let recent = feed.recent(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].message, "run 11");
        assert_eq!(recent[4].message, "run 7");
    }

    #[test]
    fn recent_is_clamped_to_capacity() {
        let feed = ActivityFeed::new(5);
        for n in 0..5 {
            feed.record(item(n));
        }
        assert_eq!(feed.recent(100).len(), 5);
        assert_eq!(feed.recent(2).len(), 2);
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        let feed = ActivityFeed::new(0);
        feed.record(item(1));
        feed.record(item(2));
        let recent = feed.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "run 2");
    }
}
