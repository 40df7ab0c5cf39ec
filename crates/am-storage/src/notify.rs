use crate::StoreContext;
use am_core::{AssignmentRecord, TOPIC_ASSIGNMENT_COMPLETE, TOPIC_ASSIGNMENT_START};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

const CDC_CLIENT: &str = "assignment_manager";

#[derive(Debug, Clone, PartialEq)]
struct RowChange {
    table: &'static str,
    operation: &'static str,
    id: i64,
    rows: usize,
}

/// Messages collected during a unit of work and published once it commits.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    messages: Vec<(&'static str, Value)>,
    changes: Vec<RowChange>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn assignment_started(&mut self, assignment: &AssignmentRecord, start: DateTime<Utc>) {
        self.messages.push((
            TOPIC_ASSIGNMENT_START,
            json!({
                "mad_id": assignment.id,
                "user": assignment.user,
                "start_time": start.timestamp(),
                "protocol": assignment.protocol,
            }),
        ));
    }

    pub(crate) fn assignment_completed(
        &mut self,
        assignment: &AssignmentRecord,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        duration: i64,
        working_duration: i64,
    ) {
        self.messages.push((
            TOPIC_ASSIGNMENT_COMPLETE,
            json!({
                "mad_id": assignment.id,
                "user": assignment.user,
                "start_time": start.timestamp(),
                "end_time": end.timestamp(),
                "duration": duration,
                "working_duration": working_duration,
                "type": assignment.protocol,
            }),
        ));
    }

    pub(crate) fn row_change(&mut self, table: &'static str, operation: &'static str, id: i64, rows: usize) {
        self.changes.push(RowChange {
            table,
            operation,
            id,
            rows,
        });
    }

    /// Best-effort publish; failures are logged and never reach the caller.
    pub(crate) fn flush(self, ctx: &StoreContext, user: &str, now: DateTime<Utc>) {
        for (topic, message) in &self.messages {
            if let Err(err) = ctx.bus.publish(topic, message) {
                warn!(event = "notification_failed", topic, error = %err);
            }
        }
        if !ctx.policy.enable_cdc {
            return;
        }
        for change in &self.changes {
            let message = json!({
                "table": change.table,
                "operation": change.operation,
                "id": change.id,
                "rows": change.rows,
                "user": user,
                "time": now.timestamp(),
                "client": CDC_CLIENT,
            });
            if let Err(err) = ctx.bus.publish(&ctx.policy.cdc_topic, &message) {
                warn!(
                    event = "cdc_publish_failed",
                    table = change.table,
                    id = change.id,
                    error = %err
                );
            }
        }
    }
}
