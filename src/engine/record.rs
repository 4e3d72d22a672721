//! Records: the unit written to and read from a partition's log.
//!
//! A log entry carries one `RecordBatch`. Every record of the batch occupies
//! the entry's index as its position. Submitted commands travel alone; the
//! follow-ups of one command (its events or its rejection) travel together
//! so they commit atomically.

use crate::log::LogEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Deployment,
    ProcessInstance,
    Error,
    BannedInstance,
    UsageMetric,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Create,
    Created,
    Activated,
    CompleteTask,
    TaskCompleted,
    Completed,
    Cancel,
    Cancelled,
    Unban,
    Unbanned,
    Exported,
}

impl Intent {
    pub fn is_event(self) -> bool {
        !matches!(
            self,
            Intent::Create | Intent::CompleteTask | Intent::Cancel | Intent::Unban
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionType {
    NotFound,
    InvalidState,
    InvalidArgument,
    AlreadyExists,
    ProcessingError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

/// Where the response to a user command goes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub node_id: u64,
    pub request_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub process_id: String,
    /// Assigned on creation
    #[serde(default)]
    pub key: u64,
    #[serde(default)]
    pub version: u32,
    pub tasks: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    #[serde(default)]
    pub process_instance_key: u64,
    #[serde(default)]
    pub process_id: String,
    /// Index of the task the instance waits on
    #[serde(default)]
    pub task_index: usize,
    #[serde(default)]
    pub variables: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub process_instance_key: u64,
    pub error_position: u64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedInstanceRecord {
    pub process_instance_key: u64,
}

/// Usage counters of one closed time window
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetricRecord {
    pub from_time: u64,
    pub to_time: u64,
    /// Created process instances per tenant
    pub counters: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordValue {
    Deployment(DeploymentRecord),
    ProcessInstance(ProcessInstanceRecord),
    Error(ErrorRecord),
    BannedInstance(BannedInstanceRecord),
    UsageMetric(UsageMetricRecord),
}

impl RecordValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Deployment(_) => ValueType::Deployment,
            RecordValue::ProcessInstance(_) => ValueType::ProcessInstance,
            RecordValue::Error(_) => ValueType::Error,
            RecordValue::BannedInstance(_) => ValueType::BannedInstance,
            RecordValue::UsageMetric(_) => ValueType::UsageMetric,
        }
    }
}

pub const DEFAULT_TENANT: &str = "<default>";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Index of the log entry holding this record; assigned on read
    #[serde(default)]
    pub position: u64,
    /// Position of the command this record follows up
    pub source_position: Option<u64>,
    pub key: Option<u64>,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub value: RecordValue,
    pub rejection: Option<Rejection>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub request: Option<RequestMetadata>,
    pub tenant_id: String,
}

impl Record {
    pub fn command(intent: Intent, value: RecordValue) -> Self {
        Self {
            position: 0,
            source_position: None,
            key: None,
            record_type: RecordType::Command,
            value_type: value.value_type(),
            intent,
            value,
            rejection: None,
            timestamp: 0,
            request: None,
            tenant_id: DEFAULT_TENANT.to_string(),
        }
    }

    /// Event following up `source`
    pub fn event(source: &Record, key: u64, intent: Intent, value: RecordValue) -> Self {
        Self {
            position: 0,
            source_position: Some(source.position),
            key: Some(key),
            record_type: RecordType::Event,
            value_type: value.value_type(),
            intent,
            value,
            rejection: None,
            timestamp: source.timestamp,
            request: None,
            tenant_id: source.tenant_id.clone(),
        }
    }

    /// Rejection of `command`, echoing its value
    pub fn rejection(command: &Record, rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            position: 0,
            source_position: Some(command.position),
            key: command.key,
            record_type: RecordType::CommandRejection,
            value_type: command.value_type,
            intent: command.intent,
            value: command.value.clone(),
            rejection: Some(Rejection {
                rejection_type,
                reason: reason.into(),
            }),
            timestamp: command.timestamp,
            request: command.request,
            tenant_id: command.tenant_id.clone(),
        }
    }

    pub fn with_key(mut self, key: u64) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_user_command(&self) -> bool {
        self.is_command() && self.request.is_some()
    }

    /// Process instance this record is about, for blacklisting
    pub fn process_instance_key(&self) -> Option<u64> {
        match &self.value {
            RecordValue::ProcessInstance(value) if value.process_instance_key != 0 => {
                Some(value.process_instance_key)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Records of a committed entry, positioned at its index.
    /// Leader no-op entries carry no records.
    pub fn decode(entry: &LogEntry) -> Result<Vec<Record>, serde_json::Error> {
        let Some(data) = entry.data() else {
            return Ok(Vec::new());
        };
        let batch: RecordBatch = serde_json::from_slice(data)?;
        Ok(batch
            .records
            .into_iter()
            .map(|mut record| {
                record.position = entry.index;
                record
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_assigns_entry_index() {
        let command = Record::command(
            Intent::Create,
            RecordValue::Deployment(DeploymentRecord {
                process_id: "order".to_string(),
                key: 0,
                version: 0,
                tasks: vec!["pay".to_string()],
            }),
        );
        let data = RecordBatch::new(vec![command.clone()]).encode().unwrap();
        let records = RecordBatch::decode(&LogEntry::application(7, 2, 0, data)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].position, 7);
        assert_eq!(records[0].value, command.value);
    }

    #[test]
    fn test_initial_entry_has_no_records() {
        assert!(RecordBatch::decode(&LogEntry::initial(3, 1, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_rejection_follows_command() {
        let mut command = Record::command(
            Intent::Cancel,
            RecordValue::ProcessInstance(ProcessInstanceRecord {
                process_instance_key: 9,
                process_id: String::new(),
                task_index: 0,
                variables: serde_json::Value::Null,
            }),
        );
        command.position = 4;
        command.request = Some(RequestMetadata { node_id: 1, request_id: 2 });

        let rejection = Record::rejection(&command, RejectionType::NotFound, "no such instance");
        assert_eq!(rejection.source_position, Some(4));
        assert_eq!(rejection.record_type, RecordType::CommandRejection);
        assert_eq!(rejection.request, command.request);
        assert_eq!(rejection.process_instance_key(), Some(9));
    }
}
