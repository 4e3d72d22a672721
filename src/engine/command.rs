use super::record::{
    BannedInstanceRecord, DeploymentRecord, Intent, ProcessInstanceRecord, Record, RecordValue,
    RejectionType, DEFAULT_TENANT,
};
use serde::{Deserialize, Serialize};

/// Commands accepted from clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Deploy {
        process_id: String,
        tasks: Vec<String>,
    },
    CreateInstance {
        process_id: String,
        #[serde(default)]
        variables: serde_json::Value,
        #[serde(default)]
        tenant_id: Option<String>,
    },
    CompleteTask {
        process_instance_key: u64,
    },
    CancelInstance {
        process_instance_key: u64,
    },
    /// Operator action lifting a ban
    UnbanInstance {
        process_instance_key: u64,
    },
}

impl Command {
    pub fn into_record(self) -> Record {
        match self {
            Command::Deploy { process_id, tasks } => Record::command(
                Intent::Create,
                RecordValue::Deployment(DeploymentRecord {
                    process_id,
                    key: 0,
                    version: 0,
                    tasks,
                }),
            ),
            Command::CreateInstance {
                process_id,
                variables,
                tenant_id,
            } => Record::command(
                Intent::Create,
                RecordValue::ProcessInstance(ProcessInstanceRecord {
                    process_instance_key: 0,
                    process_id,
                    task_index: 0,
                    variables,
                }),
            )
            .with_tenant(tenant_id.unwrap_or_else(|| DEFAULT_TENANT.to_string())),
            Command::CompleteTask { process_instance_key } => {
                Record::command(Intent::CompleteTask, instance_ref(process_instance_key))
                    .with_key(process_instance_key)
            }
            Command::CancelInstance { process_instance_key } => {
                Record::command(Intent::Cancel, instance_ref(process_instance_key))
                    .with_key(process_instance_key)
            }
            Command::UnbanInstance { process_instance_key } => Record::command(
                Intent::Unban,
                RecordValue::BannedInstance(BannedInstanceRecord { process_instance_key }),
            )
            .with_key(process_instance_key),
        }
    }
}

fn instance_ref(process_instance_key: u64) -> RecordValue {
    RecordValue::ProcessInstance(ProcessInstanceRecord {
        process_instance_key,
        process_id: String::new(),
        task_index: 0,
        variables: serde_json::Value::Null,
    })
}

/// Outcome of a user command, delivered to the submitter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandResponse {
    Accepted {
        position: u64,
        key: u64,
        intent: Intent,
        value: RecordValue,
    },
    Rejected {
        position: u64,
        rejection_type: RejectionType,
        reason: String,
    },
}

impl CommandResponse {
    pub fn accepted(event: &Record, command_position: u64) -> Self {
        CommandResponse::Accepted {
            position: command_position,
            key: event.key.unwrap_or_default(),
            intent: event.intent,
            value: event.value.clone(),
        }
    }

    pub fn rejected(rejection: &Record) -> Self {
        let (rejection_type, reason) = match &rejection.rejection {
            Some(r) => (r.rejection_type, r.reason.clone()),
            None => (RejectionType::ProcessingError, String::new()),
        };
        CommandResponse::Rejected {
            position: rejection.source_position.unwrap_or(rejection.position),
            rejection_type,
            reason,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandResponse::Accepted { .. })
    }

    pub fn key(&self) -> Option<u64> {
        match self {
            CommandResponse::Accepted { key, .. } => Some(*key),
            CommandResponse::Rejected { .. } => None,
        }
    }
}
