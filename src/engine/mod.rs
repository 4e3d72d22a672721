//! Workflow engine: turns commands into events and applies events to state.
//!
//! Every event produced while processing a command is applied to the
//! transaction right away, through the same appliers replay uses. Replaying
//! the events of a log therefore rebuilds exactly the state processing built,
//! including the key generator.

mod command;
mod record;
mod state;

pub use command::{Command, CommandResponse};
pub use record::{
    BannedInstanceRecord, DeploymentRecord, ErrorRecord, Intent, ProcessInstanceRecord, Record,
    RecordBatch, RecordType, RecordValue, Rejection, RejectionType, RequestMetadata,
    UsageMetricRecord, ValueType, DEFAULT_TENANT,
};
pub use state::{KeyGenerator, ProcessInstance, PARTITION_BITS};

use crate::blacklist::Blacklist;
use crate::processor::{ProcessingResult, RecordProcessor};
use crate::retry::Recoverable;
use crate::state::{StateError, StateRead, Transaction};
use slog::{debug, Logger};
use state::{ACTIVE_BUCKET, DEPLOYMENTS, INSTANCES, USAGE};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("entity {key} is corrupted: {reason}")]
    Corrupted { key: u64, reason: String },

    #[error("no applier for {value_type:?} {intent:?}")]
    UnexpectedRecord { value_type: ValueType, intent: Intent },
}

impl Recoverable for EngineError {
    fn is_recoverable(&self) -> bool {
        match self {
            EngineError::State(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Follow-ups and response being built for one command
struct Outcome<'a> {
    command: &'a Record,
    follow_ups: Vec<Record>,
    response: Option<CommandResponse>,
}

impl<'a> Outcome<'a> {
    fn new(command: &'a Record) -> Self {
        Self {
            command,
            follow_ups: Vec::new(),
            response: None,
        }
    }

    fn reject(&mut self, rejection_type: RejectionType, reason: impl Into<String>) {
        let rejection = Record::rejection(self.command, rejection_type, reason);
        if self.command.is_user_command() {
            self.response = Some(CommandResponse::rejected(&rejection));
        }
        self.follow_ups.push(rejection);
    }

    fn respond_with(&mut self, event: &Record) {
        if self.command.is_user_command() {
            self.response = Some(CommandResponse::accepted(event, self.command.position));
        }
    }

    fn finish(self) -> ProcessingResult {
        ProcessingResult {
            follow_ups: self.follow_ups,
            response: self.response,
        }
    }
}

pub struct Engine {
    keys: KeyGenerator,
    blacklist: Blacklist,
    usage_interval: Duration,
    logger: Logger,
}

impl Engine {
    pub fn new(partition: u32, blacklist: Blacklist, usage_interval: Duration, logger: Logger) -> Self {
        Self {
            keys: KeyGenerator::new(partition),
            blacklist,
            usage_interval,
            logger,
        }
    }

    pub fn deployment(reader: &impl StateRead, process_id: &str) -> Result<Option<DeploymentRecord>, StateError> {
        DEPLOYMENTS.get(reader, &process_id.to_string())
    }

    pub fn instance(reader: &impl StateRead, key: u64) -> Result<Option<ProcessInstance>, StateError> {
        INSTANCES.get(reader, &key)
    }

    pub fn instances(reader: &impl StateRead) -> Result<Vec<ProcessInstance>, StateError> {
        Ok(INSTANCES.entries(reader)?.into_iter().map(|(_, v)| v).collect())
    }

    /// Usage counters of the open window
    pub fn usage_bucket(reader: &impl StateRead) -> Result<Option<UsageMetricRecord>, StateError> {
        USAGE.get(reader, &ACTIVE_BUCKET.to_string())
    }

    /// Apply `event` to the transaction and record it as a follow-up
    fn emit(&mut self, txn: &mut Transaction, outcome: &mut Outcome<'_>, event: Record) -> Result<(), EngineError> {
        self.apply(&event, txn)?;
        outcome.follow_ups.push(event);
        Ok(())
    }

    fn roll_over_usage(&mut self, txn: &mut Transaction, outcome: &mut Outcome<'_>) -> Result<(), EngineError> {
        let Some(bucket) = Self::usage_bucket(txn)? else {
            return Ok(());
        };
        if outcome.command.timestamp < bucket.to_time {
            return Ok(());
        }
        let key = self.keys.next_key(txn)?;
        let event = Record::event(outcome.command, key, Intent::Exported, RecordValue::UsageMetric(bucket));
        self.emit(txn, outcome, event)
    }

    fn deploy(&mut self, txn: &mut Transaction, outcome: &mut Outcome<'_>, value: &DeploymentRecord) -> Result<(), EngineError> {
        if value.tasks.is_empty() {
            outcome.reject(RejectionType::InvalidArgument, "a process needs at least one task");
            return Ok(());
        }
        if DEPLOYMENTS.exists(txn, &value.process_id)? {
            outcome.reject(
                RejectionType::AlreadyExists,
                format!("process '{}' is already deployed", value.process_id),
            );
            return Ok(());
        }

        let key = self.keys.next_key(txn)?;
        let deployed = DeploymentRecord {
            key,
            version: 1,
            ..value.clone()
        };
        let event = Record::event(outcome.command, key, Intent::Created, RecordValue::Deployment(deployed));
        outcome.respond_with(&event);
        self.emit(txn, outcome, event)
    }

    fn create_instance(
        &mut self,
        txn: &mut Transaction,
        outcome: &mut Outcome<'_>,
        value: &ProcessInstanceRecord,
    ) -> Result<(), EngineError> {
        if !DEPLOYMENTS.exists(txn, &value.process_id)? {
            outcome.reject(
                RejectionType::NotFound,
                format!("no process '{}' is deployed", value.process_id),
            );
            return Ok(());
        }

        let key = self.keys.next_key(txn)?;
        let activated = ProcessInstanceRecord {
            process_instance_key: key,
            task_index: 0,
            ..value.clone()
        };
        let event = Record::event(outcome.command, key, Intent::Activated, RecordValue::ProcessInstance(activated));
        outcome.respond_with(&event);
        self.emit(txn, outcome, event)
    }

    fn complete_task(&mut self, txn: &mut Transaction, outcome: &mut Outcome<'_>, key: u64) -> Result<(), EngineError> {
        let Some(instance) = INSTANCES.get(txn, &key)? else {
            outcome.reject(RejectionType::NotFound, format!("no process instance with key {}", key));
            return Ok(());
        };
        if instance.current_task().is_none() {
            return Err(EngineError::Corrupted {
                key,
                reason: format!(
                    "task index {} outside of {} tasks",
                    instance.task_index,
                    instance.tasks.len()
                ),
            });
        }

        let completed = ProcessInstanceRecord {
            process_instance_key: key,
            process_id: instance.process_id.clone(),
            task_index: instance.task_index,
            variables: instance.variables.clone(),
        };
        let event = Record::event(
            outcome.command,
            key,
            Intent::TaskCompleted,
            RecordValue::ProcessInstance(completed.clone()),
        );
        outcome.respond_with(&event);
        self.emit(txn, outcome, event)?;

        if instance.task_index + 1 == instance.tasks.len() {
            let event = Record::event(outcome.command, key, Intent::Completed, RecordValue::ProcessInstance(completed));
            outcome.respond_with(&event);
            self.emit(txn, outcome, event)?;
        }
        Ok(())
    }

    fn cancel(&mut self, txn: &mut Transaction, outcome: &mut Outcome<'_>, key: u64) -> Result<(), EngineError> {
        let Some(instance) = INSTANCES.get(txn, &key)? else {
            outcome.reject(RejectionType::NotFound, format!("no process instance with key {}", key));
            return Ok(());
        };
        let value = ProcessInstanceRecord {
            process_instance_key: key,
            process_id: instance.process_id,
            task_index: instance.task_index,
            variables: instance.variables,
        };
        let event = Record::event(outcome.command, key, Intent::Cancelled, RecordValue::ProcessInstance(value));
        outcome.respond_with(&event);
        self.emit(txn, outcome, event)
    }

    fn unban(&mut self, txn: &mut Transaction, outcome: &mut Outcome<'_>, key: u64) -> Result<(), EngineError> {
        if !self.blacklist.is_blacklisted(txn, key)? {
            outcome.reject(
                RejectionType::NotFound,
                format!("process instance {} is not blacklisted", key),
            );
            return Ok(());
        }
        let event = Record::event(
            outcome.command,
            key,
            Intent::Unbanned,
            RecordValue::BannedInstance(BannedInstanceRecord { process_instance_key: key }),
        );
        outcome.respond_with(&event);
        self.emit(txn, outcome, event)
    }

    /// The state change of one event
    fn apply(&mut self, event: &Record, txn: &mut Transaction) -> Result<(), EngineError> {
        if let Some(key) = event.key {
            self.keys.observe(txn, key)?;
        }

        match (&event.value, event.intent) {
            (RecordValue::Deployment(value), Intent::Created) => {
                DEPLOYMENTS.put(txn, &value.process_id, value)?;
            }
            (RecordValue::ProcessInstance(value), Intent::Activated) => {
                let deployment = DEPLOYMENTS.get(txn, &value.process_id)?.ok_or_else(|| EngineError::Corrupted {
                    key: value.process_instance_key,
                    reason: format!("activated without deployment '{}'", value.process_id),
                })?;
                let instance = ProcessInstance {
                    key: value.process_instance_key,
                    process_id: value.process_id.clone(),
                    tasks: deployment.tasks,
                    task_index: 0,
                    variables: value.variables.clone(),
                    tenant_id: event.tenant_id.clone(),
                };
                INSTANCES.insert(txn, &instance.key, &instance)?;
                self.count_usage(txn, event)?;
            }
            (RecordValue::ProcessInstance(value), Intent::TaskCompleted) => {
                let key = value.process_instance_key;
                let mut instance = INSTANCES.get(txn, &key)?.ok_or_else(|| EngineError::Corrupted {
                    key,
                    reason: "task completed on a missing instance".to_string(),
                })?;
                instance.task_index = value.task_index + 1;
                INSTANCES.update(txn, &key, &instance)?;
            }
            (RecordValue::ProcessInstance(value), Intent::Completed | Intent::Cancelled) => {
                INSTANCES.delete(txn, &value.process_instance_key);
            }
            (RecordValue::Error(value), Intent::Created) => {
                self.blacklist
                    .ban(txn, value.process_instance_key, value.error_position)?;
            }
            (RecordValue::BannedInstance(value), Intent::Unbanned) => {
                self.blacklist.remove(txn, value.process_instance_key)?;
            }
            (RecordValue::UsageMetric(_), Intent::Exported) => {
                USAGE.delete(txn, &ACTIVE_BUCKET.to_string());
            }
            _ => {
                return Err(EngineError::UnexpectedRecord {
                    value_type: event.value_type,
                    intent: event.intent,
                })
            }
        }
        Ok(())
    }

    fn count_usage(&self, txn: &mut Transaction, event: &Record) -> Result<(), StateError> {
        let active = ACTIVE_BUCKET.to_string();
        let mut bucket = USAGE.get(txn, &active)?.unwrap_or_else(|| UsageMetricRecord {
            from_time: event.timestamp,
            to_time: event.timestamp + self.usage_interval.as_millis() as u64,
            counters: Default::default(),
        });
        *bucket.counters.entry(event.tenant_id.clone()).or_insert(0) += 1;
        USAGE.put(txn, &active, &bucket)
    }
}

impl RecordProcessor for Engine {
    fn process(&mut self, command: &Record, txn: &mut Transaction) -> Result<ProcessingResult, EngineError> {
        let mut outcome = Outcome::new(command);
        self.roll_over_usage(txn, &mut outcome)?;

        match (&command.value, command.intent) {
            (RecordValue::Deployment(value), Intent::Create) => self.deploy(txn, &mut outcome, value)?,
            (RecordValue::ProcessInstance(value), Intent::Create) => {
                self.create_instance(txn, &mut outcome, value)?
            }
            (RecordValue::ProcessInstance(value), Intent::CompleteTask) => {
                self.complete_task(txn, &mut outcome, value.process_instance_key)?
            }
            (RecordValue::ProcessInstance(value), Intent::Cancel) => {
                self.cancel(txn, &mut outcome, value.process_instance_key)?
            }
            (RecordValue::BannedInstance(value), Intent::Unban) => {
                self.unban(txn, &mut outcome, value.process_instance_key)?
            }
            _ => outcome.reject(
                RejectionType::InvalidArgument,
                format!("unsupported command {:?} {:?}", command.value_type, command.intent),
            ),
        }

        debug!(self.logger, "Processed command";
            "position" => command.position, "intent" => ?command.intent,
            "follow_ups" => outcome.follow_ups.len());
        Ok(outcome.finish())
    }

    fn replay(&mut self, event: &Record, txn: &mut Transaction) -> Result<(), EngineError> {
        if event.record_type == RecordType::CommandRejection {
            return Ok(());
        }
        self.apply(event, txn)
    }

    fn on_processing_error(
        &mut self,
        command: &Record,
        error: &dyn std::error::Error,
        txn: &mut Transaction,
    ) -> Result<ProcessingResult, EngineError> {
        let mut outcome = Outcome::new(command);

        // The Error event carries the ban to replicas; its applier is a no-op here
        let banned = self.blacklist.try_blacklist(txn, command)?;
        if let Some(key) = command.process_instance_key().filter(|_| banned) {
            let event = Record::event(
                command,
                key,
                Intent::Created,
                RecordValue::Error(ErrorRecord {
                    process_instance_key: key,
                    error_position: command.position,
                    message: error.to_string(),
                }),
            );
            self.emit(txn, &mut outcome, event)?;
        }
        if command.is_user_command() {
            outcome.reject(
                RejectionType::ProcessingError,
                format!("failed to process command: {}", error),
            );
        }
        Ok(outcome.finish())
    }
}
