//! The stream processor actor of one partition replica.
//!
//! Committed entries are read in order through a cursor. A follower only
//! replays events. A new leader first replays everything up to its initial
//! entry and then processes commands:
//!
//! 1. process the command in a transaction that also moves the last
//!    processed position to the command's position
//! 2. append the follow-up records and wait until they commit
//! 3. commit the transaction (retried while the failure is recoverable)
//! 4. respond to the submitter and continue with the next record
//!
//! Unrecoverable failures escalate through the `ErrorPhase`s, banning the
//! affected process instance on the way so the partition keeps going.

use super::{
    last_processed_position, write_last_processed_position, LogStream, ProcessingError,
    ProcessingResult, RecordProcessor, ResponseRegistry,
};
use crate::actor::{Actor, ActorControl, ActorFuture, ActorScheduler, FutureError, PoolKind};
use crate::blacklist::Blacklist;
use crate::config::ProcessorConfig;
use crate::engine::{CommandResponse, Record, RecordBatch, RecordType, RejectionType, ValueType};
use crate::log::LogEntry;
use crate::metrics::PartitionMetrics;
use crate::raft::RoleChange;
use crate::retry::{Recoverable, RetryStrategy};
use crate::snapshot::{Snapshot, SnapshotId};
use crate::state::{StateDb, StateError, Transaction};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Apply events only
    Replay,
    /// Leader catching up: apply events up to the given index, then process
    ReplayUntil(u64),
    /// Leader: process commands
    Processing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPhase {
    NoError,
    /// Processing failed; the record processor's error handling runs
    ProcessingFailed,
    /// Error handling failed; a user command is rejected outright
    ProcessingErrorFailed,
    /// Rejecting the user command failed too
    UserCommandRejectFailed,
    /// The same record keeps failing and is retried without progress
    EndlessErrorLoop,
}

/// A command on its way through write and commit
#[derive(Clone)]
struct InFlight {
    record: Record,
    response: Option<CommandResponse>,
    rejected: bool,
    skipped: bool,
}

pub struct StreamProcessor<P: RecordProcessor> {
    partition: u32,
    processor: P,
    state: StateDb,
    log: Arc<dyn LogStream>,
    blacklist: Blacklist,
    responses: ResponseRegistry,
    metrics: Arc<PartitionMetrics>,
    config: ProcessorConfig,
    commit_retry: RetryStrategy,
    replay_retry: RetryStrategy,
    mode: Mode,
    phase: ErrorPhase,
    last_processed: u64,
    /// Next log index to read
    cursor: u64,
    /// Highest commit index announced by the log
    known_commit: u64,
    pending: VecDeque<Record>,
    /// Events whose replay is being retried
    replaying: Option<Vec<Record>>,
    /// A read, write, commit or retry delay is outstanding
    busy: bool,
    /// Bumped on every reset; continuations of an older generation are dropped
    generation: u64,
    txn: Option<Transaction>,
    last_snapshot: u64,
    snapshotting: bool,
    closed: bool,
    logger: Logger,
}

impl<P: RecordProcessor> Actor for StreamProcessor<P> {
    fn name(&self) -> String {
        format!("stream-processor-{}", self.partition)
    }

    fn on_started(&mut self, control: &ActorControl<Self>) {
        info!(self.logger, "Stream processor started";
            "last_processed_position" => self.last_processed, "last_snapshot" => self.last_snapshot);
        self.poll(control);
    }

    fn on_closing(&mut self, _control: &ActorControl<Self>) {
        self.closed = true;
        self.txn = None;
        self.responses.fail_all(FutureError::ActorClosed);
        info!(self.logger, "Stream processor closing"; "last_processed_position" => self.last_processed);
    }
}

impl<P: RecordProcessor> StreamProcessor<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: u32,
        processor: P,
        state: StateDb,
        log: Arc<dyn LogStream>,
        blacklist: Blacklist,
        responses: ResponseRegistry,
        metrics: Arc<PartitionMetrics>,
        config: ProcessorConfig,
        last_snapshot: u64,
        logger: Logger,
    ) -> Result<Self, StateError> {
        let last_processed = last_processed_position(&state)?;
        metrics.set_last_processed_position(last_processed);
        blacklist.publish_size(&state)?;

        let commit_retry = RetryStrategy::recoverable(config.processing_retry_delay, logger.clone())
            .with_metrics(metrics.clone());
        let replay_retry = RetryStrategy::endless(logger.clone()).with_metrics(metrics.clone());

        Ok(Self {
            partition,
            processor,
            state,
            log,
            blacklist,
            responses,
            metrics,
            config,
            commit_retry,
            replay_retry,
            mode: Mode::Replay,
            phase: ErrorPhase::NoError,
            last_processed,
            cursor: last_processed + 1,
            known_commit: 0,
            pending: VecDeque::new(),
            replaying: None,
            busy: false,
            generation: 0,
            txn: None,
            last_snapshot,
            snapshotting: false,
            closed: false,
            logger,
        })
    }

    pub fn last_processed_position(&self) -> u64 {
        self.last_processed
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn phase(&self) -> ErrorPhase {
        self.phase
    }

    pub fn is_making_progress(&self) -> bool {
        self.phase != ErrorPhase::EndlessErrorLoop
    }

    pub fn state(&self) -> &StateDb {
        &self.state
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Drop everything in flight and restart reading after the last
    /// processed position
    fn reset(&mut self) {
        self.generation += 1;
        self.txn = None;
        self.replaying = None;
        self.pending.clear();
        self.busy = false;
        self.phase = ErrorPhase::NoError;
        self.cursor = self.last_processed + 1;
    }

    fn on_commit(&mut self, control: &ActorControl<Self>, commit_index: u64) {
        self.known_commit = self.known_commit.max(commit_index);
        self.poll(control);
    }

    fn on_role_change(&mut self, control: &ActorControl<Self>, change: RoleChange) {
        let mode = match change {
            RoleChange::BecameLeader { ready_index, .. } => Mode::ReplayUntil(ready_index),
            _ => Mode::Replay,
        };
        if mode == Mode::Replay && self.mode == Mode::Replay {
            return;
        }
        if self.mode != Mode::Replay {
            self.responses
                .fail_all(FutureError::message("partition leadership lost"));
        }

        info!(self.logger, "Switching processing mode"; "from" => ?self.mode, "to" => ?mode);
        self.mode = mode;
        self.reset();
        self.poll(control);
    }

    fn on_snapshot_installed(&mut self, control: &ActorControl<Self>, snapshot: Snapshot) {
        self.reset();
        if let Err(e) = self.restore(&snapshot) {
            error!(self.logger, "Failed to restore state from snapshot";
                "index" => snapshot.id.index, "error" => %e);
            return;
        }
        info!(self.logger, "Restored state from installed snapshot";
            "index" => snapshot.id.index, "last_processed_position" => self.last_processed);
        self.poll(control);
    }

    fn restore(&mut self, snapshot: &Snapshot) -> Result<(), StateError> {
        self.state.restore(&snapshot.data)?;
        self.last_processed = last_processed_position(&self.state)?;
        self.cursor = self.last_processed + 1;
        self.last_snapshot = snapshot.id.index;
        self.metrics.set_last_processed_position(self.last_processed);
        self.blacklist.publish_size(&self.state)
    }

    /// Handle pending records until one needs to wait, then read more
    fn poll(&mut self, control: &ActorControl<Self>) {
        loop {
            if self.busy || self.closed {
                return;
            }
            if self.finish_replay() {
                continue;
            }
            let Some(record) = self.pending.pop_front() else {
                self.fetch(control);
                return;
            };

            if record.is_command() {
                self.on_command(control, record);
                continue;
            }
            let mut events = vec![record];
            while let Some(next) = self.pending.front() {
                if next.is_command() || next.position != events[0].position {
                    break;
                }
                if let Some(next) = self.pending.pop_front() {
                    events.push(next);
                }
            }
            self.on_events(control, events);
        }
    }

    /// Switch a catching-up leader to processing once it passed its
    /// initial entry
    fn finish_replay(&mut self) -> bool {
        let Mode::ReplayUntil(ready_index) = self.mode else {
            return false;
        };
        let caught_up = match self.pending.front() {
            Some(next) => next.position > ready_index,
            None => self.cursor > ready_index,
        };
        if !caught_up {
            return false;
        }

        info!(self.logger, "Replay finished, processing commands";
            "ready_index" => ready_index, "last_processed_position" => self.last_processed);
        self.mode = Mode::Processing;
        self.pending.clear();
        self.cursor = self.last_processed + 1;
        true
    }

    fn fetch(&mut self, control: &ActorControl<Self>) {
        self.busy = true;
        let generation = self.generation;
        let entries = self
            .log
            .read_committed(self.cursor, self.config.max_commands_in_batch);
        control.run_on_completion(&entries, move |processor: &mut Self, control, result| {
            if processor.generation != generation {
                return;
            }
            processor.busy = false;
            processor.on_fetched(control, result);
        });
    }

    fn on_fetched(&mut self, control: &ActorControl<Self>, result: Result<Vec<LogEntry>, FutureError>) {
        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                self.retry_later(control, None, &e);
                return;
            }
        };

        if entries.is_empty() {
            if self.known_commit >= self.cursor {
                // Announced as committed but not readable (yet); look again later
                self.wait(control);
            }
            return;
        }

        for entry in &entries {
            match RecordBatch::decode(entry) {
                Ok(records) => self.pending.extend(records),
                Err(e) => {
                    error!(self.logger, "Skipping undecodable log entry"; "index" => entry.index, "error" => %e);
                }
            }
            self.cursor = entry.index + 1;
        }
        self.poll(control);
    }

    fn on_command(&mut self, control: &ActorControl<Self>, record: Record) {
        if self.mode != Mode::Processing || record.position <= self.last_processed {
            return;
        }

        match self.blacklist.is_record_blacklisted(&self.state, &record) {
            Ok(false) => self.process(control, record),
            Ok(true) => self.skip(control, record),
            Err(e) => self.retry_later(control, Some(record), &e),
        }
    }

    /// Skipped commands only move the position marker
    fn skip(&mut self, control: &ActorControl<Self>, record: Record) {
        debug!(self.logger, "Skipping record of blacklisted instance";
            "position" => record.position, "key" => record.process_instance_key());
        let mut txn = match self.state.begin() {
            Ok(txn) => txn,
            Err(e) => return self.retry_later(control, Some(record), &e),
        };
        if let Err(e) = write_last_processed_position(&mut txn, record.position) {
            return self.retry_later(control, Some(record), &e);
        }
        self.txn = Some(txn);
        // Submitters still hear back; the rejection itself is never written
        let response = record.is_user_command().then(|| {
            let rejection = Record::rejection(
                &record,
                RejectionType::InvalidState,
                format!("process instance {:?} is blacklisted", record.process_instance_key()),
            );
            CommandResponse::rejected(&rejection)
        });
        let in_flight = InFlight {
            record,
            response,
            rejected: false,
            skipped: true,
        };
        self.commit(control, in_flight);
    }

    fn process(&mut self, control: &ActorControl<Self>, record: Record) {
        let mut txn = match self.state.begin() {
            Ok(txn) => txn,
            Err(e) => return self.retry_later(control, Some(record), &e),
        };

        match self.processor.process(&record, &mut txn) {
            Ok(result) => self.write(control, record, txn, result),
            Err(e) if e.is_recoverable() => {
                txn.rollback();
                self.retry_later(control, Some(record), &e);
            }
            Err(e) => {
                txn.rollback();
                self.escalate(control, record, ProcessingError::Engine(e));
            }
        }
    }

    /// Append the follow-ups, then commit the transaction once they committed
    fn write(&mut self, control: &ActorControl<Self>, record: Record, mut txn: Transaction, result: ProcessingResult) {
        if let Err(e) = write_last_processed_position(&mut txn, record.position) {
            return self.escalate(control, record, ProcessingError::State(e));
        }

        let in_flight = InFlight {
            rejected: result
                .follow_ups
                .iter()
                .any(|r| r.record_type == RecordType::CommandRejection),
            response: result.response,
            skipped: false,
            record,
        };
        self.txn = Some(txn);
        if result.follow_ups.is_empty() {
            return self.commit(control, in_flight);
        }

        let data = match RecordBatch::new(result.follow_ups).encode() {
            Ok(data) => data,
            Err(e) => {
                self.txn = None;
                return self.escalate(control, in_flight.record, ProcessingError::Encode(e));
            }
        };

        self.busy = true;
        let generation = self.generation;
        let written = self.log.append(data);
        control.run_on_completion(&written, move |processor: &mut Self, control, result| {
            if processor.generation != generation {
                return;
            }
            match result {
                Ok(_) => processor.commit(control, in_flight),
                Err(e) => {
                    // Leadership is being lost; the role change resets the
                    // processor before the retry fires
                    processor.txn = None;
                    processor.busy = false;
                    processor.retry_later(control, Some(in_flight.record), &e);
                }
            }
        });
    }

    fn commit(&mut self, control: &ActorControl<Self>, in_flight: InFlight) {
        self.busy = true;
        let generation = self.generation;
        let committed = self.commit_retry.run_with_retry(
            control,
            |processor: &mut Self| processor.commit_transaction(),
            move |processor: &Self| processor.generation != generation || processor.closed,
        );
        control.run_on_completion(&committed, move |processor: &mut Self, control, result| {
            if processor.generation != generation {
                return;
            }
            processor.busy = false;
            match result {
                Ok(true) => processor.on_committed(control, in_flight),
                Ok(false) => {}
                Err(e) => {
                    processor.txn = None;
                    processor.escalate(control, in_flight.record, ProcessingError::Future(e));
                }
            }
        });
    }

    fn commit_transaction(&mut self) -> Result<bool, StateError> {
        if let Some(txn) = self.txn.as_mut() {
            txn.commit()?;
        }
        self.txn = None;
        Ok(true)
    }

    fn on_committed(&mut self, control: &ActorControl<Self>, in_flight: InFlight) {
        let position = in_flight.record.position;
        self.last_processed = position;
        if in_flight.skipped {
            self.metrics.record_skipped(position);
        } else {
            self.metrics.record_applied(position);
        }
        if in_flight.rejected {
            self.metrics.record_rejected();
        }

        if self.phase != ErrorPhase::NoError {
            info!(self.logger, "Recovered from processing error"; "position" => position, "phase" => ?self.phase);
            self.phase = ErrorPhase::NoError;
            if let Err(e) = self.blacklist.publish_size(&self.state) {
                warn!(self.logger, "Failed to read blacklist size"; "error" => %e);
            }
        }

        if let (Some(request), Some(response)) = (in_flight.record.request, in_flight.response) {
            self.responses.complete(request, response);
        }

        self.maybe_snapshot(control);
        self.poll(control);
    }

    /// Move to the next error phase and try what it prescribes
    fn escalate(&mut self, control: &ActorControl<Self>, record: Record, cause: ProcessingError) {
        self.txn = None;
        self.phase = match self.phase {
            ErrorPhase::NoError => ErrorPhase::ProcessingFailed,
            ErrorPhase::ProcessingFailed if record.is_user_command() => ErrorPhase::ProcessingErrorFailed,
            ErrorPhase::ProcessingFailed => ErrorPhase::EndlessErrorLoop,
            ErrorPhase::ProcessingErrorFailed => ErrorPhase::UserCommandRejectFailed,
            ErrorPhase::UserCommandRejectFailed | ErrorPhase::EndlessErrorLoop => ErrorPhase::EndlessErrorLoop,
        };
        error!(self.logger, "Processing failed";
            "position" => record.position, "phase" => ?self.phase, "error" => %cause);

        match self.phase {
            ErrorPhase::ProcessingFailed => self.handle_processing_error(control, record, cause),
            ErrorPhase::ProcessingErrorFailed => self.reject_user_command(control, record, cause),
            ErrorPhase::UserCommandRejectFailed => {
                self.phase = ErrorPhase::EndlessErrorLoop;
                self.retry_later(control, Some(record), &cause);
            }
            ErrorPhase::EndlessErrorLoop => self.retry_later(control, Some(record), &cause),
            ErrorPhase::NoError => {}
        }
    }

    fn handle_processing_error(&mut self, control: &ActorControl<Self>, record: Record, cause: ProcessingError) {
        let mut txn = match self.state.begin() {
            Ok(txn) => txn,
            Err(e) => return self.escalate(control, record, ProcessingError::State(e)),
        };
        match self.processor.on_processing_error(&record, &cause, &mut txn) {
            Ok(result) => self.write(control, record, txn, result),
            Err(e) => {
                txn.rollback();
                self.escalate(control, record, ProcessingError::Engine(e));
            }
        }
    }

    fn reject_user_command(&mut self, control: &ActorControl<Self>, record: Record, cause: ProcessingError) {
        let txn = match self.state.begin() {
            Ok(txn) => txn,
            Err(e) => return self.escalate(control, record, ProcessingError::State(e)),
        };
        let rejection = Record::rejection(
            &record,
            RejectionType::ProcessingError,
            format!("failed to process command: {}", cause),
        );
        let result = ProcessingResult {
            response: Some(CommandResponse::rejected(&rejection)),
            follow_ups: vec![rejection],
        };
        self.write(control, record, txn, result);
    }

    /// Apply the events of one entry in one transaction
    fn on_events(&mut self, control: &ActorControl<Self>, events: Vec<Record>) {
        let last_processed = self.last_processed;
        let events: Vec<Record> = events
            .into_iter()
            .filter(|event| event.source_position.unwrap_or(event.position) > last_processed)
            .collect();
        if events.is_empty() {
            return;
        }

        match self.replay_events(&events) {
            Ok(()) => self.maybe_snapshot(control),
            Err(e) => self.retry_events(control, events, e),
        }
    }

    fn retry_events(&mut self, control: &ActorControl<Self>, events: Vec<Record>, cause: ProcessingError) {
        warn!(self.logger, "Failed to replay events, retrying";
            "position" => events[0].position, "error" => %cause);
        self.replaying = Some(events);
        self.busy = true;
        let generation = self.generation;
        let replayed = self.replay_retry.run_with_retry(
            control,
            |processor: &mut Self| processor.retry_replay(),
            move |processor: &Self| processor.generation != generation || processor.closed,
        );
        control.run_on_completion(&replayed, move |processor: &mut Self, control, result| {
            if processor.generation != generation {
                return;
            }
            processor.busy = false;
            if let Ok(true) = result {
                processor.maybe_snapshot(control);
                processor.poll(control);
            }
        });
    }

    fn retry_replay(&mut self) -> Result<bool, ProcessingError> {
        let Some(events) = self.replaying.take() else {
            return Ok(true);
        };
        if let Err(e) = self.replay_events(&events) {
            self.replaying = Some(events);
            return Err(e);
        }
        Ok(true)
    }

    fn replay_events(&mut self, events: &[Record]) -> Result<(), ProcessingError> {
        let mut txn = self.state.begin()?;
        let mut position = self.last_processed;
        let mut banned = false;
        for event in events {
            position = position.max(event.source_position.unwrap_or(event.position));
            if self.blacklist.is_record_blacklisted(&txn, event)? {
                self.metrics.record_skipped(position);
                continue;
            }
            self.processor.replay(event, &mut txn)?;
            banned |= matches!(event.value_type, ValueType::Error | ValueType::BannedInstance);
            self.metrics.record_applied(position);
        }
        write_last_processed_position(&mut txn, position)?;
        txn.commit()?;
        drop(txn);

        self.last_processed = position;
        self.metrics.set_last_processed_position(position);
        if banned {
            self.blacklist.publish_size(&self.state)?;
        }
        Ok(())
    }

    /// Put `record` back and poll again after the retry delay
    fn retry_later(&mut self, control: &ActorControl<Self>, record: Option<Record>, cause: &dyn Display) {
        warn!(self.logger, "Processing step failed, retrying later";
            "position" => record.as_ref().map(|r| r.position), "error" => %cause);
        self.metrics.record_retry();
        if let Some(record) = record {
            self.pending.push_front(record);
        }
        self.wait(control);
    }

    fn wait(&mut self, control: &ActorControl<Self>) {
        self.busy = true;
        let generation = self.generation;
        control.run_delayed(self.config.processing_retry_delay, move |processor: &mut Self, control| {
            if processor.generation != generation {
                return;
            }
            processor.busy = false;
            processor.poll(control);
        });
    }

    fn maybe_snapshot(&mut self, control: &ActorControl<Self>) {
        let period = self.config.snapshot_period;
        if period > 0 && self.last_processed >= self.last_snapshot + period {
            let _ = self.snapshot(control);
        }
    }

    /// Export the state at the last processed position and hand it to the
    /// log, which persists it and compacts
    fn snapshot(&mut self, control: &ActorControl<Self>) -> ActorFuture<Option<SnapshotId>> {
        let index = self.last_processed;
        if self.snapshotting || index == 0 || index <= self.last_snapshot {
            return ActorFuture::completed(None);
        }
        let data = match self.state.export() {
            Ok(data) => data,
            Err(e) => return ActorFuture::failed(FutureError::failed(e)),
        };

        self.snapshotting = true;
        let taken = self.log.take_snapshot(index, data);
        control.run_on_completion(&taken, move |processor: &mut Self, _, result| {
            processor.snapshotting = false;
            match result {
                Ok(Some(id)) => {
                    processor.last_snapshot = processor.last_snapshot.max(id.index);
                    info!(processor.logger, "Snapshot taken"; "index" => id.index, "checksum" => &id.checksum);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(processor.logger, "Failed to take snapshot"; "index" => index, "error" => %e);
                }
            }
        });
        taken
    }
}

/// Cloneable handle to a running `StreamProcessor`
pub struct StreamProcessorHandle<P: RecordProcessor> {
    control: ActorControl<StreamProcessor<P>>,
}

impl<P: RecordProcessor> Clone for StreamProcessorHandle<P> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
        }
    }
}

impl<P: RecordProcessor> StreamProcessorHandle<P> {
    pub fn spawn(processor: StreamProcessor<P>, scheduler: &ActorScheduler) -> Self {
        Self {
            control: scheduler.submit_actor(processor, PoolKind::Cpu),
        }
    }

    pub fn notify_commit(&self, commit_index: u64) {
        let _ = self
            .control
            .submit(move |processor, control| processor.on_commit(control, commit_index));
    }

    pub fn notify_role_change(&self, change: RoleChange) {
        let _ = self
            .control
            .submit(move |processor, control| processor.on_role_change(control, change));
    }

    pub fn notify_snapshot_installed(&self, snapshot: Snapshot) {
        let _ = self
            .control
            .submit(move |processor, control| processor.on_snapshot_installed(control, snapshot));
    }

    pub fn last_processed_position(&self) -> ActorFuture<u64> {
        self.control.call(|processor, _| processor.last_processed_position())
    }

    pub fn is_making_progress(&self) -> ActorFuture<bool> {
        self.control.call(|processor, _| processor.is_making_progress())
    }

    pub fn phase(&self) -> ActorFuture<ErrorPhase> {
        self.control.call(|processor, _| processor.phase())
    }

    pub fn mode(&self) -> ActorFuture<Mode> {
        self.control.call(|processor, _| processor.mode())
    }

    /// Snapshot the state at the last processed position
    pub fn take_snapshot(&self) -> ActorFuture<Option<SnapshotId>> {
        self.control
            .call(|processor, control| processor.snapshot(control))
            .then(|taken| taken)
    }

    /// Read committed state on the processor's context
    pub fn query<R, F>(&self, f: F) -> ActorFuture<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(&StateDb, &Blacklist) -> R + Send + 'static,
    {
        self.control
            .call(move |processor, _| f(&processor.state, &processor.blacklist))
    }

    pub fn close(&self) -> ActorFuture<()> {
        self.control.close()
    }
}
