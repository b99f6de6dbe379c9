//! Single-channel measurement cycles.
//!
//! A [`ChannelPoller`] owns everything one radiometer needs: the bus handle,
//! the channel's event stream, and the sink its records land in. One call to
//! [`ChannelPoller::run_cycle`] performs one full measurement:
//!
//! 1. Trigger the measurement register and wait for the matching ack.
//! 2. On the first cycle of the run, wait out the sensor warm-up.
//! 3. Read the nine-field plan in order, one request in flight at a time.
//! 4. Decode the payloads and append one record to the sink.
//!
//! Replies are correlated by request identifier. A mismatched, faulted, or
//! absent reply never advances the plan: the poller backs off and repeats
//! the same request, up to the attempt budget. A busy device (code 6) is
//! expected during integration and logged quietly; anything else warns.

use super::{Channel, CycleError, DropReason};
use crate::config::AcquisitionSettings;
use crate::gateway::{BusEvent, ExceptionCode, GatewayError, RegisterBus, RequestId};
use crate::records::{MeasurementRecord, RecordSink, SinkError};
use crate::registers::{
    decode_angle, decode_ordinate, decode_scalar, DecodeError, FieldKind, RegisterField,
    ORDINATE_WORDS, READ_PLAN,
};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Timing and retry budget for one channel.
#[derive(Debug, Clone)]
pub struct PollProfile {
    /// How long to wait for the reply to an outstanding request.
    pub reply_timeout: Duration,
    /// Pause between a failed attempt and its repeat.
    pub retry_backoff: Duration,
    /// Sensor warm-up before the first read of the run.
    pub warmup: Duration,
    /// Requests spent on one register before the cycle is dropped.
    pub max_attempts: u32,
    /// Register that starts a measurement.
    pub trigger_register: u16,
    /// Value that starts a measurement.
    pub trigger_value: u16,
}

impl From<&AcquisitionSettings> for PollProfile {
    fn from(settings: &AcquisitionSettings) -> Self {
        Self {
            reply_timeout: Duration::from_millis(settings.reply_timeout_ms),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            warmup: Duration::from_millis(settings.warmup_ms),
            max_attempts: settings.max_attempts,
            trigger_register: settings.trigger_register,
            trigger_value: settings.trigger_value,
        }
    }
}

/// How one cycle ended. Dropped cycles are ordinary at sea, not failures of
/// the run.
#[derive(Debug, PartialEq)]
pub enum CycleOutcome {
    /// A record was decoded and appended.
    Completed,
    /// The cycle was abandoned; no record was written.
    Dropped(DropReason),
}

/// Internal fault split: drops end the cycle, fatals end the run.
enum PollFault {
    Drop(DropReason),
    Fatal(CycleError),
}

impl From<GatewayError> for PollFault {
    fn from(error: GatewayError) -> Self {
        PollFault::Fatal(CycleError::Gateway(error))
    }
}

impl From<DecodeError> for PollFault {
    fn from(error: DecodeError) -> Self {
        PollFault::Drop(DropReason::Decode(error))
    }
}

/// A correlated reply, or the admission that none arrived.
enum Reply {
    Event {
        request_id: RequestId,
        exception: ExceptionCode,
        words: Vec<u16>,
    },
    TimedOut,
}

/// Poller for one radiometer channel.
pub struct ChannelPoller {
    channel: Channel,
    slave: u8,
    profile: PollProfile,
    bus: Arc<dyn RegisterBus>,
    events: mpsc::Receiver<BusEvent>,
    sink: Box<dyn RecordSink<MeasurementRecord>>,
    first_cycle_done: bool,
}

impl ChannelPoller {
    /// Build a poller and subscribe it to its slave's event stream.
    pub async fn new(
        channel: Channel,
        slave: u8,
        profile: PollProfile,
        bus: Arc<dyn RegisterBus>,
        sink: Box<dyn RecordSink<MeasurementRecord>>,
    ) -> Self {
        let events = bus.subscribe(slave).await;
        Self {
            channel,
            slave,
            profile,
            bus,
            events,
            sink,
            first_cycle_done: false,
        }
    }

    /// The channel this poller serves.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Run one measurement cycle end to end.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        match self.acquire_record().await {
            Ok(record) => {
                self.sink.append(&record).await?;
                debug!(channel = %self.channel, "cycle complete");
                Ok(CycleOutcome::Completed)
            }
            Err(PollFault::Drop(reason)) => {
                warn!(channel = %self.channel, %reason, "cycle dropped");
                Ok(CycleOutcome::Dropped(reason))
            }
            Err(PollFault::Fatal(error)) => Err(error),
        }
    }

    /// Flush buffered records to storage.
    pub async fn flush(&mut self) -> Result<(), SinkError> {
        self.sink.flush().await
    }

    async fn acquire_record(&mut self) -> Result<MeasurementRecord, PollFault> {
        let time = self.trigger().await?;
        if !self.first_cycle_done {
            debug!(
                channel = %self.channel,
                warmup_ms = self.profile.warmup.as_millis() as u64,
                "waiting out sensor warm-up"
            );
            sleep(self.profile.warmup).await;
            self.first_cycle_done = true;
        }
        let mut partial = PartialRecord::new(time);
        for field in READ_PLAN {
            let words = self.read_field(field).await?;
            partial.store(field, words)?;
        }
        Ok(partial.finish()?)
    }

    /// Start a measurement and return the moment the device acked it.
    async fn trigger(&mut self) -> Result<DateTime<Local>, PollFault> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > self.profile.max_attempts {
                return Err(PollFault::Drop(DropReason::RetriesExhausted {
                    address: self.profile.trigger_register,
                    attempts: attempts - 1,
                }));
            }
            let id = self
                .bus
                .write_single_register(
                    self.slave,
                    self.profile.trigger_register,
                    self.profile.trigger_value,
                )
                .await?;
            match self.next_reply().await? {
                Reply::Event {
                    request_id,
                    exception,
                    ..
                } if request_id == id => {
                    // The measurement starts regardless of the ack's code, so
                    // a nonzero code is worth a warning but not a re-trigger.
                    if !exception.is_ok() {
                        warn!(
                            channel = %self.channel,
                            code = exception.0,
                            "trigger acked with exception"
                        );
                    }
                    return Ok(Local::now());
                }
                Reply::Event { request_id, .. } => {
                    warn!(
                        channel = %self.channel,
                        expected = id.0,
                        received = request_id.0,
                        attempt = attempts,
                        max_attempts = self.profile.max_attempts,
                        "trigger ack identifier mismatched, re-triggering"
                    );
                }
                Reply::TimedOut => {
                    warn!(
                        channel = %self.channel,
                        attempt = attempts,
                        max_attempts = self.profile.max_attempts,
                        "trigger ack timed out, re-triggering"
                    );
                }
            }
            sleep(self.profile.retry_backoff).await;
        }
    }

    /// Read one field of the plan, repeating the same request until it
    /// answers cleanly or the attempt budget runs out.
    async fn read_field(&mut self, field: RegisterField) -> Result<Vec<u16>, PollFault> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > self.profile.max_attempts {
                return Err(PollFault::Drop(DropReason::RetriesExhausted {
                    address: field.address,
                    attempts: attempts - 1,
                }));
            }
            let id = self
                .bus
                .read_holding_registers(self.slave, field.address, field.words)
                .await?;
            match self.next_reply().await? {
                Reply::Event {
                    request_id,
                    exception,
                    words,
                } if request_id == id && exception.is_ok() => {
                    return Ok(words);
                }
                Reply::Event {
                    request_id,
                    exception,
                    ..
                } if request_id == id => {
                    if exception.is_busy() {
                        debug!(
                            channel = %self.channel,
                            address = field.address,
                            attempt = attempts,
                            "device busy, retrying"
                        );
                    } else {
                        warn!(
                            channel = %self.channel,
                            address = field.address,
                            code = exception.0,
                            attempt = attempts,
                            max_attempts = self.profile.max_attempts,
                            "read faulted, retrying"
                        );
                    }
                }
                Reply::Event { request_id, .. } => {
                    warn!(
                        channel = %self.channel,
                        address = field.address,
                        expected = id.0,
                        received = request_id.0,
                        attempt = attempts,
                        "read response identifier mismatched, retrying"
                    );
                }
                Reply::TimedOut => {
                    warn!(
                        channel = %self.channel,
                        address = field.address,
                        attempt = attempts,
                        max_attempts = self.profile.max_attempts,
                        "read reply timed out, retrying"
                    );
                }
            }
            sleep(self.profile.retry_backoff).await;
        }
    }

    async fn next_reply(&mut self) -> Result<Reply, PollFault> {
        match timeout(self.profile.reply_timeout, self.events.recv()).await {
            Ok(Some(BusEvent::WriteAck {
                request_id,
                exception,
            })) => Ok(Reply::Event {
                request_id,
                exception,
                words: Vec::new(),
            }),
            Ok(Some(BusEvent::ReadResponse {
                request_id,
                exception,
                words,
            })) => Ok(Reply::Event {
                request_id,
                exception,
                words,
            }),
            Ok(None) => Err(PollFault::Fatal(CycleError::EventStreamClosed)),
            Err(_) => Ok(Reply::TimedOut),
        }
    }
}

/// Accumulates decoded fields across the plan, then assembles the record.
struct PartialRecord {
    time: DateTime<Local>,
    integration_time: Option<u16>,
    length: Option<u16>,
    pre_inclination: Option<f32>,
    post_inclination: Option<f32>,
    ordinate_words: Vec<u16>,
}

impl PartialRecord {
    fn new(time: DateTime<Local>) -> Self {
        Self {
            time,
            integration_time: None,
            length: None,
            pre_inclination: None,
            post_inclination: None,
            ordinate_words: Vec::with_capacity(ORDINATE_WORDS),
        }
    }

    fn store(&mut self, field: RegisterField, words: Vec<u16>) -> Result<(), DecodeError> {
        match field.kind {
            FieldKind::IntegrationTime => {
                self.integration_time = Some(decode_scalar(field, &words)?);
            }
            FieldKind::Length => self.length = Some(decode_scalar(field, &words)?),
            FieldKind::PreInclination => {
                self.pre_inclination = Some(decode_angle(field, &words)?);
            }
            FieldKind::PostInclination => {
                self.post_inclination = Some(decode_angle(field, &words)?);
            }
            FieldKind::Ordinate(_) => {
                if words.len() != field.words as usize {
                    return Err(DecodeError::WordCount {
                        address: field.address,
                        expected: field.words as usize,
                        actual: words.len(),
                    });
                }
                self.ordinate_words.extend_from_slice(&words);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<MeasurementRecord, DecodeError> {
        let ordinate = decode_ordinate(&self.ordinate_words)?;
        Ok(MeasurementRecord {
            time: self.time,
            integration_time: self
                .integration_time
                .ok_or(DecodeError::MissingField("integration_time"))?,
            length: self.length.ok_or(DecodeError::MissingField("length"))?,
            pre_inclination: self
                .pre_inclination
                .ok_or(DecodeError::MissingField("pre_inclination"))?,
            post_inclination: self
                .post_inclination
                .ok_or(DecodeError::MissingField("post_inclination"))?,
            ordinate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sim::{BusRequest, ScriptedBus, ScriptedReply};
    use crate::records::MemorySink;
    use crate::registers::{self, TRIGGER_REGISTER, TRIGGER_VALUE};

    fn test_profile() -> PollProfile {
        PollProfile {
            reply_timeout: Duration::from_millis(12_000),
            retry_backoff: Duration::from_millis(256),
            warmup: Duration::from_millis(4_096),
            max_attempts: 8,
            trigger_register: TRIGGER_REGISTER,
            trigger_value: TRIGGER_VALUE,
        }
    }

    async fn test_poller(bus: &Arc<ScriptedBus>) -> (ChannelPoller, MemorySink<MeasurementRecord>) {
        let sink = MemorySink::new();
        let poller = ChannelPoller::new(
            Channel::Downwelling,
            2,
            test_profile(),
            Arc::clone(bus) as Arc<dyn RegisterBus>,
            Box::new(sink.clone()),
        )
        .await;
        (poller, sink)
    }

    fn encode_f32(value: f32) -> Vec<u16> {
        let (hi, lo) = registers::float32_to_words(value);
        vec![hi, lo]
    }

    fn clean_cycle_script() -> Vec<ScriptedReply> {
        let mut script = vec![ScriptedReply::Clean(Vec::new())];
        for field in READ_PLAN {
            let words = match field.kind {
                FieldKind::IntegrationTime => vec![512],
                FieldKind::Length => vec![255, 0],
                FieldKind::PreInclination => encode_f32(1.5),
                FieldKind::PostInclination => encode_f32(-1.0),
                FieldKind::Ordinate(_) => {
                    let mut words = Vec::new();
                    for _ in 0..(field.words / 2) {
                        words.extend(encode_f32(42.0));
                    }
                    words
                }
            };
            script.push(ScriptedReply::Clean(words));
        }
        script
    }

    #[tokio::test(start_paused = true)]
    async fn clean_cycle_appends_one_record() {
        let bus = Arc::new(ScriptedBus::new());
        bus.script(clean_cycle_script()).await;
        let (mut poller, sink) = test_poller(&bus).await;

        let outcome = poller.run_cycle().await.expect("cycle should not be fatal");
        assert_eq!(outcome, CycleOutcome::Completed);

        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].integration_time, 512);
        assert_eq!(records[0].length, 255);
        assert!((records[0].pre_inclination - 1.5).abs() < f32::EPSILON);
        assert_eq!(records[0].ordinate.len(), registers::ORDINATE_LEN);
        assert!(records[0].ordinate.iter().all(|v| (*v - 42.0).abs() < f32::EPSILON));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_read_repeats_the_same_request() {
        let bus = Arc::new(ScriptedBus::new());
        bus.script([
            ScriptedReply::Clean(Vec::new()),
            ScriptedReply::Exception(ExceptionCode::DEVICE_BUSY),
        ])
        .await;
        let (mut poller, _sink) = test_poller(&bus).await;

        let outcome = poller.run_cycle().await.expect("cycle should not be fatal");
        assert_eq!(outcome, CycleOutcome::Completed);

        let requests = bus.requests().await;
        // Trigger, the busy first read, its repeat, then the rest of the plan.
        assert_eq!(requests.len(), 1 + READ_PLAN.len() + 1);
        assert_eq!(requests[1], requests[2]);
        match &requests[1] {
            BusRequest::Read { register, .. } => assert_eq!(*register, READ_PLAN[0].address),
            other => panic!("expected a read, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_the_cycle() {
        let bus = Arc::new(ScriptedBus::new());
        let mut script = vec![ScriptedReply::Clean(Vec::new())];
        script.extend((0..8).map(|_| ScriptedReply::Exception(ExceptionCode(4))));
        bus.script(script).await;
        let (mut poller, sink) = test_poller(&bus).await;

        let outcome = poller.run_cycle().await.expect("drops are not fatal");
        assert_eq!(
            outcome,
            CycleOutcome::Dropped(DropReason::RetriesExhausted {
                address: READ_PLAN[0].address,
                attempts: 8,
            })
        );
        assert!(sink.records().await.is_empty());
        assert_eq!(bus.requests().await.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_trigger_ack_re_triggers() {
        let bus = Arc::new(ScriptedBus::new());
        bus.script([ScriptedReply::WrongId, ScriptedReply::Clean(Vec::new())])
            .await;
        let (mut poller, _sink) = test_poller(&bus).await;

        let outcome = poller.run_cycle().await.expect("cycle should not be fatal");
        assert_eq!(outcome, CycleOutcome::Completed);

        let requests = bus.requests().await;
        let trigger = BusRequest::Write {
            slave: 2,
            register: TRIGGER_REGISTER,
            value: TRIGGER_VALUE,
        };
        assert_eq!(requests[0], trigger);
        assert_eq!(requests[1], trigger);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_bus_times_out_and_retries() {
        let bus = Arc::new(ScriptedBus::new());
        bus.script([ScriptedReply::Silent, ScriptedReply::Clean(Vec::new())])
            .await;
        let (mut poller, _sink) = test_poller(&bus).await;

        let started = tokio::time::Instant::now();
        let outcome = poller.run_cycle().await.expect("cycle should not be fatal");
        assert_eq!(outcome, CycleOutcome::Completed);
        // One full reply timeout plus one backoff elapsed before the repeat.
        assert!(started.elapsed() >= Duration::from_millis(12_000 + 256));
        assert_eq!(bus.requests().await.len(), 2 + READ_PLAN.len());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_request_is_fatal() {
        let bus = Arc::new(ScriptedBus::new());
        bus.script([ScriptedReply::RejectRequest]).await;
        let (mut poller, _sink) = test_poller(&bus).await;

        let error = poller.run_cycle().await.expect_err("rejection ends the run");
        assert!(matches!(error, CycleError::Gateway(_)));
    }

    #[test]
    fn partial_record_requires_every_field() {
        let mut partial = PartialRecord::new(Local::now());
        partial
            .store(READ_PLAN[0], vec![512])
            .expect("scalar should store");
        for field in READ_PLAN.iter().filter(|f| matches!(f.kind, FieldKind::Ordinate(_))) {
            partial
                .store(*field, vec![0; field.words as usize])
                .expect("ordinate slice should store");
        }
        let error = partial.finish().expect_err("length was never read");
        assert_eq!(error, DecodeError::MissingField("length"));
    }

    #[test]
    fn short_ordinate_slice_is_a_decode_fault() {
        let mut partial = PartialRecord::new(Local::now());
        let field = READ_PLAN[4];
        let error = partial
            .store(field, vec![0; 10])
            .expect_err("short payload must not store");
        assert_eq!(
            error,
            DecodeError::WordCount {
                address: field.address,
                expected: field.words as usize,
                actual: 10,
            }
        );
    }
}
