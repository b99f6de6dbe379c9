//! Simulated gateway devices.
//!
//! Two families live here. The `Sim*` types stand in for the real bridging
//! daemon so the binary runs end-to-end on a desk: the bus answers the read
//! plan with synthetic spectra, the positioning source reports a fixed point,
//! the inertial unit sways about vertical, and the stepper records what it is
//! told. [`ScriptedBus`] is the deterministic double for tests: every reply
//! is prearranged and every request is recorded for order assertions.

use super::{
    AttitudeSource, BusEvent, ExceptionCode, GatewayError, PositionSource, RawFix, RawQuaternion,
    RegisterBus, RequestId, StepMode, StepperDrive,
};
use crate::registers::{self, FieldKind, READ_PLAN};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::sleep;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const STREAM_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// SimBus - register bus answering the read plan with synthetic data
// =============================================================================

struct SimBusInner {
    next_id: u8,
    subscribers: HashMap<u8, mpsc::Sender<BusEvent>>,
    faults: VecDeque<ExceptionCode>,
}

/// Register bus simulator. Acks every trigger and serves the read plan with
/// synthetic spectra; scripted faults can be queued to exercise retry paths.
pub struct SimBus {
    inner: Arc<Mutex<SimBusInner>>,
}

impl SimBus {
    /// Bus with no queued faults.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimBusInner {
                next_id: 0,
                subscribers: HashMap::new(),
                faults: VecDeque::new(),
            })),
        }
    }

    /// Queue an exception; the next request is answered with it instead of
    /// data.
    pub async fn inject_fault(&self, code: ExceptionCode) {
        self.inner.lock().await.faults.push_back(code);
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

fn synthetic_payload(register: u16, count: u16) -> Vec<u16> {
    let field = READ_PLAN.iter().find(|f| f.address == register);
    match field.map(|f| f.kind) {
        Some(FieldKind::IntegrationTime) => vec![512],
        Some(FieldKind::Length) => vec![registers::ORDINATE_LEN as u16, 0],
        Some(FieldKind::PreInclination) | Some(FieldKind::PostInclination) => {
            let mut rng = rand::thread_rng();
            let angle: f32 = rng.gen_range(-3.0..3.0);
            let (hi, lo) = registers::float32_to_words(angle);
            vec![hi, lo]
        }
        Some(FieldKind::Ordinate(index)) => {
            let mut rng = rand::thread_rng();
            let mut words = Vec::with_capacity(count as usize);
            let base = index * 62;
            for i in 0..(count as usize / 2) {
                let pixel = (base + i) as f32;
                let value = 40.0 + 20.0 * (pixel * 0.05).sin() + rng.gen_range(-2.0..2.0f32);
                let (hi, lo) = registers::float32_to_words(value);
                words.push(hi);
                words.push(lo);
            }
            words
        }
        None => Vec::new(),
    }
}

#[async_trait]
impl RegisterBus for SimBus {
    async fn write_single_register(
        &self,
        slave: u8,
        _register: u16,
        _value: u16,
    ) -> Result<RequestId, GatewayError> {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.wrapping_add(1);
        let request_id = RequestId(inner.next_id);
        let exception = inner.faults.pop_front().unwrap_or(ExceptionCode::OK);
        if let Some(tx) = inner.subscribers.get(&slave) {
            let _ = tx
                .send(BusEvent::WriteAck {
                    request_id,
                    exception,
                })
                .await;
        }
        Ok(request_id)
    }

    async fn read_holding_registers(
        &self,
        slave: u8,
        register: u16,
        count: u16,
    ) -> Result<RequestId, GatewayError> {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.wrapping_add(1);
        let request_id = RequestId(inner.next_id);
        let (exception, words) = match inner.faults.pop_front() {
            Some(code) => (code, Vec::new()),
            None => {
                let payload = synthetic_payload(register, count);
                if payload.is_empty() {
                    // Unmapped address: illegal-data-address exception.
                    (ExceptionCode(2), Vec::new())
                } else {
                    (ExceptionCode::OK, payload)
                }
            }
        };
        if let Some(tx) = inner.subscribers.get(&slave) {
            let _ = tx
                .send(BusEvent::ReadResponse {
                    request_id,
                    exception,
                    words,
                })
                .await;
        }
        Ok(request_id)
    }

    async fn subscribe(&self, slave: u8) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.lock().await.subscribers.insert(slave, tx);
        rx
    }
}

// =============================================================================
// ScriptedBus - deterministic double for tests
// =============================================================================

/// A request observed by the scripted bus, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusRequest {
    /// A single-register write.
    Write {
        /// Addressed slave.
        slave: u8,
        /// Register written.
        register: u16,
        /// Value written.
        value: u16,
    },
    /// A holding-register read.
    Read {
        /// Addressed slave.
        slave: u8,
        /// First register read.
        register: u16,
        /// Words requested.
        count: u16,
    },
}

/// Prearranged reaction to the next request.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Answer cleanly: acks a write, or returns these words for a read.
    Clean(Vec<u16>),
    /// Answer with this exception code and no payload.
    Exception(ExceptionCode),
    /// Answer under an identifier that matches no outstanding request.
    WrongId,
    /// Send nothing, so the caller's reply timeout fires.
    Silent,
    /// Fail the request call itself, as a lost daemon connection would.
    RejectRequest,
}

struct ScriptedInner {
    next_id: u8,
    replies: VecDeque<ScriptedReply>,
    requests: Vec<BusRequest>,
    subscribers: HashMap<u8, mpsc::Sender<BusEvent>>,
}

/// Deterministic register bus: replies are scripted ahead of time in request
/// order, and every request is recorded. Once the script is exhausted the
/// bus answers cleanly, serving zeroed words sized to each read.
pub struct ScriptedBus {
    inner: Arc<Mutex<ScriptedInner>>,
}

impl ScriptedBus {
    /// Bus with an empty script.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptedInner {
                next_id: 0,
                replies: VecDeque::new(),
                requests: Vec::new(),
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Append one reply to the script.
    pub async fn push_reply(&self, reply: ScriptedReply) {
        self.inner.lock().await.replies.push_back(reply);
    }

    /// Append several replies in order.
    pub async fn script(&self, replies: impl IntoIterator<Item = ScriptedReply>) {
        let mut inner = self.inner.lock().await;
        inner.replies.extend(replies);
    }

    /// Every request issued so far, in order.
    pub async fn requests(&self) -> Vec<BusRequest> {
        self.inner.lock().await.requests.clone()
    }

    async fn respond(
        &self,
        slave: u8,
        request: BusRequest,
        is_read: bool,
        count: u16,
    ) -> Result<RequestId, GatewayError> {
        let mut inner = self.inner.lock().await;
        inner.requests.push(request);
        inner.next_id = inner.next_id.wrapping_add(1);
        let request_id = RequestId(inner.next_id);
        let reply = inner
            .replies
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Clean(if is_read { vec![0; count as usize] } else { Vec::new() }));

        let event = match reply {
            ScriptedReply::Clean(words) => Some(make_event(is_read, request_id, ExceptionCode::OK, words)),
            ScriptedReply::Exception(code) => Some(make_event(is_read, request_id, code, Vec::new())),
            ScriptedReply::WrongId => Some(make_event(
                is_read,
                RequestId(request_id.0.wrapping_add(77)),
                ExceptionCode::OK,
                if is_read { vec![0; count as usize] } else { Vec::new() },
            )),
            ScriptedReply::Silent => None,
            ScriptedReply::RejectRequest => {
                return Err(GatewayError::Rejected("scripted rejection".into()));
            }
        };

        if let (Some(event), Some(tx)) = (event, inner.subscribers.get(&slave)) {
            let _ = tx.send(event).await;
        }
        Ok(request_id)
    }
}

impl Default for ScriptedBus {
    fn default() -> Self {
        Self::new()
    }
}

fn make_event(is_read: bool, request_id: RequestId, exception: ExceptionCode, words: Vec<u16>) -> BusEvent {
    if is_read {
        BusEvent::ReadResponse {
            request_id,
            exception,
            words,
        }
    } else {
        BusEvent::WriteAck {
            request_id,
            exception,
        }
    }
}

#[async_trait]
impl RegisterBus for ScriptedBus {
    async fn write_single_register(
        &self,
        slave: u8,
        register: u16,
        value: u16,
    ) -> Result<RequestId, GatewayError> {
        self.respond(
            slave,
            BusRequest::Write {
                slave,
                register,
                value,
            },
            false,
            0,
        )
        .await
    }

    async fn read_holding_registers(
        &self,
        slave: u8,
        register: u16,
        count: u16,
    ) -> Result<RequestId, GatewayError> {
        self.respond(
            slave,
            BusRequest::Read {
                slave,
                register,
                count,
            },
            true,
            count,
        )
        .await
    }

    async fn subscribe(&self, slave: u8) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.lock().await.subscribers.insert(slave, tx);
        rx
    }
}

// =============================================================================
// SimGps - fixed-position receiver
// =============================================================================

/// Positioning simulator reporting one fixed point, with a periodic stream.
pub struct SimGps {
    raw: RawFix,
    period_ms: Arc<Mutex<u32>>,
    tx: broadcast::Sender<RawFix>,
}

impl SimGps {
    /// Receiver locked onto the given point (degrees, degrees, meters).
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        let raw = RawFix {
            latitude_udeg: (latitude.abs() * 1e6) as u32,
            ns: if latitude < 0.0 { 'S' } else { 'N' },
            longitude_udeg: (longitude.abs() * 1e6) as u32,
            ew: if longitude < 0.0 { 'W' } else { 'E' },
            altitude_cm: (altitude * 100.0) as i32,
        };
        let (tx, _) = broadcast::channel(STREAM_CHANNEL_CAPACITY);
        let period_ms = Arc::new(Mutex::new(0u32));

        let stream_tx = tx.clone();
        let stream_period = Arc::clone(&period_ms);
        tokio::spawn(async move {
            loop {
                let period = *stream_period.lock().await;
                if period == 0 {
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
                sleep(Duration::from_millis(u64::from(period))).await;
                let _ = stream_tx.send(raw);
            }
        });

        Self { raw, period_ms, tx }
    }
}

#[async_trait]
impl PositionSource for SimGps {
    async fn current_fix(&self) -> Result<Option<RawFix>, GatewayError> {
        Ok(Some(self.raw))
    }

    async fn set_fix_period(&self, period_ms: u32) -> Result<(), GatewayError> {
        *self.period_ms.lock().await = period_ms;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawFix> {
        self.tx.subscribe()
    }
}

// =============================================================================
// SimImu - swaying inertial unit
// =============================================================================

/// Inertial simulator: yaw sways sinusoidally about vertical, quantized the
/// way the hardware quantizes it.
pub struct SimImu {
    amplitude_deg: f64,
    period_ms: Arc<Mutex<u32>>,
    tx: broadcast::Sender<RawQuaternion>,
}

impl SimImu {
    /// Unit swaying `amplitude_deg` degrees either side of its rest heading.
    pub fn new(amplitude_deg: f64) -> Self {
        let (tx, _) = broadcast::channel(STREAM_CHANNEL_CAPACITY);
        let period_ms = Arc::new(Mutex::new(0u32));

        let stream_tx = tx.clone();
        let stream_period = Arc::clone(&period_ms);
        tokio::spawn(async move {
            let mut phase = 0.0f64;
            loop {
                let period = *stream_period.lock().await;
                if period == 0 {
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
                sleep(Duration::from_millis(u64::from(period))).await;
                phase += 0.1;
                let _ = stream_tx.send(quantize_yaw(amplitude_deg * phase.sin()));
            }
        });

        Self {
            amplitude_deg,
            period_ms,
            tx,
        }
    }

    /// The configured sway amplitude.
    pub fn amplitude_deg(&self) -> f64 {
        self.amplitude_deg
    }
}

fn quantize_yaw(yaw_deg: f64) -> RawQuaternion {
    let half = yaw_deg.to_radians() / 2.0;
    RawQuaternion {
        w: (half.cos() * 16383.0) as i16,
        x: 0,
        y: 0,
        z: (half.sin() * 16383.0) as i16,
    }
}

#[async_trait]
impl AttitudeSource for SimImu {
    async fn set_sample_period(&self, period_ms: u32) -> Result<(), GatewayError> {
        *self.period_ms.lock().await = period_ms;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawQuaternion> {
        self.tx.subscribe()
    }
}

// =============================================================================
// SimStepper - motion recorder
// =============================================================================

/// Everything a stepper is told, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepperEvent {
    /// Phase current set, milliamps.
    MotorCurrent(u16),
    /// Step resolution set.
    StepMode(StepMode, bool),
    /// Peak velocity set, steps per second.
    MaxVelocity(u16),
    /// Ramping profile set.
    SpeedRamping {
        /// Steps per second squared.
        acceleration: u16,
        /// Steps per second squared.
        deceleration: u16,
    },
    /// Coils energized.
    Enabled,
    /// Coils de-energized.
    Disabled,
    /// Relative move commanded.
    Drive(i32),
    /// Deceleration to standstill commanded.
    Stopped,
}

/// Stepper simulator that records every command for assertions.
pub struct SimStepper {
    events: Arc<Mutex<Vec<StepperEvent>>>,
}

impl SimStepper {
    /// Stepper with an empty command log.
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of every command received so far, in order.
    pub async fn events(&self) -> Vec<StepperEvent> {
        self.events.lock().await.clone()
    }

    /// Net signed steps across all drive commands.
    pub async fn net_steps(&self) -> i64 {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| match e {
                StepperEvent::Drive(steps) => i64::from(*steps),
                _ => 0,
            })
            .sum()
    }

    async fn record(&self, event: StepperEvent) {
        self.events.lock().await.push(event);
    }
}

impl Default for SimStepper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepperDrive for SimStepper {
    async fn set_motor_current(&self, milliamps: u16) -> Result<(), GatewayError> {
        self.record(StepperEvent::MotorCurrent(milliamps)).await;
        Ok(())
    }

    async fn set_step_mode(&self, mode: StepMode, interpolate: bool) -> Result<(), GatewayError> {
        self.record(StepperEvent::StepMode(mode, interpolate)).await;
        Ok(())
    }

    async fn set_max_velocity(&self, steps_per_s: u16) -> Result<(), GatewayError> {
        self.record(StepperEvent::MaxVelocity(steps_per_s)).await;
        Ok(())
    }

    async fn set_speed_ramping(
        &self,
        acceleration: u16,
        deceleration: u16,
    ) -> Result<(), GatewayError> {
        self.record(StepperEvent::SpeedRamping {
            acceleration,
            deceleration,
        })
        .await;
        Ok(())
    }

    async fn enable(&self) -> Result<(), GatewayError> {
        self.record(StepperEvent::Enabled).await;
        Ok(())
    }

    async fn disable(&self) -> Result<(), GatewayError> {
        self.record(StepperEvent::Disabled).await;
        Ok(())
    }

    async fn drive_steps(&self, steps: i32) -> Result<(), GatewayError> {
        self.record(StepperEvent::Drive(steps)).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), GatewayError> {
        self.record(StepperEvent::Stopped).await;
        Ok(())
    }
}
