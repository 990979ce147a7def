//! Simulated beamline source.
//!
//! Every ticked variable runs its own task with a jittered period around the
//! configured base interval. Motor readbacks, moving flags, setpoints and
//! actuator states are never ticked; they only change through writes and the
//! motor move state machine.
//!
//! # Motor moves
//!
//! Writing `<motor>:VAL` starts a move of `<motor>:RBV` toward the new target
//! at `motor_speed` units per second in `motor_step` increments. `<motor>:MOVN`
//! is 1 while moving and is cleared exactly once when the move completes or is
//! cancelled. A new target cancels the in-flight move first; the readback stays
//! where the cancelled move left it and the new move starts from there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pvstream_core::{coerce_numeric, now_epoch, Dispatcher, PvError, Settings, SourceMode, SEVERITY_NORMAL};
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ValueSource;

/// Numeric type a simulated variable holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float,
    Int,
}

/// How a simulated variable evolves between writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    /// Gaussian random walk with the given mean step and standard deviation.
    RandomWalk { drift: f64, noise: f64 },
    /// Uniform integer resampling over the value range.
    Resample,
    /// Changed only by writes and motor moves.
    Driven,
}

/// Definition of one simulated variable.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPv {
    pub name: String,
    pub dtype: DataType,
    pub initial: f64,
    pub lo: f64,
    pub hi: f64,
    pub behavior: Behavior,
}

impl SimPv {
    fn analog(name: impl Into<String>, initial: f64, noise: f64, lo: f64, hi: f64) -> Self {
        Self {
            name: name.into(),
            dtype: DataType::Float,
            initial,
            lo,
            hi,
            behavior: Behavior::RandomWalk { drift: 0.0, noise },
        }
    }

    fn driven(name: impl Into<String>, dtype: DataType, initial: f64, lo: f64, hi: f64) -> Self {
        Self {
            name: name.into(),
            dtype,
            initial,
            lo,
            hi,
            behavior: Behavior::Driven,
        }
    }

    pub fn is_ticked(&self) -> bool {
        self.behavior != Behavior::Driven
    }

    /// JSON form of a raw value for this variable's type.
    fn to_json(&self, raw: f64) -> Value {
        match self.dtype {
            DataType::Int => Value::from(raw as i64),
            DataType::Float => Value::from(raw),
        }
    }

    /// Next value after one tick from `current`.
    fn step(&self, current: f64) -> f64 {
        let mut rng = rand::thread_rng();
        match self.behavior {
            Behavior::RandomWalk { drift, noise } => {
                let next = round_significant(current + gaussian(&mut rng, drift, noise), 6);
                next.clamp(self.lo, self.hi)
            }
            Behavior::Resample => rng.gen_range(self.lo as i64..=self.hi as i64) as f64,
            Behavior::Driven => current,
        }
    }
}

/// The default simulated beamline.
pub fn default_catalog() -> Vec<SimPv> {
    let mut rng = rand::thread_rng();
    let mut pvs = Vec::new();

    for i in 1..=4 {
        let initial = 25.0 + rng.gen_range(0.0..10.0);
        pvs.push(SimPv::analog(format!("SIM:TEMP:{i}"), initial, 0.05, 20.0, 40.0));
    }
    for i in 1..=2 {
        let initial = rng.gen_range(1e-7..5e-7);
        pvs.push(SimPv::analog(format!("SIM:PRESSURE:{i}"), initial, 1e-8, 1e-8, 5e-6));
    }
    pvs.push(SimPv::analog("SIM:FLOW:1", 5.0, 0.1, 0.0, 20.0));
    pvs.push(SimPv::analog("SIM:BEAM:INTENSITY", 1e5, 5e3, 0.0, 1e7));
    pvs.push(SimPv::analog("SIM:BEAM:ENERGY", 12.0, 0.001, 5.0, 30.0));
    pvs.push(SimPv {
        name: "SIM:DET:COUNTS".to_string(),
        dtype: DataType::Int,
        initial: 100_000.0,
        lo: 50_000.0,
        hi: 200_000.0,
        behavior: Behavior::Resample,
    });
    pvs.push(SimPv::analog("SIM:DET:RATE", 3000.0, 200.0, 1000.0, 5000.0));

    for (motor, home, hi) in [("SIM:MTR:1", 50.0, 100.0), ("SIM:MTR:2", 180.0, 360.0)] {
        pvs.push(SimPv::driven(format!("{motor}:RBV"), DataType::Float, home, 0.0, hi));
        pvs.push(SimPv::driven(format!("{motor}:VAL"), DataType::Float, home, 0.0, hi));
        pvs.push(SimPv::driven(format!("{motor}:MOVN"), DataType::Int, 0.0, 0.0, 1.0));
    }

    pvs.push(SimPv::driven("SIM:SHUTTER:STATUS", DataType::Int, 0.0, 0.0, 1.0));
    pvs.push(SimPv::driven("SIM:VALVE:1", DataType::Int, 0.0, 0.0, 2.0));
    pvs
}

/// Timing parameters of the simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimSettings {
    /// Base tick period, jittered ±50 % per tick.
    pub tick_interval: Duration,
    /// Motor speed in units per second.
    pub motor_speed: f64,
    /// Motor time-step.
    pub motor_step: Duration,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            motor_speed: 5.0,
            motor_step: Duration::from_millis(50),
        }
    }
}

impl From<&Settings> for SimSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            tick_interval: settings.tick_interval(),
            motor_speed: settings.motor_speed,
            motor_step: settings.motor_step(),
        }
    }
}

/// Names of the three variables making up one motor.
#[derive(Debug, Clone)]
struct MotorPvs {
    prefix: String,
    readback: String,
    moving: String,
}

/// Ownership handle of an in-flight motor move.
struct MoveHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Variable definitions and current values, shared with the tasks.
struct SimState {
    dispatcher: Arc<Dispatcher>,
    settings: SimSettings,
    specs: HashMap<String, SimPv>,
    /// Setpoint name -> motor
    motors: HashMap<String, MotorPvs>,
    values: Mutex<HashMap<String, f64>>,
}

impl SimState {
    fn value(&self, name: &str) -> Option<f64> {
        self.values.lock().get(name).copied()
    }

    /// Store a value and hand it to the dispatcher.
    fn emit(&self, name: &str, raw: f64) {
        let Some(spec) = self.specs.get(name) else {
            return;
        };
        self.values.lock().insert(name.to_string(), raw);
        self.dispatcher
            .notify(name, spec.to_json(raw), now_epoch(), SEVERITY_NORMAL);
    }

    fn tick(&self, name: &str) {
        let Some(spec) = self.specs.get(name) else {
            return;
        };
        let next = {
            let mut values = self.values.lock();
            let current = values.get(name).copied().unwrap_or(spec.initial);
            let next = spec.step(current);
            values.insert(name.to_string(), next);
            next
        };
        self.dispatcher
            .notify(name, spec.to_json(next), now_epoch(), SEVERITY_NORMAL);
    }
}

/// Source producing simulated beamline signals.
pub struct SimulatedSource {
    state: Arc<SimState>,
    shutdown: Mutex<CancellationToken>,
    tickers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Motor prefix -> in-flight move
    moves: tokio::sync::Mutex<HashMap<String, MoveHandle>>,
}

impl SimulatedSource {
    /// Create a source over the default catalog.
    pub fn new(dispatcher: Arc<Dispatcher>, settings: SimSettings) -> Self {
        Self::with_catalog(dispatcher, settings, default_catalog())
    }

    pub fn with_catalog(dispatcher: Arc<Dispatcher>, settings: SimSettings, catalog: Vec<SimPv>) -> Self {
        let values = catalog
            .iter()
            .map(|pv| (pv.name.clone(), pv.initial))
            .collect();

        let mut motors = HashMap::new();
        for pv in &catalog {
            let Some(prefix) = pv.name.strip_suffix(":VAL") else {
                continue;
            };
            if !pv.name.contains(":MTR:") {
                continue;
            }
            let motor = MotorPvs {
                prefix: prefix.to_string(),
                readback: format!("{prefix}:RBV"),
                moving: format!("{prefix}:MOVN"),
            };
            let complete = catalog.iter().any(|p| p.name == motor.readback)
                && catalog.iter().any(|p| p.name == motor.moving);
            if complete {
                motors.insert(pv.name.clone(), motor);
            }
        }

        let specs = catalog.into_iter().map(|pv| (pv.name.clone(), pv)).collect();

        Self {
            state: Arc::new(SimState {
                dispatcher,
                settings,
                specs,
                motors,
                values: Mutex::new(values),
            }),
            shutdown: Mutex::new(CancellationToken::new()),
            tickers: tokio::sync::Mutex::new(Vec::new()),
            moves: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Names of all simulated variables, sorted.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.specs.keys().cloned().collect();
        names.sort();
        names
    }

    async fn start_move(&self, motor: MotorPvs, target: f64) {
        let mut moves = self.moves.lock().await;

        if let Some(previous) = moves.remove(&motor.prefix) {
            debug!(motor = %motor.prefix, "Superseding in-flight move");
            previous.token.cancel();
            let _ = previous.handle.await;
        }

        let token = self.shutdown.lock().child_token();
        if token.is_cancelled() {
            debug!(motor = %motor.prefix, "Source stopped, not moving");
            return;
        }
        let prefix = motor.prefix.clone();
        let handle = tokio::spawn(run_move(self.state.clone(), motor, target, token.clone()));
        moves.insert(prefix, MoveHandle { token, handle });
    }
}

#[async_trait]
impl ValueSource for SimulatedSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Simulated
    }

    async fn start(&self) -> Result<(), PvError> {
        let mut tickers = self.tickers.lock().await;
        if !tickers.is_empty() {
            debug!("Simulated source already running");
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        // Seed every variable so subscribers see state before the first tick
        let seed: Vec<(String, f64)> = self
            .state
            .values
            .lock()
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        for (name, value) in seed {
            self.state.emit(&name, value);
        }

        for spec in self.state.specs.values().filter(|pv| pv.is_ticked()) {
            tickers.push(tokio::spawn(run_ticker(
                self.state.clone(),
                spec.name.clone(),
                token.clone(),
            )));
        }

        info!(
            variables = self.state.specs.len(),
            ticked = tickers.len(),
            "Simulated source started"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.lock().cancel();

        let moves: Vec<MoveHandle> = self.moves.lock().await.drain().map(|(_, m)| m).collect();
        for m in moves {
            m.token.cancel();
            let _ = m.handle.await;
        }

        let tickers: Vec<JoinHandle<()>> = self.tickers.lock().await.drain(..).collect();
        for handle in tickers {
            let _ = handle.await;
        }

        info!("Simulated source stopped");
    }

    async fn put(&self, name: &str, value: Value) -> Result<(), PvError> {
        let Some(spec) = self.state.specs.get(name) else {
            warn!(pv = %name, "Put to unknown simulated variable");
            return Err(PvError::UnknownVariable(name.to_string()));
        };

        let raw = coerce_numeric(&value)
            .ok_or_else(|| PvError::rejected(name, format!("{value} is not numeric")))?;
        let raw = match spec.dtype {
            DataType::Int => raw.trunc(),
            DataType::Float => raw,
        };

        self.state.emit(name, raw);

        if let Some(motor) = self.state.motors.get(name).cloned() {
            self.start_move(motor, raw).await;
        }
        Ok(())
    }

    fn current_value(&self, name: &str) -> Option<Value> {
        let spec = self.state.specs.get(name)?;
        self.state.value(name).map(|raw| spec.to_json(raw))
    }
}

async fn run_ticker(state: Arc<SimState>, name: String, token: CancellationToken) {
    loop {
        let period = jittered(state.settings.tick_interval);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        state.tick(&name);
    }
}

async fn run_move(state: Arc<SimState>, motor: MotorPvs, target: f64, token: CancellationToken) {
    let dt = state.settings.motor_step;
    let step = state.settings.motor_speed * dt.as_secs_f64();

    state.emit(&motor.moving, 1.0);
    debug!(motor = %motor.prefix, target, "Motor move started");

    loop {
        let current = state.value(&motor.readback).unwrap_or(target);
        let distance = target - current;
        if distance.abs() <= step {
            state.emit(&motor.readback, target);
            break;
        }
        state.emit(&motor.readback, round_to(current + step.copysign(distance), 4));

        tokio::select! {
            _ = token.cancelled() => {
                debug!(motor = %motor.prefix, "Motor move cancelled");
                break;
            }
            _ = tokio::time::sleep(dt) => {}
        }
    }

    state.emit(&motor.moving, 0.0);
}

/// `base` scaled by a uniform factor in `[0.5, 1.5)`.
fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Normal deviate by the Box-Muller transform.
fn gaussian<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return mean;
    }
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    mean + std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn round_significant(value: f64, digits: i32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    round_to(value, digits - 1 - magnitude)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvstream_core::{PvCallback, PvUpdate};
    use serde_json::json;
    use tokio::time::Instant;

    type Trace = Arc<Mutex<Vec<(Instant, Value)>>>;

    fn trace(dispatcher: &Dispatcher, name: &str) -> Trace {
        let seen: Trace = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: PvCallback = Arc::new(move |u: &PvUpdate| -> Result<(), PvError> {
            sink.lock().push((Instant::now(), u.value.clone()));
            Ok(())
        });
        dispatcher.subscribe(name, cb);
        seen
    }

    fn flags(trace: &Trace) -> Vec<i64> {
        trace
            .lock()
            .iter()
            .filter_map(|(_, v)| v.as_i64())
            .collect()
    }

    fn source() -> (Arc<Dispatcher>, SimulatedSource) {
        let dispatcher = Arc::new(Dispatcher::new(10_000));
        let source = SimulatedSource::new(dispatcher.clone(), SimSettings::default());
        (dispatcher, source)
    }

    #[test]
    fn test_catalog_contents() {
        let catalog = default_catalog();
        assert_eq!(catalog.len(), 19);
        for pv in &catalog {
            assert!(pv.initial >= pv.lo && pv.initial <= pv.hi, "{} out of range", pv.name);
        }
        let ticked: Vec<&str> = catalog
            .iter()
            .filter(|pv| pv.is_ticked())
            .map(|pv| pv.name.as_str())
            .collect();
        assert!(ticked.contains(&"SIM:TEMP:1"));
        assert!(ticked.contains(&"SIM:DET:COUNTS"));
        assert!(!ticked.contains(&"SIM:MTR:1:RBV"));
        assert!(!ticked.contains(&"SIM:VALVE:1"));
    }

    #[test]
    fn test_random_walk_stays_in_range() {
        let pv = SimPv::analog("X", 39.9, 5.0, 20.0, 40.0);
        let mut value = pv.initial;
        for _ in 0..1_000 {
            value = pv.step(value);
            assert!((20.0..=40.0).contains(&value));
        }
    }

    #[test]
    fn test_round_significant_keeps_small_magnitudes() {
        assert_eq!(round_significant(25.123_456_78, 6), 25.1235);
        assert_eq!(round_significant(2.345_678_9e-7, 6), 2.34568e-7);
        assert_eq!(round_significant(0.0, 6), 0.0);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(500);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(250) && d < Duration::from_millis(750));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_move_reaches_target() {
        let (dispatcher, source) = source();
        let readback = trace(&dispatcher, "SIM:MTR:1:RBV");
        let moving = trace(&dispatcher, "SIM:MTR:1:MOVN");

        let begin = Instant::now();
        source.put("SIM:MTR:1:VAL", json!(100.0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(flags(&moving), vec![1, 0]);

        let readback = readback.lock();
        let (arrived, last) = readback.last().cloned().unwrap();
        assert_eq!(last, json!(100.0));
        let elapsed = arrived.duration_since(begin).as_secs_f64();
        assert!((elapsed - 10.0).abs() <= 0.05 + 1e-9, "arrived after {elapsed}s");

        // Readback climbs monotonically by at most one step
        let values: Vec<f64> = readback.iter().filter_map(|(_, v)| v.as_f64()).collect();
        assert!(values.windows(2).all(|w| w[1] >= w[0] && w[1] - w[0] <= 0.25 + 1e-9));

        let (flag_down, _) = moving.lock().last().cloned().unwrap();
        assert_eq!(flag_down, arrived);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retarget_supersedes_move() {
        let (dispatcher, source) = source();
        let readback = trace(&dispatcher, "SIM:MTR:1:RBV");
        let moving = trace(&dispatcher, "SIM:MTR:1:MOVN");

        source.put("SIM:MTR:1:VAL", json!(100.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let reached = source.current_value("SIM:MTR:1:RBV").and_then(|v| v.as_f64()).unwrap();
        assert!(reached > 50.0 && reached < 100.0);

        source.put("SIM:MTR:1:VAL", json!(40.0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        // One flag-down per move, never two movers at once
        assert_eq!(flags(&moving), vec![1, 0, 1, 0]);
        assert_eq!(source.current_value("SIM:MTR:1:RBV"), Some(json!(40.0)));

        // The second move starts from where the first one stopped
        let values: Vec<f64> = readback.lock().iter().filter_map(|(_, v)| v.as_f64()).collect();
        let turn = values.windows(2).position(|w| w[1] < w[0]).unwrap();
        assert_eq!(values[turn], reached);
        assert!((values[turn + 1] - (reached - 0.25)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_moves_and_ticks() {
        let (dispatcher, source) = source();
        source.start().await.unwrap();
        let moving = trace(&dispatcher, "SIM:MTR:2:MOVN");

        source.put("SIM:MTR:2:VAL", json!(0.0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        source.stop().await;

        assert_eq!(flags(&moving), vec![0, 1, 0]);
        let stopped_at = source.current_value("SIM:MTR:2:RBV").and_then(|v| v.as_f64()).unwrap();
        assert!(stopped_at > 0.0 && stopped_at < 180.0);

        let count = dispatcher.notified_count();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.notified_count(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setpoint_after_stop_does_not_move() {
        let (dispatcher, source) = source();
        source.start().await.unwrap();
        source.stop().await;
        let moving = trace(&dispatcher, "SIM:MTR:1:MOVN");
        let readback = trace(&dispatcher, "SIM:MTR:1:RBV");

        source.put("SIM:MTR:1:VAL", json!(80.0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(source.current_value("SIM:MTR:1:VAL"), Some(json!(80.0)));
        // Only the seeds delivered on subscribe
        assert_eq!(flags(&moving), vec![0]);
        assert_eq!(readback.lock().len(), 1);
        assert_eq!(source.current_value("SIM:MTR:1:RBV"), Some(json!(50.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tickers_produce_values() {
        let (dispatcher, source) = source();
        source.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        source.stop().await;

        let history = dispatcher.history();
        assert!(history.len("SIM:TEMP:1") >= 4);
        assert!(history.len("SIM:DET:COUNTS") >= 4);
        // Driven variables only carry their seed
        assert_eq!(history.len("SIM:MTR:1:RBV"), 1);
        assert_eq!(history.len("SIM:VALVE:1"), 1);

        let temp = dispatcher.current_value("SIM:TEMP:1").and_then(|v| v.as_f64()).unwrap();
        assert!((20.0..=40.0).contains(&temp));
        assert!(dispatcher.current_value("SIM:DET:COUNTS").unwrap().is_i64());
    }

    #[tokio::test]
    async fn test_put_coerces_to_variable_type() {
        let (dispatcher, source) = source();

        source.put("SIM:VALVE:1", json!(1.7)).await.unwrap();
        assert_eq!(source.current_value("SIM:VALVE:1"), Some(json!(1)));
        assert_eq!(dispatcher.current_value("SIM:VALVE:1"), Some(json!(1)));

        source.put("SIM:FLOW:1", json!("7.5")).await.unwrap();
        assert_eq!(source.current_value("SIM:FLOW:1"), Some(json!(7.5)));
    }

    #[tokio::test]
    async fn test_put_rejections_change_nothing() {
        let (dispatcher, source) = source();

        let err = source.put("SIM:NOPE", json!(1)).await.unwrap_err();
        assert_eq!(err, PvError::UnknownVariable("SIM:NOPE".to_string()));

        let err = source.put("SIM:VALVE:1", json!("open")).await.unwrap_err();
        assert!(matches!(err, PvError::WriteRejected { .. }));
        assert_eq!(source.current_value("SIM:VALVE:1"), Some(json!(0)));
        assert_eq!(dispatcher.notified_count(), 0);
    }
}
