//! Runs simulations on a background thread and publishes their results.
//!
//! The host asks for a run with [`SimManager::request_simulation`] whenever
//! the vessel changes, and calls [`SimManager::try_start_simulation`] from
//! its update loop. Requests collapse into at most one pending run, and a
//! new run never starts sooner than the minimum simulation time after the
//! previous one started.
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::{
    resources::ResourceLibrary,
    simulation::{SimConditions, Simulation, ThrustCorrection},
    stage::Stage,
    vessel::VesselDescription,
};

pub const DEFAULT_MIN_SIM_TIME: Duration = Duration::from_millis(200);

/// Where the manager gets its vessel from when a run starts.
pub trait VesselSource {
    /// A snapshot of the vessel to simulate, or `None` when there is no
    /// vessel or editor to simulate right now.
    fn vessel(&self) -> Option<VesselDescription>;
}

impl<F> VesselSource for F
where
    F: Fn() -> Option<VesselDescription>,
{
    fn vessel(&self) -> Option<VesselDescription> {
        self()
    }
}

impl VesselSource for VesselDescription {
    fn vessel(&self) -> Option<VesselDescription> {
        Some(self.clone())
    }
}

/// The outcome of the most recent run. Everything is `None` until a run
/// has finished.
#[derive(Clone, Debug, Default)]
pub struct SimResults {
    pub stages: Option<Arc<[Stage]>>,
    /// The stage burning right now, the last entry of `stages`.
    pub last_stage: Option<Stage>,
    pub fail_message: Option<String>,
    pub run_time: Duration,
}

type OnReady = Arc<dyn Fn() + Send + Sync>;

struct State {
    min_sim_time: Duration,
    delay_between_sims: Duration,
    requested: bool,
    running: bool,
    /// Started by the first request, restarted when a run finishes.
    timer: Option<Instant>,
    conditions: SimConditions,
    library: Arc<ResourceLibrary>,
    thrust_correction: Option<ThrustCorrection>,
    on_ready: Option<OnReady>,
    worker: Option<JoinHandle<()>>,
    run_count: u64,
}

impl State {
    fn startable(&self) -> bool {
        self.requested
            && !self.running
            && self
                .timer
                .is_some_and(|x| x.elapsed() >= self.delay_between_sims)
    }
}

struct Shared {
    state: Mutex<State>,
    results: RwLock<SimResults>,
}

impl Shared {
    fn finish(&self, result: Result<Vec<Stage>, String>, started: Instant) {
        let run_time = started.elapsed();
        *self.results.write() = match result {
            Ok(stages) => SimResults {
                last_stage: stages.last().cloned(),
                stages: Some(stages.into()),
                fail_message: None,
                run_time,
            },
            Err(message) => {
                error!("simulation failed: {message}");
                SimResults {
                    fail_message: Some(message),
                    run_time,
                    ..SimResults::default()
                }
            }
        };

        let on_ready = {
            let mut state = self.state.lock();
            state.delay_between_sims = state.min_sim_time.saturating_sub(run_time);
            state.timer = Some(Instant::now());
            state.running = false;
            state.run_count += 1;
            debug!(
                "simulation finished in {run_time:?}, next run in {:?}",
                state.delay_between_sims
            );
            state.on_ready.clone()
        };
        if let Some(on_ready) = on_ready {
            on_ready();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "simulation panicked".to_owned()
    }
}

/// Handle to the simulation manager. Clones share the same state.
#[derive(Clone)]
pub struct SimManager {
    shared: Arc<Shared>,
}

impl Default for SimManager {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SIM_TIME)
    }
}

impl SimManager {
    pub fn new(min_sim_time: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    min_sim_time,
                    delay_between_sims: Duration::ZERO,
                    requested: false,
                    running: false,
                    timer: None,
                    conditions: SimConditions::default(),
                    library: Arc::new(ResourceLibrary::stock()),
                    thrust_correction: None,
                    on_ready: None,
                    worker: None,
                    run_count: 0,
                }),
                results: RwLock::new(SimResults::default()),
            }),
        }
    }

    pub fn min_sim_time(&self) -> Duration {
        self.shared.state.lock().min_sim_time
    }

    pub fn set_min_sim_time(&self, min_sim_time: Duration) {
        self.shared.state.lock().min_sim_time = min_sim_time;
    }

    pub fn conditions(&self) -> SimConditions {
        self.shared.state.lock().conditions.clone()
    }

    /// Takes effect from the next run.
    pub fn set_conditions(&self, conditions: SimConditions) {
        self.shared.state.lock().conditions = conditions;
    }

    pub fn set_resource_library(&self, library: Arc<ResourceLibrary>) {
        self.shared.state.lock().library = library;
    }

    pub fn set_thrust_correction(&self, thrust_correction: Option<ThrustCorrection>) {
        self.shared.state.lock().thrust_correction = thrust_correction;
    }

    /// Called on the worker thread each time results are published.
    pub fn set_on_ready(&self, on_ready: impl Fn() + Send + Sync + 'static) {
        self.shared.state.lock().on_ready = Some(Arc::new(on_ready));
    }

    pub fn request_simulation(&self) {
        let mut state = self.shared.state.lock();
        state.requested = true;
        if state.timer.is_none() {
            state.timer = Some(Instant::now());
        }
    }

    /// Start a run if one is requested, none is in flight, `source` has a
    /// vessel and the cooldown since the last run has passed. The vessel is
    /// snapshotted on the calling thread; only the snapshot goes to the
    /// worker. Returns whether a run was started.
    pub fn try_start_simulation(&self, source: &impl VesselSource) -> bool {
        if !self.shared.state.lock().startable() {
            return false;
        }
        let Some(vessel) = source.vessel() else {
            return false;
        };

        let (conditions, library, thrust_correction) = {
            let mut state = self.shared.state.lock();
            if !state.startable() {
                return false;
            }
            state.requested = false;
            state.running = true;
            (
                state.conditions.clone(),
                state.library.clone(),
                state.thrust_correction.clone(),
            )
        };
        *self.shared.results.write() = SimResults::default();

        let started = Instant::now();
        let sim = match Simulation::prepare(&vessel, library, conditions, thrust_correction.as_ref())
        {
            Ok(sim) => sim,
            Err(e) => {
                self.shared.finish(Err(format!("{e:#}")), started);
                return false;
            }
        };

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("kerbeng-sim".to_owned())
            .spawn(move || {
                let result = match panic::catch_unwind(AssertUnwindSafe(|| sim.run())) {
                    Ok(Ok(stages)) => Ok(stages),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(payload) => Err(panic_message(&*payload)),
                };
                shared.finish(result, started);
            });

        match spawned {
            Ok(worker) => {
                self.shared.state.lock().worker = Some(worker);
                true
            }
            Err(e) => {
                self.shared
                    .finish(Err(format!("failed to spawn simulation thread: {e}")), started);
                false
            }
        }
    }

    /// Is no run in flight?
    pub fn results_ready(&self) -> bool {
        !self.is_running()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Number of runs that have finished, successfully or not.
    pub fn run_count(&self) -> u64 {
        self.shared.state.lock().run_count
    }

    /// Block until the in-flight run, if any, has finished.
    pub fn wait(&self) {
        let worker = self.shared.state.lock().worker.take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("simulation worker panicked");
            }
        }
    }

    pub fn results(&self) -> SimResults {
        self.shared.results.read().clone()
    }

    pub fn stages(&self) -> Option<Arc<[Stage]>> {
        self.shared.results.read().stages.clone()
    }

    pub fn last_stage(&self) -> Option<Stage> {
        self.shared.results.read().last_stage.clone()
    }

    pub fn fail_message(&self) -> Option<String> {
        self.shared.results.read().fail_message.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        resources::stock,
        vessel::{EngineModule, Part, PartModule},
    };

    fn rocket() -> VesselDescription {
        let mut vessel = VesselDescription::new("rocket");
        let tank = vessel.add_part(
            Part::new("tank", 0.25)
                .with_resource(stock::LIQUID_FUEL, 90.0)
                .with_resource(stock::OXIDIZER, 110.0),
        );
        let engine = vessel.add_part(
            Part::new("engine", 1.0)
                .with_module(PartModule::Engine(EngineModule::liquid(60.0, 300.0, 250.0))),
        );
        vessel.stack(tank, engine);
        vessel
    }

    #[test]
    fn nothing_runs_without_a_request() {
        let manager = SimManager::new(Duration::ZERO);
        assert!(!manager.try_start_simulation(&rocket()));
        assert!(manager.results_ready());
        assert!(manager.stages().is_none());
    }

    #[test]
    fn nothing_runs_without_a_vessel() {
        let manager = SimManager::new(Duration::ZERO);
        manager.request_simulation();
        assert!(!manager.try_start_simulation(&|| -> Option<VesselDescription> { None }));
        // The request is still pending.
        assert!(manager.try_start_simulation(&rocket()));
        manager.wait();
    }

    #[test]
    fn publishes_stages_and_calls_back() {
        let manager = SimManager::new(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.set_on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.request_simulation();
        assert!(manager.try_start_simulation(&rocket()));
        manager.wait();

        assert!(manager.results_ready());
        assert_eq!(manager.run_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stages = manager.stages().unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(manager.last_stage().as_ref(), stages.last());
        assert!(manager.fail_message().is_none());

        // The request was consumed.
        assert!(!manager.try_start_simulation(&rocket()));
    }

    #[test]
    fn failed_preparation_is_published() {
        let manager = SimManager::new(Duration::ZERO);
        manager.request_simulation();
        assert!(!manager.try_start_simulation(&VesselDescription::new("empty")));
        assert!(!manager.is_running());
        assert!(manager.stages().is_none());
        assert!(manager.last_stage().is_none());
        assert!(manager.fail_message().unwrap().contains("no parts"));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");
        let payload = panic::catch_unwind(|| panic!("{}", 42)).unwrap_err();
        assert_eq!(panic_message(&*payload), "42");
    }
}
