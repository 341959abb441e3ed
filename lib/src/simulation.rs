//! One staging simulation over a snapshot of a vessel.
//!
//! [`Simulation::prepare`] copies everything it needs out of a
//! [`VesselDescription`]; [`Simulation::run`] then walks the stages from
//! the last one down to stage 0, burning each until it is allowed to stage.
use std::{
    cmp,
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use color_eyre::eyre::{self, bail};
use nalgebra::Vector3;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    arena::{Arena, IdLike},
    engine::{EngineSim, RcsSim, G0},
    part::{dump_part_tree, setup_attach_nodes, setup_parent, PartSim, PartSimId},
    resources::{ResourceId, ResourceLibrary},
    stage::{Stage, MAX_REPORTED_TIME},
    vessel::{EngineModule, Part, PartId, VesselDescription},
};

/// Upper bound on drain steps within one stage.
const MAX_DRAIN_STEPS: usize = 1000;

/// The environment a simulation runs in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConditions {
    /// Local gravity for thrust-to-weight (m/s^2).
    pub gravity: f64,
    /// Atmospheric pressure for isp (atm).
    pub atmosphere: f64,
    /// Atmospheric density for engine flow (kg/m^3).
    pub atm_density: f64,
    pub mach: f64,
    /// Sum thrust along each nozzle's direction instead of assuming every
    /// engine points the same way.
    pub vectored_thrust: bool,
    /// Burn every engine at full throttle regardless of its live throttle.
    pub full_throttle: bool,
    /// Log the snapshot part tree once prepared.
    pub dump_tree: bool,
    /// Log every drain decision.
    pub log_output: bool,
}

impl Default for SimConditions {
    fn default() -> Self {
        Self {
            gravity: G0,
            atmosphere: 0.0,
            atm_density: 0.0,
            mach: 0.0,
            vectored_thrust: false,
            full_throttle: false,
            dump_tree: false,
            log_output: false,
        }
    }
}

/// Decides per engine whether to keep its rated vacuum thrust rather than
/// scaling thrust with isp.
pub type ThrustCorrection = Arc<dyn Fn(&Part, &EngineModule) -> bool + Send + Sync>;

#[derive(Copy, Clone, Debug, Default)]
struct RcsFigures {
    thrust: f64,
    isp: f64,
    thrust_to_weight: f64,
    delta_v: f64,
    burn_time: f64,
}

fn ratio(x: f64, y: f64) -> f64 {
    if y > 0.0 {
        x / y
    } else {
        0.0
    }
}

pub struct Simulation {
    library: Arc<ResourceLibrary>,
    conditions: SimConditions,

    parts: Arena<PartSimId, PartSim>,
    all_parts: Vec<PartSimId>,
    all_fuel_lines: Vec<PartSimId>,
    all_engines: Vec<EngineSim>,
    /// Indices into `all_engines`.
    active_engines: Vec<usize>,
    all_rcs: Vec<RcsSim>,

    draining_parts: BTreeSet<PartSimId>,
    draining_resources: BTreeSet<ResourceId>,
    /// Parts that must burn out or run dry before each stage may end.
    dont_stage_lists: Vec<Vec<PartSimId>>,

    last_stage: i32,
    current_stage: i32,
    doing_current: bool,

    vec_thrust: Vector3<f64>,
    vec_actual_thrust: Vector3<f64>,
    simple_total_thrust: f64,
    total_stage_thrust: f64,
    total_stage_actual_thrust: f64,
    total_stage_flow_rate: f64,
    total_stage_isp_flow_rate: f64,
    current_isp: f64,
    max_mach: f64,
}

impl Simulation {
    pub fn prepare(
        vessel: &VesselDescription,
        library: Arc<ResourceLibrary>,
        conditions: SimConditions,
        thrust_correction: Option<&ThrustCorrection>,
    ) -> eyre::Result<Self> {
        if vessel.parts.is_empty() {
            bail!("vessel {:?} has no parts", vessel.name);
        }
        for (name, value) in [
            ("gravity", conditions.gravity),
            ("atmosphere", conditions.atmosphere),
            ("atmospheric density", conditions.atm_density),
            ("mach", conditions.mach),
        ] {
            if !value.is_finite() {
                bail!("{name} must be finite, got {value}");
            }
        }

        let mut parts: Arena<PartSimId, PartSim> = vessel
            .parts
            .iter()
            .enumerate()
            .map(|(i, part)| PartSim::new(vessel, PartId::from_raw(i), part, &library))
            .collect();

        let mut last_stage = vessel.last_stage;
        for (_, part) in parts.iter() {
            last_stage = cmp::max(last_stage, part.decoupled_in_stage + 1);
        }

        for (i, part) in vessel.parts.iter().enumerate() {
            let id = PartSimId::from_raw(i);
            setup_parent(&mut parts, id, part.parent);
            setup_attach_nodes(&mut parts, id, part, conditions.log_output);
        }

        let mut all_engines = Vec::new();
        let mut all_rcs = Vec::new();
        for (i, part) in vessel.parts.iter().enumerate() {
            let sim = &parts[PartSimId::from_raw(i)];
            for module in part.engines() {
                let corrected = thrust_correction.is_some_and(|f| (**f)(part, module));
                all_engines.push(EngineSim::new(
                    sim,
                    module,
                    &conditions,
                    &library,
                    corrected,
                ));
            }
            for module in part.rcs() {
                all_rcs.push(RcsSim::new(sim, module, &conditions, &library));
            }
        }

        for (_, part) in parts.iter_mut() {
            part.start_mass = part.mass(last_stage + 1, &library);
        }

        let all_parts: Vec<PartSimId> = parts.ids().collect();
        let all_fuel_lines = parts
            .iter()
            .filter(|(_, x)| x.is_fuel_line)
            .map(|(id, _)| id)
            .collect();

        let sim = Self {
            library,
            conditions,
            parts,
            all_parts,
            all_fuel_lines,
            all_engines,
            active_engines: Vec::new(),
            all_rcs,
            draining_parts: BTreeSet::new(),
            draining_resources: BTreeSet::new(),
            dont_stage_lists: Vec::new(),
            last_stage,
            current_stage: last_stage,
            doing_current: false,
            vec_thrust: Vector3::zeros(),
            vec_actual_thrust: Vector3::zeros(),
            simple_total_thrust: 0.0,
            total_stage_thrust: 0.0,
            total_stage_actual_thrust: 0.0,
            total_stage_flow_rate: 0.0,
            total_stage_isp_flow_rate: 0.0,
            current_isp: 0.0,
            max_mach: 0.0,
        };

        debug!(
            "prepared {}: {} parts, {} engines, {} fuel lines, last stage {last_stage}",
            vessel.name,
            sim.all_parts.len(),
            sim.all_engines.len(),
            sim.all_fuel_lines.len(),
        );
        if sim.conditions.dump_tree {
            debug!("part tree:\n{}", sim.dump_tree());
        }

        Ok(sim)
    }

    pub fn last_stage(&self) -> i32 {
        self.last_stage
    }

    pub fn dump_tree(&self) -> String {
        dump_part_tree(
            &self.parts,
            &self.all_parts,
            self.current_stage,
            &self.library,
        )
    }

    /// Simulate every stage. The result is indexed by stage number; a
    /// synthetic stage for engines already burning out of stage order is
    /// appended at the end with number -1.
    pub fn run(mut self) -> eyre::Result<Vec<Stage>> {
        self.current_stage = self.last_stage;

        let mut stage_mismatch = false;
        let mut any_active = false;
        for engine in &self.all_engines {
            let staged = self.parts[engine.part].inverse_stage >= self.current_stage;
            stage_mismatch |= engine.is_active != staged;
            any_active |= engine.is_active;
        }

        if stage_mismatch && any_active {
            debug!(
                "engine state differs from staging at stage {}, simulating current stage",
                self.last_stage
            );
            self.doing_current = true;
            self.current_stage += 1;
        } else {
            self.doing_current = false;
            self.activate_stage();
        }

        let stage_count = usize::try_from(self.current_stage + 1).unwrap_or(0);
        self.build_dont_stage_lists(stage_count);

        let mut stages = vec![Stage::default(); stage_count];
        while self.current_stage >= 0 {
            let index = usize::try_from(self.current_stage)?;
            stages[index] = self.simulate_stage(index)?;

            self.current_stage -= 1;
            self.doing_current = false;
            self.activate_stage();
        }

        Stage::accumulate_totals(&mut stages);
        Ok(stages)
    }

    fn simulate_stage(&mut self, index: usize) -> eyre::Result<Stage> {
        self.update_resource_drains();

        let gravity = self.conditions.gravity;
        let start_mass = self.ship_mass();
        let mut stage = Stage {
            number: if self.doing_current {
                -1
            } else {
                self.current_stage
            },
            start_mass,
            thrust: self.total_stage_thrust,
            actual_thrust: self.total_stage_actual_thrust,
            thrust_to_weight: ratio(self.total_stage_thrust, start_mass * gravity),
            actual_thrust_to_weight: ratio(self.total_stage_actual_thrust, start_mass * gravity),
            max_mach: self.max_mach,
            ..Stage::default()
        };
        stage.max_thrust_to_weight = stage.thrust_to_weight;

        let rcs = self.rcs_figures(start_mass);
        stage.rcs_thrust = rcs.thrust;
        stage.rcs_isp = rcs.isp;
        stage.rcs_thrust_to_weight = rcs.thrust_to_weight;
        stage.rcs_delta_v_start = rcs.delta_v;
        stage.rcs_burn_time = rcs.burn_time;

        for &id in &self.all_parts {
            let part = &self.parts[id];
            if part.decoupled_in_stage == self.current_stage - 1 {
                stage.cost += part.cost;
                stage.mass += part.start_mass;
            }
        }

        let dont_stage = self.dont_stage_lists.get(index).cloned().unwrap_or_default();
        let mut step_start_mass = start_mass;
        let mut stage_time = 0.0;
        let mut stage_delta_v = Vector3::zeros();
        let mut steps = 0;

        while !self.allowed_to_stage(&dont_stage) {
            steps += 1;

            let dt = self
                .draining_parts
                .iter()
                .map(|x| OrderedFloat(self.parts[*x].time_to_drain()))
                .min()
                .map_or(f64::MAX, |x| x.0);
            if dt == f64::MAX || !dt.is_finite() {
                debug!("stage {}: nothing left to drain", stage.number);
                break;
            }
            if self.conditions.log_output {
                debug!("stage {}: dt={dt} draining {:?}", stage.number, self.draining_parts);
            } else {
                trace!("stage {}: dt={dt}", stage.number);
            }

            for &id in &self.draining_parts {
                self.parts[id].drain(dt);
            }
            let step_end_mass = self.ship_mass();
            stage_time += dt;

            if step_end_mass > 0.0 {
                let twr = ratio(self.total_stage_thrust, step_end_mass * gravity);
                stage.max_thrust_to_weight = cmp::max(
                    OrderedFloat(stage.max_thrust_to_weight),
                    OrderedFloat(twr),
                )
                .0;
            }
            if step_start_mass > step_end_mass
                && step_end_mass > 0.0
                && self.simple_total_thrust > 0.0
            {
                let delta_v = self.current_isp * G0 * libm::log(step_start_mass / step_end_mass);
                stage_delta_v += self.vec_thrust * (delta_v / self.simple_total_thrust);
            }

            self.update_resource_drains();

            if step_start_mass == step_end_mass {
                debug!("stage {}: no change in mass", stage.number);
                break;
            }
            if steps >= MAX_DRAIN_STEPS {
                warn!("stage {}: too many drain steps, giving up", stage.number);
                break;
            }
            step_start_mass = step_end_mass;
        }

        let end_mass = self.ship_mass();
        if !end_mass.is_finite() {
            bail!("vessel mass became {end_mass} in stage {}", self.current_stage);
        }

        stage.end_mass = end_mass;
        stage.delta_v = stage_delta_v.norm();
        stage.resource_mass = start_mass - end_mass;
        stage.isp = if start_mass > end_mass && end_mass > 0.0 {
            stage.delta_v / (G0 * libm::log(start_mass / end_mass))
        } else {
            0.0
        };
        stage.time = if stage_time < MAX_REPORTED_TIME {
            stage_time
        } else {
            0.0
        };
        stage.rcs_delta_v_end = self.rcs_figures(end_mass).delta_v;
        stage.total_part_count = self.all_parts.len();

        debug!("{stage} ({steps} drain steps)");
        Ok(stage)
    }

    fn ship_mass(&self) -> f64 {
        self.all_parts
            .iter()
            .map(|x| self.parts[*x].mass(self.current_stage, &self.library))
            .sum()
    }

    /// Drop everything that decouples in the current stage and light the
    /// engines that fire in it.
    fn activate_stage(&mut self) {
        let removed: BTreeSet<PartSimId> = self
            .all_parts
            .iter()
            .copied()
            .filter(|x| self.parts[*x].decoupled_in_stage >= self.current_stage)
            .collect();

        if !removed.is_empty() {
            if self.conditions.log_output {
                debug!("stage {}: decoupling {removed:?}", self.current_stage);
            }
            self.all_parts.retain(|x| !removed.contains(x));
            self.all_fuel_lines.retain(|x| !removed.contains(x));
            self.all_engines.retain(|x| !removed.contains(&x.part));
            self.all_rcs.retain(|x| !removed.contains(&x.part));
            for &id in &self.all_parts {
                self.parts[id].remove_attached_parts(&removed);
            }
        }

        self.active_engines.clear();
        for engine in &mut self.all_engines {
            if self.parts[engine.part].inverse_stage == self.current_stage {
                engine.is_active = true;
            }
        }
    }

    fn build_dont_stage_lists(&mut self, stage_count: usize) {
        self.dont_stage_lists = vec![Vec::new(); stage_count];
        for &id in &self.all_parts {
            let part = &self.parts[id];
            if !part.is_engine && part.resources.empty() {
                continue;
            }
            if part.decoupled_in_stage >= self.current_stage {
                trace!("{}: decoupled before the first simulated stage", part.name);
                continue;
            }
            if let Some(list) = usize::try_from(part.decoupled_in_stage + 1)
                .ok()
                .and_then(|x| self.dont_stage_lists.get_mut(x))
            {
                list.push(id);
            }
        }

        // A stage that drops nothing burns until the next one could stage.
        for i in 1..stage_count {
            if self.dont_stage_lists[i].is_empty() {
                self.dont_stage_lists[i] = self.dont_stage_lists[i - 1].clone();
            }
        }
    }

    /// Can the current stage end? Not while a part that leaves with it is
    /// still feeding the engines or is itself a burning engine.
    fn allowed_to_stage(&self, dont_stage: &[PartSimId]) -> bool {
        for &id in dont_stage {
            let part = &self.parts[id];
            if part.is_sepratron {
                continue;
            }
            if !part.resources.empty_of(&self.draining_resources) {
                return false;
            }
            if part.is_engine
                && self
                    .active_engines
                    .iter()
                    .any(|x| self.all_engines[*x].part == id)
            {
                return false;
            }
        }

        !(self.current_stage == 0 && self.doing_current)
    }

    fn update_active_engines(&mut self) {
        self.active_engines = self
            .all_engines
            .iter()
            .enumerate()
            .filter(|(_, x)| x.is_active && !x.is_flamed_out)
            .map(|(i, _)| i)
            .collect();
        self.calculate_thrust_and_isp();
    }

    fn calculate_thrust_and_isp(&mut self) {
        self.vec_thrust = Vector3::zeros();
        self.vec_actual_thrust = Vector3::zeros();
        self.simple_total_thrust = 0.0;
        self.total_stage_flow_rate = 0.0;
        self.total_stage_isp_flow_rate = 0.0;
        self.max_mach = 0.0;

        for &i in &self.active_engines {
            let engine = &self.all_engines[i];
            self.simple_total_thrust += engine.thrust;
            self.vec_thrust += engine.thrust_vec * engine.thrust;
            self.vec_actual_thrust += engine.thrust_vec * engine.actual_thrust;
            self.total_stage_flow_rate += engine.flow_rate;
            self.total_stage_isp_flow_rate += engine.flow_rate * engine.isp;
            self.max_mach = cmp::max(OrderedFloat(self.max_mach), OrderedFloat(engine.max_mach)).0;
        }

        self.total_stage_thrust = self.vec_thrust.norm();
        self.total_stage_actual_thrust = self.vec_actual_thrust.norm();
        self.current_isp = ratio(self.total_stage_isp_flow_rate, self.total_stage_flow_rate);
    }

    fn update_resource_drains(&mut self) {
        self.update_active_engines();

        for &id in &self.draining_parts {
            self.parts[id].resource_drains.reset();
        }
        self.draining_parts.clear();
        self.draining_resources.clear();

        for i in self.active_engines.clone() {
            let engine = &mut self.all_engines[i];
            if engine.set_resource_drains(
                &mut self.parts,
                &self.all_parts,
                &mut self.draining_parts,
                self.conditions.log_output,
            ) {
                self.draining_resources
                    .extend(engine.resource_consumptions.types());
            }
        }

        self.update_active_engines();
    }

    fn rcs_figures(&self, mass: f64) -> RcsFigures {
        let mut fuel: BTreeMap<ResourceId, BTreeSet<PartSimId>> = BTreeMap::new();
        let mut figures = RcsFigures::default();
        let mut flow = 0.0;
        let mut isp_flow = 0.0;

        for rcs in &self.all_rcs {
            let Some(sources) = rcs.sources(&self.parts, &self.all_parts) else {
                continue;
            };
            figures.thrust += rcs.thrust;
            flow += rcs.flow_rate;
            isp_flow += rcs.flow_rate * rcs.isp;
            for (res, set) in sources {
                fuel.entry(res).or_default().extend(set);
            }
        }

        let fuel_mass: f64 = fuel
            .iter()
            .map(|(res, set)| {
                let amount: f64 = set
                    .iter()
                    .map(|x| self.parts[*x].drainable(*res).max(0.0))
                    .sum();
                amount * self.library.density(*res)
            })
            .sum();

        figures.isp = ratio(isp_flow, flow);
        figures.thrust_to_weight = ratio(figures.thrust, mass * self.conditions.gravity);
        figures.burn_time = ratio(fuel_mass, flow);
        if fuel_mass > 0.0 && mass > fuel_mass {
            figures.delta_v = figures.isp * G0 * libm::log(mass / (mass - fuel_mass));
        }
        figures
    }
}
