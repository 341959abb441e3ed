//! Engines and RCS thrusters as seen by the simulation.
use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;
use tracing::{debug, warn};

use crate::{
    arena::Arena,
    part::{source_set, PartSim, PartSimId},
    resources::{FlowMode, ResourceContainer, ResourceId, ResourceLibrary},
    simulation::SimConditions,
    vessel::{EngineModule, Propellant, RcsModule, ThrustTransform},
};

/// Standard gravity (m/s^2), for converting isp to exhaust velocity.
pub const G0: f64 = 9.80665;

/// Floor for the atmosphere/velocity flow multiplier.
const MIN_FLOW_MODIFIER: f64 = 1e-7;

fn lerp(x: f64, y: f64, t: f64) -> f64 {
    x + t * (y - x)
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSim {
    pub part: PartSimId,
    /// Isp at the simulated conditions (s).
    pub isp: f64,
    /// Thrust at the thrust limiter (kN).
    pub thrust: f64,
    /// Thrust the live engine produces at its current throttle (kN).
    pub actual_thrust: f64,
    /// Mass flow of the propellants counted for isp (tons/s).
    pub flow_rate: f64,
    /// Direction of thrust, weighted by nozzle multipliers.
    pub thrust_vec: Vector3<f64>,
    /// Units of each propellant consumed per second.
    pub resource_consumptions: ResourceContainer,
    pub resource_flow_modes: BTreeMap<ResourceId, FlowMode>,
    pub is_active: bool,
    pub is_flamed_out: bool,
    /// Mach number past which the velocity curve ends.
    pub max_mach: f64,
}

impl EngineSim {
    /// `thrust_corrected` keeps the engine's rated vacuum thrust instead of
    /// scaling it with the isp at the simulated pressure.
    pub fn new(
        part: &PartSim,
        module: &EngineModule,
        conditions: &SimConditions,
        library: &ResourceLibrary,
        thrust_corrected: bool,
    ) -> Self {
        let isp = module.atmosphere_curve.evaluate(conditions.atmosphere);
        let thrust_isp = if thrust_corrected {
            module.atmosphere_curve.evaluate(0.0)
        } else {
            isp
        };

        let mut flow_modifier = 1.0;
        if module.atm_change_flow {
            let density_ratio = conditions.atm_density * 40.0 / 49.0;
            flow_modifier = match &module.atm_curve {
                Some(curve) => curve.evaluate(density_ratio),
                None => density_ratio,
            };
        }
        let mut max_mach = 0.0;
        if let Some(curve) = &module.vel_curve {
            flow_modifier *= curve.evaluate(conditions.mach);
            max_mach = curve.max_time();
        }
        if let Some(curve) = &module.thrust_curve {
            flow_modifier *= curve.evaluate(module.thrust_curve_ratio);
        }
        flow_modifier = flow_modifier.max(MIN_FLOW_MODIFIER);

        let limiter = module.thrust_percentage * 0.01;
        let max_flow = lerp(module.min_fuel_flow, module.max_fuel_flow, limiter) * flow_modifier;
        let thrust = max_flow * thrust_isp * G0;

        let running = part.has_vessel && module.is_operational && !module.flameout;
        let actual_thrust = if running {
            lerp(
                module.min_fuel_flow,
                module.max_fuel_flow,
                module.current_throttle * limiter,
            ) * flow_modifier
                * thrust_isp
                * G0
        } else {
            0.0
        };

        let use_actual = running
            && !module.throttle_locked
            && !conditions.full_throttle
            && !part.is_landed
            && module.current_throttle > 0.0;
        let ve = isp * G0;
        let flow_rate = if ve <= 0.0 {
            0.0
        } else if use_actual {
            actual_thrust / ve
        } else {
            thrust / ve
        };

        let mut engine = Self {
            part: part.id,
            isp,
            thrust,
            actual_thrust,
            flow_rate,
            thrust_vec: thrust_vector(&module.thrust_transforms, conditions.vectored_thrust),
            resource_consumptions: ResourceContainer::new(),
            resource_flow_modes: BTreeMap::new(),
            is_active: module.is_operational,
            is_flamed_out: module.flameout,
            max_mach,
        };
        set_consumption_rates(
            &module.propellants,
            flow_rate,
            library,
            &mut engine.resource_consumptions,
            &mut engine.resource_flow_modes,
        );
        engine
    }

    /// Assign this engine's consumption to the parts it draws from. If any
    /// propellant has no source the engine shuts down and no drain is set.
    pub fn set_resource_drains(
        &mut self,
        parts: &mut Arena<PartSimId, PartSim>,
        all_parts: &[PartSimId],
        draining_parts: &mut BTreeSet<PartSimId>,
        log_output: bool,
    ) -> bool {
        let mut sources = Vec::with_capacity(self.resource_consumptions.len());
        for (res, _) in self.resource_consumptions.iter() {
            let mode = self.resource_flow_modes.get(&res).copied().unwrap_or_default();
            let set = find_sources(parts, all_parts, self.part, res, mode);
            if set.is_empty() {
                if log_output {
                    debug!("{}: no source for {res:?}, engine shut down", parts[self.part].name);
                }
                self.is_active = false;
                return false;
            }
            sources.push((res, mode, set));
        }

        for (res, mode, set) in sources {
            let rate = self.resource_consumptions.get(res);
            apportion(parts, res, rate, mode.is_balanced(), &set);
            draining_parts.extend(set);
        }
        true
    }

    /// Mass flow of all propellants, including those ignored for isp.
    pub fn mass_flow(&self, library: &ResourceLibrary) -> f64 {
        self.resource_consumptions.mass(library)
    }
}

/// A reaction control block. RCS never drains the simulated vessel; it only
/// reports what its fuel is worth at each stage.
#[derive(Clone, Debug, PartialEq)]
pub struct RcsSim {
    pub part: PartSimId,
    pub isp: f64,
    pub thrust: f64,
    pub flow_rate: f64,
    pub resource_consumptions: ResourceContainer,
    pub resource_flow_modes: BTreeMap<ResourceId, FlowMode>,
}

impl RcsSim {
    pub fn new(
        part: &PartSim,
        module: &RcsModule,
        conditions: &SimConditions,
        library: &ResourceLibrary,
    ) -> Self {
        let isp = module.atmosphere_curve.evaluate(conditions.atmosphere);
        let nozzles = if module.thrust_transforms.is_empty() {
            1.0
        } else {
            module.thrust_transforms.iter().map(|x| x.multiplier).sum::<f64>()
        };
        let thrust = module.thruster_power * module.thrust_percentage * 0.01 * nozzles;
        let ve = isp * G0;
        let flow_rate = if ve > 0.0 { thrust / ve } else { 0.0 };

        let mut rcs = Self {
            part: part.id,
            isp,
            thrust,
            flow_rate,
            resource_consumptions: ResourceContainer::new(),
            resource_flow_modes: BTreeMap::new(),
        };
        set_consumption_rates(
            &module.propellants,
            flow_rate,
            library,
            &mut rcs.resource_consumptions,
            &mut rcs.resource_flow_modes,
        );
        rcs
    }

    /// The parts holding each propellant, or `None` if one has no source.
    pub fn sources(
        &self,
        parts: &Arena<PartSimId, PartSim>,
        all_parts: &[PartSimId],
    ) -> Option<BTreeMap<ResourceId, BTreeSet<PartSimId>>> {
        let mut out = BTreeMap::new();
        for res in self.resource_consumptions.types() {
            let mode = self.resource_flow_modes.get(&res).copied().unwrap_or_default();
            let set = find_sources(parts, all_parts, self.part, res, mode);
            if set.is_empty() {
                return None;
            }
            out.insert(res, set);
        }
        Some(out)
    }
}

fn thrust_vector(transforms: &[ThrustTransform], vectored: bool) -> Vector3<f64> {
    if !vectored || transforms.is_empty() {
        return Vector3::z();
    }
    let mut thrust_vec = Vector3::zeros();
    for transform in transforms {
        match transform.forward.try_normalize(f64::EPSILON) {
            Some(direction) => thrust_vec -= direction * transform.multiplier,
            None => warn!("ignoring degenerate thrust transform {:?}", transform.forward),
        }
    }
    thrust_vec
}

/// Split a total mass flow among propellants by volume ratio. Propellants
/// ignored for isp don't count towards the mass flow, but are still
/// consumed and so still need a source.
fn set_consumption_rates(
    propellants: &[Propellant],
    flow_rate: f64,
    library: &ResourceLibrary,
    consumptions: &mut ResourceContainer,
    flow_modes: &mut BTreeMap<ResourceId, FlowMode>,
) {
    let flow_mass: f64 = propellants
        .iter()
        .filter(|x| !x.ignore_for_isp)
        .map(|x| x.ratio * library.density(x.resource))
        .sum();
    let volume_flow_rate = if flow_mass > 0.0 {
        flow_rate / flow_mass
    } else {
        0.0
    };

    for propellant in propellants {
        consumptions.add(propellant.resource, propellant.ratio * volume_flow_rate);
        let mode = match propellant.flow_mode {
            FlowMode::Null => library.flow_mode(propellant.resource),
            mode => mode,
        };
        flow_modes.insert(propellant.resource, mode);
    }
}

/// The parts a consumer on `part` may draw `res` from under `mode`.
pub fn find_sources(
    parts: &Arena<PartSimId, PartSim>,
    all_parts: &[PartSimId],
    part: PartSimId,
    res: ResourceId,
    mode: FlowMode,
) -> BTreeSet<PartSimId> {
    use FlowMode::*;

    match mode {
        NoFlow => {
            let mut set = BTreeSet::new();
            if parts[part].can_supply(res) {
                set.insert(part);
            }
            set
        }
        AllVessel | AllVesselBalance => all_parts
            .iter()
            .copied()
            .filter(|x| parts[*x].can_supply(res))
            .collect(),
        StagePriorityFlow | StagePriorityFlowBalance => {
            let mut set = BTreeSet::new();
            let mut best = i32::MIN;
            for &id in all_parts {
                let candidate = &parts[id];
                if !candidate.can_supply(res) {
                    continue;
                }
                if candidate.inverse_stage > best {
                    best = candidate.inverse_stage;
                    set.clear();
                }
                if candidate.inverse_stage == best {
                    set.insert(id);
                }
            }
            set
        }
        StackPrioritySearch | StageStackFlow | StageStackFlowBalance => source_set(parts, part, res),
        Null => {
            warn!("{res:?} has no flow mode");
            BTreeSet::new()
        }
    }
}

/// Spread `rate` over `sources`, in proportion to what each holds when
/// `balanced`, equally otherwise.
fn apportion(
    parts: &mut Arena<PartSimId, PartSim>,
    res: ResourceId,
    rate: f64,
    balanced: bool,
    sources: &BTreeSet<PartSimId>,
) {
    if balanced {
        let total: f64 = sources.iter().map(|x| parts[*x].drainable(res)).sum();
        if total > 0.0 {
            for &id in sources {
                let share = parts[id].drainable(res) / total;
                parts[id].add_drain(res, rate * share);
            }
            return;
        }
    }
    let share = rate / sources.len() as f64;
    for &id in sources {
        parts[id].add_drain(res, share);
    }
}
