//! The vessel as the host describes it: parts, their resources, modules
//! and attachment graph. This is the input to
//! [`Simulation::prepare`](crate::simulation::Simulation::prepare); the
//! simulation never holds on to it.
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{
    arena::IdLike,
    curve::FloatCurve,
    engine::G0,
    resources::{stock, FlowMode, ResourceId},
};

/// Index of a part in [`VesselDescription::parts`].
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PartId(pub u32);

impl IdLike for PartId {
    fn from_raw(index: usize) -> Self {
        Self(index as u32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VesselDescription {
    pub name: String,
    pub parts: Vec<Part>,
    /// Highest stage number reported by the host's staging list.
    #[serde(default = "no_stage")]
    pub last_stage: i32,
    /// Is this a live vessel, as opposed to a design in the editor?
    #[serde(default)]
    pub in_flight: bool,
    #[serde(default)]
    pub landed: bool,
}

fn no_stage() -> i32 {
    -1
}

impl Default for VesselDescription {
    fn default() -> Self {
        Self {
            name: String::new(),
            parts: Vec::new(),
            last_stage: no_stage(),
            in_flight: false,
            landed: false,
        }
    }
}

impl VesselDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_part(&mut self, part: Part) -> PartId {
        let id = PartId::from_raw(self.parts.len());
        self.parts.push(part);
        id
    }

    pub fn part(&self, id: PartId) -> Option<&Part> {
        self.parts.get(id.into_raw())
    }

    pub fn part_mut(&mut self, id: PartId) -> Option<&mut Part> {
        self.parts.get_mut(id.into_raw())
    }

    /// Stack `child` under `parent`: the parent's `bottom` node holds the
    /// child and the child's `top` node holds the parent.
    pub fn stack(&mut self, parent: PartId, child: PartId) {
        if let Some(part) = self.part_mut(parent) {
            part.attach_nodes
                .push(AttachNode::new("bottom", NodeType::Stack, Some(child)));
        }
        if let Some(part) = self.part_mut(child) {
            part.parent = Some(parent);
            part.attach_mode = AttachMode::Stack;
            part.attach_nodes
                .push(AttachNode::new("top", NodeType::Stack, Some(parent)));
        }
    }

    /// Surface-attach `child` to `parent`.
    pub fn surface(&mut self, parent: PartId, child: PartId) {
        if let Some(part) = self.part_mut(child) {
            part.parent = Some(parent);
            part.attach_mode = AttachMode::Surface;
            part.attach_nodes
                .push(AttachNode::new("srfAttach", NodeType::Surface, Some(parent)));
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachMode {
    #[default]
    Stack,
    Surface,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Stack,
    Surface,
    Dock,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachNode {
    pub id: String,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub attached_part: Option<PartId>,
}

impl AttachNode {
    pub fn new(id: impl Into<String>, node_type: NodeType, attached_part: Option<PartId>) -> Self {
        Self {
            id: id.into(),
            node_type,
            attached_part,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartResource {
    pub id: ResourceId,
    pub amount: f64,
    #[serde(default)]
    pub max_amount: f64,
    #[serde(default = "yes")]
    pub flow_enabled: bool,
}

fn yes() -> bool {
    true
}

fn one() -> f64 {
    1.0
}

fn hundred() -> f64 {
    100.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    #[serde(default)]
    pub parent: Option<PartId>,
    /// How this part is attached to its parent.
    #[serde(default)]
    pub attach_mode: AttachMode,
    /// Does this part's attach rules allow surface attachment?
    #[serde(default = "yes")]
    pub surface_attachable: bool,
    /// Dry mass (tons).
    pub mass: f64,
    /// Dry cost.
    #[serde(default)]
    pub cost: f64,
    /// The stage in which this part is activated.
    #[serde(default)]
    pub inverse_stage: i32,
    #[serde(default = "yes")]
    pub fuel_crossfeed: bool,
    /// Attach nodes whose id contains this key never pass resources.
    #[serde(default)]
    pub no_crossfeed_node_key: Option<String>,
    #[serde(default)]
    pub activates_even_if_disconnected: bool,
    #[serde(default)]
    pub resource_priority_offset: i32,
    #[serde(default)]
    pub resource_priority_use_parent_inverse_stage: bool,
    /// Resources are only drawn from this part down to this amount.
    #[serde(default)]
    pub resource_request_remaining_threshold: f64,
    #[serde(default)]
    pub resources: Vec<PartResource>,
    #[serde(default)]
    pub attach_nodes: Vec<AttachNode>,
    /// Parts this part pulls resources from through fuel lines.
    #[serde(default)]
    pub fuel_lookup_targets: Vec<PartId>,
    #[serde(default)]
    pub modules: Vec<PartModule>,
}

impl Part {
    pub fn new(name: impl Into<String>, mass: f64) -> Self {
        Self {
            name: name.into(),
            parent: None,
            attach_mode: AttachMode::Stack,
            surface_attachable: true,
            mass,
            cost: 0.0,
            inverse_stage: 0,
            fuel_crossfeed: true,
            no_crossfeed_node_key: None,
            activates_even_if_disconnected: false,
            resource_priority_offset: 0,
            resource_priority_use_parent_inverse_stage: false,
            resource_request_remaining_threshold: 0.0,
            resources: Vec::new(),
            attach_nodes: Vec::new(),
            fuel_lookup_targets: Vec::new(),
            modules: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_stage(mut self, inverse_stage: i32) -> Self {
        self.inverse_stage = inverse_stage;
        self
    }

    #[must_use]
    pub fn with_crossfeed(mut self, fuel_crossfeed: bool) -> Self {
        self.fuel_crossfeed = fuel_crossfeed;
        self
    }

    #[must_use]
    pub fn with_resource(mut self, id: ResourceId, amount: f64) -> Self {
        self.resources.push(PartResource {
            id,
            amount,
            max_amount: amount,
            flow_enabled: true,
        });
        self
    }

    #[must_use]
    pub fn with_module(mut self, module: PartModule) -> Self {
        self.modules.push(module);
        self
    }

    pub fn find_attach_node(&self, id: &str) -> Option<&AttachNode> {
        self.attach_nodes.iter().find(|x| x.id == id)
    }

    pub fn has_engine(&self) -> bool {
        self.modules.iter().any(|x| {
            matches!(
                x,
                PartModule::Engine(_) | PartModule::MultiModeEngine { .. }
            )
        })
    }

    /// The engine modules that currently produce thrust. Multi-mode
    /// engines only contribute their selected mode.
    pub fn engines(&self) -> impl Iterator<Item = &EngineModule> {
        self.modules.iter().filter_map(|x| match x {
            PartModule::Engine(engine) => Some(engine),
            PartModule::MultiModeEngine {
                primary,
                secondary,
                running_primary,
            } => Some(if *running_primary { primary } else { secondary }),
            _ => None,
        })
    }

    pub fn rcs(&self) -> impl Iterator<Item = &RcsModule> {
        self.modules.iter().filter_map(|x| match x {
            PartModule::Rcs(rcs) => Some(rcs),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PartModule {
    Engine(EngineModule),
    MultiModeEngine {
        primary: EngineModule,
        secondary: EngineModule,
        running_primary: bool,
    },
    Rcs(RcsModule),
    /// Stack or radial decoupler. An omni decoupler separates on all of
    /// its nodes regardless of which one is explosive.
    Decoupler {
        explosive_node: Option<String>,
        #[serde(default)]
        omni: bool,
    },
    AnchoredDecoupler {
        explosive_node: Option<String>,
    },
    DockingNode {
        #[serde(default)]
        staging_enabled: bool,
    },
    LaunchClamp,
    FuelLine,
    /// Engine plates never pass resources through their bottom node.
    EnginePlate,
    /// Mass a module adds before and after the part's stage fires, such as
    /// a fairing that is shed when staged.
    MassModifier {
        staged_mass: f64,
        unstaged_mass: f64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Propellant {
    pub resource: ResourceId,
    /// Volumetric ratio of this propellant in the mixture.
    pub ratio: f64,
    /// Required to run, but not counted in the isp mass flow (intake air,
    /// electric charge).
    #[serde(default)]
    pub ignore_for_isp: bool,
    /// Overrides the resource's default flow mode unless `Null`.
    #[serde(default)]
    pub flow_mode: FlowMode,
}

impl Propellant {
    pub fn new(resource: ResourceId, ratio: f64) -> Self {
        Self {
            resource,
            ratio,
            ignore_for_isp: false,
            flow_mode: FlowMode::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrustTransform {
    /// Exhaust direction of this nozzle, in the vessel frame.
    pub forward: Vector3<f64>,
    #[serde(default = "one")]
    pub multiplier: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineModule {
    /// Fuel flow at zero throttle (tons/s).
    #[serde(default)]
    pub min_fuel_flow: f64,
    /// Fuel flow at full throttle (tons/s).
    pub max_fuel_flow: f64,
    /// Thrust limiter, 0-100.
    #[serde(default = "hundred")]
    pub thrust_percentage: f64,
    /// Live throttle setting, 0-1.
    #[serde(default)]
    pub current_throttle: f64,
    #[serde(default)]
    pub throttle_locked: bool,
    /// Isp (s) against atmospheric pressure (atm).
    pub atmosphere_curve: FloatCurve,
    #[serde(default)]
    pub atm_change_flow: bool,
    /// Flow multiplier against density relative to sea level.
    #[serde(default)]
    pub atm_curve: Option<FloatCurve>,
    /// Flow multiplier against Mach number.
    #[serde(default)]
    pub vel_curve: Option<FloatCurve>,
    /// Flow multiplier against the fraction of fuel remaining.
    #[serde(default)]
    pub thrust_curve: Option<FloatCurve>,
    #[serde(default = "one")]
    pub thrust_curve_ratio: f64,
    pub propellants: Vec<Propellant>,
    #[serde(default)]
    pub thrust_transforms: Vec<ThrustTransform>,
    /// Is the engine ignited in the live vessel?
    #[serde(default)]
    pub is_operational: bool,
    #[serde(default)]
    pub flameout: bool,
}

impl EngineModule {
    /// A liquid-fuel/oxidizer engine with the given vacuum thrust (kN) and
    /// isp at vacuum and at sea level.
    pub fn liquid(thrust: f64, isp_vac: f64, isp_asl: f64) -> Self {
        Self::new(
            thrust / (isp_vac * G0),
            [(0.0, isp_vac), (1.0, isp_asl)].into_iter().collect(),
            vec![
                Propellant::new(stock::LIQUID_FUEL, 0.9),
                Propellant::new(stock::OXIDIZER, 1.1),
            ],
        )
    }

    /// A solid rocket with a locked throttle.
    pub fn solid(thrust: f64, isp_vac: f64, isp_asl: f64) -> Self {
        let mut engine = Self::new(
            thrust / (isp_vac * G0),
            [(0.0, isp_vac), (1.0, isp_asl)].into_iter().collect(),
            vec![Propellant::new(stock::SOLID_FUEL, 1.0)],
        );
        engine.throttle_locked = true;
        engine
    }

    pub fn new(max_fuel_flow: f64, atmosphere_curve: FloatCurve, propellants: Vec<Propellant>) -> Self {
        Self {
            min_fuel_flow: 0.0,
            max_fuel_flow,
            thrust_percentage: 100.0,
            current_throttle: 0.0,
            throttle_locked: false,
            atmosphere_curve,
            atm_change_flow: false,
            atm_curve: None,
            vel_curve: None,
            thrust_curve: None,
            thrust_curve_ratio: 1.0,
            propellants,
            thrust_transforms: Vec::new(),
            is_operational: false,
            flameout: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RcsModule {
    /// Thrust of one nozzle (kN).
    pub thruster_power: f64,
    #[serde(default = "hundred")]
    pub thrust_percentage: f64,
    pub atmosphere_curve: FloatCurve,
    pub propellants: Vec<Propellant>,
    #[serde(default)]
    pub thrust_transforms: Vec<ThrustTransform>,
}

impl RcsModule {
    /// A monopropellant block with `nozzles` nozzles.
    pub fn monoprop(thruster_power: f64, isp_vac: f64, isp_asl: f64, nozzles: usize) -> Self {
        Self {
            thruster_power,
            thrust_percentage: 100.0,
            atmosphere_curve: [(0.0, isp_vac), (1.0, isp_asl)].into_iter().collect(),
            propellants: vec![Propellant::new(stock::MONOPROPELLANT, 1.0)],
            thrust_transforms: (0..nozzles)
                .map(|_| ThrustTransform {
                    forward: Vector3::z(),
                    multiplier: 1.0,
                })
                .collect(),
        }
    }
}
