//! Per-run part state and the resource source search over the part graph.
use std::{
    cmp,
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
};

use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    arena::{Arena, IdLike},
    resources::{ResourceContainer, ResourceId, ResourceLibrary, RESOURCE_MIN},
    vessel::{AttachMode, NodeType, Part, PartId, PartModule, VesselDescription},
};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub struct PartSimId(u32);

impl IdLike for PartSimId {
    fn from_raw(index: usize) -> Self {
        Self(index as u32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

impl From<PartId> for PartSimId {
    fn from(value: PartId) -> Self {
        Self(value.0)
    }
}

/// One attach node of a part, pointing at whatever is connected to it.
/// The link is cleared when the connected part leaves the vessel.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachNodeSim {
    pub id: String,
    pub node_type: NodeType,
    pub attached: Option<PartSimId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PartSim {
    pub id: PartSimId,
    pub name: String,
    pub parent: Option<PartSimId>,
    pub parent_attach: AttachMode,
    pub attach_nodes: Vec<AttachNodeSim>,
    /// Parts this part pulls resources from through fuel lines.
    pub fuel_targets: Vec<Option<PartSimId>>,
    /// Surface-attached neighbours resources may flow to and from.
    pub surface_mount_fuel_targets: Vec<Option<PartSimId>>,

    pub resources: ResourceContainer,
    /// Amount of each resource drawn from this part per second.
    pub resource_drains: ResourceContainer,
    /// Resource types whose flow is disabled on this part.
    pub flow_disabled: BTreeSet<ResourceId>,

    /// Dry mass (tons).
    pub base_mass: f64,
    /// Mass added by modules once this part's stage fires.
    pub staged_mass: f64,
    /// Mass added by modules before this part's stage fires.
    pub unstaged_mass: f64,
    /// Wet mass when the simulation started.
    pub start_mass: f64,
    /// Wet cost.
    pub cost: f64,

    pub inverse_stage: i32,
    pub decoupled_in_stage: i32,
    pub fuel_crossfeed: bool,
    pub no_crossfeed_node_key: Option<String>,
    pub resource_priority_offset: i32,
    pub resource_priority_use_parent_inverse_stage: bool,
    pub resource_request_remaining_threshold: f64,

    pub is_engine: bool,
    pub is_fuel_line: bool,
    pub is_sepratron: bool,
    pub is_engine_plate: bool,
    pub is_surface_attachable: bool,
    /// Launch clamps hold the vessel but add nothing to its mass.
    pub is_no_physics: bool,
    pub is_landed: bool,
    pub has_vessel: bool,
}

impl PartSim {
    pub fn new(vessel: &VesselDescription, part_id: PartId, part: &Part, library: &ResourceLibrary) -> Self {
        let mut resources = ResourceContainer::new();
        let mut flow_disabled = BTreeSet::new();
        for resource in &part.resources {
            if resource.amount.is_nan() {
                warn!("{}: dropping resource {} with no amount", part.name, library.name(resource.id));
                continue;
            }
            resources.add(resource.id, resource.amount);
            if !resource.flow_enabled {
                flow_disabled.insert(resource.id);
            }
        }

        let (staged_mass, unstaged_mass) = part
            .modules
            .iter()
            .filter_map(|x| match x {
                PartModule::MassModifier {
                    staged_mass,
                    unstaged_mass,
                } => Some((*staged_mass, *unstaged_mass)),
                _ => None,
            })
            .fold((0.0, 0.0), |(s, u), (ds, du)| (s + ds, u + du));

        let is_engine_plate = part
            .modules
            .iter()
            .any(|x| matches!(x, PartModule::EnginePlate));
        let mut no_crossfeed_node_key = part.no_crossfeed_node_key.clone();
        if is_engine_plate && no_crossfeed_node_key.as_deref().map_or(true, str::is_empty) {
            no_crossfeed_node_key = Some("bottom".to_owned());
        }

        let attach_nodes = part
            .attach_nodes
            .iter()
            .map(|x| AttachNodeSim {
                id: x.id.clone(),
                node_type: x.node_type,
                attached: None,
            })
            .collect();

        Self {
            id: part_id.into(),
            name: part.name.clone(),
            parent: None,
            parent_attach: part.attach_mode,
            attach_nodes,
            fuel_targets: Vec::new(),
            surface_mount_fuel_targets: Vec::new(),
            cost: part.cost + resources.cost(library),
            resources,
            resource_drains: ResourceContainer::new(),
            flow_disabled,
            base_mass: part.mass,
            staged_mass,
            unstaged_mass,
            start_mass: 0.0,
            inverse_stage: part.inverse_stage,
            decoupled_in_stage: decoupled_in_stage(vessel, part_id),
            fuel_crossfeed: part.fuel_crossfeed,
            no_crossfeed_node_key,
            resource_priority_offset: part.resource_priority_offset,
            resource_priority_use_parent_inverse_stage: part
                .resource_priority_use_parent_inverse_stage,
            resource_request_remaining_threshold: part
                .resource_request_remaining_threshold
                .max(0.0),
            is_engine: part.has_engine(),
            is_fuel_line: part
                .modules
                .iter()
                .any(|x| matches!(x, PartModule::FuelLine)),
            is_sepratron: is_sepratron(part),
            is_engine_plate,
            is_surface_attachable: part.surface_attachable,
            is_no_physics: part
                .modules
                .iter()
                .any(|x| matches!(x, PartModule::LaunchClamp)),
            is_landed: vessel.landed,
            has_vessel: vessel.in_flight,
        }
    }

    /// Mass of this part while `current_stage` is burning (tons).
    pub fn mass(&self, current_stage: i32, library: &ResourceLibrary) -> f64 {
        if self.is_no_physics {
            return 0.0;
        }
        let module_mass = if current_stage <= self.inverse_stage {
            self.staged_mass
        } else {
            self.unstaged_mass
        };
        self.base_mass + module_mass + self.resources.mass(library)
    }

    pub fn flow_enabled(&self, res: ResourceId) -> bool {
        !self.flow_disabled.contains(&res)
    }

    /// How much of `res` can still be drawn before this part stops being a
    /// source.
    pub fn drainable(&self, res: ResourceId) -> f64 {
        self.resources.get(res) - self.resource_request_remaining_threshold
    }

    /// Can this part supply `res` right now?
    pub fn can_supply(&self, res: ResourceId) -> bool {
        self.resources.has_type(res) && self.flow_enabled(res) && self.drainable(res) > RESOURCE_MIN
    }

    pub fn resource_priority(&self, parts: &Arena<PartSimId, PartSim>) -> i32 {
        let stage = match self.parent {
            Some(parent) if self.resource_priority_use_parent_inverse_stage => {
                parts[parent].inverse_stage
            }
            _ => self.inverse_stage,
        };
        stage * 10 + self.resource_priority_offset
    }

    /// Time until some drained resource reaches its floor, or `f64::MAX`
    /// when nothing is drained.
    pub fn time_to_drain(&self) -> f64 {
        let mut time = f64::MAX;
        for (res, rate) in self.resource_drains.iter() {
            if rate <= 0.0 {
                continue;
            }
            let dt = self.drainable(res).max(0.0) / rate;
            time = cmp::min(OrderedFloat(time), OrderedFloat(dt)).0;
        }
        time
    }

    pub fn drain(&mut self, dt: f64) {
        for (res, rate) in self.resource_drains.iter() {
            let amount = (self.resources.get(res) - rate * dt).max(0.0);
            self.resources.set(res, amount);
        }
    }

    pub fn add_drain(&mut self, res: ResourceId, rate: f64) {
        self.resource_drains.add(res, rate);
    }

    /// Forget every link to a part in `removed`.
    pub fn remove_attached_parts(&mut self, removed: &BTreeSet<PartSimId>) {
        let gone = |x: &Option<PartSimId>| x.is_some_and(|x| removed.contains(&x));
        if gone(&self.parent) {
            self.parent = None;
        }
        for node in &mut self.attach_nodes {
            if gone(&node.attached) {
                node.attached = None;
            }
        }
        for target in self
            .fuel_targets
            .iter_mut()
            .chain(self.surface_mount_fuel_targets.iter_mut())
        {
            if gone(target) {
                *target = None;
            }
        }
    }

    /// Does the attach node `id` refuse to pass resources?
    fn blocks_crossfeed(&self, node_id: &str) -> bool {
        self.no_crossfeed_node_key
            .as_deref()
            .is_some_and(|key| !key.is_empty() && node_id.contains(key))
    }
}

/// A sepratron fires even when detached and can't be throttled. It is never
/// waited on before staging.
fn is_sepratron(part: &Part) -> bool {
    part.activates_even_if_disconnected
        && part.engines().next().is_some_and(|x| x.throttle_locked)
}

/// The stage in which `part_id` leaves the vessel, or -1 if it never does.
///
/// Walks up the parent chain; any decoupling module on the way that fires
/// before the stage found so far, and separates the part from everything
/// above it, moves the part into that stage.
pub fn decoupled_in_stage(vessel: &VesselDescription, part_id: PartId) -> i32 {
    let mut stage = -1;
    let mut chain: Vec<PartId> = Vec::new();
    let mut current = Some(part_id);

    while let Some(id) = current {
        let Some(part) = vessel.part(id) else {
            warn!("parent chain references missing part {id:?}");
            break;
        };
        if chain.contains(&id) {
            warn!("parent chain loops back on itself at {id:?}");
            break;
        }
        chain.push(id);

        if part.inverse_stage > stage {
            for module in &part.modules {
                let separates = match module {
                    PartModule::Decoupler {
                        explosive_node,
                        omni,
                    } => *omni || separates_chain(part, explosive_node.as_deref(), &chain),
                    PartModule::AnchoredDecoupler { explosive_node } => {
                        separates_chain(part, explosive_node.as_deref(), &chain)
                    }
                    PartModule::DockingNode { staging_enabled } => *staging_enabled && id != part_id,
                    PartModule::LaunchClamp => true,
                    _ => false,
                };
                if separates {
                    stage = part.inverse_stage;
                    break;
                }
            }
        }

        current = part.parent;
    }

    stage
}

/// Does a decoupler on `part` firing through `explosive_node` cut the
/// chain walked so far off from the rest of the vessel?
/// `"srf"` names the part's surface attachment, as on radial decouplers.
fn separates_chain(part: &Part, explosive_node: Option<&str>, chain: &[PartId]) -> bool {
    let node = match explosive_node {
        Some("srf") => part
            .attach_nodes
            .iter()
            .find(|x| x.node_type == NodeType::Surface),
        Some(id) => part.find_attach_node(id),
        None => None,
    };
    let Some(attached) = node.and_then(|x| x.attached_part) else {
        return false;
    };
    Some(attached) == part.parent || chain.contains(&attached)
}

/// Link `id` to its parent, making surface attachments mutual fuel targets
/// when both sides crossfeed.
pub fn setup_parent(parts: &mut Arena<PartSimId, PartSim>, id: PartSimId, parent: Option<PartId>) {
    let Some(parent) = parent else {
        return;
    };
    let parent = PartSimId::from(parent);
    if !parts.contains(parent) || parent == id {
        warn!("{}: parent lookup failed for {parent:?}", parts[id].name);
        return;
    }
    parts[id].parent = Some(parent);

    let part = &parts[id];
    if part.parent_attach == AttachMode::Surface
        && part.is_surface_attachable
        && part.fuel_crossfeed
        && parts[parent].fuel_crossfeed
    {
        parts[id].surface_mount_fuel_targets.push(Some(parent));
        parts[parent].surface_mount_fuel_targets.push(Some(id));
    }
}

/// Resolve attach node links and fuel line targets from the host's part
/// references. Unknown references are logged and skipped.
pub fn setup_attach_nodes(parts: &mut Arena<PartSimId, PartSim>, id: PartSimId, part: &Part, log_output: bool) {
    let len = parts.len();
    let resolve = |x: PartId| {
        let sim_id = PartSimId::from(x);
        (sim_id.into_raw() < len).then_some(sim_id)
    };

    for (i, node) in part.attach_nodes.iter().enumerate() {
        if node.id == "Strut" {
            continue;
        }
        let Some(attached) = node.attached_part else {
            continue;
        };
        match resolve(attached) {
            Some(attached) => parts[id].attach_nodes[i].attached = Some(attached),
            None => warn!("{}: attach node {} lookup failed for {attached:?}", part.name, node.id),
        }
    }

    for target in &part.fuel_lookup_targets {
        match resolve(*target) {
            Some(target) if parts[id].fuel_targets.contains(&Some(target)) => {
                warn!("{}: duplicate fuel target {target:?}", part.name);
            }
            Some(target) => {
                if log_output {
                    debug!("{}: adding fuel target {target:?}", part.name);
                }
                parts[id].fuel_targets.push(Some(target));
            }
            None => warn!("{}: fuel target lookup failed for {target:?}", part.name),
        }
    }
}

/// The parts an engine on `start` draws `res` from under stack priority
/// search: every part reachable through fuel lines and crossfeeding stack
/// nodes that holds `res`, keeping only those with the highest resource
/// priority.
pub fn source_set(
    parts: &Arena<PartSimId, PartSim>,
    start: PartSimId,
    res: ResourceId,
) -> BTreeSet<PartSimId> {
    let mut search = SourceSearch {
        parts,
        res,
        visited: vec![false; parts.len()],
        sources: BTreeSet::new(),
        priority: i32::MIN,
    };
    search.visit(start);
    trace!("source set for {res:?} from {start:?}: {:?}", search.sources);
    search.sources
}

struct SourceSearch<'a> {
    parts: &'a Arena<PartSimId, PartSim>,
    res: ResourceId,
    visited: Vec<bool>,
    sources: BTreeSet<PartSimId>,
    priority: i32,
}

impl SourceSearch<'_> {
    fn visit(&mut self, id: PartSimId) {
        if self.visited[id.into_raw()] {
            return;
        }
        self.visited[id.into_raw()] = true;
        let parts = self.parts;
        let part = &parts[id];

        for target in part.fuel_targets.iter().flatten() {
            self.visit(*target);
        }

        if part.fuel_crossfeed {
            for target in part.surface_mount_fuel_targets.iter().flatten() {
                self.visit(*target);
            }

            for node in &part.attach_nodes {
                let Some(attached) = node.attached else {
                    continue;
                };
                if node.node_type != NodeType::Stack || part.blocks_crossfeed(&node.id) {
                    continue;
                }
                if self.neighbour_blocks(id, attached) {
                    continue;
                }
                self.visit(attached);
            }
        }

        if part.can_supply(self.res) {
            let priority = part.resource_priority(self.parts);
            match priority.cmp(&self.priority) {
                cmp::Ordering::Greater => {
                    self.sources.clear();
                    self.sources.insert(id);
                    self.priority = priority;
                }
                cmp::Ordering::Equal => {
                    self.sources.insert(id);
                }
                cmp::Ordering::Less => {}
            }
        }
    }

    /// Does `neighbour` refuse flow across the node that links it back to
    /// `from` (an engine plate's bottom node)?
    fn neighbour_blocks(&self, from: PartSimId, neighbour: PartSimId) -> bool {
        let neighbour = &self.parts[neighbour];
        neighbour
            .attach_nodes
            .iter()
            .filter(|x| x.attached == Some(from))
            .any(|x| neighbour.blocks_crossfeed(&x.id))
    }
}

/// Render the live part tree for debugging.
pub fn dump_part_tree(
    parts: &Arena<PartSimId, PartSim>,
    live: &[PartSimId],
    current_stage: i32,
    library: &ResourceLibrary,
) -> String {
    let mut children: BTreeMap<Option<PartSimId>, Vec<PartSimId>> = BTreeMap::new();
    for &id in live {
        children.entry(parts[id].parent).or_default().push(id);
    }

    let mut out = String::new();
    let mut stack: Vec<(PartSimId, usize)> = children
        .get(&None)
        .map(|x| x.iter().rev().map(|id| (*id, 0)).collect())
        .unwrap_or_default();
    while let Some((id, depth)) = stack.pop() {
        let part = &parts[id];
        let _ = write!(
            out,
            "{:indent$}{} [{}] inv={} dec={} mass={:.3}",
            "",
            part.name,
            id.into_raw(),
            part.inverse_stage,
            part.decoupled_in_stage,
            part.mass(current_stage, library),
            indent = depth * 2,
        );
        if !part.resources.is_empty() {
            let resources = part
                .resources
                .iter()
                .map(|(res, amount)| format!("{}={amount:.2}", library.name(res)))
                .join(" ");
            let _ = write!(out, " {resources}");
        }
        for node in &part.attach_nodes {
            if let Some(attached) = node.attached {
                let _ = write!(out, " {}->{}", node.id, attached.into_raw());
            }
        }
        for target in part.fuel_targets.iter().flatten() {
            let _ = write!(out, " fuel->{}", target.into_raw());
        }
        out.push('\n');
        if let Some(kids) = children.get(&Some(id)) {
            stack.extend(kids.iter().rev().map(|x| (*x, depth + 1)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resources::stock,
        vessel::{AttachNode, EngineModule},
    };

    fn decoupler() -> PartModule {
        PartModule::Decoupler {
            explosive_node: Some("top".to_owned()),
            omni: false,
        }
    }

    fn build(vessel: &VesselDescription) -> Arena<PartSimId, PartSim> {
        let library = ResourceLibrary::stock();
        let mut parts: Arena<PartSimId, PartSim> = vessel
            .parts
            .iter()
            .enumerate()
            .map(|(i, x)| PartSim::new(vessel, PartId::from_raw(i), x, &library))
            .collect();
        for (i, part) in vessel.parts.iter().enumerate() {
            let id = PartSimId::from_raw(i);
            setup_parent(&mut parts, id, part.parent);
            setup_attach_nodes(&mut parts, id, part, false);
        }
        parts
    }

    #[test]
    fn nan_amounts_are_dropped() {
        let mut vessel = VesselDescription::new("test");
        let tank = vessel.add_part(
            Part::new("tank", 0.25)
                .with_resource(stock::LIQUID_FUEL, f64::NAN)
                .with_resource(stock::OXIDIZER, 110.0),
        );
        let parts = build(&vessel);
        let tank = &parts[PartSimId::from(tank)];
        assert!(!tank.resources.has_type(stock::LIQUID_FUEL));
        assert_eq!(tank.resources.get(stock::OXIDIZER), 110.0);
        assert!(tank.cost.is_finite());
    }

    #[test]
    fn root_never_decouples() {
        let mut vessel = VesselDescription::new("test");
        let root = vessel.add_part(Part::new("pod", 1.0).with_stage(3).with_module(decoupler()));
        assert_eq!(decoupled_in_stage(&vessel, root), -1);
    }

    #[test]
    fn decoupler_separates_everything_below() {
        let mut vessel = VesselDescription::new("test");
        let pod = vessel.add_part(Part::new("pod", 1.0));
        let dec = vessel.add_part(Part::new("decoupler", 0.05).with_stage(1).with_module(decoupler()));
        let tank = vessel.add_part(Part::new("tank", 0.5));
        vessel.stack(pod, dec);
        vessel.stack(dec, tank);

        assert_eq!(decoupled_in_stage(&vessel, pod), -1);
        assert_eq!(decoupled_in_stage(&vessel, dec), 1);
        assert_eq!(decoupled_in_stage(&vessel, tank), 1);
    }

    #[test]
    fn upside_down_decoupler_keeps_parts_below() {
        let mut vessel = VesselDescription::new("test");
        let pod = vessel.add_part(Part::new("pod", 1.0));
        let dec = vessel.add_part(Part::new("decoupler", 0.05).with_stage(1).with_module(
            PartModule::Decoupler {
                explosive_node: Some("bottom".to_owned()),
                omni: false,
            },
        ));
        let tank = vessel.add_part(Part::new("tank", 0.5));
        vessel.stack(pod, dec);
        vessel.stack(dec, tank);

        // The bottom node holds the tank, which is in the chain walked from
        // the tank, so the tank goes.
        assert_eq!(decoupled_in_stage(&vessel, tank), 1);
        // From the decoupler itself the bottom node points away from the
        // parent, so the decoupler stays with the pod.
        assert_eq!(decoupled_in_stage(&vessel, dec), -1);
    }

    #[test]
    fn empty_explosive_node_never_separates() {
        let mut vessel = VesselDescription::new("test");
        let pod = vessel.add_part(Part::new("pod", 1.0));
        let dec = vessel.add_part(Part::new("decoupler", 0.05).with_stage(1).with_module(decoupler()));
        // Hung from its bottom node, so the explosive top node holds nothing.
        let part = vessel.part_mut(dec).unwrap();
        part.parent = Some(pod);
        part.attach_nodes
            .push(AttachNode::new("bottom", NodeType::Stack, Some(pod)));
        part.attach_nodes
            .push(AttachNode::new("top", NodeType::Stack, None));

        assert_eq!(decoupled_in_stage(&vessel, dec), -1);

        let mut missing = VesselDescription::new("test");
        let pod = missing.add_part(Part::new("pod", 1.0));
        let dec = missing.add_part(
            Part::new("decoupler", 0.05)
                .with_stage(1)
                .with_module(PartModule::Decoupler {
                    explosive_node: Some("nowhere".to_owned()),
                    omni: false,
                }),
        );
        missing.stack(pod, dec);
        assert_eq!(decoupled_in_stage(&missing, dec), -1);
    }

    #[test]
    fn radial_decoupler_fires_through_its_surface_node() {
        let mut vessel = VesselDescription::new("test");
        let core = vessel.add_part(Part::new("core", 1.0));
        let dec = vessel.add_part(Part::new("radial decoupler", 0.03).with_stage(2).with_module(
            PartModule::Decoupler {
                explosive_node: Some("srf".to_owned()),
                omni: false,
            },
        ));
        let booster = vessel.add_part(Part::new("booster", 0.5));
        vessel.surface(core, dec);
        vessel.surface(dec, booster);

        assert_eq!(decoupled_in_stage(&vessel, dec), 2);
        assert_eq!(decoupled_in_stage(&vessel, booster), 2);
        assert_eq!(decoupled_in_stage(&vessel, core), -1);
    }

    #[test]
    fn earliest_decoupler_wins() {
        let mut vessel = VesselDescription::new("test");
        let pod = vessel.add_part(Part::new("pod", 1.0));
        let upper = vessel.add_part(Part::new("upper", 0.05).with_stage(1).with_module(decoupler()));
        let lower = vessel.add_part(Part::new("lower", 0.05).with_stage(3).with_module(decoupler()));
        let tank = vessel.add_part(Part::new("tank", 0.5));
        vessel.stack(pod, upper);
        vessel.stack(upper, lower);
        vessel.stack(lower, tank);

        assert_eq!(decoupled_in_stage(&vessel, tank), 3);
        assert_eq!(decoupled_in_stage(&vessel, lower), 3);
        assert_eq!(decoupled_in_stage(&vessel, upper), 1);
    }

    #[test]
    fn clamps_leave_in_their_own_stage() {
        let mut vessel = VesselDescription::new("test");
        let pod = vessel.add_part(Part::new("pod", 1.0));
        let clamp = vessel.add_part(Part::new("clamp", 0.1).with_stage(2).with_module(PartModule::LaunchClamp));
        vessel.surface(pod, clamp);
        assert_eq!(decoupled_in_stage(&vessel, clamp), 2);
    }

    #[test]
    fn source_search_stops_at_non_crossfeed_parts() {
        let mut vessel = VesselDescription::new("test");
        let upper = vessel.add_part(Part::new("upper tank", 0.5).with_resource(stock::LIQUID_FUEL, 100.0));
        let dec = vessel.add_part(
            Part::new("decoupler", 0.05)
                .with_stage(1)
                .with_crossfeed(false)
                .with_module(decoupler()),
        );
        let lower = vessel.add_part(Part::new("lower tank", 0.5).with_resource(stock::LIQUID_FUEL, 100.0));
        let engine = vessel.add_part(
            Part::new("engine", 1.0)
                .with_stage(1)
                .with_module(PartModule::Engine(EngineModule::liquid(100.0, 300.0, 250.0))),
        );
        vessel.stack(upper, dec);
        vessel.stack(dec, lower);
        vessel.stack(lower, engine);

        let parts = build(&vessel);
        let sources = source_set(&parts, engine.into(), stock::LIQUID_FUEL);
        assert_eq!(sources, BTreeSet::from([PartSimId::from(lower)]));
    }

    #[test]
    fn higher_priority_sources_shadow_lower_ones() {
        let mut vessel = VesselDescription::new("test");
        let upper = vessel.add_part(Part::new("upper", 0.5).with_resource(stock::LIQUID_FUEL, 100.0));
        let lower = vessel.add_part(
            Part::new("lower", 0.5)
                .with_stage(2)
                .with_resource(stock::LIQUID_FUEL, 100.0),
        );
        let engine = vessel.add_part(Part::new("engine", 1.0));
        vessel.stack(upper, lower);
        vessel.stack(lower, engine);

        let mut parts = build(&vessel);
        assert_eq!(
            source_set(&parts, engine.into(), stock::LIQUID_FUEL),
            BTreeSet::from([PartSimId::from(lower)])
        );

        parts[PartSimId::from(upper)].resource_priority_offset = 21;
        assert_eq!(
            source_set(&parts, engine.into(), stock::LIQUID_FUEL),
            BTreeSet::from([PartSimId::from(upper)])
        );
    }

    #[test]
    fn equal_priority_sources_are_merged() {
        let mut vessel = VesselDescription::new("test");
        let upper = vessel.add_part(Part::new("upper", 0.5).with_resource(stock::LIQUID_FUEL, 100.0));
        let lower = vessel.add_part(Part::new("lower", 0.5).with_resource(stock::LIQUID_FUEL, 10.0));
        let engine = vessel.add_part(Part::new("engine", 1.0));
        vessel.stack(upper, lower);
        vessel.stack(lower, engine);

        let parts = build(&vessel);
        assert_eq!(
            source_set(&parts, engine.into(), stock::LIQUID_FUEL),
            BTreeSet::from([PartSimId::from(upper), PartSimId::from(lower)])
        );
    }

    #[test]
    fn fuel_lines_reach_across_non_crossfeed_parts() {
        let mut vessel = VesselDescription::new("test");
        let core = vessel.add_part(Part::new("core", 0.5).with_crossfeed(false));
        let booster = vessel.add_part(Part::new("booster", 0.5).with_resource(stock::LIQUID_FUEL, 100.0));
        vessel.surface(core, booster);
        vessel.parts[0].fuel_lookup_targets.push(booster);
        vessel.parts[0].fuel_lookup_targets.push(booster);

        let parts = build(&vessel);
        assert_eq!(parts[PartSimId::from(core)].fuel_targets.len(), 1);
        // No surface link: the core doesn't crossfeed.
        assert!(parts[PartSimId::from(booster)].surface_mount_fuel_targets.is_empty());
        assert_eq!(
            source_set(&parts, core.into(), stock::LIQUID_FUEL),
            BTreeSet::from([PartSimId::from(booster)])
        );
    }

    #[test]
    fn surface_attached_tanks_feed_both_ways() {
        let mut vessel = VesselDescription::new("test");
        let core = vessel.add_part(Part::new("core", 0.5));
        let side = vessel.add_part(Part::new("side", 0.5).with_resource(stock::LIQUID_FUEL, 50.0));
        vessel.surface(core, side);

        let parts = build(&vessel);
        assert_eq!(
            source_set(&parts, core.into(), stock::LIQUID_FUEL),
            BTreeSet::from([PartSimId::from(side)])
        );
    }

    #[test]
    fn engine_plate_bottom_node_blocks_flow() {
        let mut vessel = VesselDescription::new("test");
        let tank = vessel.add_part(Part::new("tank", 0.5).with_resource(stock::LIQUID_FUEL, 100.0));
        let plate = vessel.add_part(Part::new("plate", 0.2).with_module(PartModule::EnginePlate));
        let below = vessel.add_part(Part::new("below", 1.0));
        vessel.stack(tank, plate);
        vessel.stack(plate, below);

        let parts = build(&vessel);
        assert!(source_set(&parts, below.into(), stock::LIQUID_FUEL).is_empty());
        assert_eq!(
            source_set(&parts, plate.into(), stock::LIQUID_FUEL),
            BTreeSet::from([PartSimId::from(tank)])
        );
    }

    #[test]
    fn struts_and_dangling_references_are_ignored() {
        let mut vessel = VesselDescription::new("test");
        let tank = vessel.add_part(Part::new("tank", 0.5).with_resource(stock::LIQUID_FUEL, 100.0));
        let engine = vessel.add_part(Part::new("engine", 1.0));
        vessel.parts[1]
            .attach_nodes
            .push(AttachNode::new("Strut", NodeType::Stack, Some(tank)));
        vessel.parts[1]
            .attach_nodes
            .push(AttachNode::new("top", NodeType::Stack, Some(PartId(42))));

        let parts = build(&vessel);
        assert!(parts[PartSimId::from(engine)]
            .attach_nodes
            .iter()
            .all(|x| x.attached.is_none()));
        assert!(source_set(&parts, engine.into(), stock::LIQUID_FUEL).is_empty());
    }

    #[test]
    fn remaining_threshold_limits_supply() {
        let mut vessel = VesselDescription::new("test");
        let mut tank = Part::new("tank", 0.5).with_resource(stock::LIQUID_FUEL, 10.0);
        tank.resource_request_remaining_threshold = 10.0;
        vessel.add_part(tank);

        let parts = build(&vessel);
        let tank = &parts[PartSimId::from_raw(0)];
        assert!(!tank.can_supply(stock::LIQUID_FUEL));
        assert_eq!(tank.drainable(stock::LIQUID_FUEL), 0.0);
    }

    #[test]
    fn staged_modules_change_mass() {
        let mut vessel = VesselDescription::new("test");
        vessel.add_part(
            Part::new("fairing base", 0.2)
                .with_stage(2)
                .with_module(PartModule::MassModifier {
                    staged_mass: 0.0,
                    unstaged_mass: 0.8,
                }),
        );
        let parts = build(&vessel);
        let library = ResourceLibrary::stock();
        let part = &parts[PartSimId::from_raw(0)];
        assert!((part.mass(3, &library) - 1.0).abs() < 1e-12);
        assert!((part.mass(2, &library) - 0.2).abs() < 1e-12);
    }
}
