//! Resource types, the resource library and per-part resource containers.
use std::{collections::BTreeMap, sync::Arc};

use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

/// Amounts at or below this are treated as empty.
pub const RESOURCE_MIN: f64 = 0.0001;

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct ResourceId(pub i32);

/// Where a consumer is allowed to draw a resource from.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    FromPrimitive,
    IntoPrimitive,
)]
#[repr(i32)]
pub enum FlowMode {
    NoFlow = 0,
    AllVessel = 1,
    StagePriorityFlow = 2,
    StackPrioritySearch = 3,
    AllVesselBalance = 4,
    StagePriorityFlowBalance = 5,
    StageStackFlow = 6,
    StageStackFlowBalance = 7,
    #[default]
    Null = 8,
}

impl FlowMode {
    /// Does this mode share a drain between sources in proportion to what
    /// each source holds, rather than equally?
    pub fn is_balanced(self) -> bool {
        matches!(
            self,
            Self::AllVesselBalance
                | Self::StagePriorityFlowBalance
                | Self::StageStackFlowBalance
                | Self::StackPrioritySearch
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: Arc<str>,
    /// Density of the resource, in tons per unit.
    pub density: f64,
    /// Cost of one unit of the resource.
    #[serde(default)]
    pub unit_cost: f64,
    /// Default flow mode for consumers that don't override it.
    pub flow_mode: FlowMode,
}

/// Lookup of resource definitions by id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLibrary {
    definitions: BTreeMap<ResourceId, ResourceDefinition>,
}

pub mod stock {
    use super::ResourceId;

    pub const LIQUID_FUEL: ResourceId = ResourceId(1);
    pub const OXIDIZER: ResourceId = ResourceId(2);
    pub const MONOPROPELLANT: ResourceId = ResourceId(3);
    pub const SOLID_FUEL: ResourceId = ResourceId(4);
    pub const XENON_GAS: ResourceId = ResourceId(5);
    pub const INTAKE_AIR: ResourceId = ResourceId(6);
    pub const ELECTRIC_CHARGE: ResourceId = ResourceId(7);
    pub const ORE: ResourceId = ResourceId(8);
}

impl ResourceLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resources every stock vessel can carry.
    pub fn stock() -> Self {
        use FlowMode::*;
        let mut library = Self::new();
        for (id, name, density, unit_cost, flow_mode) in [
            (stock::LIQUID_FUEL, "LiquidFuel", 0.005, 0.8, StackPrioritySearch),
            (stock::OXIDIZER, "Oxidizer", 0.005, 0.18, StackPrioritySearch),
            (stock::MONOPROPELLANT, "MonoPropellant", 0.004, 1.2, StackPrioritySearch),
            (stock::SOLID_FUEL, "SolidFuel", 0.0075, 0.6, NoFlow),
            (stock::XENON_GAS, "XenonGas", 0.0001, 4.0, StagePriorityFlow),
            (stock::INTAKE_AIR, "IntakeAir", 0.005, 0.0, AllVessel),
            (stock::ELECTRIC_CHARGE, "ElectricCharge", 0.0, 0.0, AllVessel),
            (stock::ORE, "Ore", 0.01, 0.02, AllVessel),
        ] {
            library.insert(
                id,
                ResourceDefinition {
                    name: name.into(),
                    density,
                    unit_cost,
                    flow_mode,
                },
            );
        }
        library
    }

    pub fn insert(&mut self, id: ResourceId, definition: ResourceDefinition) {
        self.definitions.insert(id, definition);
    }

    pub fn get(&self, id: ResourceId) -> Option<&ResourceDefinition> {
        self.definitions.get(&id)
    }

    pub fn density(&self, id: ResourceId) -> f64 {
        self.get(id).map_or(0.0, |x| x.density)
    }

    pub fn unit_cost(&self, id: ResourceId) -> f64 {
        self.get(id).map_or(0.0, |x| x.unit_cost)
    }

    pub fn flow_mode(&self, id: ResourceId) -> FlowMode {
        self.get(id).map_or(FlowMode::Null, |x| x.flow_mode)
    }

    pub fn name(&self, id: ResourceId) -> String {
        self.get(id)
            .map_or_else(|| format!("#{}", id.0), |x| x.name.to_string())
    }
}

/// Amount of each resource type held by one part, or consumed per second
/// by one engine. Absent types hold nothing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceContainer {
    resources: BTreeMap<ResourceId, f64>,
}

impl ResourceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ResourceId) -> f64 {
        self.resources.get(&id).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, id: ResourceId, amount: f64) {
        self.resources.insert(id, amount);
    }

    pub fn add(&mut self, id: ResourceId, amount: f64) {
        self.resources
            .entry(id)
            .and_modify(|x| *x += amount)
            .or_insert(amount);
    }

    pub fn has_type(&self, id: ResourceId) -> bool {
        self.resources.contains_key(&id)
    }

    pub fn types(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, f64)> + '_ {
        self.resources.iter().map(|(id, amount)| (*id, *amount))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Mass of everything held, in tons.
    pub fn mass(&self, library: &ResourceLibrary) -> f64 {
        self.iter()
            .map(|(id, amount)| amount * library.density(id))
            .sum()
    }

    pub fn cost(&self, library: &ResourceLibrary) -> f64 {
        self.iter()
            .map(|(id, amount)| amount * library.unit_cost(id))
            .sum()
    }

    /// Does every held type have (effectively) nothing left?
    pub fn empty(&self) -> bool {
        self.resources.values().all(|x| *x <= RESOURCE_MIN)
    }

    /// Like [`Self::empty`], restricted to `types`.
    pub fn empty_of<'a>(&self, types: impl IntoIterator<Item = &'a ResourceId>) -> bool {
        types.into_iter().all(|id| self.get(*id) <= RESOURCE_MIN)
    }

    pub fn reset(&mut self) {
        self.resources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_types_hold_nothing() {
        let container = ResourceContainer::new();
        assert_eq!(container.get(stock::OXIDIZER), 0.0);
        assert!(!container.has_type(stock::OXIDIZER));
        assert!(container.empty());
    }

    #[test]
    fn add_upserts_and_drains() {
        let mut container = ResourceContainer::new();
        container.add(stock::LIQUID_FUEL, 90.0);
        container.add(stock::LIQUID_FUEL, -30.0);
        container.add(stock::OXIDIZER, 110.0);
        assert_eq!(container.get(stock::LIQUID_FUEL), 60.0);
        assert_eq!(
            container.types().collect::<Vec<_>>(),
            [stock::LIQUID_FUEL, stock::OXIDIZER]
        );
    }

    #[test]
    fn mass_uses_library_densities() {
        let library = ResourceLibrary::stock();
        let mut container = ResourceContainer::new();
        container.set(stock::LIQUID_FUEL, 90.0);
        container.set(stock::OXIDIZER, 110.0);
        container.set(stock::ELECTRIC_CHARGE, 50.0);
        assert!((container.mass(&library) - 1.0).abs() < 1e-12);
        assert!((container.cost(&library) - (72.0 + 19.8)).abs() < 1e-9);
    }

    #[test]
    fn emptiness_uses_threshold() {
        let mut container = ResourceContainer::new();
        container.set(stock::LIQUID_FUEL, RESOURCE_MIN / 2.0);
        container.set(stock::OXIDIZER, 5.0);
        assert!(!container.empty());
        assert!(container.empty_of(&[stock::LIQUID_FUEL]));
        assert!(!container.empty_of(&[stock::LIQUID_FUEL, stock::OXIDIZER]));
        assert!(container.empty_of(&[stock::MONOPROPELLANT]));
        container.reset();
        assert!(container.is_empty());
    }

    #[test]
    fn flow_modes_round_trip_through_integers() {
        assert_eq!(FlowMode::from(3), FlowMode::StackPrioritySearch);
        assert_eq!(FlowMode::from(42), FlowMode::Null);
        assert_eq!(i32::from(FlowMode::AllVesselBalance), 4);
        assert!(FlowMode::StackPrioritySearch.is_balanced());
        assert!(!FlowMode::AllVessel.is_balanced());
    }

    #[test]
    fn unset_flow_mode_defers_to_the_resource() {
        assert_eq!(FlowMode::default(), FlowMode::Null);
        assert_eq!(None::<FlowMode>.unwrap_or_default(), FlowMode::Null);
    }
}
