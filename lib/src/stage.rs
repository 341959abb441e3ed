//! Per-stage results.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Burn times longer than this are reported as zero.
pub const MAX_REPORTED_TIME: f64 = 86400.0;

/// Everything the simulation knows about one stage. Stages are indexed by
/// their stage number; the highest index burns first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage number, or -1 for the synthetic stage of engines already
    /// burning ahead of the staging list.
    pub number: i32,

    /// Cost of the parts dropped at the end of this stage.
    pub cost: f64,
    pub total_cost: f64,
    /// Mass of the parts dropped at the end of this stage (tons).
    pub mass: f64,
    pub total_mass: f64,
    /// Vessel mass when this stage starts and ends burning (tons).
    pub start_mass: f64,
    pub end_mass: f64,
    /// Propellant mass burned during this stage (tons).
    pub resource_mass: f64,

    /// (m/s)
    pub delta_v: f64,
    /// Delta-v of this stage and every stage after it.
    pub total_delta_v: f64,
    /// Delta-v of this stage and every stage before it.
    pub inverse_total_delta_v: f64,

    /// Effective isp over the stage's burn (s).
    pub isp: f64,
    /// Total thrust at the start of the stage (kN).
    pub thrust: f64,
    pub actual_thrust: f64,
    pub thrust_to_weight: f64,
    pub actual_thrust_to_weight: f64,
    pub max_thrust_to_weight: f64,
    /// Highest Mach number any active engine still works at.
    pub max_mach: f64,

    /// Burn time (s).
    pub time: f64,
    pub total_time: f64,

    pub part_count: usize,
    pub total_part_count: usize,

    pub rcs_thrust: f64,
    pub rcs_isp: f64,
    pub rcs_thrust_to_weight: f64,
    pub rcs_delta_v_start: f64,
    pub rcs_delta_v_end: f64,
    pub rcs_burn_time: f64,
}

impl Stage {
    /// Fill in the running totals across `stages`, which are indexed by
    /// stage number.
    pub fn accumulate_totals(stages: &mut [Stage]) {
        let mut cost = 0.0;
        let mut mass = 0.0;
        let mut delta_v = 0.0;
        let mut time = 0.0;
        let mut previous_parts = 0;
        for stage in stages.iter_mut() {
            cost += stage.cost;
            mass += stage.mass;
            delta_v += stage.delta_v;
            time += stage.time;
            stage.total_cost = cost;
            stage.total_mass = mass;
            stage.total_delta_v = delta_v;
            stage.total_time = if time > MAX_REPORTED_TIME { 0.0 } else { time };
            stage.part_count = stage.total_part_count.saturating_sub(previous_parts);
            previous_parts = stage.total_part_count;
        }

        let mut inverse = 0.0;
        for stage in stages.iter_mut().rev() {
            inverse += stage.delta_v;
            stage.inverse_total_delta_v = inverse;
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage {:>2}: {:>7.1} m/s ({:>7.1}), isp {:>5.1} s, twr {:.2}/{:.2}, {:>6.1} s, {:.3}/{:.3} t, {} parts",
            self.number,
            self.delta_v,
            self.total_delta_v,
            self.isp,
            self.thrust_to_weight,
            self.max_thrust_to_weight,
            self.time,
            self.mass,
            self.total_mass,
            self.part_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(delta_v: f64, mass: f64, time: f64, total_part_count: usize) -> Stage {
        Stage {
            delta_v,
            mass,
            time,
            total_part_count,
            ..Stage::default()
        }
    }

    #[test]
    fn totals_accumulate_in_both_directions() {
        let mut stages = vec![
            stage(1000.0, 2.0, 100.0, 3),
            stage(500.0, 5.0, 50.0, 7),
            stage(200.0, 10.0, 20.0, 12),
        ];
        Stage::accumulate_totals(&mut stages);

        assert_eq!(
            stages.iter().map(|x| x.total_delta_v).collect::<Vec<_>>(),
            [1000.0, 1500.0, 1700.0]
        );
        assert_eq!(
            stages.iter().map(|x| x.inverse_total_delta_v).collect::<Vec<_>>(),
            [1700.0, 700.0, 200.0]
        );
        assert_eq!(
            stages.iter().map(|x| x.total_mass).collect::<Vec<_>>(),
            [2.0, 7.0, 17.0]
        );
        assert_eq!(
            stages.iter().map(|x| x.part_count).collect::<Vec<_>>(),
            [3, 4, 5]
        );
        assert_eq!(stages[2].total_time, 170.0);
    }

    #[test]
    fn very_long_burns_report_zero_time() {
        let mut stages = vec![stage(10.0, 1.0, 80000.0, 1), stage(10.0, 1.0, 10000.0, 2)];
        Stage::accumulate_totals(&mut stages);
        assert_eq!(stages[0].total_time, 80000.0);
        assert_eq!(stages[1].total_time, 0.0);
    }
}
