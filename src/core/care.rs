//! Per-person mortality and long-term-care overlay.
//!
//! Care cost is recomputed every year from anchors fixed at the moment care starts, so
//! inflation and cost drift are applied exactly once.

use serde::Serialize;

use super::data::{care_incidence, care_progression_probability, mortality_probability};
use super::rng::Rng;
use super::types::{CareConfig, CareGradeConfig, CareModel, PersonConfig};

/// Weight of the larger individual flex share in a two-person household.
const FLEX_SHARED_WEIGHT: f64 = 0.5;
const FLEX_INDIVIDUAL_WEIGHT: f64 = 0.25;

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CareMeta {
    pub triggered: bool,
    pub active: bool,
    /// Severity grade 1..=5; 0 before the first trigger.
    pub grade: u8,
    pub entry_age: u32,
    /// Acute episodes only; chronic care lasts until death.
    pub duration_years: Option<u32>,
    pub years_in_care: u32,
    pub additional_cost: f64,
    pub capped_target: f64,
    pub anchor_floor: f64,
    pub anchor_max_floor: f64,
    pub anchor_inflation: f64,
}

impl CareMeta {
    fn grade_config<'a>(&self, cfg: &'a CareConfig) -> Option<&'a CareGradeConfig> {
        self.grade
            .checked_sub(1)
            .and_then(|idx| cfg.grades.get(idx as usize))
    }

    /// Linear ramp from 0 at entry to 1 after `ramp_years`.
    pub fn ramp(&self, cfg: &CareConfig) -> f64 {
        if cfg.ramp_years == 0 {
            1.0
        } else {
            (self.years_in_care as f64 / cfg.ramp_years as f64).min(1.0)
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonState {
    #[serde(skip)]
    pub config: PersonConfig,
    pub age: u32,
    pub alive: bool,
    pub care: CareMeta,
}

impl PersonState {
    pub fn new(config: PersonConfig) -> Self {
        Self {
            config,
            age: config.start_age,
            alive: true,
            care: CareMeta::default(),
        }
    }

    pub fn in_care(&self) -> bool {
        self.alive && self.care.active
    }
}

/// Puts a person into care at `grade`, anchoring cost to the current household floor.
pub fn enter_care(
    person: &mut PersonState,
    cfg: &CareConfig,
    grade: u8,
    household_floor: f64,
    cumulative_inflation: f64,
    rng: &mut Rng,
) {
    let duration_years = match cfg.model {
        CareModel::Acute => Some(rng.next_between(cfg.acute_min_years, cfg.acute_max_years)),
        CareModel::Chronic => None,
    };
    person.care = CareMeta {
        triggered: true,
        active: true,
        grade: grade.clamp(1, 5),
        entry_age: person.age,
        duration_years,
        years_in_care: 0,
        additional_cost: 0.0,
        capped_target: 0.0,
        anchor_floor: household_floor,
        anchor_max_floor: cfg.max_floor * cumulative_inflation,
        anchor_inflation: cumulative_inflation,
    };
    recompute_cost(&mut person.care, cfg, cumulative_inflation);
}

fn recompute_cost(care: &mut CareMeta, cfg: &CareConfig, cumulative_inflation: f64) {
    let Some(grade) = care.grade_config(cfg) else {
        care.additional_cost = 0.0;
        care.capped_target = 0.0;
        return;
    };
    let inflation_since = if care.anchor_inflation > 0.0 {
        cumulative_inflation / care.anchor_inflation
    } else {
        1.0
    };
    let growth = inflation_since * (1.0 + cfg.cost_drift).powi(care.years_in_care as i32);
    let target = grade.additional_floor * care.anchor_inflation;
    let cap = (care.anchor_max_floor - care.anchor_floor).max(0.0);
    let capped = target.min(cap) * growth;

    care.capped_target = if capped.is_finite() { capped } else { 0.0 };
    care.additional_cost = care.capped_target * care.ramp(cfg);
}

/// Advances one life-year of care: progression or exit while active, otherwise an
/// entry draw from the age-bucketed incidence table.
pub fn advance_care_year(
    person: &mut PersonState,
    cfg: &CareConfig,
    household_floor: f64,
    cumulative_inflation: f64,
    rng: &mut Rng,
) {
    if !cfg.enabled || !person.alive {
        return;
    }

    if person.care.active {
        let care = &mut person.care;
        care.years_in_care += 1;
        if care.duration_years.is_some_and(|d| care.years_in_care >= d) {
            care.active = false;
            care.additional_cost = 0.0;
            return;
        }
        if care.grade < 5 && rng.chance(care_progression_probability(care.grade)) {
            care.grade += 1;
        }
        recompute_cost(care, cfg, cumulative_inflation);
        return;
    }

    if person.care.triggered {
        return;
    }

    let incidence = care_incidence(person.age);
    let draw = rng.next_f64();
    let mut cumulative = 0.0;
    for (idx, p) in incidence.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            enter_care(
                person,
                cfg,
                idx as u8 + 1,
                household_floor,
                cumulative_inflation,
                rng,
            );
            return;
        }
    }
}

/// One-year death probability, raised by the care multiplier on the same ramp as cost.
pub fn death_probability(person: &PersonState, cfg: &CareConfig) -> f64 {
    let base = mortality_probability(person.config.gender, person.age);
    let factor = match person.care.grade_config(cfg) {
        Some(grade) if person.in_care() => {
            1.0 + (grade.mortality_factor - 1.0) * person.care.ramp(cfg)
        }
        _ => 1.0,
    };
    (base * factor).clamp(0.0, 1.0)
}

/// Draws year-end survival and ages survivors by one year. Returns whether the person lives.
pub fn roll_survival(person: &mut PersonState, cfg: &CareConfig, rng: &mut Rng) -> bool {
    if !person.alive {
        return false;
    }
    if rng.chance(death_probability(person, cfg)) {
        person.alive = false;
        person.care.active = false;
        person.care.additional_cost = 0.0;
        return false;
    }
    person.age += 1;
    true
}

pub fn person_flex_share(person: &PersonState, cfg: &CareConfig) -> f64 {
    if !person.alive {
        return 0.0;
    }
    match person.care.grade_config(cfg) {
        Some(grade) if person.care.active => grade.flex_cut.clamp(0.0, 1.0),
        _ => 1.0,
    }
}

pub fn household_flex_factor(first: f64, second: Option<f64>) -> f64 {
    match second {
        None => first,
        Some(second) => {
            FLEX_SHARED_WEIGHT * first.max(second) + FLEX_INDIVIDUAL_WEIGHT * (first + second)
        }
    }
}

/// What the year engine needs from the overlay once this year's draws are resolved.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CareAdjustment {
    /// Sum of `person_costs`.
    pub additional_floor: f64,
    pub person_costs: [f64; 2],
    pub in_care: [bool; 2],
    pub flex_factor: f64,
    pub alive: [bool; 2],
}

impl Default for CareAdjustment {
    fn default() -> Self {
        Self {
            additional_floor: 0.0,
            person_costs: [0.0; 2],
            in_care: [false; 2],
            flex_factor: 1.0,
            alive: [true, false],
        }
    }
}

pub fn household_adjustment(
    first: &PersonState,
    second: Option<&PersonState>,
    cfg: &CareConfig,
) -> CareAdjustment {
    let cost = |p: &PersonState| if p.in_care() { p.care.additional_cost } else { 0.0 };
    let person_costs = [cost(first), second.map_or(0.0, cost)];
    CareAdjustment {
        additional_floor: person_costs[0] + person_costs[1],
        person_costs,
        in_care: [first.in_care(), second.is_some_and(PersonState::in_care)],
        flex_factor: household_flex_factor(
            person_flex_share(first, cfg),
            second.map(|p| person_flex_share(p, cfg)),
        ),
        alive: [first.alive, second.is_some_and(|p| p.alive)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Gender, sample_config};
    use proptest::prelude::{any, prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_person(age: u32) -> PersonState {
        let mut cfg = sample_config().person1;
        cfg.start_age = age;
        PersonState::new(cfg)
    }

    fn flat_care() -> CareConfig {
        CareConfig {
            cost_drift: 0.0,
            ..CareConfig::default()
        }
    }

    #[test]
    fn additional_floor_is_sum_of_active_persons() {
        let cfg = flat_care();
        let mut rng = Rng::new(1);
        let mut a = sample_person(80);
        let mut b = sample_person(78);
        enter_care(&mut a, &cfg, 2, 30_000.0, 1.0, &mut rng);
        enter_care(&mut b, &cfg, 4, 30_000.0, 1.0, &mut rng);
        for _ in 0..2 {
            a.care.years_in_care += 1;
            b.care.years_in_care += 1;
            recompute_cost(&mut a.care, &cfg, 1.0);
            recompute_cost(&mut b.care, &cfg, 1.0);
        }

        let adj = household_adjustment(&a, Some(&b), &cfg);
        assert!(a.care.additional_cost > 0.0 && b.care.additional_cost > 0.0);
        assert_approx(
            adj.additional_floor,
            a.care.additional_cost + b.care.additional_cost,
        );
    }

    #[test]
    fn no_active_care_means_no_additional_floor() {
        let cfg = flat_care();
        let a = sample_person(70);
        let b = sample_person(72);
        let adj = household_adjustment(&a, Some(&b), &cfg);
        assert_approx(adj.additional_floor, 0.0);
        assert_approx(adj.flex_factor, 1.0);
        assert_eq!(adj.alive, [true, true]);
    }

    #[test]
    fn cost_is_zero_at_entry_and_reaches_capped_target_after_ramp() {
        let cfg = flat_care();
        let mut rng = Rng::new(9);
        let mut p = sample_person(82);
        enter_care(&mut p, &cfg, 3, 30_000.0, 1.2, &mut rng);
        assert_approx(p.care.additional_cost, 0.0);
        assert_approx(p.care.capped_target, 18_000.0 * 1.2);

        for _ in 0..cfg.ramp_years + 2 {
            p.care.years_in_care += 1;
            recompute_cost(&mut p.care, &cfg, 1.2);
        }
        assert_approx(p.care.additional_cost, p.care.capped_target);
    }

    #[test]
    fn capped_target_never_exceeds_max_floor_headroom() {
        let mut cfg = flat_care();
        cfg.max_floor = 40_000.0;
        let mut rng = Rng::new(4);
        let mut p = sample_person(85);
        enter_care(&mut p, &cfg, 5, 35_000.0, 1.0, &mut rng);
        assert_approx(p.care.capped_target, 5_000.0);

        p.care.years_in_care = 10;
        recompute_cost(&mut p.care, &cfg, 1.5);
        assert_approx(p.care.additional_cost, 5_000.0 * 1.5);
    }

    #[test]
    fn drift_compounds_from_anchor_without_double_counting() {
        let cfg = CareConfig {
            cost_drift: 0.02,
            ramp_years: 0,
            ..CareConfig::default()
        };
        let mut rng = Rng::new(4);
        let mut p = sample_person(85);
        enter_care(&mut p, &cfg, 1, 24_000.0, 1.1, &mut rng);
        for _ in 0..3 {
            p.care.years_in_care += 1;
            recompute_cost(&mut p.care, &cfg, 1.3);
        }
        let expected = 6_000.0 * 1.1 * (1.3 / 1.1) * 1.02_f64.powi(3);
        assert_approx(p.care.additional_cost, expected);
    }

    #[test]
    fn acute_care_exits_after_drawn_duration() {
        let cfg = CareConfig {
            model: CareModel::Acute,
            acute_min_years: 2,
            acute_max_years: 2,
            ..CareConfig::default()
        };
        let mut rng = Rng::new(17);
        let mut p = sample_person(80);
        enter_care(&mut p, &cfg, 1, 24_000.0, 1.0, &mut rng);
        assert_eq!(p.care.duration_years, Some(2));

        advance_care_year(&mut p, &cfg, 24_000.0, 1.0, &mut rng);
        assert!(p.care.active);
        advance_care_year(&mut p, &cfg, 24_000.0, 1.0, &mut rng);
        assert!(!p.care.active);
        assert_approx(p.care.additional_cost, 0.0);

        advance_care_year(&mut p, &cfg, 24_000.0, 1.0, &mut rng);
        assert!(!p.care.active, "one episode per life");
    }

    #[test]
    fn no_care_entry_below_first_bucket() {
        let cfg = CareConfig::default();
        let mut rng = Rng::new(123);
        let mut p = sample_person(60);
        for _ in 0..500 {
            advance_care_year(&mut p, &cfg, 24_000.0, 1.0, &mut rng);
        }
        assert!(!p.care.triggered);
    }

    #[test]
    fn young_persons_never_die_in_unmodeled_ages() {
        let cfg = CareConfig::default();
        let mut rng = Rng::new(5);
        let p = sample_person(40);
        assert_approx(death_probability(&p, &cfg), 0.0);
        let mut q = p;
        assert!(roll_survival(&mut q, &cfg, &mut rng));
        assert_eq!(q.age, 41);
    }

    #[test]
    fn care_raises_mortality_along_the_ramp() {
        let cfg = flat_care();
        let mut rng = Rng::new(8);
        let mut p = sample_person(80);
        p.config.gender = Gender::Female;
        let base = death_probability(&p, &cfg);
        enter_care(&mut p, &cfg, 5, 24_000.0, 1.0, &mut rng);
        assert_approx(death_probability(&p, &cfg), base);

        p.care.years_in_care = cfg.ramp_years;
        assert_approx(death_probability(&p, &cfg), base * 3.0);
    }

    #[test]
    fn household_flex_weights_shared_and_individual() {
        assert_approx(household_flex_factor(1.0, Some(1.0)), 1.0);
        assert_approx(household_flex_factor(0.0, Some(0.0)), 0.0);
        assert_approx(household_flex_factor(1.0, Some(0.0)), 0.75);
        assert_approx(household_flex_factor(0.5, Some(1.0)), 0.875);
        assert_approx(household_flex_factor(0.3, None), 0.3);
    }

    #[test]
    fn deceased_partner_contributes_nothing() {
        let cfg = flat_care();
        let a = sample_person(75);
        let mut b = sample_person(75);
        b.alive = false;
        let adj = household_adjustment(&a, Some(&b), &cfg);
        assert_approx(adj.flex_factor, 0.75);
        assert_eq!(adj.alive, [true, false]);
    }

    proptest! {
        #[test]
        fn prop_cost_stays_within_inflated_headroom(
            seed in any::<u64>(),
            floor in 10_000.0_f64..90_000.0,
            years in 1_u32..25,
        ) {
            let cfg = CareConfig::default();
            let mut rng = Rng::new(seed);
            let mut p = sample_person(90);
            enter_care(&mut p, &cfg, 1, floor, 1.0, &mut rng);
            let mut inflation = 1.0;
            for _ in 0..years {
                inflation *= 1.02;
                advance_care_year(&mut p, &cfg, floor, inflation, &mut rng);
                let headroom = (cfg.max_floor - floor).max(0.0)
                    * inflation
                    * (1.0 + cfg.cost_drift).powi(p.care.years_in_care as i32);
                prop_assert!(p.care.additional_cost <= headroom + EPS);
                prop_assert!(p.care.additional_cost >= 0.0);
            }
        }
    }
}
