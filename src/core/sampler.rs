use log::warn;
use serde::Serialize;

use super::data::{MarketHistory, Regime};
use super::rng::Rng;
use super::types::{SamplerMode, StressPreset};

/// One year of market data, consumed by exactly one year transition.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearMarketData {
    pub year: u32,
    pub source_index: usize,
    pub regime: Regime,
    pub equity_return: f64,
    pub gold_return_pct: f64,
    pub cash_rate_pct: f64,
    pub inflation_pct: f64,
    pub wage_growth_pct: f64,
    pub stressed: bool,
}

/// Everything the sampler needs to resume a trial mid-way.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplerState {
    block_start: Option<usize>,
    year_in_block: usize,
    regime: Option<Regime>,
    stress_remaining: u32,
    rebound_remaining: u32,
}

impl SamplerState {
    pub fn stress_remaining(&self) -> u32 {
        self.stress_remaining
    }

    pub fn regime(&self) -> Option<Regime> {
        self.regime
    }
}

/// Historical mean used as the pivot for volatility scaling.
const SHIFT_PIVOT_RETURN: f64 = 0.08;
const FORCED_DRAWDOWN_RETURNS: [f64; 3] = [-0.25, -0.20, -0.15];

#[derive(Clone, Debug)]
enum StressPlan {
    /// Stress years are drawn from a filtered set of historical years.
    Pool { indices: Vec<usize>, years: u32 },
    /// The normally sampled year is shifted and rescaled.
    Shift {
        years: u32,
        drift_shift: f64,
        vol_scale: f64,
        inflation_floor: f64,
    },
    /// Equity returns are forced to a fixed path, then rebounds are capped.
    Sequence {
        returns: &'static [f64],
        noise: f64,
        rebound_years: u32,
        rebound_cap: f64,
    },
}

impl StressPlan {
    fn years(&self) -> u32 {
        match self {
            StressPlan::Pool { years, .. } | StressPlan::Shift { years, .. } => *years,
            StressPlan::Sequence { returns, .. } => returns.len() as u32,
        }
    }

    fn rebound_years(&self) -> u32 {
        match self {
            StressPlan::Sequence { rebound_years, .. } => *rebound_years,
            _ => 0,
        }
    }

    /// Overrides a normally sampled year; `step` counts from 0 inside the window.
    fn apply(&self, year: &mut YearMarketData, step: u32, rng: &mut Rng) {
        match self {
            StressPlan::Pool { .. } => {}
            StressPlan::Shift {
                drift_shift,
                vol_scale,
                inflation_floor,
                ..
            } => {
                let deviation = year.equity_return - SHIFT_PIVOT_RETURN;
                year.equity_return = SHIFT_PIVOT_RETURN + deviation * vol_scale + drift_shift;
                year.inflation_pct = year.inflation_pct.max(*inflation_floor);
            }
            StressPlan::Sequence { returns, noise, .. } => {
                let base = returns.get(step as usize).copied().unwrap_or(0.0);
                year.equity_return = base + (rng.next_f64() * 2.0 - 1.0) * noise;
            }
        }
        year.stressed = true;
    }
}

struct StressFilter {
    years: u32,
    inflation_min: Option<f64>,
    real_return_max: Option<f64>,
}

impl StressPreset {
    fn filter(self) -> Option<StressFilter> {
        match self {
            StressPreset::Stagflation70s => Some(StressFilter {
                years: 7,
                inflation_min: Some(7.0),
                real_return_max: Some(-2.0),
            }),
            StressPreset::DoubleBear00s => Some(StressFilter {
                years: 6,
                inflation_min: None,
                real_return_max: Some(-8.0),
            }),
            StressPreset::None
            | StressPreset::InflationSpike3y
            | StressPreset::ForcedDrawdown3y => None,
        }
    }
}

fn build_stress_plan(history: &MarketHistory, preset: StressPreset) -> Option<StressPlan> {
    match preset {
        StressPreset::None => None,
        StressPreset::InflationSpike3y => Some(StressPlan::Shift {
            years: 3,
            drift_shift: -0.05,
            vol_scale: 1.5,
            inflation_floor: 7.0,
        }),
        StressPreset::ForcedDrawdown3y => Some(StressPlan::Sequence {
            returns: &FORCED_DRAWDOWN_RETURNS,
            noise: 0.04,
            rebound_years: 2,
            rebound_cap: 0.05,
        }),
        StressPreset::Stagflation70s | StressPreset::DoubleBear00s => {
            build_stress_pool(history, preset)
        }
    }
}

fn build_stress_pool(history: &MarketHistory, preset: StressPreset) -> Option<StressPlan> {
    let filter = preset.filter()?;
    let indices: Vec<usize> = history
        .records()
        .iter()
        .enumerate()
        .filter(|(_, r)| filter.inflation_min.is_none_or(|min| r.inflation_pct >= min))
        .filter(|(_, r)| {
            filter
                .real_return_max
                .is_none_or(|max| r.real_return_pct() <= max)
        })
        .map(|(idx, _)| idx)
        .collect();

    if indices.is_empty() {
        warn!("stress preset {preset:?} matched no historical years; running unstressed");
        return None;
    }
    Some(StressPlan::Pool {
        indices,
        years: filter.years,
    })
}

pub struct MarketSampler<'a> {
    history: &'a MarketHistory,
    mode: SamplerMode,
    block_size: usize,
    stress: Option<StressPlan>,
}

impl<'a> MarketSampler<'a> {
    pub fn new(
        history: &'a MarketHistory,
        mode: SamplerMode,
        block_size: u32,
        stress: StressPreset,
    ) -> Self {
        Self {
            history,
            mode,
            block_size: (block_size as usize).max(1),
            stress: build_stress_plan(history, stress),
        }
    }

    pub fn history(&self) -> &'a MarketHistory {
        self.history
    }

    /// Length of the stress window at the start of each trial; 0 when unstressed.
    pub fn stress_years(&self) -> u32 {
        self.stress.as_ref().map_or(0, StressPlan::years)
    }

    /// Fresh state for a trial anchored at a historical start index.
    pub fn start_state(&self, start_index: usize) -> SamplerState {
        SamplerState {
            block_start: Some(start_index),
            year_in_block: 0,
            regime: Some(self.history.record(start_index).regime),
            stress_remaining: self.stress_years(),
            rebound_remaining: self.stress.as_ref().map_or(0, StressPlan::rebound_years),
        }
    }

    pub fn sample(&self, state: &mut SamplerState, rng: &mut Rng) -> YearMarketData {
        let stress = self.stress.as_ref();
        let in_window = stress.filter(|_| state.stress_remaining > 0);
        if let Some(StressPlan::Pool { indices, .. }) = in_window {
            state.stress_remaining -= 1;
            let idx = indices[rng.next_index(indices.len())];
            return self.year_from(idx, true);
        }

        let idx = self.next_index(state, rng);
        let mut year = self.year_from(idx, false);
        match stress {
            Some(plan) if state.stress_remaining > 0 => {
                let step = plan.years() - state.stress_remaining;
                state.stress_remaining -= 1;
                plan.apply(&mut year, step, rng);
            }
            Some(StressPlan::Sequence { rebound_cap, .. }) if state.rebound_remaining > 0 => {
                state.rebound_remaining -= 1;
                year.equity_return = year.equity_return.min(*rebound_cap);
            }
            _ => {}
        }
        year
    }

    fn next_index(&self, state: &mut SamplerState, rng: &mut Rng) -> usize {
        match self.mode {
            SamplerMode::Block => self.next_block_index(state, rng),
            SamplerMode::RegimeMarkov => {
                let next = match state.regime {
                    Some(current) => self.draw_transition(current, rng),
                    None => {
                        self.history
                            .record(rng.next_index(self.history.len()))
                            .regime
                    }
                };
                state.regime = Some(next);
                self.draw_year_in(next, rng)
            }
            SamplerMode::RegimeIid => {
                let populated: Vec<Regime> = Regime::ALL
                    .into_iter()
                    .filter(|r| !self.history.years_in(*r).is_empty())
                    .collect();
                let regime = populated
                    .get(rng.next_index(populated.len()))
                    .copied()
                    .unwrap_or(Regime::Sideways);
                state.regime = Some(regime);
                self.draw_year_in(regime, rng)
            }
        }
    }

    fn next_block_index(&self, state: &mut SamplerState, rng: &mut Rng) -> usize {
        let len = self.history.len();
        let exhausted = match state.block_start {
            None => true,
            Some(start) => {
                state.year_in_block >= self.block_size || start + state.year_in_block >= len
            }
        };
        if exhausted {
            let anchors = len.saturating_sub(self.block_size) + 1;
            state.block_start = Some(rng.next_index(anchors));
            state.year_in_block = 0;
        }
        let idx = state.block_start.unwrap_or(0) + state.year_in_block;
        state.year_in_block += 1;
        idx.min(len.saturating_sub(1))
    }

    fn draw_transition(&self, from: Regime, rng: &mut Rng) -> Regime {
        let row = self.history.transition_row(from);
        let total: u32 = row.iter().sum();
        if total == 0 {
            return Regime::Sideways;
        }
        let target = rng.next_f64() * total as f64;
        let mut cumulative = 0.0;
        for regime in Regime::ALL {
            cumulative += row[regime.index()] as f64;
            if target < cumulative {
                return regime;
            }
        }
        Regime::Sideways
    }

    fn draw_year_in(&self, regime: Regime, rng: &mut Rng) -> usize {
        let years = self.history.years_in(regime);
        if years.is_empty() {
            return rng.next_index(self.history.len());
        }
        years[rng.next_index(years.len())]
    }

    fn year_from(&self, idx: usize, stressed: bool) -> YearMarketData {
        let record = self.history.record(idx);
        YearMarketData {
            year: record.year,
            source_index: idx,
            regime: record.regime,
            equity_return: record.equity_return,
            gold_return_pct: record.gold_return_pct,
            cash_rate_pct: record.cash_rate_pct,
            inflation_pct: record.inflation_pct,
            wage_growth_pct: record.wage_growth_pct,
            stressed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    fn sampler(mode: SamplerMode, stress: StressPreset) -> MarketSampler<'static> {
        MarketSampler::new(MarketHistory::bundled(), mode, 5, stress)
    }

    #[test]
    fn block_mode_walks_contiguous_years_from_start() {
        let s = sampler(SamplerMode::Block, StressPreset::None);
        let mut state = s.start_state(10);
        let mut rng = Rng::new(3);
        let first: Vec<usize> = (0..5)
            .map(|_| s.sample(&mut state, &mut rng).source_index)
            .collect();
        assert_eq!(first, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn block_mode_reanchors_after_exhaustion() {
        let s = sampler(SamplerMode::Block, StressPreset::None);
        let len = s.history().len();
        let mut state = s.start_state(len - 2);
        let mut rng = Rng::new(11);
        let a = s.sample(&mut state, &mut rng).source_index;
        let b = s.sample(&mut state, &mut rng).source_index;
        assert_eq!((a, b), (len - 2, len - 1));

        let anchor = s.sample(&mut state, &mut rng).source_index;
        assert!(anchor + 5 <= len, "new block must fit: {anchor}");
        for offset in 1..5 {
            assert_eq!(s.sample(&mut state, &mut rng).source_index, anchor + offset);
        }
    }

    #[test]
    fn stagflation_stress_draws_only_from_pool_then_reverts() {
        let s = sampler(SamplerMode::Block, StressPreset::Stagflation70s);
        let mut state = s.start_state(30);
        assert_eq!(state.stress_remaining(), 7);
        let mut rng = Rng::new(5);
        for _ in 0..7 {
            let year = s.sample(&mut state, &mut rng);
            assert!(year.stressed);
            assert!(year.inflation_pct >= 7.0);
            assert!(year.equity_return * 100.0 - year.inflation_pct <= -2.0);
        }
        let after = s.sample(&mut state, &mut rng);
        assert!(!after.stressed);
        assert_eq!(after.source_index, 30);
    }

    #[test]
    fn double_bear_pool_is_deeply_negative() {
        let s = sampler(SamplerMode::RegimeIid, StressPreset::DoubleBear00s);
        let mut state = s.start_state(4);
        let mut rng = Rng::new(77);
        for _ in 0..6 {
            let year = s.sample(&mut state, &mut rng);
            assert!(year.equity_return * 100.0 - year.inflation_pct <= -8.0);
        }
    }

    #[test]
    fn markov_mode_follows_observed_transitions() {
        let s = sampler(SamplerMode::RegimeMarkov, StressPreset::None);
        let history = s.history();
        let mut state = s.start_state(0);
        let mut rng = Rng::new(2024);
        let mut previous = state.regime().expect("seeded regime");
        for _ in 0..200 {
            let year = s.sample(&mut state, &mut rng);
            let row = history.transition_row(previous);
            if row.iter().sum::<u32>() > 0 {
                assert!(row[year.regime.index()] > 0, "{previous:?} -> {:?}", year.regime);
            }
            assert_eq!(history.record(year.source_index).regime, year.regime);
            previous = year.regime;
        }
    }

    #[test]
    fn markov_transitions_hold_after_pool_stress_window() {
        let s = sampler(SamplerMode::RegimeMarkov, StressPreset::Stagflation70s);
        let history = s.history();
        let mut state = s.start_state(12);
        let seeded = state.regime().expect("seeded regime");
        let mut rng = Rng::new(31);
        for _ in 0..s.stress_years() {
            assert!(s.sample(&mut state, &mut rng).stressed);
        }
        assert_eq!(state.regime(), Some(seeded));

        let mut previous = seeded;
        for _ in 0..200 {
            let year = s.sample(&mut state, &mut rng);
            assert!(!year.stressed);
            let row = history.transition_row(previous);
            if row.iter().sum::<u32>() > 0 {
                assert!(row[year.regime.index()] > 0, "{previous:?} -> {:?}", year.regime);
            }
            previous = year.regime;
        }
    }

    #[test]
    fn inflation_spike_rescales_sampled_years_then_reverts() {
        let plain = sampler(SamplerMode::Block, StressPreset::None);
        let spiked = sampler(SamplerMode::Block, StressPreset::InflationSpike3y);
        assert_eq!(spiked.stress_years(), 3);
        let (mut plain_state, mut spiked_state) = (plain.start_state(10), spiked.start_state(10));
        let (mut plain_rng, mut spiked_rng) = (Rng::new(8), Rng::new(8));
        for step in 0..6 {
            let base = plain.sample(&mut plain_state, &mut plain_rng);
            let year = spiked.sample(&mut spiked_state, &mut spiked_rng);
            assert_eq!(year.source_index, base.source_index);
            if step < 3 {
                assert!(year.stressed);
                let expected = 0.08 + (base.equity_return - 0.08) * 1.5 - 0.05;
                assert!((year.equity_return - expected).abs() < 1e-12);
                assert!(year.inflation_pct >= 7.0);
                assert!(year.inflation_pct >= base.inflation_pct);
            } else {
                assert_eq!(year, base);
            }
        }
    }

    #[test]
    fn forced_drawdown_follows_path_then_caps_rebounds() {
        let s = sampler(SamplerMode::Block, StressPreset::ForcedDrawdown3y);
        let mut state = s.start_state(20);
        let mut rng = Rng::new(404);
        for (offset, forced) in [-0.25, -0.20, -0.15].into_iter().enumerate() {
            let year = s.sample(&mut state, &mut rng);
            assert!(year.stressed);
            assert_eq!(year.source_index, 20 + offset);
            assert!((year.equity_return - forced).abs() <= 0.04 + 1e-12);
        }
        assert_eq!(state.stress_remaining(), 0);
        for _ in 0..2 {
            let year = s.sample(&mut state, &mut rng);
            assert!(!year.stressed);
            assert!(year.equity_return <= 0.05);
        }
        let unclamped: Vec<f64> = (0..40)
            .map(|_| s.sample(&mut state, &mut rng).equity_return)
            .collect();
        assert!(unclamped.iter().any(|r| *r > 0.05));
    }

    #[test]
    fn state_is_resumable_mid_trial() {
        let s = sampler(SamplerMode::RegimeMarkov, StressPreset::DoubleBear00s);
        let mut state = s.start_state(8);
        let mut rng = Rng::new(99);
        for _ in 0..3 {
            s.sample(&mut state, &mut rng);
        }
        let mut resumed_state = state.clone();
        let mut resumed_rng = rng.clone();
        for _ in 0..10 {
            assert_eq!(
                s.sample(&mut state, &mut rng),
                s.sample(&mut resumed_state, &mut resumed_rng)
            );
        }
    }

    proptest! {
        #[test]
        fn prop_sampled_index_always_in_history(seed in any::<u64>(), start in 4_usize..55) {
            for mode in [SamplerMode::Block, SamplerMode::RegimeMarkov, SamplerMode::RegimeIid] {
                let s = sampler(mode, StressPreset::None);
                let mut state = s.start_state(start);
                let mut rng = Rng::new(seed);
                for _ in 0..40 {
                    let year = s.sample(&mut state, &mut rng);
                    prop_assert!(year.source_index < s.history().len());
                    prop_assert_eq!(s.history().record(year.source_index).year, year.year);
                }
            }
        }
    }
}
