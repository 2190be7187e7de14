//! Static read-only tables: historical market data, regime statistics, mortality and care
//! incidence. Built once and shared by every trial.

use std::sync::OnceLock;

use serde::Serialize;

use super::types::Gender;

/// (year, equity index level, inflation %, cash rate %, wage growth %, gold EUR performance %)
const HISTORICAL_ROWS: [(u32, f64, f64, f64, f64, f64); 56] = [
    (1969, 60.8, 1.9, 6.0, 9.8, -8.5),
    (1970, 60.9, 3.4, 7.5, 12.6, 4.3),
    (1971, 72.4, 5.3, 5.0, 10.5, 19.8),
    (1972, 88.4, 5.5, 4.0, 9.1, 47.2),
    (1973, 74.4, 7.1, 7.0, 10.2, 68.5),
    (1974, 53.6, 7.0, 6.0, 10.8, 70.1),
    (1975, 71.0, 6.0, 4.5, 7.2, -25.8),
    (1976, 72.6, 4.3, 3.5, 7.3, -1.5),
    (1977, 67.1, 3.7, 3.0, 7.1, 22.4),
    (1978, 77.7, 2.7, 3.0, 5.4, 35.7),
    (1979, 79.2, 4.1, 5.0, 6.2, 126.3),
    (1980, 97.8, 5.5, 8.5, 6.6, -6.2),
    (1981, 91.2, 6.3, 10.5, 4.8, -20.8),
    (1982, 90.7, 5.3, 7.5, 4.2, 18.9),
    (1983, 110.8, 3.3, 5.5, 3.7, -18.9),
    (1984, 114.5, 2.4, 5.5, 3.4, -15.4),
    (1985, 164.3, 2.2, 5.5, 3.7, 12.7),
    (1986, 206.5, -0.1, 4.5, 4.1, 24.1),
    (1987, 227.1, 0.2, 3.5, 3.2, 1.8),
    (1988, 274.6, 1.3, 4.0, 3.8, -12.4),
    (1989, 326.8, 2.8, 7.0, 3.9, -2.4),
    (1990, 274.0, 2.7, 8.0, 5.8, -7.8),
    (1991, 317.9, 3.5, 8.5, 6.7, -6.1),
    (1992, 300.0, 5.1, 9.5, 5.7, -5.8),
    (1993, 376.1, 4.5, 7.25, 3.3, 20.1),
    (1994, 382.7, 2.7, 5.0, 2.4, -2.3),
    (1995, 450.4, 1.7, 4.0, 3.5, 0.6),
    (1996, 505.7, 1.4, 3.0, 2.2, -6.9),
    (1997, 590.0, 1.9, 3.0, 1.9, -20.7),
    (1998, 758.3, 0.9, 3.0, 2.8, 0.9),
    (1999, 958.4, 0.6, 2.5, 2.7, -0.6),
    (2000, 823.1, 1.4, 4.25, 2.5, -2.7),
    (2001, 675.2, 2.1, 3.75, 1.9, 4.3),
    (2002, 462.8, 1.3, 2.75, 2.1, 19.4),
    (2003, 511.0, 1.0, 2.0, 1.2, 11.7),
    (2004, 565.6, 1.7, 2.0, 1.1, 2.2),
    (2005, 724.0, 1.5, 2.1, 0.8, 22.3),
    (2006, 825.0, 1.8, 3.0, 1.6, 17.3),
    (2007, 842.2, 2.3, 4.0, 2.8, 2.1),
    (2008, 462.6, 2.8, 3.25, 3.4, 2.7),
    (2009, 609.4, 0.2, 1.0, 0.8, 17.2),
    (2010, 687.9, 1.1, 1.0, 2.3, 34.9),
    (2011, 634.3, 2.5, 1.25, 3.9, 7.6),
    (2012, 726.6, 2.1, 0.75, 2.9, 4.0),
    (2013, 898.0, 1.6, 0.25, 2.4, -22.8),
    (2014, 1062.5, 0.9, 0.05, 2.8, -0.6),
    (2015, 1159.2, 0.7, 0.05, 2.9, -10.0),
    (2016, 1248.0, 0.4, 0.0, 2.5, 11.7),
    (2017, 1329.8, 1.7, 0.0, 2.6, -0.4),
    (2018, 1268.4, 1.9, 0.0, 3.1, -4.3),
    (2019, 1619.5, 1.4, 0.0, 2.8, 19.4),
    (2020, 1706.7, 0.5, -0.5, 1.2, 13.9),
    (2021, 2260.4, 3.1, -0.5, 3.0, -5.2),
    (2022, 1960.9, 6.9, 1.25, 4.0, 5.7),
    (2023, 2318.9, 5.9, 3.5, 6.0, 12.1),
    (2024, 2500.0, 2.5, 3.75, 3.0, 15.0),
];

const MORTALITY_FIRST_AGE: u32 = 50;

const MORTALITY_MALE: [f64; 61] = [
    0.003, 0.003, 0.004, 0.004, 0.004, 0.005, 0.005, 0.006, 0.006, 0.007, 0.007, 0.008, 0.009,
    0.009, 0.010, 0.010, 0.011, 0.012, 0.013, 0.014, 0.016, 0.017, 0.019, 0.021, 0.023, 0.026,
    0.029, 0.032, 0.036, 0.040, 0.045, 0.051, 0.057, 0.065, 0.073, 0.083, 0.094, 0.107, 0.121,
    0.137, 0.155, 0.175, 0.197, 0.221, 0.247, 0.275, 0.305, 0.337, 0.370, 0.400, 0.430, 0.46,
    0.49, 0.52, 0.55, 0.6, 0.65, 0.7, 0.8, 0.9, 1.0,
];

const MORTALITY_FEMALE: [f64; 61] = [
    0.002, 0.002, 0.002, 0.003, 0.003, 0.003, 0.004, 0.004, 0.004, 0.005, 0.005, 0.006, 0.006,
    0.007, 0.007, 0.007, 0.008, 0.008, 0.009, 0.010, 0.011, 0.012, 0.013, 0.015, 0.016, 0.018,
    0.021, 0.023, 0.026, 0.030, 0.034, 0.039, 0.044, 0.050, 0.057, 0.066, 0.076, 0.087, 0.100,
    0.115, 0.131, 0.149, 0.169, 0.191, 0.215, 0.241, 0.269, 0.298, 0.329, 0.360, 0.390, 0.42,
    0.45, 0.48, 0.51, 0.55, 0.6, 0.65, 0.75, 0.85, 1.0,
];

/// Care incidence per 5-year age bucket starting at 65; columns are grades 1 to 5.
const CARE_FIRST_BUCKET_AGE: u32 = 65;
const CARE_INCIDENCE: [[f64; 5]; 7] = [
    [0.012, 0.006, 0.003, 0.0015, 0.0005],
    [0.020, 0.010, 0.005, 0.0025, 0.0010],
    [0.035, 0.018, 0.009, 0.0045, 0.0020],
    [0.055, 0.032, 0.016, 0.0075, 0.0035],
    [0.085, 0.055, 0.032, 0.0150, 0.0070],
    [0.120, 0.080, 0.050, 0.0280, 0.0120],
    [0.140, 0.090, 0.060, 0.0350, 0.0150],
];

const CARE_PROGRESSION: [f64; 5] = [0.15, 0.12, 0.10, 0.08, 0.0];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
    Stagflation,
}

impl Regime {
    pub const ALL: [Regime; 4] = [
        Regime::Bull,
        Regime::Bear,
        Regime::Sideways,
        Regime::Stagflation,
    ];

    pub fn index(self) -> usize {
        match self {
            Regime::Bull => 0,
            Regime::Bear => 1,
            Regime::Sideways => 2,
            Regime::Stagflation => 3,
        }
    }

    fn classify(equity_return: f64, inflation_pct: f64) -> Regime {
        let real_return_pct = equity_return * 100.0 - inflation_pct;
        if inflation_pct > 4.0 && real_return_pct < 0.0 {
            Regime::Stagflation
        } else if equity_return > 0.15 {
            Regime::Bull
        } else if equity_return < -0.10 {
            Regime::Bear
        } else {
            Regime::Sideways
        }
    }
}

/// One sampled-able historical year. Inflation, cash rate, wage growth and gold are the
/// prior calendar year's values, matching how the index return is dated.
#[derive(Copy, Clone, Debug)]
pub struct AnnualRecord {
    pub year: u32,
    pub index_level: f64,
    pub equity_return: f64,
    pub gold_return_pct: f64,
    pub cash_rate_pct: f64,
    pub inflation_pct: f64,
    pub wage_growth_pct: f64,
    pub regime: Regime,
}

impl AnnualRecord {
    pub fn real_return_pct(&self) -> f64 {
        self.equity_return * 100.0 - self.inflation_pct
    }
}

#[derive(Debug)]
pub struct MarketHistory {
    records: Vec<AnnualRecord>,
    by_regime: [Vec<usize>; 4],
    transitions: [[u32; 4]; 4],
}

impl MarketHistory {
    pub fn from_rows(rows: &[(u32, f64, f64, f64, f64, f64)]) -> Self {
        let mut records = Vec::with_capacity(rows.len().saturating_sub(1));
        for pair in rows.windows(2) {
            let (_, prev_level, prev_inflation, prev_rate, prev_wage, prev_gold) = pair[0];
            let (year, level, ..) = pair[1];
            let equity_return = if prev_level > 0.0 {
                (level - prev_level) / prev_level
            } else {
                0.0
            };
            records.push(AnnualRecord {
                year,
                index_level: level,
                equity_return,
                gold_return_pct: prev_gold,
                cash_rate_pct: prev_rate,
                inflation_pct: prev_inflation,
                wage_growth_pct: prev_wage,
                regime: Regime::classify(equity_return, prev_inflation),
            });
        }

        let mut by_regime: [Vec<usize>; 4] = Default::default();
        for (idx, record) in records.iter().enumerate() {
            by_regime[record.regime.index()].push(idx);
        }

        let mut transitions = [[0_u32; 4]; 4];
        for pair in records.windows(2) {
            transitions[pair[0].regime.index()][pair[1].regime.index()] += 1;
        }

        Self {
            records,
            by_regime,
            transitions,
        }
    }

    /// Shared instance built from the bundled MSCI/EUR table.
    pub fn bundled() -> &'static MarketHistory {
        static HISTORY: OnceLock<MarketHistory> = OnceLock::new();
        HISTORY.get_or_init(|| MarketHistory::from_rows(&HISTORICAL_ROWS))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, idx: usize) -> &AnnualRecord {
        &self.records[idx.min(self.records.len().saturating_sub(1))]
    }

    pub fn records(&self) -> &[AnnualRecord] {
        &self.records
    }

    pub fn years_in(&self, regime: Regime) -> &[usize] {
        &self.by_regime[regime.index()]
    }

    pub fn transition_row(&self, from: Regime) -> &[u32; 4] {
        &self.transitions[from.index()]
    }
}

/// Base one-year death probability. Ages outside the table are unmodeled and yield zero.
pub fn mortality_probability(gender: Gender, age: u32) -> f64 {
    let table = match gender {
        Gender::Male => &MORTALITY_MALE,
        Gender::Female => &MORTALITY_FEMALE,
    };
    age.checked_sub(MORTALITY_FIRST_AGE)
        .and_then(|offset| table.get(offset as usize))
        .copied()
        .unwrap_or(0.0)
}

/// Per-grade care incidence for the bucket containing `age`. Below the first bucket no
/// event is modeled; ages past the last bucket reuse it.
pub fn care_incidence(age: u32) -> [f64; 5] {
    match age.checked_sub(CARE_FIRST_BUCKET_AGE) {
        None => [0.0; 5],
        Some(offset) => {
            let bucket = ((offset / 5) as usize).min(CARE_INCIDENCE.len() - 1);
            CARE_INCIDENCE[bucket]
        }
    }
}

pub fn care_progression_probability(grade: u8) -> f64 {
    match grade {
        1..=5 => CARE_PROGRESSION[(grade - 1) as usize],
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn bundled_history_covers_1970_to_2024() {
        let history = MarketHistory::bundled();
        assert_eq!(history.len(), 55);
        assert_eq!(history.record(0).year, 1970);
        assert_eq!(history.records().last().map(|r| r.year), Some(2024));
    }

    #[test]
    fn oracle_record_uses_prior_year_macro_values() {
        let history = MarketHistory::bundled();
        let y1974 = history
            .records()
            .iter()
            .find(|r| r.year == 1974)
            .copied()
            .expect("1974 present");
        assert_approx(y1974.equity_return, (53.6 - 74.4) / 74.4);
        assert_approx(y1974.inflation_pct, 7.1);
        assert_approx(y1974.cash_rate_pct, 7.0);
        assert_approx(y1974.gold_return_pct, 68.5);
        assert_eq!(y1974.regime, Regime::Stagflation);
    }

    #[test]
    fn regime_partitions_every_year() {
        let history = MarketHistory::bundled();
        let total: usize = Regime::ALL
            .iter()
            .map(|r| history.years_in(*r).len())
            .sum();
        assert_eq!(total, history.len());
        assert!(!history.years_in(Regime::Bull).is_empty());
        assert!(!history.years_in(Regime::Bear).is_empty());
    }

    #[test]
    fn transition_counts_match_consecutive_pairs() {
        let history = MarketHistory::bundled();
        let total: u32 = Regime::ALL
            .iter()
            .map(|r| history.transition_row(*r).iter().sum::<u32>())
            .sum();
        assert_eq!(total as usize, history.len() - 1);
    }

    #[test]
    fn unmodeled_mortality_ages_have_zero_probability() {
        assert_approx(mortality_probability(Gender::Male, 30), 0.0);
        assert_approx(mortality_probability(Gender::Female, 49), 0.0);
        assert_approx(mortality_probability(Gender::Male, 111), 0.0);
        assert_approx(mortality_probability(Gender::Male, 50), 0.003);
        assert_approx(mortality_probability(Gender::Female, 110), 1.0);
    }

    #[test]
    fn unmodeled_care_ages_have_zero_incidence() {
        assert_eq!(care_incidence(64), [0.0; 5]);
        assert_eq!(care_incidence(40), [0.0; 5]);
        assert_approx(care_incidence(65)[0], 0.012);
        assert_approx(care_incidence(83)[1], 0.032);
        assert_approx(care_incidence(104)[4], 0.015);
    }

    #[test]
    fn top_grade_never_progresses() {
        assert_approx(care_progression_probability(5), 0.0);
        assert_approx(care_progression_probability(0), 0.0);
        assert_approx(care_progression_probability(1), 0.15);
    }
}
