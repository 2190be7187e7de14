use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerMode {
    Block,
    RegimeMarkov,
    RegimeIid,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StressPreset {
    None,
    Stagflation70s,
    DoubleBear00s,
    /// Three years of shifted, widened equity returns with an inflation floor.
    InflationSpike3y,
    /// Three forced equity losses followed by two years of capped rebounds.
    ForcedDrawdown3y,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CareModel {
    /// Duration drawn at trigger; forced exit once it elapses.
    Acute,
    /// Open-ended until death.
    Chronic,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PensionIndexing {
    Inflation,
    Wage,
    Fixed,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PersonConfig {
    pub gender: Gender,
    pub start_age: u32,
    pub pension_monthly: f64,
    /// Simulation year in which the pension starts paying.
    pub pension_start_offset: u32,
    pub pension_tax_rate: f64,
    /// Share of this pension paid on to the surviving partner, in percent.
    pub survivor_pension_pct: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CareGradeConfig {
    /// Additional annual floor need in start-year money.
    pub additional_floor: f64,
    /// Share of the person's discretionary spending kept while in care, 0..=1.
    pub flex_cut: f64,
    pub mortality_factor: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CareConfig {
    pub enabled: bool,
    pub model: CareModel,
    pub grades: [CareGradeConfig; 5],
    pub ramp_years: u32,
    /// Household floor ceiling in start-year money; caps the additional care need.
    pub max_floor: f64,
    /// Care cost growth on top of inflation, as a fraction per year.
    pub cost_drift: f64,
    pub acute_min_years: u32,
    pub acute_max_years: u32,
}

impl Default for CareConfig {
    fn default() -> Self {
        let grade = |additional_floor, flex_cut, mortality_factor| CareGradeConfig {
            additional_floor,
            flex_cut,
            mortality_factor,
        };
        Self {
            enabled: true,
            model: CareModel::Chronic,
            grades: [
                grade(6_000.0, 0.9, 1.2),
                grade(12_000.0, 0.7, 1.5),
                grade(18_000.0, 0.5, 2.0),
                grade(24_000.0, 0.3, 2.5),
                grade(30_000.0, 0.1, 3.0),
            ],
            ramp_years: 3,
            max_floor: 80_000.0,
            cost_drift: 0.01,
            acute_min_years: 1,
            acute_max_years: 5,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PortfolioConfig {
    /// Equity lot bought under the old tax regime.
    pub equity_old: f64,
    pub equity_old_cost_basis: f64,
    pub equity_new: f64,
    pub equity_new_cost_basis: f64,
    pub gold: f64,
    pub gold_cost_basis: f64,
    pub gold_tax_free: bool,
    pub cash: f64,
    pub money_market: f64,
    pub church_tax_pct: f64,
    /// Annual tax-free allowance on realised gains.
    pub tax_allowance: f64,
    pub equity_partial_exemption: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StrategyConfig {
    pub runway_min_months: f64,
    pub runway_target_months: f64,
    pub target_equity_pct: f64,
    pub rebalance_band_pct: f64,
    pub max_skim_pct: f64,
    pub max_bear_refill_pct: f64,
    pub gold_target_pct: f64,
    /// Share of the gold target that ordinary sales must leave in place.
    pub gold_floor_pct: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimConfig {
    pub portfolio: PortfolioConfig,
    pub strategy: StrategyConfig,
    pub floor_annual: f64,
    pub flex_annual: f64,
    pub person1: PersonConfig,
    pub person2: Option<PersonConfig>,
    pub pension_indexing: PensionIndexing,
    pub fixed_pension_adjustment_pct: f64,
    pub care: CareConfig,
    pub sampler: SamplerMode,
    pub block_size: u32,
    pub stress: StressPreset,
    pub max_years: u32,
    pub runs: u32,
    pub seed: u64,
    pub break_on_ruin: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max} (got {value})")]
    RangeViolation {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("{field} must be finite and >= 0 (got {value})")]
    NegativeAmount { field: &'static str, value: f64 },
    #[error("{0}")]
    Inconsistent(&'static str),
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::RangeViolation {
            field,
            min,
            max,
            value,
        })
    }
}

fn check_amount(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NegativeAmount { field, value })
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("runwayMinMonths", self.runway_min_months, 0.0, 120.0)?;
        check_range("runwayTargetMonths", self.runway_target_months, 0.0, 120.0)?;
        check_range("targetEquityPct", self.target_equity_pct, 0.0, 100.0)?;
        check_range("rebalanceBandPct", self.rebalance_band_pct, 0.0, 50.0)?;
        check_range("maxSkimPct", self.max_skim_pct, 0.0, 100.0)?;
        check_range("maxBearRefillPct", self.max_bear_refill_pct, 0.0, 100.0)?;
        check_range("goldTargetPct", self.gold_target_pct, 0.0, 30.0)?;
        check_range("goldFloorPct", self.gold_floor_pct, 0.0, 100.0)?;
        if self.runway_min_months > self.runway_target_months {
            return Err(ConfigError::Inconsistent(
                "runwayMinMonths must be <= runwayTargetMonths",
            ));
        }
        Ok(())
    }
}

impl CareConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_amount("careMaxFloor", self.max_floor)?;
        check_range("careCostDrift", self.cost_drift, -0.5, 0.5)?;
        for grade in &self.grades {
            check_amount("careAdditionalFloor", grade.additional_floor)?;
            check_range("careFlexCut", grade.flex_cut, 0.0, 1.0)?;
            check_range("careMortalityFactor", grade.mortality_factor, 1.0, 20.0)?;
        }
        if self.acute_min_years > self.acute_max_years {
            return Err(ConfigError::Inconsistent(
                "acuteMinYears must be <= acuteMaxYears",
            ));
        }
        Ok(())
    }
}

impl PersonConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("startAge", self.start_age as f64, 18.0, 110.0)?;
        check_amount("pensionMonthly", self.pension_monthly)?;
        check_range("pensionTaxRate", self.pension_tax_rate, 0.0, 1.0)?;
        check_range("survivorPensionPct", self.survivor_pension_pct, 0.0, 100.0)
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.portfolio;
        check_amount("equityOld", p.equity_old)?;
        check_amount("equityOldCostBasis", p.equity_old_cost_basis)?;
        check_amount("equityNew", p.equity_new)?;
        check_amount("equityNewCostBasis", p.equity_new_cost_basis)?;
        check_amount("gold", p.gold)?;
        check_amount("goldCostBasis", p.gold_cost_basis)?;
        check_amount("cash", p.cash)?;
        check_amount("moneyMarket", p.money_market)?;
        check_amount("taxAllowance", p.tax_allowance)?;
        check_range("churchTaxPct", p.church_tax_pct, 0.0, 10.0)?;
        check_range(
            "equityPartialExemption",
            p.equity_partial_exemption,
            0.0,
            1.0,
        )?;

        self.strategy.validate()?;
        self.care.validate()?;
        self.person1.validate()?;
        if let Some(p2) = &self.person2 {
            p2.validate()?;
        }

        check_amount("floorAnnual", self.floor_annual)?;
        check_amount("flexAnnual", self.flex_annual)?;
        check_range(
            "fixedPensionAdjustmentPct",
            self.fixed_pension_adjustment_pct,
            -10.0,
            20.0,
        )?;
        if self.block_size == 0 {
            return Err(ConfigError::Inconsistent("blockSize must be > 0"));
        }
        if self.max_years == 0 {
            return Err(ConfigError::Inconsistent("maxYears must be > 0"));
        }
        if self.runs == 0 {
            return Err(ConfigError::Inconsistent("runs must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_config() -> SimConfig {
    SimConfig {
        portfolio: PortfolioConfig {
            equity_old: 250_000.0,
            equity_old_cost_basis: 120_000.0,
            equity_new: 400_000.0,
            equity_new_cost_basis: 380_000.0,
            gold: 60_000.0,
            gold_cost_basis: 50_000.0,
            gold_tax_free: true,
            cash: 60_000.0,
            money_market: 30_000.0,
            church_tax_pct: 0.0,
            tax_allowance: 1_000.0,
            equity_partial_exemption: 0.3,
        },
        strategy: StrategyConfig {
            runway_min_months: 24.0,
            runway_target_months: 36.0,
            target_equity_pct: 75.0,
            rebalance_band_pct: 20.0,
            max_skim_pct: 25.0,
            max_bear_refill_pct: 50.0,
            gold_target_pct: 7.5,
            gold_floor_pct: 50.0,
        },
        floor_annual: 24_000.0,
        flex_annual: 12_000.0,
        person1: PersonConfig {
            gender: Gender::Male,
            start_age: 63,
            pension_monthly: 1_200.0,
            pension_start_offset: 4,
            pension_tax_rate: 0.15,
            survivor_pension_pct: 0.0,
        },
        person2: None,
        pension_indexing: PensionIndexing::Inflation,
        fixed_pension_adjustment_pct: 2.0,
        care: CareConfig::default(),
        sampler: SamplerMode::Block,
        block_size: 5,
        stress: StressPreset::None,
        max_years: 30,
        runs: 40,
        seed: 1234,
        break_on_ruin: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_is_valid() {
        assert_eq!(sample_config().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_runway_min_above_target() {
        let mut cfg = sample_config();
        cfg.strategy.runway_min_months = 48.0;
        cfg.strategy.runway_target_months = 36.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Inconsistent(msg)) if msg.contains("runwayMinMonths")
        ));
    }

    #[test]
    fn validate_rejects_gold_target_above_thirty() {
        let mut cfg = sample_config();
        cfg.strategy.gold_target_pct = 31.0;
        let err = cfg.validate().expect_err("gold target out of range");
        assert!(err.to_string().contains("goldTargetPct"));
    }

    #[test]
    fn validate_rejects_non_finite_amounts() {
        let mut cfg = sample_config();
        cfg.portfolio.cash = f64::NAN;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NegativeAmount { field: "cash", .. })
        ));
    }

    #[test]
    fn validate_checks_partner_when_present() {
        let mut cfg = sample_config();
        let mut partner = cfg.person1;
        partner.pension_tax_rate = 1.5;
        cfg.person2 = Some(partner);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_survivor_share_above_hundred() {
        let mut cfg = sample_config();
        cfg.person1.survivor_pension_pct = 120.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::RangeViolation {
                field: "survivorPensionPct",
                ..
            })
        ));
    }

    #[test]
    fn config_is_cheap_to_copy_for_overrides() {
        let base = sample_config();
        let mut variant = base;
        variant.strategy.runway_target_months = 48.0;
        assert_ne!(base.strategy.runway_target_months, 48.0);
        assert_eq!(variant.seed, base.seed);
    }
}
