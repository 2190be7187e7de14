//! Splits one household withdrawal across several accounts and plans each account's share.

use serde::{Deserialize, Serialize};

use super::guardrail::GuardrailState;
use super::portfolio::{AssetKind, Tranche, effective_tax_rate};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    #[default]
    TaxOptimized,
    Proportional,
    RunwayFirst,
}

/// Serializable per-account inputs. Tranche detail is optional; without it the account's
/// aggregate equity value and cost basis stand in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub name: String,
    pub cash: f64,
    pub money_market: f64,
    pub equity_value: f64,
    pub equity_cost_basis: f64,
    pub gold_value: f64,
    pub tranches: Vec<Tranche>,
    pub church_tax_pct: f64,
    pub runway_target_months: f64,
    pub floor_annual: f64,
    pub flex_annual: f64,
    pub pension_monthly: f64,
    pub guardrail: Option<GuardrailState>,
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

impl AccountSnapshot {
    fn equity_tranches(&self) -> impl Iterator<Item = &Tranche> {
        self.tranches.iter().filter(|t| t.kind.is_equity())
    }

    /// Equity market value and cost basis, from tranches when present.
    pub fn equity_totals(&self) -> (f64, f64) {
        if self.equity_tranches().next().is_some() {
            self.equity_tranches().fold((0.0, 0.0), |(mv, cb), t| {
                (mv + non_negative(t.market_value), cb + non_negative(t.cost_basis))
            })
        } else {
            (non_negative(self.equity_value), non_negative(self.equity_cost_basis))
        }
    }

    pub fn gold_total(&self) -> f64 {
        let from_tranches: f64 = self
            .tranches
            .iter()
            .filter(|t| t.kind == AssetKind::Gold)
            .map(|t| non_negative(t.market_value))
            .sum();
        if from_tranches > 0.0 {
            from_tranches
        } else {
            non_negative(self.gold_value)
        }
    }

    pub fn liquidity(&self) -> f64 {
        non_negative(self.cash) + non_negative(self.money_market)
    }

    pub fn asset_total(&self) -> f64 {
        self.liquidity() + self.equity_totals().0 + self.gold_total()
    }

    pub fn tax_rate(&self) -> f64 {
        effective_tax_rate(non_negative(self.church_tax_pct))
    }

    /// Marginal tax per euro sold: unrealized gain ratio times the effective rate.
    pub fn tax_per_euro(&self) -> f64 {
        let (value, cost) = self.equity_totals();
        if value <= 0.0 {
            return 0.0;
        }
        ((value - cost) / value).max(0.0) * self.tax_rate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountShare {
    pub index: usize,
    pub name: String,
    pub amount: f64,
    pub tax_per_euro: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub mode: AllocationMode,
    pub requested: f64,
    /// Need no account could cover.
    pub remaining: f64,
    pub accounts: Vec<AccountShare>,
}

/// Splits `need` across accounts. Shares are reported in input order.
pub fn allocate_household(
    need: f64,
    accounts: &[AccountSnapshot],
    mode: AllocationMode,
) -> Allocation {
    let requested = non_negative(need);
    let mut amounts = vec![0.0; accounts.len()];
    let mut remaining = requested;

    if !accounts.is_empty() && requested > 0.0 {
        match mode {
            AllocationMode::TaxOptimized => {
                let mut order: Vec<usize> = (0..accounts.len()).collect();
                order.sort_by(|&a, &b| {
                    accounts[a]
                        .tax_per_euro()
                        .total_cmp(&accounts[b].tax_per_euro())
                        .then(a.cmp(&b))
                });
                for idx in order {
                    let amount = remaining.min(accounts[idx].asset_total()).max(0.0);
                    amounts[idx] = amount;
                    remaining -= amount;
                }
                remaining = remaining.max(0.0);
            }
            AllocationMode::Proportional | AllocationMode::RunwayFirst => {
                let weights: Vec<f64> = accounts
                    .iter()
                    .map(|a| match mode {
                        AllocationMode::RunwayFirst => non_negative(a.runway_target_months),
                        _ => a.asset_total(),
                    })
                    .collect();
                let total_weight: f64 = weights.iter().sum();
                let last = accounts.len() - 1;
                let mut assigned = 0.0;
                for (idx, weight) in weights.iter().enumerate().take(last) {
                    let share = if total_weight > 0.0 {
                        weight / total_weight
                    } else {
                        1.0 / accounts.len() as f64
                    };
                    amounts[idx] = requested * share;
                    assigned += amounts[idx];
                }
                amounts[last] = requested - assigned;
                remaining = 0.0;
            }
        }
    }

    Allocation {
        mode,
        requested,
        remaining,
        accounts: accounts
            .iter()
            .zip(amounts)
            .enumerate()
            .map(|(index, (account, amount))| AccountShare {
                index,
                name: account.name.clone(),
                amount,
                tax_per_euro: account.tax_per_euro(),
            })
            .collect(),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrancheSale {
    pub tranche_id: u32,
    pub kind: AssetKind,
    pub sell_amount: f64,
    pub tax: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountWithdrawal {
    pub name: String,
    pub amount: f64,
    pub cash_used: f64,
    pub money_market_used: f64,
    /// Equity sold.
    pub sell_amount: f64,
    pub gold_sold: f64,
    pub tax_estimate: f64,
    /// Part of `amount` the account holds no assets for.
    pub unfunded: f64,
    pub sales: Vec<TrancheSale>,
}

/// Sells from `lots` in the given order until `left` is covered; returns the amount sold.
fn sell_lots<'a>(
    lots: impl Iterator<Item = &'a Tranche>,
    tax_rate: f64,
    mut left: f64,
    sales: &mut Vec<TrancheSale>,
) -> f64 {
    let mut sold_total = 0.0;
    for tranche in lots {
        if left <= 0.0 {
            break;
        }
        let sold = non_negative(tranche.market_value).min(left);
        sales.push(TrancheSale {
            tranche_id: tranche.id,
            kind: tranche.kind,
            sell_amount: sold,
            tax: sold * tranche.tax_per_euro(tax_rate),
        });
        left -= sold;
        sold_total += sold;
    }
    sold_total
}

/// Cash first, then the money-market reserve, then equity tranches cheapest-tax first
/// (earliest purchase on ties), then gold oldest first. Without tranche detail the aggregate
/// equity gain ratio prices the equity step and bare `gold_value` is sold untaxed.
pub fn plan_account_withdrawal(account: &AccountSnapshot, amount: f64) -> AccountWithdrawal {
    let amount = non_negative(amount);
    let cash_used = non_negative(account.cash).min(amount);
    let money_market_used = non_negative(account.money_market).min(amount - cash_used);
    let mut left = (amount - cash_used - money_market_used).max(0.0);
    let tax_rate = account.tax_rate();
    let mut sales = Vec::new();
    let mut tax_estimate = 0.0;

    let sell_amount = if account.equity_tranches().next().is_some() {
        let mut candidates: Vec<&Tranche> = account
            .equity_tranches()
            .filter(|t| t.market_value > 0.0)
            .collect();
        candidates.sort_by(|a, b| {
            a.tax_per_euro(tax_rate)
                .total_cmp(&b.tax_per_euro(tax_rate))
                .then(a.acquired_year.cmp(&b.acquired_year))
                .then(a.id.cmp(&b.id))
        });
        sell_lots(candidates.into_iter(), tax_rate, left, &mut sales)
    } else {
        let sold = account.equity_totals().0.min(left);
        tax_estimate += sold * account.tax_per_euro();
        sold
    };
    left = (left - sell_amount).max(0.0);

    let mut gold_lots: Vec<&Tranche> = account
        .tranches
        .iter()
        .filter(|t| t.kind == AssetKind::Gold && t.market_value > 0.0)
        .collect();
    let gold_sold = if gold_lots.is_empty() {
        account.gold_total().min(left)
    } else {
        gold_lots.sort_by_key(|t| (t.acquired_year, t.id));
        sell_lots(gold_lots.into_iter(), tax_rate, left, &mut sales)
    };
    left = (left - gold_sold).max(0.0);

    tax_estimate += sales.iter().map(|s| s.tax).sum::<f64>();

    AccountWithdrawal {
        name: account.name.clone(),
        amount,
        cash_used,
        money_market_used,
        sell_amount,
        gold_sold,
        tax_estimate,
        unfunded: left,
        sales,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdPlan {
    pub allocation: Allocation,
    pub withdrawals: Vec<AccountWithdrawal>,
    pub total_tax_estimate: f64,
    /// Allocated need the accounts' assets cannot source.
    pub total_unfunded: f64,
}

pub fn plan_household(
    need: f64,
    accounts: &[AccountSnapshot],
    mode: AllocationMode,
) -> HouseholdPlan {
    let allocation = allocate_household(need, accounts, mode);
    let withdrawals: Vec<AccountWithdrawal> = allocation
        .accounts
        .iter()
        .map(|share| plan_account_withdrawal(&accounts[share.index], share.amount))
        .collect();
    let total_tax_estimate = withdrawals.iter().map(|w| w.tax_estimate).sum();
    let total_unfunded = withdrawals.iter().map(|w| w.unfunded).sum();
    HouseholdPlan {
        allocation,
        withdrawals,
        total_tax_estimate,
        total_unfunded,
    }
}

/// Household net need: spending of all accounts minus their annual pensions.
pub fn aggregate_household_need(accounts: &[AccountSnapshot]) -> f64 {
    let spending: f64 = accounts
        .iter()
        .map(|a| non_negative(a.floor_annual) + non_negative(a.flex_annual))
        .sum();
    let pensions: f64 = accounts
        .iter()
        .map(|a| non_negative(a.pension_monthly) * 12.0)
        .sum();
    (spending - pensions).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::{Just, Strategy, prop_assert, prop_oneof, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn equity_account(name: &str, value: f64, cost: f64) -> AccountSnapshot {
        AccountSnapshot {
            name: name.to_string(),
            equity_value: value,
            equity_cost_basis: cost,
            ..AccountSnapshot::default()
        }
    }

    fn equity_lot(id: u32, mv: f64, cb: f64, year: i32) -> Tranche {
        Tranche {
            id,
            kind: AssetKind::EquityNew,
            market_value: mv,
            cost_basis: cb,
            acquired_year: year,
            partial_exemption: 0.0,
        }
    }

    #[test]
    fn oracle_tax_optimized_exhausts_cheapest_account_first() {
        let accounts = [
            equity_account("A", 300.0, 290.0),
            equity_account("B", 700.0, 100.0),
        ];
        let allocation = allocate_household(800.0, &accounts, AllocationMode::TaxOptimized);
        assert_approx(allocation.accounts[0].amount, 300.0);
        assert_approx(allocation.accounts[1].amount, 500.0);
        assert_approx(allocation.remaining, 0.0);
    }

    #[test]
    fn tax_optimized_reports_unmet_need() {
        let accounts = [equity_account("A", 300.0, 290.0)];
        let allocation = allocate_household(1_000.0, &accounts, AllocationMode::TaxOptimized);
        assert_approx(allocation.accounts[0].amount, 300.0);
        assert_approx(allocation.remaining, 700.0);
    }

    #[test]
    fn runway_first_weights_by_target_months() {
        let mut a = equity_account("A", 1_000.0, 1_000.0);
        a.runway_target_months = 12.0;
        let mut b = equity_account("B", 1_000.0, 1_000.0);
        b.runway_target_months = 36.0;
        let allocation = allocate_household(800.0, &[a, b], AllocationMode::RunwayFirst);
        assert_approx(allocation.accounts[0].amount, 200.0);
        assert_approx(allocation.accounts[1].amount, 600.0);
        assert_approx(allocation.remaining, 0.0);
    }

    #[test]
    fn zero_weights_split_evenly() {
        let accounts = [equity_account("A", 0.0, 0.0), equity_account("B", 0.0, 0.0)];
        let allocation = allocate_household(100.0, &accounts, AllocationMode::Proportional);
        assert_approx(allocation.accounts[0].amount, 50.0);
        assert_approx(allocation.accounts[1].amount, 50.0);
    }

    #[test]
    fn execution_uses_cash_then_money_market_then_cheapest_tranche() {
        let account = AccountSnapshot {
            name: "A".into(),
            cash: 100.0,
            money_market: 50.0,
            tranches: vec![
                equity_lot(1, 500.0, 100.0, 2015),
                equity_lot(2, 0.0, 0.0, 2010),
                equity_lot(3, 300.0, 300.0, 2020),
                equity_lot(4, 300.0, 300.0, 2018),
            ],
            ..AccountSnapshot::default()
        };
        let plan = plan_account_withdrawal(&account, 900.0);
        assert_approx(plan.cash_used, 100.0);
        assert_approx(plan.money_market_used, 50.0);
        assert_approx(plan.sell_amount, 750.0);

        let ids: Vec<u32> = plan.sales.iter().map(|s| s.tranche_id).collect();
        assert_eq!(ids, vec![4, 3, 1]);
        assert_approx(plan.sales[2].sell_amount, 150.0);
        assert_approx(plan.tax_estimate, 150.0 * 0.8 * effective_tax_rate(0.0));
    }

    #[test]
    fn gold_only_account_is_funded_from_gold() {
        let account = AccountSnapshot {
            name: "G".into(),
            gold_value: 10_000.0,
            ..AccountSnapshot::default()
        };
        let allocation =
            allocate_household(5_000.0, &[account.clone()], AllocationMode::TaxOptimized);
        assert_approx(allocation.accounts[0].amount, 5_000.0);

        let plan = plan_account_withdrawal(&account, allocation.accounts[0].amount);
        let sourced = plan.cash_used + plan.money_market_used + plan.sell_amount + plan.gold_sold;
        assert_approx(sourced, 5_000.0);
        assert_approx(plan.gold_sold, 5_000.0);
        assert_approx(plan.unfunded, 0.0);
        assert_approx(plan.tax_estimate, 0.0);
    }

    #[test]
    fn gold_lots_follow_equity_and_are_taxed_by_gain() {
        let gold = Tranche {
            id: 9,
            kind: AssetKind::Gold,
            market_value: 1_000.0,
            cost_basis: 500.0,
            acquired_year: 2019,
            partial_exemption: 0.0,
        };
        let account = AccountSnapshot {
            name: "A".into(),
            tranches: vec![equity_lot(1, 400.0, 400.0, 2018), gold],
            ..AccountSnapshot::default()
        };
        let plan = plan_account_withdrawal(&account, 600.0);
        assert_approx(plan.sell_amount, 400.0);
        assert_approx(plan.gold_sold, 200.0);
        let kinds: Vec<AssetKind> = plan.sales.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![AssetKind::EquityNew, AssetKind::Gold]);
        assert_approx(plan.tax_estimate, 200.0 * 0.5 * effective_tax_rate(0.0));
    }

    #[test]
    fn proportional_share_beyond_assets_is_reported_unfunded() {
        let accounts = [equity_account("A", 100.0, 100.0), equity_account("B", 900.0, 900.0)];
        let plan = plan_household(2_000.0, &accounts, AllocationMode::Proportional);
        assert_approx(plan.allocation.remaining, 0.0);
        assert_approx(plan.withdrawals[0].unfunded, 100.0);
        assert_approx(plan.withdrawals[1].unfunded, 900.0);
        assert_approx(plan.total_unfunded, 1_000.0);
    }

    #[test]
    fn flat_estimate_without_tranche_detail() {
        let mut account = equity_account("A", 1_000.0, 500.0);
        account.church_tax_pct = 8.0;
        let plan = plan_account_withdrawal(&account, 200.0);
        assert!(plan.sales.is_empty());
        assert_approx(plan.tax_estimate, 200.0 * 0.5 * effective_tax_rate(8.0));
    }

    #[test]
    fn aggregate_need_nets_out_pensions() {
        let mut a = AccountSnapshot {
            floor_annual: 20_000.0,
            flex_annual: 8_000.0,
            pension_monthly: 1_000.0,
            ..AccountSnapshot::default()
        };
        let b = AccountSnapshot {
            floor_annual: 10_000.0,
            pension_monthly: 500.0,
            ..AccountSnapshot::default()
        };
        assert_approx(aggregate_household_need(&[a.clone(), b.clone()]), 20_000.0);
        a.pension_monthly = 5_000.0;
        assert_approx(aggregate_household_need(&[a, b]), 0.0);
    }

    #[test]
    fn snapshot_parses_camel_case_with_defaults() {
        let json = r#"{
            "name": "Anna",
            "moneyMarket": 1500.5,
            "equityCostBasis": 200,
            "runwayTargetMonths": 30,
            "guardrail": { "flexRatePct": 80, "alarmActive": true, "peakRealWealth": 1e6 }
        }"#;
        let snapshot: AccountSnapshot = serde_json::from_str(json).expect("valid snapshot");
        assert_eq!(snapshot.name, "Anna");
        assert_approx(snapshot.money_market, 1_500.5);
        assert_approx(snapshot.cash, 0.0);
        assert!(snapshot.guardrail.is_some_and(|g| g.alarm_active));
        assert!(snapshot.tranches.is_empty());
    }

    fn mode_strategy() -> impl Strategy<Value = AllocationMode> {
        prop_oneof![
            Just(AllocationMode::TaxOptimized),
            Just(AllocationMode::Proportional),
            Just(AllocationMode::RunwayFirst),
        ]
    }

    proptest! {
        #[test]
        fn prop_amounts_plus_remaining_equal_request(
            mode in mode_strategy(),
            need in 0.0_f64..2_000_000.0,
            accounts in vec(
                (0.0_f64..500_000.0, 0.0_f64..500_000.0, 0.0_f64..60.0, 0.0_f64..50_000.0),
                0..5,
            ),
        ) {
            let accounts: Vec<AccountSnapshot> = accounts
                .into_iter()
                .map(|(value, cost, runway, cash)| AccountSnapshot {
                    cash,
                    equity_value: value,
                    equity_cost_basis: cost,
                    runway_target_months: runway,
                    ..AccountSnapshot::default()
                })
                .collect();
            let allocation = allocate_household(need, &accounts, mode);
            let total: f64 = allocation.accounts.iter().map(|s| s.amount).sum();
            prop_assert!((total + allocation.remaining - need).abs() <= 1e-6 * need.max(1.0));
            prop_assert!(allocation.accounts.iter().all(|s| s.amount >= -EPS));
        }
    }
}
