use serde::{Deserialize, Serialize};

use super::error::{SimError, SimResult};
use super::history::HistoricalReturns;

pub const ALLOCATION_SUM_TOLERANCE: f64 = 0.01;

pub const BAND_PERCENTILES: [f64; 5] = [10.0, 25.0, 50.0, 75.0, 90.0];

pub const FINAL_PERCENTILES: [u32; 7] = [5, 10, 25, 50, 75, 90, 95];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRecord {
    pub year: i32,
    pub us_stock_return: f64,
    pub intl_stock_return: f64,
    pub us_bond_return: f64,
    pub inflation_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAllocation {
    pub us_stock: f64,
    pub intl_stock: f64,
    pub us_bond: f64,
}

impl AssetAllocation {
    pub fn new(us_stock: f64, intl_stock: f64, us_bond: f64) -> Self {
        Self {
            us_stock,
            intl_stock,
            us_bond,
        }
    }

    pub fn sum(&self) -> f64 {
        self.us_stock + self.intl_stock + self.us_bond
    }

    pub fn blended_return(&self, record: &ReturnRecord) -> f64 {
        self.us_stock * record.us_stock_return
            + self.intl_stock * record.intl_stock_return
            + self.us_bond * record.us_bond_return
    }

    fn validate(&self) -> SimResult<()> {
        for (label, w) in [
            ("us_stock", self.us_stock),
            ("intl_stock", self.intl_stock),
            ("us_bond", self.us_bond),
        ] {
            if !w.is_finite() || !(0.0..=1.0).contains(&w) {
                return Err(SimError::config(format!(
                    "allocation weight {label} must be between 0 and 1, got {w}"
                )));
            }
        }
        if (self.sum() - 1.0).abs() > ALLOCATION_SUM_TOLERANCE {
            return Err(SimError::config(format!(
                "allocation weights must sum to 1 (within {ALLOCATION_SUM_TOLERANCE}), got {:.4}",
                self.sum()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseRatios {
    pub us_stock: f64,
    pub intl_stock: f64,
    pub us_bond: f64,
}

impl ExpenseRatios {
    pub fn uniform(ratio: f64) -> Self {
        Self {
            us_stock: ratio,
            intl_stock: ratio,
            us_bond: ratio,
        }
    }

    pub fn blended_drag(&self, allocation: &AssetAllocation) -> f64 {
        allocation.us_stock * self.us_stock
            + allocation.intl_stock * self.intl_stock
            + allocation.us_bond * self.us_bond
    }

    fn validate(&self) -> SimResult<()> {
        for (label, r) in [
            ("us_stock", self.us_stock),
            ("intl_stock", self.intl_stock),
            ("us_bond", self.us_bond),
        ] {
            if !r.is_finite() || r < 0.0 {
                return Err(SimError::config(format!(
                    "expense ratio {label} must be non-negative, got {r}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowItem {
    pub name: String,
    /// Positive = income, negative = expense. Year-1 dollars when
    /// `inflation_adjusted`, fixed nominal dollars otherwise.
    pub amount: f64,
    pub start_year: u32,
    pub duration: u32,
    pub inflation_adjusted: bool,
}

impl CashFlowItem {
    pub fn is_active(&self, year: u32) -> bool {
        year >= self.start_year && year < self.start_year.saturating_add(self.duration)
    }

    pub fn nominal_amount(&self, year: u32, inflation_index: f64) -> f64 {
        if !self.is_active(year) {
            return 0.0;
        }
        if self.inflation_adjusted {
            self.amount * inflation_index
        } else {
            self.amount
        }
    }
}

pub fn net_cash_flow(cash_flows: &[CashFlowItem], year: u32, inflation_index: f64) -> f64 {
    cash_flows
        .iter()
        .map(|cf| cf.nominal_amount(year, inflation_index))
        .sum()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdjustmentMode {
    Amount,
    SuccessRate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailParams {
    pub target_success: f64,
    pub upper_guardrail: f64,
    pub lower_guardrail: f64,
    pub adjustment_pct: f64,
    pub adjustment_mode: AdjustmentMode,
    pub min_remaining_years: u32,
    pub baseline_rate: f64,
    pub inner_simulations: u32,
    pub cadence_years: u32,
    pub rate_grid_max: f64,
    pub rate_grid_step: f64,
}

impl Default for GuardrailParams {
    fn default() -> Self {
        Self {
            target_success: 0.80,
            upper_guardrail: 0.99,
            lower_guardrail: 0.50,
            adjustment_pct: 0.50,
            adjustment_mode: AdjustmentMode::Amount,
            min_remaining_years: 10,
            baseline_rate: 0.033,
            inner_simulations: 200,
            cadence_years: 1,
            rate_grid_max: 0.15,
            rate_grid_step: 0.0025,
        }
    }
}

impl GuardrailParams {
    pub fn validate(&self) -> SimResult<()> {
        if !(0.0..=1.0).contains(&self.lower_guardrail)
            || !(0.0..=1.0).contains(&self.upper_guardrail)
        {
            return Err(SimError::config("guardrails must be between 0 and 1"));
        }
        if !(self.lower_guardrail < self.target_success
            && self.target_success < self.upper_guardrail)
        {
            return Err(SimError::config(
                "guardrails must satisfy lower < target_success < upper",
            ));
        }
        if !(self.adjustment_pct > 0.0 && self.adjustment_pct <= 1.0) {
            return Err(SimError::config("adjustment_pct must be in (0, 1]"));
        }
        if !(self.baseline_rate.is_finite() && self.baseline_rate >= 0.0) {
            return Err(SimError::config("baseline_rate must be non-negative"));
        }
        if self.inner_simulations == 0 {
            return Err(SimError::config("inner_simulations must be > 0"));
        }
        if self.cadence_years == 0 {
            return Err(SimError::config("cadence_years must be > 0"));
        }
        if !(self.rate_grid_step > 0.0 && self.rate_grid_max > self.rate_grid_step) {
            return Err(SimError::config(
                "guardrail rate grid needs step > 0 and max > step",
            ));
        }
        self.rate_grid().map(|_| ())
    }

    pub fn rate_grid(&self) -> SimResult<Vec<f64>> {
        rate_grid(0.0, self.rate_grid_max, self.rate_grid_step)
    }
}

/// Largest rate or allocation grid a single request may evaluate.
pub const MAX_GRID_POINTS: usize = 10_000;

/// Inclusive grid `min, min+step, ..., <= max`, built by index so it
/// does not accumulate rounding drift.
pub fn rate_grid(min: f64, max: f64, step: f64) -> SimResult<Vec<f64>> {
    if !(step > 0.0) || !(max >= min) {
        return Err(SimError::config(format!(
            "rate grid needs step > 0 and min <= max, got {min}..={max} by {step}"
        )));
    }
    let intervals = (max - min) / step + 1e-9;
    if !(intervals < MAX_GRID_POINTS as f64) {
        return Err(SimError::config(format!(
            "rate grid {min}..={max} by {step} exceeds {MAX_GRID_POINTS} points"
        )));
    }
    let count = intervals.floor() as usize;
    Ok((0..=count).map(|k| min + k as f64 * step).collect())
}

#[derive(Debug, Clone, PartialEq)]
pub enum WithdrawalStrategy {
    Fixed,
    Dynamic { ceiling: f64, floor: f64 },
    Guardrail(GuardrailParams),
}

impl WithdrawalStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            WithdrawalStrategy::Fixed => "fixed",
            WithdrawalStrategy::Dynamic { .. } => "dynamic",
            WithdrawalStrategy::Guardrail(_) => "guardrail",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub initial_portfolio: f64,
    pub annual_withdrawal: f64,
    pub allocation: AssetAllocation,
    pub expense_ratios: ExpenseRatios,
    pub retirement_years: u32,
    pub min_block: u32,
    pub max_block: u32,
    pub num_simulations: u32,
    pub data_start_year: i32,
    pub strategy: WithdrawalStrategy,
    pub cash_flows: Vec<CashFlowItem>,
    pub seed: u64,
}

impl SimulationConfig {
    pub fn validate(&self, history: &HistoricalReturns) -> SimResult<()> {
        if !self.initial_portfolio.is_finite() || self.initial_portfolio <= 0.0 {
            return Err(SimError::config("initial_portfolio must be > 0"));
        }
        if !self.annual_withdrawal.is_finite() || self.annual_withdrawal < 0.0 {
            return Err(SimError::config("annual_withdrawal must be >= 0"));
        }
        self.allocation.validate()?;
        self.expense_ratios.validate()?;
        if self.retirement_years == 0 {
            return Err(SimError::config("retirement_years must be > 0"));
        }
        if self.num_simulations == 0 {
            return Err(SimError::config("num_simulations must be > 0"));
        }
        if self.min_block == 0 {
            return Err(SimError::config("min_block must be >= 1"));
        }
        if self.min_block > self.max_block {
            return Err(SimError::config(format!(
                "min_block ({}) must be <= max_block ({})",
                self.min_block, self.max_block
            )));
        }
        let span = history.span_from(self.data_start_year).ok_or_else(|| {
            SimError::config(format!(
                "data_start_year {} is outside the available history {}..={}",
                self.data_start_year,
                history.first_year(),
                history.last_year()
            ))
        })?;
        if span < self.min_block as usize {
            return Err(SimError::config(format!(
                "only {span} years of history from {} but min_block is {}",
                self.data_start_year, self.min_block
            )));
        }
        match &self.strategy {
            WithdrawalStrategy::Fixed => {}
            WithdrawalStrategy::Dynamic { ceiling, floor } => {
                if !(ceiling.is_finite() && *ceiling >= 0.0) {
                    return Err(SimError::config("dynamic_ceiling must be >= 0"));
                }
                if !(floor.is_finite() && (0.0..=1.0).contains(floor)) {
                    return Err(SimError::config("dynamic_floor must be between 0 and 1"));
                }
            }
            WithdrawalStrategy::Guardrail(params) => params.validate()?,
        }
        for cf in &self.cash_flows {
            if cf.start_year == 0 {
                return Err(SimError::config(format!(
                    "cash flow '{}' start_year is 1-indexed and must be >= 1",
                    cf.name
                )));
            }
            if !cf.amount.is_finite() {
                return Err(SimError::config(format!(
                    "cash flow '{}' amount must be finite",
                    cf.name
                )));
            }
        }
        Ok(())
    }

    pub fn initial_withdrawal_rate(&self) -> f64 {
        if self.initial_portfolio > 0.0 {
            self.annual_withdrawal / self.initial_portfolio
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationTrial {
    pub path: Vec<ReturnRecord>,
    pub block_lengths: Vec<u32>,
    /// Length `retirement_years + 1`; index 0 is the starting balance.
    pub nominal_balances: Vec<f64>,
    pub real_balances: Vec<f64>,
    pub nominal_withdrawals: Vec<f64>,
    pub real_withdrawals: Vec<f64>,
    pub depletion_year: Option<u32>,
}

impl SimulationTrial {
    pub fn depleted(&self) -> bool {
        self.depletion_year.is_some()
    }

    pub fn final_real_balance(&self) -> f64 {
        self.real_balances.last().copied().unwrap_or(0.0)
    }

    pub fn total_nominal_withdrawn(&self) -> f64 {
        self.nominal_withdrawals.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileTrajectories {
    pub p10: Vec<f64>,
    pub p25: Vec<f64>,
    pub p50: Vec<f64>,
    pub p75: Vec<f64>,
    pub p90: Vec<f64>,
}

impl PercentileTrajectories {
    pub fn bands(&self) -> [&[f64]; 5] {
        [&self.p10, &self.p25, &self.p50, &self.p75, &self.p90]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileValue {
    pub percentile: u32,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalDistribution {
    pub min: f64,
    pub mean: f64,
    pub median: f64,
    pub max: f64,
    pub percentiles: Vec<PercentileValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub num_simulations: u32,
    pub retirement_years: u32,
    pub success_rate: f64,
    pub initial_withdrawal_rate: f64,
    pub balance_percentiles: PercentileTrajectories,
    pub withdrawal_percentiles: PercentileTrajectories,
    pub withdrawal_mean: Vec<f64>,
    /// Fraction of trials depleted on or before each year (index 0 = year 1).
    pub depletion_probability: Vec<f64>,
    pub final_distribution: FinalDistribution,
}

// Withdrawal in year-1 dollars.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailState {
    pub current_withdrawal: f64,
    pub last_success: Option<f64>,
    pub last_adjustment_year: Option<u32>,
    pub remaining_years: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentEvent {
    pub year: u32,
    pub old_withdrawal: f64,
    pub new_withdrawal: f64,
    pub success_before: f64,
    pub success_after: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_grid_is_inclusive_and_drift_free() {
        let grid = rate_grid(0.0, 0.12, 0.002).expect("valid grid");
        assert_eq!(grid.len(), 61);
        assert_eq!(grid[0], 0.0);
        assert!((grid[60] - 0.12).abs() < 1e-12);
    }

    #[test]
    fn rate_grid_rejects_unbounded_steps() {
        assert!(rate_grid(0.0, 0.1, 0.0).expect_err("zero step").is_config());
        assert!(rate_grid(0.1, 0.0, 0.01).expect_err("inverted").is_config());
        assert!(rate_grid(0.0, 0.15, 1e-12).expect_err("too fine").is_config());
        assert!(rate_grid(0.0, f64::INFINITY, 0.01).expect_err("unbounded").is_config());
        let widest = rate_grid(0.0, 1.0, 1.0 / (MAX_GRID_POINTS - 1) as f64).expect("at the cap");
        assert_eq!(widest.len(), MAX_GRID_POINTS);

        let params = GuardrailParams {
            rate_grid_step: 1e-9,
            ..GuardrailParams::default()
        };
        assert!(params.validate().expect_err("too fine").is_config());
    }

    #[test]
    fn cash_flow_window_is_half_open() {
        let cf = CashFlowItem {
            name: "pension".to_string(),
            amount: 10_000.0,
            start_year: 3,
            duration: 2,
            inflation_adjusted: true,
        };
        assert!(!cf.is_active(2));
        assert!(cf.is_active(3));
        assert!(cf.is_active(4));
        assert!(!cf.is_active(5));
        assert_eq!(cf.nominal_amount(3, 1.5), 15_000.0);

        let nominal = CashFlowItem {
            inflation_adjusted: false,
            ..cf
        };
        assert_eq!(nominal.nominal_amount(3, 1.5), 10_000.0);
    }

    #[test]
    fn blended_values_use_target_weights() {
        let allocation = AssetAllocation::new(0.5, 0.3, 0.2);
        let record = ReturnRecord {
            year: 2000,
            us_stock_return: 0.10,
            intl_stock_return: 0.08,
            us_bond_return: 0.04,
            inflation_rate: 0.0,
        };
        assert!((allocation.blended_return(&record) - 0.082).abs() < 1e-12);
        let expenses = ExpenseRatios {
            us_stock: 0.01,
            intl_stock: 0.02,
            us_bond: 0.0,
        };
        assert!((expenses.blended_drag(&allocation) - 0.011).abs() < 1e-12);
    }

    #[test]
    fn guardrail_params_reject_inverted_bounds() {
        let params = GuardrailParams {
            lower_guardrail: 0.9,
            upper_guardrail: 0.6,
            ..GuardrailParams::default()
        };
        assert!(params.validate().is_err());
        assert!(GuardrailParams::default().validate().is_ok());
    }
}
