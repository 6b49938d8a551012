use tracing::debug;

use super::bootstrap::BlockBootstrap;
use super::error::SimResult;
use super::evolution::{PortfolioPlan, YearContext, survives_fixed};
use super::history::HistoricalReturns;
use super::inversion::invert_monotone;
use super::rng::{STREAM_GUARDRAIL, derive_seed, stream_rng};
use super::types::{
    AdjustmentEvent, AdjustmentMode, AssetAllocation, CashFlowItem, ExpenseRatios,
    GuardrailParams, GuardrailState, ReturnRecord, SimulationConfig,
};

/// Fixed set of sampled paths reused for every candidate withdrawal of one
/// estimate, so success is monotone in the withdrawal.
#[derive(Debug, Clone)]
pub struct ScenarioSet {
    paths: Vec<Vec<ReturnRecord>>,
}

impl ScenarioSet {
    pub fn sample(sampler: &BlockBootstrap<'_>, years: usize, count: u32, seed: u64) -> Self {
        let paths = (0..count as u64)
            .map(|k| {
                sampler
                    .sample(years, &mut stream_rng(seed, STREAM_GUARDRAIL, k))
                    .records
            })
            .collect();
        Self { paths }
    }

    pub fn from_paths(paths: Vec<Vec<ReturnRecord>>) -> Self {
        Self { paths }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn success_rate(&self, plan: &PortfolioPlan<'_>, withdrawal: f64) -> f64 {
        if self.paths.is_empty() {
            return 0.0;
        }
        let survived = self
            .paths
            .iter()
            .filter(|path| survives_fixed(path, plan, withdrawal))
            .count();
        survived as f64 / self.paths.len() as f64
    }

    /// Withdrawal rate (of `plan.initial_balance`) that brings success to
    /// `target`, or `None` when no rate on the grid reaches it.
    pub fn sustainable_rate(
        &self,
        plan: &PortfolioPlan<'_>,
        grid: &[f64],
        target: f64,
    ) -> Option<f64> {
        invert_monotone(grid, target, |rate| {
            self.success_rate(plan, rate * plan.initial_balance)
        })
    }
}

/// Moves cash flows to an origin at retirement year `year`, expressed in
/// year-1 dollars. Flows that have already ended are dropped; fixed nominal
/// amounts are deflated by the inflation index at the origin.
pub fn shift_cash_flows(
    cash_flows: &[CashFlowItem],
    year: u32,
    origin_index: f64,
) -> Vec<CashFlowItem> {
    cash_flows
        .iter()
        .filter_map(|cf| {
            let end = cf.start_year.saturating_add(cf.duration);
            if end <= year {
                return None;
            }
            let first = cf.start_year.max(year);
            let amount = if cf.inflation_adjusted {
                cf.amount
            } else {
                cf.amount / origin_index
            };
            Some(CashFlowItem {
                name: cf.name.clone(),
                amount,
                start_year: first - year + 1,
                duration: end - first,
                inflation_adjusted: cf.inflation_adjusted,
            })
        })
        .collect()
}

/// `None` while `success` sits inside the closed band. SuccessRate mode moves
/// the success level toward the target and re-inverts it; an unattainable
/// level withdraws nothing.
fn adjusted_withdrawal(
    params: &GuardrailParams,
    current: f64,
    success: f64,
    balance: f64,
    sustainable: impl Fn(f64) -> Option<f64>,
) -> Option<f64> {
    if (params.lower_guardrail..=params.upper_guardrail).contains(&success) {
        return None;
    }
    let pct = params.adjustment_pct;
    Some(match params.adjustment_mode {
        AdjustmentMode::Amount => {
            let rate = sustainable(params.target_success).unwrap_or(0.0);
            current + pct * (rate * balance - current)
        }
        AdjustmentMode::SuccessRate => {
            let adjusted = success + pct * (params.target_success - success);
            sustainable(adjusted).unwrap_or(0.0) * balance
        }
    })
}

#[derive(Debug)]
pub struct GuardrailPolicy<'a> {
    sampler: BlockBootstrap<'a>,
    params: &'a GuardrailParams,
    allocation: AssetAllocation,
    expense_ratios: ExpenseRatios,
    cash_flows: &'a [CashFlowItem],
    grid: Vec<f64>,
    seed: u64,
    state: GuardrailState,
    events: Vec<AdjustmentEvent>,
    estimates: Vec<Option<f64>>,
}

impl<'a> GuardrailPolicy<'a> {
    pub fn new(
        history: &'a HistoricalReturns,
        config: &'a SimulationConfig,
        params: &'a GuardrailParams,
        initial_withdrawal: f64,
        seed: u64,
    ) -> SimResult<Self> {
        params.validate()?;
        let sampler = BlockBootstrap::new(
            history,
            config.data_start_year,
            config.min_block,
            config.max_block,
        )?;
        Ok(Self {
            sampler,
            params,
            allocation: config.allocation,
            expense_ratios: config.expense_ratios,
            cash_flows: &config.cash_flows,
            grid: params.rate_grid()?,
            seed,
            state: GuardrailState {
                current_withdrawal: initial_withdrawal,
                last_success: None,
                last_adjustment_year: None,
                remaining_years: config.retirement_years,
            },
            events: Vec::new(),
            estimates: Vec::new(),
        })
    }

    pub fn state(&self) -> &GuardrailState {
        &self.state
    }

    pub fn events(&self) -> &[AdjustmentEvent] {
        &self.events
    }

    /// Estimated success per simulated year; `None` where no review ran.
    pub fn estimates(&self) -> &[Option<f64>] {
        &self.estimates
    }

    fn review_due(&self, ctx: &YearContext) -> bool {
        ctx.remaining_years() >= self.params.min_remaining_years
            && (ctx.year - 1) % self.params.cadence_years == 0
            && ctx.start_balance > 0.0
    }

    pub fn next_withdrawal(&mut self, ctx: &YearContext) -> f64 {
        self.state.remaining_years = ctx.remaining_years();
        let estimate = if self.review_due(ctx) {
            Some(self.review(ctx))
        } else {
            None
        };
        self.estimates.push(estimate);
        self.state.current_withdrawal * ctx.end_index
    }

    /// Returns the estimate taken before any adjustment.
    fn review(&mut self, ctx: &YearContext) -> f64 {
        let remaining = ctx.remaining_years();
        let balance = ctx.start_real_balance();
        let cash_flows = shift_cash_flows(self.cash_flows, ctx.year, ctx.start_index);
        let plan = PortfolioPlan {
            initial_balance: balance,
            allocation: self.allocation,
            expense_ratios: self.expense_ratios,
            cash_flows: &cash_flows,
            horizon: remaining,
        };
        let scenarios = ScenarioSet::sample(
            &self.sampler,
            remaining as usize,
            self.params.inner_simulations,
            derive_seed(self.seed, STREAM_GUARDRAIL, ctx.year as u64),
        );

        let current = self.state.current_withdrawal;
        let success = scenarios.success_rate(&plan, current);
        self.state.last_success = Some(success);
        let grid = &self.grid;
        let adjusted = adjusted_withdrawal(self.params, current, success, balance, |target| {
            scenarios.sustainable_rate(&plan, grid, target)
        });
        let Some(new_withdrawal) = adjusted else {
            return success;
        };
        let success_after = scenarios.success_rate(&plan, new_withdrawal);

        debug!(
            year = ctx.year,
            remaining,
            success,
            success_after,
            old = current,
            new = new_withdrawal,
            "guardrail adjustment"
        );
        self.events.push(AdjustmentEvent {
            year: ctx.year,
            old_withdrawal: current,
            new_withdrawal,
            success_before: success,
            success_after,
        });
        self.state.current_withdrawal = new_withdrawal;
        self.state.last_success = Some(success_after);
        self.state.last_adjustment_year = Some(ctx.year);
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bootstrap::SampledPath;
    use crate::core::evolution::evolve;
    use crate::core::fixtures::{sample_config, synthetic_history};
    use crate::core::policy::WithdrawalPolicy;
    use crate::core::types::WithdrawalStrategy;
    use std::cell::Cell;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn band_params(mode: AdjustmentMode) -> GuardrailParams {
        GuardrailParams {
            target_success: 0.80,
            lower_guardrail: 0.50,
            upper_guardrail: 0.99,
            adjustment_pct: 0.50,
            adjustment_mode: mode,
            ..GuardrailParams::default()
        }
    }

    fn replay(params: &GuardrailParams, withdrawal: f64) -> Vec<AdjustmentEvent> {
        let history = synthetic_history();
        let mut config = sample_config();
        config.retirement_years = 25;
        config.annual_withdrawal = withdrawal;
        config.strategy = WithdrawalStrategy::Guardrail(params.clone());
        let records = history.slice_from(1960)[..25].to_vec();
        let plan = PortfolioPlan {
            initial_balance: config.initial_portfolio,
            allocation: config.allocation,
            expense_ratios: config.expense_ratios,
            cash_flows: &config.cash_flows,
            horizon: config.retirement_years,
        };
        let mut policy = WithdrawalPolicy::for_trial(&history, &config, 0).expect("policy");
        evolve(
            SampledPath {
                records,
                block_lengths: vec![25],
            },
            &plan,
            &mut policy,
        );
        policy.as_guardrail().expect("guardrail policy").events().to_vec()
    }

    #[test]
    fn shifted_cash_flows_keep_remaining_window() {
        let flows = vec![
            CashFlowItem {
                name: "pension".to_string(),
                amount: 12_000.0,
                start_year: 5,
                duration: 20,
                inflation_adjusted: true,
            },
            CashFlowItem {
                name: "annuity".to_string(),
                amount: 6_000.0,
                start_year: 1,
                duration: 10,
                inflation_adjusted: false,
            },
            CashFlowItem {
                name: "college".to_string(),
                amount: -20_000.0,
                start_year: 2,
                duration: 4,
                inflation_adjusted: true,
            },
        ];
        let shifted = shift_cash_flows(&flows, 8, 1.5);
        assert_eq!(shifted.len(), 2);
        assert_eq!(shifted[0].start_year, 1);
        assert_eq!(shifted[0].duration, 17);
        assert_eq!(shifted[0].amount, 12_000.0);
        assert_eq!(shifted[1].start_year, 1);
        assert_eq!(shifted[1].duration, 3);
        assert!((shifted[1].amount - 4_000.0).abs() < 1e-9);

        let early = shift_cash_flows(&flows, 3, 1.0);
        assert_eq!(early[0].start_year, 3);
    }

    #[test]
    fn scenario_success_falls_with_withdrawal() {
        let history = synthetic_history();
        let sampler = BlockBootstrap::new(&history, 1926, 1, 10).expect("valid");
        let scenarios = ScenarioSet::sample(&sampler, 30, 100, 3);
        let plan = PortfolioPlan {
            initial_balance: 1_000_000.0,
            allocation: AssetAllocation::new(0.6, 0.2, 0.2),
            expense_ratios: ExpenseRatios::default(),
            cash_flows: &[],
            horizon: 30,
        };
        assert_eq!(scenarios.len(), 100);
        let mut last = 1.0;
        for w in [0.0, 30_000.0, 50_000.0, 80_000.0, 150_000.0] {
            let s = scenarios.success_rate(&plan, w);
            assert!(s <= last);
            last = s;
        }
        assert_eq!(scenarios.success_rate(&plan, 0.0), 1.0);
    }

    #[test]
    fn no_adjustments_inside_min_remaining_window() {
        let history = synthetic_history();
        let params = GuardrailParams {
            min_remaining_years: 12,
            inner_simulations: 40,
            ..GuardrailParams::default()
        };
        let mut config = sample_config();
        config.retirement_years = 25;
        config.annual_withdrawal = 100_000.0;
        config.strategy = WithdrawalStrategy::Guardrail(params.clone());

        let records = history.slice_from(1960)[..25].to_vec();
        let plan = PortfolioPlan {
            initial_balance: config.initial_portfolio,
            allocation: config.allocation,
            expense_ratios: config.expense_ratios,
            cash_flows: &config.cash_flows,
            horizon: config.retirement_years,
        };
        let mut policy = WithdrawalPolicy::for_trial(&history, &config, 0).expect("policy");
        evolve(
            SampledPath {
                records,
                block_lengths: vec![25],
            },
            &plan,
            &mut policy,
        );

        let guardrail = policy.as_guardrail().expect("guardrail policy");
        assert!(!guardrail.events().is_empty(), "a 10% draw should trip the lower guardrail");
        for event in guardrail.events() {
            assert!(config.retirement_years + 1 - event.year >= params.min_remaining_years);
        }
        // Years 15..=25 have fewer than 12 years left.
        assert!(guardrail.estimates().iter().skip(14).all(Option::is_none));
    }

    #[test]
    fn estimates_on_the_band_edges_keep_the_withdrawal() {
        let calls = Cell::new(0);
        let sustainable = |_: f64| {
            calls.set(calls.get() + 1);
            Some(0.04)
        };
        for mode in [AdjustmentMode::Amount, AdjustmentMode::SuccessRate] {
            let params = band_params(mode);
            for success in [0.50, 0.80, 0.99] {
                let adjusted = adjusted_withdrawal(&params, 40_000.0, success, 1e6, sustainable);
                assert_eq!(adjusted, None, "success {success}");
            }
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn amount_mode_moves_part_way_to_target_amount() {
        let params = band_params(AdjustmentMode::Amount);
        let asked = Cell::new(f64::NAN);
        let sustainable = |target: f64| {
            asked.set(target);
            Some(0.04)
        };

        let raised = adjusted_withdrawal(&params, 10_000.0, 1.0, 1e6, sustainable)
            .expect("above the upper guardrail");
        assert_approx(asked.get(), 0.80);
        assert_approx(raised, 25_000.0);

        let cut = adjusted_withdrawal(&params, 90_000.0, 0.2, 1e6, sustainable)
            .expect("below the lower guardrail");
        assert_approx(cut, 65_000.0);

        let unattainable = adjusted_withdrawal(&params, 90_000.0, 0.2, 1e6, |_| None)
            .expect("below the lower guardrail");
        assert_approx(unattainable, 45_000.0);
    }

    #[test]
    fn success_rate_mode_reinverts_the_moved_success_level() {
        let params = band_params(AdjustmentMode::SuccessRate);
        let asked = Cell::new(f64::NAN);
        let sustainable = |target: f64| {
            asked.set(target);
            Some(0.05)
        };

        let cut = adjusted_withdrawal(&params, 90_000.0, 0.30, 800_000.0, sustainable)
            .expect("below the lower guardrail");
        assert_approx(asked.get(), 0.55);
        assert_approx(cut, 40_000.0);

        adjusted_withdrawal(&params, 10_000.0, 1.0, 800_000.0, sustainable)
            .expect("above the upper guardrail");
        assert_approx(asked.get(), 0.90);

        let unattainable = adjusted_withdrawal(&params, 90_000.0, 0.30, 800_000.0, |_| None);
        assert_eq!(unattainable, Some(0.0));
    }

    #[test]
    fn low_withdrawal_trips_upper_guardrail_and_rises() {
        let params = GuardrailParams {
            inner_simulations: 40,
            ..band_params(AdjustmentMode::Amount)
        };
        let events = replay(&params, 10_000.0);
        let first = events.first().expect("a 1% draw should trip the upper guardrail");
        assert_eq!(first.year, 1);
        assert_eq!(first.old_withdrawal, 10_000.0);
        assert!(first.success_before > params.upper_guardrail);
        assert!(first.new_withdrawal > first.old_withdrawal);
    }

    #[test]
    fn success_rate_mode_adjusts_end_to_end() {
        let params = GuardrailParams {
            inner_simulations: 40,
            ..band_params(AdjustmentMode::SuccessRate)
        };
        let events = replay(&params, 100_000.0);
        assert!(!events.is_empty(), "a 10% draw should trip the lower guardrail");
        for event in &events {
            let inside = (params.lower_guardrail..=params.upper_guardrail)
                .contains(&event.success_before);
            assert!(!inside, "year {} adjusted inside the band", event.year);
        }
        assert_eq!(events, replay(&params, 100_000.0));
    }
}
