use serde::Serialize;
use tracing::{debug, warn};

use super::error::{SimError, SimResult};
use super::evolution::PortfolioPlan;
use super::guardrail::ScenarioSet;
use super::history::HistoricalReturns;
use super::inversion::invert_monotone;
use super::orchestrator::{aggregate, plan_for, run_trials, sampler_for};
use super::rng::{STREAM_TRIAL, stream_rng};
use super::stats::{percentile, sorted};
use super::types::{
    AggregateResult, GuardrailParams, SimulationConfig, SimulationTrial, WithdrawalStrategy,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetrics {
    pub success_rate: f64,
    pub median_total_consumption: f64,
    pub median_final_balance: f64,
    /// 10th percentile across trials of each trial's smallest non-zero
    /// withdrawal.
    pub p10_min_withdrawal: f64,
    pub median_final_withdrawal: f64,
}

impl PolicyMetrics {
    pub fn from_trials(trials: &[SimulationTrial]) -> Self {
        let n = trials.len().max(1) as f64;
        let totals = sorted(trials.iter().map(|t| t.real_withdrawals.iter().sum()).collect());
        let finals = sorted(trials.iter().map(SimulationTrial::final_real_balance).collect());
        let minimums = sorted(
            trials
                .iter()
                .map(|t| {
                    t.real_withdrawals
                        .iter()
                        .copied()
                        .filter(|&w| w > 0.0)
                        .min_by(f64::total_cmp)
                        .unwrap_or(0.0)
                })
                .collect(),
        );
        let last = sorted(
            trials
                .iter()
                .map(|t| t.real_withdrawals.last().copied().unwrap_or(0.0))
                .collect(),
        );

        Self {
            success_rate: trials.iter().filter(|t| !t.depleted()).count() as f64 / n,
            median_total_consumption: percentile(&totals, 50.0),
            median_final_balance: percentile(&finals, 50.0),
            p10_min_withdrawal: percentile(&minimums, 10.0),
            median_final_withdrawal: percentile(&last, 50.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailComparison {
    pub initial_portfolio: f64,
    pub initial_rate: f64,
    pub baseline_withdrawal: f64,
    pub guardrail: AggregateResult,
    pub baseline: AggregateResult,
    pub guardrail_metrics: PolicyMetrics,
    pub baseline_metrics: PolicyMetrics,
}

/// Ignores `config.initial_portfolio`: both policies start from the portfolio
/// at which `annual_withdrawal` meets `target_success` on the trial paths.
pub fn compare_guardrail(
    history: &HistoricalReturns,
    config: &SimulationConfig,
    params: &GuardrailParams,
) -> SimResult<GuardrailComparison> {
    if !(config.annual_withdrawal > 0.0) {
        return Err(SimError::config(
            "guardrail comparison needs annual_withdrawal > 0",
        ));
    }
    let mut guardrail_config = SimulationConfig {
        initial_portfolio: config.annual_withdrawal,
        strategy: WithdrawalStrategy::Guardrail(params.clone()),
        ..config.clone()
    };
    guardrail_config.validate(history)?;

    let initial_rate = initial_rate_for_target(history, &guardrail_config, params)?;
    let initial_portfolio = config.annual_withdrawal / initial_rate;
    guardrail_config.initial_portfolio = initial_portfolio;
    let baseline_withdrawal = params.baseline_rate * initial_portfolio;
    let baseline_config = SimulationConfig {
        strategy: WithdrawalStrategy::Fixed,
        annual_withdrawal: baseline_withdrawal,
        ..guardrail_config.clone()
    };

    let guardrail_trials = run_trials(history, &guardrail_config)?;
    let baseline_trials = run_trials(history, &baseline_config)?;
    let comparison = GuardrailComparison {
        initial_portfolio,
        initial_rate,
        baseline_withdrawal,
        guardrail: aggregate(&guardrail_config, &guardrail_trials),
        baseline: aggregate(&baseline_config, &baseline_trials),
        guardrail_metrics: PolicyMetrics::from_trials(&guardrail_trials),
        baseline_metrics: PolicyMetrics::from_trials(&baseline_trials),
    };
    debug!(
        initial_portfolio,
        initial_rate,
        guardrail_success = comparison.guardrail_metrics.success_rate,
        baseline_success = comparison.baseline_metrics.success_rate,
        "guardrail comparison finished"
    );
    Ok(comparison)
}

// Rate r means a starting portfolio of annual_withdrawal / r, so cash flows
// keep their dollar size across the grid.
fn initial_rate_for_target(
    history: &HistoricalReturns,
    config: &SimulationConfig,
    params: &GuardrailParams,
) -> SimResult<f64> {
    let sampler = sampler_for(history, config)?;
    let years = config.retirement_years as usize;
    let scenarios = ScenarioSet::from_paths(
        (0..config.num_simulations as u64)
            .map(|trial| {
                sampler
                    .sample(years, &mut stream_rng(config.seed, STREAM_TRIAL, trial))
                    .records
            })
            .collect(),
    );
    let grid: Vec<f64> = params.rate_grid()?.into_iter().filter(|&r| r > 0.0).collect();
    let Some(&lowest) = grid.first() else {
        return Err(SimError::config("guardrail rate grid has no positive rate"));
    };

    let withdrawal = config.annual_withdrawal;
    let rate = invert_monotone(&grid, params.target_success, |rate| {
        let plan = PortfolioPlan {
            initial_balance: withdrawal / rate,
            ..plan_for(config)
        };
        scenarios.success_rate(&plan, withdrawal)
    });
    Ok(rate.unwrap_or_else(|| {
        warn!(
            target_success = params.target_success,
            lowest, "target success out of reach, starting at the lowest grid rate"
        );
        lowest
    }))
}
