use rayon::prelude::*;
use tracing::debug;

use super::bootstrap::BlockBootstrap;
use super::error::SimResult;
use super::evolution::{PortfolioPlan, evolve};
use super::history::HistoricalReturns;
use super::policy::WithdrawalPolicy;
use super::rng::{STREAM_TRIAL, stream_rng};
use super::stats::{column_means, final_distribution, trajectory_bands};
use super::types::{AggregateResult, SimulationConfig, SimulationTrial};

pub fn simulate(history: &HistoricalReturns, config: &SimulationConfig) -> SimResult<AggregateResult> {
    config.validate(history)?;
    let trials = run_trials(history, config)?;
    let result = aggregate(config, &trials);
    debug!(
        strategy = config.strategy.label(),
        trials = trials.len(),
        success_rate = result.success_rate,
        "simulation finished"
    );
    Ok(result)
}

/// Trial order. Assumes `config` is validated.
pub fn run_trials(
    history: &HistoricalReturns,
    config: &SimulationConfig,
) -> SimResult<Vec<SimulationTrial>> {
    let sampler = sampler_for(history, config)?;
    (0..config.num_simulations as u64)
        .into_par_iter()
        .map(|trial| run_trial(history, &sampler, config, trial))
        .collect()
}

pub fn sampler_for<'a>(
    history: &'a HistoricalReturns,
    config: &SimulationConfig,
) -> SimResult<BlockBootstrap<'a>> {
    BlockBootstrap::new(
        history,
        config.data_start_year,
        config.min_block,
        config.max_block,
    )
}

pub fn plan_for(config: &SimulationConfig) -> PortfolioPlan<'_> {
    PortfolioPlan {
        initial_balance: config.initial_portfolio,
        allocation: config.allocation,
        expense_ratios: config.expense_ratios,
        cash_flows: &config.cash_flows,
        horizon: config.retirement_years,
    }
}

/// One trial. The path depends only on `(config.seed, trial)`, so every
/// config sharing a seed sees the same paths.
pub fn run_trial(
    history: &HistoricalReturns,
    sampler: &BlockBootstrap<'_>,
    config: &SimulationConfig,
    trial: u64,
) -> SimResult<SimulationTrial> {
    let mut rng = stream_rng(config.seed, STREAM_TRIAL, trial);
    let path = sampler.sample(config.retirement_years as usize, &mut rng);
    let mut policy = WithdrawalPolicy::for_trial(history, config, trial)?;
    Ok(evolve(path, &plan_for(config), &mut policy))
}

pub fn aggregate(config: &SimulationConfig, trials: &[SimulationTrial]) -> AggregateResult {
    let years = config.retirement_years as usize;
    let n = trials.len().max(1) as f64;

    let survived = trials.iter().filter(|t| !t.depleted()).count();
    let mut depleted_by_year = vec![0usize; years];
    for year in trials.iter().filter_map(|t| t.depletion_year) {
        depleted_by_year[year as usize - 1] += 1;
    }
    let depletion_probability = depleted_by_year
        .iter()
        .scan(0usize, |cumulative, &count| {
            *cumulative += count;
            Some(*cumulative as f64 / n)
        })
        .collect();

    let real_withdrawals = || trials.iter().map(|t| t.real_withdrawals.as_slice());

    AggregateResult {
        num_simulations: trials.len() as u32,
        retirement_years: config.retirement_years,
        success_rate: survived as f64 / n,
        initial_withdrawal_rate: config.initial_withdrawal_rate(),
        balance_percentiles: trajectory_bands(
            trials.iter().map(|t| t.real_balances.as_slice()),
            years + 1,
        ),
        withdrawal_percentiles: trajectory_bands(real_withdrawals(), years),
        withdrawal_mean: column_means(real_withdrawals(), years),
        depletion_probability,
        final_distribution: final_distribution(
            trials.iter().map(SimulationTrial::final_real_balance).collect(),
        ),
    }
}
