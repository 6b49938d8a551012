use serde::Serialize;
use tracing::debug;

use super::bootstrap::SampledPath;
use super::error::{SimError, SimResult};
use super::evolution::evolve;
use super::guardrail::GuardrailPolicy;
use super::history::HistoricalReturns;
use super::orchestrator::plan_for;
use super::policy::WithdrawalPolicy;
use super::rng::{STREAM_BACKTEST, derive_seed};
use super::types::{AdjustmentEvent, GuardrailParams, SimulationConfig, SimulationTrial};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSeries {
    /// Index 0 is the starting balance.
    pub real_balances: Vec<f64>,
    pub real_withdrawals: Vec<f64>,
    pub nominal_withdrawals: Vec<f64>,
    pub cumulative_consumption: Vec<f64>,
    pub total_consumption: f64,
    pub final_real_balance: f64,
    pub final_nominal_balance: f64,
    pub depletion_year: Option<u32>,
}

impl From<SimulationTrial> for BacktestSeries {
    fn from(trial: SimulationTrial) -> Self {
        let cumulative_consumption: Vec<f64> = trial
            .nominal_withdrawals
            .iter()
            .scan(0.0, |total, w| {
                *total += w;
                Some(*total)
            })
            .collect();
        Self {
            total_consumption: cumulative_consumption.last().copied().unwrap_or(0.0),
            final_real_balance: trial.final_real_balance(),
            final_nominal_balance: trial.nominal_balances.last().copied().unwrap_or(0.0),
            depletion_year: trial.depletion_year,
            real_balances: trial.real_balances,
            real_withdrawals: trial.real_withdrawals,
            nominal_withdrawals: trial.nominal_withdrawals,
            cumulative_consumption,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub start_year: i32,
    pub years: u32,
    pub year_labels: Vec<i32>,
    pub guardrail: BacktestSeries,
    pub baseline: BacktestSeries,
    pub guardrail_success: Vec<Option<f64>>,
    pub events: Vec<AdjustmentEvent>,
}

pub fn guardrail_backtest(
    history: &HistoricalReturns,
    config: &SimulationConfig,
    params: &GuardrailParams,
    hist_start_year: i32,
) -> SimResult<BacktestResult> {
    config.validate(history)?;
    let span = history.span_from(hist_start_year).ok_or_else(|| {
        SimError::config(format!(
            "backtest start year {hist_start_year} is outside the available history {}..={}",
            history.first_year(),
            history.last_year()
        ))
    })?;
    let years = (config.retirement_years as usize).min(span);
    let records = history.slice_from(hist_start_year)[..years].to_vec();
    let year_labels = records.iter().map(|r| r.year).collect();
    let path = SampledPath {
        records,
        block_lengths: vec![years as u32],
    };
    let plan = plan_for(config);

    let mut guardrail = WithdrawalPolicy::Guardrail(Box::new(GuardrailPolicy::new(
        history,
        config,
        params,
        config.annual_withdrawal,
        derive_seed(config.seed, STREAM_BACKTEST, hist_start_year as u64),
    )?));
    let guardrail_trial = evolve(path.clone(), &plan, &mut guardrail);

    let mut baseline = WithdrawalPolicy::fixed(params.baseline_rate * config.initial_portfolio);
    let baseline_trial = evolve(path, &plan, &mut baseline);

    let (events, mut guardrail_success) = guardrail
        .as_guardrail()
        .map(|g| (g.events().to_vec(), g.estimates().to_vec()))
        .unwrap_or_default();
    guardrail_success.resize(years, None);

    debug!(
        start_year = hist_start_year,
        years,
        events = events.len(),
        "guardrail backtest finished"
    );

    Ok(BacktestResult {
        start_year: hist_start_year,
        years: years as u32,
        year_labels,
        guardrail: guardrail_trial.into(),
        baseline: baseline_trial.into(),
        guardrail_success,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{LAST_YEAR, sample_config, synthetic_history};

    fn params() -> GuardrailParams {
        GuardrailParams {
            inner_simulations: 60,
            ..GuardrailParams::default()
        }
    }

    #[test]
    fn replays_actual_sequence_for_both_paths() {
        let history = synthetic_history();
        let config = sample_config();
        let result = guardrail_backtest(&history, &config, &params(), 1966).expect("backtest");

        assert_eq!(result.years, 30);
        assert_eq!(result.year_labels.first(), Some(&1966));
        assert_eq!(result.year_labels.last(), Some(&1995));
        assert_eq!(result.guardrail.real_balances.len(), 31);
        assert_eq!(result.guardrail_success.len(), 30);

        let base = params().baseline_rate * config.initial_portfolio;
        let live = result.baseline.depletion_year.map_or(30, |y| y as usize - 1);
        for w in &result.baseline.real_withdrawals[..live] {
            assert!((w - base).abs() < 1e-6);
        }
        let cumulative = &result.guardrail.cumulative_consumption;
        assert!(cumulative.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(
            cumulative.last().copied(),
            Some(result.guardrail.total_consumption)
        );
        assert_eq!(
            result,
            guardrail_backtest(&history, &config, &params(), 1966).expect("backtest")
        );
    }

    #[test]
    fn truncates_to_available_history() {
        let history = synthetic_history();
        let result =
            guardrail_backtest(&history, &sample_config(), &params(), LAST_YEAR - 9).expect("run");
        assert_eq!(result.years, 10);
        assert_eq!(result.year_labels.len(), 10);
        assert_eq!(result.baseline.nominal_withdrawals.len(), 10);
    }

    #[test]
    fn events_only_while_enough_years_remain() {
        let history = synthetic_history();
        let mut config = sample_config();
        config.annual_withdrawal = 90_000.0;
        let params = GuardrailParams {
            min_remaining_years: 15,
            ..params()
        };
        let result = guardrail_backtest(&history, &config, &params, 1929).expect("backtest");
        let first = result.events.first().expect("a 9% draw trips the lower guardrail");
        assert_eq!(first.year, 1);
        assert!(first.new_withdrawal < first.old_withdrawal);
        assert!(first.success_after >= first.success_before);
        for event in &result.events {
            assert!(config.retirement_years + 1 - event.year >= params.min_remaining_years);
        }
        assert!(result.guardrail_success[16..].iter().all(Option::is_none));
    }

    #[test]
    fn rejects_start_year_outside_history() {
        let history = synthetic_history();
        let err = guardrail_backtest(&history, &sample_config(), &params(), 1900)
            .expect_err("out of range");
        assert!(err.is_config());
    }
}
