use super::error::SimResult;
use super::evolution::YearContext;
use super::guardrail::GuardrailPolicy;
use super::history::HistoricalReturns;
use super::rng::{STREAM_GUARDRAIL, derive_seed};
use super::types::{SimulationConfig, WithdrawalStrategy};

/// Stateful withdrawal rule, one instance per trial. Amounts handed back to
/// the engine are nominal; `base` values are in year-1 dollars.
#[derive(Debug)]
pub enum WithdrawalPolicy<'a> {
    Fixed {
        base: f64,
    },
    Dynamic {
        base: f64,
        ceiling: f64,
        floor: f64,
        last_real: Option<f64>,
    },
    Guardrail(Box<GuardrailPolicy<'a>>),
}

impl<'a> WithdrawalPolicy<'a> {
    pub fn fixed(base: f64) -> Self {
        WithdrawalPolicy::Fixed { base }
    }

    pub fn dynamic(base: f64, ceiling: f64, floor: f64) -> Self {
        WithdrawalPolicy::Dynamic {
            base,
            ceiling,
            floor,
            last_real: None,
        }
    }

    pub fn for_trial(
        history: &'a HistoricalReturns,
        config: &'a SimulationConfig,
        trial: u64,
    ) -> SimResult<Self> {
        Ok(match &config.strategy {
            WithdrawalStrategy::Fixed => Self::fixed(config.annual_withdrawal),
            WithdrawalStrategy::Dynamic { ceiling, floor } => {
                Self::dynamic(config.annual_withdrawal, *ceiling, *floor)
            }
            WithdrawalStrategy::Guardrail(params) => {
                WithdrawalPolicy::Guardrail(Box::new(GuardrailPolicy::new(
                    history,
                    config,
                    params,
                    config.annual_withdrawal,
                    derive_seed(config.seed, STREAM_GUARDRAIL, trial),
                )?))
            }
        })
    }

    pub fn next_withdrawal(&mut self, ctx: &YearContext) -> f64 {
        match self {
            WithdrawalPolicy::Fixed { base } => *base * ctx.end_index,
            WithdrawalPolicy::Dynamic {
                base,
                ceiling,
                floor,
                last_real,
            } => {
                let real = match (*last_real, ctx.prior_real_return) {
                    (Some(prev), Some(ret)) => {
                        (prev * (1.0 + ret)).clamp(prev * (1.0 - *floor), prev * (1.0 + *ceiling))
                    }
                    (Some(prev), None) => prev,
                    (None, _) => *base,
                };
                *last_real = Some(real);
                real * ctx.end_index
            }
            WithdrawalPolicy::Guardrail(policy) => policy.next_withdrawal(ctx),
        }
    }

    pub fn as_guardrail(&self) -> Option<&GuardrailPolicy<'a>> {
        match self {
            WithdrawalPolicy::Guardrail(policy) => Some(policy.as_ref()),
            _ => None,
        }
    }
}
