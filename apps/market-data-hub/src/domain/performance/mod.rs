//! Portfolio Performance
//!
//! Derived, read-only valuation of a portfolio's holdings against the most
//! recent recorded price of each security. Never stored.
//!
//! A holding whose security has no recorded tick is valued at its average
//! cost: it contributes its cost basis to the total value, zero gain/loss,
//! is marked `priced = false`, and the snapshot is flagged `is_partial`.
//!
//! Arithmetic is checked: a value or total outside the `Decimal` range is a
//! `ValuationOverflow`, never a panic.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::SecurityId;
use crate::domain::trading::{Holding, PortfolioId};

/// A holding paired with its security's latest recorded price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedHolding {
    /// The holding.
    pub holding: Holding,
    /// Latest recorded price, `None` if the security has no ticks yet.
    pub last_price: Option<Decimal>,
}

/// Valuation of a single holding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingPerformance {
    /// Security held.
    pub security_id: SecurityId,
    /// Ticker symbol.
    pub symbol: String,
    /// Shares held.
    pub quantity: i64,
    /// Average acquisition cost per share.
    pub average_cost: Decimal,
    /// Price used for valuation.
    pub current_price: Decimal,
    /// `quantity * current_price`.
    pub market_value: Decimal,
    /// `market_value - cost_basis`.
    pub gain_loss: Decimal,
    /// Gain/loss as a percentage of cost basis; zero for a zero cost basis.
    pub gain_loss_percent: Decimal,
    /// Whether `current_price` came from a recorded tick.
    pub priced: bool,
}

/// Valuation of a whole portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioPerformance {
    /// Portfolio valued.
    pub portfolio_id: PortfolioId,
    /// Sum of holding market values.
    pub total_value: Decimal,
    /// Sum of holding cost bases.
    pub total_cost: Decimal,
    /// `total_value - total_cost`.
    pub total_gain_loss: Decimal,
    /// Per-holding breakdown.
    pub holdings: Vec<HoldingPerformance>,
    /// True when at least one holding had no recorded price.
    pub is_partial: bool,
}

/// A valuation that does not fit in a `Decimal`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Valuation of {subject} overflows")]
pub struct ValuationOverflow {
    /// What was being valued: a security id or `portfolio totals`.
    pub subject: String,
}

impl ValuationOverflow {
    fn of(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

impl PortfolioPerformance {
    /// Value `holdings` for `portfolio_id`.
    ///
    /// # Errors
    ///
    /// `ValuationOverflow` if any holding value or portfolio total exceeds
    /// the `Decimal` range.
    pub fn compute(
        portfolio_id: PortfolioId,
        holdings: Vec<PricedHolding>,
    ) -> Result<Self, ValuationOverflow> {
        let holdings = holdings
            .into_iter()
            .map(value_holding)
            .collect::<Result<Vec<_>, _>>()?;

        let totals = || ValuationOverflow::of("portfolio totals");
        let (total_value, total_cost) = holdings
            .iter()
            .try_fold(
                (Decimal::ZERO, Decimal::ZERO),
                |(value, cost), (h, cost_basis)| {
                    Some((
                        value.checked_add(h.market_value)?,
                        cost.checked_add(*cost_basis)?,
                    ))
                },
            )
            .ok_or_else(totals)?;
        let total_gain_loss = total_value.checked_sub(total_cost).ok_or_else(totals)?;
        let holdings: Vec<HoldingPerformance> = holdings.into_iter().map(|(h, _)| h).collect();
        let is_partial = holdings.iter().any(|h| !h.priced);

        Ok(Self {
            portfolio_id,
            total_value,
            total_cost,
            total_gain_loss,
            holdings,
            is_partial,
        })
    }
}

/// Values one holding, returning its cost basis alongside.
fn value_holding(
    priced: PricedHolding,
) -> Result<(HoldingPerformance, Decimal), ValuationOverflow> {
    let PricedHolding {
        holding,
        last_price,
    } = priced;
    let overflow = || ValuationOverflow::of(holding.security_id.as_str());

    let cost_basis = holding.cost_basis().ok_or_else(overflow)?;
    let current_price = last_price.unwrap_or(holding.average_cost);
    let market_value = current_price
        .checked_mul(Decimal::from(holding.quantity))
        .ok_or_else(overflow)?;
    let gain_loss = market_value.checked_sub(cost_basis).ok_or_else(overflow)?;
    let gain_loss_percent = if cost_basis.is_zero() {
        Decimal::ZERO
    } else {
        gain_loss
            .checked_div(cost_basis)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .ok_or_else(overflow)?
            .round_dp(4)
    };

    let performance = HoldingPerformance {
        security_id: holding.security_id,
        symbol: holding.symbol,
        quantity: holding.quantity,
        average_cost: holding.average_cost,
        current_price,
        market_value,
        gain_loss,
        gain_loss_percent,
        priced: last_price.is_some(),
    };
    Ok((performance, cost_basis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(id: &str, quantity: i64, average_cost: i64) -> Holding {
        Holding {
            security_id: SecurityId::new(id),
            symbol: id.to_string(),
            quantity,
            average_cost: Decimal::from(average_cost),
        }
    }

    #[test]
    fn values_priced_holdings() {
        let perf = PortfolioPerformance::compute(
            PortfolioId::generate(),
            vec![
                PricedHolding {
                    holding: holding("CRDB", 1000, 380),
                    last_price: Some(Decimal::from(405)),
                },
                PricedHolding {
                    holding: holding("NMB", 100, 4000),
                    last_price: Some(Decimal::from(3910)),
                },
            ],
        )
        .unwrap();

        // 1000 * 405 + 100 * 3910
        assert_eq!(perf.total_value, Decimal::from(796_000));
        // 1000 * 380 + 100 * 4000
        assert_eq!(perf.total_cost, Decimal::from(780_000));
        assert_eq!(perf.total_gain_loss, Decimal::from(16_000));
        assert!(!perf.is_partial);
        assert_eq!(perf.holdings[1].gain_loss, Decimal::from(-9000));
    }

    #[test]
    fn unpriced_holding_is_valued_at_cost_and_flagged() {
        let perf = PortfolioPerformance::compute(
            PortfolioId::generate(),
            vec![
                PricedHolding {
                    holding: holding("CRDB", 10, 400),
                    last_price: Some(Decimal::from(410)),
                },
                PricedHolding {
                    holding: holding("MKCB", 50, 120),
                    last_price: None,
                },
            ],
        )
        .unwrap();

        let unpriced = &perf.holdings[1];
        assert!(!unpriced.priced);
        assert_eq!(unpriced.current_price, Decimal::from(120));
        assert_eq!(unpriced.gain_loss, Decimal::ZERO);
        assert!(perf.is_partial);
        assert_eq!(perf.total_value, Decimal::from(4100 + 6000));
        assert_eq!(perf.total_gain_loss, Decimal::from(100));
    }

    #[test]
    fn empty_portfolio_is_zero() {
        let perf = PortfolioPerformance::compute(PortfolioId::generate(), vec![]).unwrap();
        assert_eq!(perf.total_value, Decimal::ZERO);
        assert_eq!(perf.total_gain_loss, Decimal::ZERO);
        assert!(perf.holdings.is_empty());
        assert!(!perf.is_partial);
    }

    #[test]
    fn zero_cost_basis_has_zero_percent() {
        let perf = PortfolioPerformance::compute(
            PortfolioId::generate(),
            vec![PricedHolding {
                holding: holding("TBL", 10, 0),
                last_price: Some(Decimal::from(10_900)),
            }],
        )
        .unwrap();
        assert_eq!(perf.holdings[0].gain_loss_percent, Decimal::ZERO);
    }

    #[test]
    fn oversized_holding_is_an_error() {
        let err = PortfolioPerformance::compute(
            PortfolioId::generate(),
            vec![PricedHolding {
                holding: holding("CRDB", i64::MAX, 1),
                last_price: Some(Decimal::MAX),
            }],
        )
        .unwrap_err();
        assert_eq!(err.subject, "CRDB");
    }

    #[test]
    fn overflowing_totals_are_an_error() {
        let big = || PricedHolding {
            holding: Holding {
                average_cost: Decimal::MAX,
                ..holding("CRDB", 1, 0)
            },
            last_price: None,
        };
        let err = PortfolioPerformance::compute(PortfolioId::generate(), vec![big(), big()])
            .unwrap_err();
        assert_eq!(err.subject, "portfolio totals");
    }
}
