//! Risk math: margin, tiered maintenance rate, liquidation price and PnL.
//!
//! Everything here is pure. Initial margin is notional divided by leverage.
//! Maintenance margin is notional times a rate picked from a step schedule
//! over notional, so bigger positions must keep proportionally more equity.
//!
//! PnL follows the product definition: the price delta is multiplied by both
//! quantity and leverage. Quantity is already full exposure, so this counts
//! leverage twice compared to a conventional perp. It is kept for parity.

use crate::types::{Leverage, Price, Quantity, Quote, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginParams {
    pub max_leverage: Leverage,
    /// Ascending by `max_notional`. The first tier whose bound covers the
    /// notional wins.
    pub maintenance_tiers: Vec<MaintenanceTier>,
    /// Used when the notional exceeds every bounded tier.
    pub fallback_rate: Decimal,
}

impl Default for MarginParams {
    fn default() -> Self {
        Self {
            max_leverage: Leverage::new(200).unwrap_or(Leverage::ONE),
            maintenance_tiers: vec![
                MaintenanceTier {
                    max_notional: Some(dec!(50_000)),
                    rate: dec!(0.004),
                },
                MaintenanceTier {
                    max_notional: Some(dec!(250_000)),
                    rate: dec!(0.005),
                },
                MaintenanceTier {
                    max_notional: Some(dec!(1_000_000)),
                    rate: dec!(0.01),
                },
                MaintenanceTier {
                    max_notional: None,
                    rate: dec!(0.02),
                },
            ],
            fallback_rate: dec!(0.02),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTier {
    /// Inclusive upper bound. `None` means unbounded.
    pub max_notional: Option<Decimal>,
    pub rate: Decimal,
}

/// `None` when the product does not fit in a `Decimal`.
pub fn notional(entry_price: Price, quantity: Quantity) -> Option<Quote> {
    entry_price.value().checked_mul(quantity.value()).map(Quote::new)
}

pub fn initial_margin(entry_price: Price, quantity: Quantity, leverage: Leverage) -> Option<Quote> {
    let notional = notional(entry_price, quantity)?;
    notional.value().checked_div(leverage.value()).map(Quote::new)
}

pub fn maintenance_margin_rate(notional: Quote, params: &MarginParams) -> Decimal {
    for tier in &params.maintenance_tiers {
        match tier.max_notional {
            Some(max) if notional.value() <= max => return tier.rate,
            None => return tier.rate,
            Some(_) => {}
        }
    }
    params.fallback_rate
}

pub fn maintenance_margin(notional: Quote, params: &MarginParams) -> Option<Quote> {
    let rate = maintenance_margin_rate(notional, params);
    notional.value().checked_mul(rate).map(Quote::new)
}

// 3.1: extra = MM - IM. negative extra means the sizing can never be liquidated.
// "no threshold" is None, never a zero price. sizings that overflow are
// refused at admission, so None from overflow never reaches a stored position.
pub fn liquidation_price(
    side: Side,
    entry_price: Price,
    quantity: Quantity,
    leverage: Leverage,
    params: &MarginParams,
) -> Option<Price> {
    let notional = notional(entry_price, quantity)?;
    let initial = initial_margin(entry_price, quantity, leverage)?;
    let maintenance = maintenance_margin(notional, params)?;

    let extra = maintenance.value().checked_sub(initial.value())?;
    if extra < Decimal::ZERO {
        return None;
    }

    let offset = extra.checked_div(quantity.value())?;
    let liq = match side {
        Side::Long => entry_price.value().checked_add(offset)?,
        Side::Short => entry_price.value() - offset,
    };
    Price::new(liq)
}

// 3.2: (mark - entry) * qty * leverage, sign flipped for shorts.
// saturates at the Decimal bounds instead of overflowing on extreme marks.
pub fn unrealized_pnl(
    side: Side,
    entry_price: Price,
    mark_price: Price,
    quantity: Quantity,
    leverage: Leverage,
) -> Quote {
    let diff = mark_price.value() - entry_price.value();
    let pnl = diff
        .saturating_mul(quantity.value())
        .saturating_mul(leverage.value())
        .saturating_mul(side.sign());
    Quote::new(pnl)
}

/// Return on margin, in percent.
pub fn roe(pnl: Quote, margin: Quote) -> Decimal {
    if margin.value().is_zero() {
        return Decimal::ZERO;
    }
    match pnl.value().checked_div(margin.value()) {
        Some(ratio) => ratio.saturating_mul(dec!(100)),
        None if pnl.is_negative() == margin.is_negative() => Decimal::MAX,
        None => Decimal::MIN,
    }
}
#[cfg(test)]
mod tests {
    use super::*;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn qty(v: Decimal) -> Quantity {
        Quantity::new_unchecked(v)
    }

    fn lev(v: u32) -> Leverage {
        Leverage::new(v).unwrap()
    }

    #[test]
    fn margin_at_5x() {
        // 100k * 0.4 = 40k notional, 40k / 5 = 8k
        let margin = initial_margin(px(dec!(100_000)), qty(dec!(0.4)), lev(5)).unwrap();
        assert_eq!(margin.value(), dec!(8000));
    }

    #[test]
    fn oversized_notional_is_none() {
        let huge = qty(Decimal::MAX / dec!(2));
        assert!(notional(px(dec!(100_000)), huge).is_none());
        assert!(initial_margin(px(dec!(100_000)), huge, lev(5)).is_none());
        assert!(liquidation_price(Side::Long, px(dec!(100_000)), huge, lev(200), &MarginParams::default()).is_none());
    }

    #[test]
    fn pnl_saturates_instead_of_overflowing() {
        let huge = qty(Decimal::MAX / dec!(1_000));
        let long = unrealized_pnl(Side::Long, px(dec!(1)), px(dec!(100_000)), huge, lev(200));
        assert_eq!(long.value(), Decimal::MAX);
        let short = unrealized_pnl(Side::Short, px(dec!(1)), px(dec!(100_000)), huge, lev(200));
        assert_eq!(short.value(), Decimal::MIN);
        assert_eq!(roe(long, Quote::new(dec!(0.0001))), Decimal::MAX);
    }

    #[test]
    fn tier_boundaries_are_inclusive() {
        let params = MarginParams::default();
        assert_eq!(maintenance_margin_rate(Quote::new(dec!(40_000)), &params), dec!(0.004));
        assert_eq!(maintenance_margin_rate(Quote::new(dec!(50_000)), &params), dec!(0.004));
        assert_eq!(maintenance_margin_rate(Quote::new(dec!(50_000.01)), &params), dec!(0.005));
        assert_eq!(maintenance_margin_rate(Quote::new(dec!(250_000)), &params), dec!(0.005));
        assert_eq!(maintenance_margin_rate(Quote::new(dec!(1_000_000)), &params), dec!(0.01));
        assert_eq!(maintenance_margin_rate(Quote::new(dec!(5_000_000)), &params), dec!(0.02));
    }

    #[test]
    fn fallback_rate_when_all_tiers_bounded() {
        let params = MarginParams {
            maintenance_tiers: vec![MaintenanceTier {
                max_notional: Some(dec!(10)),
                rate: dec!(0.1),
            }],
            fallback_rate: dec!(0.3),
            ..MarginParams::default()
        };
        assert_eq!(maintenance_margin_rate(Quote::new(dec!(11)), &params), dec!(0.3));
    }

    #[test]
    fn liquidation_price_none_when_extra_negative() {
        let params = MarginParams::default();
        // notional 40k, MM 160, IM 8000
        let liq = liquidation_price(Side::Long, px(dec!(100_000)), qty(dec!(0.4)), lev(5), &params);
        assert!(liq.is_none());
    }

    #[test]
    fn liquidation_price_long_above_entry_when_extra_positive() {
        let params = MarginParams::default();
        // notional 2M (tier 2%), IM at 100x = 20k, MM = 40k, extra = 20k over 20 units
        let liq = liquidation_price(Side::Long, px(dec!(100_000)), qty(dec!(20)), lev(100), &params).unwrap();
        assert_eq!(liq.value(), dec!(101_000));
    }

    #[test]
    fn liquidation_price_short_below_entry() {
        let params = MarginParams::default();
        let liq = liquidation_price(Side::Short, px(dec!(100_000)), qty(dec!(20)), lev(100), &params).unwrap();
        assert_eq!(liq.value(), dec!(99_000));
    }

    #[test]
    fn liquidation_price_short_floors_to_none() {
        // 300% maintenance: the offset is larger than the entry price
        let params = MarginParams {
            maintenance_tiers: vec![MaintenanceTier {
                max_notional: None,
                rate: dec!(3),
            }],
            ..MarginParams::default()
        };
        let liq = liquidation_price(Side::Short, px(dec!(10)), qty(dec!(1)), lev(1), &params);
        assert!(liq.is_none());
    }

    #[test]
    fn extra_exactly_zero_liquidates_at_entry() {
        // 0.4% tier, 250x → IM fraction 0.004 == MMR
        let params = MarginParams {
            max_leverage: lev(500),
            ..MarginParams::default()
        };
        let liq = liquidation_price(Side::Long, px(dec!(1000)), qty(dec!(1)), lev(250), &params).unwrap();
        assert_eq!(liq.value(), dec!(1000));
    }

    #[test]
    fn pnl_scales_with_leverage() {
        let long = unrealized_pnl(Side::Long, px(dec!(100_000)), px(dec!(110_000)), qty(dec!(0.4)), lev(5));
        assert_eq!(long.value(), dec!(20_000));

        let short = unrealized_pnl(Side::Short, px(dec!(3000)), px(dec!(2900)), qty(dec!(10)), lev(10));
        assert_eq!(short.value(), dec!(10_000));
    }

    #[test]
    fn roe_percent() {
        assert_eq!(roe(Quote::new(dec!(2000)), Quote::new(dec!(8000))), dec!(25));
        assert_eq!(roe(Quote::new(dec!(5)), Quote::zero()), Decimal::ZERO);
    }
}
