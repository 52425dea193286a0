//! Banded sea-freight pricing.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::models::{RateType, ShippingRate};
use crate::store::Store;

const CUBIC_INCHES_PER_CUBIC_FOOT: u32 = 1728;
const CUBIC_FEET_DECIMALS: u32 = 3;

/// A package's dimensions together with its manifest's exchange rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeaPackage {
    pub length_inches: Decimal,
    pub width_inches: Decimal,
    pub height_inches: Decimal,
    pub exchange_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateBreakdown {
    pub cubic_feet: Decimal,
    pub rate_per_cubic_foot: Decimal,
    pub freight_cost: Decimal,
    pub processing_fee: Decimal,
    pub subtotal: Decimal,
    /// The rate actually applied; non-positive manifest rates count as 1.
    pub exchange_rate: Decimal,
    pub total: Decimal,
    pub rate_range: String,
}

pub struct SeaRateCalculator {
    /// Sea tiers, ascending by `min_cubic_feet`.
    tiers: Vec<ShippingRate>,
}

impl SeaRateCalculator {
    pub fn new(rates: Vec<ShippingRate>) -> Self {
        let mut tiers: Vec<ShippingRate> = rates
            .into_iter()
            .filter(|r| r.rate_type == RateType::Sea)
            .collect();
        tiers.sort_by(|a, b| a.min_cubic_feet.cmp(&b.min_cubic_feet));
        Self { tiers }
    }

    pub async fn from_store(store: &dyn Store) -> Result<Self> {
        let rates = store.list_rates(RateType::Sea).await?;
        tracing::debug!(tiers = rates.len(), "sea rates loaded");
        Ok(Self::new(rates))
    }

    pub fn calculate_freight_price(&self, package: &SeaPackage) -> Result<Decimal> {
        Ok(self.get_rate_breakdown(package)?.total)
    }

    pub fn get_rate_breakdown(&self, package: &SeaPackage) -> Result<RateBreakdown> {
        let cubic_feet = cubic_feet(package)?;
        let tier = self.select_tier(cubic_feet)?;

        let freight_cost = tier.price_per_cubic_foot * cubic_feet;
        let subtotal = freight_cost + tier.processing_fee;
        let exchange_rate = if package.exchange_rate > Decimal::ZERO {
            package.exchange_rate
        } else {
            Decimal::ONE
        };

        Ok(RateBreakdown {
            cubic_feet,
            rate_per_cubic_foot: tier.price_per_cubic_foot,
            freight_cost,
            processing_fee: tier.processing_fee,
            subtotal,
            exchange_rate,
            total: subtotal * exchange_rate,
            rate_range: format!(
                "{} - {}",
                tier.min_cubic_feet.normalize(),
                tier.max_cubic_feet.normalize()
            ),
        })
    }

    /// The tier containing `cubic_feet` (bounds inclusive), else the next
    /// tier above it.
    fn select_tier(&self, cubic_feet: Decimal) -> Result<&ShippingRate> {
        if let Some(tier) = self
            .tiers
            .iter()
            .find(|t| t.min_cubic_feet <= cubic_feet && cubic_feet <= t.max_cubic_feet)
        {
            return Ok(tier);
        }
        match self.tiers.iter().find(|t| t.min_cubic_feet > cubic_feet) {
            Some(tier) => {
                tracing::debug!(%cubic_feet, min = %tier.min_cubic_feet, "no exact tier, using next one up");
                Ok(tier)
            }
            None => {
                tracing::warn!(%cubic_feet, "no sea rate covers this volume");
                Err(AppError::RateNotFound { cubic_feet })
            }
        }
    }
}

/// `l * w * h / 1728`, rounded to three places with ties away from zero.
pub fn cubic_feet(package: &SeaPackage) -> Result<Decimal> {
    let dims = [
        ("length", package.length_inches),
        ("width", package.width_inches),
        ("height", package.height_inches),
    ];
    for (name, value) in dims {
        if value <= Decimal::ZERO {
            return Err(AppError::InvalidInput(format!(
                "Package {} must be greater than zero, got {}",
                name, value
            )));
        }
    }

    let volume = package
        .length_inches
        .checked_mul(package.width_inches)
        .and_then(|v| v.checked_mul(package.height_inches))
        .ok_or_else(|| AppError::InvalidInput("Package dimensions are too large".to_string()))?;
    let cubic_feet = (volume / Decimal::from(CUBIC_INCHES_PER_CUBIC_FOOT))
        .round_dp_with_strategy(CUBIC_FEET_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
    if cubic_feet.is_zero() {
        return Err(AppError::InvalidInput(
            "Package volume rounds to zero cubic feet".to_string(),
        ));
    }
    Ok(cubic_feet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn tier(min: &str, max: &str, price: &str, fee: &str) -> ShippingRate {
        ShippingRate {
            id: 0,
            rate_type: RateType::Sea,
            min_cubic_feet: d(min),
            max_cubic_feet: d(max),
            price_per_cubic_foot: d(price),
            processing_fee: d(fee),
        }
    }

    fn package(l: &str, w: &str, h: &str, rate: &str) -> SeaPackage {
        SeaPackage {
            length_inches: d(l),
            width_inches: d(w),
            height_inches: d(h),
            exchange_rate: d(rate),
        }
    }

    fn calculator() -> SeaRateCalculator {
        SeaRateCalculator::new(vec![
            tier("5.0", "10.0", "15", "10"),
            tier("0.5", "2.0", "20", "5"),
            tier("2.5", "4.0", "18", "7.5"),
        ])
    }

    #[test]
    fn test_breakdown_for_mid_tier_package() {
        // 12 x 12 x 18 in = 1.5 cubic feet
        let breakdown = calculator()
            .get_rate_breakdown(&package("12", "12", "18", "1.5"))
            .unwrap();

        assert_eq!(breakdown.cubic_feet, d("1.5"));
        assert_eq!(breakdown.freight_cost, d("30"));
        assert_eq!(breakdown.subtotal, d("35"));
        assert_eq!(breakdown.total, d("52.5"));
        assert_eq!(breakdown.rate_range, "0.5 - 2");
        assert_eq!(
            calculator().calculate_freight_price(&package("12", "12", "18", "1.5")).unwrap(),
            breakdown.total
        );
    }

    #[test]
    fn test_tier_bounds_are_inclusive() {
        // 1728 in³ * 2 = 2.0 cubic feet, the top of the first tier
        let top = calculator().get_rate_breakdown(&package("12", "12", "24", "1")).unwrap();
        assert_eq!(top.rate_per_cubic_foot, d("20"));

        // 0.5 cubic feet exactly
        let bottom = calculator().get_rate_breakdown(&package("12", "12", "6", "1")).unwrap();
        assert_eq!(bottom.rate_per_cubic_foot, d("20"));
    }

    #[test]
    fn test_gap_and_below_lowest_fall_forward() {
        // 2.25 cubic feet sits between 2.0 and 2.5
        let gap = calculator().get_rate_breakdown(&package("12", "12", "27", "1")).unwrap();
        assert_eq!(gap.rate_per_cubic_foot, d("18"));
        assert_eq!(gap.rate_range, "2.5 - 4");

        // 0.25 cubic feet is below every tier
        let small = calculator().get_rate_breakdown(&package("6", "6", "12", "1")).unwrap();
        assert_eq!(small.cubic_feet, d("0.25"));
        assert_eq!(small.rate_per_cubic_foot, d("20"));
    }

    #[test]
    fn test_above_every_tier_is_rate_not_found() {
        let err = calculator()
            .calculate_freight_price(&package("24", "24", "36", "1"))
            .unwrap_err();
        match err {
            AppError::RateNotFound { cubic_feet } => assert_eq!(cubic_feet, d("12")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(SeaRateCalculator::new(Vec::new())
            .calculate_freight_price(&package("12", "12", "12", "1"))
            .is_err());
    }

    #[test]
    fn test_non_positive_exchange_rate_counts_as_one() {
        let zero = calculator().get_rate_breakdown(&package("12", "12", "18", "0")).unwrap();
        let negative = calculator().get_rate_breakdown(&package("12", "12", "18", "-2")).unwrap();
        assert_eq!(zero.exchange_rate, Decimal::ONE);
        assert_eq!(zero.total, d("35"));
        assert_eq!(negative.total, zero.total);
    }

    #[test]
    fn test_cubic_feet_rounding_and_validation() {
        // 10 x 10 x 10 = 1000 / 1728 = 0.5787... -> 0.579
        assert_eq!(cubic_feet(&package("10", "10", "10", "1")).unwrap(), d("0.579"));
        // 0.0005 rounds away from zero to 0.001
        assert_eq!(cubic_feet(&package("0.864", "1", "1", "1")).unwrap(), d("0.001"));
        assert!(matches!(
            cubic_feet(&package("0", "10", "10", "1")),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            cubic_feet(&package("0.1", "0.1", "0.1", "1")),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_air_rates_are_ignored() {
        let mut air = tier("0", "100", "99", "99");
        air.rate_type = RateType::Air;
        let calc = SeaRateCalculator::new(vec![air, tier("0.5", "2.0", "20", "5")]);
        let breakdown = calc.get_rate_breakdown(&package("12", "12", "18", "1")).unwrap();
        assert_eq!(breakdown.rate_per_cubic_foot, d("20"));
    }

    #[tokio::test]
    async fn test_loads_sea_tiers_from_store() {
        let store = crate::store::MemoryStore::new();
        store.add_rate(tier("0.5", "2.0", "20", "5")).await;
        let calc = SeaRateCalculator::from_store(&store).await.unwrap();
        assert_eq!(
            calc.calculate_freight_price(&package("12", "12", "18", "1.5")).unwrap(),
            d("52.5")
        );
    }
}
