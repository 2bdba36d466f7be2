//! Price/size quantization into fixed-point maker/taker amounts (spec 4.1).
//!
//! Integer (micro-unit) arithmetic stays on the wire side; everything
//! upstream of this module works in decimal `f64`. This function is the
//! only place the two meet (spec section 9, "quantization boundary").

use crate::error::CoreError;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantized {
    pub maker_amount: u64,
    pub taker_amount: u64,
}

fn round_to(x: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (x * f).round() / f
}

fn micro(x: f64) -> u64 {
    (x * 1_000_000.0).round() as u64
}

pub fn quantize(side: Side, price: f64, size: f64) -> Result<Quantized, CoreError> {
    if price <= 0.0 {
        return Err(CoreError::Quantization("price must be > 0"));
    }
    let s2 = round_to(size, 2);
    if s2 <= 0.0 {
        return Err(CoreError::Quantization("size must round to a positive value"));
    }
    let n5 = round_to(price * s2, 5);

    let (maker_amount, taker_amount) = match side {
        Side::Buy => (micro(n5), micro(s2)),
        Side::Sell => (micro(s2), micro(n5)),
    };

    if maker_amount == 0 || taker_amount == 0 {
        return Err(CoreError::Quantization("rounding produced a zero amount"));
    }

    Ok(Quantized {
        maker_amount,
        taker_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_quantizes_price_into_maker_and_size_into_taker() {
        let q = quantize(Side::Buy, 0.46, 5.0).unwrap();
        // s2 = 5.00, n5 = round(0.46*5, 5) = 2.3
        assert_eq!(q.maker_amount, 2_300_000);
        assert_eq!(q.taker_amount, 5_000_000);
    }

    #[test]
    fn sell_swaps_maker_and_taker_roles() {
        let q = quantize(Side::Sell, 0.50, 5.0).unwrap();
        assert_eq!(q.maker_amount, 5_000_000);
        assert_eq!(q.taker_amount, 2_500_000);
    }

    #[test]
    fn rejects_non_positive_price() {
        assert!(quantize(Side::Buy, 0.0, 5.0).is_err());
        assert!(quantize(Side::Buy, -0.1, 5.0).is_err());
    }

    #[test]
    fn rejects_size_rounding_to_zero() {
        assert!(quantize(Side::Buy, 0.5, 0.001).is_err());
    }

    #[test]
    fn round_trip_recovers_price_within_tolerance() {
        for &(p, s) in &[(0.46_f64, 5.0_f64), (0.01, 1.0), (0.99, 123.45)] {
            let q = quantize(Side::Buy, p, s).unwrap();
            let s2 = round_to(s, 2);
            let recovered = (q.maker_amount as f64 / 1_000_000.0) / s2;
            let expected = round_to(p * s2, 5) / s2;
            assert!((recovered - expected).abs() < 1e-6);
        }
    }
}
