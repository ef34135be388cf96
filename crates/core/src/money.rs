//! Monetary primitives.
//!
//! Amounts are integers in the smallest currency unit (cents). No floats in
//! monetary code; percentages are expressed in basis points.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Supported settlement currencies (closed set, no FX conversion).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Mxn,
    Usd,
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Currency::Mxn => write!(f, "MXN"),
            Currency::Usd => write!(f, "USD"),
        }
    }
}

/// Basis points, 1/100th of a percent (500 = 5.00%).
pub type BasisPoints = u32;

/// Apply a basis-point fee to an amount, rounding the fee down.
///
/// Returns `(net, fee)` where `net + fee == amount`.
pub fn apply_fee_bps(amount: u64, fee_bps: BasisPoints) -> DomainResult<(u64, u64)> {
    if fee_bps > 10_000 {
        return Err(DomainError::validation(format!(
            "fee of {fee_bps} bps exceeds 100%"
        )));
    }
    let fee = (u128::from(amount) * u128::from(fee_bps) / 10_000) as u64;
    Ok((amount - fee, fee))
}

/// Checked addition surfacing overflow as a validation error.
pub fn checked_add(a: u64, b: u64) -> DomainResult<u64> {
    a.checked_add(b)
        .ok_or_else(|| DomainError::validation("amount overflow"))
}
