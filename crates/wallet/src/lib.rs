//! Wallet module (per-user balance store, event-sourced).
//!
//! Pure domain logic only: no IO, no persistence concerns.

pub mod wallet;

pub use wallet::{FundsSource, Wallet, WalletCommand, WalletEvent, WalletId};
