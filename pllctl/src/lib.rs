//! PLL frequency synthesis and glitch-free reprogramming
//!
//! This crate controls an integer M/N/PL phase-locked loop of a programmable
//! clock generator:
//!
//! * [`solver`] finds the coefficients that come closest to a requested
//!   frequency within the limits described by [`bounds`].
//! * [`pll`] reprograms a running PLL without exposing its consumers to an
//!   unlocked VCO.
//! * [`clocks`] keeps track of the target and committed rates, the
//!   administrative and thermal caps and the power state, and serializes
//!   every change behind one [`sync`] lock.
//!
//! Hardware is reached through the [`register::RegisterIo`] trait, the power
//! state through [`clocks::PowerDomain`] and delays through
//! [`embedded_hal::delay::DelayNs`], so the crate runs unchanged against real
//! registers or test doubles.
//!
//! NOTE This crate is still under active development. This API will remain volatile until 1.0.0
//!
//! # Crate features
//!
//! * **defmt** -
//!   Implement `defmt::Format` for several types and log through `defmt`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod bounds;
pub mod clocks;
pub mod pll;
pub mod register;
pub mod solver;
pub mod sync;

pub use clocks::{ClockConfig, ClockController, Error};
pub use solver::{solve, solve_at_most, Coefficients, Fit, Solution};

// Re-export crates used in pllctl's public API
pub extern crate fugit;
pub extern crate lock_api;
