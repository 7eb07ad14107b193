//! Clock rate controller
//!
//! [`ClockController`] ties the [solver](crate::solver) and the
//! [sequencer](crate::pll) to the state of one PLL. Every operation takes the
//! controller's own lock and keeps it until it returns, lock wait included,
//! so rate requests, cap updates and power transitions coming from different
//! contexts are applied one at a time. The lock is any
//! [`lock_api::RawMutex`], [`RawSpinlock`] by default; interrupts stay
//! enabled while it is held. The register bus, power domain and delay must
//! not call back into the controller.
//!
//! Requested rates and the target programmed into the hardware are
//! decoupled: [`ClockController::set_target`] only records a target, while
//! [`ClockController::apply`] programs it once the power domain is up.
//!
//! ## Units
//!
//! The PLL output feeds a fixed divide-by-two stage. Rates passed to and
//! returned from the controller are *external* rates, after that stage; the
//! solver and the bounds work on the PLL output. See
//! [`external_to_internal`] and [`internal_to_external`].
//!
//! ## Usage
//! ```
//! use core::convert::Infallible;
//! use core::sync::atomic::AtomicBool;
//! use embedded_hal::delay::DelayNs;
//! use fugit::HertzU32;
//! use pllctl::clocks::{common_configs::GK20A_GPCPLL, ClockController};
//! use pllctl::register::RegisterIo;
//!
//! // A register bus on which the PLL is always locked.
//! struct AlwaysLocked;
//!
//! impl RegisterIo for AlwaysLocked {
//!     type Error = Infallible;
//!
//!     fn read(&mut self, _address: u32) -> Result<u32, Infallible> {
//!         Ok(1 << 17)
//!     }
//!
//!     fn write(&mut self, _address: u32, _value: u32) -> Result<(), Infallible> {
//!         Ok(())
//!     }
//! }
//!
//! struct NoDelay;
//!
//! impl DelayNs for NoDelay {
//!     fn delay_ns(&mut self, _ns: u32) {}
//! }
//!
//! static POWERED: AtomicBool = AtomicBool::new(true);
//!
//! let clock: ClockController<_, _, _> =
//!     ClockController::new(GK20A_GPCPLL, AlwaysLocked, &POWERED, NoDelay).unwrap();
//! clock.init_hardware().unwrap();
//!
//! // 426 MHz external is 852 MHz at the PLL: M = 1, N = 142, PL = 1.
//! assert_eq!(clock.set_rate(HertzU32::MHz(426)).unwrap(), HertzU32::MHz(426));
//! assert!(clock.is_enabled());
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use fugit::HertzU32;
use lock_api::{Mutex, RawMutex};

use crate::bounds::{ConfigError, DividerTable, PllBounds};
use crate::pll::{HardwareFault, RegisterReadout, Sequencer, LOCK_POLL_INTERVAL_US};
use crate::register::{RegisterIo, RegisterMap};
use crate::solver::{solve, solve_at_most, Coefficients, Fit, SolveError, Solution};
use crate::sync::RawSpinlock;

/// Fixed division between the PLL output and the externally reported rate.
pub const OUTPUT_DIVIDER: u32 = 2;

/// Convert an external rate to the PLL output rate. Saturates at `u32::MAX` Hz.
pub fn external_to_internal(rate: HertzU32) -> HertzU32 {
    HertzU32::from_raw(rate.to_Hz().saturating_mul(OUTPUT_DIVIDER))
}

/// Convert a PLL output rate to the external rate, rounding down.
pub fn internal_to_external(rate: HertzU32) -> HertzU32 {
    HertzU32::from_raw(rate.to_Hz() / OUTPUT_DIVIDER)
}

/// Whether `rate` reports above `ceiling` once both are converted to
/// external rates.
fn exceeds(rate: HertzU32, ceiling: HertzU32) -> bool {
    internal_to_external(rate) > internal_to_external(ceiling)
}

/// Number of lock polls that cover `timeout_us` microseconds.
pub const fn lock_budget_for(timeout_us: u32) -> u32 {
    timeout_us / LOCK_POLL_INTERVAL_US + 1
}

/// Power domain collaborator.
///
/// Hardware is only touched while this reports `true`.
pub trait PowerDomain {
    /// Whether the domain holding the PLL is energized.
    fn is_powered(&self) -> bool;
}

impl PowerDomain for AtomicBool {
    fn is_powered(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: PowerDomain + ?Sized> PowerDomain for &T {
    fn is_powered(&self) -> bool {
        T::is_powered(self)
    }
}

/// Errors returned by [`ClockController`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// No coefficients reach the requested rate. The bounds are broken.
    Solver(SolveError),
    /// Programming or reading the hardware failed.
    Hardware(HardwareFault<E>),
    /// The power domain is off. Nothing was touched.
    PoweredOff,
}

impl<E> From<SolveError> for Error<E> {
    fn from(err: SolveError) -> Self {
        Error::Solver(err)
    }
}

impl<E> From<HardwareFault<E>> for Error<E> {
    fn from(fault: HardwareFault<E>) -> Self {
        Error::Hardware(fault)
    }
}

/// Everything the controller needs to know about the platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClockConfig {
    /// Operating envelope.
    pub bounds: PllBounds,
    /// PL index to division factor.
    pub dividers: DividerTable,
    /// Frequency of the PLL's reference input.
    pub reference: HertzU32,
    /// Maximum number of lock polls, [`LOCK_POLL_INTERVAL_US`] apart.
    pub lock_timeout_budget: u32,
    /// Coefficients assumed before the first rate request.
    pub seed: Coefficients,
    /// Register addresses.
    pub registers: RegisterMap,
}

impl ClockConfig {
    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bounds.validate()?;
        self.dividers.validate(&self.bounds.pl)?;
        if self.reference.to_Hz() == 0 {
            return Err(ConfigError::ZeroReference);
        }
        if self.lock_timeout_budget == 0 {
            return Err(ConfigError::ZeroLockBudget);
        }
        if !self.seed.within(&self.bounds) {
            return Err(ConfigError::SeedOutOfBounds);
        }
        Ok(())
    }
}

/// Known platform configurations.
pub mod common_configs {
    use fugit::HertzU32;

    use super::{lock_budget_for, ClockConfig};
    use crate::bounds::{GK20A_DIVIDERS, GK20A_GPCPLL_BOUNDS};
    use crate::register::GK20A_GPCPLL_REGISTERS;
    use crate::solver::Coefficients;

    /// GK20A GPC PLL fed from a 12 MHz reference.
    ///
    /// Starts from 12 MHz x 60 = 720 MHz and allows 5 s for lock.
    pub const GK20A_GPCPLL: ClockConfig = ClockConfig {
        bounds: GK20A_GPCPLL_BOUNDS,
        dividers: GK20A_DIVIDERS,
        reference: HertzU32::MHz(12),
        lock_timeout_budget: lock_budget_for(5_000_000),
        seed: Coefficients { m: 1, n: 60, pl: 0 },
        registers: GK20A_GPCPLL_REGISTERS,
    };
}

/// Read-only view of the controller state.
///
/// Rates are external rates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Snapshot {
    /// Coefficients of the current target.
    pub coefficients: Coefficients,
    /// Rate of the current target.
    pub rate: HertzU32,
    /// The PLL has been programmed and not disabled since.
    pub enabled: bool,
    /// Administrative ceiling.
    pub cap: HertzU32,
    /// Thermal ceiling.
    pub thermal_cap: HertzU32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct PllState {
    /// What the next programming sequence will write.
    pending: Solution,
    /// What the hardware was last programmed to, while enabled.
    committed: Option<Solution>,
}

struct Inner<R, P, D> {
    io: R,
    power: P,
    delay: D,
    state: PllState,
    cap: HertzU32,
    thermal_cap: HertzU32,
}

/// Rate controller for one PLL.
///
/// `R` is the register bus, `P` the power domain, `D` the delay used
/// while waiting for the hardware and `M` the lock serializing operations.
pub struct ClockController<R, P, D, M = RawSpinlock> {
    bounds: PllBounds,
    dividers: DividerTable,
    reference: HertzU32,
    lock_timeout_budget: u32,
    registers: RegisterMap,
    inner: Mutex<M, Inner<R, P, D>>,
}

impl<R, P, D, M> ClockController<R, P, D, M>
where
    R: RegisterIo,
    P: PowerDomain,
    D: DelayNs,
    M: RawMutex,
{
    /// Build a controller from a platform configuration.
    ///
    /// Does not touch the hardware. Both caps start at the maximum output
    /// frequency.
    pub fn new(config: ClockConfig, io: R, power: P, delay: D) -> Result<Self, ConfigError> {
        config.validate()?;

        let frequency = config
            .seed
            .output_frequency(config.reference, &config.dividers)
            .ok_or(ConfigError::SeedOutOfBounds)?;
        let max = *config.bounds.freq.end();

        Ok(ClockController {
            inner: Mutex::new(Inner {
                io,
                power,
                delay,
                state: PllState {
                    pending: Solution {
                        coefficients: config.seed,
                        frequency,
                    },
                    committed: None,
                },
                cap: max,
                thermal_cap: max,
            }),
            bounds: config.bounds,
            dividers: config.dividers,
            reference: config.reference,
            lock_timeout_budget: config.lock_timeout_budget,
            registers: config.registers,
        })
    }

    /// Releases the register bus, power domain and delay.
    pub fn free(self) -> (R, P, D) {
        let inner = self.inner.into_inner();
        (inner.io, inner.power, inner.delay)
    }

    /// Operating envelope.
    pub fn bounds(&self) -> &PllBounds {
        &self.bounds
    }

    /// PL index to division factor.
    pub fn dividers(&self) -> &DividerTable {
        &self.dividers
    }

    /// Reference input frequency.
    pub fn reference(&self) -> HertzU32 {
        self.reference
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner<R, P, D>) -> T) -> T {
        f(&mut *self.inner.lock())
    }

    /// Current target rate. No hardware access.
    pub fn get_rate(&self) -> HertzU32 {
        self.with(|inner| internal_to_external(inner.state.pending.frequency))
    }

    /// Whether the PLL is programmed and enabled.
    pub fn is_enabled(&self) -> bool {
        self.with(|inner| inner.state.committed.is_some())
    }

    /// Highest rate the PLL supports.
    pub fn max_rate(&self) -> HertzU32 {
        internal_to_external(*self.bounds.freq.end())
    }

    /// Lowest rate the PLL supports.
    pub fn min_rate(&self) -> HertzU32 {
        internal_to_external(*self.bounds.freq.start())
    }

    /// Administrative ceiling.
    pub fn cap(&self) -> HertzU32 {
        self.with(|inner| internal_to_external(inner.cap))
    }

    /// Thermal ceiling.
    pub fn thermal_cap(&self) -> HertzU32 {
        self.with(|inner| internal_to_external(inner.thermal_cap))
    }

    /// State of the controller, taken under the guard.
    pub fn snapshot(&self) -> Snapshot {
        self.with(|inner| Snapshot {
            coefficients: inner.state.pending.coefficients,
            rate: internal_to_external(inner.state.pending.frequency),
            enabled: inner.state.committed.is_some(),
            cap: internal_to_external(inner.cap),
            thermal_cap: internal_to_external(inner.thermal_cap),
        })
    }

    /// Record a new target without touching the hardware.
    ///
    /// The rate is clamped to the operating range and both caps, then
    /// rounded to the closest achievable rate that does not exceed either
    /// cap. That rate is returned.
    pub fn set_target(&self, rate: HertzU32) -> Result<HertzU32, Error<R::Error>> {
        self.with(|inner| {
            self.retarget(inner, external_to_internal(rate))?;
            Ok(internal_to_external(inner.state.pending.frequency))
        })
    }

    /// Rate [`set_target`](Self::set_target) would settle on, without
    /// changing anything.
    pub fn round_rate(&self, rate: HertzU32) -> Result<HertzU32, Error<R::Error>> {
        self.with(|inner| {
            let target = self.clamp(inner, external_to_internal(rate));
            let solution = self.solve_within_caps(inner, target)?;
            Ok(internal_to_external(solution.frequency))
        })
    }

    /// Program the current target into the hardware.
    ///
    /// Does nothing while the power domain is off, or when the PLL already
    /// runs at the target. The target stays recorded either way.
    pub fn apply(&self) -> Result<(), Error<R::Error>> {
        self.with(|inner| self.apply_locked(inner))
    }

    /// Like [`apply`](Self::apply), but fails with [`Error::PoweredOff`]
    /// while the power domain is off.
    pub fn enable(&self) -> Result<(), Error<R::Error>> {
        self.with(|inner| {
            if !inner.power.is_powered() {
                return Err(Error::PoweredOff);
            }
            self.apply_locked(inner)
        })
    }

    /// Stop the PLL. The output mux is left alone.
    ///
    /// Does nothing while the power domain is off.
    pub fn disable(&self) -> Result<(), Error<R::Error>> {
        self.with(|inner| {
            if !inner.power.is_powered() {
                return Ok(());
            }
            Sequencer::new(&mut inner.io, &mut inner.delay, self.registers).disable()?;
            inner.state.committed = None;
            Ok(())
        })
    }

    /// Set a new target and, if the PLL is enabled, program it.
    ///
    /// Returns the rate the target was rounded to.
    pub fn set_rate(&self, rate: HertzU32) -> Result<HertzU32, Error<R::Error>> {
        self.with(|inner| {
            let frequency = self.set_rate_locked(inner, external_to_internal(rate))?;
            Ok(internal_to_external(frequency))
        })
    }

    /// Set the administrative ceiling, lowering the rate if it is above it.
    pub fn set_cap(&self, rate: HertzU32) -> Result<(), Error<R::Error>> {
        self.with(|inner| {
            let cap = self.clamp_to_bounds(external_to_internal(rate));
            inner.cap = cap;
            #[cfg(feature = "defmt")]
            defmt::debug!("cap set to {}", cap);
            self.lower_to(inner, cap)
        })
    }

    /// Set the thermal ceiling, lowering the rate if it is above it.
    pub fn set_thermal_cap(&self, rate: HertzU32) -> Result<(), Error<R::Error>> {
        self.with(|inner| {
            let cap = self.clamp_to_bounds(external_to_internal(rate));
            inner.thermal_cap = cap;
            #[cfg(feature = "defmt")]
            defmt::debug!("thermal cap set to {}", cap);
            self.lower_to(inner, cap)
        })
    }

    /// Bring up the clock domain: set up the output dividers and program
    /// the current target, whatever the PLL was doing before.
    ///
    /// Call this after the power domain comes up.
    pub fn init_hardware(&self) -> Result<(), Error<R::Error>> {
        self.with(|inner| {
            if !inner.power.is_powered() {
                return Err(Error::PoweredOff);
            }
            Sequencer::new(&mut inner.io, &mut inner.delay, self.registers)
                .configure_output_divider()?;
            inner.state.committed = None;
            self.apply_locked(inner)
        })
    }

    /// Decode the PLL registers.
    pub fn read_registers(&self) -> Result<RegisterReadout, Error<R::Error>> {
        self.with(|inner| {
            if !inner.power.is_powered() {
                return Err(Error::PoweredOff);
            }
            Ok(Sequencer::new(&mut inner.io, &mut inner.delay, self.registers).readout()?)
        })
    }

    /// Measure the counted clock with the on-chip clock counter.
    ///
    /// Blocks for about 2.1 ms.
    pub fn measure_rate(&self) -> Result<HertzU32, Error<R::Error>> {
        self.with(|inner| {
            if !inner.power.is_powered() {
                return Err(Error::PoweredOff);
            }
            Ok(Sequencer::new(&mut inner.io, &mut inner.delay, self.registers)
                .measure(self.reference)?)
        })
    }

    fn clamp_to_bounds(&self, rate: HertzU32) -> HertzU32 {
        let hz = rate
            .to_Hz()
            .max(self.bounds.freq.start().to_Hz())
            .min(self.bounds.freq.end().to_Hz());
        HertzU32::from_raw(hz)
    }

    fn clamp(&self, inner: &Inner<R, P, D>, rate: HertzU32) -> HertzU32 {
        let hz = self
            .clamp_to_bounds(rate)
            .to_Hz()
            .min(inner.cap.to_Hz())
            .min(inner.thermal_cap.to_Hz());
        HertzU32::from_raw(hz)
    }

    fn retarget(&self, inner: &mut Inner<R, P, D>, rate: HertzU32) -> Result<(), Error<R::Error>> {
        let target = self.clamp(inner, rate);
        if target != inner.state.pending.frequency {
            inner.state.pending = self.solve_within_caps(inner, target)?;
        }
        Ok(())
    }

    /// Closest rate to `target`, falling back to the closest one below the
    /// caps when that lands above them.
    fn solve_within_caps(
        &self,
        inner: &Inner<R, P, D>,
        target: HertzU32,
    ) -> Result<Solution, SolveError> {
        let solution = solve(
            &self.bounds,
            &self.dividers,
            self.reference,
            target,
            Fit::Best,
        )?;
        let ceiling = HertzU32::from_raw(inner.cap.to_Hz().min(inner.thermal_cap.to_Hz()));
        if !exceeds(solution.frequency, ceiling) {
            return Ok(solution);
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("{} is above the cap, solving below {}", solution.frequency, ceiling);

        solve_at_most(&self.bounds, &self.dividers, self.reference, ceiling)
    }

    fn apply_locked(&self, inner: &mut Inner<R, P, D>) -> Result<(), Error<R::Error>> {
        if !inner.power.is_powered() {
            #[cfg(feature = "defmt")]
            defmt::debug!(
                "powered off, keeping target {}",
                inner.state.pending.frequency
            );
            return Ok(());
        }

        let pending = inner.state.pending;
        if inner.state.committed == Some(pending) {
            return Ok(());
        }

        let result = Sequencer::new(&mut inner.io, &mut inner.delay, self.registers)
            .program(pending.coefficients, self.lock_timeout_budget);
        match result {
            Ok(()) => {
                inner.state.committed = Some(pending);
                Ok(())
            }
            Err(fault) => {
                inner.state.committed = None;
                #[cfg(feature = "defmt")]
                defmt::error!("failed to set pll to {}", pending.frequency);
                Err(fault.into())
            }
        }
    }

    fn set_rate_locked(
        &self,
        inner: &mut Inner<R, P, D>,
        rate: HertzU32,
    ) -> Result<HertzU32, Error<R::Error>> {
        self.retarget(inner, rate)?;
        if inner.state.committed.is_some() {
            self.apply_locked(inner)?;
        }
        Ok(inner.state.pending.frequency)
    }

    fn lower_to(&self, inner: &mut Inner<R, P, D>, ceiling: HertzU32) -> Result<(), Error<R::Error>> {
        let pending = inner.state.pending.frequency.to_Hz();
        let committed = inner.state.committed.map_or(0, |c| c.frequency.to_Hz());
        if !exceeds(HertzU32::from_raw(pending.max(committed)), ceiling) {
            return Ok(());
        }
        self.set_rate_locked(inner, ceiling)?;
        Ok(())
    }
}
