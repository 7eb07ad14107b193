//! Phase-Locked Loop (PLL) programming sequence
//!
//! Rewriting the coefficients of a running PLL glitches its output, so the
//! [`Sequencer`] moves consumers onto the bypass path first and only hands
//! them back once the PLL reports lock:
//!
//! 1. output mux to bypass
//! 2. leave analog power-down (IDDQ), settle for 2 µs
//! 3. disable the PLL
//! 4. write M, N and PL in a single register write
//! 5. enable the PLL
//! 6. power the lock detector
//! 7. poll for lock, 100 µs between attempts
//! 8. output mux back to the VCO
//!
//! If the PLL never locks the output is left on bypass and
//! [`HardwareFault::LockTimeout`] is returned. Nothing is retried.

use embedded_hal::delay::DelayNs;
use fugit::HertzU32;
use nb::Error::{Other, WouldBlock};

use crate::bounds::DividerTable;
use crate::register::{self, RegisterIo, RegisterMap, RegisterValue};
use crate::solver::Coefficients;

/// Settle time after leaving IDDQ, in microseconds.
pub const IDDQ_SETTLE_US: u32 = 2;

/// Wait after each unsuccessful lock poll, in microseconds.
pub const LOCK_POLL_INTERVAL_US: u32 = 100;

/// Reference clock cycles the clock counter runs for.
pub const COUNTER_REFERENCE_CYCLES: u32 = 100;

/// Time given to the clock counter before it is read, in microseconds.
///
/// 100 cycles of a 12 MHz reference take about 8 µs, but the counter needs
/// well over 100 µs in practice.
pub const COUNTER_SETTLE_US: u32 = 2000;

/// Bypass divider setting used while the PLL is bypassed (divide by 31).
const BYPDIV_BY31: u32 = 0x3C;

/// VCO divider setting for no division.
const VCODIV_BY1: u32 = 0;

bitfield::bitfield! {
    /// PLL configuration register.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Cfg(u32);
    impl Debug;
    /// PLL enable.
    pub enable, set_enable: 0;
    /// Analog power-down. Set while the PLL is in IDDQ.
    pub iddq, set_iddq: 1;
    /// Lock detector power-down. Set while the detector is off.
    pub lckdet_off, set_lckdet_off: 4;
    /// The PLL has locked.
    pub locked, _: 17;
}

bitfield::bitfield! {
    /// PLL coefficient register.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Coeff(u32);
    impl Debug;
    /// Reference divider.
    pub u32, mdiv, set_mdiv: 7, 0;
    /// Feedback multiplier.
    pub u32, ndiv, set_ndiv: 15, 8;
    /// Post divider index.
    pub u32, pldiv, set_pldiv: 21, 16;
}

bitfield::bitfield! {
    /// Output mux of the PLL clock domain.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct SelVco(u32);
    impl Debug;
    /// Set: the domain runs from the VCO. Clear: from the bypass path.
    pub vco_out, set_vco_out: 0;
}

bitfield::bitfield! {
    /// Output divider setup of the PLL clock domain.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Gpc2ClkOut(u32);
    impl Debug;
    /// Divider on the bypass path.
    pub u32, bypdiv, set_bypdiv: 5, 0;
    /// Divider on the VCO path.
    pub u32, vcodiv, set_vcodiv: 13, 8;
    /// Input divide-by-4 mode of the 1/14 divider.
    pub sdiv14_indiv4, set_sdiv14_indiv4: 31;
}

bitfield::bitfield! {
    /// Clock counter configuration.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct CounterCfg(u32);
    impl Debug;
    /// Number of reference cycles to count over.
    pub u32, reference_cycles, set_reference_cycles: 15, 0;
    /// Latch the count when done.
    pub write_en, set_write_en: 16;
    /// Start counting.
    pub enable, set_enable: 20;
    /// Reset the counter.
    pub reset, set_reset: 24;
}

macro_rules! register_values {
    ($($name:ident),* $(,)?) => {
        $(
            impl RegisterValue for $name {
                #[inline]
                fn from_bits(bits: u32) -> Self {
                    $name(bits)
                }

                #[inline]
                fn bits(self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

register_values!(Cfg, Coeff, SelVco, Gpc2ClkOut, CounterCfg);

/// The hardware did not do what it was told.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HardwareFault<E> {
    /// The PLL did not lock within the polling budget. Its state is unknown.
    LockTimeout,
    /// The register transport failed.
    Io(E),
    /// The clock counter was still running when it was read.
    CounterUnstable,
}

/// Decoded PLL registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterReadout {
    /// The enable bit is set.
    pub enabled: bool,
    /// The lock bit is set.
    pub locked: bool,
    /// The output mux selects the bypass path.
    pub bypassed: bool,
    /// Coefficients currently in the coefficient register.
    pub coefficients: Coefficients,
}

impl RegisterReadout {
    /// Output frequency the programmed coefficients produce from `reference`.
    pub fn frequency(&self, reference: HertzU32, table: &DividerTable) -> Option<HertzU32> {
        self.coefficients.output_frequency(reference, table)
    }
}

/// Drives one PLL through its register interface.
///
/// The caller must hold the controller's guard and have checked that the
/// power domain is on.
pub struct Sequencer<'a, R, D> {
    io: &'a mut R,
    delay: &'a mut D,
    registers: RegisterMap,
}

impl<'a, R: RegisterIo, D: DelayNs> Sequencer<'a, R, D> {
    /// Create a sequencer borrowing the register bus and a delay provider.
    pub fn new(io: &'a mut R, delay: &'a mut D, registers: RegisterMap) -> Self {
        Sequencer {
            io,
            delay,
            registers,
        }
    }

    fn read<V: RegisterValue>(&mut self, address: u32) -> Result<V, HardwareFault<R::Error>> {
        register::read(&mut *self.io, address).map_err(HardwareFault::Io)
    }

    fn write<V: RegisterValue>(
        &mut self,
        address: u32,
        value: V,
    ) -> Result<(), HardwareFault<R::Error>> {
        register::write(&mut *self.io, address, value).map_err(HardwareFault::Io)
    }

    fn modify<V: RegisterValue>(
        &mut self,
        address: u32,
        f: impl FnOnce(&mut V),
    ) -> Result<V, HardwareFault<R::Error>> {
        register::modify(&mut *self.io, address, f).map_err(HardwareFault::Io)
    }

    /// Reprogram the PLL to `coefficients` and wait for it to lock.
    ///
    /// Polls at most `lock_timeout_budget` times (at least once), waiting
    /// [`LOCK_POLL_INTERVAL_US`] after each attempt.
    pub fn program(
        &mut self,
        coefficients: Coefficients,
        lock_timeout_budget: u32,
    ) -> Result<(), HardwareFault<R::Error>> {
        let registers = self.registers;

        // Consumers run from the bypass path while the VCO is unstable.
        self.modify(registers.sel_vco, |r: &mut SelVco| r.set_vco_out(false))?;

        let mut cfg: Cfg = self.read(registers.cfg)?;
        if cfg.iddq() {
            cfg.set_iddq(false);
            self.write(registers.cfg, cfg)?;
            self.delay.delay_us(IDDQ_SETTLE_US);
        }

        // Coefficients may only change while the PLL is disabled.
        self.modify(registers.cfg, |c: &mut Cfg| c.set_enable(false))?;

        let mut coeff = Coeff(0);
        coeff.set_mdiv(coefficients.m);
        coeff.set_ndiv(coefficients.n);
        coeff.set_pldiv(coefficients.pl);
        self.write(registers.coeff, coeff)?;

        self.modify(registers.cfg, |c: &mut Cfg| c.set_enable(true))?;

        let mut cfg: Cfg = self.read(registers.cfg)?;
        if cfg.lckdet_off() {
            cfg.set_lckdet_off(false);
            self.write(registers.cfg, cfg)?;
        }

        let mut remaining = lock_timeout_budget.max(1);
        loop {
            match self.poll_lock() {
                Ok(()) => break,
                Err(Other(fault)) => return Err(fault),
                Err(WouldBlock) => {}
            }
            self.delay.delay_us(LOCK_POLL_INTERVAL_US);
            remaining -= 1;
            if remaining == 0 {
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "pll failed to lock after {} polls (M {}, N {}, PL {})",
                    lock_timeout_budget,
                    coefficients.m,
                    coefficients.n,
                    coefficients.pl
                );
                return Err(HardwareFault::LockTimeout);
            }
        }

        self.modify(registers.sel_vco, |r: &mut SelVco| r.set_vco_out(true))?;

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "pll locked: M {}, N {}, PL {}",
            coefficients.m,
            coefficients.n,
            coefficients.pl
        );

        Ok(())
    }

    /// Check the lock bit once.
    pub fn poll_lock(&mut self) -> nb::Result<(), HardwareFault<R::Error>> {
        let cfg: Cfg = self.read(self.registers.cfg).map_err(Other)?;
        if cfg.locked() {
            Ok(())
        } else {
            Err(WouldBlock)
        }
    }

    /// Clear the enable bit. The output mux is left alone.
    pub fn disable(&mut self) -> Result<(), HardwareFault<R::Error>> {
        let cfg = self.registers.cfg;
        self.modify(cfg, |c: &mut Cfg| c.set_enable(false))?;
        Ok(())
    }

    /// Set up the output dividers of the clock domain.
    ///
    /// Done once before the PLL is first programmed.
    pub fn configure_output_divider(&mut self) -> Result<(), HardwareFault<R::Error>> {
        let address = self.registers.gpc2clk_out;
        self.modify(address, |r: &mut Gpc2ClkOut| {
            r.set_sdiv14_indiv4(true);
            r.set_vcodiv(VCODIV_BY1);
            r.set_bypdiv(BYPDIV_BY31);
        })?;
        Ok(())
    }

    /// Decode the PLL registers.
    pub fn readout(&mut self) -> Result<RegisterReadout, HardwareFault<R::Error>> {
        let registers = self.registers;
        let cfg: Cfg = self.read(registers.cfg)?;
        let coeff: Coeff = self.read(registers.coeff)?;
        let sel: SelVco = self.read(registers.sel_vco)?;

        Ok(RegisterReadout {
            enabled: cfg.enable(),
            locked: cfg.locked(),
            bypassed: !sel.vco_out(),
            coefficients: Coefficients {
                m: coeff.mdiv(),
                n: coeff.ndiv(),
                pl: coeff.pldiv(),
            },
        })
    }

    /// Measure the counted clock against `reference` with the clock counter.
    pub fn measure(&mut self, reference: HertzU32) -> Result<HertzU32, HardwareFault<R::Error>> {
        let registers = self.registers;

        let mut reset = CounterCfg(0);
        reset.set_reset(true);
        self.write(registers.counter_cfg, reset)?;

        let mut start = CounterCfg(0);
        start.set_enable(true);
        start.set_write_en(true);
        start.set_reference_cycles(COUNTER_REFERENCE_CYCLES);
        self.write(registers.counter_cfg, start)?;

        self.delay.delay_us(COUNTER_SETTLE_US);
        let first: u32 = self.read(registers.counter_count)?;
        self.delay.delay_us(LOCK_POLL_INTERVAL_US);
        let second: u32 = self.read(registers.counter_count)?;

        if first != second {
            return Err(HardwareFault::CounterUnstable);
        }

        let hz = u64::from(second) * u64::from(reference.to_Hz())
            / u64::from(COUNTER_REFERENCE_CYCLES);
        Ok(HertzU32::from_raw(u32::try_from(hz).unwrap_or(u32::MAX)))
    }
}
