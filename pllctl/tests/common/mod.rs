//! Test doubles for the register bus, delay and power domain.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::delay::DelayNs;
use pllctl::bounds::{PllBounds, GK20A_DIVIDERS};
use pllctl::clocks::{common_configs::GK20A_GPCPLL, ClockConfig, ClockController, PowerDomain};
use pllctl::fugit::HertzU32;
use pllctl::register::{RegisterIo, GK20A_GPCPLL_REGISTERS};

pub const CFG: u32 = GK20A_GPCPLL_REGISTERS.cfg;
pub const COEFF: u32 = GK20A_GPCPLL_REGISTERS.coeff;
pub const SEL_VCO: u32 = GK20A_GPCPLL_REGISTERS.sel_vco;
pub const GPC2CLK_OUT: u32 = GK20A_GPCPLL_REGISTERS.gpc2clk_out;
pub const COUNTER_CFG: u32 = GK20A_GPCPLL_REGISTERS.counter_cfg;
pub const COUNTER_COUNT: u32 = GK20A_GPCPLL_REGISTERS.counter_count;

pub const ENABLE: u32 = 1 << 0;
pub const IDDQ: u32 = 1 << 1;
pub const LCKDET_OFF: u32 = 1 << 4;
pub const LOCK: u32 = 1 << 17;

/// One register access seen by the fake bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read(u32),
    Write(u32, u32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusError;

/// Register file of a fake PLL.
///
/// The lock bit is computed: it reads as set once CFG has been read more
/// than `lock_after` times with the enable bit set. Clearing the enable bit
/// starts over. `None` never locks.
#[derive(Default)]
pub struct Hardware {
    pub registers: HashMap<u32, u32>,
    pub log: Vec<Access>,
    pub lock_after: Option<u32>,
    pub counter: VecDeque<u32>,
    pub fail: bool,
    enabled_reads: u32,
}

#[derive(Clone, Default)]
pub struct FakeBus(Arc<Mutex<Hardware>>);

impl FakeBus {
    /// A PLL fresh out of reset: in IDDQ, lock detector off, output on the
    /// VCO path, locking on the first poll.
    pub fn new() -> Self {
        let bus = FakeBus::default();
        {
            let mut hw = bus.hw();
            hw.lock_after = Some(1);
            hw.registers.insert(CFG, IDDQ | LCKDET_OFF);
            hw.registers.insert(SEL_VCO, 1);
        }
        bus
    }

    pub fn hw(&self) -> MutexGuard<'_, Hardware> {
        self.0.lock().unwrap()
    }

    pub fn register(&self, address: u32) -> u32 {
        self.hw().registers.get(&address).copied().unwrap_or(0)
    }

    pub fn set_register(&self, address: u32, value: u32) {
        self.hw().registers.insert(address, value);
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.hw()
            .log
            .iter()
            .filter_map(|access| match *access {
                Access::Write(address, value) => Some((address, value)),
                Access::Read(_) => None,
            })
            .collect()
    }

    pub fn writes_to(&self, address: u32) -> Vec<u32> {
        self.writes()
            .into_iter()
            .filter(|&(a, _)| a == address)
            .map(|(_, v)| v)
            .collect()
    }

    /// Number of coefficient writes, i.e. programming sequences started.
    pub fn programs(&self) -> usize {
        self.writes_to(COEFF).len()
    }

    pub fn clear_log(&self) {
        self.hw().log.clear();
    }
}

impl RegisterIo for FakeBus {
    type Error = BusError;

    fn read(&mut self, address: u32) -> Result<u32, BusError> {
        let mut hw = self.hw();
        if hw.fail {
            return Err(BusError);
        }
        hw.log.push(Access::Read(address));

        if address == COUNTER_COUNT {
            return Ok(hw.counter.pop_front().unwrap_or(0));
        }

        let mut value = hw.registers.get(&address).copied().unwrap_or(0);
        if address == CFG && value & ENABLE != 0 {
            hw.enabled_reads += 1;
            if hw.lock_after.is_some_and(|after| hw.enabled_reads > after) {
                value |= LOCK;
            }
        }
        Ok(value)
    }

    fn write(&mut self, address: u32, value: u32) -> Result<(), BusError> {
        let mut hw = self.hw();
        if hw.fail {
            return Err(BusError);
        }
        hw.log.push(Access::Write(address, value));

        let mut value = value;
        if address == CFG {
            value &= !LOCK;
            if value & ENABLE == 0 {
                hw.enabled_reads = 0;
            }
        }
        hw.registers.insert(address, value);
        Ok(())
    }
}

/// Records every delay instead of waiting, in nanoseconds.
#[derive(Clone, Default)]
pub struct FakeDelay(Arc<Mutex<Vec<u64>>>);

impl FakeDelay {
    pub fn waits(&self) -> Vec<u64> {
        self.0.lock().unwrap().clone()
    }
}

impl DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.lock().unwrap().push(u64::from(ns));
    }

    fn delay_us(&mut self, us: u32) {
        self.0.lock().unwrap().push(u64::from(us) * 1_000);
    }
}

/// A power domain switched by the test.
#[derive(Clone)]
pub struct Power(Arc<AtomicBool>);

impl Power {
    pub fn on() -> Self {
        Power(Arc::new(AtomicBool::new(true)))
    }

    pub fn set(&self, powered: bool) {
        self.0.store(powered, Ordering::SeqCst);
    }
}

impl PowerDomain for Power {
    fn is_powered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type Controller = ClockController<FakeBus, Power, FakeDelay>;

/// GK20A configuration with a short lock budget.
pub fn config() -> ClockConfig {
    let mut config = GK20A_GPCPLL;
    config.lock_timeout_budget = 10;
    config
}

/// A controller on fake hardware, with handles to the fakes.
pub fn controller() -> (Controller, FakeBus, Power, FakeDelay) {
    let bus = FakeBus::new();
    let power = Power::on();
    let delay = FakeDelay::default();
    let controller =
        ClockController::new(config(), bus.clone(), power.clone(), delay.clone()).unwrap();
    (controller, bus, power, delay)
}

/// Bounds under which 720 MHz is reached without a post divider.
pub fn low_vco_bounds() -> PllBounds {
    PllBounds {
        freq: HertzU32::MHz(204)..=HertzU32::MHz(1248),
        vco: HertzU32::MHz(500)..=HertzU32::MHz(1000),
        u: HertzU32::MHz(12)..=HertzU32::MHz(38),
        m: 1..=255,
        n: 8..=255,
        pl: 0..=14,
    }
}

pub fn dividers() -> pllctl::bounds::DividerTable {
    GK20A_DIVIDERS
}

/// Raw coefficient register value for `m`, `n`, `pl`.
pub fn coeff(m: u32, n: u32, pl: u32) -> u32 {
    m | (n << 8) | (pl << 16)
}
