//! Operating envelope of a PLL
//!
//! [`PllBounds`] describes what the silicon accepts: the output, VCO and
//! post-reference-divide frequency windows and the legal M, N and PL values.
//! [`DividerTable`] maps a PL index to the division factor it selects.
//!
//! Both are plain data, usually taken from a vbios table or a board
//! description, and are checked once when the controller is built.

use core::ops::RangeInclusive;

use fugit::HertzU32;

/// Widest M value the coefficient register can hold.
pub const M_FIELD_MAX: u32 = 0xFF;
/// Widest N value the coefficient register can hold.
pub const N_FIELD_MAX: u32 = 0xFF;
/// Widest PL index the coefficient register can hold.
pub const PL_FIELD_MAX: u32 = 0x3F;

/// A PLL parameter, used to report which bound is broken.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parameter {
    /// Output frequency
    Frequency,
    /// VCO frequency
    Vco,
    /// Frequency after the reference divider
    U,
    /// Reference divider
    M,
    /// Feedback multiplier
    N,
    /// Post divider index
    Pl,
}

/// Inconsistent PLL description.
///
/// These are static configuration defects and should be reported when the
/// controller is set up, not retried.
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The range for this parameter holds no value.
    EmptyRange(Parameter),
    /// The range for this parameter does not fit its register field.
    FieldOverflow(Parameter),
    /// The minimum output frequency or the reference divider may not be zero.
    ZeroMinimum(Parameter),
    /// The divider table ends before the largest PL index.
    DividerTableTooShort,
    /// A division factor in the table is zero.
    ZeroDivider,
    /// The reference clock is 0 Hz.
    ZeroReference,
    /// The lock wait must poll at least once.
    ZeroLockBudget,
    /// The initial coefficients lie outside the bounds.
    SeedOutOfBounds,
}

/// Legal operating envelope of one PLL.
///
/// All frequencies are in the PLL's own output domain. `pl` holds indices
/// into the [`DividerTable`], not division factors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PllBounds {
    /// Output frequency range.
    pub freq: RangeInclusive<HertzU32>,
    /// VCO frequency range.
    pub vco: RangeInclusive<HertzU32>,
    /// Range for the reference clock divided by M.
    pub u: RangeInclusive<HertzU32>,
    /// Reference divider range.
    pub m: RangeInclusive<u32>,
    /// Feedback multiplier range.
    pub n: RangeInclusive<u32>,
    /// Post divider index range.
    pub pl: RangeInclusive<u32>,
}

impl PllBounds {
    /// Check that every range is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.freq.is_empty() {
            return Err(ConfigError::EmptyRange(Parameter::Frequency));
        }
        if self.vco.is_empty() {
            return Err(ConfigError::EmptyRange(Parameter::Vco));
        }
        if self.u.is_empty() {
            return Err(ConfigError::EmptyRange(Parameter::U));
        }
        if self.freq.start().to_Hz() == 0 {
            return Err(ConfigError::ZeroMinimum(Parameter::Frequency));
        }

        let integers = [
            (&self.m, Parameter::M, M_FIELD_MAX),
            (&self.n, Parameter::N, N_FIELD_MAX),
            (&self.pl, Parameter::Pl, PL_FIELD_MAX),
        ];
        for (range, parameter, field_max) in integers {
            if range.is_empty() {
                return Err(ConfigError::EmptyRange(parameter));
            }
            if *range.end() > field_max {
                return Err(ConfigError::FieldOverflow(parameter));
            }
        }
        if *self.m.start() == 0 {
            return Err(ConfigError::ZeroMinimum(Parameter::M));
        }

        Ok(())
    }
}

/// Division factor for each PL index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DividerTable(&'static [u8]);

impl DividerTable {
    /// Wrap a table of division factors, indexed by PL.
    pub const fn new(factors: &'static [u8]) -> Self {
        DividerTable(factors)
    }

    /// Division factor selected by `pl`.
    #[inline]
    pub fn factor(&self, pl: u32) -> Option<u32> {
        self.0.get(pl as usize).map(|&f| u32::from(f))
    }

    /// Number of PL indices in the table.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check the table against the PL index range it must cover.
    pub fn validate(&self, pl: &RangeInclusive<u32>) -> Result<(), ConfigError> {
        if (*pl.end() as usize) >= self.0.len() {
            return Err(ConfigError::DividerTableTooShort);
        }
        if self.0.contains(&0) {
            return Err(ConfigError::ZeroDivider);
        }
        Ok(())
    }

    /// First index in `pl` whose factor is at least `threshold`, or the end
    /// of `pl` when there is none.
    pub(crate) fn first_at_least(&self, threshold: u64, pl: &RangeInclusive<u32>) -> u32 {
        pl.clone()
            .find(|&i| self.factor(i).is_some_and(|f| u64::from(f) >= threshold))
            .unwrap_or(*pl.end())
    }
}

/// PL index to division factor on the GK20A GPC PLL.
///
/// Indices 10 and 11 repeat factors 12 and 16, so the table is not monotonic.
pub const GK20A_DIVIDERS: DividerTable =
    DividerTable::new(&[1, 2, 3, 4, 5, 6, 8, 10, 12, 16, 12, 16, 20, 24, 32]);

/// GK20A GPC PLL envelope, from the vbios PLL info table.
pub const GK20A_GPCPLL_BOUNDS: PllBounds = PllBounds {
    freq: HertzU32::MHz(204)..=HertzU32::MHz(1248),
    vco: HertzU32::MHz(1000)..=HertzU32::MHz(2000),
    u: HertzU32::MHz(12)..=HertzU32::MHz(38),
    m: 1..=255,
    n: 8..=255,
    pl: 0..=14,
};
