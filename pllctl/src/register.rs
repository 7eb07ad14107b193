//! Register access
//!
//! The controller never dereferences device memory itself. Every access goes
//! through a [`RegisterIo`] implementation supplied by the platform, which
//! may be a memory-mapped window, a host bridge or a test double.
//!
//! Register contents are handled as typed values (see [`RegisterValue`]) and
//! changed with read-modify-write helpers, so that a field update never
//! disturbs the neighbouring bits of the same register.

/// Register bus collaborator.
///
/// Transport-level retries, if any, belong to the implementation. Errors are
/// reported to the caller of the controller unchanged.
pub trait RegisterIo {
    /// Error raised by the underlying transport.
    type Error;

    /// Read the 32-bit register at `address`.
    fn read(&mut self, address: u32) -> Result<u32, Self::Error>;

    /// Write `value` to the 32-bit register at `address`.
    fn write(&mut self, address: u32, value: u32) -> Result<(), Self::Error>;
}

impl<T: RegisterIo + ?Sized> RegisterIo for &mut T {
    type Error = T::Error;

    #[inline]
    fn read(&mut self, address: u32) -> Result<u32, Self::Error> {
        T::read(self, address)
    }

    #[inline]
    fn write(&mut self, address: u32, value: u32) -> Result<(), Self::Error> {
        T::write(self, address, value)
    }
}

/// A typed view of the contents of one register.
pub trait RegisterValue: Copy {
    /// Wrap raw register contents.
    fn from_bits(bits: u32) -> Self;

    /// Raw register contents.
    fn bits(self) -> u32;
}

impl RegisterValue for u32 {
    #[inline]
    fn from_bits(bits: u32) -> Self {
        bits
    }

    #[inline]
    fn bits(self) -> u32 {
        self
    }
}

/// Read a register as `V`.
#[inline]
pub(crate) fn read<R: RegisterIo, V: RegisterValue>(
    io: &mut R,
    address: u32,
) -> Result<V, R::Error> {
    io.read(address).map(V::from_bits)
}

/// Write `value` to a register.
#[inline]
pub(crate) fn write<R: RegisterIo, V: RegisterValue>(
    io: &mut R,
    address: u32,
    value: V,
) -> Result<(), R::Error> {
    io.write(address, value.bits())
}

/// Read a register, let `f` update it and write the result back.
///
/// Returns the value that was written.
#[inline]
pub(crate) fn modify<R: RegisterIo, V: RegisterValue>(
    io: &mut R,
    address: u32,
    f: impl FnOnce(&mut V),
) -> Result<V, R::Error> {
    let mut value = read::<R, V>(io, address)?;
    f(&mut value);
    write(io, address, value)?;
    Ok(value)
}

/// Addresses of the registers driven by the sequencer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterMap {
    /// PLL configuration: enable, analog power-down, lock detect and lock status.
    pub cfg: u32,
    /// Combined M/N/PL coefficient register.
    pub coeff: u32,
    /// Output mux selecting the VCO or the bypass path.
    pub sel_vco: u32,
    /// Output divider setup of the PLL clock domain.
    pub gpc2clk_out: u32,
    /// Clock counter configuration.
    pub counter_cfg: u32,
    /// Clock counter result.
    pub counter_count: u32,
}

/// Register layout of the GK20A GPC PLL.
pub const GK20A_GPCPLL_REGISTERS: RegisterMap = RegisterMap {
    cfg: 0x0013_7000,
    coeff: 0x0013_7004,
    sel_vco: 0x0013_7100,
    gpc2clk_out: 0x0013_7250,
    counter_cfg: 0x0013_4124,
    counter_count: 0x0013_4128,
};
