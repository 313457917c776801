//! Access to the external SPI NOR flash that stores the audio data.
//!
//! The flash is only reachable after the BMV31K304 has been switched into SPI pass-through mode
//! through the [ICP protocol](crate::icp). Chip select is a plain GPIO (the SEL line, which doubles as
//! the LED control) and is toggled around every transaction, so the SPI peripheral must be given
//! as a bare [`SpiBus`].

use embedded_hal::{delay::DelayNs, digital::OutputPin, spi::SpiBus};

/// Size of a single program page of the flash. A page program must not cross this.
pub const PAGE_SIZE: usize = 256;

/// Page program
const PAGE_PROGRAM: u8 = 0x02;
/// Read data
const READ: u8 = 0x03;
/// Read manufacturer/device ID
const READ_ID: u8 = 0x90;
/// Read serial flash discoverable parameters
const READ_SFDP: u8 = 0x5A;

/// Byte clocked out while reading
const DUMMY_BYTE: u8 = 0xFF;

/// Chip erase takes at least this long, there is no point in polling WIP earlier.
const CHIP_ERASE_SETTLE_MS: u32 = 200;

#[derive(Debug, Clone)]
/// The SPI bus and chip select line used to talk to the flash.
pub struct SpiFlashInterface<TSpi, TCs> {
    spi: TSpi,
    cs: TCs,
}

#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// The error type that can be returned by various interface APIs
pub enum FlashInterfaceError<ESpi, ECs> {
    /// The SPI peripheral has failed to complete a transfer
    #[error("SPI error")]
    Spi(#[source] ESpi),
    /// The chip select line could not be driven
    #[error("Chip select error")]
    Cs(#[source] ECs),
}

impl<TSpi, TCs> SpiFlashInterface<TSpi, TCs> {
    /// Create a new interface.
    ///
    /// Both arguments may be borrowed (`&mut`), the [`embedded_hal`] traits are implemented for mutable references.
    pub const fn new(spi: TSpi, cs: TCs) -> Self {
        SpiFlashInterface { spi, cs }
    }

    /// Return the owned bus and chip select line
    pub fn release(self) -> (TSpi, TCs) {
        (self.spi, self.cs)
    }
}

impl<TSpi, TCs> SpiFlashInterface<TSpi, TCs>
where
    TSpi: SpiBus<u8>,
    TCs: OutputPin,
{
    /// Run `f` with chip select asserted.
    ///
    /// Chip select is released even when the transfer fails, the transfer error takes precedence.
    pub fn transaction(
        &mut self,
        f: impl FnOnce(&mut TSpi) -> Result<(), TSpi::Error>,
    ) -> Result<(), FlashInterfaceError<TSpi::Error, TCs::Error>> {
        self.cs.set_low().map_err(FlashInterfaceError::Cs)?;

        let result = f(&mut self.spi).and_then(|_| self.spi.flush());
        let released = self.cs.set_high().map_err(FlashInterfaceError::Cs);

        result.map_err(FlashInterfaceError::Spi)?;
        released
    }
}

impl<TSpi, TCs> device_driver::RegisterInterface for SpiFlashInterface<TSpi, TCs>
where
    TSpi: SpiBus<u8>,
    TCs: OutputPin,
{
    type Error = FlashInterfaceError<TSpi::Error, TCs::Error>;
    type AddressType = u8;

    fn write_register(
        &mut self,
        address: Self::AddressType,
        _size_bits: u32,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        self.transaction(|spi| {
            spi.write(&[address])?;
            spi.write(data)
        })
    }

    fn read_register(
        &mut self,
        address: Self::AddressType,
        _size_bits: u32,
        data: &mut [u8],
    ) -> Result<(), Self::Error> {
        self.transaction(|spi| {
            spi.write(&[address])?;
            data.fill(DUMMY_BYTE);
            spi.transfer_in_place(data)
        })
    }
}

impl<TSpi, TCs> device_driver::CommandInterface for SpiFlashInterface<TSpi, TCs>
where
    TSpi: SpiBus<u8>,
    TCs: OutputPin,
{
    type Error = FlashInterfaceError<TSpi::Error, TCs::Error>;
    type AddressType = u8;

    fn dispatch_command(
        &mut self,
        address: Self::AddressType,
        _size_bits_in: u32,
        input: &[u8],
        _size_bits_out: u32,
        output: &mut [u8],
    ) -> Result<(), Self::Error> {
        self.transaction(|spi| {
            spi.write(&[address])?;
            spi.write(input)?;
            output.fill(DUMMY_BYTE);
            spi.transfer_in_place(output)
        })
    }
}

impl<TSpi, TCs> SpiFlash<SpiFlashInterface<TSpi, TCs>>
where
    TSpi: SpiBus<u8>,
    TCs: OutputPin,
{
    /// Poll the status register until the write-in-progress flag clears.
    ///
    /// # Blocking
    ///
    /// There is no timeout, a flash that never clears WIP will hang the caller.
    pub fn wait_for_write_end(&mut self) -> Result<(), FlashInterfaceError<TSpi::Error, TCs::Error>> {
        while self.status().read()?.wip() {}
        Ok(())
    }

    /// Erase the whole chip and wait for the erase to finish.
    ///
    /// # Blocking
    ///
    /// A chip erase typically takes several seconds.
    pub fn erase_chip(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<(), FlashInterfaceError<TSpi::Error, TCs::Error>> {
        self.write_enable().dispatch()?;
        self.chip_erase().dispatch()?;
        delay.delay_ms(CHIP_ERASE_SETTLE_MS);
        self.wait_for_write_end()
    }

    /// Program `data` starting at `address` with a single page program cycle.
    ///
    /// An empty `data` still issues the full command sequence.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`PAGE_SIZE`].
    /// The caller is responsible for not crossing a page boundary, the flash wraps around within the page.
    pub fn page_program(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashInterfaceError<TSpi::Error, TCs::Error>> {
        assert!(
            data.len() <= PAGE_SIZE,
            "Page program is limited to a single page"
        );

        self.write_enable().dispatch()?;

        let [_, a2, a1, a0] = address.to_be_bytes();
        self.interface.transaction(|spi| {
            spi.write(&[PAGE_PROGRAM, a2, a1, a0])?;
            spi.write(data)
        })?;

        self.wait_for_write_end()
    }

    /// Read flash contents starting at `address`, filling `buffer` completely.
    pub fn read(
        &mut self,
        address: u32,
        buffer: &mut [u8],
    ) -> Result<(), FlashInterfaceError<TSpi::Error, TCs::Error>> {
        let [_, a2, a1, a0] = address.to_be_bytes();
        self.interface.transaction(|spi| {
            spi.write(&[READ, a2, a1, a0])?;
            buffer.fill(DUMMY_BYTE);
            spi.transfer_in_place(buffer)
        })
    }

    /// Read the SFDP table starting at `address`.
    ///
    /// A flash supporting SFDP returns the `"SFDP"` signature at address 0.
    pub fn read_sfdp(
        &mut self,
        address: u32,
        buffer: &mut [u8],
    ) -> Result<(), FlashInterfaceError<TSpi::Error, TCs::Error>> {
        let [_, a2, a1, a0] = address.to_be_bytes();
        self.interface.transaction(|spi| {
            spi.write(&[READ_SFDP, a2, a1, a0, DUMMY_BYTE])?;
            buffer.fill(DUMMY_BYTE);
            spi.transfer_in_place(buffer)
        })
    }

    /// Read the legacy manufacturer/device ID pair (`0x90`).
    pub fn read_manufacturer_device_id(
        &mut self,
    ) -> Result<[u8; 2], FlashInterfaceError<TSpi::Error, TCs::Error>> {
        let mut id = [DUMMY_BYTE; 2];
        self.interface.transaction(|spi| {
            spi.write(&[READ_ID, DUMMY_BYTE, DUMMY_BYTE, DUMMY_BYTE])?;
            spi.transfer_in_place(&mut id)
        })?;
        Ok(id)
    }

    /// Give back the interface
    pub fn release(self) -> SpiFlashInterface<TSpi, TCs> {
        self.interface
    }
}

device_driver::create_device!(
    device_name: SpiFlash,
    dsl: {
        config {
            type RegisterAddressType = u8;
            type CommandAddressType = u8;
            type DefaultByteOrder = BE;
            type DefmtFeature = "defmt-03";
        }
        /// The status register (RDSR)
        register Status {
            type Access = RO;

            const ADDRESS = 0x05;
            const SIZE_BITS = 8;

            /// Write in progress. Set while a program or erase cycle is running.
            wip: bool = 0,

            /// Write enable latch. Set by WriteEnable, cleared when a program or erase completes.
            wel: bool = 1,

            /// Block protection bits
            block_protect: uint = 2..=4,

            /// Status register protect
            srp: bool = 7,
        },
        /// JEDEC identification (RDID)
        register JedecId {
            type Access = RO;

            const ADDRESS = 0x9F;
            const SIZE_BITS = 24;

            /// JEDEC manufacturer code
            manufacturer: uint = 16..24,

            /// Memory type, vendor specific
            memory_type: uint = 8..16,

            /// Capacity code, usually log2 of the size in bytes
            capacity: uint = 0..8,
        },
        /// Set the write enable latch. Required before every program or erase.
        command WriteEnable {
            const ADDRESS = 0x06;
        },
        /// Erase the whole array
        command ChipErase {
            const ADDRESS = 0x60;
        },
    }
);
