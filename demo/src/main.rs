#![no_std]
#![no_main]

use bsp::entry;
use defmt::{error, info, warn, Debug2Format};
use defmt_rtt as _;
use embedded_hal::digital::{InputPin, OutputPin, PinState};
use panic_probe as _;

use bmv31k304_driver::{
    pac::BidiPin, Bmv31k304, Peripherals, UpdateOutcome, UpdateProfile, UpdateSession,
};
use rp_pico::{
    self as bsp,
    hal::{
        fugit::RateExtU32,
        gpio::{FunctionSpi, FunctionUart},
        uart::{DataBits, StopBits, UartConfig, UartDevice, UartPeripheral, ValidUartPinout},
    },
};

use bsp::hal::{
    clocks::{init_clocks_and_plls, Clock},
    pac,
    sio::Sio,
    watchdog::Watchdog,
};

/// Baud rate used by the audio update tools
const UPDATE_BAUD: u32 = 256_000;

/// Number of voices cycled through by the demo
const DEMO_VOICES: u8 = 4;

struct Delay(cortex_m::delay::Delay);
impl embedded_hal::delay::DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.delay_us(ns.div_ceil(1000));
    }

    fn delay_us(&mut self, us: u32) {
        self.0.delay_us(us);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.0.delay_ms(ms);
    }
}

/// A GPIO driven straight through the SIO registers, so that its direction can flip at runtime.
///
/// The pin must already be muxed to SIO.
struct SioPin {
    mask: u32,
}

impl SioPin {
    fn new(num: u8) -> Self {
        Self { mask: 1 << num }
    }

    fn sio() -> &'static pac::sio::RegisterBlock {
        // Only single-cycle atomic set/clear registers are touched
        unsafe { &*pac::SIO::ptr() }
    }
}

impl embedded_hal::digital::ErrorType for SioPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for SioPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Self::sio()
            .gpio_out_clr()
            .write(|w| unsafe { w.bits(self.mask) });
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Self::sio()
            .gpio_out_set()
            .write(|w| unsafe { w.bits(self.mask) });
        Ok(())
    }
}

impl InputPin for SioPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(Self::sio().gpio_in().read().bits() & self.mask != 0)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.is_high().map(|high| !high)
    }
}

impl BidiPin for SioPin {
    fn set_to_input(&mut self) {
        Self::sio()
            .gpio_oe_clr()
            .write(|w| unsafe { w.bits(self.mask) });
    }

    fn set_to_output(&mut self) {
        Self::sio()
            .gpio_oe_set()
            .write(|w| unsafe { w.bits(self.mask) });
    }
}

/// The serial link to the update tools
struct HostLink<D: UartDevice, P: ValidUartPinout<D>>(
    UartPeripheral<bsp::hal::uart::Enabled, D, P>,
);

impl<D: UartDevice, P: ValidUartPinout<D>> embedded_io::ErrorType for HostLink<D, P> {
    type Error = embedded_io::ErrorKind;
}

impl<D: UartDevice, P: ValidUartPinout<D>> embedded_io::Read for HostLink<D, P> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.0
            .read_full_blocking(&mut buf[..1])
            .map_err(|_| embedded_io::ErrorKind::InvalidData)?;
        Ok(1)
    }
}

impl<D: UartDevice, P: ValidUartPinout<D>> embedded_io::ReadReady for HostLink<D, P> {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.uart_is_readable())
    }
}

impl<D: UartDevice, P: ValidUartPinout<D>> embedded_io::Write for HostLink<D, P> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write_full_blocking(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        while self.0.uart_is_busy() {}
        Ok(())
    }
}

#[entry]
fn main() -> ! {
    info!("Program start");
    let mut pac = pac::Peripherals::take().unwrap();
    let core = pac::CorePeripherals::take().unwrap();
    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let sio = Sio::new(pac.SIO);

    // External high-speed crystal on the pico board is 12Mhz
    let external_xtal_freq_hz = 12_000_000u32;
    let clocks = init_clocks_and_plls(
        external_xtal_freq_hz,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();

    let mut delay = Delay(cortex_m::delay::Delay::new(
        core.SYST,
        clocks.system_clock.freq().to_Hz(),
    ));

    defmt::timestamp!("{=u32:us}", {
        unsafe { &*rp_pico::pac::TIMER::PTR }
            .timerawl()
            .read()
            .bits()
    });

    let pins = bsp::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    let uart_pins = (
        pins.gpio0.into_function::<FunctionUart>(),
        pins.gpio1.into_function::<FunctionUart>(),
    );
    let uart = UartPeripheral::new(pac.UART0, uart_pins, &mut pac.RESETS)
        .enable(
            UartConfig::new(UPDATE_BAUD.Hz(), DataBits::Eight, None, StopBits::One),
            clocks.peripheral_clock.freq(),
        )
        .unwrap();
    let mut link = HostLink(uart);

    let sck = pins.gpio10.into_function::<FunctionSpi>();
    let mosi = pins.gpio11.into_function::<FunctionSpi>();
    let miso = pins.gpio12.into_function::<FunctionSpi>();
    let spi1 = bsp::hal::Spi::<_, _, _, 8>::new(pac.SPI1, (mosi, miso, sck)).init(
        &mut pac.RESETS,
        clocks.peripheral_clock.freq(),
        1_000_000u32.Hz(),
        embedded_hal::spi::MODE_0,
    );

    let sel = pins.gpio13.into_push_pull_output_in_state(PinState::High);
    let power = pins.gpio14.into_push_pull_output_in_state(PinState::Low);
    let data = pins.gpio15.into_push_pull_output_in_state(PinState::High);
    // muxed to SIO here, direction is handled by SioPin from now on
    let _ = pins.gpio16.into_pull_up_input();
    let _ = pins.gpio17.into_push_pull_output_in_state(PinState::High);

    let dev = Bmv31k304::new(Peripherals {
        spi: spi1,
        sel,
        power,
        data,
        icpck: SioPin::new(16),
        icpda: SioPin::new(17),
    });

    let mut dev = match dev.begin(&mut delay) {
        Ok(dev) => dev,
        Err(err) => {
            error!("Failed to power up: {}", Debug2Format(&err.error));
            panic!("Failed to power up: {:?}", err);
        }
    };

    dev.set_volume(&mut delay, 8).unwrap();

    let mut session = UpdateSession::default();
    let mut voice = 0;
    loop {
        if dev.is_update_requested(&mut link).unwrap() {
            info!("Update requested");
            dev.init_audio_update().unwrap();
            dev.set_led(true).unwrap();

            match dev.execute_update(&mut session, &mut link, &mut delay, UpdateProfile::Widget) {
                Ok(UpdateOutcome::Completed) => {
                    info!("Update completed, {} bytes", session.flash_addr())
                }
                Ok(UpdateOutcome::Reset) => {
                    warn!("Update reset by host");
                    dev.set_power(true).unwrap();
                }
                Err(err) => warn!("Update failed: {}", Debug2Format(&err)),
            }
            dev.set_led(false).unwrap();
            continue;
        }

        if !dev.is_playing().unwrap() {
            info!("Playing voice {}", voice);
            dev.play_voice(&mut delay, voice, false).unwrap();
            voice = (voice + 1) % DEMO_VOICES;
        }

        delay.0.delay_ms(10);
    }
}
