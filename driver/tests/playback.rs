//! Playback control, LED, power and ICP mode entry on mock pins.

mod common;

use bmv31k304_driver::{ICP_CK_TO_DA_MS, ICP_POWER_OFF_MS};
use common::{setup, Event, Line};

#[test]
fn begin_puts_lines_into_idle_state() {
    let (dev, mut delay, hw) = common::build();

    let _dev = dev.begin(&mut delay).unwrap();

    let hw = hw.borrow();
    assert_eq!(
        hw.events,
        [
            Event::Level(Line::Power, true),
            Event::Output(Line::IcpDa),
            Event::Level(Line::IcpDa, true),
            Event::Level(Line::Sel, true),
            Event::Level(Line::Data, true),
            Event::Input(Line::IcpCk),
            Event::DelayNs(1_000_000_000),
        ]
    );
}

#[test]
fn high_voices_use_the_second_bank() {
    let (mut dev, mut delay, hw) = setup();

    dev.play_voice(&mut delay, 200, false).unwrap();

    assert_eq!(hw.borrow().data_line_bytes(), [0xFB, 72]);
}

#[test]
fn looped_voice_appends_the_loop_command() {
    let (mut dev, mut delay, hw) = setup();

    dev.play_voice(&mut delay, 50, true).unwrap();

    assert_eq!(hw.borrow().data_line_bytes(), [0xFA, 50, 0xF4]);
}

#[test]
fn sentences_volume_and_transport() {
    let (mut dev, mut delay, hw) = setup();

    dev.play_sentence(&mut delay, 3, true).unwrap();
    dev.set_volume(&mut delay, 8).unwrap();
    dev.pause(&mut delay).unwrap();
    dev.resume(&mut delay).unwrap();
    dev.repeat(&mut delay).unwrap();
    dev.stop(&mut delay).unwrap();

    assert_eq!(
        hw.borrow().data_line_bytes(),
        [0x83, 0xF4, 0xE9, 0xF1, 0xF2, 0xF4, 0xF8]
    );
}

#[test]
#[should_panic]
fn volume_out_of_range_panics() {
    let (mut dev, mut delay, _hw) = setup();
    let _ = dev.set_volume(&mut delay, 12);
}

#[test]
fn busy_line_reads_low_while_playing() {
    let (mut dev, _delay, hw) = setup();
    hw.borrow_mut().script_input(Line::IcpCk, &[false, true]);

    assert!(dev.is_playing().unwrap());
    assert!(!dev.is_playing().unwrap());
}

#[test]
fn led_is_active_low() {
    let (mut dev, _delay, hw) = setup();

    dev.set_led(true).unwrap();
    dev.set_led(false).unwrap();

    assert_eq!(hw.borrow().levels(Line::Sel), [false, true]);
}

#[test]
fn power_control() {
    let (mut dev, mut delay, hw) = setup();

    dev.set_power(false).unwrap();
    dev.power_cycle(&mut delay).unwrap();

    let hw = hw.borrow();
    assert_eq!(hw.levels(Line::Power), [false, false, true]);
    assert_eq!(hw.elapsed_us(), 500_000);
}

#[test]
fn init_audio_update_raises_data() {
    let (mut dev, _delay, hw) = setup();

    dev.init_audio_update().unwrap();

    assert_eq!(hw.borrow().levels(Line::Data), [true]);
}

#[test]
fn update_is_requested_by_serial_traffic() {
    let (mut dev, _delay, _hw) = setup();

    let mut serial = common::Serial::default();
    assert!(!dev.is_update_requested(&mut serial).unwrap());
    serial.rx.push_back(0xAA);
    assert!(dev.is_update_requested(&mut serial).unwrap());
}

#[test]
fn program_mode_entry_powers_up_with_icp_lines_high() {
    let (mut dev, mut delay, hw) = setup();
    hw.borrow_mut()
        .script_input(Line::IcpDa, &[true, false, true]);

    assert!(dev.enter_program_mode(&mut delay, 5).unwrap());

    let hw = hw.borrow();
    assert_eq!(hw.levels(Line::Power), [false, true]);
    assert_eq!(hw.levels(Line::Data), [false]);
    assert_eq!(hw.levels(Line::Sel), [false]);

    let power_on = hw
        .events
        .iter()
        .position(|event| *event == Event::Level(Line::Power, true))
        .unwrap();
    // power comes up after at least 16ms with every line low
    let low_time: u64 = hw.events[..power_on]
        .iter()
        .map(|event| match event {
            Event::DelayNs(ns) => u64::from(*ns),
            _ => 0,
        })
        .sum();
    assert_eq!(low_time, u64::from(ICP_POWER_OFF_MS) * 1_000_000);

    // ICPDA follows ICPCK, then the READY and MATCH windows open the entry pattern
    assert_eq!(
        hw.events[power_on + 1..power_on + 8],
        [
            Event::Level(Line::IcpCk, true),
            Event::DelayNs(ICP_CK_TO_DA_MS * 1_000_000),
            Event::Level(Line::IcpDa, true),
            Event::Level(Line::IcpCk, false),
            Event::DelayNs(160_000),
            Event::Level(Line::IcpCk, true),
            Event::DelayNs(84_000),
        ]
    );
}

#[test]
fn program_mode_entry_gives_up_after_five_attempts() {
    let (mut dev, mut delay, hw) = setup();

    assert!(!dev.enter_program_mode(&mut delay, 2).unwrap());

    // four acknowledge reads of three bits each, ICPDA switched to input for every one of them
    let inputs = hw
        .borrow()
        .events
        .iter()
        .filter(|event| **event == Event::Input(Line::IcpDa))
        .count();
    assert_eq!(inputs, 4);
}

#[test]
fn spi_mode_reads_the_jedec_id() {
    let (mut dev, mut delay, hw) = setup();
    {
        let mut hw = hw.borrow_mut();
        hw.script_input(Line::IcpDa, &[false, true, false]);
        hw.miso.extend([0xC8, 0x40, 0x16]);
    }

    assert_eq!(
        dev.switch_to_spi_mode(&mut delay).unwrap(),
        Some([0xC8, 0x40, 0x16])
    );

    let hw = hw.borrow();
    assert_eq!(hw.frames(), [vec![0x9F, 0xFF, 0xFF, 0xFF]]);
    // SEL is released before the flash is touched
    assert_eq!(hw.levels(Line::Sel), [false, true, false, true]);
}

#[test]
fn flash_is_reachable_after_the_switch() {
    let (mut dev, _delay, hw) = setup();
    hw.borrow_mut().miso.extend(*b"SFDP");

    let mut signature = [0; 4];
    dev.flash().read_sfdp(0, &mut signature).unwrap();

    assert_eq!(&signature, b"SFDP");
    assert_eq!(hw.borrow().frames()[0][..5], [0x5A, 0x00, 0x00, 0x00, 0xFF]);
}
