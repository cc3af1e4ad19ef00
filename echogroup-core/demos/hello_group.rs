//! Four-Socket Board Walkthrough
//!
//! Brings up a simulated board with one empty socket, runs a few
//! pitch-catch cycles and reads the waveforms without blocking.
//!
//! ## What You'll Learn
//!
//! - Binding firmware to slots and reading the bring-up report
//! - Driving cycles through `GroupSignals` the way interrupt handlers do
//! - Queuing waveform reads across buses and collecting them
//!
//! ## Running the Example
//!
//! ```bash
//! cargo run --example hello_group
//! ```

use echogroup_core::sim::{SimSensor, SimTransport};
use echogroup_core::time::{SystemTime, TimeSource};
use echogroup_core::{
    BusMask, Firmware, FirmwareImage, Group, GroupConfig, GroupSignals, IoMode, SensorConfig,
};

static SIGNALS: GroupSignals = GroupSignals::new();
static IMAGE: FirmwareImage = FirmwareImage::new("demo_gpr_1.0", &[0x5A; 64]);

fn on_round(failed: BusMask) {
    if !failed.is_empty() {
        println!("  round finished with failed buses {:#b}", failed);
    }
}

fn main() {
    println!("EchoGroup Board Walkthrough");
    println!("===========================\n");

    let board = SimTransport::new(vec![
        SimSensor::ch101(0),
        SimSensor::ch101(0).with_echo(1400, 900),
        SimSensor::absent(),
        SimSensor::ch101(1).with_echo(1800, 310),
    ]);

    let mut group: Group<_, 4> = Group::new(board, &SIGNALS, GroupConfig::default());
    for slot in 0..4 {
        if let Err(e) = group.init_slot(slot, Firmware::gpr(&IMAGE)) {
            println!("init_slot({}) failed: {}", slot, e);
            return;
        }
    }

    let report = group.start();
    println!("Bring-up status: {:#010b}", report.status().bits());
    for e in report.failures() {
        println!("  {}", e);
    }
    for slot in report.connected() {
        if let Ok(cal) = group.calibration(slot) {
            println!(
                "  slot {}: {} Hz, rtc {} ticks / {} ms",
                slot, cal.op_frequency_hz, cal.rtc_cal_result, cal.rtc_pulse_ms
            );
        }
    }

    let template = SensorConfig::default().with_max_range(600);
    let transmitter = match group.configure_pitch_catch(template) {
        Ok(slot) => slot,
        Err(e) => {
            println!("configure failed: {}", e);
            return;
        }
    };
    println!("\nSlot {} transmits, {} slots listen\n", transmitter, group.sensor_count() - 1);

    group.set_io_complete_callback(on_round);
    let clock = SystemTime::new();

    for cycle in 0..3 {
        if let Err(e) = group.group_trigger() {
            println!("trigger failed: {}", e);
            return;
        }
        group.transport_mut().deliver_interrupts(&SIGNALS);
        if nb::block!(SIGNALS.poll_cycle()).is_err() {
            return;
        }

        println!("Cycle {} at {} ms:", cycle, clock.now());
        for slot in group.connected_mask() {
            match group.read_measurement(slot, Some(IoMode::NonBlocking)) {
                Ok(m) => match m.range.mm_f32() {
                    Some(mm) => println!("  slot {}: {:7.1} mm, amplitude {}", slot, mm, m.amplitude),
                    None => println!("  slot {}: no target", slot),
                },
                Err(e) => println!("  slot {}: {}", slot, e),
            }
        }

        if let Err(e) = group.start_nb(&clock) {
            println!("  readout start failed: {}", e);
        }
        // Stand-in for the DMA-complete interrupts
        for bus in SIGNALS.io_outstanding() {
            group.transport_mut().complete_bus(bus, &SIGNALS);
        }
        match nb::block!(group.finish_nb()) {
            Ok(()) => {
                for slot in group.connected_mask() {
                    let n = group.samples(slot).map_or(0, |s| s.len());
                    println!("  slot {}: {} IQ samples", slot, n);
                }
            }
            Err(e) => println!("  readout failed: {}", e),
        }
    }
}
