use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use seplosbms_lib::device::{Device, OnlineState};
use seplosbms_lib::scheduler::{Bus, Transport};
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_header(device: &Device) -> bool {
    println!(
        "=== {} (address {:#04X}, protocol {}) ===",
        device.name(),
        device.address(),
        device.protocol_version()
    );
    if device.state() == OnlineState::Unresponsive {
        println!("No valid response");
        return false;
    }
    true
}

fn print_telemetry(device: &Device) {
    if let Some(snapshot) = device.snapshot() {
        for (channel, reading) in snapshot.iter() {
            println!("{channel}: {reading}");
        }
    }
}

fn print_status(device: &Device) {
    if let Some(report) = device.report() {
        println!("Charging: {}", report.charging);
        println!("Discharging: {}", report.discharging);
        println!("Balancing: {}", report.balancing);
        println!("Voltage protection: {}", report.voltage_protection);
        println!("Temperature protection: {}", report.temperature_protection);
        println!("Current protection: {}", report.current_protection);
        println!("SOC protection: {}", report.soc_protection);
        println!("Errors: {}", report.errors);
        println!("Alarms: {}", report.alarms);
    }
}

fn poll_once<T: Transport>(bus: &mut Bus<T>) -> Result<()> {
    let outcomes = bus.poll_all().with_context(|| "Cannot poll the bus")?;
    for (device, outcome) in bus.devices().iter().zip(outcomes) {
        debug!("Polled '{}': {outcome:?}", device.name());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = match &args.config {
        Some(config_file) => config::BusConfig::load(config_file)?,
        None => config::BusConfig::from_args(&args)?,
    };
    let mut bus = config.open()?;

    match args.command {
        commandline::CliCommands::Telemetry => {
            poll_once(&mut bus)?;
            for device in bus.devices() {
                if print_header(device) {
                    print_telemetry(device);
                }
            }
        }
        commandline::CliCommands::Status => {
            poll_once(&mut bus)?;
            for device in bus.devices() {
                if print_header(device) {
                    print_status(device);
                }
            }
        }
        commandline::CliCommands::All => {
            poll_once(&mut bus)?;
            for device in bus.devices() {
                if print_header(device) {
                    print_telemetry(device);
                    print_status(device);
                }
            }
        }
        commandline::CliCommands::Daemon { output, interval } => {
            daemon::run(bus, output, interval)?
        }
    }

    Ok(())
}
