//! Raspberry Pi hardware backend via rppal plus the sysfs 1-Wire tree.
//!
//! Pin and bus handles are claimed lazily and cached so the trait surface
//! can stay number-addressed. rppal failures at claim time map to
//! persistent errors (the line is simply not available on this host);
//! failures on an already-claimed handle map to transient ones.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use rppal::gpio::Gpio;
use rppal::i2c::I2c;

use super::{Hardware, PinDirection, Pull};
use crate::error::{Error, Result};

const W1_DEVICES_DIR: &str = "/sys/bus/w1/devices";

enum PinHandle {
    Output(rppal::gpio::OutputPin),
    Input(rppal::gpio::InputPin),
}

pub struct RpiHardware {
    gpio: Gpio,
    pins: Mutex<HashMap<u8, PinHandle>>,
    buses: Mutex<HashMap<u8, I2c>>,
}

impl RpiHardware {
    pub fn new() -> Result<Self> {
        let gpio =
            Gpio::new().map_err(|e| Error::persistent(format!("gpio unavailable: {e}")))?;
        Ok(Self {
            gpio,
            pins: Mutex::new(HashMap::new()),
            buses: Mutex::new(HashMap::new()),
        })
    }

    fn claim(&self, pin: u8, direction: PinDirection, pull: Pull) -> Result<PinHandle> {
        let io = self
            .gpio
            .get(pin)
            .map_err(|e| Error::persistent(format!("pin {pin} unavailable: {e}")))?;
        Ok(match direction {
            PinDirection::Output => PinHandle::Output(io.into_output_low()),
            PinDirection::Input => PinHandle::Input(match pull {
                Pull::Up => io.into_input_pullup(),
                Pull::Down => io.into_input_pulldown(),
                Pull::None => io.into_input(),
            }),
        })
    }

    fn with_bus<T>(&self, bus: u8, f: impl FnOnce(&mut I2c) -> rppal::i2c::Result<T>) -> Result<T> {
        let mut buses = self.buses.lock();
        if !buses.contains_key(&bus) {
            let handle = I2c::with_bus(bus)
                .map_err(|e| Error::persistent(format!("i2c bus {bus} unavailable: {e}")))?;
            buses.insert(bus, handle);
        }
        f(buses.get_mut(&bus).expect("bus just inserted"))
            .map_err(|e| Error::transient(format!("i2c bus {bus}: {e}")))
    }
}

impl Hardware for RpiHardware {
    fn configure(&self, pin: u8, direction: PinDirection, pull: Pull) -> Result<()> {
        let handle = self.claim(pin, direction, pull)?;
        self.pins.lock().insert(pin, handle);
        Ok(())
    }

    fn set_output(&self, pin: u8, level: bool) -> Result<()> {
        let mut pins = self.pins.lock();
        if !matches!(pins.get(&pin), Some(PinHandle::Output(_))) {
            let handle = self.claim(pin, PinDirection::Output, Pull::None)?;
            pins.insert(pin, handle);
        }
        match pins.get_mut(&pin) {
            Some(PinHandle::Output(out)) => {
                if level {
                    out.set_high();
                } else {
                    out.set_low();
                }
                Ok(())
            }
            _ => unreachable!("pin reconfigured as output above"),
        }
    }

    fn read_input(&self, pin: u8) -> Result<bool> {
        let mut pins = self.pins.lock();
        if !matches!(pins.get(&pin), Some(PinHandle::Input(_))) {
            let handle = self.claim(pin, PinDirection::Input, Pull::Up)?;
            pins.insert(pin, handle);
        }
        match pins.get(&pin) {
            Some(PinHandle::Input(input)) => Ok(input.is_high()),
            _ => unreachable!("pin reconfigured as input above"),
        }
    }

    fn i2c_write(&self, bus: u8, addr: u16, reg: u8, bytes: &[u8]) -> Result<()> {
        self.with_bus(bus, |i2c| {
            i2c.set_slave_address(addr)?;
            i2c.block_write(reg, bytes)
        })
    }

    fn i2c_read(&self, bus: u8, addr: u16, reg: u8, len: usize) -> Result<Vec<u8>> {
        self.with_bus(bus, |i2c| {
            i2c.set_slave_address(addr)?;
            let mut buf = vec![0u8; len];
            i2c.block_read(reg, &mut buf)?;
            Ok(buf)
        })
    }

    fn i2c_write_raw(&self, bus: u8, addr: u16, bytes: &[u8]) -> Result<()> {
        self.with_bus(bus, |i2c| {
            i2c.set_slave_address(addr)?;
            i2c.write(bytes)?;
            Ok(())
        })
    }

    fn i2c_read_raw(&self, bus: u8, addr: u16, len: usize) -> Result<Vec<u8>> {
        self.with_bus(bus, |i2c| {
            i2c.set_slave_address(addr)?;
            let mut buf = vec![0u8; len];
            i2c.read(&mut buf)?;
            Ok(buf)
        })
    }

    fn onewire_list(&self) -> Result<Vec<String>> {
        let dir = PathBuf::from(W1_DEVICES_DIR);
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::persistent(format!("1-wire tree unavailable: {e}")))?;
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            // Family 0x28 = DS18B20.
            if name.starts_with("28-") {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn onewire_read(&self, id: &str) -> Result<String> {
        let path = PathBuf::from(W1_DEVICES_DIR).join(id).join("w1_slave");
        std::fs::read_to_string(&path)
            .map_err(|e| Error::persistent(format!("1-wire slave '{id}': {e}")))
    }
}
