//! Deterministic stub hardware for development hosts and tests.
//!
//! Every call is recorded so tests can assert on the exact edge sequence a
//! driver produced. Input pins, I²C responses, and 1-Wire files are scripted
//! per test; unscripted reads fall back to quiet defaults, or to plausible
//! simulated device frames when simulation is enabled (`--dry-run`).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::{Hardware, PinDirection, Pull};
use crate::error::{Error, Result};

/// One recorded hardware call.
#[derive(Debug, Clone, PartialEq)]
pub enum HwCall {
    Configure(u8, PinDirection, Pull),
    SetOutput(u8, bool),
    ReadInput(u8),
    I2cWrite(u8, u16, u8, Vec<u8>),
    I2cRead(u8, u16, u8, usize),
    I2cWriteRaw(u8, u16, Vec<u8>),
    I2cReadRaw(u8, u16, usize),
    OnewireList,
    OnewireRead(String),
}

#[derive(Default)]
struct Inner {
    calls: Vec<HwCall>,
    /// Current level of every pin driven through `set_output`.
    output_levels: HashMap<u8, bool>,
    /// Scripted input bits, consumed front-first; then `input_defaults`.
    input_queues: HashMap<u8, VecDeque<bool>>,
    input_defaults: HashMap<u8, bool>,
    /// Scripted I²C responses keyed by (bus, addr).
    i2c_queues: HashMap<(u8, u16), VecDeque<Vec<u8>>>,
    /// 1-Wire slave id -> w1_slave file contents.
    onewire_files: HashMap<String, String>,
}

pub struct StubHardware {
    inner: Mutex<Inner>,
    simulate: bool,
}

impl StubHardware {
    /// Stub with quiet defaults: inputs read LOW, unscripted I²C fails
    /// transiently, the 1-Wire tree is empty.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            simulate: false,
        }
    }

    /// Stub for `--dry-run`: unscripted devices answer with plausible
    /// simulated frames so a configured probe set produces data.
    pub fn simulated() -> Self {
        let mut inner = Inner::default();
        inner.onewire_files.insert(
            "28-00000dryrun0".to_string(),
            w1_slave_text(21_437, true),
        );
        Self {
            inner: Mutex::new(inner),
            simulate: true,
        }
    }

    // -- Test scripting ------------------------------------------------------

    pub fn set_input_default(&self, pin: u8, level: bool) {
        self.inner.lock().input_defaults.insert(pin, level);
    }

    /// Queue explicit levels returned by successive `read_input(pin)` calls.
    pub fn push_input_bits(&self, pin: u8, bits: &[bool]) {
        self.inner
            .lock()
            .input_queues
            .entry(pin)
            .or_default()
            .extend(bits.iter().copied());
    }

    pub fn push_i2c_response(&self, bus: u8, addr: u16, bytes: Vec<u8>) {
        self.inner
            .lock()
            .i2c_queues
            .entry((bus, addr))
            .or_default()
            .push_back(bytes);
    }

    pub fn add_onewire_slave(&self, id: &str, contents: &str) {
        self.inner
            .lock()
            .onewire_files
            .insert(id.to_string(), contents.to_string());
    }

    // -- Test inspection -----------------------------------------------------

    pub fn calls(&self) -> Vec<HwCall> {
        self.inner.lock().calls.clone()
    }

    pub fn output_level(&self, pin: u8) -> Option<bool> {
        self.inner.lock().output_levels.get(&pin).copied()
    }

    /// Levels of all `set_output(pin, ..)` calls for one pin, in order.
    pub fn edges(&self, pin: u8) -> Vec<bool> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                HwCall::SetOutput(p, level) if *p == pin => Some(*level),
                _ => None,
            })
            .collect()
    }
}

impl Default for StubHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for StubHardware {
    fn configure(&self, pin: u8, direction: PinDirection, pull: Pull) -> Result<()> {
        self.inner
            .lock()
            .calls
            .push(HwCall::Configure(pin, direction, pull));
        Ok(())
    }

    fn set_output(&self, pin: u8, level: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::SetOutput(pin, level));
        inner.output_levels.insert(pin, level);
        Ok(())
    }

    fn read_input(&self, pin: u8) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::ReadInput(pin));
        if let Some(queue) = inner.input_queues.get_mut(&pin) {
            if let Some(level) = queue.pop_front() {
                return Ok(level);
            }
        }
        Ok(inner.input_defaults.get(&pin).copied().unwrap_or(false))
    }

    fn i2c_write(&self, bus: u8, addr: u16, reg: u8, bytes: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .calls
            .push(HwCall::I2cWrite(bus, addr, reg, bytes.to_vec()));
        Ok(())
    }

    fn i2c_read(&self, bus: u8, addr: u16, reg: u8, len: usize) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .calls
            .push(HwCall::I2cRead(bus, addr, reg, len));
        self.pop_i2c(bus, addr, len)
    }

    fn i2c_write_raw(&self, bus: u8, addr: u16, bytes: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .calls
            .push(HwCall::I2cWriteRaw(bus, addr, bytes.to_vec()));
        Ok(())
    }

    fn i2c_read_raw(&self, bus: u8, addr: u16, len: usize) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .calls
            .push(HwCall::I2cReadRaw(bus, addr, len));
        self.pop_i2c(bus, addr, len)
    }

    fn onewire_list(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::OnewireList);
        let mut ids: Vec<String> = inner.onewire_files.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn onewire_read(&self, id: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::OnewireRead(id.to_string()));
        if self.simulate {
            if let Some(template) = inner.onewire_files.get(id) {
                // Re-generate with jitter so repeated dry-run reads vary.
                let _ = template;
                let millidegrees = 21_000 + (fastrand::i32(-800..800));
                return Ok(w1_slave_text(millidegrees, true));
            }
        }
        inner
            .onewire_files
            .get(id)
            .cloned()
            .ok_or_else(|| Error::persistent(format!("1-wire slave '{id}' not present")))
    }

    fn ndelay(&self, _ns: u64) {
        // Stubbed protocols are tested on edge sequences, not wall time.
    }
}

impl StubHardware {
    fn pop_i2c(&self, bus: u8, addr: u16, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.i2c_queues.get_mut(&(bus, addr)) {
            if let Some(bytes) = queue.pop_front() {
                return Ok(bytes);
            }
        }
        if self.simulate {
            return Ok(simulated_frame(len));
        }
        Err(Error::transient(format!(
            "no scripted i2c response for bus {bus} addr 0x{addr:02x}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Simulated device frames
// ---------------------------------------------------------------------------

/// Build a w1_slave file body as the kernel w1-therm driver formats it.
pub fn w1_slave_text(millidegrees: i32, crc_ok: bool) -> String {
    let crc = if crc_ok { "YES" } else { "NO" };
    format!(
        "53 01 4b 46 7f ff 0c 10 e9 : crc=e9 {crc}\n\
         53 01 4b 46 7f ff 0c 10 e9 t={millidegrees}\n"
    )
}

/// Sensirion-style frame: 16-bit words each followed by their CRC-8
/// (poly 0x31, init 0xff) — what an SHT4x answers to a measure command.
/// Simulated words hover around mid-scale with a little jitter.
fn simulated_frame(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() + 3 <= len {
        let word = 0x6000u16.wrapping_add(fastrand::u16(0..0x0800));
        let bytes = word.to_be_bytes();
        out.extend_from_slice(&bytes);
        out.push(sensirion_crc8(&bytes));
    }
    while out.len() < len {
        out.push(0);
    }
    out
}

fn sensirion_crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xff;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ===========================================================================
// Tests
// ===========================================================================
