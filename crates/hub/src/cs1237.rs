//! CS1237 24-bit Σ-Δ ADC: three-wire bit-banged protocol and the per-chip
//! sampler thread.
//!
//! Wiring is SCK (output), DOUT (input, active-low data ready), DIN
//! (output). The board inverts DIN, so every transmitted bit goes onto the
//! wire inverted. A bit cell is SCK HIGH ~500 ns, sample/drive, SCK LOW
//! ~500 ns — timing that only holds on a plain OS thread busy-waiting
//! through `Hardware::ndelay`, never on the cooperative runtime. Each chip
//! gets one dedicated sampler thread that feeds a ring buffer; the
//! cooperative side only ever takes the O(1) ring lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hw::{Hardware, PinDirection, Pull};

/// Half of one SCK bit cell.
const T_HALF_NS: u64 = 500;

/// DOUT must drop within this long or the chip is considered absent/hung.
const READY_TIMEOUT: Duration = Duration::from_millis(500);

/// Register command words (7 bits, sent MSB first).
const CMD_WRITE_CONFIG: u8 = 0x65;
const CMD_READ_CONFIG: u8 = 0x56;

// ---------------------------------------------------------------------------
// Configuration register
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pga {
    X1,
    X2,
    X64,
    X128,
}

impl Pga {
    pub fn bits(self) -> u8 {
        match self {
            Self::X1 => 0,
            Self::X2 => 1,
            Self::X64 => 2,
            Self::X128 => 3,
        }
    }

    pub fn gain(self) -> f64 {
        match self {
            Self::X1 => 1.0,
            Self::X2 => 2.0,
            Self::X64 => 64.0,
            Self::X128 => 128.0,
        }
    }
}

impl TryFrom<u16> for Pga {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            1 => Ok(Self::X1),
            2 => Ok(Self::X2),
            64 => Ok(Self::X64),
            128 => Ok(Self::X128),
            _ => Err(Error::config("pga", format!("unsupported gain {v}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Hz10,
    Hz40,
    Hz640,
    Hz1280,
}

impl Speed {
    pub fn bits(self) -> u8 {
        match self {
            Self::Hz10 => 0,
            Self::Hz40 => 1,
            Self::Hz640 => 2,
            Self::Hz1280 => 3,
        }
    }

    pub fn sample_period(self) -> Duration {
        match self {
            Self::Hz10 => Duration::from_micros(100_000),
            Self::Hz40 => Duration::from_micros(25_000),
            Self::Hz640 => Duration::from_micros(1_562),
            Self::Hz1280 => Duration::from_micros(781),
        }
    }
}

impl TryFrom<u16> for Speed {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            10 => Ok(Self::Hz10),
            40 => Ok(Self::Hz40),
            640 => Ok(Self::Hz640),
            1280 => Ok(Self::Hz1280),
            _ => Err(Error::config("speed_hz", format!("unsupported rate {v}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Analog,
    Temperature,
}

impl Channel {
    pub fn bits(self) -> u8 {
        match self {
            Self::Analog => 0,
            Self::Temperature => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcConfig {
    pub pga: Pga,
    pub speed: Speed,
    pub channel: Channel,
    pub refo: bool,
}

impl AdcConfig {
    /// Pack into the chip's config register:
    /// `[5]=refo, [4]=channel, [3:2]=pga, [1:0]=speed`.
    pub fn register_byte(&self) -> u8 {
        (self.speed.bits() & 0x03)
            | ((self.pga.bits() & 0x03) << 2)
            | ((self.channel.bits() & 0x01) << 4)
            | ((self.refo as u8) << 5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcPins {
    pub sck: u8,
    pub dout: u8,
    pub din: u8,
}

// ---------------------------------------------------------------------------
// Value conversion
// ---------------------------------------------------------------------------

/// Sign-extend the 24-bit two's-complement wire value.
pub fn sign_extend_24(raw: u32) -> i32 {
    let raw = raw & 0x00ff_ffff;
    if raw & 0x0080_0000 != 0 {
        (raw as i32) - 0x0100_0000
    } else {
        raw as i32
    }
}

/// Convert signed counts to input-referred millivolts.
pub fn counts_to_millivolts(raw: i32, vref_mv: f64, gain: f64) -> f64 {
    (raw as f64 / 0x007f_ffff as f64) * vref_mv / gain
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

pub struct Protocol {
    hw: Arc<dyn Hardware>,
    pins: AdcPins,
}

impl Protocol {
    pub fn new(hw: Arc<dyn Hardware>, pins: AdcPins) -> Self {
        Self { hw, pins }
    }

    /// Claim the three lines and wake the chip with one long SCK pulse.
    pub fn init(&self) -> Result<()> {
        self.hw
            .configure(self.pins.sck, PinDirection::Output, Pull::None)?;
        self.hw
            .configure(self.pins.dout, PinDirection::Input, Pull::Up)?;
        self.hw
            .configure(self.pins.din, PinDirection::Output, Pull::None)?;
        self.hw.set_output(self.pins.sck, false)?;
        self.hw.set_output(self.pins.din, false)?;

        // Power-up wake pulse.
        self.hw.set_output(self.pins.sck, true)?;
        std::thread::sleep(Duration::from_millis(1));
        self.hw.set_output(self.pins.sck, false)?;
        Ok(())
    }

    /// Block until DOUT drops (data ready), or fail transiently.
    pub fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;
        while self.hw.read_input(self.pins.dout)? {
            if Instant::now() > deadline {
                return Err(Error::transient(format!(
                    "cs1237 sck={} data-ready timeout",
                    self.pins.sck
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn clock_in_bit(&self) -> Result<bool> {
        self.hw.set_output(self.pins.sck, true)?;
        self.hw.ndelay(T_HALF_NS);
        let bit = self.hw.read_input(self.pins.dout)?;
        self.hw.set_output(self.pins.sck, false)?;
        self.hw.ndelay(T_HALF_NS);
        Ok(bit)
    }

    /// DIN is inverted by the board, so the wire carries `!bit`.
    fn clock_out_bit(&self, bit: bool) -> Result<()> {
        self.hw.set_output(self.pins.din, !bit)?;
        self.hw.set_output(self.pins.sck, true)?;
        self.hw.ndelay(T_HALF_NS);
        self.hw.set_output(self.pins.sck, false)?;
        self.hw.ndelay(T_HALF_NS);
        Ok(())
    }

    fn clock_dummy(&self, cells: u32) -> Result<()> {
        for _ in 0..cells {
            self.hw.set_output(self.pins.sck, true)?;
            self.hw.ndelay(T_HALF_NS);
            self.hw.set_output(self.pins.sck, false)?;
            self.hw.ndelay(T_HALF_NS);
        }
        Ok(())
    }

    /// One conversion: 24 data bits MSB-first with DIN held LOW, then three
    /// terminating cells, then the wire check.
    pub fn read_sample(&self) -> Result<i32> {
        self.wait_ready()?;
        self.hw.set_output(self.pins.din, false)?;

        let mut value: u32 = 0;
        for _ in 0..24 {
            value = (value << 1) | self.clock_in_bit()? as u32;
        }
        self.clock_dummy(3)?;

        // DOUT should return HIGH within five cells; a wedged wire means
        // the next "ready" edge would be garbage.
        let mut wire_ok = false;
        for _ in 0..5 {
            if self.hw.read_input(self.pins.dout)? {
                wire_ok = true;
                break;
            }
            self.clock_dummy(1)?;
        }
        if !wire_ok {
            warn!(
                sck = self.pins.sck,
                "cs1237 wire-check: DOUT did not return high after sample"
            );
        }

        Ok(sign_extend_24(value))
    }

    /// Shared preamble of both register operations: discard one conversion,
    /// read the two status cells, pull DOUT high, switch it, then send the
    /// 7-bit command word.
    fn register_preamble(&self, command: u8) -> Result<()> {
        self.wait_ready()?;
        self.clock_dummy(24)?; // conversion data, discarded
        self.clock_dummy(2)?; // cells 25-26: write-status
        self.clock_dummy(1)?; // cell 27: pulls DOUT high
        self.clock_dummy(2)?; // cells 28-29: DOUT switches to input
        for i in 0..7 {
            let bit = (command >> (6 - i)) & 0x01 != 0;
            self.clock_out_bit(bit)?;
        }
        Ok(())
    }

    /// Write the configuration register and leave DIN LOW for sampling.
    pub fn write_config(&self, byte: u8) -> Result<()> {
        self.register_preamble(CMD_WRITE_CONFIG)?;
        self.clock_dummy(1)?; // cell 37: direction switch
        for i in 0..8 {
            let bit = (byte >> (7 - i)) & 0x01 != 0;
            self.clock_out_bit(bit)?;
        }
        self.hw.set_output(self.pins.din, false)?;
        Ok(())
    }

    /// Read the configuration register back; DOUT carries the payload on
    /// the rising edges after the switch cell.
    pub fn read_config(&self) -> Result<u8> {
        self.register_preamble(CMD_READ_CONFIG)?;
        self.clock_dummy(1)?; // cell 37: DOUT becomes output
        let mut byte: u8 = 0;
        for _ in 0..8 {
            byte = (byte << 1) | self.clock_in_bit()? as u8;
        }
        self.hw.set_output(self.pins.din, false)?;
        Ok(byte)
    }
}

// ---------------------------------------------------------------------------
// Sampler thread
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub vref_mv: f64,
    pub buffer_size: usize,
    pub median_window: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            vref_mv: 3300.0,
            buffer_size: 20,
            median_window: 5,
        }
    }
}

#[derive(Debug, Default)]
struct RingState {
    latest_raw: Option<i32>,
    latest_mv: Option<f64>,
    ring: VecDeque<f64>,
    running_sum: f64,
    sample_count: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<RingState>,
    stop: AtomicBool,
}

/// Continuous sampler for one CS1237. Owns the protocol and a dedicated
/// OS thread running at ~95% of the nominal sample period; readers pick
/// samples out of the shared ring.
#[derive(Debug)]
pub struct AdcSampler {
    shared: Arc<Shared>,
    gain: f64,
    median_window: usize,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AdcSampler {
    /// Configure the chip (with register read-back verification) and start
    /// the sampling thread.
    pub fn spawn(
        hw: Arc<dyn Hardware>,
        pins: AdcPins,
        adc: AdcConfig,
        cfg: SamplerConfig,
    ) -> Result<Self> {
        let proto = Protocol::new(Arc::clone(&hw), pins);
        proto.init()?;
        proto.wait_ready().map_err(|_| {
            Error::persistent(format!("cs1237 sck={} not responding at open", pins.sck))
        })?;
        let register = adc.register_byte();
        proto.write_config(register)?;
        let echoed = proto.read_config()?;
        if echoed != register {
            warn!(
                sck = pins.sck,
                wrote = format_args!("0x{register:02x}"),
                read = format_args!("0x{echoed:02x}"),
                "cs1237 config read-back mismatch"
            );
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(RingState::default()),
            stop: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let gain = adc.pga.gain();
        // 95% of the nominal period keeps the loop slightly ahead of the
        // chip so a ready sample is never skipped.
        let pause = adc.speed.sample_period().mul_f64(0.95);

        let thread = std::thread::Builder::new()
            .name(format!("cs1237-sck{}", pins.sck))
            .spawn(move || {
                sampler_loop(proto, worker_shared, cfg, gain, pause);
            })
            .map_err(|e| Error::persistent(format!("sampler thread: {e}")))?;

        Ok(Self {
            shared,
            gain,
            median_window: cfg.median_window,
            thread: Some(thread),
        })
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn latest_raw(&self) -> Option<i32> {
        self.shared.state.lock().latest_raw
    }

    pub fn latest_millivolts(&self) -> Option<f64> {
        self.shared.state.lock().latest_mv
    }

    pub fn sample_count(&self) -> u64 {
        self.shared.state.lock().sample_count
    }

    /// Running mean over everything the ring has seen.
    pub fn running_mean_millivolts(&self) -> Option<f64> {
        let state = self.shared.state.lock();
        (state.sample_count > 0).then(|| state.running_sum / state.sample_count as f64)
    }

    /// Median-filtered mean over the ring: each window of `median_window`
    /// consecutive samples collapses to its median, and the medians are
    /// averaged. Falls back to a plain mean for short rings.
    pub fn filtered_millivolts(&self) -> Option<f64> {
        let state = self.shared.state.lock();
        if state.ring.is_empty() {
            return state.latest_mv;
        }
        let samples: Vec<f64> = state.ring.iter().copied().collect();
        Some(median_filtered_mean(&samples, self.median_window))
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AdcSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sampler_loop(
    proto: Protocol,
    shared: Arc<Shared>,
    cfg: SamplerConfig,
    gain: f64,
    pause: Duration,
) {
    while !shared.stop.load(Ordering::Relaxed) {
        match proto.read_sample() {
            Ok(raw) => {
                let mv = counts_to_millivolts(raw, cfg.vref_mv, gain);
                let mut state = shared.state.lock();
                state.latest_raw = Some(raw);
                state.latest_mv = Some(mv);
                state.ring.push_back(mv);
                while state.ring.len() > cfg.buffer_size {
                    state.ring.pop_front();
                }
                state.running_sum += mv;
                state.sample_count += 1;
                drop(state);
                std::thread::sleep(pause);
            }
            Err(e) => {
                debug!("cs1237 sample retry: {e}");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

pub fn median_filtered_mean(samples: &[f64], window: usize) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    if samples.len() < window || window == 0 {
        return samples.iter().sum::<f64>() / samples.len() as f64;
    }
    let mut medians = Vec::with_capacity(samples.len() - window + 1);
    for chunk in samples.windows(window) {
        let mut sorted = chunk.to_vec();
        sorted.sort_by(f64::total_cmp);
        medians.push(sorted[window / 2]);
    }
    medians.iter().sum::<f64>() / medians.len() as f64
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::stub::StubHardware;

    const PINS: AdcPins = AdcPins {
        sck: 11,
        dout: 18,
        din: 13,
    };

    fn default_config() -> AdcConfig {
        AdcConfig {
            pga: Pga::X1,
            speed: Speed::Hz10,
            channel: Channel::Analog,
            refo: false,
        }
    }

    /// Script one full conversion on DOUT: ready (LOW), 24 data bits
    /// MSB-first, then the wire-check HIGH.
    fn script_sample(hw: &StubHardware, value: u32) {
        let mut bits = vec![false]; // data-ready poll sees LOW
        for i in (0..24).rev() {
            bits.push((value >> i) & 1 != 0);
        }
        bits.push(true); // wire check: DOUT back HIGH
        hw.push_input_bits(PINS.dout, &bits);
    }

    // -- Register packing ----------------------------------------------------

    #[test]
    fn register_byte_packs_fields() {
        let cfg = AdcConfig {
            pga: Pga::X128,
            speed: Speed::Hz10,
            channel: Channel::Analog,
            refo: false,
        };
        // speed=00, pga=11, channel=0, refo=0 -> 0b0000_1100
        assert_eq!(cfg.register_byte(), 0x0c);
    }

    #[test]
    fn register_byte_sets_channel_and_refo() {
        let cfg = AdcConfig {
            pga: Pga::X1,
            speed: Speed::Hz1280,
            channel: Channel::Temperature,
            refo: true,
        };
        // speed=11, pga=00, channel=1, refo=1 -> 0b0011_0011
        assert_eq!(cfg.register_byte(), 0x33);
    }

    #[test]
    fn pga_from_numeric_gain() {
        assert_eq!(Pga::try_from(128).unwrap(), Pga::X128);
        assert_eq!(Pga::try_from(1).unwrap(), Pga::X1);
        assert!(Pga::try_from(4).is_err());
    }

    #[test]
    fn speed_from_numeric_rate() {
        assert_eq!(Speed::try_from(10).unwrap(), Speed::Hz10);
        assert_eq!(Speed::try_from(1280).unwrap(), Speed::Hz1280);
        assert!(Speed::try_from(100).is_err());
    }

    #[test]
    fn speed_sample_periods() {
        assert_eq!(Speed::Hz10.sample_period(), Duration::from_millis(100));
        assert_eq!(Speed::Hz40.sample_period(), Duration::from_millis(25));
    }

    // -- Sign extension & conversion -----------------------------------------

    #[test]
    fn sign_extend_negative_full_scale() {
        assert_eq!(sign_extend_24(0x80_0000), -8_388_608);
    }

    #[test]
    fn sign_extend_positive_full_scale() {
        assert_eq!(sign_extend_24(0x7f_ffff), 8_388_607);
    }

    #[test]
    fn sign_extend_zero_and_minus_one() {
        assert_eq!(sign_extend_24(0), 0);
        assert_eq!(sign_extend_24(0xff_ffff), -1);
    }

    #[test]
    fn counts_to_millivolts_negative_full_scale() {
        // PGA 1, 3300 mV reference: full negative scale reads -3300 mV.
        let mv = counts_to_millivolts(-8_388_608, 3300.0, 1.0);
        assert!((mv + 3300.0).abs() < 0.01, "got {mv}");
    }

    #[test]
    fn counts_to_millivolts_scales_by_gain() {
        let mv = counts_to_millivolts(8_388_607, 3300.0, 128.0);
        assert!((mv - 3300.0 / 128.0).abs() < 0.01);
    }

    // -- Protocol read --------------------------------------------------------

    #[test]
    fn read_sample_decodes_scripted_pattern() {
        let hw = Arc::new(StubHardware::new());
        script_sample(&hw, 0x80_0000);
        let proto = Protocol::new(hw.clone() as Arc<dyn Hardware>, PINS);

        let raw = proto.read_sample().unwrap();
        assert_eq!(raw, -8_388_608);
    }

    #[test]
    fn read_sample_clocks_27_cells() {
        let hw = Arc::new(StubHardware::new());
        script_sample(&hw, 0x2a_55aa);
        let proto = Protocol::new(hw.clone() as Arc<dyn Hardware>, PINS);
        proto.read_sample().unwrap();

        // 24 data cells + 3 terminate cells, each one rising edge; the
        // scripted wire check passes without extra cells.
        let rising = hw
            .edges(PINS.sck)
            .iter()
            .filter(|&&level| level)
            .count();
        assert_eq!(rising, 27);
    }

    #[test]
    fn read_sample_positive_value() {
        let hw = Arc::new(StubHardware::new());
        script_sample(&hw, 0x12_3456);
        let proto = Protocol::new(hw.clone() as Arc<dyn Hardware>, PINS);
        assert_eq!(proto.read_sample().unwrap(), 0x12_3456);
    }

    #[test]
    fn stuck_high_dout_times_out_transiently() {
        let hw = Arc::new(StubHardware::new());
        hw.set_input_default(PINS.dout, true); // never ready
        let proto = Protocol::new(hw.clone() as Arc<dyn Hardware>, PINS);

        let err = proto.read_sample().unwrap_err();
        assert!(err.is_transient());
    }

    // -- Protocol write -------------------------------------------------------

    #[test]
    fn write_config_inverts_bits_on_the_wire() {
        let hw = Arc::new(StubHardware::new());
        hw.set_input_default(PINS.dout, false); // always ready
        let proto = Protocol::new(hw.clone() as Arc<dyn Hardware>, PINS);

        proto.write_config(0x0c).unwrap();

        let din_levels = hw.edges(PINS.din);
        // Last write parks DIN LOW for sampling.
        assert_eq!(din_levels.last(), Some(&false));

        // The 15 levels before the final park are the 7 command bits of
        // 0x65 then the 8 payload bits of 0x0c, each inverted.
        let n = din_levels.len();
        let sent = &din_levels[n - 16..n - 1];
        let mut expected = Vec::new();
        for i in 0..7 {
            expected.push((CMD_WRITE_CONFIG >> (6 - i)) & 1 == 0);
        }
        for i in 0..8 {
            expected.push((0x0c >> (7 - i)) & 1 == 0);
        }
        assert_eq!(sent, expected.as_slice());
    }

    #[test]
    fn read_config_decodes_payload_from_dout() {
        let hw = Arc::new(StubHardware::new());
        // Ready poll LOW, then the payload byte 0x2d on the 8 post-switch
        // rising edges; every earlier cell just clocks dummies (no reads).
        let mut bits = vec![false];
        for i in (0..8).rev() {
            bits.push((0x2d >> i) & 1 != 0);
        }
        hw.push_input_bits(PINS.dout, &bits);

        let proto = Protocol::new(hw.clone() as Arc<dyn Hardware>, PINS);
        assert_eq!(proto.read_config().unwrap(), 0x2d);
    }

    // -- Sampler --------------------------------------------------------------

    #[test]
    fn sampler_captures_scripted_sample() {
        let hw = Arc::new(StubHardware::new());
        // init(): wait_ready poll; write_config: ready poll; read_config:
        // ready poll + 8 payload bits (zeros fine). Then one conversion.
        hw.push_input_bits(PINS.dout, &[false, false, false]);
        hw.push_input_bits(PINS.dout, &[false; 8]); // read-back payload
        script_sample(&hw, 0x80_0000);
        hw.set_input_default(PINS.dout, true); // no further samples

        let mut sampler = AdcSampler::spawn(
            hw.clone() as Arc<dyn Hardware>,
            PINS,
            default_config(),
            SamplerConfig::default(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while sampler.latest_raw().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(sampler.latest_raw(), Some(-8_388_608));
        let mv = sampler.latest_millivolts().unwrap();
        assert!((mv + 3300.0).abs() < 0.01);
        assert_eq!(sampler.sample_count(), 1);
        sampler.stop();
    }

    #[test]
    fn sampler_open_fails_persistent_when_chip_absent() {
        let hw = Arc::new(StubHardware::new());
        hw.set_input_default(PINS.dout, true); // DOUT never drops
        let err = AdcSampler::spawn(
            hw as Arc<dyn Hardware>,
            PINS,
            default_config(),
            SamplerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Persistent(_)));
    }

    // -- Median-filtered mean -------------------------------------------------

    #[test]
    fn median_filter_suppresses_outlier() {
        // One 1000.0 spike in otherwise flat data.
        let samples = [5.0, 5.0, 5.0, 1000.0, 5.0, 5.0, 5.0];
        let filtered = median_filtered_mean(&samples, 5);
        assert!(
            (filtered - 5.0).abs() < 1e-9,
            "spike should vanish, got {filtered}"
        );
    }

    #[test]
    fn short_ring_falls_back_to_plain_mean() {
        let samples = [1.0, 3.0];
        assert!((median_filtered_mean(&samples, 5) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn empty_ring_mean_is_zero() {
        assert_eq!(median_filtered_mean(&[], 5), 0.0);
    }
}
