//! Sensor and group configuration
//!
//! [`SensorConfig`] is what the application asks a device to do;
//! [`GroupConfig`] fixes the board-level timing used during bring-up and
//! non-blocking readout.

use fugit::MillisDurationU32;

use crate::constants::{
    NUM_THRESHOLDS, DEFAULT_LOCK_POLL_MS, DEFAULT_LOCK_RETRIES, DEFAULT_NB_TIMEOUT_MS,
    DEFAULT_RESET_HOLD_MS, DEFAULT_RTC_PULSE_MS,
};

/// Operating mode
///
/// Discriminants are the values written to the firmware mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Mode {
    /// Powered, not measuring
    #[default]
    Idle = 0x00,
    /// Measures on its own timer, ignores triggers
    FreeRunning = 0x02,
    /// Transmits and listens on each trigger
    TriggeredTxRx = 0x10,
    /// Listens only, for pitch-catch with a transmitting peer
    TriggeredRxOnly = 0x20,
}

impl Mode {
    /// Register value
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Decode a register value
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x00 => Some(Self::Idle),
            0x02 => Some(Self::FreeRunning),
            0x10 => Some(Self::TriggeredTxRx),
            0x20 => Some(Self::TriggeredRxOnly),
            _ => None,
        }
    }

    /// Mode responds to the trigger line
    pub const fn is_triggered(self) -> bool {
        matches!(self, Self::TriggeredTxRx | Self::TriggeredRxOnly)
    }

    /// Mode takes part in measurement cycles
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// How a time-of-flight reading is turned into a distance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RangeKind {
    /// Distance to the target (round trip halved)
    OneWay,
    /// Full out-and-back path
    RoundTrip,
    /// Transmitter to receiver, for pitch-catch receivers
    Direct,
}

/// Blocking or queued readout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IoMode {
    /// Read now, in the caller's context
    Blocking,
    /// Queue for the next [`Group::start_nb`](crate::Group::start_nb) round
    NonBlocking,
}

/// Reset style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResetKind {
    /// Toggle the reset line
    Hard,
    /// Reset through the programming interface
    Soft,
}

/// One detection threshold segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Threshold {
    /// First sample this level applies to
    pub start_sample: u16,
    /// Minimum amplitude counted as an echo
    pub level: u16,
}

impl Threshold {
    /// Build a segment
    pub const fn new(start_sample: u16, level: u16) -> Self {
        Self { start_sample, level }
    }
}

/// Multi-threshold detection table
///
/// Segments apply from their start sample until the next segment starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Thresholds(pub [Threshold; NUM_THRESHOLDS]);

impl Thresholds {
    /// Table tuned for the long-range part: high near field, low far field
    pub const fn long_range() -> Self {
        Self([
            Threshold::new(0, 5000),
            Threshold::new(26, 2000),
            Threshold::new(39, 800),
            Threshold::new(56, 400),
            Threshold::new(79, 250),
            Threshold::new(89, 175),
        ])
    }

    /// Entries in order
    pub fn entries(&self) -> &[Threshold; NUM_THRESHOLDS] {
        &self.0
    }

    /// Start samples must be non-decreasing and begin at zero
    pub fn is_well_formed(&self) -> bool {
        self.0[0].start_sample == 0
            && self.0.windows(2).all(|w| w[0].start_sample <= w[1].start_sample)
    }
}

/// Per-device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorConfig {
    /// Operating mode
    pub mode: Mode,
    /// Maximum detection range (mm)
    pub max_range_mm: u16,
    /// Near-field samples ignored for static target rejection
    pub static_range: u16,
    /// Free-running measurement interval (ms), zero otherwise
    pub sample_interval_ms: u16,
    /// Detection thresholds, only for variants that support them
    pub thresholds: Option<Thresholds>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Idle,
            max_range_mm: 0,
            static_range: 0,
            sample_interval_ms: 0,
            thresholds: None,
        }
    }
}

impl SensorConfig {
    /// Default range and intervals in `mode`
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            max_range_mm: 750,
            ..Self::default()
        }
    }

    /// 750 mm triggered transmit/receive, the usual bench setup
    pub fn bench() -> Self {
        Self::new(Mode::TriggeredTxRx)
    }

    /// Free-running at `interval_ms`
    pub fn free_running(interval_ms: u16) -> Self {
        Self::new(Mode::FreeRunning).with_sample_interval(interval_ms)
    }

    /// Set the mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the maximum range
    pub fn with_max_range(mut self, mm: u16) -> Self {
        self.max_range_mm = mm;
        self
    }

    /// Set the static target rejection range
    pub fn with_static_range(mut self, samples: u16) -> Self {
        self.static_range = samples;
        self
    }

    /// Set the free-running interval
    pub fn with_sample_interval(mut self, ms: u16) -> Self {
        self.sample_interval_ms = ms;
        self
    }

    /// Attach a threshold table
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }
}

/// Board-level timing
///
/// `fugit` durations keep units explicit at the call site:
///
/// ```rust
/// use echogroup_core::GroupConfig;
/// use fugit::ExtU32;
///
/// let config = GroupConfig::default().with_nb_timeout(20.millis());
/// assert_eq!(config.nb_timeout.to_millis(), 20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    /// Number of slots wired on the board
    pub num_ports: u8,
    /// RTC calibration pulse length
    pub rtc_pulse: MillisDurationU32,
    /// Reset line hold time
    pub reset_hold: MillisDurationU32,
    /// Delay between lock polls
    pub lock_poll: MillisDurationU32,
    /// Lock polls before giving up on a slot
    pub lock_retries: u16,
    /// Bound on a non-blocking readout round
    pub nb_timeout: MillisDurationU32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            num_ports: 4,
            rtc_pulse: MillisDurationU32::millis(DEFAULT_RTC_PULSE_MS),
            reset_hold: MillisDurationU32::millis(DEFAULT_RESET_HOLD_MS),
            lock_poll: MillisDurationU32::millis(DEFAULT_LOCK_POLL_MS),
            lock_retries: DEFAULT_LOCK_RETRIES,
            nb_timeout: MillisDurationU32::millis(DEFAULT_NB_TIMEOUT_MS),
        }
    }
}

impl GroupConfig {
    /// Defaults for a board with `num_ports` slots
    pub fn with_ports(num_ports: u8) -> Self {
        Self { num_ports, ..Self::default() }
    }

    /// Short pulses and few retries, for simulated boards
    pub fn fast() -> Self {
        Self {
            rtc_pulse: MillisDurationU32::millis(10),
            lock_retries: 10,
            ..Self::default()
        }
    }

    /// Override the RTC pulse
    pub fn with_rtc_pulse(mut self, pulse: MillisDurationU32) -> Self {
        self.rtc_pulse = pulse;
        self
    }

    /// Override lock retries
    pub fn with_lock_retries(mut self, retries: u16) -> Self {
        self.lock_retries = retries;
        self
    }

    /// Override the non-blocking bound
    pub fn with_nb_timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.nb_timeout = timeout;
        self
    }
}
