//! Engine configuration
//!
//! [`EngineSettings`] holds the plain, serializable part of the configuration
//! (line settings, cadences, limits) and can be loaded from JSON.
//! [`EngineConfig`] adds the behavioral parts that only exist in code:
//! the framer, global response rules and interceptor chains.
//!
//! ```
//! use serialflow_core::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .device_path("/dev/ttyUSB0")
//!     .baud_rate(115200)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.settings().max_queue_size, 100);
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::framer::{Framer, FramerFactory, Framing};
use crate::interceptor::{Interceptor, Pipeline};
use crate::request::{Request, Response, ResponseRule};

/// Reconnect attempt counts above this are treated as unlimited
pub const UNLIMITED_RECONNECT_THRESHOLD: u32 = 100;

pub const MIN_RECONNECT_INTERVAL_MS: u64 = 500;
pub const MIN_SEND_INTERVAL_MS: u64 = 100;
pub const MIN_READ_INTERVAL_MS: u64 = 10;
pub const MAX_QUEUE_SIZE: usize = 10_000;

/// Parity bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl TryFrom<u8> for Parity {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Parity::None),
            1 => Ok(Parity::Odd),
            2 => Ok(Parity::Even),
            other => Err(ConfigError::InvalidParity(other)),
        }
    }
}

impl From<Parity> for u8 {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
        }
    }
}

/// Order in which the send loop drains the ready queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    /// Most recently submitted request is written first
    #[default]
    Lifo,
    /// Requests are written in submission order
    Fifo,
}

/// Line settings passed to the transport when opening the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// Device node (e.g., "/dev/ttyS1")
    pub device_path: String,

    pub baud_rate: u32,

    /// Raw open flags, passed through to the transport
    pub flags: u32,

    pub data_bits: u8,

    pub stop_bits: u8,

    pub parity: Parity,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            baud_rate: 0,
            flags: 0,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Serializable engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    #[serde(flatten)]
    pub port: PortSettings,

    /// 0 disables automatic reconnection
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnect attempts
    pub reconnect_interval_ms: u64,

    /// Send loop cadence
    pub send_interval_ms: u64,

    /// Read loop cadence
    pub read_interval_ms: u64,

    /// Ready queue capacity
    pub max_queue_size: usize,

    pub queue_order: QueueOrder,

    pub framing: Framing,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            port: PortSettings::default(),
            max_reconnect_attempts: 3,
            reconnect_interval_ms: 1000,
            send_interval_ms: 300,
            read_interval_ms: 50,
            max_queue_size: 100,
            queue_order: QueueOrder::Lifo,
            framing: Framing::Greedy,
        }
    }
}

impl EngineSettings {
    /// Parse settings from a JSON document; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Range-check every field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.device_path.trim().is_empty() {
            return Err(ConfigError::Missing("device_path"));
        }
        if self.port.baud_rate == 0 {
            return Err(ConfigError::Missing("baud_rate"));
        }
        if !(5..=8).contains(&self.port.data_bits) {
            return Err(out_of_range("data_bits", "must be 5-8", self.port.data_bits));
        }
        if !(1..=2).contains(&self.port.stop_bits) {
            return Err(out_of_range("stop_bits", "must be 1 or 2", self.port.stop_bits));
        }
        if self.reconnect_interval_ms < MIN_RECONNECT_INTERVAL_MS {
            return Err(out_of_range(
                "reconnect_interval_ms",
                "must be at least 500",
                self.reconnect_interval_ms,
            ));
        }
        if self.send_interval_ms < MIN_SEND_INTERVAL_MS {
            return Err(out_of_range(
                "send_interval_ms",
                "must be at least 100",
                self.send_interval_ms,
            ));
        }
        if self.read_interval_ms < MIN_READ_INTERVAL_MS {
            return Err(out_of_range(
                "read_interval_ms",
                "must be at least 10",
                self.read_interval_ms,
            ));
        }
        if !(1..=MAX_QUEUE_SIZE).contains(&self.max_queue_size) {
            return Err(out_of_range(
                "max_queue_size",
                "must be 1-10000",
                self.max_queue_size,
            ));
        }
        if let Framing::FixedLength { length } = self.framing {
            if length == 0 {
                return Err(out_of_range("framing.length", "must be at least 1", length));
            }
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    /// Whether reconnection never gives up
    pub fn unlimited_reconnect(&self) -> bool {
        self.max_reconnect_attempts > UNLIMITED_RECONNECT_THRESHOLD
    }
}

fn out_of_range(field: &'static str, rule: &str, value: impl fmt::Display) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: format!("{rule}, got {value}"),
    }
}

/// Complete, validated engine configuration
///
/// Immutable once built; the engine shares it between its tasks.
#[derive(Clone)]
pub struct EngineConfig {
    settings: EngineSettings,
    framer: FramerFactory,
    global_rules: Vec<Arc<dyn ResponseRule>>,
    request_interceptors: Pipeline<Request>,
    response_interceptors: Pipeline<Response>,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn port(&self) -> &PortSettings {
        &self.settings.port
    }

    /// Build the configured framer
    pub fn new_framer(&self) -> Box<dyn Framer> {
        (self.framer)()
    }

    pub fn global_rules(&self) -> &[Arc<dyn ResponseRule>] {
        &self.global_rules
    }

    pub fn request_interceptors(&self) -> &Pipeline<Request> {
        &self.request_interceptors
    }

    pub fn response_interceptors(&self) -> &Pipeline<Response> {
        &self.response_interceptors
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("settings", &self.settings)
            .field("global_rules", &self.global_rules.len())
            .field("request_interceptors", &self.request_interceptors)
            .field("response_interceptors", &self.response_interceptors)
            .finish()
    }
}

/// Builder for [`EngineConfig`]
#[derive(Default)]
pub struct EngineConfigBuilder {
    settings: EngineSettings,
    framer: Option<FramerFactory>,
    global_rules: Vec<Arc<dyn ResponseRule>>,
    request_interceptors: Pipeline<Request>,
    response_interceptors: Pipeline<Response>,
}

impl EngineConfigBuilder {
    /// Start from previously loaded settings
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn device_path(mut self, path: impl Into<String>) -> Self {
        self.settings.port.device_path = path.into();
        self
    }

    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.settings.port.baud_rate = baud;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.settings.port.flags = flags;
        self
    }

    pub fn data_bits(mut self, bits: u8) -> Self {
        self.settings.port.data_bits = bits;
        self
    }

    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.settings.port.stop_bits = bits;
        self
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.port.parity = parity;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.settings.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn send_interval(mut self, interval: Duration) -> Self {
        self.settings.send_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn read_interval(mut self, interval: Duration) -> Self {
        self.settings.read_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.settings.max_queue_size = size;
        self
    }

    pub fn queue_order(mut self, order: QueueOrder) -> Self {
        self.settings.queue_order = order;
        self
    }

    /// Pick a built-in framing strategy
    pub fn framing(mut self, framing: Framing) -> Self {
        self.settings.framing = framing;
        self.framer = None;
        self
    }

    /// Use a custom framer; overrides [`framing`](Self::framing)
    pub fn framer<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Framer> + Send + Sync + 'static,
    {
        self.framer = Some(Arc::new(factory));
        self
    }

    /// Rule used for requests that bring none of their own
    pub fn add_response_rule(mut self, rule: impl ResponseRule + 'static) -> Self {
        self.global_rules.push(Arc::new(rule));
        self
    }

    pub fn add_request_interceptor(mut self, interceptor: impl Interceptor<Request> + 'static) -> Self {
        self.request_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn add_response_interceptor(
        mut self,
        interceptor: impl Interceptor<Response> + 'static,
    ) -> Self {
        self.response_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.settings.validate()?;
        let framer = match self.framer {
            Some(factory) => factory,
            None => {
                let framing = self.settings.framing;
                Arc::new(move || framing.build()) as FramerFactory
            }
        };
        Ok(EngineConfig {
            settings: self.settings,
            framer,
            global_rules: self.global_rules,
            request_interceptors: self.request_interceptors,
            response_interceptors: self.response_interceptors,
        })
    }
}
