//! Configuration management for midibox-sync
//!
//! Handles loading, parsing and validation of the YAML configuration file.
//! Every field has a default, so an empty file yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::fs;

use crate::device::Preset;
use crate::transport::register::layout::{GENERAL_LAYOUT_LEN, LAYER_LAYOUT_LEN};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Device-side keep-alive check; when off the watchdog never declares staleness
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<Preset>,
}

/// Which transport carries property updates
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Register read/write protocol over MIDI SysEx
    #[default]
    Register,
    /// Address-based messages over a TCP stream
    Bus,
}

/// Transport selection and endpoints
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub register: RegisterPortConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

/// MIDI port settings for the register transport
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterPortConfig {
    /// Port name (substring match when `find` is set)
    #[serde(default = "default_port_name")]
    pub port_name: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_true")]
    pub find: bool,
}

/// Endianness of the 4-byte length prefix
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Message-bus endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_host")]
    pub host: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
    /// Address prefix of every message, e.g. `/midibox`
    #[serde(default = "default_bus_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Inbound frames above this size end the session
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
}

/// Command codes of the register protocol (high nibble of the address byte)
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommandCodes {
    pub info: u8,
    pub update: u8,
    pub read_request: u8,
    pub read_response: u8,
    pub write_request: u8,
    pub write_ack: u8,
    pub write_nak: u8,
}

impl Default for CommandCodes {
    fn default() -> Self {
        Self {
            info: 0,
            update: 1,
            read_request: 2,
            read_response: 3,
            write_request: 4,
            write_ack: 5,
            write_nak: 6,
        }
    }
}

impl CommandCodes {
    fn all(&self) -> [u8; 7] {
        [
            self.info,
            self.update,
            self.read_request,
            self.read_response,
            self.write_request,
            self.write_ack,
            self.write_nak,
        ]
    }
}

/// Register protocol framing parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_sysex_id")]
    pub sysex_id: u8,
    /// Group index addressing the General block
    #[serde(default = "default_general_index")]
    pub general_index: u8,
    #[serde(default = "default_general_block_len")]
    pub general_block_len: u8,
    #[serde(default = "default_layer_block_len")]
    pub layer_block_len: u8,
    /// Largest payload carried by one frame
    #[serde(default = "default_max_payload")]
    pub max_payload: u8,
    #[serde(default)]
    pub commands: CommandCodes,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            sysex_id: default_sysex_id(),
            general_index: default_general_index(),
            general_block_len: default_general_block_len(),
            layer_block_len: default_layer_block_len(),
            max_payload: default_max_payload(),
            commands: CommandCodes::default(),
        }
    }
}

/// Timeouts, retries and watchdog thresholds (milliseconds)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Extra attempts per chunk after the first one times out
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_watchdog_tick")]
    pub watchdog_tick_ms: u64,
    /// Idle time after which a 1-byte probe read is sent
    #[serde(default = "default_probe_after")]
    pub probe_after_ms: u64,
    /// Idle time after which the connection is declared lost
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,
    /// Delay between reconnect attempts (register: grows linearly up to 10x)
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
    /// Extra attempts per chunk during a watchdog-driven resync
    #[serde(default = "default_reconnect_read_retries")]
    pub reconnect_read_retries: u32,
    /// Bounded wait when joining transport threads on disconnect
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout(),
            read_retries: default_read_retries(),
            watchdog_tick_ms: default_watchdog_tick(),
            probe_after_ms: default_probe_after(),
            stale_after_ms: default_stale_after(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            reconnect_read_retries: default_reconnect_read_retries(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_tick_ms)
    }

    pub fn probe_after(&self) -> Duration {
        Duration::from_millis(self.probe_after_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            protocol: ProtocolConfig::default(),
            timing: TimingConfig::default(),
            keep_alive: default_true(),
            presets: Vec::new(),
        }
    }
}

impl Default for RegisterPortConfig {
    fn default() -> Self {
        Self {
            port_name: default_port_name(),
            client_name: default_client_name(),
            find: true,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            prefix: default_bus_prefix(),
            byte_order: ByteOrder::Big,
            max_frame_bytes: default_max_frame(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_yaml(&contents).with_context(|| format!("Invalid config file: {}", path))
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        };

        config.validate()?;

        Ok(config)
    }

    /// Look up a preset by name (case-insensitive)
    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        let p = &self.protocol;

        if p.sysex_id > 0x7F {
            anyhow::bail!("sysex_id 0x{:02X} is not a 7-bit value", p.sysex_id);
        }

        let codes = p.commands.all();
        let unique: HashSet<u8> = codes.iter().copied().collect();
        if unique.len() != codes.len() {
            anyhow::bail!("protocol command codes must be distinct: {:?}", codes);
        }
        if let Some(c) = codes.iter().find(|c| **c >= 7) {
            // 7 << 4 would read as a SysEx start byte
            anyhow::bail!("command code {} out of range (0-6)", c);
        }

        if !(8..=15).contains(&p.general_index) {
            anyhow::bail!(
                "general_index {} collides with a layer index or exceeds 15",
                p.general_index
            );
        }

        if p.max_payload == 0 || p.max_payload > 127 {
            anyhow::bail!("max_payload must be in 1-127, got {}", p.max_payload);
        }

        if (p.general_block_len as usize) < GENERAL_LAYOUT_LEN || p.general_block_len > 127 {
            anyhow::bail!(
                "general_block_len {} must be in {}-127",
                p.general_block_len,
                GENERAL_LAYOUT_LEN
            );
        }
        if (p.layer_block_len as usize) < LAYER_LAYOUT_LEN || p.layer_block_len > 127 {
            anyhow::bail!(
                "layer_block_len {} must be in {}-127",
                p.layer_block_len,
                LAYER_LAYOUT_LEN
            );
        }

        let t = &self.timing;
        if t.read_timeout_ms == 0 || t.watchdog_tick_ms == 0 || t.join_timeout_ms == 0 {
            anyhow::bail!("read, tick and join timeouts must be non-zero");
        }
        if t.stale_after_ms <= t.probe_after_ms {
            anyhow::bail!(
                "stale_after_ms ({}) must exceed probe_after_ms ({})",
                t.stale_after_ms,
                t.probe_after_ms
            );
        }

        if self.transport.kind == TransportKind::Bus && !self.transport.bus.prefix.starts_with('/') {
            anyhow::bail!("bus prefix '{}' must start with '/'", self.transport.bus.prefix);
        }
        if self.transport.bus.max_frame_bytes == 0 {
            anyhow::bail!("bus max_frame_bytes must be positive");
        }

        let mut names = HashSet::new();
        for preset in &self.presets {
            if preset.name.is_empty() {
                anyhow::bail!("preset name cannot be empty");
            }
            if !names.insert(preset.name.to_lowercase()) {
                anyhow::bail!("duplicate preset '{}'", preset.name);
            }
        }

        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_port_name() -> String { "XIAO nRF52840".to_string() }
fn default_client_name() -> String { "midibox-sync".to_string() }
fn default_bus_host() -> String { "localhost".to_string() }
fn default_bus_port() -> u16 { 4302 }
fn default_bus_prefix() -> String { "/midibox".to_string() }
fn default_max_frame() -> usize { 1 << 20 }
fn default_sysex_id() -> u8 { 0x77 }
fn default_general_index() -> u8 { 15 }
fn default_general_block_len() -> u8 { GENERAL_LAYOUT_LEN as u8 }
fn default_layer_block_len() -> u8 { LAYER_LAYOUT_LEN as u8 }
fn default_max_payload() -> u8 { 64 }
fn default_read_timeout() -> u64 { 1000 }
fn default_read_retries() -> u32 { 3 }
fn default_watchdog_tick() -> u64 { 200 }
fn default_probe_after() -> u64 { 1000 }
fn default_stale_after() -> u64 { 2000 }
fn default_reconnect_backoff() -> u64 { 200 }
fn default_reconnect_read_retries() -> u32 { 1 }
fn default_join_timeout() -> u64 { 2000 }
