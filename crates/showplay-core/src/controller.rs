//! Controller descriptors
//!
//! `ControllerSetup` is produced by the layout/configuration reader and consumed
//! here as static input. Opening a set of controllers yields one
//! `OpenControllerReport` per setup.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// Wire protocol spoken by a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerProtocol {
    /// Distributed Display Protocol
    Ddp,
    /// E1.31 / sACN
    #[serde(alias = "sacn", alias = "e1.31")]
    E131,
}

impl ControllerProtocol {
    pub fn default_port(&self) -> u16 {
        match self {
            ControllerProtocol::Ddp => 4048,
            ControllerProtocol::E131 => 5568,
        }
    }
}

impl fmt::Display for ControllerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerProtocol::Ddp => write!(f, "DDP"),
            ControllerProtocol::E131 => write!(f, "E1.31"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One physical controller and the channel range it receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSetup {
    pub name: String,
    /// Host name or IP address
    pub address: String,
    pub protocol: ControllerProtocol,
    /// First channel sent to this controller (1-based, absolute)
    pub start_channel: u32,
    pub channel_count: u32,
    /// Usable on this host (e.g. reachable network)
    #[serde(default = "default_true")]
    pub usable: bool,
    /// Explicitly excluded from output by the user
    #[serde(default)]
    pub skipped: bool,
    /// Override of the protocol's default UDP port
    #[serde(default)]
    pub port: Option<u16>,
    /// First E1.31 universe (ignored for DDP)
    #[serde(default)]
    pub universe: Option<u16>,
}

impl ControllerSetup {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        protocol: ControllerProtocol,
        start_channel: u32,
        channel_count: u32,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            protocol,
            start_channel,
            channel_count,
            usable: true,
            skipped: false,
            port: None,
            universe: None,
        }
    }

    /// Destination port, protocol default unless overridden
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Byte offset of this controller's first channel within a frame
    pub fn frame_offset(&self) -> usize {
        self.start_channel.saturating_sub(1) as usize
    }

    /// True if output should be attempted at all
    pub fn is_active(&self) -> bool {
        self.usable && !self.skipped
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| CoreError::InvalidController {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.address.trim().is_empty() {
            return Err(invalid("missing address"));
        }
        if self.start_channel == 0 {
            return Err(invalid("start channel is 1-based"));
        }
        if self.channel_count == 0 {
            return Err(invalid("no channels"));
        }
        if self.universe == Some(0) {
            return Err(invalid("E1.31 universes start at 1"));
        }
        Ok(())
    }
}

/// Outcome of opening one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenStatus {
    Open,
    Skipped,
    Error,
}

/// Result of an ICMP echo to a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingOutcome {
    pub alive: bool,
    /// Round trip in milliseconds (0 when not alive)
    pub elapsed_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PingOutcome {
    pub fn alive(elapsed_ms: f64) -> Self {
        Self {
            alive: true,
            elapsed_ms,
            error: None,
        }
    }

    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            alive: false,
            elapsed_ms: 0.0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenControllerReport {
    pub name: String,
    pub status: OpenStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reachability, when a ping was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingOutcome>,
}

impl OpenControllerReport {
    pub fn open(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: OpenStatus::Open,
            error: None,
            ping: None,
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: OpenStatus::Skipped,
            error: None,
            ping: None,
        }
    }

    pub fn error(name: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            status: OpenStatus::Error,
            error: Some(error.to_string()),
            ping: None,
        }
    }

    pub fn with_ping(mut self, ping: PingOutcome) -> Self {
        self.ping = Some(ping);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let ddp = ControllerSetup::new("a", "10.0.0.2", ControllerProtocol::Ddp, 1, 300);
        assert_eq!(ddp.port(), 4048);
        let mut e131 = ControllerSetup::new("b", "10.0.0.3", ControllerProtocol::E131, 301, 510);
        assert_eq!(e131.port(), 5568);
        e131.port = Some(6000);
        assert_eq!(e131.port(), 6000);
        assert_eq!(e131.frame_offset(), 300);
    }

    #[test]
    fn test_validate() {
        let ok = ControllerSetup::new("a", "10.0.0.2", ControllerProtocol::Ddp, 1, 3);
        assert!(ok.validate().is_ok());

        let mut bad = ok.clone();
        bad.start_channel = 0;
        assert!(bad.validate().is_err());

        let mut bad = ok.clone();
        bad.address = " ".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_protocol_aliases() {
        let p: ControllerProtocol = serde_json::from_str("\"sacn\"").unwrap();
        assert_eq!(p, ControllerProtocol::E131);
        let p: ControllerProtocol = serde_json::from_str("\"ddp\"").unwrap();
        assert_eq!(p, ControllerProtocol::Ddp);
    }
}
