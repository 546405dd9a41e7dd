//! Opening controllers
//!
//! Resolves each [`ControllerSetup`], connects a UDP transport to it and binds
//! the sender for its protocol. Opened controllers can optionally be pinged so
//! the report says whether anything answers at the address.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::ControllerOutput;
use crate::error::{ControlError, Result};
use crate::ping::ping;
use crate::sender::{DdpOptions, DdpSender, E131Options, E131Sender, ProtocolSender};
use crate::transport::{TransportOptions, UdpTransport};
use showplay_core::{ControllerProtocol, ControllerSetup, OpenControllerReport};

/// Settings shared by every opened controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    pub ddp: DdpOptions,
    pub e131: E131Options,
    pub transport: TransportOptions,
    /// Ping each opened controller, waiting this long for the reply
    pub ping_timeout_ms: Option<u64>,
}

/// Resolve `host:port`, preferring IPv4.
pub async fn resolve_address(host: &str, port: u16) -> Result<SocketAddr> {
    let resolve_err = |reason: String| ControlError::Resolve {
        address: host.to_string(),
        reason,
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| resolve_err("no addresses".to_string()))
}

async fn open_controller(setup: &ControllerSetup, options: &OutputOptions, cid: Uuid) -> Result<ControllerOutput> {
    setup.validate()?;
    let destination = resolve_address(&setup.address, setup.port()).await?;
    let transport = Arc::new(UdpTransport::new(destination, options.transport.clone()));
    transport.connect()?;

    let sender: ProtocolSender = match setup.protocol {
        ControllerProtocol::Ddp => DdpSender::new(transport, options.ddp.clone()).into(),
        ControllerProtocol::E131 => {
            E131Sender::new(transport, options.e131.clone(), setup.universe.unwrap_or(1), cid).into()
        }
    };
    Ok(ControllerOutput::new(setup.clone(), sender))
}

/// Open every active controller in `setups`.
///
/// Returns the opened outputs in setup order and one report per setup.
/// Failures are reported, never fatal.
pub async fn open_controllers(
    setups: &[ControllerSetup],
    options: &OutputOptions,
) -> (Vec<ControllerOutput>, Vec<OpenControllerReport>) {
    let cid = options.e131.cid.unwrap_or_else(Uuid::new_v4);
    let mut outputs = Vec::with_capacity(setups.len());
    let mut reports = Vec::with_capacity(setups.len());

    for setup in setups {
        if !setup.is_active() {
            reports.push(OpenControllerReport::skipped(&setup.name));
            continue;
        }
        match open_controller(setup, options, cid).await {
            Ok(output) => {
                info!(
                    "Opened {} controller '{}' at {}",
                    setup.protocol,
                    setup.name,
                    output.transport().destination()
                );
                outputs.push(output);
                let mut report = OpenControllerReport::open(&setup.name);
                if let Some(timeout_ms) = options.ping_timeout_ms {
                    let outcome = ping(&setup.address, Duration::from_millis(timeout_ms)).await;
                    if !outcome.alive {
                        warn!(
                            "Controller '{}' did not answer ping: {}",
                            setup.name,
                            outcome.error.as_deref().unwrap_or("no reply")
                        );
                    }
                    report = report.with_ping(outcome);
                }
                reports.push(report);
            }
            Err(e) => {
                warn!("Failed to open controller '{}': {}", setup.name, e);
                reports.push(OpenControllerReport::error(&setup.name, e));
            }
        }
    }
    (outputs, reports)
}
