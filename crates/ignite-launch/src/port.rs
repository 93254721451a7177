//! Master port selection for the distributed rendezvous.

use crate::error::ResourceError;
use rand::Rng;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use tracing::{debug, info};

/// Ports drawn when the job does not pin one.
pub const PORT_RANGE: RangeInclusive<u16> = 10000..=65535;

pub const DEFAULT_PORT_ATTEMPTS: u32 = 16;

/// Answers whether a TCP port can currently be bound on this host.
pub trait PortProbe {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a listener on all interfaces and dropping it right away.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Check that a pinned port is usable.
pub fn verify_port(probe: &dyn PortProbe, port: u16) -> Result<u16, ResourceError> {
    if probe.is_free(port) {
        debug!(port, "pinned master port is free");
        Ok(port)
    } else {
        Err(ResourceError::PortInUse { port })
    }
}

/// Draw ports uniformly from [`PORT_RANGE`] until the probe reports one free.
pub fn select_port<R: Rng + ?Sized>(
    probe: &dyn PortProbe,
    rng: &mut R,
    attempts: u32,
) -> Result<u16, ResourceError> {
    for attempt in 1..=attempts {
        let port = rng.gen_range(PORT_RANGE);
        if probe.is_free(port) {
            info!(port, attempt, "selected master port");
            return Ok(port);
        }
        debug!(port, attempt, "master port busy, retrying");
    }
    Err(ResourceError::PortExhausted { attempts })
}
