//! Hardware seams the agent reads from.
//!
//! The radio, the board's sensors and the heap are reached only through the
//! traits here. `host` backs them with a Linux machine, `sim` with scripted
//! values for tests and dry runs.

pub mod host;
pub mod sim;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Raw association status codes reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    LinkDown,
    Joining,
    NoIp,
    /// Associated with an address assigned.
    Up,
    Failed,
    NoNetwork,
    BadAuth,
}

impl LinkStatus {
    /// Numeric code as reported on the wire (`wifi_status`).
    pub fn code(self) -> i32 {
        match self {
            Self::LinkDown => 0,
            Self::Joining => 1,
            Self::NoIp => 2,
            Self::Up => 3,
            Self::Failed => -1,
            Self::NoNetwork => -2,
            Self::BadAuth => -3,
        }
    }

    /// Negative codes end an association attempt.
    pub fn is_terminal(self) -> bool {
        self.code() < 0
    }

    /// Polling stops on a terminal code or once an address is assigned.
    /// `NoIp` is still in progress: the address is pending.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Self::Up
    }
}

/// Interface addressing as assigned by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// Station-mode wireless interface.
pub trait Radio {
    /// Power the interface up.
    fn activate(&mut self) -> Result<()>;

    /// Begin association; completion is observed through `status`.
    fn join(&mut self, ssid: &str, password: &str) -> Result<()>;

    /// Current association status.
    fn status(&self) -> Result<LinkStatus>;

    /// Received signal strength in dBm.
    fn rssi(&self) -> Result<i32>;

    fn mac(&self) -> Result<[u8; 6]>;

    fn ifconfig(&self) -> Result<IpConfig>;

    fn channel(&self) -> Result<i32>;
}

/// Firmware and hardware identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardIdentity {
    pub unique_id: String,
    pub version: String,
    pub platform: String,
    pub machine: String,
    pub release: String,
}

/// ADC channels, clocks and the reset primitive of the board.
pub trait Board {
    /// Raw 16-bit reading of the die temperature sensor.
    fn read_temperature_raw(&mut self) -> Result<u16>;

    /// Raw 16-bit reading of the divided supply rail.
    fn read_vsys_raw(&mut self) -> Result<u16>;

    fn cpu_frequency_hz(&mut self) -> Result<u64>;

    fn identity(&self) -> Result<BoardIdentity>;

    /// Restart the whole device. Does not return.
    fn reset(&mut self) -> !;
}

/// Why a scratch allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFailure {
    OutOfMemory,
    Other,
}

/// Managed heap of the runtime.
pub trait Heap {
    /// Run a collection pass.
    fn collect(&mut self);

    fn free_bytes(&mut self) -> Result<u64>;

    fn allocated_bytes(&mut self) -> Result<u64>;

    /// Allocate and immediately release a contiguous block of `size` bytes.
    fn probe_alloc(&mut self, size: u64) -> std::result::Result<(), AllocFailure>;
}

/// Colon-separated lowercase hex, as printed for MAC addresses.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
