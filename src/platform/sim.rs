//! Scripted in-memory backends.
//!
//! Every reading is a plain field the caller can set, and association or
//! broker outcomes are queued up front. Used by the test suite, the benches
//! and `--simulate` runs on machines without the target hardware.

use super::{AllocFailure, Board, BoardIdentity, Heap, IpConfig, LinkStatus, Radio};
use crate::error::{AgentError, Result};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::Ipv4Addr;

/// Radio whose association outcomes are scripted.
pub struct SimRadio {
    status: Cell<LinkStatus>,
    pending: Cell<Option<(u32, LinkStatus)>>,
    joins: VecDeque<LinkStatus>,
    polls: RefCell<VecDeque<LinkStatus>>,
    join_latency: u32,
    join_calls: u32,
    pub rssi: Option<i32>,
    pub mac: [u8; 6],
    pub ipconfig: IpConfig,
    pub channel: Option<i32>,
}

impl SimRadio {
    /// A radio that is down until joined; every join succeeds immediately.
    pub fn new() -> Self {
        Self {
            status: Cell::new(LinkStatus::LinkDown),
            pending: Cell::new(None),
            joins: VecDeque::new(),
            polls: RefCell::new(VecDeque::new()),
            join_latency: 0,
            join_calls: 0,
            rssi: Some(-55),
            mac: [0x28, 0xcd, 0xc1, 0x00, 0x00, 0x01],
            ipconfig: IpConfig {
                ip: Ipv4Addr::new(192, 168, 1, 50),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(192, 168, 1, 1),
                dns: Ipv4Addr::new(192, 168, 1, 1),
            },
            channel: Some(6),
        }
    }

    /// A radio that is already associated.
    pub fn associated() -> Self {
        let radio = Self::new();
        radio.status.set(LinkStatus::Up);
        radio
    }

    /// Queue the final status of upcoming joins; once drained, joins succeed.
    pub fn script_joins(mut self, outcomes: impl IntoIterator<Item = LinkStatus>) -> Self {
        self.joins.extend(outcomes);
        self
    }

    /// Statuses reported by the next status reads, in order, before any
    /// scripted join outcome takes over.
    pub fn script_polls(self, statuses: impl IntoIterator<Item = LinkStatus>) -> Self {
        self.polls.borrow_mut().extend(statuses);
        self
    }

    /// Number of status polls a join reports `Joining` before settling.
    pub fn with_join_latency(mut self, polls: u32) -> Self {
        self.join_latency = polls;
        self
    }

    /// Lose the association, as when the access point goes away.
    pub fn drop_link(&mut self) {
        self.status.set(LinkStatus::LinkDown);
        self.pending.set(None);
    }

    pub fn join_calls(&self) -> u32 {
        self.join_calls
    }
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio for SimRadio {
    fn activate(&mut self) -> Result<()> {
        Ok(())
    }

    fn join(&mut self, _ssid: &str, _password: &str) -> Result<()> {
        self.join_calls += 1;
        let outcome = self.joins.pop_front().unwrap_or(LinkStatus::Up);
        self.status.set(LinkStatus::Joining);
        self.pending.set(Some((self.join_latency, outcome)));
        Ok(())
    }

    fn status(&self) -> Result<LinkStatus> {
        if let Some(next) = self.polls.borrow_mut().pop_front() {
            self.status.set(next);
            return Ok(next);
        }
        if let Some((remaining, outcome)) = self.pending.get() {
            if remaining == 0 {
                self.pending.set(None);
                self.status.set(outcome);
            } else {
                self.pending.set(Some((remaining - 1, outcome)));
            }
        }
        Ok(self.status.get())
    }

    fn rssi(&self) -> Result<i32> {
        self.rssi.ok_or_else(|| AgentError::radio_error("rssi unavailable"))
    }

    fn mac(&self) -> Result<[u8; 6]> {
        Ok(self.mac)
    }

    fn ifconfig(&self) -> Result<IpConfig> {
        Ok(self.ipconfig.clone())
    }

    fn channel(&self) -> Result<i32> {
        self.channel.ok_or_else(|| AgentError::radio_error("channel lookup failed"))
    }
}

/// Board with settable raw sensor readings. `None` makes a read fail.
pub struct SimBoard {
    pub temperature_raw: Option<u16>,
    pub vsys_raw: Option<u16>,
    pub cpu_frequency_hz: Option<u64>,
    pub identity: BoardIdentity,
}

impl SimBoard {
    pub fn new() -> Self {
        Self {
            // ~25 °C die, 5 V USB supply, stock RP2040 clock
            temperature_raw: Some(14080),
            vsys_raw: Some(33100),
            cpu_frequency_hz: Some(125_000_000),
            identity: BoardIdentity {
                unique_id: "e66038b7134f2a2f".to_string(),
                version: "v1.22.0 on 2024-01-01".to_string(),
                platform: "rp2".to_string(),
                machine: "Raspberry Pi Pico W with RP2040".to_string(),
                release: "1.22.0".to_string(),
            },
        }
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for SimBoard {
    fn read_temperature_raw(&mut self) -> Result<u16> {
        self.temperature_raw
            .ok_or_else(|| AgentError::sensor_error("temperature ADC unavailable"))
    }

    fn read_vsys_raw(&mut self) -> Result<u16> {
        self.vsys_raw
            .ok_or_else(|| AgentError::sensor_error("VSYS ADC unavailable"))
    }

    fn cpu_frequency_hz(&mut self) -> Result<u64> {
        self.cpu_frequency_hz
            .ok_or_else(|| AgentError::sensor_error("clock unavailable"))
    }

    fn identity(&self) -> Result<BoardIdentity> {
        Ok(self.identity.clone())
    }

    fn reset(&mut self) -> ! {
        tracing::warn!("Simulated board reset; exiting");
        std::process::exit(0)
    }
}

/// Heap with fixed counters and a scriptable probe outcome.
pub struct SimHeap {
    pub free: u64,
    pub allocated: u64,
    pub probe_failure: Option<AllocFailure>,
    pub unreadable: bool,
    collections: u32,
}

impl SimHeap {
    pub fn new() -> Self {
        Self {
            free: 150_000,
            allocated: 50_000,
            probe_failure: None,
            unreadable: false,
            collections: 0,
        }
    }

    /// Number of collection passes requested so far.
    pub fn collections(&self) -> u32 {
        self.collections
    }
}

impl Default for SimHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap for SimHeap {
    fn collect(&mut self) {
        self.collections += 1;
    }

    fn free_bytes(&mut self) -> Result<u64> {
        if self.unreadable {
            return Err(AgentError::sensor_error("heap counters unavailable"));
        }
        Ok(self.free)
    }

    fn allocated_bytes(&mut self) -> Result<u64> {
        if self.unreadable {
            return Err(AgentError::sensor_error("heap counters unavailable"));
        }
        Ok(self.allocated)
    }

    fn probe_alloc(&mut self, _size: u64) -> std::result::Result<(), AllocFailure> {
        match self.probe_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}
