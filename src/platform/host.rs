//! Linux host backend.
//!
//! Reads the radio through sysfs, `/proc/net` and the `ip`/`iw` tools,
//! sensors through the thermal and power-supply classes, and memory through
//! `sysinfo`. Association itself is delegated to NetworkManager (`nmcli`).

use super::{AllocFailure, Board, BoardIdentity, Heap, IpConfig, LinkStatus, Radio};
use crate::error::{AgentError, Result};
use std::cell::RefCell;
use std::fs;
use std::net::Ipv4Addr;
use std::process::{Child, Command, Stdio};
use sysinfo::System;
use tracing::debug;

/// Wireless interface managed by the host network stack.
pub struct HostRadio {
    interface: String,
    join: RefCell<Option<Child>>,
}

impl HostRadio {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            join: RefCell::new(None),
        }
    }

    /// Collect the join helper once it has exited.
    fn reap_join(&self) {
        let mut slot = self.join.borrow_mut();
        if let Some(child) = slot.as_mut() {
            if reap(child) {
                *slot = None;
            }
        }
    }

    fn sysfs(&self, attribute: &str) -> Result<String> {
        let path = format!("/sys/class/net/{}/{}", self.interface, attribute);
        Ok(fs::read_to_string(path)?.trim().to_string())
    }

    fn command_output(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(AgentError::radio_error(format!(
                "{} exited with {}",
                program, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn ipv4(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let output = self.command_output("ip", &["-o", "-4", "addr", "show", "dev", &self.interface])?;
        parse_ip_addr(&output).ok_or_else(|| AgentError::radio_error("no IPv4 address assigned"))
    }
}

impl Radio for HostRadio {
    fn activate(&mut self) -> Result<()> {
        self.sysfs("operstate").map(|_| ()).map_err(|_| {
            AgentError::radio_error(format!("interface {} not present", self.interface))
        })
    }

    fn join(&mut self, ssid: &str, password: &str) -> Result<()> {
        if self.status()? == LinkStatus::Up {
            return Ok(());
        }
        if let Some(mut previous) = self.join.get_mut().take() {
            if let Err(err) = previous.kill() {
                debug!("Stale nmcli join already gone: {}", err);
            }
            if let Err(err) = previous.wait() {
                debug!("Could not reap stale nmcli join: {}", err);
            }
        }
        let child = Command::new("nmcli")
            .args(["device", "wifi", "connect", ssid, "password", password, "ifname", &self.interface])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        *self.join.get_mut() = Some(child);
        Ok(())
    }

    fn status(&self) -> Result<LinkStatus> {
        self.reap_join();
        let operstate = match self.sysfs("operstate") {
            Ok(state) => state,
            Err(_) => return Ok(LinkStatus::NoNetwork),
        };
        Ok(match operstate.as_str() {
            "up" if self.ipv4().is_ok() => LinkStatus::Up,
            "up" => LinkStatus::NoIp,
            "dormant" => LinkStatus::Joining,
            _ => LinkStatus::LinkDown,
        })
    }

    fn rssi(&self) -> Result<i32> {
        let wireless = fs::read_to_string("/proc/net/wireless")?;
        parse_wireless_level(&wireless, &self.interface)
            .ok_or_else(|| AgentError::parse_error("no signal level in /proc/net/wireless"))
    }

    fn mac(&self) -> Result<[u8; 6]> {
        let address = self.sysfs("address")?;
        parse_mac(&address).ok_or_else(|| AgentError::parse_error(format!("bad MAC '{}'", address)))
    }

    fn ifconfig(&self) -> Result<IpConfig> {
        let (ip, netmask) = self.ipv4()?;
        let gateway = fs::read_to_string("/proc/net/route")
            .ok()
            .and_then(|routes| parse_default_gateway(&routes, &self.interface))
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let dns = fs::read_to_string("/etc/resolv.conf")
            .ok()
            .and_then(|conf| parse_nameserver(&conf))
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok(IpConfig {
            ip,
            netmask,
            gateway,
            dns,
        })
    }

    fn channel(&self) -> Result<i32> {
        let info = self.command_output("iw", &["dev", &self.interface, "info"])?;
        parse_channel(&info).ok_or_else(|| AgentError::parse_error("no channel in iw output"))
    }
}

/// Sensors and identity of the host machine.
pub struct HostBoard {
    system: System,
}

impl HostBoard {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }
}

impl Default for HostBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for HostBoard {
    fn read_temperature_raw(&mut self) -> Result<u16> {
        let millicelsius = fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")?
            .trim()
            .parse::<i64>()
            .map_err(|e| AgentError::parse_error(format!("thermal zone: {}", e)))?;
        Ok(raw_from_temperature(millicelsius as f64 / 1000.0))
    }

    fn read_vsys_raw(&mut self) -> Result<u16> {
        for entry in fs::read_dir("/sys/class/power_supply")?.flatten() {
            let Ok(microvolts) = fs::read_to_string(entry.path().join("voltage_now")) else {
                continue;
            };
            if let Ok(microvolts) = microvolts.trim().parse::<f64>() {
                let volts = microvolts / 1_000_000.0;
                return Ok((volts / 3.0 / 3.3 * 65535.0).clamp(0.0, 65535.0) as u16);
            }
        }
        Err(AgentError::sensor_error("no supply voltage reading available"))
    }

    fn cpu_frequency_hz(&mut self) -> Result<u64> {
        if let Ok(khz) = fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq") {
            if let Ok(khz) = khz.trim().parse::<u64>() {
                return Ok(khz * 1000);
            }
        }
        self.system.refresh_all();
        self.system
            .cpus()
            .first()
            .map(|cpu| cpu.frequency() * 1_000_000)
            .filter(|hz| *hz > 0)
            .ok_or_else(|| AgentError::sensor_error("CPU frequency unavailable"))
    }

    fn identity(&self) -> Result<BoardIdentity> {
        let unique_id = fs::read_to_string("/etc/machine-id")
            .map(|id| id.trim().to_string())
            .or_else(|_| System::host_name().ok_or_else(|| AgentError::sensor_error("no machine id")))?;
        let os_name = System::name().unwrap_or_else(|| "unknown".to_string());
        let os_version = System::os_version().unwrap_or_else(|| "unknown".to_string());
        let machine = self
            .system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| std::env::consts::ARCH.to_string());

        Ok(BoardIdentity {
            unique_id,
            version: format!("{} {}", os_name, os_version),
            platform: std::env::consts::OS.to_string(),
            machine,
            release: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn reset(&mut self) -> ! {
        use std::os::unix::process::CommandExt;

        let mut args = std::env::args_os();
        let program = args.next();
        if let (Some(program), Ok(exe)) = (program, std::env::current_exe()) {
            let err = Command::new(exe).arg0(program).args(args).exec();
            tracing::error!("Restart failed: {}", err);
        }
        std::process::abort()
    }
}

/// System memory viewed as the agent's heap.
pub struct HostHeap {
    system: System,
}

impl HostHeap {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for HostHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap for HostHeap {
    fn collect(&mut self) {
        self.system.refresh_memory();
    }

    fn free_bytes(&mut self) -> Result<u64> {
        Ok(self.system.available_memory())
    }

    fn allocated_bytes(&mut self) -> Result<u64> {
        Ok(self.system.used_memory())
    }

    fn probe_alloc(&mut self, size: u64) -> std::result::Result<(), AllocFailure> {
        let size = usize::try_from(size).map_err(|_| AllocFailure::Other)?;
        if size > isize::MAX as usize {
            return Err(AllocFailure::Other);
        }
        let mut block: Vec<u8> = Vec::new();
        block
            .try_reserve_exact(size)
            .map_err(|_| AllocFailure::OutOfMemory)
    }
}

/// Inverse of the die-sensor transfer function, for hosts that report degrees directly.
fn raw_from_temperature(celsius: f64) -> u16 {
    let volts = 0.706 - (celsius - 27.0) * 0.001721;
    (volts / 3.3 * 65535.0).round().clamp(0.0, 65535.0) as u16
}

/// Address and netmask from `ip -o -4 addr show` output.
fn parse_ip_addr(output: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let mut fields = output.split_whitespace();
    fields.find(|field| *field == "inet")?;
    let (ip, prefix) = fields.next()?.split_once('/')?;
    let prefix: u32 = prefix.parse().ok().filter(|p| *p <= 32)?;
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Some((ip.parse().ok()?, Ipv4Addr::from(mask)))
}

/// Default route gateway for `interface` from `/proc/net/route`.
fn parse_default_gateway(routes: &str, interface: &str) -> Option<Ipv4Addr> {
    routes.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[0] != interface || fields[1] != "00000000" {
            return None;
        }
        let gateway = u32::from_str_radix(fields[2], 16).ok()?;
        Some(Ipv4Addr::from(gateway.to_le_bytes()))
    })
}

fn parse_nameserver(resolv_conf: &str) -> Option<Ipv4Addr> {
    resolv_conf.lines().find_map(|line| {
        line.trim()
            .strip_prefix("nameserver")
            .and_then(|addr| addr.trim().parse().ok())
    })
}

/// Signal level column for `interface` from `/proc/net/wireless`.
fn parse_wireless_level(wireless: &str, interface: &str) -> Option<i32> {
    wireless.lines().find_map(|line| {
        let (name, rest) = line.trim().split_once(':')?;
        if name != interface {
            return None;
        }
        let level = rest.split_whitespace().nth(2)?;
        level.trim_end_matches('.').parse::<f64>().ok().map(|dbm| dbm as i32)
    })
}

fn parse_mac(address: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = address.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

/// Channel number from `iw dev <iface> info` output.
fn parse_channel(info: &str) -> Option<i32> {
    info.lines().find_map(|line| {
        line.trim()
            .strip_prefix("channel ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|channel| channel.parse().ok())
    })
}

/// Whether `child` has exited and been collected. Errors count as collected.
fn reap(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("nmcli join exited with {}", status);
            true
        }
        Ok(None) => false,
        Err(err) => {
            debug!("Could not poll nmcli join: {}", err);
            true
        }
    }
}
