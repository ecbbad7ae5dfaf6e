//! Network interface configuration — parses and renders an `interfaces(5)`-style
//! config describing DHCP/static setup per interface.
//!
//! This module only knows the text format and the in-memory cache; reading
//! and writing the backing file is the embedder's job (there is no
//! filesystem in this stack) — see [`load_interfaces_from`] and
//! [`apply_and_render`].

use alloc::string::String;
use alloc::vec::Vec;
use super::types::Ipv4Addr;
use crate::sync::spinlock::Spinlock;

const MAX_INTERFACES: usize = 8;

/// Configuration method for a network interface.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IfaceMethod {
    Dhcp,
    Static,
}

/// Parsed configuration for a single network interface.
#[derive(Clone)]
pub struct IfaceConfig {
    /// Interface name (e.g. "eth0").
    pub name: String,
    /// Configuration method.
    pub method: IfaceMethod,
    /// Static IP address (only meaningful when method == Static).
    pub address: Ipv4Addr,
    /// Subnet mask (only meaningful when method == Static).
    pub netmask: Ipv4Addr,
    /// Default gateway (only meaningful when method == Static).
    pub gateway: Ipv4Addr,
    /// DNS server (only meaningful when method == Static).
    pub dns: Ipv4Addr,
}

/// Cached interface configurations, loaded from disk.
static IFACE_CONFIGS: Spinlock<Vec<IfaceConfig>> = Spinlock::new(Vec::new());

/// Parse and cache an interfaces config file already read by the embedder.
/// Called at boot once the backing file (if any) has been loaded.
pub fn load_interfaces_from(text: &str) {
    let configs = parse_interfaces(text);
    let count = configs.len();
    {
        let mut table = IFACE_CONFIGS.lock();
        *table = configs;
    }
    crate::serial_println!("[OK] Loaded {} interface configs", count);
}

/// Parse the interfaces config text into a list of interface configurations.
fn parse_interfaces(text: &str) -> Vec<IfaceConfig> {
    let mut configs: Vec<IfaceConfig> = Vec::new();

    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let keyword = match parts.next() {
            Some(k) => k,
            None => continue,
        };

        match keyword {
            "iface" => {
                if configs.len() >= MAX_INTERFACES {
                    break;
                }
                let name = match parts.next() {
                    Some(n) => n,
                    None => continue,
                };
                let method_str = match parts.next() {
                    Some(m) => m,
                    None => continue,
                };
                let method = match method_str {
                    "dhcp" => IfaceMethod::Dhcp,
                    "static" => IfaceMethod::Static,
                    _ => continue,
                };
                configs.push(IfaceConfig {
                    name: String::from(name),
                    method,
                    address: Ipv4Addr::ZERO,
                    netmask: Ipv4Addr::ZERO,
                    gateway: Ipv4Addr::ZERO,
                    dns: Ipv4Addr::ZERO,
                });
            }
            "address" | "netmask" | "gateway" | "dns" => {
                // These are sub-keys for the most recent iface block
                if let Some(cfg) = configs.last_mut() {
                    if let Some(val_str) = parts.next() {
                        if let Some(addr) = Ipv4Addr::parse(val_str) {
                            match keyword {
                                "address" => cfg.address = addr,
                                "netmask" => cfg.netmask = addr,
                                "gateway" => cfg.gateway = addr,
                                "dns" => cfg.dns = addr,
                                _ => {}
                            }
                        }
                    }
                }
            }
            _ => {} // Ignore unknown keywords
        }
    }

    configs
}

/// Get a snapshot of the current interface configurations.
pub fn get_configs() -> Vec<IfaceConfig> {
    IFACE_CONFIGS.lock().clone()
}

/// Serialize interface configs into a byte buffer for userspace consumption.
///
/// Format per entry (64 bytes):
///   - `[0]`:    method (0=dhcp, 1=static)
///   - `[1]`:    name length
///   - `[2..18]`: name bytes (max 16 chars, null-padded)
///   - `[18..22]`: address
///   - `[22..26]`: netmask
///   - `[26..30]`: gateway
///   - `[30..34]`: dns
///   - `[34..64]`: reserved (zeroed)
///
/// Returns the number of entries written.
pub fn serialize_configs(buf: &mut [u8]) -> u32 {
    let configs = IFACE_CONFIGS.lock();
    let max_entries = buf.len() / 64;
    let count = configs.len().min(max_entries);

    for (i, cfg) in configs.iter().enumerate() {
        if i >= count {
            break;
        }
        let off = i * 64;

        // Zero out the entry
        for b in &mut buf[off..off + 64] {
            *b = 0;
        }

        buf[off] = match cfg.method {
            IfaceMethod::Dhcp => 0,
            IfaceMethod::Static => 1,
        };

        let name_bytes = cfg.name.as_bytes();
        let name_len = name_bytes.len().min(16);
        buf[off + 1] = name_len as u8;
        buf[off + 2..off + 2 + name_len].copy_from_slice(&name_bytes[..name_len]);

        buf[off + 18..off + 22].copy_from_slice(&cfg.address.0);
        buf[off + 22..off + 26].copy_from_slice(&cfg.netmask.0);
        buf[off + 26..off + 30].copy_from_slice(&cfg.gateway.0);
        buf[off + 30..off + 34].copy_from_slice(&cfg.dns.0);
    }

    count as u32
}

/// Deserialize interface configs from a userspace buffer, update the
/// in-memory cache and the live stack config, and render the equivalent
/// config-file text for the embedder to persist.
///
/// Uses the same 64-byte-per-entry format as `serialize_configs`.
pub fn apply_and_render(buf: &[u8], count: u32) -> Option<String> {
    let count = count as usize;
    if count == 0 || buf.len() < count * 64 {
        return None;
    }

    let mut configs: Vec<IfaceConfig> = Vec::new();

    for i in 0..count {
        let off = i * 64;
        let method = match buf[off] {
            0 => IfaceMethod::Dhcp,
            1 => IfaceMethod::Static,
            _ => continue,
        };

        let name_len = (buf[off + 1] as usize).min(16);
        let name = match core::str::from_utf8(&buf[off + 2..off + 2 + name_len]) {
            Ok(s) => String::from(s),
            Err(_) => continue,
        };

        let address = Ipv4Addr([buf[off + 18], buf[off + 19], buf[off + 20], buf[off + 21]]);
        let netmask = Ipv4Addr([buf[off + 22], buf[off + 23], buf[off + 24], buf[off + 25]]);
        let gateway = Ipv4Addr([buf[off + 26], buf[off + 27], buf[off + 28], buf[off + 29]]);
        let dns = Ipv4Addr([buf[off + 30], buf[off + 31], buf[off + 32], buf[off + 33]]);

        configs.push(IfaceConfig {
            name,
            method,
            address,
            netmask,
            gateway,
            dns,
        });
    }

    // Generate config file text
    let mut text = String::from("# anyOS network interfaces configuration\n");
    text.push_str("#\n");
    text.push_str("# Syntax:\n");
    text.push_str("#   iface <name> dhcp\n");
    text.push_str("#\n");
    text.push_str("#   iface <name> static\n");
    text.push_str("#     address <ip>\n");
    text.push_str("#     netmask <mask>\n");
    text.push_str("#     gateway <gw>\n");
    text.push_str("#     dns <dns>\n");
    text.push('\n');

    for cfg in &configs {
        match cfg.method {
            IfaceMethod::Dhcp => {
                text.push_str("iface ");
                text.push_str(&cfg.name);
                text.push_str(" dhcp\n");
            }
            IfaceMethod::Static => {
                text.push_str("iface ");
                text.push_str(&cfg.name);
                text.push_str(" static\n");
                push_ip_line(&mut text, "  address ", cfg.address);
                push_ip_line(&mut text, "  netmask ", cfg.netmask);
                push_ip_line(&mut text, "  gateway ", cfg.gateway);
                push_ip_line(&mut text, "  dns ", cfg.dns);
            }
        }
    }

    // Update in-memory cache
    {
        let mut table = IFACE_CONFIGS.lock();
        *table = configs.clone();
    }

    // Apply the first interface config to the active network stack
    if let Some(cfg) = configs.first() {
        if cfg.method == IfaceMethod::Static {
            super::set_config(cfg.address, cfg.netmask, cfg.gateway, cfg.dns);
            crate::serial_println!("[NET] Applied static config for {}: {}", cfg.name, cfg.address);
        }
        // DHCP is handled by net::dhcp at boot; no immediate action here.
    }

    Some(text)
}

/// Helper: append "  <prefix><ip>\n" to a string.
fn push_ip_line(text: &mut String, prefix: &str, ip: Ipv4Addr) {
    use core::fmt::Write;
    text.push_str(prefix);
    let _ = write!(text, "{}", ip);
    text.push('\n');
}
