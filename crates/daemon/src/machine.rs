//! Machine identity
//!
//! Computed once per process from the hardware MAC addresses, falling back
//! to the hostname when none are readable.

use std::path::Path;
use std::process::Command;

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use tracing::debug;

static MACHINE_ID: OnceCell<String> = OnceCell::new();

/// Stable id of this machine (32 hex chars)
pub fn machine_id() -> &'static str {
    MACHINE_ID.get_or_init(|| {
        let id = derive_machine_id(&read_mac_addresses(Path::new("/sys/class/net")), &hostname());
        debug!("Machine id {}", id);
        id
    })
}

/// SHA-256 of [`machine_id`], as submitted to the registry
pub fn machine_id_hash() -> [u8; 32] {
    Sha256::digest(machine_id().as_bytes()).into()
}

/// MACs take precedence; order does not matter
pub fn derive_machine_id(macs: &[String], hostname: &str) -> String {
    let input = if macs.is_empty() {
        format!("host:{}", hostname)
    } else {
        let mut sorted: Vec<String> = macs.iter().map(|m| m.to_lowercase()).collect();
        sorted.sort();
        sorted.dedup();
        format!("mac:{}", sorted.join(","))
    };
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..16])
}

/// Non-loopback, non-zero MACs from a sysfs-style `class/net` directory
fn read_mac_addresses(net_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(net_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "lo")
        .filter_map(|e| std::fs::read_to_string(e.path().join("address")).ok())
        .map(|s| s.trim().to_string())
        .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
        .collect()
}

fn hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_order_and_case_do_not_matter() {
        let a = derive_machine_id(&["AA:BB:CC:00:11:22".to_string(), "02:00:00:00:00:01".to_string()], "x");
        let b = derive_machine_id(&["02:00:00:00:00:01".to_string(), "aa:bb:cc:00:11:22".to_string()], "y");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_hostname_fallback() {
        assert_eq!(derive_machine_id(&[], "box-1"), derive_machine_id(&[], "box-1"));
        assert_ne!(derive_machine_id(&[], "box-1"), derive_machine_id(&[], "box-2"));
    }

    #[test]
    fn test_cached() {
        assert_eq!(machine_id(), machine_id());
        assert!(std::ptr::eq(machine_id(), machine_id()));
    }

    #[test]
    fn test_reads_sysfs_layout() {
        let dir = std::env::temp_dir().join(format!("mumblechat-net-{}", std::process::id()));
        for (iface, mac) in [("lo", "00:00:00:00:00:00"), ("eth0", "02:42:ac:11:00:02"), ("dummy", "00:00:00:00:00:00")] {
            std::fs::create_dir_all(dir.join(iface)).unwrap();
            std::fs::write(dir.join(iface).join("address"), format!("{}\n", mac)).unwrap();
        }
        assert_eq!(read_mac_addresses(&dir), vec!["02:42:ac:11:00:02".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
