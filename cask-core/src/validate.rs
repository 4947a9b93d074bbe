//! Small config value validators shared by devices and the ACL engine.

use std::net::IpAddr;

use crate::error::{CaskError, Result};

/// Require a non-empty value.
pub fn is_not_empty(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CaskError::BadRequest("Required value is empty".to_string()));
    }

    Ok(())
}

/// Accept an empty value, otherwise apply the validator.
pub fn optional(value: &str, validator: fn(&str) -> Result<()>) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }

    validator(value)
}

/// Validate an unsigned 8-bit integer.
pub fn is_uint8(value: &str) -> Result<()> {
    value
        .parse::<u8>()
        .map(|_| ())
        .map_err(|_| CaskError::BadRequest(format!("Invalid value {:?} (not uint8)", value)))
}

/// Parse an IP address, returning its family version (4 or 6).
pub fn network_address_version(value: &str) -> Result<u32> {
    let ip: IpAddr = value
        .parse()
        .map_err(|_| CaskError::BadRequest(format!("Not an IP address {:?}", value)))?;

    Ok(match ip {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 6,
    })
}

/// Parse a CIDR subnet, returning its family version (4 or 6).
pub fn network_cidr_version(value: &str) -> Result<u32> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| CaskError::BadRequest(format!("Not a CIDR subnet {:?}", value)))?;

    let version = network_address_version(addr)?;

    let max_prefix = if version == 4 { 32 } else { 128 };
    let prefix: u32 = prefix
        .parse()
        .map_err(|_| CaskError::BadRequest(format!("Invalid CIDR prefix {:?}", value)))?;

    if prefix > max_prefix {
        return Err(CaskError::BadRequest(format!("Invalid CIDR prefix {:?}", value)));
    }

    Ok(version)
}

/// Parse an IP range "A-B", returning its family version. Both ends must be
/// in the same family and the start must not exceed the end.
pub fn network_range_version(value: &str) -> Result<u32> {
    let (start, end) = value.split_once('-').ok_or_else(|| {
        CaskError::BadRequest("IP range must contain start and end IP addresses".to_string())
    })?;

    let start_ip: IpAddr = start
        .parse()
        .map_err(|_| CaskError::BadRequest(format!("Not an IP address {:?}", start)))?;
    let end_ip: IpAddr = end
        .parse()
        .map_err(|_| CaskError::BadRequest(format!("Not an IP address {:?}", end)))?;

    let version = match (start_ip, end_ip) {
        (IpAddr::V4(_), IpAddr::V4(_)) => 4,
        (IpAddr::V6(_), IpAddr::V6(_)) => 6,
        _ => {
            return Err(CaskError::BadRequest(format!(
                "IP range {:?} mixes address families",
                value
            )))
        }
    };

    if start_ip > end_ip {
        return Err(CaskError::BadRequest(format!("IP range {:?} start exceeds end", value)));
    }

    Ok(version)
}

/// Validate a port or inclusive port range ("80" or "1000-2000").
pub fn is_network_port_range(value: &str) -> Result<()> {
    let parse_port = |s: &str| -> Result<u16> {
        s.parse::<u16>()
            .map_err(|_| CaskError::BadRequest(format!("Invalid port {:?}", s)))
    };

    match value.split_once('-') {
        None => {
            parse_port(value)?;
        }
        Some((start, end)) => {
            let start = parse_port(start)?;
            let end = parse_port(end)?;
            if start > end {
                return Err(CaskError::BadRequest(format!(
                    "Port range {:?} start exceeds end",
                    value
                )));
            }
        }
    }

    Ok(())
}

/// Validate a PCI address such as `0000:01:00.0`.
pub fn is_pci_address(value: &str) -> Result<()> {
    let parts: Vec<&str> = value.split(&[':', '.'][..]).collect();
    let valid = parts.len() == 4
        && u16::from_str_radix(parts[0], 16).is_ok()
        && u8::from_str_radix(parts[1], 16).is_ok()
        && u8::from_str_radix(parts[2], 16).is_ok()
        && parts[3].len() == 1
        && u8::from_str_radix(parts[3], 16).is_ok();

    if !valid {
        return Err(CaskError::BadRequest(format!("Invalid PCI address {:?}", value)));
    }

    Ok(())
}

/// Validate a 4-digit hexadecimal device id (USB vendor/product).
pub fn is_hex_id(value: &str) -> Result<()> {
    if value.len() != 4 || u16::from_str_radix(value, 16).is_err() {
        return Err(CaskError::BadRequest(format!("Invalid hexadecimal id {:?}", value)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_address_version() {
        assert_eq!(network_address_version("10.0.0.1").unwrap(), 4);
        assert_eq!(network_address_version("fe80::1").unwrap(), 6);
        assert!(network_address_version("nope").is_err());
    }

    #[test]
    fn test_network_cidr_version() {
        assert_eq!(network_cidr_version("10.0.0.0/24").unwrap(), 4);
        assert_eq!(network_cidr_version("fd00::/64").unwrap(), 6);
        assert!(network_cidr_version("10.0.0.0/33").is_err());
        assert!(network_cidr_version("10.0.0.0").is_err());
    }

    #[test]
    fn test_network_range_version() {
        assert_eq!(network_range_version("10.0.0.1-10.0.0.9").unwrap(), 4);
        assert!(network_range_version("10.0.0.9-10.0.0.1").is_err());
        assert!(network_range_version("10.0.0.1-fe80::1").is_err());
        assert!(network_range_version("10.0.0.1").is_err());
    }

    #[test]
    fn test_port_range() {
        assert!(is_network_port_range("80").is_ok());
        assert!(is_network_port_range("1000-2000").is_ok());
        assert!(is_network_port_range("2000-1000").is_err());
        assert!(is_network_port_range("http").is_err());
    }

    #[test]
    fn test_pci_address() {
        assert!(is_pci_address("0000:01:00.0").is_ok());
        assert!(is_pci_address("01:00.0").is_err());
    }

    #[test]
    fn test_hex_id() {
        assert!(is_hex_id("10de").is_ok());
        assert!(is_hex_id("xyz").is_err());
    }
}
