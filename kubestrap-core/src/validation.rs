//! Settings field validation
//!
//! Every check here runs before any VM is touched; a failure is a configuration error.

use kubestrap_common::Error;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

pub const MAX_HOSTNAME_LENGTH: usize = 63;
pub const MIN_MEMORY_MB: u64 = 512;
pub const MAX_MEMORY_MB: u64 = 262144;
pub const MAX_CPUS: u32 = 64;
/// Worker private addresses are `<prefix>.(i + 20)`, so `.254` is the last one
pub const MAX_WORKERS: u32 = 234;

static DNS_SERVER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").unwrap());

static MINOR_VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+\.\d+$").unwrap());

static PREFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}$").unwrap());

static HOSTNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap());

pub type ValidationResult<T> = Result<T, Error>;

/// A single DNS server must be a dotted-quad IPv4 address
pub fn validate_dns_server(server: &str) -> ValidationResult<()> {
    if !DNS_SERVER_REGEX.is_match(server) || server.parse::<Ipv4Addr>().is_err() {
        return Err(Error::Validation(format!(
            "Invalid DNS server '{}' (expected an IPv4 address)",
            server
        )));
    }

    Ok(())
}

pub fn validate_dns_servers(servers: &[String]) -> ValidationResult<()> {
    if servers.is_empty() {
        return Err(Error::Validation(
            "network.dns_servers must list at least one server".to_string(),
        ));
    }

    servers.iter().try_for_each(|s| validate_dns_server(s))
}

/// Parse a comma-separated DNS server list ("8.8.8.8, 1.1.1.1")
pub fn parse_dns_servers(list: &str) -> ValidationResult<Vec<String>> {
    let servers: Vec<String> = list
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    validate_dns_servers(&servers)?;
    Ok(servers)
}

/// Version pins such as `software.kubernetes` use the `vMAJOR.MINOR` form
pub fn validate_minor_version(field: &str, version: &str) -> ValidationResult<()> {
    if !MINOR_VERSION_REGEX.is_match(version) {
        return Err(Error::Validation(format!(
            "{} must look like vMAJOR.MINOR (got '{}')",
            field, version
        )));
    }

    Ok(())
}

pub fn validate_required(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }

    Ok(())
}

/// Three-octet network prefix ("172.16.0")
pub fn validate_prefix(field: &str, prefix: &str) -> ValidationResult<()> {
    let in_range = prefix.split('.').all(|o| o.parse::<u8>().is_ok());
    if !PREFIX_REGEX.is_match(prefix) || !in_range {
        return Err(Error::Validation(format!(
            "{} must be three dotted octets such as 172.16.0 (got '{}')",
            field, prefix
        )));
    }

    Ok(())
}

/// Node hostnames double as Kubernetes node names, so they follow RFC 1123 labels
pub fn validate_hostname(hostname: &str) -> ValidationResult<()> {
    if hostname.is_empty() {
        return Err(Error::Validation("Hostname cannot be empty".to_string()));
    }

    if hostname.len() > MAX_HOSTNAME_LENGTH {
        return Err(Error::Validation(format!(
            "Hostname too long (max {} characters)",
            MAX_HOSTNAME_LENGTH
        )));
    }

    if !HOSTNAME_REGEX.is_match(hostname) {
        return Err(Error::Validation(format!(
            "Invalid hostname '{}' (lowercase letters, digits and hyphens only)",
            hostname
        )));
    }

    Ok(())
}

/// Memory validation (in MB)
pub fn validate_memory(field: &str, memory: u64) -> ValidationResult<()> {
    if memory < MIN_MEMORY_MB {
        return Err(Error::Validation(format!(
            "{} too low (minimum {} MB)",
            field, MIN_MEMORY_MB
        )));
    }

    if memory > MAX_MEMORY_MB {
        return Err(Error::Validation(format!(
            "{} too high (maximum {} MB)",
            field, MAX_MEMORY_MB
        )));
    }

    Ok(())
}

pub fn validate_cpus(field: &str, cpus: u32) -> ValidationResult<()> {
    if cpus == 0 || cpus > MAX_CPUS {
        return Err(Error::Validation(format!(
            "{} must be between 1 and {}",
            field, MAX_CPUS
        )));
    }

    Ok(())
}

pub fn validate_worker_count(count: u32) -> ValidationResult<()> {
    if count > MAX_WORKERS {
        return Err(Error::Validation(format!(
            "nodes.workers.count {} exceeds the address plan (maximum {})",
            count, MAX_WORKERS
        )));
    }

    Ok(())
}
