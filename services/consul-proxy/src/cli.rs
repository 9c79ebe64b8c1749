//! Command line interface.
//!
//! Services are given either with repeated `--service` flags or with a JSON
//! `--config-file`, never both. Discovery flags override the values from
//! the file.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use crate::config::{ProxiedServiceSpec, ProxyConfig};

/// Dynamic TCP proxy for services registered in Consul.
#[derive(Debug, Parser)]
#[command(name = "consul-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Service to proxy, as `[bind-ip]:port/service-name[/datacenter]`.
    ///
    /// May be repeated to proxy several services.
    #[arg(long = "service", value_name = "SPEC", value_parser = parse_proxied_service)]
    pub services: Vec<ProxiedServiceSpec>,

    /// JSON configuration file listing the services to proxy.
    #[arg(long, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// host:port of the Consul HTTP API; skips DNS discovery.
    #[arg(long, value_name = "HOST:PORT")]
    pub consul_server_override: Option<String>,

    /// DNS name whose SRV record locates the Consul HTTP API.
    #[arg(long)]
    pub consul_dns_name: Option<String>,

    /// DNS server used for the SRV lookup [default: localhost].
    #[arg(long)]
    pub dns_server: Option<String>,

    /// Port of the DNS server [default: 53].
    #[arg(long)]
    pub dns_port: Option<String>,

    /// Seconds between endpoint refreshes [default: 30].
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CONSUL_PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Parse a `--service` value.
pub fn parse_proxied_service(value: &str) -> Result<ProxiedServiceSpec, String> {
    let invalid = || {
        format!(
            "proxied service '{value}' has an invalid format, \
             expected [bind-ip]:port/service-name[/datacenter]"
        )
    };

    let parts: Vec<&str> = value.split('/').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(invalid());
    }

    let (bind_host, port) = parts[0].rsplit_once(':').ok_or_else(invalid)?;
    let bind_host = match bind_host {
        "" => "localhost",
        host => host.trim_start_matches('[').trim_end_matches(']'),
    };
    if bind_host.contains(':') && !parts[0].starts_with('[') {
        return Err(invalid());
    }

    let port: u16 = port
        .parse()
        .map_err(|_| format!("port '{port}' in '{value}' could not be parsed as a number"))?;

    let service_name = parts[1];
    if service_name.is_empty() {
        return Err(invalid());
    }

    let mut spec = ProxiedServiceSpec::new(service_name, bind_host, port);
    if let Some(dc) = parts.get(2).filter(|dc| !dc.is_empty()) {
        spec = spec.with_partition(*dc);
    }
    Ok(spec)
}

impl Cli {
    /// Merge flags and the optional config file into a validated configuration.
    pub fn resolve(&self) -> Result<ProxyConfig> {
        if self.config_file.is_some() && !self.services.is_empty() {
            bail!("--config-file and --service cannot both be specified. Please use one or the other.");
        }

        if self.services.is_empty() && self.config_file.is_none() {
            bail!("No proxied services specified. Please either specify --service or --config-file");
        }

        let mut config = match &self.config_file {
            Some(path) => ProxyConfig::from_file(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(server) = &self.dns_server {
            config.discovery.dns_server = Some(server.clone());
        }
        if let Some(port) = &self.dns_port {
            config.discovery.dns_port = Some(port.clone());
        }
        if let Some(name) = &self.consul_dns_name {
            config.discovery.dns_name = Some(name.clone());
        }
        if let Some(address) = &self.consul_server_override {
            info!(address = %address, "Consul server has been overridden");
            config.discovery.address = Some(address.clone());
        }
        if !self.services.is_empty() {
            config.proxies = self.services.clone();
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = Some(secs);
        }

        config.validate()?;
        Ok(config)
    }
}
