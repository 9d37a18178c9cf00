//! Tunnel network settings: address, routes, MTU and DNS override
//!
//! [`NetworkSettingsConfigurator`] turns a [`NetworkConfig`] into a
//! [`TunnelNetworkSettings`] object and commits it to the host in one call.
//! Nothing may flow through the tunnel until that commit has succeeded.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::ConfigurationError;
use crate::network::interface::{netmask_bits, prefix_to_netmask};

/// An IPv4 destination and mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Route {
    pub destination: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

impl Ipv4Route {
    pub fn new(destination: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        Ipv4Route { destination, subnet_mask }
    }

    /// 0.0.0.0/0
    pub fn default_route() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
    }

    /// A /32 route to a single host
    pub fn host(addr: Ipv4Addr) -> Self {
        Self::new(addr, Ipv4Addr::BROADCAST)
    }

    pub fn prefix_len(&self) -> u8 {
        netmask_bits(&self.subnet_mask)
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len() == 0
    }
}

impl fmt::Display for Ipv4Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination, self.prefix_len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Settings {
    pub addresses: Vec<Ipv4Addr>,
    pub subnet_masks: Vec<Ipv4Addr>,
    pub included_routes: Vec<Ipv4Route>,
    pub excluded_routes: Vec<Ipv4Route>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSettings {
    pub servers: Vec<IpAddr>,
    /// An empty string matches every domain
    pub match_domains: Vec<String>,
}

/// Everything the host needs to bring the tunnel up, committed as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelNetworkSettings {
    pub tunnel_remote_address: String,
    pub ipv4: Ipv4Settings,
    pub mtu: u16,
    pub dns: DnsSettings,
}

/// The OS side of the tunnel: consumes one settings object per call
#[async_trait]
pub trait HostConfigurator: Send + Sync {
    /// Apply `settings`, replacing `previous` if that was committed before
    async fn commit(
        &self,
        settings: &TunnelNetworkSettings,
        previous: Option<&TunnelNetworkSettings>,
    ) -> Result<(), ConfigurationError>;
}

/// Builds settings from a [`NetworkConfig`] and commits them through `H`
pub struct NetworkSettingsConfigurator<H> {
    host: H,
    applied: Mutex<Option<TunnelNetworkSettings>>,
}

impl<H: HostConfigurator> NetworkSettingsConfigurator<H> {
    pub fn new(host: H) -> Self {
        NetworkSettingsConfigurator {
            host,
            applied: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Settings from the last successful commit
    pub async fn applied(&self) -> Option<TunnelNetworkSettings> {
        self.applied.lock().await.clone()
    }

    /// Build and commit the settings for `config`.
    ///
    /// Re-applying an unchanged config leaves the host alone. On any error
    /// nothing is committed.
    pub async fn apply(
        &self,
        config: &NetworkConfig,
    ) -> Result<TunnelNetworkSettings, ConfigurationError> {
        let settings = match build_settings(config).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Not applying tunnel network settings: {}", e);
                return Err(e);
            }
        };

        let mut applied = self.applied.lock().await;
        if applied.as_ref() == Some(&settings) {
            debug!("Tunnel network settings unchanged, nothing to apply");
            return Ok(settings);
        }

        self.host.commit(&settings, applied.as_ref()).await?;
        info!(
            "Tunnel network settings applied: {}/{} mtu {} dns {:?}",
            config.client_ip, config.subnet_mask, settings.mtu, settings.dns.servers
        );
        *applied = Some(settings.clone());
        Ok(settings)
    }
}

/// Translate a config into settings, validating it on the way
pub async fn build_settings(
    config: &NetworkConfig,
) -> Result<TunnelNetworkSettings, ConfigurationError> {
    let remote = config.remote_address()?;

    if config.mtu == 0 {
        return Err(ConfigurationError::Invalid {
            field: "mtu",
            reason: "must be greater than zero".to_string(),
        });
    }
    if config.dns_servers.is_empty() {
        return Err(ConfigurationError::MissingField("dns_servers"));
    }

    let mut servers: Vec<IpAddr> = Vec::with_capacity(config.dns_servers.len());
    for server in &config.dns_servers {
        if !servers.contains(server) {
            servers.push(*server);
        }
    }

    let mut excluded_routes = Vec::new();
    if config.exclude_remote_route {
        match resolve_ipv4(remote, config.remote_port).await? {
            Some(addr) => excluded_routes.push(Ipv4Route::host(addr)),
            None => warn!("{} has no IPv4 address, not excluding it from the tunnel", remote),
        }
    }

    Ok(TunnelNetworkSettings {
        tunnel_remote_address: remote.to_string(),
        ipv4: Ipv4Settings {
            addresses: vec![config.client_ip],
            subnet_masks: vec![config.subnet_mask],
            included_routes: vec![Ipv4Route::default_route()],
            excluded_routes,
        },
        mtu: config.mtu,
        dns: DnsSettings {
            servers,
            match_domains: vec![String::new()],
        },
    })
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Option<Ipv4Addr>, ConfigurationError> {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => return Ok(Some(addr)),
        Ok(IpAddr::V6(_)) => return Ok(None),
        Err(_) => {}
    }

    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| ConfigurationError::Invalid {
            field: "remote_address",
            reason: format!("cannot resolve {}: {}", host, e),
        })?;
    Ok(addrs.find_map(|addr| match addr.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }))
}

/// The system's own default route, used to keep excluded routes off the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub via: Option<Ipv4Addr>,
    pub dev: Option<String>,
}

impl Gateway {
    /// Parse the first line of `ip -4 route show default`
    pub fn parse(output: &str) -> Option<Self> {
        let line = output.lines().find(|l| l.trim_start().starts_with("default"))?;
        let mut words = line.split_whitespace();
        let mut gateway = Gateway { via: None, dev: None };
        while let Some(word) = words.next() {
            match word {
                "via" => gateway.via = words.next().and_then(|w| w.parse().ok()),
                "dev" => gateway.dev = words.next().map(str::to_string),
                _ => {}
            }
        }
        if gateway.via.is_none() && gateway.dev.is_none() {
            return None;
        }
        Some(gateway)
    }
}

/// One command and the command that reverts it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub apply: Vec<String>,
    pub undo: Option<Vec<String>>,
}

fn cmd(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn step(apply: Vec<String>, undo: Option<Vec<String>>) -> Step {
    Step { apply, undo }
}

/// The default route goes in as two /1 halves so the system default stays put
fn tunnel_routes(route: &Ipv4Route) -> Vec<Ipv4Route> {
    if route.is_default() {
        vec![
            Ipv4Route::new(Ipv4Addr::new(0, 0, 0, 0), prefix_to_netmask(1)),
            Ipv4Route::new(Ipv4Addr::new(128, 0, 0, 0), prefix_to_netmask(1)),
        ]
    } else {
        vec![*route]
    }
}

/// Commands that move the host from `previous` to `settings`
pub fn plan_commands(
    interface: &str,
    settings: &TunnelNetworkSettings,
    previous: Option<&TunnelNetworkSettings>,
    gateway: Option<&Gateway>,
) -> Vec<Step> {
    let mut steps = Vec::new();

    if let Some(previous) = previous {
        for route in &previous.ipv4.excluded_routes {
            if !settings.ipv4.excluded_routes.contains(route) {
                steps.push(step(cmd(&["ip", "route", "del", &route.to_string()]), None));
            }
        }
        for route in &previous.ipv4.included_routes {
            if !settings.ipv4.included_routes.contains(route) {
                for part in tunnel_routes(route) {
                    steps.push(step(
                        cmd(&["ip", "route", "del", &part.to_string(), "dev", interface]),
                        None,
                    ));
                }
            }
        }
        let old = previous.ipv4.addresses.iter().zip(&previous.ipv4.subnet_masks);
        for (addr, mask) in old {
            let still_wanted = settings
                .ipv4
                .addresses
                .iter()
                .zip(&settings.ipv4.subnet_masks)
                .any(|(a, m)| a == addr && m == mask);
            if !still_wanted {
                let cidr = format!("{}/{}", addr, netmask_bits(mask));
                steps.push(step(cmd(&["ip", "addr", "del", &cidr, "dev", interface]), None));
            }
        }
    }

    for (addr, mask) in settings.ipv4.addresses.iter().zip(&settings.ipv4.subnet_masks) {
        let cidr = format!("{}/{}", addr, netmask_bits(mask));
        steps.push(step(
            cmd(&["ip", "addr", "replace", &cidr, "dev", interface]),
            Some(cmd(&["ip", "addr", "del", &cidr, "dev", interface])),
        ));
    }

    let mtu = settings.mtu.to_string();
    steps.push(step(cmd(&["ip", "link", "set", "dev", interface, "mtu", &mtu, "up"]), None));

    // Exclusions first, while the system default still decides the path
    for route in &settings.ipv4.excluded_routes {
        let dest = route.to_string();
        let mut apply = cmd(&["ip", "route", "replace", &dest]);
        if let Some(gateway) = gateway {
            if let Some(via) = gateway.via {
                apply.extend(cmd(&["via", &via.to_string()]));
            }
            if let Some(dev) = &gateway.dev {
                apply.extend(cmd(&["dev", dev]));
            }
        }
        steps.push(step(apply, Some(cmd(&["ip", "route", "del", &dest]))));
    }

    for route in &settings.ipv4.included_routes {
        for part in tunnel_routes(route) {
            let dest = part.to_string();
            steps.push(step(
                cmd(&["ip", "route", "replace", &dest, "dev", interface]),
                Some(cmd(&["ip", "route", "del", &dest, "dev", interface])),
            ));
        }
    }

    let mut dns = cmd(&["resolvectl", "dns", interface]);
    dns.extend(settings.dns.servers.iter().map(IpAddr::to_string));
    steps.push(step(dns, Some(cmd(&["resolvectl", "revert", interface]))));

    let mut domains = cmd(&["resolvectl", "domain", interface]);
    domains.extend(settings.dns.match_domains.iter().map(|domain| {
        if domain.is_empty() {
            "~.".to_string()
        } else {
            format!("~{}", domain)
        }
    }));
    steps.push(step(domains, Some(cmd(&["resolvectl", "revert", interface]))));

    steps
}

/// Applies settings with `ip` and `resolvectl`
pub struct LinuxHost {
    interface: String,
}

impl LinuxHost {
    pub fn new(interface: impl Into<String>) -> Self {
        LinuxHost {
            interface: interface.into(),
        }
    }
}

#[async_trait]
impl HostConfigurator for LinuxHost {
    async fn commit(
        &self,
        settings: &TunnelNetworkSettings,
        previous: Option<&TunnelNetworkSettings>,
    ) -> Result<(), ConfigurationError> {
        let interface = self.interface.clone();
        let settings = settings.clone();
        let previous = previous.cloned();

        tokio::task::spawn_blocking(move || {
            commit_blocking(&interface, &settings, previous.as_ref())
        })
        .await
        .map_err(|e| ConfigurationError::Rejected(e.to_string()))?
        .map_err(|e| ConfigurationError::Rejected(format!("{:#}", e)))
    }
}

fn commit_blocking(
    interface: &str,
    settings: &TunnelNetworkSettings,
    previous: Option<&TunnelNetworkSettings>,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let gateway = if settings.ipv4.excluded_routes.is_empty() {
        None
    } else {
        let output = host_cmd::run("ip", &cmd(&["-4", "route", "show", "default"]))
            .context("failed to look up the default route")?;
        let gateway = Gateway::parse(&output);
        if gateway.is_none() {
            warn!("No default route found, excluded routes will have no gateway");
        }
        gateway
    };

    let steps = plan_commands(interface, settings, previous, gateway.as_ref());
    let mut done: Vec<&Step> = Vec::with_capacity(steps.len());
    for step in &steps {
        if let Err(e) = host_cmd::run(&step.apply[0], &step.apply[1..]) {
            for applied in done.iter().rev() {
                if let Some(undo) = &applied.undo {
                    if let Err(undo_err) = host_cmd::run(&undo[0], &undo[1..]) {
                        debug!("rollback step failed: {:#}", undo_err);
                    }
                }
            }
            return Err(e);
        }
        done.push(step);
    }
    Ok(())
}

mod host_cmd {
    use anyhow::{bail, Context, Result};
    use std::process::Command;
    use tracing::debug;

    pub(super) fn run(cmd: &str, args: &[String]) -> Result<String> {
        debug!("running {} {}", cmd, args.join(" "));
        let out = Command::new(cmd)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn {cmd}"))?;

        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();

        if !out.status.success() {
            bail!("{cmd} {} failed ({}): {}{}", args.join(" "), out.status, stdout, stderr);
        }

        Ok(stdout)
    }
}
