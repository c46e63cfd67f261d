//! IP address acquisition with stabilization.
//!
//! A VM often reports a transient address (link-local, DHCP lease that is
//! about to change) before settling. An address is accepted once it has been
//! observed unchanged for the settle timeout.

use crate::api::PrismApi;
use crate::error::{PrismError, Result};
use crate::task::{cancellable, cancellable_sleep};
use crate::types::Vm;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// An address range in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = PrismError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PrismError::InvalidConfig(format!("invalid CIDR '{s}'"));
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Bounds for IP acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpWaitConfig {
    /// Overall budget.
    pub wait_timeout: Duration,
    /// How long an address must stay unchanged.
    pub settle_timeout: Duration,
    /// Only accept addresses in this range; `None` accepts any routable IPv4.
    pub wait_address: Option<Cidr>,
}

impl Default for IpWaitConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(15 * 60),
            settle_timeout: Duration::from_secs(5),
            wait_address: Some(Cidr {
                network: IpAddr::from([0, 0, 0, 0]),
                prefix: 0,
            }),
        }
    }
}

/// Poll cadence for a settle timeout. Longer windows poll less often.
pub fn poll_interval(settle_timeout: Duration) -> Duration {
    let secs = settle_timeout.as_secs();
    if secs >= 120 {
        Duration::from_secs(30)
    } else if secs >= 60 {
        Duration::from_secs(15)
    } else if secs >= 10 {
        Duration::from_secs(5)
    } else {
        Duration::from_secs(1)
    }
}

/// First acceptable address of `vm`.
///
/// Guest-reported addresses win over infrastructure-assigned ones. Without a
/// filter only IPv4 addresses that are not link-local are accepted.
pub fn candidate_address(vm: &Vm, filter: Option<&Cidr>) -> Option<IpAddr> {
    let learned = vm.nics.iter().flat_map(|nic| nic.learned_ips.iter().copied());
    let configured = vm.nics.iter().filter_map(|nic| nic.configured_ip);
    learned.chain(configured).find(|ip| match filter {
        Some(cidr) => cidr.contains(ip),
        None => is_default_candidate(ip),
    })
}

fn is_default_candidate(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_unspecified() && !v4.is_loopback(),
        IpAddr::V6(_) => false,
    }
}

pub struct IpAcquisition<'a> {
    api: &'a dyn PrismApi,
    config: &'a IpWaitConfig,
    cancel: &'a CancellationToken,
}

impl<'a> IpAcquisition<'a> {
    pub fn new(api: &'a dyn PrismApi, config: &'a IpWaitConfig, cancel: &'a CancellationToken) -> Self {
        Self {
            api,
            config,
            cancel,
        }
    }

    /// Wait for a stable address on `vm_ext_id`.
    ///
    /// When the overall budget runs out, the last observed address is used
    /// with a warning; if none was ever seen the wait fails.
    pub async fn acquire(&self, vm_ext_id: &str) -> Result<String> {
        tracing::info!(
            vm = %vm_ext_id,
            wait_timeout = ?self.config.wait_timeout,
            settle_timeout = ?self.config.settle_timeout,
            "Waiting for IP address"
        );

        let mut last = None;
        let settled =
            tokio::time::timeout(self.config.wait_timeout, self.settle(vm_ext_id, &mut last)).await;

        match settled {
            Ok(result) => result.map(|ip| ip.to_string()),
            Err(_) => match last {
                Some(ip) => {
                    tracing::warn!(vm = %vm_ext_id, ip = %ip, "Timed out waiting for a stable IP, using last observed");
                    Ok(ip.to_string())
                }
                None => Err(PrismError::IpTimeout(self.config.wait_timeout)),
            },
        }
    }

    async fn settle(&self, vm_ext_id: &str, last: &mut Option<IpAddr>) -> Result<IpAddr> {
        let interval = poll_interval(self.config.settle_timeout);
        let filter = self.config.wait_address.as_ref();
        let mut deadline = Instant::now();

        loop {
            let vm = cancellable(self.cancel, self.api.get_vm(vm_ext_id)).await?;
            match candidate_address(&vm, filter) {
                Some(ip) if *last != Some(ip) => {
                    match last {
                        Some(previous) => {
                            tracing::info!(vm = %vm_ext_id, from = %previous, to = %ip, "VM IP changed")
                        }
                        None => tracing::info!(vm = %vm_ext_id, ip = %ip, "VM IP acquired"),
                    }
                    *last = Some(ip);
                    deadline = Instant::now() + self.config.settle_timeout;
                    continue;
                }
                Some(ip) => {
                    if Instant::now() >= deadline {
                        tracing::info!(vm = %vm_ext_id, ip = %ip, "VM IP is stable");
                        return Ok(ip);
                    }
                    tracing::debug!(vm = %vm_ext_id, ip = %ip, "VM IP unchanged");
                }
                None => tracing::debug!(vm = %vm_ext_id, "No acceptable IP yet"),
            }
            cancellable_sleep(self.cancel, interval).await?;
        }
    }
}
