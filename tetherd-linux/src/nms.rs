//! The Linux realization of the network-management service.
//!
//! IP forwarding is a sysctl, DHCP and DNS forwarding are a managed
//! `dnsmasq` child, and NAT is a set of iptables rules. All calls are
//! bounded: external tools run to completion and failures come back as
//! values carrying the failing program and its stderr.

use std::{
    ffi::OsStr,
    net::IpAddr,
    path::{Path, PathBuf},
    process,
    sync::Mutex,
};

use tracing::{debug, info, warn};

use tetherd_core::{NetworkId, NetworkManager, NmsError};

use crate::sysctl::{self, Ip, Protocol};

/// Runs a network tool to completion, folding a non-zero exit into an
/// [`NmsError`] that names the program and carries its stderr.
fn run_tool<I, S>(program: &str, args: I) -> Result<(), NmsError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = process::Command::new(program)
        .args(args)
        .stdout(process::Stdio::piped())
        .stderr(process::Stdio::piped())
        .output()?;

    debug!(%program, status = ?output.status, "ran network tool");

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NmsError::Command(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}

/// Network-management service backed by sysctl, dnsmasq, and iptables.
pub struct LinuxNetworkManager {
    /// The managed dnsmasq child, while tethering is started.
    dnsmasq: Mutex<Option<process::Child>>,
    /// Upstream DNS servers file; dnsmasq re-reads it on SIGHUP.
    servers_file: PathBuf,
}

impl LinuxNetworkManager {
    pub fn new(servers_file: impl Into<PathBuf>) -> Self {
        Self { dnsmasq: Mutex::new(None), servers_file: servers_file.into() }
    }

    fn dnsmasq_args(servers_file: &Path, dhcp_ranges: &[String]) -> Vec<String> {
        let mut args = vec![
            "--keep-in-foreground".to_string(),
            "--no-resolv".to_string(),
            "--no-poll".to_string(),
            format!("--servers-file={}", servers_file.display()),
        ];
        for pair in dhcp_ranges.chunks(2) {
            if let [start, end] = pair {
                args.push(format!("--dhcp-range={start},{end},1h"));
            }
        }
        args
    }

    /// The iptables rules for one downstream/upstream pairing, as argument
    /// vectors. `action` is `-A` to install, `-D` to remove.
    fn nat_rules(action: &str, downstream: &str, upstream: &str) -> [Vec<String>; 3] {
        let rule = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        [
            rule(&["-t", "nat", action, "POSTROUTING", "-o", upstream, "-j", "MASQUERADE"]),
            rule(&[
                action, "FORWARD", "-i", upstream, "-o", downstream, "-m", "state", "--state",
                "ESTABLISHED,RELATED", "-j", "ACCEPT",
            ]),
            rule(&[action, "FORWARD", "-i", downstream, "-o", upstream, "-j", "ACCEPT"]),
        ]
    }

    fn lock_dnsmasq(&self) -> std::sync::MutexGuard<'_, Option<process::Child>> {
        self.dnsmasq.lock().expect("dnsmasq state poisoned")
    }

    fn stop_dnsmasq(child: &mut process::Child) -> std::io::Result<()> {
        child.kill()?;
        child.wait()?;
        Ok(())
    }
}

impl Drop for LinuxNetworkManager {
    fn drop(&mut self) {
        if let Some(mut child) = self.lock_dnsmasq().take() {
            if let Err(e) = Self::stop_dnsmasq(&mut child) {
                warn!("failed to stop dnsmasq on drop: {e}");
            }
        }
    }
}

impl NetworkManager for LinuxNetworkManager {
    fn set_ip_forwarding_enabled(&self, enabled: bool) -> Result<(), NmsError> {
        let value = if enabled { "1" } else { "0" };
        info!(enabled, "setting IP forwarding");
        sysctl::write(Ip::Forwarding, Protocol::V4, value)?;
        sysctl::write(Ip::Forwarding, Protocol::V6, value)?;
        Ok(())
    }

    fn start_tethering(&self, dhcp_ranges: &[String]) -> Result<(), NmsError> {
        let mut guard = self.lock_dnsmasq();
        if let Some(child) = guard.as_mut() {
            warn!("tethering already started, restarting dnsmasq");
            if let Err(e) = Self::stop_dnsmasq(child) {
                warn!("failed to stop stale dnsmasq: {e}");
            }
            *guard = None;
        }

        if !self.servers_file.exists() {
            std::fs::write(&self.servers_file, "")?;
        }

        let args = Self::dnsmasq_args(&self.servers_file, dhcp_ranges);
        debug!(?args, "starting dnsmasq");
        let child = process::Command::new("dnsmasq")
            .args(&args)
            .stdout(process::Stdio::null())
            .stderr(process::Stdio::null())
            .spawn()?;
        *guard = Some(child);
        Ok(())
    }

    fn stop_tethering(&self) -> Result<(), NmsError> {
        if let Some(mut child) = self.lock_dnsmasq().take() {
            info!("stopping dnsmasq");
            Self::stop_dnsmasq(&mut child)?;
        }
        Ok(())
    }

    fn set_dns_forwarders(&self, network: Option<NetworkId>, dns: &[IpAddr]) -> Result<(), NmsError> {
        // The network handle is a platform routing concept; on plain Linux
        // the servers are reached over the main table.
        debug!(?network, ?dns, "updating upstream DNS servers");

        let mut contents = String::new();
        for server in dns {
            contents.push_str(&format!("server={server}\n"));
        }
        std::fs::write(&self.servers_file, contents)?;

        if let Some(child) = self.lock_dnsmasq().as_ref() {
            let pid = child.id().to_string();
            run_tool("kill", ["-HUP", pid.as_str()])?;
        }
        Ok(())
    }

    fn list_interfaces(&self) -> Result<Vec<String>, NmsError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir("/sys/class/net")? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn tether_interface(&self, iface: &str) -> Result<(), NmsError> {
        run_tool("ip", ["link", "set", iface, "up"])
    }

    fn untether_interface(&self, iface: &str) -> Result<(), NmsError> {
        run_tool("ip", ["addr", "flush", "dev", iface])
    }

    fn enable_nat(&self, downstream: &str, upstream: &str) -> Result<(), NmsError> {
        info!(downstream, upstream, "installing NAT");
        for rule in Self::nat_rules("-A", downstream, upstream) {
            run_tool("iptables", &rule)?;
        }
        Ok(())
    }

    fn disable_nat(&self, downstream: &str, upstream: &str) -> Result<(), NmsError> {
        info!(downstream, upstream, "removing NAT");
        for rule in Self::nat_rules("-D", downstream, upstream) {
            run_tool("iptables", &rule)?;
        }
        Ok(())
    }
}
