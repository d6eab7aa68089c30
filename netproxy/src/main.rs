//! NetProxy daemon
//!
//! Proxies the traffic of a local network segment to remote NetProxies:
//! - reads Ethernet frames from the internal (and optional external)
//!   interface
//! - emulates TCP locally and carries flows to the remote proxy that owns
//!   the destination range
//! - synthesizes frames for local hosts from what remote proxies send back
//!
//! Configuration comes from a directory (`netproxy.cfg`, `endpoints.cfg`,
//! `uniqueIDs.cfg`, `addressMapping.cfg`, `staticARP.cfg`); command line
//! flags override individual settings.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netproxy::config::ConfigDir;
use netproxy::connector::crypto::PreSharedKey;
use netproxy::connector::quic::QuicTls;
use netproxy::interface::{Device, DeviceSpec};
use netproxy::manager::{ConnectorManager, ConnectorOptions};
use netproxy::workers::{Interfaces, Workers};
use netproxy_core::config::parse_proxy_id;
use netproxy_core::{Engine, NetProxySettings, NetworkInterface};

/// How often the main thread checks for a termination signal
const SIGNAL_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --config-dir <dir>         Directory with netproxy.cfg and the tables
    // --internal-if <tap:|raw:>  Interface facing the proxied hosts (required)
    // --external-if <tap:|raw:>  Interface facing the other NetProxies
    // --external-ip <ip>         Address used in link messages
    // --unique-id <id|ip>        Our proxy id
    // --tcp-port / --udp-port / --quic-port <port>
    // --csr-relay <addr:port>    CSR relay daemon
    // --status-addr <addr:port>  Send a JSON status datagram every 5 s
    // --key <passphrase>         Encrypt TCP links with this pre-shared key
    // --quic-cert / --quic-key   Accept QUIC links (outgoing only without)

    let config_dir = PathBuf::from(parse_arg(&args, "--config-dir").unwrap_or_else(|| ".".to_string()));
    let internal_spec = parse_arg(&args, "--internal-if").ok_or("Missing --internal-if")?;
    let internal_spec = DeviceSpec::parse(&internal_spec)?;
    let external_spec = parse_arg(&args, "--external-if")
        .map(|s| DeviceSpec::parse(&s))
        .transpose()?;
    let status_addr = parse_arg(&args, "--status-addr")
        .map(|s| s.parse::<SocketAddr>().map_err(|_| "Invalid --status-addr"))
        .transpose()?;

    let mut config = ConfigDir::load(&config_dir)?;
    apply_overrides(&mut config.settings, &args)?;

    let options = ConnectorOptions {
        bind_ip: None,
        quic_tls: match (parse_arg(&args, "--quic-cert"), parse_arg(&args, "--quic-key")) {
            (Some(cert_path), Some(key_path)) => Some(QuicTls { cert_path, key_path }),
            (None, None) => None,
            _ => return Err("--quic-cert and --quic-key go together".into()),
        },
        tcp_key: parse_arg(&args, "--key").map(|k| PreSharedKey::from_passphrase(&k)),
    };

    let settings = &config.settings;
    log::info!("NetProxy starting...");
    log::info!("  Proxy ID:    {} ({})", settings.proxy_id, Ipv4Addr::from(settings.proxy_id));
    log::info!("  Internal:    {} ({})", internal_spec, settings.internal_ip);
    log::info!(
        "  External:    {} ({})",
        external_spec.as_ref().map_or("-".to_string(), |s| s.to_string()),
        settings.external_ip
    );
    log::info!(
        "  Ports:       QUIC {} / TCP {} / UDP {}",
        settings.ports.quic,
        settings.ports.tcp,
        settings.ports.udp
    );
    log::info!("  CSR relay:   {}", settings.csr_relay);
    log::info!("  TCP crypto:  {}", if options.tcp_key.is_some() { "enabled" } else { "disabled" });
    log::info!("  QUIC server: {}", if options.quic_tls.is_some() { "enabled" } else { "disabled" });

    // Interfaces
    let internal: Arc<dyn NetworkInterface> = Arc::new(Device::open(&internal_spec)?);
    let external = match &external_spec {
        Some(spec) => Some(Arc::new(Device::open(spec)?) as Arc<dyn NetworkInterface>),
        None => None,
    };

    // Engine
    let (engine, queues) = Engine::new(config.settings.clone(), internal.mac_address(), config.endpoints.clone());
    let engine = Arc::new(engine);
    config.install(&engine);

    let terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, terminate.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate.clone())?;

    let manager = Arc::new(ConnectorManager::start(engine.clone(), &options)?);
    let workers = Workers::spawn(
        engine.clone(),
        queues,
        Interfaces { internal, external },
        manager.clone(),
        status_addr,
    )?;
    log::info!("NetProxy running");

    while engine.is_running() {
        if terminate.load(Ordering::Relaxed) {
            engine.request_termination();
            break;
        }
        std::thread::sleep(SIGNAL_POLL);
    }

    log::info!("Shutting down...");
    workers.join(&engine);
    manager.shutdown();
    log::info!("NetProxy stopped: {:?}", engine.status());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Command line flags win over `netproxy.cfg`
fn apply_overrides(settings: &mut NetProxySettings, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ip) = parse_arg(args, "--external-ip") {
        settings.external_ip = ip.parse::<Ipv4Addr>().map_err(|_| "Invalid --external-ip")?;
    }
    if let Some(id) = parse_arg(args, "--unique-id") {
        settings.proxy_id = parse_proxy_id(&id)?;
    }
    let port = |flag: &str| -> Result<Option<u16>, String> {
        parse_arg(args, flag)
            .map(|p| p.parse::<u16>().map_err(|_| format!("Invalid {}", flag)))
            .transpose()
    };
    if let Some(p) = port("--tcp-port")? {
        settings.ports.tcp = p;
    }
    if let Some(p) = port("--udp-port")? {
        settings.ports.udp = p;
    }
    if let Some(p) = port("--quic-port")? {
        settings.ports.quic = p;
    }
    if let Some(addr) = parse_arg(args, "--csr-relay") {
        settings.csr_relay = addr.parse().map_err(|_| "Invalid --csr-relay")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("netproxy")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_arg() {
        let a = args(&["--config-dir", "/etc/netproxy", "--key"]);
        assert_eq!(parse_arg(&a, "--config-dir").as_deref(), Some("/etc/netproxy"));
        assert_eq!(parse_arg(&a, "--key"), None);
        assert_eq!(parse_arg(&a, "--status-addr"), None);
    }

    #[test]
    fn test_overrides() {
        let mut settings = NetProxySettings::default();
        apply_overrides(
            &mut settings,
            &args(&[
                "--unique-id",
                "10.0.0.7",
                "--external-ip",
                "172.16.0.1",
                "--udp-port",
                "9000",
                "--csr-relay",
                "10.9.9.9:7000",
            ]),
        )
        .unwrap();
        assert_eq!(settings.proxy_id, u32::from(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(settings.external_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(settings.ports.udp, 9000);
        assert_eq!(settings.ports.tcp, NetProxySettings::default().ports.tcp);
        assert_eq!(settings.csr_relay, "10.9.9.9:7000".parse().unwrap());
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut settings = NetProxySettings::default();
        assert!(apply_overrides(&mut settings, &args(&["--tcp-port", "70000"])).is_err());
        assert!(apply_overrides(&mut settings, &args(&["--unique-id", "abc"])).is_err());
    }
}
