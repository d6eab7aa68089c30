//! Config directory loading
//!
//! ```text
//! <config-dir>/
//! ├── netproxy.cfg         Key=Value runtime settings (optional)
//! ├── endpoints.cfg        protocol per (source range, destination range)
//! ├── uniqueIDs.cfg        remote NetProxies and their link options
//! ├── addressMapping.cfg   virtual range → remote proxy id
//! └── staticARP.cfg        ip → mac preloads
//! ```
//!
//! A bad `netproxy.cfg` stops startup. Malformed lines in the table files
//! are logged and skipped; a missing table file counts as empty.

use std::fmt;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use netproxy_core::address_range::AddressRangeDescriptor;
use netproxy_core::config::{
    parse_address_mapping_line, parse_static_arp_line, ConfigError, EndpointConfigEntry, UniqueIdEntry,
};
use netproxy_core::{Engine, EndpointTable, MacAddr, NetProxySettings};

pub const SETTINGS_FILE: &str = "netproxy.cfg";
pub const ENDPOINTS_FILE: &str = "endpoints.cfg";
pub const UNIQUE_IDS_FILE: &str = "uniqueIDs.cfg";
pub const ADDRESS_MAPPING_FILE: &str = "addressMapping.cfg";
pub const STATIC_ARP_FILE: &str = "staticARP.cfg";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum LoadError {
    Io { path: PathBuf, source: io::Error },
    Settings { path: PathBuf, source: ConfigError },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            LoadError::Settings { path, source } => write!(f, "{}: {}", path.display(), source),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io { source, .. } => Some(source),
            LoadError::Settings { source, .. } => Some(source),
        }
    }
}

// ============================================================================
// Config Directory
// ============================================================================

/// Everything read from a config directory
#[derive(Debug, Clone, Default)]
pub struct ConfigDir {
    pub settings: NetProxySettings,
    pub endpoints: EndpointTable,
    pub unique_ids: Vec<UniqueIdEntry>,
    pub address_mappings: Vec<(AddressRangeDescriptor, u32)>,
    pub static_arp: Vec<(Ipv4Addr, MacAddr)>,
}

impl ConfigDir {
    pub fn load(dir: &Path) -> Result<Self, LoadError> {
        let mut cfg = ConfigDir::default();

        let path = dir.join(SETTINGS_FILE);
        if let Some(text) = read_optional(&path)? {
            cfg.settings =
                NetProxySettings::from_lines(text.lines()).map_err(|source| LoadError::Settings { path, source })?;
        }

        for entry in parse_table(&dir.join(ENDPOINTS_FILE), EndpointConfigEntry::parse_line)? {
            cfg.endpoints.push(entry);
        }
        cfg.unique_ids = parse_table(&dir.join(UNIQUE_IDS_FILE), UniqueIdEntry::parse_line)?;
        cfg.address_mappings = parse_table(&dir.join(ADDRESS_MAPPING_FILE), parse_address_mapping_line)?;
        cfg.static_arp = parse_table(&dir.join(STATIC_ARP_FILE), parse_static_arp_line)?;

        log::info!(
            "Loaded {}: {} endpoint rules, {} remote proxies, {} address mappings, {} static ARP entries",
            dir.display(),
            cfg.endpoints.len(),
            cfg.unique_ids.len(),
            cfg.address_mappings.len(),
            cfg.static_arp.len()
        );
        Ok(cfg)
    }

    /// Fill the engine's registry and ARC
    pub fn install(&self, engine: &Engine) {
        let registry = engine.registry();
        for entry in &self.unique_ids {
            registry.add_remote_proxy_info(entry.info.clone());
            let interval = entry
                .reconnect_interval
                .unwrap_or(self.settings.auto_reconnect_interval);
            for kind in &entry.auto_connect {
                registry.add_or_update_auto_connection(entry.info.id, *kind, interval);
            }
        }
        for (range, proxy_id) in &self.address_mappings {
            registry.add_address_mapping(range.clone(), *proxy_id);
        }
        engine.arc().load(self.static_arp.iter().copied());
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, LoadError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("{} not found; using defaults", path.display());
            Ok(None)
        }
        Err(source) => Err(LoadError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_table<T, F>(path: &Path, parse: F) -> Result<Vec<T>, LoadError>
where
    F: Fn(&str) -> Result<Option<T>, ConfigError>,
{
    let Some(text) = read_optional(path)? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        match parse(line) {
            Ok(Some(v)) => out.push(v),
            Ok(None) => {}
            Err(e) => log::warn!("{}: {}; line skipped", path.display(), e.at_line(i + 1)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netproxy_core::protocol::ConnectorKind;
    use std::time::Duration;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("netproxy-config-{}-{}", std::process::id(), name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_empty_dir_gives_defaults() {
        let dir = scratch_dir("empty");
        let cfg = ConfigDir::load(&dir).unwrap();
        assert_eq!(cfg.settings, NetProxySettings::default());
        assert!(cfg.endpoints.is_empty());
        assert!(cfg.unique_ids.is_empty());
    }

    #[test]
    fn test_bad_settings_are_fatal() {
        let dir = scratch_dir("bad-settings");
        fs::write(dir.join(SETTINGS_FILE), "UniqueID=1\nMTU=lots\n").unwrap();
        match ConfigDir::load(&dir) {
            Err(LoadError::Settings { source, .. }) => assert_eq!(source.line, 2),
            other => panic!("expected settings error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_table_lines_are_skipped() {
        let dir = scratch_dir("bad-table");
        fs::write(
            dir.join(ADDRESS_MAPPING_FILE),
            "# virtual ranges\n10.1.0.1-10.1.0.254 2\nnot-a-range 3\n10.2.0.1 0.0.0.3\n",
        )
        .unwrap();
        let cfg = ConfigDir::load(&dir).unwrap();
        let ids: Vec<u32> = cfg.address_mappings.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_install_fills_registry_and_arc() {
        let dir = scratch_dir("install");
        fs::write(
            dir.join(UNIQUE_IDS_FILE),
            "172.16.0.2 2 tcpport=9000 autoconnect=tcp reconnectinterval=5000\n",
        )
        .unwrap();
        fs::write(dir.join(ADDRESS_MAPPING_FILE), "10.1.0.1-10.1.0.254 2\n").unwrap();
        fs::write(dir.join(STATIC_ARP_FILE), "192.168.1.20 02:00:00:00:00:20\n").unwrap();
        let cfg = ConfigDir::load(&dir).unwrap();

        let (engine, _queues) = Engine::new(cfg.settings.clone(), MacAddr([2, 0, 0, 0, 0, 1]), cfg.endpoints.clone());
        cfg.install(&engine);

        let info = engine.registry().remote_proxy(2).unwrap();
        assert_eq!(info.ports.tcp, 9000);
        assert_eq!(engine.registry().resolve_address(Ipv4Addr::new(10, 1, 0, 7)), Some(2));
        let auto = engine.registry().auto_connection(2, ConnectorKind::Tcp).unwrap();
        assert_eq!(auto.reconnect_interval, Duration::from_millis(5000));
        assert_eq!(
            engine.arc().lookup(Ipv4Addr::new(192, 168, 1, 20)),
            Some(MacAddr([2, 0, 0, 0, 0, 0x20]))
        );
    }
}
