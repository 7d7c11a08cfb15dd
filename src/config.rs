use clap::Args;
use std::path::PathBuf;

/// File locations and credentials shared by the CLI and the HTTP control plane.
///
/// Every field can be given as a flag or through the environment.
#[derive(Debug, Clone, Args)]
pub struct AppConfig {
    /// Target list: one hostname or address per line.
    #[arg(long = "targets-file", env = "TARGETS_FILE", default_value = "servers.list")]
    pub targets_file: PathBuf,

    /// Result store (JSON), read for merging and rewritten after each phase.
    #[arg(long = "results-file", env = "RESULTS_FILE", default_value = "results.json")]
    pub results_file: PathBuf,

    /// GeoLite2 city database.
    #[arg(long = "city-db", env = "GEOIP_CITY", default_value = "GeoLite2-City.mmdb")]
    pub city_db: PathBuf,

    /// GeoLite2 country database.
    #[arg(long = "country-db", env = "GEOIP_COUNTRY", default_value = "GeoLite2-Country.mmdb")]
    pub country_db: PathBuf,

    /// Countries to exclude (newline or comma separated). Missing file excludes nothing.
    #[arg(long = "exclude-file", env = "EXCLUDE_FILE", default_value = "exclude_countries.list")]
    pub exclude_file: PathBuf,

    /// Only keep endpoints in these countries.
    #[arg(long = "include-file", env = "INCLUDE_FILE")]
    pub include_file: Option<PathBuf>,

    /// Directory of per-endpoint OpenVPN configs.
    #[arg(long = "vpn-config-dir", env = "VPN_CONFIG_DIR", default_value = "ovpn")]
    pub vpn_config_dir: PathBuf,

    /// Interface whose appearance means the tunnel is up.
    #[arg(long = "vpn-interface", env = "VPN_INTERFACE", default_value = "tun0")]
    pub vpn_interface: String,

    /// Seconds to wait for the tunnel interface.
    #[arg(long = "vpn-connect-timeout", env = "VPN_CONNECT_TIMEOUT", default_value_t = 30)]
    pub vpn_connect_timeout_secs: u64,

    #[arg(long = "vpn-username", env = "VPN_USERNAME", default_value = "")]
    pub vpn_username: String,

    #[arg(long = "vpn-password", env = "VPN_PASSWORD", default_value = "", hide_env_values = true)]
    pub vpn_password: String,
}

impl AppConfig {
    pub fn has_vpn_credentials(&self) -> bool {
        !self.vpn_username.is_empty() && !self.vpn_password.is_empty()
    }
}
