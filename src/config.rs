use ::config::Config;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

/// Tunables a [`TcpServer`](crate::TcpServer) reads from a `config::Config`,
/// with per-instance namespacing.
///
/// Lookup follows the `{name}.{key}` then `{key}` priority, so a config
/// file can tune one named server without affecting the others:
///
/// ```toml
/// threads = 4
///
/// [ingest]
/// threads = 8
/// high_water_mark = 16777216
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of worker event loops; 0 means single-reactor.
    pub threads: Option<usize>,
    /// Whether to set `SO_REUSEPORT` on the listening socket.
    pub reuse_port: Option<bool>,
    /// Output-buffer size above which the high-water-mark callback fires.
    pub high_water_mark: Option<usize>,
}

impl ServerConfig {
    /// Reads the server tunables for the instance `name` (empty for the
    /// un-namespaced defaults). Missing keys stay `None`.
    pub fn from_config(config: &Config, name: &str) -> Self {
        Self {
            threads: get_namespaced_usize(config, name, "threads").ok(),
            reuse_port: get_namespaced_bool(config, name, "reuse_port").ok(),
            high_water_mark: get_namespaced_usize(config, name, "high_water_mark").ok(),
        }
    }
}
