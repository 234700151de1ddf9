use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in backend arguments that is replaced with the backend port
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Ports, intervals and startup behavior
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Front-end reverse proxy installation
    #[serde(default = "default_proxy")]
    pub proxy: ProxyConfig,

    /// Backing application server installation
    #[serde(default = "default_backend")]
    pub backend: BackendConfig,

    /// Bounded waits used by the start, stop and recycle sequences
    #[serde(default)]
    pub timings: Timings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    /// Port the proxy listens on (default: 80)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Internal loopback port the backend binds (default: 9000)
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    /// Minutes between scheduled backend recycles (default: 240)
    #[serde(default = "default_recycle_interval")]
    pub recycle_interval_mins: u64,

    /// Seconds between health checks (default: 5)
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Start the servers as soon as the front end launches (default: true)
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            backend_port: default_backend_port(),
            recycle_interval_mins: default_recycle_interval(),
            health_check_interval_secs: default_health_interval(),
            auto_start: default_auto_start(),
        }
    }
}

impl SupervisorSettings {
    pub fn recycle_interval(&self) -> Duration {
        Duration::from_secs(self.recycle_interval_mins * 60)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Configuration for the reverse proxy process
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Installation directory (default: nginx)
    #[serde(default = "default_proxy_root")]
    pub root: PathBuf,

    /// Executable file name inside `root` (default: nginx)
    #[serde(default = "default_proxy_executable")]
    pub executable: String,

    /// Arguments passed on start
    #[serde(default)]
    pub args: Vec<String>,

    /// Arguments that ask a running proxy to quit quietly
    #[serde(default = "default_quit_args")]
    pub quit_args: Vec<String>,

    /// Config file location, relative to `root`
    #[serde(default = "default_proxy_config_path")]
    pub config_path: PathBuf,

    /// Served-content directory, relative to `root`
    #[serde(default = "default_web_root")]
    pub web_root: PathBuf,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Configuration for the backend process
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Installation directory (default: php)
    #[serde(default = "default_backend_root")]
    pub root: PathBuf,

    /// Executable file name inside `root` (default: php-cgi)
    #[serde(default = "default_backend_executable")]
    pub executable: String,

    /// Arguments passed on start; `{port}` is replaced with the backend port
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Environment variable carrying the backend's request ceiling
    #[serde(default = "default_max_requests_env")]
    pub max_requests_env: String,

    /// Requests served before the backend exits on its own
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Timings {
    /// Delay after spawn before checking the process is still alive
    #[serde(default = "default_spawn_confirm")]
    pub spawn_confirm_ms: u64,

    /// Delay after sweeping stray processes at startup
    #[serde(default = "default_stray_settle")]
    pub stray_settle_ms: u64,

    /// Polls of the listen port before giving up
    #[serde(default = "default_port_wait_retries")]
    pub port_wait_retries: u32,

    /// Delay between listen port polls
    #[serde(default = "default_port_wait_delay")]
    pub port_wait_delay_ms: u64,

    /// Delay between starting the proxy and starting the backend
    #[serde(default = "default_proxy_settle")]
    pub proxy_settle_ms: u64,

    /// Time allowed for the proxy's quiet shutdown
    #[serde(default = "default_proxy_quit_timeout")]
    pub proxy_quit_timeout_ms: u64,

    /// Time allowed for the backend to exit after SIGTERM
    #[serde(default = "default_backend_grace")]
    pub backend_grace_ms: u64,

    /// Time allowed for each forced kill to take effect
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,

    /// Delay after terminating the backend during a recycle
    #[serde(default = "default_recycle_settle")]
    pub recycle_settle_ms: u64,

    /// Polls of the backend port during a recycle
    #[serde(default = "default_recycle_port_retries")]
    pub recycle_port_retries: u32,

    /// Delay between backend port polls during a recycle
    #[serde(default = "default_recycle_port_delay")]
    pub recycle_port_delay_ms: u64,

    /// Backoff before the single restart retry of a recycle
    #[serde(default = "default_recycle_retry_backoff")]
    pub recycle_retry_backoff_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            spawn_confirm_ms: default_spawn_confirm(),
            stray_settle_ms: default_stray_settle(),
            port_wait_retries: default_port_wait_retries(),
            port_wait_delay_ms: default_port_wait_delay(),
            proxy_settle_ms: default_proxy_settle(),
            proxy_quit_timeout_ms: default_proxy_quit_timeout(),
            backend_grace_ms: default_backend_grace(),
            kill_timeout_ms: default_kill_timeout(),
            recycle_settle_ms: default_recycle_settle(),
            recycle_port_retries: default_recycle_port_retries(),
            recycle_port_delay_ms: default_recycle_port_delay(),
            recycle_retry_backoff_ms: default_recycle_retry_backoff(),
        }
    }
}

impl Timings {
    /// Millisecond values small enough for tests that spawn real processes
    pub fn fast() -> Self {
        Self {
            spawn_confirm_ms: 100,
            stray_settle_ms: 10,
            port_wait_retries: 3,
            port_wait_delay_ms: 10,
            proxy_settle_ms: 10,
            proxy_quit_timeout_ms: 500,
            backend_grace_ms: 500,
            kill_timeout_ms: 500,
            recycle_settle_ms: 10,
            recycle_port_retries: 2,
            recycle_port_delay_ms: 10,
            recycle_retry_backoff_ms: 20,
        }
    }

    pub fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_backend_port() -> u16 {
    9000
}

fn default_recycle_interval() -> u64 {
    240 // 4 hours
}

fn default_health_interval() -> u64 {
    5
}

fn default_auto_start() -> bool {
    true
}

fn default_proxy() -> ProxyConfig {
    ProxyConfig {
        root: default_proxy_root(),
        executable: default_proxy_executable(),
        args: Vec::new(),
        quit_args: default_quit_args(),
        config_path: default_proxy_config_path(),
        web_root: default_web_root(),
        env: HashMap::new(),
    }
}

fn default_backend() -> BackendConfig {
    BackendConfig {
        root: default_backend_root(),
        executable: default_backend_executable(),
        args: default_backend_args(),
        max_requests_env: default_max_requests_env(),
        max_requests: default_max_requests(),
        env: HashMap::new(),
    }
}

fn default_proxy_root() -> PathBuf {
    PathBuf::from("nginx")
}

fn default_proxy_executable() -> String {
    "nginx".to_string()
}

fn default_backend_root() -> PathBuf {
    PathBuf::from("php")
}

fn default_backend_executable() -> String {
    "php-cgi".to_string()
}

fn default_quit_args() -> Vec<String> {
    vec!["-s".to_string(), "quit".to_string()]
}

fn default_proxy_config_path() -> PathBuf {
    PathBuf::from("conf").join("nginx.conf")
}

fn default_web_root() -> PathBuf {
    PathBuf::from("html")
}

fn default_backend_args() -> Vec<String> {
    vec!["-b".to_string(), format!("127.0.0.1:{}", PORT_PLACEHOLDER)]
}

fn default_max_requests_env() -> String {
    "PHP_FCGI_MAX_REQUESTS".to_string()
}

fn default_max_requests() -> u32 {
    10000
}

fn default_spawn_confirm() -> u64 {
    200
}

fn default_stray_settle() -> u64 {
    1000
}

fn default_port_wait_retries() -> u32 {
    5
}

fn default_port_wait_delay() -> u64 {
    1000
}

fn default_proxy_settle() -> u64 {
    1000
}

fn default_proxy_quit_timeout() -> u64 {
    5000
}

fn default_backend_grace() -> u64 {
    3000
}

fn default_kill_timeout() -> u64 {
    2000
}

fn default_recycle_settle() -> u64 {
    500
}

fn default_recycle_port_retries() -> u32 {
    5
}

fn default_recycle_port_delay() -> u64 {
    500
}

fn default_recycle_retry_backoff() -> u64 {
    2000
}

/// Platform file name of an executable
pub fn executable_file_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

impl ProxyConfig {
    pub fn executable_path(&self) -> PathBuf {
        self.root.join(executable_file_name(&self.executable))
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(&self.config_path)
    }

    pub fn web_root_dir(&self) -> PathBuf {
        self.root.join(&self.web_root)
    }
}

impl BackendConfig {
    pub fn executable_path(&self) -> PathBuf {
        self.root.join(executable_file_name(&self.executable))
    }

    /// Start arguments with the port placeholder filled in
    pub fn resolved_args(&self, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect()
    }

    /// Environment for the backend, including the request ceiling
    pub fn resolved_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if !self.max_requests_env.is_empty() {
            env.insert(self.max_requests_env.clone(), self.max_requests.to_string());
        }
        env
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Configuration for proxy and backend installations under the given roots
    pub fn for_roots(proxy_root: impl Into<PathBuf>, backend_root: impl Into<PathBuf>) -> Self {
        let mut proxy = default_proxy();
        proxy.root = proxy_root.into();
        let mut backend = default_backend();
        backend.root = backend_root.into();
        Self {
            supervisor: SupervisorSettings::default(),
            proxy,
            backend,
            timings: Timings::default(),
        }
    }

    /// Set the proxy listen port (builder pattern)
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.supervisor.listen_port = port;
        self
    }

    /// Set the backend port (builder pattern)
    pub fn with_backend_port(mut self, port: u16) -> Self {
        self.supervisor.backend_port = port;
        self
    }

    /// Set the timings (builder pattern)
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Anchor relative installation roots at `base`
    pub fn resolve_relative_to(&mut self, base: &Path) {
        if self.proxy.root.is_relative() {
            self.proxy.root = base.join(&self.proxy.root);
        }
        if self.backend.root.is_relative() {
            self.backend.root = base.join(&self.backend.root);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let s = &self.supervisor;

        if s.listen_port == 0 {
            errors.push("'listen_port' must be between 1 and 65535".to_string());
        }
        if s.backend_port == 0 {
            errors.push("'backend_port' must be between 1 and 65535".to_string());
        }
        if s.listen_port != 0 && s.listen_port == s.backend_port {
            errors.push(format!(
                "'listen_port' and 'backend_port' must differ (both {})",
                s.listen_port
            ));
        }
        if !(1..=1440).contains(&s.recycle_interval_mins) {
            errors.push(format!(
                "'recycle_interval_mins' must be between 1 and 1440 (got {})",
                s.recycle_interval_mins
            ));
        }
        if s.health_check_interval_secs == 0 {
            errors.push("'health_check_interval_secs' must be greater than 0".to_string());
        }
        if self.proxy.executable.is_empty() {
            errors.push("proxy requires 'executable' field".to_string());
        }
        if self.backend.executable.is_empty() {
            errors.push("backend requires 'executable' field".to_string());
        }
        if self.timings.port_wait_retries == 0 {
            errors.push("'port_wait_retries' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[supervisor]
listen_port = 8080
backend_port = 9100
recycle_interval_mins = 60

[proxy]
root = "/opt/nginx"
executable = "nginx"

[backend]
root = "/opt/php"
executable = "php-cgi"
max_requests = 500

[backend.env]
PHPRC = "/opt/php"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.supervisor.listen_port, 8080);
        assert_eq!(config.supervisor.backend_port, 9100);
        assert_eq!(config.supervisor.recycle_interval(), Duration::from_secs(3600));
        assert_eq!(config.proxy.root, PathBuf::from("/opt/nginx"));
        assert_eq!(config.backend.max_requests, 500);
        assert_eq!(config.backend.env.get("PHPRC"), Some(&"/opt/php".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.supervisor.listen_port, 80);
        assert_eq!(config.supervisor.backend_port, 9000);
        assert_eq!(config.supervisor.recycle_interval_mins, 240);
        assert_eq!(config.supervisor.health_check_interval(), Duration::from_secs(5));
        assert!(config.supervisor.auto_start);
        assert_eq!(config.proxy.executable, "nginx");
        assert_eq!(config.proxy.quit_args, vec!["-s", "quit"]);
        assert_eq!(config.backend.executable, "php-cgi");
        assert_eq!(config.backend.max_requests_env, "PHP_FCGI_MAX_REQUESTS");
    }

    #[test]
    fn test_partial_tables_keep_defaults() {
        let config: Config = toml::from_str("[proxy]\nweb_root = \"www\"\n").unwrap();
        assert_eq!(config.proxy.root, PathBuf::from("nginx"));
        assert_eq!(config.proxy.executable, "nginx");
        assert_eq!(config.proxy.web_root, PathBuf::from("www"));
        assert_eq!(config.proxy.quit_args, vec!["-s", "quit"]);

        let config: Config = toml::from_str("[backend.env]\nPHPRC = \"x\"\n").unwrap();
        assert_eq!(config.backend.root, PathBuf::from("php"));
        assert_eq!(config.backend.executable, "php-cgi");
        assert_eq!(config.backend.env.get("PHPRC"), Some(&"x".to_string()));
        assert_eq!(config.backend.resolved_args(9000), vec!["-b", "127.0.0.1:9000"]);

        let config: Config = toml::from_str("[proxy]\nquit_args = []\n").unwrap();
        assert!(config.proxy.quit_args.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_timings() {
        let timings = Timings::default();
        assert_eq!(timings.port_wait_retries, 5);
        assert_eq!(timings.port_wait_delay_ms, 1000);
        assert_eq!(timings.proxy_settle_ms, 1000);
        assert_eq!(timings.proxy_quit_timeout_ms, 5000);
        assert_eq!(timings.kill_timeout_ms, 2000);
        assert_eq!(timings.recycle_retry_backoff_ms, 2000);
    }

    #[test]
    fn test_backend_args_substitute_port() {
        let config = Config::for_roots("/p", "/b");
        assert_eq!(config.backend.resolved_args(9123), vec!["-b", "127.0.0.1:9123"]);
    }

    #[test]
    fn test_backend_env_includes_max_requests() {
        let mut config = Config::for_roots("/p", "/b");
        config.backend.env.insert("A".to_string(), "1".to_string());

        let env = config.backend.resolved_env();
        assert_eq!(env.get("PHP_FCGI_MAX_REQUESTS"), Some(&"10000".to_string()));
        assert_eq!(env.get("A"), Some(&"1".to_string()));

        config.backend.max_requests_env = String::new();
        assert!(!config.backend.resolved_env().contains_key("PHP_FCGI_MAX_REQUESTS"));
    }

    #[test]
    fn test_validate_port_range() {
        let config = Config::for_roots("/p", "/b").with_listen_port(0);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'listen_port' must be between 1 and 65535"));
    }

    #[test]
    fn test_validate_ports_differ() {
        let config = Config::for_roots("/p", "/b")
            .with_listen_port(9000)
            .with_backend_port(9000);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_validate_recycle_interval_bounds() {
        let mut config = Config::for_roots("/p", "/b");
        config.supervisor.recycle_interval_mins = 0;
        assert!(config.validate().is_err());

        config.supervisor.recycle_interval_mins = 1441;
        assert!(config.validate().is_err());

        config.supervisor.recycle_interval_mins = 1440;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::for_roots("/p", "/b").with_listen_port(0);
        config.backend.executable = String::new();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'listen_port'"));
        assert!(err.contains("backend requires 'executable' field"));
    }

    #[test]
    fn test_relative_roots_resolve_against_base() {
        let mut config = Config::for_roots("nginx", "/abs/php");
        config.resolve_relative_to(Path::new("/srv/app"));
        assert_eq!(config.proxy.root, PathBuf::from("/srv/app/nginx"));
        assert_eq!(config.backend.root, PathBuf::from("/abs/php"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tierwarden.toml");
        std::fs::write(&path, "[supervisor]\nlisten_port = 8081\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.supervisor.listen_port, 8081);
        assert_eq!(config.proxy.root, dir.path().join("nginx"));
    }

    #[test]
    fn test_paths() {
        let config = Config::for_roots("/p", "/b");
        assert_eq!(config.proxy.config_file(), PathBuf::from("/p/conf/nginx.conf"));
        assert_eq!(config.proxy.web_root_dir(), PathBuf::from("/p/html"));
        assert!(config
            .backend
            .executable_path()
            .to_string_lossy()
            .starts_with("/b/php-cgi"));
    }
}
