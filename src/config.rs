use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("mTLS configuration incomplete: both RAFT_TLS_CERT and RAFT_TLS_KEY must be set together, or neither")]
    IncompleteMtls,

    #[error("Invalid duration format for {var}: {message}")]
    InvalidDuration { var: String, message: String },
}

/// Configuration for a single replica of the replicated store.
///
/// Loaded from environment variables (`from_env`), following the pattern in
/// `cbaugus_rust_loadtest`'s own config module: required vars fail fast,
/// optional vars take a typed default, and a `validate()` pass runs after
/// construction rather than being scattered through the parse.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies the raft group this node's partitions belong to (spec §6.4
    /// `deployment_id`).
    pub deployment_id: String,
    /// This node's own cluster id and node id, per spec §3/§4.6.
    pub cluster_id: u64,
    pub node_id: u64,
    /// Address this node listens on for raft RPCs.
    pub listen_address: String,
    /// Address other nodes should dial to reach this node; defaults to
    /// `listen_address` when unset.
    pub raft_address: String,
    /// `node_id -> address` seed set used on first bootstrap only.
    pub bootstrap_nodes: Vec<(u64, String)>,
    pub join: bool,

    pub tls_ca: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,

    /// Directory the embedded store opens its database file(s) under.
    pub store_dir: String,

    pub gc_discard_ratio: f64,
    pub gc_interval: Duration,
    pub gc_sleep: Duration,

    pub election_rtt: u64,
    pub heartbeat_rtt: u64,
    pub check_quorum: bool,
    pub snapshot_entries: u64,
    pub compaction_overhead: u64,

    /// Soft per-transaction byte budget before the store proactively commits
    /// and retries a batched write on a fresh transaction (spec §4.2
    /// `TxnTooBig`).
    pub max_txn_bytes: usize,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

fn parse_duration_secs(var: &str, val: &str) -> Result<Duration, ConfigError> {
    val.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::InvalidDuration {
            var: var.into(),
            message: e.to_string(),
        })
}

/// Parses a `node_id=host:port` seed entry for `RAFT_BOOTSTRAP_NODES`.
fn parse_bootstrap_entry(entry: &str) -> Result<(u64, String), ConfigError> {
    let (id_str, addr) = entry.trim().split_once('=').ok_or_else(|| ConfigError::InvalidValue {
        var: "RAFT_BOOTSTRAP_NODES".into(),
        message: format!("expected node_id=host:port, got '{entry}'"),
    })?;
    let node_id: u64 = id_str.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
        var: "RAFT_BOOTSTRAP_NODES".into(),
        message: e.to_string(),
    })?;
    Ok((node_id, addr.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let deployment_id = env::var("RAFT_DEPLOYMENT_ID").unwrap_or_else(|_| "default".to_string());

        let cluster_id: u64 = env_parse_or("RAFT_CLUSTER_ID", 1)?;
        let node_id: u64 = env_required("RAFT_NODE_ID")?
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                var: "RAFT_NODE_ID".into(),
                message: e.to_string(),
            })?;

        let listen_address = env_required("RAFT_LISTEN_ADDRESS")?;
        let raft_address = env::var("RAFT_ADDRESS").unwrap_or_else(|_| listen_address.clone());

        let bootstrap_nodes = match env::var("RAFT_BOOTSTRAP_NODES") {
            Ok(val) if !val.is_empty() => val
                .split(',')
                .map(parse_bootstrap_entry)
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let join = env_bool("RAFT_JOIN", false);

        let tls_ca = env::var("RAFT_TLS_CA").ok();
        let tls_cert = env::var("RAFT_TLS_CERT").ok();
        let tls_key = env::var("RAFT_TLS_KEY").ok();

        let store_dir = env::var("STORE_DIR").unwrap_or_else(|_| "./data".to_string());

        let gc_discard_ratio: f64 = env_parse_or("GC_DISCARD_RATIO", 0.5)?;
        let gc_interval = parse_duration_secs(
            "GC_INTERVAL_SECS",
            &env::var("GC_INTERVAL_SECS").unwrap_or_else(|_| "900".to_string()),
        )?;
        let gc_sleep = parse_duration_secs(
            "GC_SLEEP_SECS",
            &env::var("GC_SLEEP_SECS").unwrap_or_else(|_| "10".to_string()),
        )?;

        let election_rtt: u64 = env_parse_or("RAFT_ELECTION_RTT", 10)?;
        let heartbeat_rtt: u64 = env_parse_or("RAFT_HEARTBEAT_RTT", 1)?;
        let check_quorum = env_bool("RAFT_CHECK_QUORUM", true);
        let snapshot_entries: u64 = env_parse_or("RAFT_SNAPSHOT_ENTRIES", 100_000)?;
        let compaction_overhead: u64 = env_parse_or("RAFT_COMPACTION_OVERHEAD", 20_000)?;

        let max_txn_bytes: usize = env_parse_or("STORE_MAX_TXN_BYTES", 64 * 1024 * 1024)?;

        let config = Config {
            deployment_id,
            cluster_id,
            node_id,
            listen_address,
            raft_address,
            bootstrap_nodes,
            join,
            tls_ca,
            tls_cert,
            tls_key,
            store_dir,
            gc_discard_ratio,
            gc_interval,
            gc_sleep,
            election_rtt,
            heartbeat_rtt,
            check_quorum,
            snapshot_entries,
            compaction_overhead,
            max_txn_bytes,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_id == 0 {
            return Err(ConfigError::InvalidValue {
                var: "RAFT_CLUSTER_ID".into(),
                message: "must be greater than 0".into(),
            });
        }

        if !self.join && self.bootstrap_nodes.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "RAFT_BOOTSTRAP_NODES".into(),
                message: "must name at least one node when RAFT_JOIN is false".into(),
            });
        }

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::IncompleteMtls);
        }

        if !(0.0..=1.0).contains(&self.gc_discard_ratio) {
            return Err(ConfigError::InvalidValue {
                var: "GC_DISCARD_RATIO".into(),
                message: "must be between 0.0 and 1.0".into(),
            });
        }

        if self.max_txn_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                var: "STORE_MAX_TXN_BYTES".into(),
                message: "must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Creates a default Config for testing purposes.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            deployment_id: "test".into(),
            cluster_id: 1,
            node_id: 1,
            listen_address: "127.0.0.1:0".into(),
            raft_address: "127.0.0.1:0".into(),
            bootstrap_nodes: vec![(1, "127.0.0.1:0".into())],
            join: false,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            store_dir: "./data".into(),
            gc_discard_ratio: 0.5,
            gc_interval: Duration::from_secs(900),
            gc_sleep: Duration::from_secs(10),
            election_rtt: 10,
            heartbeat_rtt: 1,
            check_quorum: true,
            snapshot_entries: 100_000,
            compaction_overhead: 20_000,
            max_txn_bytes: 64 * 1024 * 1024,
        }
    }

    /// Prints the configuration summary to stdout.
    pub fn print_summary(&self) {
        println!("Starting raft node:");
        println!("  Deployment: {}", self.deployment_id);
        println!("  Cluster id: {}", self.cluster_id);
        println!("  Node id: {}", self.node_id);
        println!("  Listen address: {}", self.listen_address);
        println!("  Raft address: {}", self.raft_address);
        println!("  Join: {}", self.join);
        println!("  Bootstrap nodes: {:?}", self.bootstrap_nodes);
        println!("  Store dir: {}", self.store_dir);
        println!(
            "  TLS enabled: {}",
            self.tls_cert.is_some() && self.tls_key.is_some()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        let vars = [
            "RAFT_DEPLOYMENT_ID",
            "RAFT_CLUSTER_ID",
            "RAFT_NODE_ID",
            "RAFT_LISTEN_ADDRESS",
            "RAFT_ADDRESS",
            "RAFT_BOOTSTRAP_NODES",
            "RAFT_JOIN",
            "RAFT_TLS_CA",
            "RAFT_TLS_CERT",
            "RAFT_TLS_KEY",
            "STORE_DIR",
            "GC_DISCARD_RATIO",
            "GC_INTERVAL_SECS",
            "GC_SLEEP_SECS",
            "RAFT_ELECTION_RTT",
            "RAFT_HEARTBEAT_RTT",
            "RAFT_CHECK_QUORUM",
            "RAFT_SNAPSHOT_ENTRIES",
            "RAFT_COMPACTION_OVERHEAD",
            "STORE_MAX_TXN_BYTES",
        ];
        for var in vars {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_with_minimal_config() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RAFT_NODE_ID", "1");
        env::set_var("RAFT_LISTEN_ADDRESS", "127.0.0.1:8080");
        env::set_var("RAFT_BOOTSTRAP_NODES", "1=127.0.0.1:8080");

        let config = Config::from_env().unwrap();
        assert_eq!(config.deployment_id, "default");
        assert_eq!(config.cluster_id, 1);
        assert_eq!(config.node_id, 1);
        assert_eq!(config.raft_address, "127.0.0.1:8080");
        assert_eq!(config.gc_discard_ratio, 0.5);
        assert_eq!(config.gc_interval, Duration::from_secs(900));
        assert_eq!(config.election_rtt, 10);
        assert_eq!(config.heartbeat_rtt, 1);
        assert!(config.check_quorum);
        assert_eq!(config.snapshot_entries, 100_000);
        assert_eq!(config.compaction_overhead, 20_000);

        clear_env_vars();
    }

    #[test]
    fn bootstrap_nodes_parsed() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RAFT_NODE_ID", "1");
        env::set_var("RAFT_LISTEN_ADDRESS", "127.0.0.1:8080");
        env::set_var(
            "RAFT_BOOTSTRAP_NODES",
            "1=127.0.0.1:8080,2=127.0.0.1:8081",
        );

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.bootstrap_nodes,
            vec![(1, "127.0.0.1:8080".to_string()), (2, "127.0.0.1:8081".to_string())]
        );

        clear_env_vars();
    }

    #[test]
    fn missing_node_id_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RAFT_LISTEN_ADDRESS", "127.0.0.1:8080");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(ref var)) if var == "RAFT_NODE_ID"));

        clear_env_vars();
    }

    #[test]
    fn join_without_bootstrap_is_allowed() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RAFT_NODE_ID", "2");
        env::set_var("RAFT_LISTEN_ADDRESS", "127.0.0.1:8081");
        env::set_var("RAFT_JOIN", "true");

        let config = Config::from_env().unwrap();
        assert!(config.join);
        assert!(config.bootstrap_nodes.is_empty());

        clear_env_vars();
    }

    #[test]
    fn no_bootstrap_and_no_join_is_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RAFT_NODE_ID", "1");
        env::set_var("RAFT_LISTEN_ADDRESS", "127.0.0.1:8080");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "RAFT_BOOTSTRAP_NODES"
        ));

        clear_env_vars();
    }

    #[test]
    fn incomplete_mtls_cert_only_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RAFT_NODE_ID", "1");
        env::set_var("RAFT_LISTEN_ADDRESS", "127.0.0.1:8080");
        env::set_var("RAFT_BOOTSTRAP_NODES", "1=127.0.0.1:8080");
        env::set_var("RAFT_TLS_CERT", "/path/to/cert.pem");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::IncompleteMtls)));

        clear_env_vars();
    }

    #[test]
    fn invalid_gc_discard_ratio_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RAFT_NODE_ID", "1");
        env::set_var("RAFT_LISTEN_ADDRESS", "127.0.0.1:8080");
        env::set_var("RAFT_BOOTSTRAP_NODES", "1=127.0.0.1:8080");
        env::set_var("GC_DISCARD_RATIO", "1.5");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "GC_DISCARD_RATIO"
        ));

        clear_env_vars();
    }

    #[test]
    fn for_testing_creates_valid_config() {
        let config = Config::for_testing();
        assert_eq!(config.cluster_id, 1);
        assert_eq!(config.node_id, 1);
        assert!(!config.join);
    }
}
