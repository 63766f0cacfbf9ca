use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_BROKER_URL: &str = "mqtt://mqtt.qfdk.me:1883";
pub const DEFAULT_TOPIC_PREFIX: &str = "uranus";
const AGENT_ID_FILE: &str = "agent-id";

#[derive(Debug, Parser)]
#[command(
    name = "uranus-agent",
    version,
    about = "Remote terminal and nginx control agent"
)]
pub struct Args {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Agent identity (defaults to the id persisted in the data dir)
    #[arg(long)]
    pub agent_id: Option<String>,

    /// MQTT broker URL, e.g. mqtt://host:1883
    #[arg(long)]
    pub broker: Option<String>,

    #[arg(long)]
    pub topic_prefix: Option<String>,

    /// Default shell for new terminal sessions
    #[arg(long)]
    pub shell: Option<PathBuf>,

    /// Serve direct WebSocket terminals on this address
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Allowed browser origin for the WebSocket listener (repeatable, `*` for any)
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,

    /// Do not connect to the MQTT broker
    #[arg(long)]
    pub no_broker: bool,

    /// Where the agent keeps its persistent state
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub agent_id: Option<String>,
    pub broker_url: Option<String>,
    pub topic_prefix: Option<String>,
    pub broker_enabled: Option<bool>,
    pub default_shell: Option<PathBuf>,
    pub output_queue_capacity: Option<usize>,
    pub listen: Option<SocketAddr>,
    pub allow_origins: Option<Vec<String>>,
    pub nginx_pid_file: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub update_url: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub idle_check_secs: Option<u64>,
    pub exec_timeout_secs: Option<u64>,
    pub data_dir: Option<PathBuf>,
}

/// Effective configuration, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub broker_url: String,
    pub topic_prefix: String,
    pub broker_enabled: bool,
    pub default_shell: Option<PathBuf>,
    pub output_queue_capacity: usize,
    pub listen: Option<SocketAddr>,
    pub allow_origins: Vec<String>,
    pub nginx_pid_file: PathBuf,
    pub install_dir: PathBuf,
    pub update_url: Option<String>,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub idle_check: Duration,
    pub exec_timeout: Duration,
    pub data_dir: PathBuf,
}

/// Merge CLI flags over the config file over built-in defaults.
pub fn load_config(args: &Args) -> Result<AgentConfig> {
    let file_cfg = match &args.config {
        Some(path) => read_file_config(path)?,
        None => FileConfig::default(),
    };

    let data_dir = args
        .data_dir
        .clone()
        .or(file_cfg.data_dir)
        .unwrap_or_else(default_data_dir);

    let agent_id = match args.agent_id.clone().or(file_cfg.agent_id) {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => load_or_create_agent_id(&data_dir)?,
    };

    let topic_prefix = args
        .topic_prefix
        .clone()
        .or(file_cfg.topic_prefix)
        .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
    if topic_prefix.trim_matches('/').is_empty() {
        bail!("topic prefix must not be empty");
    }

    let allow_origins = if args.allow_origins.is_empty() {
        file_cfg
            .allow_origins
            .unwrap_or_else(|| vec!["http://localhost:3000".to_string()])
    } else {
        args.allow_origins.clone()
    };

    let install_dir = match file_cfg.install_dir {
        Some(dir) => dir,
        None => default_install_dir(),
    };

    Ok(AgentConfig {
        agent_id,
        broker_url: args
            .broker
            .clone()
            .or(file_cfg.broker_url)
            .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string()),
        topic_prefix,
        broker_enabled: !args.no_broker && file_cfg.broker_enabled.unwrap_or(true),
        default_shell: args.shell.clone().or(file_cfg.default_shell),
        output_queue_capacity: file_cfg
            .output_queue_capacity
            .unwrap_or(liburanus::session::DEFAULT_QUEUE_CAPACITY)
            .max(1),
        listen: args.listen.or(file_cfg.listen),
        allow_origins,
        nginx_pid_file: file_cfg
            .nginx_pid_file
            .unwrap_or_else(|| PathBuf::from("/run/nginx.pid")),
        install_dir,
        update_url: file_cfg.update_url,
        heartbeat_interval: secs(file_cfg.heartbeat_interval_secs, 300),
        idle_timeout: secs(file_cfg.idle_timeout_secs, 600),
        idle_check: secs(file_cfg.idle_check_secs, 120),
        exec_timeout: secs(file_cfg.exec_timeout_secs, 30),
        data_dir,
    })
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.filter(|v| *v > 0).unwrap_or(default))
}

/// Read the persisted agent id, generating and storing one on first run.
pub fn load_or_create_agent_id(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(AGENT_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(raw) if !raw.trim().is_empty() => return Ok(raw.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    }

    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let id = uuid::Uuid::new_v4().to_string();
    fs::write(&path, format!("{id}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(agent_id = %id, path = %path.display(), "generated agent id");
    Ok(id)
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".uranus"),
        _ => PathBuf::from("/var/lib/uranus"),
    }
}

fn default_install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("/usr/local/bin"))
}
