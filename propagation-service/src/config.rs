use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits for channel space.
    #[default]
    BlockProducer,
    /// Oldest queued events are discarded to make room.
    DropOldest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    CsvFile { path: PathBuf },
    NdjsonFile { path: PathBuf },
    Http { bind_addr: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// One failing plant aborts the whole event; no plant is updated.
    #[default]
    AllOrNothing,
    /// Successful plants are applied, failures are logged per plant.
    ApplyPartial,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlantLookup {
    /// Plants are loaded once at startup and grouped by meter.
    #[default]
    Memory,
    /// Affected plants are queried per event.
    Database,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "default_fanout_workers")]
    pub fanout_workers: usize,
    #[serde(default)]
    pub batch_policy: BatchPolicy,
    #[serde(default)]
    pub plant_lookup: PlantLookup,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recv_timeout_ms: default_recv_timeout_ms(),
            fanout_workers: default_fanout_workers(),
            batch_policy: BatchPolicy::default(),
            plant_lookup: PlantLookup::default(),
        }
    }
}

impl EngineConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_diffuse_fraction")]
    pub diffuse_fraction: f64,
    #[serde(default = "default_performance_ratio")]
    pub performance_ratio: f64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            diffuse_fraction: default_diffuse_fraction(),
            performance_ratio: default_performance_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// Append-only `pv_realtime` ledger.
    #[default]
    Ledger,
    /// Overwrite `pv_plants.power_kw`; loses history.
    Upsert,
    /// In-process ledger, nothing leaves the process.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub mode: SinkMode,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    pub sink: SinkConfig,
    pub http: Option<HttpConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("PROPAGATION_CONFIG").unwrap_or_else(|_| "propagation-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.source.channel_capacity == 0 {
            anyhow::bail!("source.channel_capacity must be at least 1");
        }
        Ok(cfg)
    }
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_recv_timeout_ms() -> u64 {
    250
}

fn default_fanout_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_diffuse_fraction() -> f64 {
    0.3
}

fn default_performance_ratio() -> f64 {
    0.85
}
