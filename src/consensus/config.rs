use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{PbftError, PbftResult};
use super::message::{ReplicaId, SeqNo, View};

/// Static configuration of one replica, usually loaded from a TOML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Replica id, 1..=N.
    pub id: ReplicaId,
    /// Maximum number of byzantine replicas tolerated.
    pub f: u64,
    /// Maximum number of validating replicas.
    pub n: u64,
    /// Checkpoint period K.
    #[serde(default = "default_checkpoint_period")]
    pub checkpoint_period: u64,
    /// The log holds `checkpoint_period * log_multiplier` sequence numbers.
    #[serde(default = "default_log_multiplier")]
    pub log_multiplier: u64,
    #[serde(default = "default_initial_view")]
    pub initial_view: View,
    /// Fault injection for tests: a byzantine primary equivocates.
    #[serde(default)]
    pub byzantine: bool,
    #[serde(default = "default_view_change_timeout_ms")]
    pub view_change_timeout_ms: u64,
    #[serde(default = "default_view_change_resend_timeout_ms")]
    pub view_change_resend_timeout_ms: u64,
    #[serde(default = "default_new_view_timeout_ms")]
    pub new_view_timeout_ms: u64,
    #[serde(default)]
    pub wal_path: Option<PathBuf>,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub genesis: String,
    pub genesis_block_time: u64,
    pub client_addr: String,
}

fn default_checkpoint_period() -> u64 {
    10
}

fn default_log_multiplier() -> u64 {
    4
}

fn default_initial_view() -> View {
    1
}

fn default_view_change_timeout_ms() -> u64 {
    60_000
}

fn default_view_change_resend_timeout_ms() -> u64 {
    20_000
}

fn default_new_view_timeout_ms() -> u64 {
    60_000
}

impl ReplicaConfig {
    pub fn new(id: ReplicaId, f: u64, n: u64) -> Self {
        ReplicaConfig {
            id,
            f,
            n,
            checkpoint_period: default_checkpoint_period(),
            log_multiplier: default_log_multiplier(),
            initial_view: default_initial_view(),
            byzantine: false,
            view_change_timeout_ms: default_view_change_timeout_ms(),
            view_change_resend_timeout_ms: default_view_change_resend_timeout_ms(),
            new_view_timeout_ms: default_new_view_timeout_ms(),
            wal_path: None,
            genesis: GenesisConfig::default(),
        }
    }

    pub fn load(path: &Path) -> PbftResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PbftError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> PbftResult<Self> {
        let config: ReplicaConfig = toml::from_str(content)?;
        debug!(id = config.id, f = config.f, n = config.n, "config loaded");
        Ok(config)
    }

    pub fn view_change_timeout(&self) -> Duration {
        Duration::from_millis(self.view_change_timeout_ms)
    }

    pub fn view_change_resend_timeout(&self) -> Duration {
        Duration::from_millis(self.view_change_resend_timeout_ms)
    }

    pub fn new_view_timeout(&self) -> Duration {
        Duration::from_millis(self.new_view_timeout_ms)
    }
}

/*
    Values derived once at construction. replica_count is the number of peers
    actually configured, replica_f the faults it can absorb; quorum is
    replica_count - replica_f, which equals 2f+1 when N = 3f+1.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quorum {
    pub f: u64,
    pub n: u64,
    pub replica_count: u64,
    pub replica_f: u64,
    pub k: u64,
    pub log_multiplier: u64,
    pub l: u64,
}

impl Quorum {
    pub fn new(config: &ReplicaConfig, replica_count: u64) -> PbftResult<Self> {
        let (f, n) = (config.f, config.n);
        if 3 * f + 1 > n {
            return Err(PbftError::NotEnoughReplicas { need: 3 * f + 1, f, n });
        }
        if config.log_multiplier < 2 {
            return Err(PbftError::LogMultiplierTooSmall(config.log_multiplier));
        }
        if config.checkpoint_period == 0 {
            return Err(PbftError::ZeroCheckpointPeriod);
        }

        let replica_f = replica_count / 3;
        if replica_count == 0 || replica_count > n || replica_f > f {
            return Err(PbftError::PeersOutOfRange { count: replica_count, f, n });
        }

        Ok(Quorum {
            f,
            n,
            replica_count,
            replica_f,
            k: config.checkpoint_period,
            log_multiplier: config.log_multiplier,
            l: config.checkpoint_period * config.log_multiplier,
        })
    }

    /// Matching votes needed for a prepared/committed/stable certificate.
    pub fn quorum(&self) -> usize {
        (self.replica_count - self.replica_f) as usize
    }

    /// Votes needed to be sure at least one correct replica is among them.
    pub fn weak(&self) -> usize {
        (self.replica_f + 1) as usize
    }

    pub fn is_checkpoint(&self, seq: SeqNo) -> bool {
        seq % self.k == 0
    }
}
