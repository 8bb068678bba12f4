use std::path::PathBuf;

use thiserror::Error;

use super::message::ReplicaId;
use super::wal::WalError;

#[derive(Debug, Error)]
pub enum PbftError {
    #[error("need at least {need} replicas to tolerate {f} byzantine faults, but only {n} configured")]
    NotEnoughReplicas { need: u64, f: u64, n: u64 },

    #[error("log multiplier must be greater than or equal to 2, got {0}")]
    LogMultiplierTooSmall(u64),

    #[error("checkpoint period must be non-zero")]
    ZeroCheckpointPeriod,

    #[error("{count} peers configured, outside the range allowed by f={f}, N={n}")]
    PeersOutOfRange { count: u64, f: u64, n: u64 },

    #[error("replica {0} is not in the peer set")]
    UnknownReplica(ReplicaId),

    #[error("invalid signature on message from replica {from}")]
    InvalidSignature { from: ReplicaId },

    #[error("message claims to be from replica {claimed} but was delivered by {actual}")]
    SenderMismatch { claimed: ReplicaId, actual: ReplicaId },

    #[error("failed to read config file at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("request log: {0}")]
    Wal(#[from] WalError),
}

pub type PbftResult<T> = Result<T, PbftError>;
