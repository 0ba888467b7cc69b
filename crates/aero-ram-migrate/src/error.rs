use std::io;

/// Everything that can go wrong while driving a migration.
#[derive(thiserror::Error, Debug)]
pub enum MigrateError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// Violations of the wire contract, distinguished so callers can tell a
/// transport hiccup from a corrupt or adversarial stream.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    #[error("unknown flag combination: {0:#x}")]
    UnknownFlags(u64),

    #[error("received COMPRESS_PAGE but compression was not negotiated")]
    UnnegotiatedCompression,

    #[error("unknown region id {0:?}")]
    UnknownRegion(String),

    #[error("offset {offset} outside region {region} (len {len})")]
    OffsetOutOfRange {
        region: String,
        offset: u64,
        len: u64,
    },

    #[error("non-sequential target page: expected {expected:#x}, got {got:#x}")]
    NonSequentialTargetPage { expected: u64, got: u64 },

    #[error("decompressed length mismatch: expected {expected}, got {got}")]
    DecompressedLengthMismatch { expected: usize, got: usize },

    #[error("delta decode failed: corrupt input")]
    DeltaCorrupt,

    #[error("unsupported protocol version {0} (only 4 is supported)")]
    UnsupportedVersion(u32),

    #[error("region id exceeds 255 bytes")]
    RegionIdTooLong,

    #[error("handshake region {region} used_length mismatch: local {local}, remote {remote}")]
    RegionLengthMismatch { region: String, local: u64, remote: u64 },

    #[error("handshake region {region} page_size mismatch: local {local}, remote {remote}")]
    RegionPageSizeMismatch { region: String, local: u64, remote: u64 },
}

pub type Result<T> = std::result::Result<T, MigrateError>;
