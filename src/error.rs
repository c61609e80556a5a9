use thiserror::Error;

/// Broad failure classes callers use to decide between retrying and
/// abandoning a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad arguments, detached providers, exhausted capacity. State untouched.
    Usage,
    /// Rejected by a validation hook before anything was written.
    Invariant,
    /// On-disk structure is inconsistent. The instance must not be reused.
    Corruption,
    /// Failure of the backing storage.
    Io,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid magic number in header")]
    InvalidMagic,

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(u64),

    #[error("Stream {0} is reserved for system data")]
    ReservedStream(u64),

    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    #[error("Index {index} out of range (count {count})")]
    IndexOutOfRange { index: u64, count: u64 },

    #[error("Item at index {0} has been reaped")]
    ItemReaped(u64),

    #[error("Invalid Merkle coordinate ({level}, {index}) for tree of size {size}")]
    InvalidCoordinate { level: u32, index: u64, size: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Provider is not attached to a container")]
    Detached,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Container is poisoned after a previous corruption error")]
    Poisoned,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::DuplicateKey | StoreError::KeyNotFound => ErrorClass::Invariant,
            StoreError::InvalidMagic
            | StoreError::UnsupportedVersion { .. }
            | StoreError::Corruption(_)
            | StoreError::Poisoned => ErrorClass::Corruption,
            StoreError::Io(_) => ErrorClass::Io,
            _ => ErrorClass::Usage,
        }
    }

    /// True when the instance that produced this error must be abandoned.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Corruption
    }
}

impl From<StoreError> for std::io::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(e) => e,
            StoreError::Corruption(_) | StoreError::Poisoned => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
