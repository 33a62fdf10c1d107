use thiserror::Error;

/// Uniform outcome taxonomy shared by the reader, the storages and the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Okay,
    /// The stream was well formed but nothing matched the request
    NotFound,
    /// Pointer width of the bundle cannot be loaded by this process
    AddressLength,
    ReadError,
    CorruptError,
    CompressionError,
    MemoryError,
    OtherError,
}

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Invalid magic number in bundle header: {0:#010x}")]
    InvalidMagic(u32),

    #[error("Unsupported bundle version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Bundle uses {bundle}-bit addressing, host supports {host}-bit")]
    AddressLength { bundle: u32, host: u32 },

    #[error("No chunk matched the request")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch in chunk '{name}': expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        found: u32,
    },

    #[error("Fixup at {slot} points outside the data region (value {value}, data size {data_size})")]
    FixupOutOfBounds {
        slot: u64,
        value: u64,
        data_size: u64,
    },

    #[error("Corrupt bundle: {0}")]
    Corrupt(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Allocation error: {0}")]
    Memory(String),

    #[error("Load rejected: {0}")]
    Rejected(String),

    #[error("Dependency cycle through chunk type {0}")]
    DependencyCycle(u32),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BundleError {
    /// Collapse this error onto the shared taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            BundleError::NotFound => ErrorCode::NotFound,
            BundleError::AddressLength { .. } => ErrorCode::AddressLength,
            BundleError::Io(_) => ErrorCode::ReadError,
            BundleError::InvalidMagic(_)
            | BundleError::UnsupportedVersion { .. }
            | BundleError::ChecksumMismatch { .. }
            | BundleError::FixupOutOfBounds { .. }
            | BundleError::Corrupt(_) => ErrorCode::CorruptError,
            BundleError::Compression(_) => ErrorCode::CompressionError,
            BundleError::Memory(_) => ErrorCode::MemoryError,
            BundleError::Rejected(_)
            | BundleError::DependencyCycle(_)
            | BundleError::InvalidName(_)
            | BundleError::Config(_) => ErrorCode::OtherError,
        }
    }
}

impl From<toml::de::Error> for BundleError {
    fn from(err: toml::de::Error) -> Self {
        BundleError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BundleError>;

/// Map a `read`-style result onto its code, `Okay` on success
pub fn code_of<T>(result: &Result<T>) -> ErrorCode {
    match result {
        Ok(_) => ErrorCode::Okay,
        Err(err) => err.code(),
    }
}
