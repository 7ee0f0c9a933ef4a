use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Couldn't open the backing PM file
    #[error("Opening the PM file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing PM file
    #[error("Failed to lock the PM file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing PM file
    #[error("Synchronizing to the PM file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't establish the PM mapping
    #[error("Can't map PM. Tried to get 0x{requested:x} bytes")]
    MapFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// Missing or malformed configuration field
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Local allocator or remote agent is out of memory
    #[error("Out of persistent memory")]
    NoMemory,
    /// The key is already present
    #[error("Key already present")]
    DuplicateKey,
    /// An RDMA post or poll failed
    #[error("Peer transport failure: {0}")]
    TransportFailure(&'static str),
    /// PM recovery detected an invariant violation
    #[error("Persistent state corrupted: {0}")]
    Corrupted(&'static str),
    /// All 64 worker slots are taken
    #[error("No worker slot available")]
    NoSlot,
    /// A single allocation can never exceed one page
    #[error("Requested chunk of 0x{0:x} bytes exceeds a page")]
    ChunkTooLarge(usize),
    /// Malformed request or response bytes
    #[error("Malformed wire message: {0}")]
    Wire(&'static str),
}
