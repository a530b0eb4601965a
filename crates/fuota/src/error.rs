use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("network-server client error: {0}")]
    Client(#[from] ns_client::ClientError),

    #[error("command codec error: {0}")]
    Command(#[from] applayer::CommandError),

    #[error("fragmentation error: {0}")]
    Fragmentation(#[from] applayer::fragmentation::FragmentationError),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
