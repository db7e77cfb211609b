use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("group name is empty or not [A-Za-z0-9_-]")]
    InvalidName,

    #[error("no such group: {0}")]
    NoSuchGroup(usize),

    #[error("group limit reached ({0} groups)")]
    GroupLimit(usize),

    #[error("no claimed event with id {0}")]
    NoSuchEvent(u64),

    #[error("wait interrupted")]
    Interrupted,

    #[error("access denied by policy")]
    Denied,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
