use nix::errno::Errno;
use thiserror::Error;

use dazukofs_core::EngineError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("malformed control command")]
    BadCommand,

    #[error("control write too large ({0} bytes)")]
    WriteTooLarge(usize),

    #[error("malformed verdict line")]
    BadVerdict,

    #[error("buffer too small ({got} bytes, need {need})")]
    BufferTooSmall { got: usize, need: usize },

    #[error("no such device node")]
    NoSuchNode,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl DeviceError {
    /// The POSIX errno a character-device host should surface.
    pub fn errno(&self) -> Errno {
        match self {
            DeviceError::BadCommand
            | DeviceError::WriteTooLarge(_)
            | DeviceError::BadVerdict
            | DeviceError::BufferTooSmall { .. } => Errno::EINVAL,
            DeviceError::NoSuchNode => Errno::ENOENT,
            DeviceError::Engine(err) => match err {
                EngineError::InvalidName
                | EngineError::NoSuchGroup(_)
                | EngineError::NoSuchEvent(_) => Errno::EINVAL,
                EngineError::GroupLimit(_) | EngineError::Denied => Errno::EPERM,
                EngineError::Interrupted => Errno::EINTR,
                EngineError::Io(io) => io
                    .raw_os_error()
                    .map(Errno::from_i32)
                    .unwrap_or(Errno::EIO),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(DeviceError::BadCommand.errno(), Errno::EINVAL);
        assert_eq!(
            DeviceError::Engine(EngineError::GroupLimit(10)).errno(),
            Errno::EPERM
        );
        assert_eq!(
            DeviceError::Engine(EngineError::Interrupted).errno(),
            Errno::EINTR
        );
        assert_eq!(
            DeviceError::Engine(EngineError::Io(std::io::Error::from_raw_os_error(
                libc_enoent()
            )))
            .errno(),
            Errno::ENOENT
        );
    }

    fn libc_enoent() -> i32 {
        Errno::ENOENT as i32
    }
}
