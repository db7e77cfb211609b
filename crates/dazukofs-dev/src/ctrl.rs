use std::sync::Arc;

use tracing::debug;

use dazukofs_core::Engine;

use crate::error::DeviceError;
use crate::proto::{self, CtrlCommand};

/// One open session on the control device.
///
/// Writes carry group management commands; reads page through a listing of
/// the live groups that is rendered once per session on first read.
pub struct CtrlHandle {
    engine: Arc<Engine>,
    listing: Option<Vec<u8>>,
    pos: usize,
}

impl CtrlHandle {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            listing: None,
            pos: 0,
        }
    }

    /// Read the group listing, `"<id>:<name>\n"` per group. Returns 0 once
    /// the session has consumed the whole snapshot.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let listing = self
            .listing
            .get_or_insert_with(|| self.engine.list_groups().into_bytes());
        if self.pos >= listing.len() {
            return Ok(0);
        }
        let n = buf.len().min(listing.len() - self.pos);
        buf[..n].copy_from_slice(&listing[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Execute the command(s) in `buf`: `add=<NAME>`, `addtrack=<NAME>`,
    /// `del=<NAME>`. Stops at the first failing command.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        if buf.len() >= proto::CTRL_WRITE_MAX {
            return Err(DeviceError::WriteTooLarge(buf.len()));
        }
        for command in proto::parse_ctrl(buf)? {
            debug!(?command, "control command");
            match command {
                CtrlCommand::Del { name } => self.engine.remove_group(&name),
                CtrlCommand::Add { name, tracking } => {
                    self.engine.add_group(&name, tracking)?
                }
            }
        }
        Ok(buf.len())
    }
}
