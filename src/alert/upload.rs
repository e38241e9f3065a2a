//! Copying an alert recording into the modem's flash file system.

use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::alert::transport::{AtClient, Transport, TransportError};
use crate::clock::Clock;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("module did not answer AT (got {0:?})")]
    NotResponding(String),

    #[error("could not select flash drive (got {0:?})")]
    DriveSelect(String),

    #[error("module refused file write (got {0:?})")]
    WriteRejected(String),

    #[error("sending file data failed")]
    Transfer(#[from] TransportError),

    #[error("transfer not acknowledged (got {0:?})")]
    NotConfirmed(String),
}

#[derive(Clone, Debug, Serialize)]
pub struct UploadReport {
    pub remote_name: String,
    pub bytes: usize,
    pub response: String,
}

/// `AT+FSDRIVE` / `AT+FSDEL` / `AT+FSWRITE` upload sequence.
#[derive(Clone, Debug)]
pub struct FlashUpload {
    pub command_wait: Duration,
    /// Wait after the raw bytes before looking for the final `OK`.
    pub transfer_wait: Duration,
    /// Seconds the module waits for the data once it answered `CONNECT`.
    pub write_timeout_secs: u32,
}

impl Default for FlashUpload {
    fn default() -> Self {
        Self {
            command_wait: Duration::from_secs(2),
            transfer_wait: Duration::from_secs(5),
            write_timeout_secs: 10,
        }
    }
}

impl FlashUpload {
    pub fn run<T: Transport, C: Clock>(
        &self,
        at: &mut AtClient<T, C>,
        remote_name: &str,
        data: &[u8],
    ) -> Result<UploadReport, UploadError> {
        let ping = at.command("AT", "OK", self.command_wait);
        if !ping.ok {
            return Err(UploadError::NotResponding(ping.response));
        }

        let drive = at.command("AT+FSDRIVE=0", "OK", self.command_wait);
        if !drive.ok {
            return Err(UploadError::DriveSelect(drive.response));
        }

        // Fails harmlessly when the file is not there yet.
        let delete = at.command(&format!("AT+FSDEL={}", remote_name), "OK", self.command_wait);
        if !delete.ok {
            info!("[MODEM] no previous {} on flash", remote_name);
        }

        let write = at.command(
            &format!(
                "AT+FSWRITE={},0,{},{}",
                remote_name,
                data.len(),
                self.write_timeout_secs
            ),
            "CONNECT",
            self.command_wait,
        );
        if !write.ok {
            return Err(UploadError::WriteRejected(write.response));
        }

        info!("[MODEM] sending {} bytes as {}", data.len(), remote_name);
        at.write_raw(data)?;
        let done = at.expect_response("OK", self.transfer_wait);
        if !done.ok {
            warn!("[MODEM] upload of {} not acknowledged", remote_name);
            return Err(UploadError::NotConfirmed(done.response));
        }

        Ok(UploadReport {
            remote_name: remote_name.to_string(),
            bytes: data.len(),
            response: done.response,
        })
    }
}
