// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side driver for the paravirtualized crypto device.
//!
//! Presents character-device semantics (open, close, session setup and
//! teardown, encrypt/decrypt) over a descriptor queue served by the host
//! device in `cryptodev_device`. Each call is synchronous: the request is
//! encoded into a descriptor set, submitted, and the calling thread blocks
//! until the host returns the completed set. A per-device lock covers the
//! whole submit/wait sequence, so at most one request is ever in flight per
//! device and callers sharing a device serialize instead of interleaving
//! partially built descriptor sets.

#![forbid(unsafe_code)]

mod registry;

pub use registry::DeviceRegistry;
pub use registry::DuplicateMinor;

use cryptodev_protocol as protocol;
use cryptodev_protocol::Direction;
use cryptodev_protocol::IV_SIZE;
use cryptodev_protocol::IoctlRequest;
use cryptodev_protocol::NO_HOST_FD;
use cryptodev_protocol::ProtocolError;
use cryptodev_protocol::Request;
use cryptodev_ring::DescriptorSet;
use cryptodev_ring::GuestHandle;
use cryptodev_ring::RingError;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to callers of the driver.
///
/// Real-device semantic failures arrive as [`Error::DeviceFailure`] carrying
/// the in-band status; they are distinct from transport faults, which are
/// fatal to the call.
#[derive(Debug, Error)]
pub enum Error {
    /// No device is registered under the requested minor number.
    #[error("no crypto device registered for minor {0}")]
    NoSuchDevice(u32),
    /// The host failed to open the real device and returned a negative
    /// handle.
    #[error("host rejected the open request")]
    HostRejected,
    /// The caller's buffers are inconsistent with each other.
    #[error("source holds {src} bytes but destination holds {dst}")]
    UnequalBufferLengths {
        /// Source buffer length.
        src: usize,
        /// Destination buffer length.
        dst: usize,
    },
    /// The transport channel failed; the call cannot complete.
    #[error("transport channel failure")]
    Ring(#[source] RingError),
    /// The completed descriptor set did not decode as a response.
    #[error("malformed completion")]
    Protocol(#[source] ProtocolError),
    /// The real device reported a failure through the in-band status.
    #[error("device reported failure (status {status})")]
    DeviceFailure {
        /// The errno-style status code.
        status: i32,
    },
}

/// One paravirtualized crypto device: a transport endpoint plus the lock
/// that serializes calls against it.
pub struct CryptoDevice {
    minor: u32,
    queue: GuestHandle,
    transact_lock: Mutex<()>,
}

impl CryptoDevice {
    /// Creates a device over the guest end of a connected queue pair.
    pub fn new(minor: u32, queue: GuestHandle) -> Self {
        Self {
            minor,
            queue,
            transact_lock: Mutex::new(()),
        }
    }

    /// The minor number this device answers to.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Submits one descriptor set and blocks until the host completes it.
    ///
    /// The lock spans submit and wait: exactly one request in flight per
    /// device, and the completion retrieved always belongs to the request
    /// just submitted.
    fn transact(&self, set: DescriptorSet) -> Result<DescriptorSet, Error> {
        let _guard = self.transact_lock.lock();
        self.queue.submit(set).map_err(Error::Ring)?;
        self.queue.wait_complete().map_err(Error::Ring)
    }
}

/// An open file against a crypto device, exclusively owning its host-side
/// handle from successful open until close.
pub struct CryptoFile {
    device: Arc<CryptoDevice>,
    host_fd: i64,
    closed: bool,
}

impl std::fmt::Debug for CryptoFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoFile")
            .field("minor", &self.device.minor())
            .field("host_fd", &self.host_fd)
            .field("closed", &self.closed)
            .finish()
    }
}

impl CryptoFile {
    /// Opens the device registered under `minor`.
    ///
    /// Issues an OPEN call and fails with [`Error::HostRejected`] if the
    /// host hands back a negative handle.
    pub fn open(registry: &DeviceRegistry, minor: u32) -> Result<Self, Error> {
        let device = registry.lookup(minor).ok_or(Error::NoSuchDevice(minor))?;
        let set = device.transact(Request::Open.encode())?;
        let host_fd = protocol::read_open_response(&set).map_err(Error::Protocol)?;
        if host_fd < 0 {
            tracing::debug!(minor, host_fd, "host failed to open the crypto device");
            return Err(Error::HostRejected);
        }
        tracing::debug!(minor, host_fd, "opened crypto device");
        Ok(Self {
            device,
            host_fd,
            closed: false,
        })
    }

    /// The host-side handle backing this file.
    pub fn host_fd(&self) -> i64 {
        self.host_fd
    }

    /// Closes the file, notifying the host.
    ///
    /// The context is released whatever the host-side outcome; an error only
    /// reports that the notification may not have landed.
    pub fn close(mut self) -> Result<(), Error> {
        self.send_close()
    }

    fn send_close(&mut self) -> Result<(), Error> {
        self.closed = true;
        let fd = std::mem::replace(&mut self.host_fd, NO_HOST_FD);
        // No payload comes back; the returned set is the acknowledgment.
        self.device.transact(Request::Close { fd }.encode())?;
        tracing::debug!(minor = self.device.minor(), fd, "closed crypto device");
        Ok(())
    }

    /// Creates a cipher session over `key` and returns the host-assigned
    /// session id.
    ///
    /// A zero-length key is valid and is still transferred to the host.
    pub fn get_session(&self, cipher: u32, key: &[u8]) -> Result<u32, Error> {
        let set = self.ioctl(IoctlRequest::GetSession {
            cipher,
            mac: 0,
            key,
        })?;
        self.trace_diag(&set);
        let resp = protocol::read_get_session_response(&set).map_err(Error::Protocol)?;
        if resp.status != 0 {
            return Err(Error::DeviceFailure {
                status: resp.status,
            });
        }
        tracing::debug!(ses = resp.ses, keylen = key.len(), "session created");
        Ok(resp.ses)
    }

    /// Tears down the session `ses`.
    pub fn free_session(&self, ses: u32) -> Result<(), Error> {
        let set = self.ioctl(IoctlRequest::FreeSession { ses })?;
        self.trace_diag(&set);
        let status = protocol::read_free_session_response(&set).map_err(Error::Protocol)?;
        if status != 0 {
            return Err(Error::DeviceFailure { status });
        }
        tracing::debug!(ses, "session freed");
        Ok(())
    }

    /// Runs one encrypt/decrypt operation, copying the produced bytes into
    /// `dst` on success.
    ///
    /// `src` and `dst` must be the same length; only that many bytes of the
    /// destination are defined afterwards.
    pub fn crypt(
        &self,
        ses: u32,
        direction: Direction,
        iv: &[u8; IV_SIZE],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(), Error> {
        if src.len() != dst.len() {
            return Err(Error::UnequalBufferLengths {
                src: src.len(),
                dst: dst.len(),
            });
        }
        let set = self.ioctl(IoctlRequest::Crypt {
            ses,
            direction,
            src,
            iv,
        })?;
        self.trace_diag(&set);
        let status = protocol::read_crypt_status(&set).map_err(Error::Protocol)?;
        if status != 0 {
            return Err(Error::DeviceFailure { status });
        }
        dst.copy_from_slice(protocol::crypt_dst(&set).map_err(Error::Protocol)?);
        Ok(())
    }

    /// Forwards an unrecognized ioctl code.
    ///
    /// Only the common header travels; the host makes no device call and
    /// returns immediately, so this always succeeds once the transport
    /// round-trip completes.
    pub fn ioctl_raw(&self, code: u32) -> Result<(), Error> {
        tracing::debug!(code, "forwarding unsupported ioctl command");
        self.ioctl(IoctlRequest::Other { code })?;
        Ok(())
    }

    fn ioctl(&self, op: IoctlRequest<'_>) -> Result<DescriptorSet, Error> {
        let request = Request::Ioctl {
            fd: self.host_fd,
            op,
        };
        self.device.transact(request.encode())
    }

    fn trace_diag(&self, set: &DescriptorSet) {
        if let Some(reply) = protocol::read_diag_reply(set) {
            tracing::trace!(answer = %protocol::diag_text(reply), "host answered");
        }
    }
}

impl Drop for CryptoFile {
    fn drop(&mut self) {
        if !self.closed {
            // Best effort; release-path failures must not block cleanup.
            if let Err(err) = self.send_close() {
                tracing::debug!(
                    minor = self.device.minor(),
                    error = &err as &dyn std::error::Error,
                    "close request failed"
                );
            }
        }
    }
}
