// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side device backend for the paravirtualized crypto device.
//!
//! The dispatcher is the single consumer of the descriptor queue: it decodes
//! one submitted set at a time, performs the corresponding call against a
//! [`CryptoBackend`], writes results into the set's writable regions, and
//! returns the set to the guest. A set is returned exactly once per
//! retrieval, whatever went wrong while servicing it: real-device failures
//! travel back as in-band status codes (or a negative handle, for OPEN), and
//! malformed requests are traced and returned unchanged, so the guest never
//! hangs on a dropped request.
//!
//! Two backends are provided: [`EmulatedBackend`], an in-process software
//! device, and [`DevCryptoBackend`], the passthrough to the host's real
//! `/dev/crypto`.

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod devcrypto;
mod emulated;
pub mod test_helpers;

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
pub use devcrypto::DEV_CRYPTO_PATH;
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
pub use devcrypto::DevCryptoBackend;
pub use emulated::EmulatedBackend;

use cryptodev_protocol as protocol;
use cryptodev_protocol::Direction;
use cryptodev_protocol::IV_SIZE;
use cryptodev_protocol::ParsedRequest;
use cryptodev_ring::DescriptorSet;
use cryptodev_ring::HostHandle;
use thiserror::Error;

/// A failure reported by the real crypto device.
///
/// These are always converted to in-band status codes; they never fail the
/// dispatch itself.
#[derive(Debug, Error)]
#[error("crypto device failure (errno {errno})")]
pub struct BackendError {
    errno: i32,
}

impl BackendError {
    /// Creates an error from an errno value.
    pub fn new(errno: i32) -> Self {
        Self { errno }
    }

    /// Creates an error from an I/O error's OS code.
    pub fn from_io(err: &std::io::Error) -> Self {
        Self {
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// The underlying errno value.
    pub fn errno(&self) -> i32 {
        self.errno
    }

    /// The in-band wire status for this failure.
    pub fn status(&self) -> i32 {
        -self.errno
    }
}

/// Arguments for creating a session, borrowing the guest's key region.
#[derive(Debug)]
pub struct SessionArgs<'a> {
    /// Cipher algorithm id.
    pub cipher: u32,
    /// MAC algorithm id; zero when unused.
    pub mac: u32,
    /// Key material. May be empty.
    pub key: &'a [u8],
}

/// Arguments for a crypt operation, borrowing the guest's regions directly.
#[derive(Debug)]
pub struct CryptArgs<'a> {
    /// Session to operate under.
    pub ses: u32,
    /// Transform direction.
    pub direction: Direction,
    /// Source bytes.
    pub src: &'a [u8],
    /// Initialization vector.
    pub iv: &'a [u8; IV_SIZE],
    /// Destination; same length as `src`, filled by the device.
    pub dst: &'a mut [u8],
}

/// The real crypto device as consumed by the dispatcher.
///
/// A handle returned by `open` is exclusively owned by one guest file until
/// `close`. Closing an unknown handle fails at this layer and is swallowed
/// by the dispatcher.
pub trait CryptoBackend: Send {
    /// Opens a device handle.
    fn open(&self) -> Result<i64, BackendError>;
    /// Closes a device handle.
    fn close(&self, fd: i64) -> Result<(), BackendError>;
    /// Creates a cipher session and returns its id.
    fn create_session(&self, fd: i64, args: SessionArgs<'_>) -> Result<u32, BackendError>;
    /// Tears down a session.
    fn free_session(&self, fd: i64, ses: u32) -> Result<(), BackendError>;
    /// Runs one encrypt/decrypt operation.
    fn crypt(&self, fd: i64, args: CryptArgs<'_>) -> Result<(), BackendError>;
}

/// Decodes and services descriptor sets against a backend.
pub struct Dispatcher<B> {
    queue: HostHandle,
    backend: B,
}

impl<B: CryptoBackend> Dispatcher<B> {
    /// Creates a dispatcher over the host end of a connected queue pair.
    pub fn new(queue: HostHandle, backend: B) -> Self {
        Self { queue, backend }
    }

    /// Services the next submitted descriptor set, if one is ready.
    ///
    /// Returns `false` when nothing was pending; this is the non-blocking
    /// poll point, not an error.
    pub fn process_one(&self) -> bool {
        let Some(mut set) = self.queue.try_next() else {
            return false;
        };
        self.handle(&mut set);
        self.queue.complete(set);
        true
    }

    /// Runs until the guest endpoint closes, servicing each request
    /// synchronously before retrieving the next.
    pub fn run(&self) {
        loop {
            match self.queue.wait_next() {
                Ok(mut set) => {
                    self.handle(&mut set);
                    self.queue.complete(set);
                }
                Err(_) => break,
            }
        }
        tracing::debug!("crypto device queue closed; dispatcher exiting");
    }

    fn handle(&self, set: &mut DescriptorSet) {
        let (readable, writable) = set.split_mut();
        let parsed = match ParsedRequest::parse(readable) {
            Ok(parsed) => parsed,
            Err(err) => {
                // The set still goes back to the guest unchanged; dropping
                // it would hang the submitting thread forever.
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to decode request"
                );
                return;
            }
        };
        match parsed {
            ParsedRequest::Open => {
                let fd = match self.backend.open() {
                    Ok(fd) => fd,
                    // Failure is communicated only through the handle value.
                    Err(err) => i64::from(err.status()),
                };
                tracing::debug!(fd, "open");
                if let Err(err) = protocol::write_open_response(writable, fd) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to write open response"
                    );
                }
            }
            ParsedRequest::Close { fd } => {
                tracing::debug!(fd, "close");
                if let Err(err) = self.backend.close(fd) {
                    // Double close or close of an unopened handle fails
                    // silently at the device layer.
                    tracing::debug!(fd, error = &err as &dyn std::error::Error, "close failed");
                }
            }
            ParsedRequest::GetSession {
                fd,
                cipher,
                mac,
                key,
            } => {
                tracing::debug!(fd, cipher, keylen = key.len(), "create session");
                let (ses, status) = match self
                    .backend
                    .create_session(fd, SessionArgs { cipher, mac, key })
                {
                    Ok(ses) => (ses, 0),
                    Err(err) => {
                        tracing::debug!(
                            fd,
                            error = &err as &dyn std::error::Error,
                            "create session failed"
                        );
                        (0, err.status())
                    }
                };
                if let Err(err) = protocol::write_get_session_response(writable, ses, status) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to write session response"
                    );
                }
            }
            ParsedRequest::FreeSession { fd, ses } => {
                tracing::debug!(fd, ses, "free session");
                let status = match self.backend.free_session(fd, ses) {
                    Ok(()) => 0,
                    Err(err) => {
                        tracing::debug!(
                            fd,
                            ses,
                            error = &err as &dyn std::error::Error,
                            "free session failed"
                        );
                        err.status()
                    }
                };
                if let Err(err) = protocol::write_free_session_response(writable, status) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to write free session response"
                    );
                }
            }
            ParsedRequest::Crypt {
                fd,
                ses,
                op,
                src,
                iv,
            } => {
                tracing::debug!(fd, ses, len = src.len(), "crypt");
                let status = self.crypt(fd, ses, op, src, iv, writable);
                if let Err(err) = protocol::write_crypt_status(writable, status) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to write crypt status"
                    );
                }
            }
            ParsedRequest::OtherIoctl { fd, code } => {
                // Pass-through-but-no-op: no device call, set returned
                // unchanged.
                tracing::debug!(fd, code, "unsupported ioctl command");
            }
            ParsedRequest::UnknownSyscall { syscall } => {
                tracing::debug!(syscall, "unknown syscall type");
            }
        }
    }

    fn crypt(
        &self,
        fd: i64,
        ses: u32,
        op: u16,
        src: &[u8],
        iv: &[u8; IV_SIZE],
        writable: &mut [Vec<u8>],
    ) -> i32 {
        let Some(direction) = Direction::from_wire(op) else {
            tracing::debug!(op, "bad crypt direction");
            return -libc::EINVAL;
        };
        let dst = match protocol::crypt_dst_mut(writable) {
            Ok(dst) => dst,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "missing crypt destination region"
                );
                return -libc::EINVAL;
            }
        };
        if dst.len() != src.len() {
            tracing::error!(
                src = src.len(),
                dst = dst.len(),
                "crypt source and destination regions differ in length"
            );
            return -libc::EINVAL;
        }
        match self.backend.crypt(
            fd,
            CryptArgs {
                ses,
                direction,
                src,
                iv,
                dst,
            },
        ) {
            Ok(()) => 0,
            Err(err) => {
                tracing::debug!(
                    fd,
                    ses,
                    error = &err as &dyn std::error::Error,
                    "crypt failed"
                );
                err.status()
            }
        }
    }
}

/// A thread running a [`Dispatcher`] loop.
pub struct DeviceWorker {
    thread: std::thread::JoinHandle<()>,
}

impl DeviceWorker {
    /// Spawns the dispatcher loop on its own thread. The thread exits when
    /// the guest endpoint of the queue closes.
    pub fn spawn<B: CryptoBackend + 'static>(
        queue: HostHandle,
        backend: B,
    ) -> std::io::Result<Self> {
        let thread = std::thread::Builder::new()
            .name("cryptodev".into())
            .spawn(move || Dispatcher::new(queue, backend).run())?;
        Ok(Self { thread })
    }

    /// Waits for the dispatcher loop to exit.
    ///
    /// Drop the guest endpoint first, or this blocks until it goes away.
    pub fn teardown(self) {
        let _ = self.thread.join();
    }
}
