// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Passthrough backend over the host's real `/dev/crypto` device.
//!
//! Guest-submitted regions are never patched into the wire records; each
//! call builds a fresh ioctl argument struct pointing at the borrowed
//! regions for exactly the duration of the call.

// UNSAFETY: unsafe needed to make ioctl calls.
#![expect(unsafe_code)]

use crate::BackendError;
use crate::CryptArgs;
use crate::CryptoBackend;
use crate::SessionArgs;
use cryptodev_protocol::CRYPT_OP_ABI_SIZE;
use cryptodev_protocol::SESSION_OP_ABI_SIZE;
use parking_lot::Mutex;
use slab::Slab;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// Default device node of the host crypto device.
pub const DEV_CRYPTO_PATH: &str = "/dev/crypto";

/// Ioctl type used by the cryptodev interface.
const CRYPTODEV_IOC_TYPE: u8 = b'c';

/// `session_op` as defined by the cryptodev ABI.
#[repr(C)]
struct SessionOp {
    cipher: u32,
    mac: u32,
    keylen: u32,
    key: *const u8,
    mackeylen: u32,
    mackey: *const u8,
    /// Written back by the device.
    ses: u32,
}

/// `crypt_op` as defined by the cryptodev ABI.
#[repr(C)]
struct CryptOp {
    ses: u32,
    op: u16,
    flags: u16,
    len: u32,
    src: *const u8,
    dst: *mut u8,
    iv: *const u8,
}

// The wire command codes are derived from these sizes; a drift here would
// desynchronize the two.
static_assertions::const_assert_eq!(size_of::<SessionOp>(), SESSION_OP_ABI_SIZE);
static_assertions::const_assert_eq!(size_of::<CryptOp>(), CRYPT_OP_ABI_SIZE);

nix::ioctl_readwrite!(
    /// `CIOCGSESSION` ioctl defined by cryptodev.
    ciocgsession,
    CRYPTODEV_IOC_TYPE,
    102,
    SessionOp
);

nix::ioctl_write_ptr!(
    /// `CIOCFSESSION` ioctl defined by cryptodev.
    ciocfsession,
    CRYPTODEV_IOC_TYPE,
    103,
    u32
);

nix::ioctl_readwrite!(
    /// `CIOCCRYPT` ioctl defined by cryptodev.
    cioccrypt,
    CRYPTODEV_IOC_TYPE,
    104,
    CryptOp
);

fn errno_to_backend(err: nix::Error) -> BackendError {
    BackendError::new(err as i32)
}

/// The production passthrough: every guest OPEN opens the device node, and
/// session/crypt calls become the corresponding real ioctls.
pub struct DevCryptoBackend {
    path: PathBuf,
    files: Mutex<Slab<File>>,
}

impl DevCryptoBackend {
    /// Creates a backend over [`DEV_CRYPTO_PATH`].
    pub fn new() -> Self {
        Self::with_path(DEV_CRYPTO_PATH)
    }

    /// Creates a backend over a different device node.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            files: Mutex::new(Slab::new()),
        }
    }

    /// Whether the device node exists on this host.
    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    fn raw_fd(&self, fd: i64) -> Result<RawFd, BackendError> {
        let index = usize::try_from(fd).map_err(|_| BackendError::new(libc::EBADF))?;
        self.files
            .lock()
            .get(index)
            .map(|file| file.as_raw_fd())
            .ok_or(BackendError::new(libc::EBADF))
    }
}

impl CryptoBackend for DevCryptoBackend {
    fn open(&self) -> Result<i64, BackendError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| {
                tracing::debug!(
                    path = %self.path.display(),
                    error = &err as &dyn std::error::Error,
                    "failed to open host crypto device"
                );
                BackendError::from_io(&err)
            })?;
        Ok(self.files.lock().insert(file) as i64)
    }

    fn close(&self, fd: i64) -> Result<(), BackendError> {
        let index = usize::try_from(fd).map_err(|_| BackendError::new(libc::EBADF))?;
        // Dropping the file closes the host descriptor.
        self.files
            .lock()
            .try_remove(index)
            .map(drop)
            .ok_or(BackendError::new(libc::EBADF))
    }

    fn create_session(&self, fd: i64, args: SessionArgs<'_>) -> Result<u32, BackendError> {
        let raw = self.raw_fd(fd)?;
        let mut op = SessionOp {
            cipher: args.cipher,
            mac: args.mac,
            keylen: args.key.len() as u32,
            key: args.key.as_ptr(),
            mackeylen: 0,
            mackey: std::ptr::null(),
            ses: 0,
        };
        // SAFETY: `op` points at buffers that outlive the call.
        unsafe { ciocgsession(raw, &mut op) }.map_err(errno_to_backend)?;
        Ok(op.ses)
    }

    fn free_session(&self, fd: i64, ses: u32) -> Result<(), BackendError> {
        let raw = self.raw_fd(fd)?;
        // SAFETY: the session id is passed by value through a live pointer.
        unsafe { ciocfsession(raw, &ses) }.map_err(errno_to_backend)?;
        Ok(())
    }

    fn crypt(&self, fd: i64, args: CryptArgs<'_>) -> Result<(), BackendError> {
        let raw = self.raw_fd(fd)?;
        let mut op = CryptOp {
            ses: args.ses,
            op: args.direction.to_wire(),
            flags: 0,
            len: args.src.len() as u32,
            src: args.src.as_ptr(),
            dst: args.dst.as_mut_ptr(),
            iv: args.iv.as_ptr(),
        };
        // SAFETY: src/dst/iv borrow guest regions that outlive the call, and
        // dst is sized to `len` by the dispatcher.
        unsafe { cioccrypt(raw, &mut op) }.map_err(errno_to_backend)?;
        Ok(())
    }
}
