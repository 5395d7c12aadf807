// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process software implementation of the crypto device.
//!
//! Stands in for `/dev/crypto` in tests and on hosts without the real
//! device. The cipher is AES-256-CTR over a SHA-256-normalized session key:
//! CTR handles arbitrary payload lengths, any key length (including empty)
//! produces a usable session, and decrypt is the exact inverse of encrypt.

use crate::BackendError;
use crate::CryptArgs;
use crate::CryptoBackend;
use crate::SessionArgs;
use cryptodev_protocol::Direction;
use openssl::symm::Cipher;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;

/// Software crypto device. Cloning shares the same device state, so tests
/// can keep a handle for assertions while the worker owns another.
#[derive(Clone)]
pub struct EmulatedBackend {
    state: Arc<Mutex<EmulatedState>>,
}

#[derive(Default)]
struct EmulatedState {
    files: Slab<EmulatedFile>,
}

#[derive(Default)]
struct EmulatedFile {
    sessions: Slab<EmulatedSession>,
}

struct EmulatedSession {
    key: Vec<u8>,
}

fn file_index(fd: i64) -> Result<usize, BackendError> {
    usize::try_from(fd).map_err(|_| BackendError::new(libc::EBADF))
}

// Session ids are slab slots offset by one so that id 0 is never valid.
fn session_slot(ses: u32) -> Result<usize, BackendError> {
    (ses as usize)
        .checked_sub(1)
        .ok_or(BackendError::new(libc::ENOENT))
}

impl EmulatedBackend {
    /// Creates an empty device with no open files.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EmulatedState::default())),
        }
    }

    /// Number of handles currently open.
    pub fn open_file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Number of live sessions on a handle, or `None` if it is not open.
    pub fn session_count(&self, fd: i64) -> Option<usize> {
        let index = file_index(fd).ok()?;
        Some(self.state.lock().files.get(index)?.sessions.len())
    }
}

impl CryptoBackend for EmulatedBackend {
    fn open(&self) -> Result<i64, BackendError> {
        let fd = self.state.lock().files.insert(EmulatedFile::default());
        tracing::debug!(fd, "emulated device opened");
        Ok(fd as i64)
    }

    fn close(&self, fd: i64) -> Result<(), BackendError> {
        let index = file_index(fd)?;
        self.state
            .lock()
            .files
            .try_remove(index)
            .map(drop)
            .ok_or(BackendError::new(libc::EBADF))
    }

    fn create_session(&self, fd: i64, args: SessionArgs<'_>) -> Result<u32, BackendError> {
        let index = file_index(fd)?;
        let mut state = self.state.lock();
        let file = state
            .files
            .get_mut(index)
            .ok_or(BackendError::new(libc::EBADF))?;
        let slot = file.sessions.insert(EmulatedSession {
            key: args.key.to_vec(),
        });
        Ok(slot as u32 + 1)
    }

    fn free_session(&self, fd: i64, ses: u32) -> Result<(), BackendError> {
        let index = file_index(fd)?;
        let slot = session_slot(ses)?;
        self.state
            .lock()
            .files
            .get_mut(index)
            .ok_or(BackendError::new(libc::EBADF))?
            .sessions
            .try_remove(slot)
            .map(drop)
            .ok_or(BackendError::new(libc::ENOENT))
    }

    fn crypt(&self, fd: i64, args: CryptArgs<'_>) -> Result<(), BackendError> {
        let key = {
            let index = file_index(fd)?;
            let slot = session_slot(args.ses)?;
            let state = self.state.lock();
            state
                .files
                .get(index)
                .ok_or(BackendError::new(libc::EBADF))?
                .sessions
                .get(slot)
                .ok_or(BackendError::new(libc::ENOENT))?
                .key
                .clone()
        };
        let normalized = openssl::sha::sha256(&key);
        let cipher = Cipher::aes_256_ctr();
        let iv: &[u8] = args.iv;
        let produced = match args.direction {
            Direction::Encrypt => openssl::symm::encrypt(cipher, &normalized, Some(iv), args.src),
            Direction::Decrypt => openssl::symm::decrypt(cipher, &normalized, Some(iv), args.src),
        }
        .map_err(|err| {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "emulated cipher failure"
            );
            BackendError::new(libc::EIO)
        })?;
        args.dst.copy_from_slice(&produced);
        Ok(())
    }
}
