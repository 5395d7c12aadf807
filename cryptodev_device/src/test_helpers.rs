// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers for pairing the device with a driver in-process.

use crate::DeviceWorker;
use crate::EmulatedBackend;
use cryptodev_ring::HostHandle;

/// A worker-hosted emulated device, with a backend handle kept out for
/// assertions.
pub struct TestDeviceWorker {
    worker: DeviceWorker,
    backend: EmulatedBackend,
}

impl TestDeviceWorker {
    /// Starts a dispatcher thread over a fresh emulated backend.
    pub fn start(queue: HostHandle) -> Self {
        let backend = EmulatedBackend::new();
        let worker =
            DeviceWorker::spawn(queue, backend.clone()).expect("failed to spawn device worker");
        Self { worker, backend }
    }

    /// The shared backend state, for leak assertions.
    pub fn backend(&self) -> &EmulatedBackend {
        &self.backend
    }

    /// Waits for the worker to exit. Drop all guest handles first.
    pub fn teardown(self) {
        self.worker.teardown();
    }
}
