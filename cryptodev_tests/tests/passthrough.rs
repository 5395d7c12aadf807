// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tests of the guest crypto driver against the worker-hosted device.

use cryptodev_device::test_helpers::TestDeviceWorker;
use cryptodev_driver::CryptoDevice;
use cryptodev_driver::CryptoFile;
use cryptodev_driver::DeviceRegistry;
use cryptodev_driver::Error;
use cryptodev_protocol::CRYPTO_AES_CBC;
use cryptodev_protocol::Direction;
use cryptodev_protocol::IV_SIZE;
use cryptodev_ring::connected_queue_pair;
use std::sync::Arc;

const QUEUE_CAPACITY: usize = 128;

struct TestRig {
    registry: DeviceRegistry,
    device: TestDeviceWorker,
}

impl TestRig {
    /// One emulated device behind minor 0, served by a worker thread.
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();

        let (guest, host) = connected_queue_pair(QUEUE_CAPACITY);
        let device = TestDeviceWorker::start(host);
        let registry = DeviceRegistry::new();
        registry
            .register(Arc::new(CryptoDevice::new(0, guest)))
            .unwrap();
        Self { registry, device }
    }

    fn teardown(self) {
        // Unhook the device so its queue endpoint drops, then wait for the
        // worker to notice.
        drop(self.registry);
        self.device.teardown();
    }
}

#[test]
fn open_close_leaves_no_state() {
    let rig = TestRig::new();

    let file = CryptoFile::open(&rig.registry, 0).unwrap();
    assert_eq!(rig.device.backend().open_file_count(), 1);
    file.close().unwrap();
    assert_eq!(rig.device.backend().open_file_count(), 0);
    assert_eq!(rig.registry.len(), 1);

    rig.teardown();
}

#[test]
fn open_bad_minor_fails() {
    let rig = TestRig::new();

    assert!(matches!(
        CryptoFile::open(&rig.registry, 42),
        Err(Error::NoSuchDevice(42))
    ));

    rig.teardown();
}

#[test]
fn drop_closes_the_host_handle() {
    let rig = TestRig::new();

    let file = CryptoFile::open(&rig.registry, 0).unwrap();
    assert_eq!(rig.device.backend().open_file_count(), 1);
    drop(file);
    assert_eq!(rig.device.backend().open_file_count(), 0);

    rig.teardown();
}

#[test]
fn empty_key_session_is_valid() {
    let rig = TestRig::new();

    let file = CryptoFile::open(&rig.registry, 0).unwrap();
    let ses = file.get_session(CRYPTO_AES_CBC, &[]).unwrap();
    assert!(ses >= 1);
    file.free_session(ses).unwrap();
    file.close().unwrap();

    rig.teardown();
}

#[test]
fn crypt_round_trip_scenario() {
    let rig = TestRig::new();

    let file = CryptoFile::open(&rig.registry, 0).unwrap();
    let ses = file.get_session(CRYPTO_AES_CBC, b"0123456789abcdef").unwrap();

    let iv = [0u8; IV_SIZE];
    let plaintext = b"ATTACKATDAWN";
    let mut ciphertext = vec![0; plaintext.len()];
    file.crypt(ses, Direction::Encrypt, &iv, plaintext, &mut ciphertext)
        .unwrap();
    assert_ne!(ciphertext.as_slice(), plaintext);

    let mut decrypted = vec![0; plaintext.len()];
    file.crypt(ses, Direction::Decrypt, &iv, &ciphertext, &mut decrypted)
        .unwrap();
    assert_eq!(decrypted.as_slice(), plaintext);

    file.free_session(ses).unwrap();
    file.close().unwrap();

    rig.teardown();
}

#[test]
fn unknown_ioctl_is_a_no_op() {
    let rig = TestRig::new();

    let file = CryptoFile::open(&rig.registry, 0).unwrap();
    file.ioctl_raw(0xdead_beef).unwrap();
    assert_eq!(rig.device.backend().session_count(file.host_fd()), Some(0));

    // The file still works afterwards.
    let ses = file.get_session(CRYPTO_AES_CBC, b"key material").unwrap();
    let iv = [7u8; IV_SIZE];
    let mut out = [0u8; 5];
    file.crypt(ses, Direction::Encrypt, &iv, b"hello", &mut out)
        .unwrap();
    file.free_session(ses).unwrap();
    file.close().unwrap();

    rig.teardown();
}

#[test]
fn double_free_surfaces_device_status() {
    let rig = TestRig::new();

    let file = CryptoFile::open(&rig.registry, 0).unwrap();
    let ses = file.get_session(CRYPTO_AES_CBC, b"k").unwrap();
    file.free_session(ses).unwrap();
    match file.free_session(ses) {
        Err(Error::DeviceFailure { status }) => assert!(status < 0),
        other => panic!("expected device failure, got {other:?}"),
    }
    file.close().unwrap();

    rig.teardown();
}

#[test]
fn mismatched_buffers_abort_before_submission() {
    let rig = TestRig::new();

    let file = CryptoFile::open(&rig.registry, 0).unwrap();
    let ses = file.get_session(CRYPTO_AES_CBC, b"k").unwrap();
    let iv = [0u8; IV_SIZE];
    let mut dst = [0u8; 3];
    assert!(matches!(
        file.crypt(ses, Direction::Encrypt, &iv, b"four", &mut dst),
        Err(Error::UnequalBufferLengths { src: 4, dst: 3 })
    ));
    file.free_session(ses).unwrap();
    file.close().unwrap();

    rig.teardown();
}

#[test]
fn shared_file_calls_never_interleave() {
    let rig = TestRig::new();

    let file = Arc::new(CryptoFile::open(&rig.registry, 0).unwrap());
    let ses = file.get_session(CRYPTO_AES_CBC, b"0123456789abcdef").unwrap();
    let iv = [0u8; IV_SIZE];

    // Two threads hammer the same session with distinct patterned payloads;
    // each must always read back exactly its own round-tripped bytes.
    let threads: Vec<_> = [0x11u8, 0x22u8]
        .into_iter()
        .map(|pattern| {
            let file = file.clone();
            std::thread::spawn(move || {
                let src = vec![pattern; 64];
                for _ in 0..100 {
                    let mut enc = vec![0; src.len()];
                    file.crypt(ses, Direction::Encrypt, &iv, &src, &mut enc)
                        .unwrap();
                    let mut dec = vec![0; src.len()];
                    file.crypt(ses, Direction::Decrypt, &iv, &enc, &mut dec)
                        .unwrap();
                    assert_eq!(dec, src);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    file.free_session(ses).unwrap();
    drop(file);

    rig.teardown();
}

#[test]
fn full_scenario_end_to_end() {
    let rig = TestRig::new();

    // open minor 0
    let file = CryptoFile::open(&rig.registry, 0).unwrap();

    // GET_SESSION with a 16-byte key
    let ses = file.get_session(CRYPTO_AES_CBC, b"0123456789abcdef").unwrap();
    assert!(ses >= 1);

    // encrypt with a zero IV
    let iv = [0u8; IV_SIZE];
    let mut ciphertext = [0u8; 12];
    file.crypt(ses, Direction::Encrypt, &iv, b"ATTACKATDAWN", &mut ciphertext)
        .unwrap();
    assert_ne!(&ciphertext, b"ATTACKATDAWN");

    // decrypt reproduces the plaintext bit for bit
    let mut plaintext = [0u8; 12];
    file.crypt(ses, Direction::Decrypt, &iv, &ciphertext, &mut plaintext)
        .unwrap();
    assert_eq!(&plaintext, b"ATTACKATDAWN");

    file.free_session(ses).unwrap();
    file.close().unwrap();
    assert_eq!(rig.device.backend().open_file_count(), 0);

    rig.teardown();
}
