// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire protocol between the guest crypto driver and the host device.
//!
//! Every call travels as one descriptor set whose region order is fixed per
//! (syscall, command) pair; both sides address regions by position, so the
//! tables below are the protocol. The schema is versioned: the leading
//! request header carries [`PROTOCOL_VERSION`] and decoding fails loudly on
//! a mismatch instead of silently misreading regions.
//!
//! Readable regions (guest→host), per operation:
//!
//! | Operation | Regions |
//! |---|---|
//! | OPEN | header |
//! | CLOSE | header, host_fd |
//! | IOCTL/CIOCGSESSION | header, host_fd, command, diag_out, session_params, key_bytes |
//! | IOCTL/CIOCFSESSION | header, host_fd, command, diag_out, session_id |
//! | IOCTL/CIOCCRYPT | header, host_fd, command, diag_out, crypt_header, src_bytes, iv |
//! | IOCTL/other | header, host_fd, command |
//!
//! Writable regions (host→guest), per operation:
//!
//! | Operation | Regions |
//! |---|---|
//! | OPEN | host_fd |
//! | CLOSE | — |
//! | IOCTL/CIOCGSESSION | diag_in, session_reply, status |
//! | IOCTL/CIOCFSESSION | diag_in, status |
//! | IOCTL/CIOCCRYPT | diag_in, dst_bytes, status |
//! | IOCTL/other | — |
//!
//! Real-device outcomes ride in the trailing status region (or, for OPEN,
//! as a negative handle); they are never transport errors.

#![forbid(unsafe_code)]

use cryptodev_ring::DescriptorSet;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use packed_nums::*;

#[expect(non_camel_case_types)]
mod packed_nums {
    /// Little-endian u16.
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    /// Little-endian u32.
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    /// Little-endian i32.
    pub type i32_le = zerocopy::I32<zerocopy::LittleEndian>;
    /// Little-endian i64.
    pub type i64_le = zerocopy::I64<zerocopy::LittleEndian>;
}

/// Version of the region schema described in the crate docs.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of a crypt initialization vector, in bytes.
pub const IV_SIZE: usize = 16;

/// Size of the bounded diagnostic message regions. The content is free text
/// for tracing only and is not load-bearing.
pub const DIAG_MSG_SIZE: usize = 100;

/// Wire value of an unopened or rejected host handle.
pub const NO_HOST_FD: i64 = -1;

/// Syscall selector carried in the request header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct SyscallKind(pub u32);

impl SyscallKind {
    /// Open a handle to the host crypto device.
    pub const OPEN: Self = Self(0);
    /// Close a previously opened handle.
    pub const CLOSE: Self = Self(1);
    /// Issue an ioctl against an open handle.
    pub const IOCTL: Self = Self(2);
}

// The guest-visible ioctl request codes, carried on the wire unchanged so
// unrecognized codes can round-trip. Encoded _IOC-style from the host ABI
// argument sizes pinned below.
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | (nr as u32)
}

/// Host ABI size of the real device's `session_op` argument struct.
pub const SESSION_OP_ABI_SIZE: usize = 48;
/// Host ABI size of the real device's `crypt_op` argument struct.
pub const CRYPT_OP_ABI_SIZE: usize = 40;

/// Create a cipher session.
pub const CIOCGSESSION: u32 = ioc(IOC_READ | IOC_WRITE, b'c', 102, SESSION_OP_ABI_SIZE);
/// Tear down a cipher session.
pub const CIOCFSESSION: u32 = ioc(IOC_WRITE, b'c', 103, size_of::<u32>());
/// Run an encrypt/decrypt operation on a session.
pub const CIOCCRYPT: u32 = ioc(IOC_READ | IOC_WRITE, b'c', 104, CRYPT_OP_ABI_SIZE);

/// Cipher algorithm id for AES in CBC mode (the cryptodev namespace).
pub const CRYPTO_AES_CBC: u32 = 11;
/// Cipher algorithm id for AES in CTR mode.
pub const CRYPTO_AES_CTR: u32 = 21;

const COP_ENCRYPT: u16 = 0;
const COP_DECRYPT: u16 = 1;

/// Transform direction of a crypt operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext in, ciphertext out.
    Encrypt,
    /// Ciphertext in, plaintext out.
    Decrypt,
}

impl Direction {
    /// The wire encoding of this direction.
    pub fn to_wire(self) -> u16 {
        match self {
            Direction::Encrypt => COP_ENCRYPT,
            Direction::Decrypt => COP_DECRYPT,
        }
    }

    /// Decodes a wire direction value.
    pub fn from_wire(op: u16) -> Option<Self> {
        match op {
            COP_ENCRYPT => Some(Direction::Encrypt),
            COP_DECRYPT => Some(Direction::Decrypt),
            _ => None,
        }
    }
}

/// An ioctl command, decoded from its wire code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlCommand {
    /// `CIOCGSESSION`.
    GetSession,
    /// `CIOCFSESSION`.
    FreeSession,
    /// `CIOCCRYPT`.
    Crypt,
    /// Anything else: forwarded as an opaque code and ignored by the host.
    Other(u32),
}

impl IoctlCommand {
    /// Maps a wire code to a command.
    pub fn from_code(code: u32) -> Self {
        match code {
            CIOCGSESSION => IoctlCommand::GetSession,
            CIOCFSESSION => IoctlCommand::FreeSession,
            CIOCCRYPT => IoctlCommand::Crypt,
            other => IoctlCommand::Other(other),
        }
    }

    /// The wire code of this command.
    pub fn code(&self) -> u32 {
        match *self {
            IoctlCommand::GetSession => CIOCGSESSION,
            IoctlCommand::FreeSession => CIOCFSESSION,
            IoctlCommand::Crypt => CIOCCRYPT,
            IoctlCommand::Other(code) => code,
        }
    }
}

/// Leading record of every request.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct RequestHeader {
    /// Schema version, [`PROTOCOL_VERSION`].
    pub version: u32_le,
    /// [`SyscallKind`] wire value.
    pub syscall: u32_le,
}

/// Host handle record, readable for CLOSE/IOCTL and writable for OPEN.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct HostFdRecord {
    /// The host-side handle; negative means failure/unopened.
    pub fd: i64_le,
}

/// Ioctl command record.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct CommandRecord {
    /// Guest-visible ioctl request code.
    pub code: u32_le,
}

/// Session creation parameters (the readable half of the original
/// `session_op`; pointers travel as dedicated regions instead).
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct SessionParamsRecord {
    /// Cipher algorithm id.
    pub cipher: u32_le,
    /// MAC algorithm id; zero when unused.
    pub mac: u32_le,
    /// Declared length of the key region. Must match the transferred bytes.
    pub keylen: u32_le,
    /// Declared MAC key length; zero when unused.
    pub mackeylen: u32_le,
}

/// Host-assigned session identifier, written back on CIOCGSESSION.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct SessionReplyRecord {
    /// The new session id; meaningful only when the status region is zero.
    pub ses: u32_le,
}

/// Session identifier transmitted on CIOCFSESSION.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct SessionIdRecord {
    /// The session to tear down.
    pub ses: u32_le,
}

/// Crypt operation parameters (the scalar half of the original `crypt_op`).
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct CryptHeaderRecord {
    /// Session to operate under.
    pub ses: u32_le,
    /// Wire direction, see [`Direction`].
    pub op: u16_le,
    /// Reserved; zero.
    pub flags: u16_le,
    /// Declared payload length. Source and destination both carry exactly
    /// this many bytes.
    pub len: u32_le,
}

/// In-band result of a real-device call.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C)]
pub struct StatusRecord {
    /// Zero on success, a negative errno-style value on failure.
    pub code: i32_le,
}

/// Positional region indexes fixed by the schema.
pub mod regions {
    /// Request header, first readable region of every operation.
    pub const R_HEADER: usize = 0;
    /// Host handle, second readable region of CLOSE and IOCTL.
    pub const R_HOST_FD: usize = 1;
    /// Command code, third readable region of IOCTL.
    pub const R_COMMAND: usize = 2;
    /// Outbound diagnostic message of known ioctl commands.
    pub const R_DIAG: usize = 3;
    /// First command-specific readable region.
    pub const R_PAYLOAD: usize = 4;

    /// OPEN: returned host handle.
    pub const W_OPEN_FD: usize = 0;
    /// Known ioctls: inbound diagnostic message.
    pub const W_DIAG: usize = 0;
    /// CIOCGSESSION: session reply record.
    pub const W_SESSION_REPLY: usize = 1;
    /// CIOCGSESSION: status record.
    pub const W_SESSION_STATUS: usize = 2;
    /// CIOCFSESSION: status record.
    pub const W_FREE_STATUS: usize = 1;
    /// CIOCCRYPT: destination bytes.
    pub const W_CRYPT_DST: usize = 1;
    /// CIOCCRYPT: status record.
    pub const W_CRYPT_STATUS: usize = 2;
}

/// Failures decoding or addressing a descriptor set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A region required by the schema is absent.
    #[error("missing {direction} region {index}")]
    MissingRegion {
        /// "readable" or "writable".
        direction: &'static str,
        /// Positional index of the absent region.
        index: usize,
    },
    /// A region's length does not match its record.
    #[error("{direction} region {index} holds {found} bytes, expected {expected}")]
    BadRegionSize {
        /// "readable" or "writable".
        direction: &'static str,
        /// Positional index of the region.
        index: usize,
        /// Actual region length.
        found: usize,
        /// Length required by the schema.
        expected: usize,
    },
    /// The request header carries an unknown schema version.
    #[error("protocol version {found}, expected {expected}")]
    VersionMismatch {
        /// Version found in the header.
        found: u32,
        /// Version this implementation speaks.
        expected: u32,
    },
    /// The declared key length disagrees with the key region.
    #[error("declared key length {declared} but {actual} key bytes transferred")]
    KeyLengthMismatch {
        /// Length from the session params record.
        declared: u32,
        /// Bytes in the key region.
        actual: usize,
    },
    /// The declared crypt length disagrees with the source region.
    #[error("declared crypt length {declared} but {actual} source bytes transferred")]
    CryptLengthMismatch {
        /// Length from the crypt header record.
        declared: u32,
        /// Bytes in the source region.
        actual: usize,
    },
    /// The initialization vector region has the wrong size.
    #[error("initialization vector holds {0} bytes, expected {IV_SIZE}")]
    BadIvLength(usize),
}

fn region<'a>(
    regions: &'a [Vec<u8>],
    direction: &'static str,
    index: usize,
) -> Result<&'a [u8], ProtocolError> {
    regions
        .get(index)
        .map(|r| r.as_slice())
        .ok_or(ProtocolError::MissingRegion { direction, index })
}

fn record<T: FromBytes>(
    regions: &[Vec<u8>],
    direction: &'static str,
    index: usize,
) -> Result<T, ProtocolError> {
    let bytes = region(regions, direction, index)?;
    T::read_from_bytes(bytes).map_err(|_| ProtocolError::BadRegionSize {
        direction,
        index,
        found: bytes.len(),
        expected: size_of::<T>(),
    })
}

fn write_record<T: IntoBytes + Immutable>(
    regions: &mut [Vec<u8>],
    index: usize,
    value: &T,
) -> Result<(), ProtocolError> {
    let region = regions.get_mut(index).ok_or(ProtocolError::MissingRegion {
        direction: "writable",
        index,
    })?;
    let bytes = value.as_bytes();
    if region.len() != bytes.len() {
        return Err(ProtocolError::BadRegionSize {
            direction: "writable",
            index,
            found: region.len(),
            expected: bytes.len(),
        });
    }
    region.copy_from_slice(bytes);
    Ok(())
}

fn diag_region(text: &str) -> Vec<u8> {
    let mut buf = vec![0; DIAG_MSG_SIZE];
    let n = text.len().min(DIAG_MSG_SIZE - 1);
    buf[..n].copy_from_slice(&text.as_bytes()[..n]);
    buf
}

/// Renders a diagnostic region as text, stopping at the first NUL.
pub fn diag_text(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

/// A request as issued by the guest driver.
#[derive(Debug)]
pub enum Request<'a> {
    /// Open a host handle.
    Open,
    /// Close the host handle.
    Close {
        /// Handle to close.
        fd: i64,
    },
    /// Issue an ioctl against the host handle.
    Ioctl {
        /// Handle to operate on.
        fd: i64,
        /// The command-specific payload.
        op: IoctlRequest<'a>,
    },
}

/// Command-specific ioctl payloads, borrowing the caller's buffers.
#[derive(Debug)]
pub enum IoctlRequest<'a> {
    /// CIOCGSESSION: create a session over `key`.
    GetSession {
        /// Cipher algorithm id.
        cipher: u32,
        /// MAC algorithm id, zero when unused.
        mac: u32,
        /// Key material; empty keys are valid and still transferred.
        key: &'a [u8],
    },
    /// CIOCFSESSION: tear down `ses`.
    FreeSession {
        /// Session to tear down.
        ses: u32,
    },
    /// CIOCCRYPT: transform `src` under `ses`.
    Crypt {
        /// Session to operate under.
        ses: u32,
        /// Transform direction.
        direction: Direction,
        /// Input payload; the destination region is sized to match.
        src: &'a [u8],
        /// Initialization vector.
        iv: &'a [u8; IV_SIZE],
    },
    /// Unrecognized command: only the common header regions travel, and the
    /// host treats the request as a no-op.
    Other {
        /// The opaque command code.
        code: u32,
    },
}

impl IoctlRequest<'_> {
    fn command(&self) -> IoctlCommand {
        match self {
            IoctlRequest::GetSession { .. } => IoctlCommand::GetSession,
            IoctlRequest::FreeSession { .. } => IoctlCommand::FreeSession,
            IoctlRequest::Crypt { .. } => IoctlCommand::Crypt,
            IoctlRequest::Other { code } => IoctlCommand::Other(*code),
        }
    }
}

impl Request<'_> {
    fn syscall(&self) -> SyscallKind {
        match self {
            Request::Open => SyscallKind::OPEN,
            Request::Close { .. } => SyscallKind::CLOSE,
            Request::Ioctl { .. } => SyscallKind::IOCTL,
        }
    }

    /// Encodes this request into a descriptor set laid out per the schema,
    /// with writable regions pre-sized and zeroed.
    pub fn encode(&self) -> DescriptorSet {
        let mut set = DescriptorSet::new();
        let header = RequestHeader {
            version: PROTOCOL_VERSION.into(),
            syscall: self.syscall().0.into(),
        };
        set.push_readable(header.as_bytes().to_vec());
        match self {
            Request::Open => {
                set.push_writable(size_of::<HostFdRecord>());
            }
            Request::Close { fd } => {
                set.push_readable(HostFdRecord { fd: (*fd).into() }.as_bytes().to_vec());
            }
            Request::Ioctl { fd, op } => {
                set.push_readable(HostFdRecord { fd: (*fd).into() }.as_bytes().to_vec());
                let command = CommandRecord {
                    code: op.command().code().into(),
                };
                set.push_readable(command.as_bytes().to_vec());
                encode_ioctl(&mut set, op);
            }
        }
        set
    }
}

fn encode_ioctl(set: &mut DescriptorSet, op: &IoctlRequest<'_>) {
    match op {
        IoctlRequest::GetSession { cipher, mac, key } => {
            set.push_readable(diag_region("Hello HOST from ioctl CIOCGSESSION."));
            let params = SessionParamsRecord {
                cipher: (*cipher).into(),
                mac: (*mac).into(),
                keylen: (key.len() as u32).into(),
                mackeylen: 0.into(),
            };
            set.push_readable(params.as_bytes().to_vec());
            set.push_readable(key.to_vec());
            set.push_writable(DIAG_MSG_SIZE);
            set.push_writable(size_of::<SessionReplyRecord>());
            set.push_writable(size_of::<StatusRecord>());
        }
        IoctlRequest::FreeSession { ses } => {
            set.push_readable(diag_region("Hello HOST from ioctl CIOCFSESSION."));
            set.push_readable(SessionIdRecord { ses: (*ses).into() }.as_bytes().to_vec());
            set.push_writable(DIAG_MSG_SIZE);
            set.push_writable(size_of::<StatusRecord>());
        }
        IoctlRequest::Crypt {
            ses,
            direction,
            src,
            iv,
        } => {
            set.push_readable(diag_region("Hello HOST from ioctl CIOCCRYPT."));
            let header = CryptHeaderRecord {
                ses: (*ses).into(),
                op: direction.to_wire().into(),
                flags: 0.into(),
                len: (src.len() as u32).into(),
            };
            set.push_readable(header.as_bytes().to_vec());
            set.push_readable(src.to_vec());
            set.push_readable(iv.to_vec());
            set.push_writable(DIAG_MSG_SIZE);
            set.push_writable(src.len());
            set.push_writable(size_of::<StatusRecord>());
        }
        IoctlRequest::Other { .. } => {}
    }
}

/// A request as decoded by the host dispatcher, borrowing the readable
/// regions of the submitted set.
#[derive(Debug)]
pub enum ParsedRequest<'a> {
    /// Open a host handle.
    Open,
    /// Close `fd`.
    Close {
        /// Handle to close.
        fd: i64,
    },
    /// CIOCGSESSION.
    GetSession {
        /// Handle to operate on.
        fd: i64,
        /// Cipher algorithm id.
        cipher: u32,
        /// MAC algorithm id.
        mac: u32,
        /// Key material borrowed from the key region.
        key: &'a [u8],
    },
    /// CIOCFSESSION.
    FreeSession {
        /// Handle to operate on.
        fd: i64,
        /// Session to tear down.
        ses: u32,
    },
    /// CIOCCRYPT.
    Crypt {
        /// Handle to operate on.
        fd: i64,
        /// Session to operate under.
        ses: u32,
        /// Raw wire direction; the dispatcher validates it.
        op: u16,
        /// Source bytes borrowed from the source region.
        src: &'a [u8],
        /// Initialization vector borrowed from the IV region.
        iv: &'a [u8; IV_SIZE],
    },
    /// A command this protocol does not know. Per the pass-through-but-no-op
    /// policy the host makes no device call and returns the set unchanged.
    OtherIoctl {
        /// Handle the command was aimed at.
        fd: i64,
        /// The opaque command code.
        code: u32,
    },
    /// A syscall selector this protocol does not know; ignored.
    UnknownSyscall {
        /// The unrecognized selector value.
        syscall: u32,
    },
}

impl<'a> ParsedRequest<'a> {
    /// Decodes the readable half of a submitted descriptor set.
    pub fn parse(readable: &'a [Vec<u8>]) -> Result<Self, ProtocolError> {
        let header: RequestHeader = record(readable, "readable", regions::R_HEADER)?;
        if header.version.get() != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                found: header.version.get(),
                expected: PROTOCOL_VERSION,
            });
        }
        match SyscallKind(header.syscall.get()) {
            SyscallKind::OPEN => Ok(ParsedRequest::Open),
            SyscallKind::CLOSE => {
                let fd: HostFdRecord = record(readable, "readable", regions::R_HOST_FD)?;
                Ok(ParsedRequest::Close { fd: fd.fd.get() })
            }
            SyscallKind::IOCTL => parse_ioctl(readable),
            SyscallKind(other) => Ok(ParsedRequest::UnknownSyscall { syscall: other }),
        }
    }
}

fn parse_ioctl(readable: &[Vec<u8>]) -> Result<ParsedRequest<'_>, ProtocolError> {
    let fd = record::<HostFdRecord>(readable, "readable", regions::R_HOST_FD)?
        .fd
        .get();
    let code = record::<CommandRecord>(readable, "readable", regions::R_COMMAND)?
        .code
        .get();
    match IoctlCommand::from_code(code) {
        IoctlCommand::GetSession => {
            let params: SessionParamsRecord = record(readable, "readable", regions::R_PAYLOAD)?;
            let key = region(readable, "readable", regions::R_PAYLOAD + 1)?;
            if params.keylen.get() as usize != key.len() {
                return Err(ProtocolError::KeyLengthMismatch {
                    declared: params.keylen.get(),
                    actual: key.len(),
                });
            }
            Ok(ParsedRequest::GetSession {
                fd,
                cipher: params.cipher.get(),
                mac: params.mac.get(),
                key,
            })
        }
        IoctlCommand::FreeSession => {
            let ses: SessionIdRecord = record(readable, "readable", regions::R_PAYLOAD)?;
            Ok(ParsedRequest::FreeSession {
                fd,
                ses: ses.ses.get(),
            })
        }
        IoctlCommand::Crypt => {
            let header: CryptHeaderRecord = record(readable, "readable", regions::R_PAYLOAD)?;
            let src = region(readable, "readable", regions::R_PAYLOAD + 1)?;
            if header.len.get() as usize != src.len() {
                return Err(ProtocolError::CryptLengthMismatch {
                    declared: header.len.get(),
                    actual: src.len(),
                });
            }
            let iv = region(readable, "readable", regions::R_PAYLOAD + 2)?;
            let iv: &[u8; IV_SIZE] = iv
                .try_into()
                .map_err(|_| ProtocolError::BadIvLength(iv.len()))?;
            Ok(ParsedRequest::Crypt {
                fd,
                ses: header.ses.get(),
                op: header.op.get(),
                src,
                iv,
            })
        }
        IoctlCommand::Other(code) => Ok(ParsedRequest::OtherIoctl { fd, code }),
    }
}

/// Host side: writes the OPEN result handle.
pub fn write_open_response(writable: &mut [Vec<u8>], fd: i64) -> Result<(), ProtocolError> {
    write_record(writable, regions::W_OPEN_FD, &HostFdRecord { fd: fd.into() })
}

/// Host side: writes the CIOCGSESSION reply and status.
pub fn write_get_session_response(
    writable: &mut [Vec<u8>],
    ses: u32,
    status: i32,
) -> Result<(), ProtocolError> {
    write_record(
        writable,
        regions::W_SESSION_REPLY,
        &SessionReplyRecord { ses: ses.into() },
    )?;
    write_record(
        writable,
        regions::W_SESSION_STATUS,
        &StatusRecord {
            code: status.into(),
        },
    )
}

/// Host side: writes the CIOCFSESSION status.
pub fn write_free_session_response(
    writable: &mut [Vec<u8>],
    status: i32,
) -> Result<(), ProtocolError> {
    write_record(
        writable,
        regions::W_FREE_STATUS,
        &StatusRecord {
            code: status.into(),
        },
    )
}

/// Host side: borrows the CIOCCRYPT destination region for the device to
/// fill directly.
pub fn crypt_dst_mut(writable: &mut [Vec<u8>]) -> Result<&mut [u8], ProtocolError> {
    writable
        .get_mut(regions::W_CRYPT_DST)
        .map(|r| r.as_mut_slice())
        .ok_or(ProtocolError::MissingRegion {
            direction: "writable",
            index: regions::W_CRYPT_DST,
        })
}

/// Host side: writes the CIOCCRYPT status.
pub fn write_crypt_status(writable: &mut [Vec<u8>], status: i32) -> Result<(), ProtocolError> {
    write_record(
        writable,
        regions::W_CRYPT_STATUS,
        &StatusRecord {
            code: status.into(),
        },
    )
}

/// Guest side: reads the OPEN result handle from a completed set.
pub fn read_open_response(set: &DescriptorSet) -> Result<i64, ProtocolError> {
    let fd: HostFdRecord = record(set.writable_regions(), "writable", regions::W_OPEN_FD)?;
    Ok(fd.fd.get())
}

/// Decoded CIOCGSESSION completion.
#[derive(Debug, Copy, Clone)]
pub struct SessionResponse {
    /// Host-assigned session id; meaningful only when `status` is zero.
    pub ses: u32,
    /// In-band device status.
    pub status: i32,
}

/// Guest side: reads the CIOCGSESSION completion.
pub fn read_get_session_response(set: &DescriptorSet) -> Result<SessionResponse, ProtocolError> {
    let writable = set.writable_regions();
    let reply: SessionReplyRecord = record(writable, "writable", regions::W_SESSION_REPLY)?;
    let status: StatusRecord = record(writable, "writable", regions::W_SESSION_STATUS)?;
    Ok(SessionResponse {
        ses: reply.ses.get(),
        status: status.code.get(),
    })
}

/// Guest side: reads the CIOCFSESSION status.
pub fn read_free_session_response(set: &DescriptorSet) -> Result<i32, ProtocolError> {
    let status: StatusRecord = record(set.writable_regions(), "writable", regions::W_FREE_STATUS)?;
    Ok(status.code.get())
}

/// Guest side: reads the CIOCCRYPT status.
pub fn read_crypt_status(set: &DescriptorSet) -> Result<i32, ProtocolError> {
    let status: StatusRecord = record(set.writable_regions(), "writable", regions::W_CRYPT_STATUS)?;
    Ok(status.code.get())
}

/// Guest side: borrows the CIOCCRYPT destination bytes from a completed set.
pub fn crypt_dst(set: &DescriptorSet) -> Result<&[u8], ProtocolError> {
    region(set.writable_regions(), "writable", regions::W_CRYPT_DST)
}

/// Guest side: borrows the inbound diagnostic message, if the operation
/// carried one.
pub fn read_diag_reply(set: &DescriptorSet) -> Option<&[u8]> {
    set.writable_regions()
        .get(regions::W_DIAG)
        .map(|r| r.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_layout() {
        let set = Request::Open.encode();
        assert_eq!(set.readable_regions().len(), 1);
        assert_eq!(set.writable_regions().len(), 1);
        assert_eq!(set.writable_regions()[0].len(), size_of::<HostFdRecord>());
        assert!(matches!(
            ParsedRequest::parse(set.readable_regions()).unwrap(),
            ParsedRequest::Open
        ));
    }

    #[test]
    fn close_carries_fd() {
        let set = Request::Close { fd: 5 }.encode();
        assert!(set.writable_regions().is_empty());
        let parsed = ParsedRequest::parse(set.readable_regions()).unwrap();
        assert!(matches!(parsed, ParsedRequest::Close { fd: 5 }));
    }

    #[test]
    fn get_session_layout_and_parse() {
        let key = b"0123456789abcdef";
        let req = Request::Ioctl {
            fd: 3,
            op: IoctlRequest::GetSession {
                cipher: CRYPTO_AES_CBC,
                mac: 0,
                key,
            },
        };
        let set = req.encode();
        // header, fd, command, diag, params, key
        assert_eq!(set.readable_regions().len(), 6);
        // diag, reply, status
        assert_eq!(set.writable_regions().len(), 3);
        match ParsedRequest::parse(set.readable_regions()).unwrap() {
            ParsedRequest::GetSession {
                fd,
                cipher,
                mac,
                key: parsed_key,
            } => {
                assert_eq!(fd, 3);
                assert_eq!(cipher, CRYPTO_AES_CBC);
                assert_eq!(mac, 0);
                assert_eq!(parsed_key, key);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn empty_key_still_travels() {
        let set = Request::Ioctl {
            fd: 0,
            op: IoctlRequest::GetSession {
                cipher: CRYPTO_AES_CBC,
                mac: 0,
                key: &[],
            },
        }
        .encode();
        // The key region is present even when empty.
        assert_eq!(set.readable_regions().len(), 6);
        assert!(set.readable_regions()[regions::R_PAYLOAD + 1].is_empty());
        match ParsedRequest::parse(set.readable_regions()).unwrap() {
            ParsedRequest::GetSession { key, .. } => assert!(key.is_empty()),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn key_length_mismatch_is_rejected() {
        let mut set = Request::Ioctl {
            fd: 0,
            op: IoctlRequest::GetSession {
                cipher: CRYPTO_AES_CBC,
                mac: 0,
                key: b"abcd",
            },
        }
        .encode();
        // Corrupt the declared key length.
        let mut tampered = DescriptorSet::new();
        for (i, r) in set.readable_regions().iter().enumerate() {
            if i == regions::R_PAYLOAD {
                let mut params = SessionParamsRecord::read_from_bytes(r).unwrap();
                params.keylen = 16.into();
                tampered.push_readable(params.as_bytes().to_vec());
            } else {
                tampered.push_readable(r.clone());
            }
        }
        set = tampered;
        assert_eq!(
            ParsedRequest::parse(set.readable_regions()).unwrap_err(),
            ProtocolError::KeyLengthMismatch {
                declared: 16,
                actual: 4
            }
        );
    }

    #[test]
    fn crypt_layout_and_parse() {
        let iv = [0u8; IV_SIZE];
        let set = Request::Ioctl {
            fd: 1,
            op: IoctlRequest::Crypt {
                ses: 9,
                direction: Direction::Encrypt,
                src: b"ATTACKATDAWN",
                iv: &iv,
            },
        }
        .encode();
        // header, fd, command, diag, crypt header, src, iv
        assert_eq!(set.readable_regions().len(), 7);
        // diag, dst, status
        assert_eq!(set.writable_regions().len(), 3);
        assert_eq!(set.writable_regions()[regions::W_CRYPT_DST].len(), 12);
        match ParsedRequest::parse(set.readable_regions()).unwrap() {
            ParsedRequest::Crypt {
                fd, ses, op, src, ..
            } => {
                assert_eq!(fd, 1);
                assert_eq!(ses, 9);
                assert_eq!(Direction::from_wire(op), Some(Direction::Encrypt));
                assert_eq!(src, b"ATTACKATDAWN");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_has_no_payload() {
        let set = Request::Ioctl {
            fd: 2,
            op: IoctlRequest::Other { code: 0xdead_beef },
        }
        .encode();
        assert_eq!(set.readable_regions().len(), 3);
        assert!(set.writable_regions().is_empty());
        let parsed = ParsedRequest::parse(set.readable_regions()).unwrap();
        assert!(matches!(
            parsed,
            ParsedRequest::OtherIoctl {
                fd: 2,
                code: 0xdead_beef
            }
        ));
    }

    #[test]
    fn unknown_syscall_is_tolerated() {
        let mut set = DescriptorSet::new();
        let header = RequestHeader {
            version: PROTOCOL_VERSION.into(),
            syscall: 77.into(),
        };
        set.push_readable(header.as_bytes().to_vec());
        let parsed = ParsedRequest::parse(set.readable_regions()).unwrap();
        assert!(matches!(
            parsed,
            ParsedRequest::UnknownSyscall { syscall: 77 }
        ));
    }

    #[test]
    fn version_drift_fails_decode() {
        let mut set = DescriptorSet::new();
        let header = RequestHeader {
            version: (PROTOCOL_VERSION + 1).into(),
            syscall: SyscallKind::OPEN.0.into(),
        };
        set.push_readable(header.as_bytes().to_vec());
        assert_eq!(
            ParsedRequest::parse(set.readable_regions()).unwrap_err(),
            ProtocolError::VersionMismatch {
                found: PROTOCOL_VERSION + 1,
                expected: PROTOCOL_VERSION
            }
        );
    }

    #[test]
    fn truncated_set_fails_decode() {
        let mut set = DescriptorSet::new();
        set.push_readable(vec![1]);
        assert!(matches!(
            ParsedRequest::parse(set.readable_regions()),
            Err(ProtocolError::BadRegionSize { .. })
        ));
    }

    #[test]
    fn session_response_round_trip() {
        let mut set = Request::Ioctl {
            fd: 0,
            op: IoctlRequest::GetSession {
                cipher: CRYPTO_AES_CBC,
                mac: 0,
                key: b"k",
            },
        }
        .encode();
        let (_, writable) = set.split_mut();
        write_get_session_response(writable, 42, 0).unwrap();
        let resp = read_get_session_response(&set).unwrap();
        assert_eq!(resp.ses, 42);
        assert_eq!(resp.status, 0);
    }

    #[test]
    fn ioctl_codes_are_distinct_iowr_values() {
        // The codes live in the _IOC space so arbitrary guest codes cannot
        // collide with small integers.
        for code in [CIOCGSESSION, CIOCFSESSION, CIOCCRYPT] {
            assert!(code > 0x4000_0000);
        }
        assert_eq!(IoctlCommand::from_code(CIOCCRYPT), IoctlCommand::Crypt);
        assert_eq!(IoctlCommand::from_code(1234), IoctlCommand::Other(1234));
    }
}
