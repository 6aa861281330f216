use thiserror::Error;

/// Error taxonomy per the core's error-handling design: `InvalidCartridge`
/// aborts before emulation starts, `InvalidOpcode`/`InvalidRamAccess`/
/// `NotImplemented` are fatal and terminate the interpreter thread,
/// `HostIoFailure` is logged and retried.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid cartridge: {0}")]
    InvalidCartridge(String),

    #[error("invalid opcode 0x{opcode:02X} at 0x{pc:04X}")]
    InvalidOpcode { opcode: u8, pc: u16 },

    #[error("invalid RAM access at 0x{address:04X}")]
    InvalidRamAccess { address: u16 },

    #[error("host I/O failure: {0}")]
    HostIoFailure(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
