use thiserror::Error;

/// Errors reported by the public API.
///
/// Every failure maps to exactly one of these; the numeric codes are a
/// stable contract for foreign bindings (operations historically returned
/// the negated code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// A session is already open, or the session could not be established.
    #[error("library session unavailable")]
    Lib,
    /// Configuration could not be loaded or applied.
    #[error("configuration failed")]
    Cfg,
    /// The slot number does not resolve to a usable slot.
    #[error("invalid slot number")]
    SlotNum,
    /// Required on-flash structure is missing or malformed.
    #[error("invalid format")]
    Format,
    /// The slot is erased (holds no enabled image).
    #[error("slot is erased")]
    Erase,
    /// The slot already holds an enabled image, or the image was rejected.
    #[error("programming rejected")]
    Program,
    /// Data read back from flash differs from the source.
    #[error("comparison failed")]
    Cmp,
    /// The image does not fit in the slot.
    #[error("image larger than slot")]
    Size,
    /// Slot name not found, or a reserved name was used.
    #[error("bad slot name")]
    Name,
    /// File I/O or firmware transport failed.
    #[error("file i/o failed")]
    FileIo,
    /// A data-source callback reported failure.
    #[error("data source failed")]
    Callback,
    /// Low-level flash access failed.
    #[error("low-level flash error")]
    LowLevel,
    /// The slot is write-protected by configuration.
    #[error("slot is write-protected")]
    WrProt,
    /// Invalid arguments.
    #[error("invalid arguments")]
    Args,
    /// Both CPB copies are unusable; only restore or rebuild can recover.
    #[error("CPB is corrupted")]
    CorruptedCpb,
    /// Both SPT copies are unusable; only restore can recover.
    #[error("SPT is corrupted")]
    CorruptedSpt,
}

impl Error {
    /// The stable integer code of this error.
    pub const fn code(&self) -> i32 {
        match self {
            Error::Lib => 1,
            Error::Cfg => 2,
            Error::SlotNum => 3,
            Error::Format => 4,
            Error::Erase => 5,
            Error::Program => 6,
            Error::Cmp => 7,
            Error::Size => 8,
            Error::Name => 9,
            Error::FileIo => 10,
            Error::Callback => 11,
            Error::LowLevel => 12,
            Error::WrProt => 13,
            Error::Args => 14,
            Error::CorruptedCpb => 15,
            Error::CorruptedSpt => 16,
        }
    }
}

/// The negated stable code, matching the historical C return convention.
impl From<Error> for i32 {
    fn from(err: Error) -> i32 {
        -err.code()
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Lib.code(), 1);
        assert_eq!(Error::Args.code(), 14);
        assert_eq!(Error::CorruptedCpb.code(), 15);
        assert_eq!(Error::CorruptedSpt.code(), 16);
        assert_eq!(i32::from(Error::WrProt), -13);
    }
}
