/// Non-success status codes an AFC `STATUS` response can carry
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AfcError {
    #[error("Unknown error")]
    UnknownError,
    #[error("Operation header invalid")]
    OpHeaderInvalid,
    #[error("No resources available")]
    NoResources,
    #[error("Read error")]
    ReadError,
    #[error("Write error")]
    WriteError,
    #[error("Unknown packet type")]
    UnknownPacketType,
    #[error("Invalid argument")]
    InvalidArg,
    #[error("Object not found")]
    ObjectNotFound,
    #[error("Object is a directory")]
    ObjectIsDir,
    #[error("Permission denied")]
    PermDenied,
    #[error("Service not connected")]
    ServiceNotConnected,
    #[error("Operation timed out")]
    OpTimeout,
    #[error("Too much data")]
    TooMuchData,
    #[error("End of data")]
    EndOfData,
    #[error("Operation not supported")]
    OpNotSupported,
    #[error("Object already exists")]
    ObjectExists,
    #[error("Object is busy")]
    ObjectBusy,
    #[error("No space left")]
    NoSpaceLeft,
    #[error("Operation would block")]
    OpWouldBlock,
    #[error("I/O error")]
    IoError,
    #[error("Operation interrupted")]
    OpInterrupted,
    #[error("Operation in progress")]
    OpInProgress,
    #[error("Internal error")]
    InternalError,
    #[error("Multiplexer error")]
    MuxError,
    #[error("Out of memory")]
    NoMem,
    #[error("Not enough data")]
    NotEnoughData,
    #[error("Directory not empty")]
    DirNotEmpty,
    #[error("Unrecognized status {0}")]
    Other(u64),
}

impl AfcError {
    /// The status code as it appeared on the wire
    pub fn code(&self) -> u64 {
        match self {
            Self::UnknownError => 1,
            Self::OpHeaderInvalid => 2,
            Self::NoResources => 3,
            Self::ReadError => 4,
            Self::WriteError => 5,
            Self::UnknownPacketType => 6,
            Self::InvalidArg => 7,
            Self::ObjectNotFound => 8,
            Self::ObjectIsDir => 9,
            Self::PermDenied => 10,
            Self::ServiceNotConnected => 11,
            Self::OpTimeout => 12,
            Self::TooMuchData => 13,
            Self::EndOfData => 14,
            Self::OpNotSupported => 15,
            Self::ObjectExists => 16,
            Self::ObjectBusy => 17,
            Self::NoSpaceLeft => 18,
            Self::OpWouldBlock => 19,
            Self::IoError => 20,
            Self::OpInterrupted => 21,
            Self::OpInProgress => 22,
            Self::InternalError => 23,
            Self::MuxError => 30,
            Self::NoMem => 31,
            Self::NotEnoughData => 32,
            Self::DirNotEmpty => 33,
            Self::Other(code) => *code,
        }
    }

    /// Maps a status code to an error, `None` meaning success
    pub fn from_status(code: u64) -> Option<Self> {
        Some(match code {
            0 => return None,
            1 => Self::UnknownError,
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            30 => Self::MuxError,
            31 => Self::NoMem,
            32 => Self::NotEnoughData,
            33 => Self::DirNotEmpty,
            other => Self::Other(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_failure_keeps_its_exact_code() {
        assert_eq!(AfcError::from_status(0), None);
        for code in (1..=40).chain([0xffff_ffff, u64::MAX]) {
            let err = AfcError::from_status(code).unwrap();
            assert_eq!(err.code(), code, "{err}");
        }
        assert_eq!(AfcError::from_status(8), Some(AfcError::ObjectNotFound));
        assert_eq!(AfcError::from_status(25), Some(AfcError::Other(25)));
    }
}
