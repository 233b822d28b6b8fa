#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x00000001,
    Data = 0x00000002,
    ReadDir = 0x00000003,
    ReadFile = 0x00000004,
    WriteFile = 0x00000005,
    WritePart = 0x00000006,
    Truncate = 0x00000007,
    RemovePath = 0x00000008,
    MakeDir = 0x00000009,
    GetFileInfo = 0x0000000a,
    GetDevInfo = 0x0000000b,
    WriteFileAtom = 0x0000000c, // tmp file + rename
    FileOpen = 0x0000000d,
    FileOpenRes = 0x0000000e,
    Read = 0x0000000f,
    Write = 0x00000010,
    FileSeek = 0x00000011,
    FileTell = 0x00000012,
    FileTellRes = 0x00000013,
    FileClose = 0x00000014,
    FileSetSize = 0x00000015,
    GetConInfo = 0x00000016,
    SetConOptions = 0x00000017,
    RenamePath = 0x00000018,
    SetFsBs = 0x00000019,
    SetSocketBs = 0x0000001a,
    FileLock = 0x0000001b,
    MakeLink = 0x0000001c,
    GetFileHash = 0x0000001d,
    SetFileTime = 0x0000001e,
    GetFileHashRange = 0x0000001f,
    FileSetImmutableHint = 0x00000020,
    GetSizeOfPathContents = 0x00000021,
    RemovePathAndContents = 0x00000022,
    DirOpen = 0x00000023,
    DirOpenResult = 0x00000024,
    DirRead = 0x00000025,
    DirClose = 0x00000026,
    FileReadOffset = 0x00000027,
    FileWriteOffset = 0x00000028,
}

/// Open flags for `FileOpen`, named after their `fopen` modes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcFopenMode {
    RdOnly = 0x00000001,   // r
    Rw = 0x00000002,       // r+
    WrOnly = 0x00000003,   // w
    Wr = 0x00000004,       // w+
    Append = 0x00000005,   // a
    RdAppend = 0x00000006, // a+
}

impl TryFrom<u64> for AfcOpcode {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x04 => Self::ReadFile,
            0x05 => Self::WriteFile,
            0x06 => Self::WritePart,
            0x07 => Self::Truncate,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0a => Self::GetFileInfo,
            0x0b => Self::GetDevInfo,
            0x0c => Self::WriteFileAtom,
            0x0d => Self::FileOpen,
            0x0e => Self::FileOpenRes,
            0x0f => Self::Read,
            0x10 => Self::Write,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellRes,
            0x14 => Self::FileClose,
            0x15 => Self::FileSetSize,
            0x16 => Self::GetConInfo,
            0x17 => Self::SetConOptions,
            0x18 => Self::RenamePath,
            0x19 => Self::SetFsBs,
            0x1a => Self::SetSocketBs,
            0x1b => Self::FileLock,
            0x1c => Self::MakeLink,
            0x1d => Self::GetFileHash,
            0x1e => Self::SetFileTime,
            0x1f => Self::GetFileHashRange,
            0x20 => Self::FileSetImmutableHint,
            0x21 => Self::GetSizeOfPathContents,
            0x22 => Self::RemovePathAndContents,
            0x23 => Self::DirOpen,
            0x24 => Self::DirOpenResult,
            0x25 => Self::DirRead,
            0x26 => Self::DirClose,
            0x27 => Self::FileReadOffset,
            0x28 => Self::FileWriteOffset,
            other => return Err(other),
        })
    }
}
