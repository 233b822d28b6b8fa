//! AFC (Apple File Conduit) client
//!
//! AFC gives access to the media partition of the device, which is where packages
//! are staged (`PublicStaging`) before the installation proxy installs them.

use std::{collections::HashMap, path::Path};

use errors::AfcError;
use opcode::{AfcFopenMode, AfcOpcode};
use packet::{AfcCodec, AfcPacket};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, warn};

use crate::{codec::PendingRequests, Idevice, IdeviceError, IdeviceService};

pub mod errors;
pub mod opcode;
pub mod packet;

/// `CFA6LPAA` read as a little-endian u64
pub const MAGIC: u64 = 0x4141504c36414643;

/// Size of the chunks `write` splits file data into
pub const MAX_TRANSFER: usize = 64 * 1024;

/// Largest packet accepted from the device; directory listings stay far below it
pub const MAX_PACKET_LEN: u64 = 16 * 1024 * 1024;

pub struct AfcClient {
    pub idevice: Idevice,
    next_request_id: u64,
    pending: PendingRequests<AfcPacket>,
}

impl std::fmt::Debug for AfcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfcClient")
            .field("idevice", &self.idevice)
            .field("next_request_id", &self.next_request_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Metadata returned by `GetFileInfo`
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub size: usize,
    pub blocks: usize,
    pub creation: chrono::NaiveDateTime,
    pub modified: chrono::NaiveDateTime,
    pub st_nlink: String,
    /// `S_IFDIR`, `S_IFREG`, `S_IFLNK`, ...
    pub st_ifmt: String,
    pub st_link_target: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.st_ifmt == "S_IFDIR"
    }
}

/// Filesystem statistics returned by `GetDeviceInfo`
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub model: String,
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub block_size: usize,
}

impl IdeviceService for AfcClient {
    fn service_name() -> &'static str {
        "com.apple.afc"
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

/// A device path as AFC expects it, NUL terminated
fn path_bytes(path: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(path.len() + 1);
    bytes.extend_from_slice(path.as_bytes());
    bytes.push(0);
    bytes
}

/// Splits a NUL separated `key\0value\0...` listing into pairs
fn key_values(data: &[u8]) -> HashMap<String, String> {
    let strings: Vec<String> = data
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    strings
        .chunks_exact(2)
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect()
}

fn parsed<T: std::str::FromStr>(
    kvs: &mut HashMap<String, String>,
    key: &str,
) -> Result<T, IdeviceError> {
    kvs.remove(key)
        .and_then(|x| x.parse::<T>().ok())
        .ok_or(IdeviceError::AfcMissingAttribute)
}

impl AfcClient {
    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            next_request_id: 0,
            pending: PendingRequests::default(),
        }
    }

    /// Sends one request and waits for the response carrying its id
    ///
    /// Responses and framing errors are routed through the pending table by request
    /// id. A non-success `STATUS` comes back as `IdeviceError::Afc`.
    pub async fn send_request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, IdeviceError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut rx = self.pending.register(request_id)?;
        let packet = AfcPacket::new(request_id, operation, header_payload, payload);
        debug!(
            "Sending AFC request {request_id}: {operation:?} ({} bytes)",
            packet.header.entire_len
        );
        if let Err(e) = self.idevice.write_frame(&mut AfcCodec, &packet).await {
            self.pending.cancel(request_id);
            return Err(e);
        }

        loop {
            match rx.try_recv() {
                Ok(res) => return res,
                Err(TryRecvError::Closed) => {
                    return Err(IdeviceError::InternalError(format!(
                        "AFC request {request_id} was dropped"
                    )))
                }
                Err(TryRecvError::Empty) => {}
            }
            if let Err(e) = self.dispatch_next().await {
                self.pending.cancel(request_id);
                return Err(e);
            }
        }
    }

    /// Reads one frame and hands it to the request it answers
    async fn dispatch_next(&mut self) -> Result<(), IdeviceError> {
        match self.idevice.read_frame(&AfcCodec).await {
            Ok(packet) => {
                let request_id = packet.header.request_id;
                if self.pending.complete(request_id, packet.into_result()) {
                    Ok(())
                } else {
                    warn!("AFC response for request {request_id}, which is not outstanding");
                    Err(IdeviceError::UnknownAfcRequest(request_id))
                }
            }
            Err(IdeviceError::AfcFraming { request_id, reason }) => {
                // The rest of the buffer can't be trusted to start on a frame.
                self.idevice.discard_buffered();
                let err = IdeviceError::AfcFraming { request_id, reason };
                if self.pending.complete(request_id, Err(err)) {
                    Ok(())
                } else {
                    Err(IdeviceError::AfcFraming { request_id, reason })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Gets metadata for a path
    ///
    /// A missing path fails with `IdeviceError::Afc(AfcError::ObjectNotFound)`.
    pub async fn get_file_info(&mut self, path: &str) -> Result<FileInfo, IdeviceError> {
        let res = self
            .send_request(AfcOpcode::GetFileInfo, path_bytes(path), Vec::new())
            .await?;
        let mut kvs = key_values(&res.payload);

        let size = parsed(&mut kvs, "st_size")?;
        let blocks = parsed(&mut kvs, "st_blocks")?;
        let creation = chrono::DateTime::from_timestamp_nanos(parsed(&mut kvs, "st_birthtime")?)
            .naive_local();
        let modified =
            chrono::DateTime::from_timestamp_nanos(parsed(&mut kvs, "st_mtime")?).naive_local();
        let st_nlink = kvs
            .remove("st_nlink")
            .ok_or(IdeviceError::AfcMissingAttribute)?;
        let st_ifmt = kvs
            .remove("st_ifmt")
            .ok_or(IdeviceError::AfcMissingAttribute)?;
        let st_link_target = kvs.remove("st_link_target");

        if !kvs.is_empty() {
            debug!("Unused file info attributes: {kvs:?}");
        }

        Ok(FileInfo {
            size,
            blocks,
            creation,
            modified,
            st_nlink,
            st_ifmt,
            st_link_target,
        })
    }

    /// Gets filesystem statistics for the media partition
    pub async fn get_device_info(&mut self) -> Result<DeviceInfo, IdeviceError> {
        let res = self
            .send_request(AfcOpcode::GetDevInfo, Vec::new(), Vec::new())
            .await?;
        let mut kvs = key_values(&res.payload);

        Ok(DeviceInfo {
            model: kvs
                .remove("Model")
                .ok_or(IdeviceError::AfcMissingAttribute)?,
            total_bytes: parsed(&mut kvs, "FSTotalBytes")?,
            free_bytes: parsed(&mut kvs, "FSFreeBytes")?,
            block_size: parsed(&mut kvs, "FSBlockSize")?,
        })
    }

    /// Lists the entries of a directory, `.` and `..` included
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, IdeviceError> {
        let res = self
            .send_request(AfcOpcode::ReadDir, path_bytes(path), Vec::new())
            .await?;
        Ok(res
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    /// Creates a directory, parents included
    pub async fn make_directory(&mut self, path: &str) -> Result<(), IdeviceError> {
        self.send_request(AfcOpcode::MakeDir, path_bytes(path), Vec::new())
            .await?;
        Ok(())
    }

    /// Makes sure `path` exists as a directory
    ///
    /// Only `ObjectNotFound` leads to creating it; any other error is returned.
    pub async fn ensure_directory(&mut self, path: &str) -> Result<(), IdeviceError> {
        match self.get_file_info(path).await {
            Ok(_) => Ok(()),
            Err(IdeviceError::Afc(AfcError::ObjectNotFound)) => {
                debug!("{path} does not exist, creating it");
                self.make_directory(path).await
            }
            Err(e) => Err(e),
        }
    }

    /// Removes a file or an empty directory
    pub async fn remove(&mut self, path: &str) -> Result<(), IdeviceError> {
        self.send_request(AfcOpcode::RemovePath, path_bytes(path), Vec::new())
            .await?;
        Ok(())
    }

    /// Opens a file and returns its handle
    pub async fn open(&mut self, path: &str, mode: AfcFopenMode) -> Result<u64, IdeviceError> {
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend(path_bytes(path));
        let res = self
            .send_request(AfcOpcode::FileOpen, header_payload, Vec::new())
            .await?;

        if res.header.operation != AfcOpcode::FileOpenRes || res.header_payload.len() < 8 {
            warn!("FileOpen answered with {:?}", res.header.operation);
            return Err(IdeviceError::UnexpectedResponse);
        }
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&res.header_payload[..8]);
        Ok(u64::from_le_bytes(handle))
    }

    /// Writes `data` to an open file in chunks of at most [`MAX_TRANSFER`] bytes
    pub async fn write(&mut self, handle: u64, data: &[u8]) -> Result<(), IdeviceError> {
        for chunk in data.chunks(MAX_TRANSFER) {
            self.send_request(
                AfcOpcode::Write,
                handle.to_le_bytes().to_vec(),
                chunk.to_vec(),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn close(&mut self, handle: u64) -> Result<(), IdeviceError> {
        self.send_request(AfcOpcode::FileClose, handle.to_le_bytes().to_vec(), Vec::new())
            .await?;
        Ok(())
    }

    /// Creates or truncates `path` and writes `data` into it
    pub async fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), IdeviceError> {
        let handle = self.open(path, AfcFopenMode::WrOnly).await?;
        let written = self.write(handle, data).await;
        let closed = self.close(handle).await;
        written.and(closed)
    }

    /// Copies a local directory tree to `dest` on the device
    ///
    /// The parent of `dest` is created if it does not exist yet. Files are written
    /// in full; symlinks and other special files are skipped.
    pub async fn upload_directory(
        &mut self,
        src: impl AsRef<Path>,
        dest: &str,
    ) -> Result<(), IdeviceError> {
        let dest = dest.trim_end_matches('/');
        if let Some((parent, _)) = dest.rsplit_once('/') {
            if !parent.is_empty() {
                self.ensure_directory(parent).await?;
            }
        }
        self.make_directory(dest).await?;

        // Walk iteratively so the future stays a fixed size.
        let mut dirs = vec![(src.as_ref().to_path_buf(), dest.to_string())];
        let mut uploaded = 0usize;
        while let Some((local, remote)) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&local).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let remote_path = format!("{remote}/{name}");
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    self.make_directory(&remote_path).await?;
                    dirs.push((entry.path(), remote_path));
                } else if file_type.is_file() {
                    let data = tokio::fs::read(entry.path()).await?;
                    self.write_file(&remote_path, &data).await?;
                    uploaded += 1;
                } else {
                    warn!("Skipping special file {}", entry.path().display());
                }
            }
        }
        debug!("Uploaded {uploaded} files to {dest}");
        Ok(())
    }
}

impl From<Idevice> for AfcClient {
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}
