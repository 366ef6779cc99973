//! Plane persistence.
//!
//! One writer per output file, running on its own named thread so disk latency never reaches
//! the intake task or the coordination task. The intake hands planes over in acquisition order
//! through a bounded queue; the thread appends pixel data while the per-plane metadata is kept
//! on the caller's side and written next to the data file when the run ends.
//!
//! Output of [`RawStackWriter`]:
//! - `<name>.raw`: pixel planes back to back, little-endian `u16`, row-major
//! - `<name>.json`: run header plus one [`PlaneMetadata`] per slot in acquisition order,
//!   including slots that never received a frame

use crate::data::frame::{PlaneMetadata, PlaneStatus};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// Run-level header stored with the plane metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    /// Run identifier
    pub run_id: String,
    /// Experiment name
    pub experiment: String,
    /// Start of the run
    pub started_at: DateTime<Utc>,
    /// Frame size (width, height) of the planes, if known
    pub frame_size: Option<(u32, u32)>,
}

/// Metadata file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackMetadata {
    /// Run header
    pub header: RunHeader,
    /// Planes in acquisition order
    pub planes: Vec<PlaneMetadata>,
}

impl StackMetadata {
    /// Read a metadata file written by [`RawStackWriter`].
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// What a finished writer produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterSummary {
    /// Pixel data file
    pub data_path: PathBuf,
    /// Metadata file
    pub metadata_path: PathBuf,
    /// Planes with pixel data
    pub planes_written: u64,
    /// Planes whose pixels were dropped because the write queue was full
    #[serde(default)]
    pub planes_dropped: u64,
    /// Bytes of pixel data
    pub bytes_written: u64,
}

/// Destination for planes in acquisition order.
pub trait PlaneWriter: Send {
    /// Record run-level metadata. Called once, before the first plane.
    fn set_metadata(&mut self, header: RunHeader) -> AppResult<()>;

    /// Append one slot. `pixels` is `None` for slots without a frame.
    ///
    /// On error the plane is still recorded, without pixel data.
    fn write(&mut self, plane: PlaneMetadata, pixels: Option<Vec<u16>>) -> AppResult<()>;

    /// Flush everything and close the files.
    fn shutdown(self: Box<Self>) -> AppResult<WriterSummary>;
}

/// Planes the writer thread may lag behind the intake.
pub const DEFAULT_WRITE_QUEUE: usize = 64;

/// Raw `u16` stack writer on a dedicated thread.
///
/// Pixel buffers go through a bounded queue. `write` never blocks: when the thread has fallen
/// `capacity` planes behind, the plane is recorded as missing and counted as dropped.
pub struct RawStackWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    thread: Option<JoinHandle<AppResult<u64>>>,
    data_path: PathBuf,
    metadata_path: PathBuf,
    header: Option<RunHeader>,
    planes: Vec<PlaneMetadata>,
    offset: u64,
    planes_written: u64,
    planes_dropped: u64,
}

impl RawStackWriter {
    /// Create `data_path` (and its parent directory) and start the writer thread with room for
    /// `capacity` queued planes.
    ///
    /// The metadata file is `data_path` with a `.json` extension.
    pub fn create<P: AsRef<Path>>(data_path: P, capacity: usize) -> AppResult<Self> {
        let data_path = data_path.as_ref().to_path_buf();
        if let Some(parent) = data_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&data_path).map_err(|e| {
            DaqError::Storage(format!("Failed to create {}: {}", data_path.display(), e))
        })?;
        Self::spawn(BufWriter::new(file), data_path, capacity)
    }

    fn spawn<W: Write + Send + 'static>(
        out: W,
        data_path: PathBuf,
        capacity: usize,
    ) -> AppResult<Self> {
        let metadata_path = data_path.with_extension("json");
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let thread = thread::Builder::new()
            .name("plane-writer".to_string())
            .spawn(move || write_loop(rx, out))?;

        info!(path = %data_path.display(), capacity, "Plane writer started");
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            data_path,
            metadata_path,
            header: None,
            planes: Vec::new(),
            offset: 0,
            planes_written: 0,
            planes_dropped: 0,
        })
    }

    /// Pixel data file
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Planes dropped so far because the queue was full
    pub fn planes_dropped(&self) -> u64 {
        self.planes_dropped
    }

    fn enqueue(&mut self, plane: &mut PlaneMetadata, pixels: Vec<u16>) -> AppResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| DaqError::Storage("writer already shut down".to_string()))?;

        let mut bytes = Vec::with_capacity(pixels.len() * 2);
        for px in &pixels {
            bytes.extend_from_slice(&px.to_le_bytes());
        }
        let len = bytes.len() as u64;
        match tx.try_send(bytes) {
            Ok(()) => {
                plane.data_offset = Some(self.offset);
                self.offset += len;
                self.planes_written += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.planes_dropped += 1;
                warn!(slot = %plane.slot, dropped = self.planes_dropped, "Write queue full, plane dropped");
                Err(DaqError::Storage(format!(
                    "write queue full; pixels of {} dropped",
                    plane.slot
                )))
            }
            Err(TrySendError::Closed(_)) => {
                Err(DaqError::Storage("writer thread exited".to_string()))
            }
        }
    }

    fn close(&mut self) -> AppResult<u64> {
        // closing the channel ends the write loop
        self.tx.take();
        let thread = self
            .thread
            .take()
            .ok_or_else(|| DaqError::Storage("writer already shut down".to_string()))?;
        thread
            .join()
            .map_err(|_| DaqError::Storage("writer thread panicked".to_string()))?
    }
}

impl PlaneWriter for RawStackWriter {
    fn set_metadata(&mut self, header: RunHeader) -> AppResult<()> {
        self.header = Some(header);
        Ok(())
    }

    fn write(&mut self, mut plane: PlaneMetadata, pixels: Option<Vec<u16>>) -> AppResult<()> {
        let outcome = match pixels {
            Some(pixels) => self.enqueue(&mut plane, pixels),
            None => Ok(()),
        };
        if plane.data_offset.is_none() && plane.status == PlaneStatus::Written {
            plane.status = PlaneStatus::Missing;
        }
        debug!(slot = %plane.slot, status = ?plane.status, "Plane recorded");
        self.planes.push(plane);
        outcome
    }

    fn shutdown(mut self: Box<Self>) -> AppResult<WriterSummary> {
        let bytes_written = self.close()?;

        let metadata = StackMetadata {
            header: self.header.take().unwrap_or_else(|| RunHeader {
                run_id: String::new(),
                experiment: String::new(),
                started_at: Utc::now(),
                frame_size: None,
            }),
            planes: std::mem::take(&mut self.planes),
        };
        fs::write(&self.metadata_path, serde_json::to_string_pretty(&metadata)?)?;

        info!(
            planes = self.planes_written,
            dropped = self.planes_dropped,
            bytes = bytes_written,
            path = %self.data_path.display(),
            "Plane writer finished"
        );
        Ok(WriterSummary {
            data_path: self.data_path.clone(),
            metadata_path: self.metadata_path.clone(),
            planes_written: self.planes_written,
            planes_dropped: self.planes_dropped,
            bytes_written,
        })
    }
}

impl Drop for RawStackWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn write_loop<W: Write>(mut rx: mpsc::Receiver<Vec<u8>>, mut out: W) -> AppResult<u64> {
    let mut written = 0u64;
    let mut failure: Option<DaqError> = None;

    // keep draining after a failure so the queue never fills up behind a dead file
    while let Some(bytes) = rx.blocking_recv() {
        if failure.is_some() {
            continue;
        }
        match out.write_all(&bytes) {
            Ok(()) => written += bytes.len() as u64,
            Err(e) => {
                error!(offset = written, "Plane write failed: {}", e);
                failure = Some(DaqError::Storage(format!(
                    "Failed to write plane at offset {}: {}",
                    written, e
                )));
            }
        }
    }

    out.flush()?;
    match failure {
        Some(e) => Err(e),
        None => Ok(written),
    }
}
