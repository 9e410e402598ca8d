//! Aggregate graph file: one header followed by one frame per entity.
//!
//! Attaching maps the file read-only with `memmap2` and rebuilds the id
//! directory by scanning frame headers; bodies are only decoded on page-in.
//! Writing always goes to a sibling temp file that replaces the target only
//! once it is complete and synced.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{StoreError, StoreResult};
use crate::store::record::{
    FILE_HEADER_SIZE, FileHeader, FrameHeader, HeaderRead, frame_len_at, read_header,
};

/// A read-only mapping of an aggregate file.
pub(crate) struct AttachedFile {
    path: PathBuf,
    map: Mmap,
    header: FileHeader,
}

/// Frame headers found by [`AttachedFile::scan`].
#[derive(Debug, Default)]
pub(crate) struct Scan {
    /// Usable frames with their byte offset.
    pub frames: Vec<(FrameHeader, usize)>,
    /// Frames skipped because their header was corrupt.
    pub corrupt: usize,
    /// Whether the scan stopped at a truncated frame.
    pub truncated: bool,
}

impl AttachedFile {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and files are only ever replaced by
        // rename, never modified in place, so the mapped inode stays intact.
        let map = unsafe { Mmap::map(&file)? };
        let header = FileHeader::decode(&map, &path.display().to_string())?;
        Ok(Self {
            path: path.to_path_buf(),
            map,
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> FileHeader {
        self.header
    }

    /// Walk every frame header after the file header.
    pub fn scan(&self) -> Scan {
        let mut scan = Scan::default();
        let mut pos = FILE_HEADER_SIZE;
        while pos < self.map.len() {
            match read_header(&self.map, pos) {
                HeaderRead::Frame(header) => {
                    let next = pos + header.frame_len();
                    scan.frames.push((header, pos));
                    pos = next;
                }
                HeaderRead::Corrupt { id, message } => {
                    tracing::warn!(id, %message, offset = pos, "skipping corrupt frame header");
                    scan.corrupt += 1;
                    // The length fields are still readable when the header is.
                    let Some(skip) = frame_len_at(&self.map, pos)
                        .filter(|len| pos.saturating_add(*len) <= self.map.len())
                    else {
                        scan.truncated = true;
                        break;
                    };
                    pos += skip;
                }
                HeaderRead::Truncated => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset = pos,
                        "graph file ends in a truncated frame"
                    );
                    scan.truncated = true;
                    break;
                }
            }
        }
        scan
    }

    /// Borrow the raw frame at `offset`.
    pub fn frame(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.map.get(offset..offset.checked_add(len)?)
    }
}

impl std::fmt::Debug for AttachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedFile")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .field("header", &self.header)
            .finish()
    }
}

/// Writes a new aggregate file next to its destination.
///
/// Dropping an unfinished writer removes the temp file, so an aborted or
/// failed save never disturbs the file it would have replaced.
pub(crate) struct FileWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    out: Option<BufWriter<File>>,
    records: u64,
}

impl FileWriter {
    pub fn create(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        let tmp_path = path.with_file_name(name);
        let mut out = BufWriter::new(File::create(&tmp_path)?);
        out.write_all(&[0u8; FILE_HEADER_SIZE])?;
        Ok(Self {
            tmp_path,
            final_path: path.to_path_buf(),
            out: Some(out),
            records: 0,
        })
    }

    pub fn push(&mut self, frame: &[u8]) -> StoreResult<()> {
        let out = self.out.as_mut().ok_or_else(finished)?;
        out.write_all(frame)?;
        self.records += 1;
        Ok(())
    }

    /// Write the header, sync, and atomically replace the destination.
    pub fn finish(mut self, next_id: u64) -> StoreResult<u64> {
        let out = self.out.take().ok_or_else(finished)?;
        let mut file = out
            .into_inner()
            .map_err(|e| StoreError::Io { source: e.into_error() })?;
        let header = FileHeader {
            next_id,
            record_count: self.records,
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.records)
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn finished() -> StoreError {
    StoreError::Io {
        source: std::io::Error::other("graph file writer already finished"),
    }
}
