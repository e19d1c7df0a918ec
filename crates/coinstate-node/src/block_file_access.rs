//! Physical block and undo files.
//!
//! Blocks are appended to `blk{NNNNN}.dat` and their undo data to the
//! matching `rev{NNNNN}.dat`. Space is reserved in whole chunks ahead of
//! the data so files grow in large steps; when a file is closed for new
//! blocks it is finalized, trimming the unused tail of the last chunk.
//!
//! File handles are plain [`std::fs::File`]s opened per operation and
//! closed when they go out of scope.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::block_files::{BLOCKFILE_CHUNK_SIZE, BlockFileInfo, DiskBlockPos, UNDOFILE_CHUNK_SIZE};
use crate::error::BlockFileError;

/// Operations the block-file store needs from the file layer.
pub trait BlockFileAccess: Send + Sync {
    /// Reserve block file space up to `new_chunks` whole chunks, starting at `pos`.
    fn pre_allocate_block(&self, new_chunks: u64, pos: DiskBlockPos) -> Result<(), BlockFileError>;

    /// Reserve undo file space up to `new_chunks` whole chunks, starting at `pos`.
    fn pre_allocate_undo(&self, new_chunks: u64, pos: DiskBlockPos) -> Result<(), BlockFileError>;

    /// Sync a block file and its undo file, truncating both to their
    /// accounted sizes when `finalize` is set.
    fn flush_block_file(&self, file: u32, info: &BlockFileInfo, finalize: bool) -> Result<(), BlockFileError>;
}

/// Does nothing and never runs out of space.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFileAccess;

impl BlockFileAccess for NoopFileAccess {
    fn pre_allocate_block(&self, _new_chunks: u64, _pos: DiskBlockPos) -> Result<(), BlockFileError> {
        Ok(())
    }

    fn pre_allocate_undo(&self, _new_chunks: u64, _pos: DiskBlockPos) -> Result<(), BlockFileError> {
        Ok(())
    }

    fn flush_block_file(&self, _file: u32, _info: &BlockFileInfo, _finalize: bool) -> Result<(), BlockFileError> {
        Ok(())
    }
}

/// Flat files in a blocks directory.
#[derive(Debug, Clone)]
pub struct FlatFileAccess {
    blocks_dir: PathBuf,
    /// Cap on the combined size of all block and undo files.
    space_limit: Option<u64>,
}

impl FlatFileAccess {
    pub fn new(blocks_dir: impl AsRef<Path>) -> Result<Self, BlockFileError> {
        let blocks_dir = blocks_dir.as_ref().to_path_buf();
        fs::create_dir_all(&blocks_dir)?;
        Ok(Self {
            blocks_dir,
            space_limit: None,
        })
    }

    /// Report out of disk space once the files would exceed `bytes` in total.
    pub fn with_space_limit(mut self, bytes: u64) -> Self {
        self.space_limit = Some(bytes);
        self
    }

    pub fn block_path(&self, file: u32) -> PathBuf {
        self.blocks_dir.join(format!("blk{file:05}.dat"))
    }

    pub fn undo_path(&self, file: u32) -> PathBuf {
        self.blocks_dir.join(format!("rev{file:05}.dat"))
    }

    pub fn write_block(&self, pos: DiskBlockPos, bytes: &[u8]) -> Result<(), BlockFileError> {
        write_at(&self.block_path(pos.file), pos.pos, bytes)
    }

    pub fn write_undo(&self, pos: DiskBlockPos, bytes: &[u8]) -> Result<(), BlockFileError> {
        write_at(&self.undo_path(pos.file), pos.pos, bytes)
    }

    pub fn read_block(&self, pos: DiskBlockPos, len: usize) -> Result<Vec<u8>, BlockFileError> {
        read_at(&self.block_path(pos.file), pos.pos, len)
    }

    pub fn read_undo(&self, pos: DiskBlockPos, len: usize) -> Result<Vec<u8>, BlockFileError> {
        read_at(&self.undo_path(pos.file), pos.pos, len)
    }

    /// Delete the block and undo files of every listed file number.
    pub fn remove_files(&self, files: &BTreeSet<u32>) -> Result<(), BlockFileError> {
        for &file in files {
            for path in [self.block_path(file), self.undo_path(file)] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            info!(file, "pruned block and undo files");
        }
        Ok(())
    }

    /// Combined size of all block and undo files on disk.
    pub fn disk_usage(&self) -> Result<u64, BlockFileError> {
        let mut total = 0;
        for entry in fs::read_dir(&self.blocks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if (name.starts_with("blk") || name.starts_with("rev")) && name.ends_with(".dat") {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }

    /// Extend `path` to at least `offset + length` bytes.
    fn allocate(&self, path: &Path, offset: u64, length: u64) -> Result<(), BlockFileError> {
        if let Some(limit) = self.space_limit {
            if self.disk_usage()? + length > limit {
                warn!(path = %path.display(), length, limit, "block file allocation exceeds space limit");
                return Err(BlockFileError::OutOfDiskSpace);
            }
        }
        let file = open_rw(path)?;
        let end = offset + length;
        if file.metadata()?.len() < end {
            file.set_len(end).map_err(out_of_space_or_io)?;
            debug!(path = %path.display(), end, "pre-allocated file range");
        }
        Ok(())
    }

    fn sync_file(path: &Path, size: u64, finalize: bool) -> Result<(), BlockFileError> {
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if finalize {
            file.set_len(size)?;
        }
        file.sync_all()?;
        Ok(())
    }
}

impl BlockFileAccess for FlatFileAccess {
    fn pre_allocate_block(&self, new_chunks: u64, pos: DiskBlockPos) -> Result<(), BlockFileError> {
        let length = (new_chunks * BLOCKFILE_CHUNK_SIZE).saturating_sub(pos.pos);
        self.allocate(&self.block_path(pos.file), pos.pos, length)
    }

    fn pre_allocate_undo(&self, new_chunks: u64, pos: DiskBlockPos) -> Result<(), BlockFileError> {
        let length = (new_chunks * UNDOFILE_CHUNK_SIZE).saturating_sub(pos.pos);
        self.allocate(&self.undo_path(pos.file), pos.pos, length)
    }

    fn flush_block_file(&self, file: u32, info: &BlockFileInfo, finalize: bool) -> Result<(), BlockFileError> {
        Self::sync_file(&self.block_path(file), info.size(), finalize)?;
        Self::sync_file(&self.undo_path(file), info.undo_size(), finalize)?;
        debug!(file, finalize, "flushed block file");
        Ok(())
    }
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn out_of_space_or_io(e: std::io::Error) -> BlockFileError {
    if e.kind() == ErrorKind::StorageFull {
        BlockFileError::OutOfDiskSpace
    } else {
        BlockFileError::Io(e)
    }
}

fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> Result<(), BlockFileError> {
    let mut file = open_rw(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes).map_err(out_of_space_or_io)?;
    Ok(())
}

fn read_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, BlockFileError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_access() -> (FlatFileAccess, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let access = FlatFileAccess::new(dir.path().join("blocks")).unwrap();
        (access, dir)
    }

    fn info_with_sizes(size: u64, undo_size: u64) -> BlockFileInfo {
        let mut info = BlockFileInfo::default();
        info.add_new_block(1, 1, size);
        info.add_undo_size(undo_size);
        info
    }

    #[test]
    fn file_names_are_zero_padded() {
        let (access, _dir) = temp_access();
        assert!(access.block_path(7).ends_with("blk00007.dat"));
        assert!(access.undo_path(12345).ends_with("rev12345.dat"));
    }

    #[test]
    fn pre_allocation_extends_to_chunk_boundary() {
        let (access, _dir) = temp_access();
        let pos = DiskBlockPos::new(0, 0);
        access.pre_allocate_block(1, pos).unwrap();
        assert_eq!(fs::metadata(access.block_path(0)).unwrap().len(), BLOCKFILE_CHUNK_SIZE);
        access.pre_allocate_undo(2, pos).unwrap();
        assert_eq!(fs::metadata(access.undo_path(0)).unwrap().len(), 2 * UNDOFILE_CHUNK_SIZE);
    }

    #[test]
    fn finalize_truncates_to_accounted_size() {
        let (access, _dir) = temp_access();
        let pos = DiskBlockPos::new(3, 0);
        access.pre_allocate_block(1, pos).unwrap();
        access.pre_allocate_undo(1, pos).unwrap();
        access.write_block(pos, b"block bytes").unwrap();

        let info = info_with_sizes(11, 4);
        access.flush_block_file(3, &info, false).unwrap();
        assert_eq!(fs::metadata(access.block_path(3)).unwrap().len(), BLOCKFILE_CHUNK_SIZE);

        access.flush_block_file(3, &info, true).unwrap();
        assert_eq!(fs::metadata(access.block_path(3)).unwrap().len(), 11);
        assert_eq!(fs::metadata(access.undo_path(3)).unwrap().len(), 4);
        assert_eq!(access.read_block(pos, 11).unwrap(), b"block bytes");
    }

    #[test]
    fn flushing_missing_files_is_a_noop() {
        let (access, _dir) = temp_access();
        access.flush_block_file(9, &BlockFileInfo::default(), true).unwrap();
        assert!(!access.block_path(9).exists());
    }

    #[test]
    fn space_limit_reports_out_of_disk_space() {
        let (access, _dir) = temp_access();
        let access = access.with_space_limit(UNDOFILE_CHUNK_SIZE);
        access.pre_allocate_undo(1, DiskBlockPos::new(0, 0)).unwrap();
        let err = access.pre_allocate_block(1, DiskBlockPos::new(0, 0)).unwrap_err();
        assert!(matches!(err, BlockFileError::OutOfDiskSpace));
    }

    #[test]
    fn undo_round_trip_and_removal() {
        let (access, _dir) = temp_access();
        let pos = DiskBlockPos::new(1, 8);
        access.write_undo(pos, &[1, 2, 3]).unwrap();
        access.write_block(DiskBlockPos::new(1, 0), &[9]).unwrap();
        assert_eq!(access.read_undo(pos, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(access.disk_usage().unwrap(), 11 + 1);

        access.remove_files(&BTreeSet::from([1, 2])).unwrap();
        assert!(!access.block_path(1).exists());
        assert!(!access.undo_path(1).exists());
        assert_eq!(access.disk_usage().unwrap(), 0);
    }
}
