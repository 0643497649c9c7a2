use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path,
};

use super::Result;
use crate::store::FileInfo;

/// One on-disk file backing part (or all) of a torrent. Pre-allocated to its
/// final length on creation so block writes at any offset never need to grow it.
#[derive(Debug)]
pub struct TorrentFile {
    pub info: FileInfo,
    handle: fs::File,
}

impl TorrentFile {
    pub fn new(dir: &path::Path, info: FileInfo) -> Result<Self> {
        let path = dir.join(&info.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tracing::debug!(path = %path.display(), "opening torrent file");
        let handle = fs::OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        handle.set_len(info.length as u64)?;

        Ok(Self { info, handle })
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset as u64))?;
        self.handle.write_all(data)?;
        Ok(())
    }

    pub fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset as u64))?;
        self.handle.read_exact(buf)?;
        Ok(())
    }
}
