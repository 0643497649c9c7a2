use std::{path::Path, sync::Mutex};

use sha1::{Digest, Sha1};

use crate::{metainfo::Metainfo, store::StoreInfo, Bitfield};

mod file;
pub use file::TorrentFile;

type Result<T> = std::result::Result<T, DiskError>;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// File-manager collaborator: a resume-aware `have()` scan run once at
/// init, and a fire-and-forget `write_block` sink called per committed block.
/// Never verifies a piece's hash itself — that is the coordinator's job,
/// since `write_block` alone only sees one block at a time.
pub trait FileManager: Send + Sync {
    fn have(&self) -> Bitfield;

    fn write_block(&self, piece_index: usize, offset: usize, data: &[u8]);
}

pub struct DiskFileManager {
    info: StoreInfo,
    piece_hashes: Vec<[u8; 20]>,
    files: Vec<Mutex<TorrentFile>>,
}

impl DiskFileManager {
    pub fn new(metainfo: &dyn Metainfo, output_dir: &Path) -> Result<Self> {
        let info = StoreInfo::new(metainfo, output_dir.to_path_buf());
        std::fs::create_dir_all(&info.output_dir)?;

        let files = info
            .files
            .iter()
            .cloned()
            .map(|f| TorrentFile::new(&info.output_dir, f).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        let piece_hashes = (0..metainfo.num_pieces() as usize).map(|i| metainfo.piece_hash(i)).collect();
        Ok(Self { info, piece_hashes, files })
    }

    fn read_range(&self, abs_offset: usize, buf: &mut [u8]) -> Result<()> {
        for (file_idx, file_offset, buf_range) in self.info.map_range(abs_offset, buf.len()) {
            let mut file = self.files[file_idx].lock().unwrap();
            file.read_at(file_offset, &mut buf[buf_range])?;
        }
        Ok(())
    }

    fn write_range(&self, abs_offset: usize, data: &[u8]) -> Result<()> {
        for (file_idx, file_offset, buf_range) in self.info.map_range(abs_offset, data.len()) {
            let mut file = self.files[file_idx].lock().unwrap();
            file.write_at(file_offset, &data[buf_range])?;
        }
        Ok(())
    }

    fn read_piece(&self, index: usize) -> Result<Vec<u8>> {
        let len = self.info.piece_length(index);
        let mut buf = vec![0u8; len];
        self.read_range(self.info.piece_byte_offset(index), &mut buf)?;
        Ok(buf)
    }
}

impl FileManager for DiskFileManager {
    #[tracing::instrument(skip(self))]
    fn have(&self) -> Bitfield {
        let mut bf = Bitfield::repeat(false, self.info.num_pieces as usize);
        for index in 0..self.info.num_pieces as usize {
            let data = match self.read_piece(index) {
                Ok(data) => data,
                Err(e) => {
                    tracing::trace!(index, error = %e, "piece unreadable during resume scan");
                    continue;
                }
            };
            let mut hasher = Sha1::new();
            hasher.update(&data);
            let got: [u8; 20] = hasher.finalize().into();
            if got == self.piece_hashes[index] {
                bf.set(index, true);
            }
        }
        bf
    }

    fn write_block(&self, piece_index: usize, offset: usize, data: &[u8]) {
        let abs_offset = self.info.piece_byte_offset(piece_index) + offset;
        if let Err(e) = self.write_range(abs_offset, data) {
            tracing::warn!(piece_index, offset, error = %e, "failed to write block to disk");
        }
    }
}
