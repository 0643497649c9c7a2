use std::{ops::Range, path::PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::metainfo::Metainfo;

/// A single file within a (possibly multi-file) torrent, with its byte offset
/// into the torrent treated as one flat address space.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "File")]
pub struct FileInfo {
    #[serde(deserialize_with = "crate::de::path_deserialize")]
    pub path: PathBuf,

    pub length: usize,

    #[serde(skip)]
    pub offset: usize,

    #[serde(default)]
    pub md5sum: Option<String>,
}

impl FileInfo {
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }
}

/// General information about how a torrent's pieces map onto on-disk files.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub total_len: u64,
    pub piece_len: usize,
    pub last_piece_len: usize,
    pub num_pieces: u32,
    pub files: Vec<FileInfo>,
    pub output_dir: PathBuf,
}

impl StoreInfo {
    pub fn new(metainfo: &dyn Metainfo, output_dir: PathBuf) -> Self {
        let total_len = metainfo.total_length();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_length();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let files = metainfo.files();
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        }
    }

    pub fn piece_length(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_byte_offset(&self, piece_idx: usize) -> usize {
        piece_idx * self.piece_len
    }

    /// Maps an absolute byte range of the torrent onto the files it overlaps.
    ///
    /// Each returned tuple is `(file_index, offset_within_file, range_within_buf)`,
    /// in ascending order, so the caller can slice a flat buffer by the third
    /// element while seeking the file named by the first to the second.
    pub fn map_range(&self, abs_offset: usize, len: usize) -> Vec<(usize, usize, Range<usize>)> {
        let end = abs_offset + len;
        let mut out = Vec::new();
        let mut buf_pos = 0;

        for (idx, file) in self.files.iter().enumerate() {
            let range = file.byte_range();
            if range.end <= abs_offset || range.start >= end {
                continue;
            }
            let seg_start = abs_offset.max(range.start);
            let seg_end = end.min(range.end);
            let seg_len = seg_end - seg_start;
            out.push((idx, seg_start - range.start, buf_pos..buf_pos + seg_len));
            buf_pos += seg_len;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(offset: usize, length: usize) -> FileInfo {
        FileInfo { path: PathBuf::from("f"), length, offset, md5sum: None }
    }

    #[test]
    fn test_map_range_single_file() {
        let files = vec![file(0, 100)];
        let info = StoreInfo {
            total_len: 100,
            piece_len: 40,
            last_piece_len: 20,
            num_pieces: 3,
            files,
            output_dir: PathBuf::from("."),
        };
        let mapped = info.map_range(0, 40);
        assert_eq!(mapped, vec![(0, 0, 0..40)]);
    }

    #[test]
    fn test_map_range_crosses_files() {
        // Two files of length 30 each; a piece of length 40 starting at byte 10
        // spans both: bytes 10..30 of file 0, then 0..20 of file 1.
        let files = vec![file(0, 30), file(30, 30)];
        let info = StoreInfo {
            total_len: 60,
            piece_len: 40,
            last_piece_len: 20,
            num_pieces: 2,
            files,
            output_dir: PathBuf::from("."),
        };
        let mapped = info.map_range(10, 40);
        assert_eq!(mapped, vec![(0, 10, 0..20), (1, 0, 20..40)]);
    }
}
