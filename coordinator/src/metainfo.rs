use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};

use crate::store::FileInfo;
use crate::tracker::TrackerDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,
}

/// The subset of a torrent's metainfo the coordinator needs to drive a download.
///
/// Kept as a trait (rather than a concrete struct) so coordinator tests can
/// exercise the state machine against an in-memory fake with no bencode
/// parsing or filesystem access.
pub trait Metainfo: Send + Sync {
    fn num_pieces(&self) -> u32;
    fn piece_length(&self) -> usize;
    fn total_length(&self) -> u64;
    fn piece_hash(&self, index: usize) -> [u8; 20];
    fn announce_tiers(&self) -> Vec<Vec<TrackerDescriptor>>;
    fn info_hash(&self) -> [u8; 20];
    fn name(&self) -> &str;
    fn is_multi_file(&self) -> bool;
    fn files(&self) -> Vec<FileInfo>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
    pub md5sum: Option<String>,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {
    pub name: String,

    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    #[serde(default)]
    pub md5sum: Option<String>,

    #[serde(default)]
    pub length: Option<u64>,

    #[serde(default)]
    pub files: Option<Vec<File>>,

    #[serde(default)]
    pub private: Option<u8>,

    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,
}

impl Info {
    fn info_hash(&self) -> Result<[u8; 20], MetainfoError> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        let info_data = bencode::encode_to_raw(&self)?;
        hasher.update(info_data);
        Ok(hasher.finalize().into())
    }
}

/// A parsed `.torrent` file, decoded via `bencode` and validated on construction.
#[derive(Deserialize, Clone)]
pub struct BencodeMetainfo {
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    pub info: Info,

    #[serde(skip)]
    pub info_hash: [u8; 20],

    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(rename = "comment")]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
}

impl BencodeMetainfo {
    #[tracing::instrument]
    pub fn from_path<P: AsRef<std::path::Path> + std::fmt::Debug>(
        path: P,
    ) -> Result<BencodeMetainfo, MetainfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetainfoError::InvalidExtension);
        }

        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<BencodeMetainfo, MetainfoError> {
        let mut metainfo: BencodeMetainfo = bencode::decode_bytes(raw)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetainfoError::InvalidPiecesLength);
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo loaded: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::NaiveDateTime::from_timestamp_opt(v, 0)
                .map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl Metainfo for BencodeMetainfo {
    fn num_pieces(&self) -> u32 {
        self.info.pieces.len() as u32 / 20
    }

    fn piece_length(&self) -> usize {
        self.info.piece_length as usize
    }

    fn total_length(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    fn piece_hash(&self, index: usize) -> [u8; 20] {
        let start = index * 20;
        self.info.pieces[start..start + 20].try_into().unwrap()
    }

    fn announce_tiers(&self) -> Vec<Vec<TrackerDescriptor>> {
        if let Some(announce_list) = self.announce_list.clone() {
            announce_list
                .into_iter()
                .map(|mut tier| {
                    tier.shuffle(&mut rand::thread_rng());
                    tier.into_iter().map(TrackerDescriptor::new).collect()
                })
                .collect()
        } else {
            vec![vec![TrackerDescriptor::new(self.announce.clone())]]
        }
    }

    fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    fn name(&self) -> &str {
        &self.info.name
    }

    fn is_multi_file(&self) -> bool {
        self.info.files.is_some()
    }

    fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files
                .iter()
                .map(|f| {
                    let file_info = FileInfo {
                        path: f.path.join("/").into(),
                        length: f.length as usize,
                        offset,
                        md5sum: f.md5sum.clone(),
                    };
                    offset += f.length as usize;
                    file_info
                })
                .collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0) as usize,
                offset: 0,
                md5sum: None,
            }]
        }
    }
}

impl std::fmt::Debug for BencodeMetainfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BencodeMetainfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            .field(
                "announce_list",
                &self.announce_list.as_ref().map(|v| {
                    v.iter()
                        .map(|v| v.iter().map(|v| v.as_str()).collect())
                        .collect::<Vec<Vec<&str>>>()
                }),
            )
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let info = Info {
            name: "freedom.iso".to_string(),
            pieces: vec![7u8; 40],
            piece_length: 32_768,
            md5sum: None,
            length: Some(65_536),
            files: None,
            private: None,
            root_hash: None,
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod6:lengthi65536e4:name11:freedom.iso12:piece lengthi32768e6:pieces40:");
        buf.extend_from_slice(&info.pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_from_bytes() {
        let raw = single_file_torrent();
        let metainfo = BencodeMetainfo::from_bytes(&raw).unwrap();
        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_length(), 32_768);
        assert_eq!(metainfo.total_length(), 65_536);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.name(), "freedom.iso");
        assert_eq!(metainfo.piece_hash(0), [7u8; 20]);
        assert_eq!(metainfo.piece_hash(1), [7u8; 20]);
    }

    #[test]
    fn test_rejects_non_multiple_of_20_pieces() {
        let pieces = vec![1u8; 21];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod6:lengthi16384e4:name1:x12:piece lengthi16384e6:pieces21:");
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        assert!(BencodeMetainfo::from_bytes(&buf).is_err());
    }
}
