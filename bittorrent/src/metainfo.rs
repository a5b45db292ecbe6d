use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use crate::{store::FileInfo, tracker::TrackerAddr};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("missing info dictionary")]
    MissingInfo,

    #[error("invalid piece length, must be positive")]
    InvalidPieceLength,

    #[error("invalid pieces length, must be a non-empty multiple of 20")]
    InvalidPiecesLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has an absolute or traversing path: {0:?}")]
    FileUnsafePath(Vec<String>),

    #[error("empty name")]
    EmptyName,
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
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

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

    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
}

impl MetaInfo {

    /// Parses a `.torrent` file. The info-hash is computed over the exact
    /// byte span of the `info` dictionary as it appeared in `bytes`, never
    /// over a re-encoding, per BEP 3.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MetaInfo, MetaInfoError> {
        let mut metainfo: MetaInfo = bencode::decode_bytes(bytes)?;

        if metainfo.info.pieces.is_empty() || metainfo.info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if metainfo.info.piece_length == 0 {
            return Err(MetaInfoError::InvalidPieceLength);
        }
        if metainfo.info.name.is_empty() {
            return Err(MetaInfoError::EmptyName);
        }
        if let Some(files) = &metainfo.info.files {
            for file in files {
                if file.length == 0 {
                    return Err(MetaInfoError::FileNoSize);
                }
                if file.path.is_empty() {
                    return Err(MetaInfoError::FileEmptyPath);
                }
                if !path_is_safe(&file.path) {
                    return Err(MetaInfoError::FileUnsafePath(file.path.clone()));
                }
            }
        } else if metainfo.info.length.map_or(true, |l| l == 0) {
            return Err(MetaInfoError::FileNoSize);
        }

        let info_span = find_info_span(bytes).ok_or(MetaInfoError::MissingInfo)?;
        metainfo.info_hash = sha1_20(&bytes[info_span]);
        tracing::debug!("metainfo loaded: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }

    pub fn info_hash_hex(&self) -> String { hex::encode(self.info_hash) }

    pub fn name(&self) -> &str { &self.info.name }

    /// Tracker tiers from `announce-list`, falling back to the single
    /// `announce` key. Trackers within a tier are shuffled once here; the
    /// tracker set re-promotes a tracker to the head of its tier on success.
    pub fn tracker_tiers(&self) -> Vec<Vec<TrackerAddr>> {
        if let Some(announce_list) = &self.announce_list {
            announce_list.iter()
                .map(|tier| {
                    let mut tier = tier.clone();
                    tier.shuffle(&mut rand::thread_rng());
                    tier.into_iter().map(TrackerAddr::new).collect()
                })
                .collect()
        } else {
            vec![vec![TrackerAddr::new(self.announce.clone())]]
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let info = FileInfo {
                    path: f.path.iter().collect(),
                    length: f.length as usize,
                    offset,
                    md5sum: f.md5sum.clone(),
                };
                offset += f.length as usize;
                info
            }).collect()
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

/// A path is unsafe if any segment is empty, `.`, `..`, or an absolute root.
fn path_is_safe(segments: &[String]) -> bool {
    segments.iter().all(|s| {
        !s.is_empty()
            && s != ".."
            && s != "."
            && !std::path::Path::new(s).is_absolute()
    })
}

fn sha1_20(data: &[u8]) -> [u8; 20] {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Walks a top-level bencoded dictionary to find the byte range (inclusive
/// of its own framing) of the value stored under the `info` key, without
/// decoding it into any intermediate representation. This keeps the
/// `bencode` crate an opaque dependency while still letting us hash the
/// original bytes, per BEP 3's byte-exact info-hash requirement.
fn find_info_span(buf: &[u8]) -> Option<std::ops::Range<usize>> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    loop {
        if buf.get(pos) == Some(&b'e') {
            return None;
        }
        let (key, key_end) = read_bencode_bytestring(buf, pos)?;
        let value_start = key_end;
        let value_end = skip_bencode_value(buf, value_start)?;
        if key == b"info" {
            return Some(value_start..value_end);
        }
        pos = value_end;
    }
}

fn read_bencode_bytestring(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = buf[pos..].iter().position(|&b| b == b':')? + pos;
    let len: usize = std::str::from_utf8(&buf[pos..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > buf.len() { return None; }
    Some((&buf[start..end], end))
}

fn skip_bencode_value(buf: &[u8], pos: usize) -> Option<usize> {
    match *buf.get(pos)? {
        b'i' => {
            let end = buf[pos..].iter().position(|&b| b == b'e')? + pos;
            Some(end + 1)
        }
        b'l' => {
            let mut cur = pos + 1;
            while buf.get(cur) != Some(&b'e') {
                cur = skip_bencode_value(buf, cur)?;
            }
            Some(cur + 1)
        }
        b'd' => {
            let mut cur = pos + 1;
            while buf.get(cur) != Some(&b'e') {
                let (_, key_end) = read_bencode_bytestring(buf, cur)?;
                cur = skip_bencode_value(buf, key_end)?;
            }
            Some(cur + 1)
        }
        b'0'..=b'9' => {
            let (_, end) = read_bencode_bytestring(buf, pos)?;
            Some(end)
        }
        _ => None,
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v| v.iter().map(|v| v.as_str()).collect()).collect::<Vec<Vec<&str>>>()
            ))
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
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent(name: &str, data: &[u8], piece_length: u32) -> Vec<u8> {
        use sha1::Digest;
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length as usize) {
            let mut hasher = sha1::Sha1::new();
            hasher.update(chunk);
            pieces.extend_from_slice(&hasher.finalize());
        }
        let info = format!(
            "d6:lengthi{}e4:name{}:{}12:piece lengthi{}e6:pieces{}:",
            data.len(), name.len(), name, piece_length, pieces.len(),
        );
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce20:http://tracker.test4:info");
        buf.extend_from_slice(info.as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_and_computes_info_hash() {
        let bytes = single_file_torrent("hello.txt", b"hello", 16384);
        let metainfo = MetaInfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.num_pieces(), 1);
        assert_eq!(metainfo.total_len(), 5);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.name(), "hello.txt");

        // Deterministic byte-for-byte across repeated parses.
        let again = MetaInfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.info_hash(), again.info_hash());
    }

    #[test]
    fn info_hash_is_not_a_re_encoding() {
        // Non-canonical key order inside `info` (private before length) must
        // still hash the bytes exactly as they appear on the wire.
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce4:http4:infod7:privatei1e6:lengthi5e4:name5:a.bin12:piece lengthi16384e6:pieces20:");
        let hash = {
            use sha1::Digest;
            let mut h = sha1::Sha1::new();
            h.update(b"aaaaaaaaaaaaaaaaaaaa");
            h.finalize()
        };
        buf.extend_from_slice(&hash);
        buf.extend_from_slice(b"ee");

        let metainfo = MetaInfo::from_bytes(&buf).unwrap();
        let span = find_info_span(&buf).unwrap();
        let expected = sha1_20(&buf[span]);
        assert_eq!(metainfo.info_hash(), expected);
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        let buf = b"d8:announce4:http4:infod6:lengthi5e4:name5:a.bin12:piece lengthi16384e6:pieces5:abcdeee".to_vec();
        assert!(matches!(MetaInfo::from_bytes(&buf), Err(MetaInfoError::InvalidPiecesLength)));
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(!path_is_safe(&["..".to_string(), "etc".to_string(), "passwd".to_string()]));
        assert!(!path_is_safe(&["/etc".to_string()]));
        assert!(!path_is_safe(&["".to_string()]));
        assert!(path_is_safe(&["sub".to_string(), "file.bin".to_string()]));
    }
}
