use std::{path::PathBuf, ops::Range};
use serde_derive::{Deserialize, Serialize};
use crate::metainfo::MetaInfo;

// File information deserialised from metainfo.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "File")]
pub struct FileInfo {

    // A list containing one or more string elements that together represent the path and filename
    #[serde(deserialize_with = "crate::de::path_deserialize")]
    pub path: PathBuf,

    // Length of the file in bytes (integer)
    pub length: usize,

    // Offset in bytes from start of torrent when viewed as single array.
    #[serde(skip)]
    pub offset: usize,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file
    #[serde(default)]
    pub md5sum: Option<String>,

}

impl FileInfo {
    // Byte index range for whole torrent, end-exclusive.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }

    pub fn last_byte(&self) -> usize {
        self.offset + self.length
    }
}

// Contains general information on torrent storage.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, will be < piece_length.
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: u32,

    // File contained in torrent.
    pub files: Vec<FileInfo>,

    // Directory to store downloaded files.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
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

    // Returns length of piece given its index.
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

    // Returns the indexes of the first and last file that a piece intersects.
    pub fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        debug_assert!(piece_idx < self.num_pieces as usize, "piece index out of bounds");

        // If only one file, there are no intersections to compute.
        if self.files.len() == 1 {
            return 0..1;
        }

        let offset = piece_idx * self.piece_len;
        let end = offset + self.piece_length(piece_idx) - 1;

        let start_file = self.files
            .iter()
            .position(|f| f.byte_range().contains(&offset))
            .expect("piece byte offset exceeds file length");

        let end_file = self.files[start_file..]
            .iter()
            .position(|f| f.byte_range().contains(&end))
            .map(|idx| start_file + idx)
            .expect("piece last byte exceeds torrent length");

        start_file..(end_file + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_file_torrent() -> (MetaInfo, StoreInfo) {
        use sha1::Digest;
        // Two files, 10 and 6 bytes, piece length 8: pieces span the file
        // boundary at byte 10.
        let data_a = vec![b'a'; 10];
        let data_b = vec![b'b'; 6];
        let mut whole = data_a.clone();
        whole.extend_from_slice(&data_b);

        let piece_length = 8usize;
        let mut pieces = Vec::new();
        for chunk in whole.chunks(piece_length) {
            let mut hasher = sha1::Sha1::new();
            hasher.update(chunk);
            pieces.extend_from_slice(&hasher.finalize());
        }

        let files_dict = "d6:lengthi10e4:pathl1:a1:ee6:lengthi6e4:pathl1:bee";
        let info = format!(
            "d5:filesl{}e4:name5:multi12:piece lengthi{}e6:pieces{}:",
            files_dict, piece_length, pieces.len(),
        );
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce20:http://tracker.test4:info");
        buf.extend_from_slice(info.as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let metainfo = MetaInfo::from_bytes(&buf).unwrap();
        let store_info = StoreInfo::new(&metainfo, PathBuf::from("dest"));
        (metainfo, store_info)
    }

    #[test]
    fn piece_file_intersections_spans_boundary() {
        let (_, store_info) = two_file_torrent();
        // Piece 1 covers bytes [8, 16), crossing the 10-byte boundary between
        // file a and file b.
        let intersections = store_info.piece_file_intersections(1);
        assert_eq!(intersections, 0..2);
    }

    #[test]
    fn piece_file_intersections_single_file_each_piece() {
        let (_, store_info) = two_file_torrent();
        // Piece 0 covers bytes [0, 8), entirely within file a.
        assert_eq!(store_info.piece_file_intersections(0), 0..1);
    }

    #[test]
    fn last_piece_length_is_remainder() {
        let (_, store_info) = two_file_torrent();
        assert_eq!(store_info.total_len, 16);
        assert_eq!(store_info.num_pieces, 2);
        assert_eq!(store_info.piece_length(1), 8);
    }
}
