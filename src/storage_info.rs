use std::{ops::Range, path::PathBuf};

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    Bitfield, FileIndex, PieceIndex, Sha1Hash,
};

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the
    /// last bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the range starting at
    /// the given offset.
    ///
    /// # Panics
    ///
    /// This will panic if `torrent_offset` is smaller than the file's
    /// offset in torrent, or if it's past the last byte in file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// The immutable facts about a torrent, derived once from its metainfo and
/// never changed afterwards: info hash, piece layout, and file layout.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The SHA-1 hash of the bencoded `info` dictionary.
    pub info_hash: Sha1Hash,
    /// The expected hash of each piece, in order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple
    /// of the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of single file downloads, this is the directory where the
    /// file is downloaded, named as the torrent. In case of archive
    /// downloads, this directory is the download directory joined by the
    /// torrent's name, so files don't scatter across the download
    /// directory.
    pub download_dir: PathBuf,
    /// The paths and lengths of the torrent files.
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Derives storage information from a torrent's decoded metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Result<Self> {
        let info_hash = metainfo.create_info_hash()?;
        let piece_hashes = metainfo.piece_hashes()?;
        let piece_count = piece_hashes.len();
        if piece_count == 0 {
            return Err(Error::MalformedMetainfo(
                "torrent has no pieces".into(),
            ));
        }
        let piece_len = metainfo.info.piece_length as u32;

        let (structure, download_len) = match &metainfo.info.files {
            None => {
                let len = metainfo.info.length.ok_or_else(|| {
                    Error::MalformedMetainfo(
                        "single-file torrent missing length".into(),
                    )
                })?;
                (
                    FsStructure::File(FileInfo {
                        path: PathBuf::from(&metainfo.info.name),
                        len,
                        torrent_offset: 0,
                    }),
                    len,
                )
            }
            Some(files) => {
                if files.is_empty() {
                    return Err(Error::MalformedMetainfo(
                        "multi-file torrent has no files".into(),
                    ));
                }
                let mut offset = 0;
                let mut infos = Vec::with_capacity(files.len());
                for file in files {
                    let path: PathBuf = file.path.iter().collect();
                    infos.push(FileInfo {
                        path,
                        len: file.length,
                        torrent_offset: offset,
                    });
                    offset += file.length;
                }
                (FsStructure::Archive { files: infos }, offset)
            }
        };

        if download_len == 0 {
            return Err(Error::MalformedMetainfo(
                "torrent download length is zero".into(),
            ));
        }

        let full_piece_count = (download_len / piece_len as u64) as usize;
        let remainder = download_len % piece_len as u64;
        let expected_piece_count = if remainder == 0 {
            full_piece_count
        } else {
            full_piece_count + 1
        };
        if expected_piece_count != piece_count {
            return Err(Error::MalformedMetainfo(format!(
                "metainfo declares {} piece hashes but file lengths imply {}",
                piece_count, expected_piece_count
            )));
        }
        let last_piece_len = if remainder == 0 {
            piece_len
        } else {
            remainder as u32
        };

        // multi-file torrents download into their own named subdirectory so
        // files don't scatter across the download directory; single-file
        // torrents get their own subdirectory too, named after the torrent
        // with its extension stripped, per spec.md §6
        let download_dir = if structure.is_archive() {
            download_dir.join(&metainfo.info.name)
        } else {
            let stem = PathBuf::from(&metainfo.info.name)
                .file_stem()
                .map(|s| s.to_os_string())
                .unwrap_or_else(|| metainfo.info.name.clone().into());
            download_dir.join(stem)
        };

        Ok(Self {
            info_hash,
            piece_hashes,
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure,
        })
    }

    /// Returns the zero-based indices of the files of torrent that
    /// intersect with the piece.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        log::trace!("Returning files intersecting piece {}", index);
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        let files = self
            .structure
            .files_intersecting_bytes(piece_offset..piece_end);
        Ok(files)
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the number of bytes represented by the verified pieces in
    /// `verified`, for reporting the tracker's `left` field precisely
    /// rather than approximating it from a piece count.
    pub fn verified_bytes(&self, verified: &Bitfield) -> u64 {
        let mut bytes = 0u64;
        for index in 0..self.piece_count {
            if verified[index] {
                bytes += self.piece_len(index).unwrap_or(0) as u64;
            }
        }
        bytes
    }
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub(crate) enum FsStructure {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested directories.
    Archive {
        /// A flattened list of all files in the archive, in torrent order.
        files: Vec<FileInfo>,
    },
}

impl FsStructure {
    /// Returns true if the download is for an archive.
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Returns the files that overlap with the given left-inclusive range
    /// of bytes, where `bytes.start` is the offset and `bytes.end` is one
    /// past the last byte offset.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        match self {
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                let first_matching_index = match files
                    .iter()
                    .enumerate()
                    .find(|(_, file)| {
                        file.byte_range().contains(&byte_range.start)
                    })
                    .map(|(index, _)| index)
                {
                    Some(index) => index,
                    None => return 0..0,
                };

                let mut file_range =
                    first_matching_index..first_matching_index + 1;

                for (index, file) in
                    files.iter().enumerate().skip(first_matching_index + 1)
                {
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }
                    file_range.end = index + 1;
                }

                file_range
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn dummy_facts(
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
        download_len: u64,
        structure: FsStructure,
    ) -> StorageInfo {
        StorageInfo {
            info_hash: [0; 20],
            piece_hashes: vec![[0; 20]; piece_count],
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            structure,
        }
    }

    #[test]
    fn test_file_get_slice() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice {
                offset: 300 - 200,
                len: 500 - (300 - 200),
            },
            "file slice for byte range longer than file should return \
            at most file length long slice"
        );

        assert_eq!(
            file.get_slice(300, 10),
            FileSlice {
                offset: 300 - 200,
                len: 10,
            },
            "file slice for byte range smaller than file should return \
            at most byte range long slice"
        );

        assert_eq!(
            file.get_slice(200, 500),
            FileSlice { offset: 0, len: 500 },
            "file slice for byte range equal to file length should return \
            the full file slice"
        );
    }

    #[test]
    #[should_panic(expected = "torrent offset must be larger than file offset")]
    fn test_file_get_slice_starting_before_file() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic(
        expected = "torrent offset must be smaller than file end offset"
    )]
    fn test_file_get_slice_starting_after_file() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        file.get_slice(200 + 500, 400);
    }

    #[test]
    fn test_files_intersecting_pieces() {
        let piece_count = 4;
        let piece_len = 4;
        let last_piece_len = 2;
        let download_len = 3 * 4 + 2;
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: download_len,
        });
        let info = dummy_facts(
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            structure,
        );
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 0..1);

        let files = vec![
            FileInfo { path: PathBuf::from("/0"), torrent_offset: 0, len: 9 },
            FileInfo { path: PathBuf::from("/1"), torrent_offset: 9, len: 11 },
            FileInfo { path: PathBuf::from("/2"), torrent_offset: 20, len: 7 },
            FileInfo { path: PathBuf::from("/3"), torrent_offset: 27, len: 9 },
            FileInfo { path: PathBuf::from("/4"), torrent_offset: 36, len: 12 },
            FileInfo { path: PathBuf::from("/5"), torrent_offset: 48, len: 16 },
            FileInfo { path: PathBuf::from("/6"), torrent_offset: 64, len: 8 },
        ];
        let download_len: u64 = files.iter().map(|f| f.len).sum();
        let piece_count: usize = 5;
        let piece_len: u32 = 16;
        let last_piece_len: u32 = 8;
        debug_assert_eq!(
            (piece_count as u64 - 1) * piece_len as u64 + last_piece_len as u64,
            download_len
        );
        let info = dummy_facts(
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            FsStructure::Archive { files },
        );
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..5);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 5..6);
        assert_eq!(info.files_intersecting_piece(4).unwrap(), 6..7);
        assert!(info.files_intersecting_piece(5).is_err());
    }

    #[test]
    fn test_verified_bytes() {
        let piece_count = 4;
        let piece_len = 4;
        let last_piece_len = 2;
        let download_len = 3 * 4 + 2;
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: download_len,
        });
        let info = dummy_facts(
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            structure,
        );
        let mut verified = Bitfield::with_capacity(piece_count);
        for _ in 0..piece_count {
            verified.push(false);
        }
        assert_eq!(info.verified_bytes(&verified), 0);
        verified.set(0, true);
        assert_eq!(info.verified_bytes(&verified), 4);
        verified.set(3, true);
        assert_eq!(info.verified_bytes(&verified), 4 + 2);
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: 12341234,
        });
        assert_eq!(structure.files_intersecting_bytes(0..0), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..1), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..12341234), 0..1);

        let structure = FsStructure::Archive {
            files: vec![
                FileInfo { path: PathBuf::from("/bogus0"), torrent_offset: 0, len: 4 },
                FileInfo { path: PathBuf::from("/bogus1"), torrent_offset: 4, len: 9 },
                FileInfo { path: PathBuf::from("/bogus2"), torrent_offset: 13, len: 3 },
                FileInfo { path: PathBuf::from("/bogus3"), torrent_offset: 16, len: 10 },
            ],
        };
        assert_eq!(structure.files_intersecting_bytes(0..4), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..5), 0..2);
        assert_eq!(structure.files_intersecting_bytes(0..13), 0..2);
        assert_eq!(structure.files_intersecting_bytes(0..15), 0..3);
        assert_eq!(structure.files_intersecting_bytes(0..18), 0..4);
        assert_eq!(structure.files_intersecting_bytes(25..26), 3..4);
        assert_eq!(structure.files_intersecting_bytes(4..16), 1..3);
        assert_eq!(structure.files_intersecting_bytes(8..14), 1..3);
        assert_eq!(structure.files_intersecting_bytes(13..14), 2..3);
        assert_eq!(structure.files_intersecting_bytes(30..38), 0..0);
    }
}
