//! Decodes a torrent's bencoded metainfo file into a typed structure and
//! derives the info hash from it.

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

/// The root of a decoded `.torrent` file.
///
/// Only the `info` dictionary is modeled; the handful of other top-level
/// keys a metainfo file may carry (`announce`, `announce-list`, `comment`,
/// ...) are read separately by [`Metainfo::trackers`] rather than folded
/// into this type, since they play no part in the info hash.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the torrent's info hash: the SHA-1 digest of the bencoded
    /// `info` dictionary, re-encoded exactly as it appeared in the file.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Flattens `announce` and `announce-list` into the tracker URL order
    /// this client tries them in: `announce` first, then the first tier's
    /// first URL (skipped if it duplicates `announce`), then every
    /// subsequent tier's first URL appended unconditionally, duplicates and
    /// all.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            let mut tiers = tiers.iter();
            if let Some(first_tier) = tiers.next() {
                if let Some(first) = first_tier.first() {
                    if !urls.contains(first) {
                        urls.push(first.clone());
                    }
                }
            }
            for tier in tiers {
                if let Some(first) = tier.first() {
                    urls.push(first.clone());
                }
            }
        }
        urls
    }

    /// Splits `info.pieces` into its individual 20-byte SHA-1 digests.
    ///
    /// Fails with [`Error::MalformedMetainfo`] if the buffer's length isn't
    /// a multiple of 20.
    pub fn piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
        if self.info.pieces.len() % 20 != 0 {
            return Err(Error::MalformedMetainfo(format!(
                "pieces field is {} bytes, not a multiple of 20",
                self.info.pieces.len()
            )));
        }
        Ok(self
            .info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        // a minimal single-file metainfo with one 4-byte piece
        b"d8:announce17:udp://tracker:804:infod6:lengthi4e4:name4:file12:piece lengthi4e6:pieces20:\
          \x01\x02\x03\x04\x05\x06\x07\x08\x09\x10\x11\x12\x13\x14\x15\x16\x17\x18\x19\x20ee"
            .to_vec()
    }

    #[test]
    fn decodes_info_hash_deterministically() {
        let metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        let a = metainfo.create_info_hash().unwrap();
        let b = metainfo.create_info_hash().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_piece_buffer_not_multiple_of_twenty() {
        let mut metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        metainfo.info.pieces.push(0xff);
        assert!(matches!(
            metainfo.piece_hashes(),
            Err(Error::MalformedMetainfo(_))
        ));
    }

    #[test]
    fn flattens_announce_and_announce_list() {
        let mut metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        metainfo.announce_list = Some(vec![
            vec!["udp://tracker:80".to_string(), "udp://backup:80".to_string()],
            vec!["udp://tier2:80".to_string()],
        ]);
        let trackers = metainfo.trackers();
        assert_eq!(
            trackers,
            vec![
                "udp://tracker:80".to_string(),
                "udp://tier2:80".to_string()
            ]
        );
    }

    #[test]
    fn only_the_first_tier_is_deduplicated_against_announce() {
        // `announce` duplicates the first tier's first URL, so it's skipped
        // there, but a later tier's first URL that also happens to repeat
        // an earlier entry must still be appended unconditionally.
        let mut metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        metainfo.announce = Some("udp://tracker:80".to_string());
        metainfo.announce_list = Some(vec![
            vec!["udp://tracker:80".to_string()],
            vec!["udp://tracker:80".to_string()],
        ]);
        let trackers = metainfo.trackers();
        assert_eq!(
            trackers,
            vec![
                "udp://tracker:80".to_string(),
                "udp://tracker:80".to_string(),
            ]
        );
    }
}
