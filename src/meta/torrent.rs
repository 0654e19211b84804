//! Torrent meta file generation.
//!
//! Builds the standard single-file dictionary: an `info` block with
//! `name`, `length`, `piece length` and the concatenated SHA1 piece
//! hashes, plus the optional tracker, DHT, web-seed and encoding keys.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::error::MetaError;
use crate::meta::bencode::{BValue, encode};

/// Declarative description of the torrent to generate.
pub struct TorrentBuilder {
    name: String,
    piece_length: u64,
    announce: Option<String>,
    announce_tiers: Vec<Vec<String>>,
    nodes: Vec<(String, u16)>,
    http_seeds: Vec<String>,
    url_list: Vec<String>,
    private: bool,
    encoding: Option<String>,
}

impl TorrentBuilder {
    #[must_use]
    pub fn new(name: &str, piece_length: u64) -> Self {
        Self {
            name: name.to_owned(),
            piece_length,
            announce: None,
            announce_tiers: Vec::new(),
            nodes: Vec::new(),
            http_seeds: Vec::new(),
            url_list: Vec::new(),
            private: false,
            encoding: None,
        }
    }

    #[must_use]
    pub fn announce(mut self, url: &str) -> Self {
        self.announce = Some(url.to_owned());
        self
    }

    #[must_use]
    pub fn announce_tier(mut self, urls: Vec<String>) -> Self {
        self.announce_tiers.push(urls);
        self
    }

    #[must_use]
    pub fn node(mut self, address: &str, port: u16) -> Self {
        self.nodes.push((address.to_owned(), port));
        self
    }

    #[must_use]
    pub fn http_seed(mut self, url: &str) -> Self {
        self.http_seeds.push(url.to_owned());
        self
    }

    #[must_use]
    pub fn web_seed(mut self, url: &str) -> Self {
        self.url_list.push(url.to_owned());
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    #[must_use]
    pub fn encoding(mut self, value: &str) -> Self {
        self.encoding = Some(value.to_owned());
        self
    }

    /// Build the bencoded torrent for an in-memory payload.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::PieceLengthZero`] when the piece length is zero.
    pub fn build_from_bytes(&self, data: &[u8]) -> Result<Vec<u8>, MetaError> {
        let piece_length = usize::try_from(self.piece_length)
            .ok()
            .filter(|length| *length > 0)
            .ok_or(MetaError::PieceLengthZero)?;
        let mut pieces = Vec::new();
        for piece in data.chunks(piece_length) {
            let hash: [u8; 20] = Sha1::digest(piece).into();
            pieces.extend_from_slice(&hash);
        }
        let length = i64::try_from(data.len()).unwrap_or(i64::MAX);
        Ok(encode(&self.dictionary(length, pieces)))
    }

    /// Build the bencoded torrent for a payload file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::PieceLengthZero`] for a zero piece length and
    /// [`MetaError::ReadFile`] on I/O errors.
    pub fn build_from_file(&self, path: &Path) -> Result<Vec<u8>, MetaError> {
        let mut file = File::open(path).map_err(|source| MetaError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|source| MetaError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        self.build_from_bytes(&data)
    }

    fn dictionary(&self, length: i64, pieces: Vec<u8>) -> BValue {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), BValue::Int(length));
        info.insert(b"name".to_vec(), BValue::text(&self.name));
        info.insert(
            b"piece length".to_vec(),
            BValue::Int(i64::try_from(self.piece_length).unwrap_or(i64::MAX)),
        );
        info.insert(b"pieces".to_vec(), BValue::Bytes(pieces));
        if self.private {
            info.insert(b"private".to_vec(), BValue::Int(1));
        }

        let mut top = BTreeMap::new();
        if let Some(ref announce) = self.announce {
            top.insert(b"announce".to_vec(), BValue::text(announce));
        }
        if !self.announce_tiers.is_empty() {
            let tiers = self
                .announce_tiers
                .iter()
                .map(|tier| BValue::List(tier.iter().map(|url| BValue::text(url)).collect()))
                .collect();
            top.insert(b"announce-list".to_vec(), BValue::List(tiers));
        }
        if !self.nodes.is_empty() {
            let nodes = self
                .nodes
                .iter()
                .map(|(address, port)| {
                    BValue::List(vec![BValue::text(address), BValue::Int(i64::from(*port))])
                })
                .collect();
            top.insert(b"nodes".to_vec(), BValue::List(nodes));
        }
        if !self.http_seeds.is_empty() {
            let seeds = self.http_seeds.iter().map(|url| BValue::text(url)).collect();
            top.insert(b"httpseeds".to_vec(), BValue::List(seeds));
        }
        if !self.url_list.is_empty() {
            let seeds = self.url_list.iter().map(|url| BValue::text(url)).collect();
            top.insert(b"url-list".to_vec(), BValue::List(seeds));
        }
        if let Some(ref encoding) = self.encoding {
            top.insert(b"encoding".to_vec(), BValue::text(encoding));
        }
        top.insert(b"info".to_vec(), BValue::Dict(info));
        BValue::Dict(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};
    use crate::meta::bencode::decode;

    fn dict_entries(value: &BValue) -> AppResult<&BTreeMap<Vec<u8>, BValue>> {
        match value {
            BValue::Dict(entries) => Ok(entries),
            BValue::Int(_) | BValue::Bytes(_) | BValue::List(_) => {
                Err(AppError::meta("Expected a dictionary"))
            }
        }
    }

    #[test]
    fn builds_a_well_formed_torrent() -> AppResult<()> {
        let data = vec![5_u8; 3000];
        let encoded = TorrentBuilder::new("payload", 1024)
            .announce("http://tracker:6969/announce")
            .web_seed("http://seed/payload")
            .private()
            .encoding("UTF-8")
            .build_from_bytes(&data)?;
        let value = decode(&encoded)?;
        let top = dict_entries(&value)?;
        if !top.contains_key(b"announce".as_slice()) || !top.contains_key(b"url-list".as_slice()) {
            return Err(AppError::meta("Missing tracker or web seed keys"));
        }
        let info = dict_entries(
            top.get(b"info".as_slice())
                .ok_or_else(|| AppError::meta("Missing info dictionary"))?,
        )?;
        match info.get(b"pieces".as_slice()) {
            Some(BValue::Bytes(pieces)) => {
                // 3000 bytes in 1024-byte pieces: three hashes.
                if pieces.len() != 60 {
                    return Err(AppError::meta("Wrong piece hash count"));
                }
            }
            Some(_) | None => return Err(AppError::meta("Missing piece hashes")),
        }
        if !matches!(info.get(b"private".as_slice()), Some(BValue::Int(1))) {
            return Err(AppError::meta("Private flag missing"));
        }
        if !matches!(info.get(b"length".as_slice()), Some(BValue::Int(3000))) {
            return Err(AppError::meta("Wrong payload length"));
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_piece_length() {
        let result = TorrentBuilder::new("payload", 0).build_from_bytes(&[1, 2, 3]);
        assert!(matches!(result, Err(MetaError::PieceLengthZero)));
    }

    #[test]
    fn torrent_survives_a_decode_encode_cycle() -> AppResult<()> {
        let encoded = TorrentBuilder::new("payload", 512)
            .announce_tier(vec!["http://a/announce".to_owned()])
            .node("router.example", 6881)
            .build_from_bytes(&[9_u8; 700])?;
        let recoded = crate::meta::bencode::encode(&decode(&encoded)?);
        if recoded != encoded {
            return Err(AppError::meta("Torrent bytes changed in a cycle"));
        }
        Ok(())
    }
}
