//! Meta file support: bencode, Merkle root hashes and torrent generation.

pub mod bencode;
pub mod roothash;
pub mod torrent;

pub use bencode::{BValue, decode, encode};
pub use roothash::{RootHashBuilder, is_root_hash, root_hash_of_bytes, root_hash_of_file};
pub use torrent::TorrentBuilder;
