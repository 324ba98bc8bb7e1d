//! BitTorrent (BEP-3) peer engine: wire protocol, piece assembly pipeline and
//! the swarm scheduler that drives many peer sessions toward a hash-checked
//! download.

pub mod bitfield;
pub mod metainfo;
pub mod peers;
pub mod piece;
pub mod piece_manager;
pub mod progress;
pub mod protocol;
pub mod storage;
pub mod swarm;
pub mod tracker;

pub use bitfield::BitField;
pub use metainfo::{Info, TorrentFile};
pub use piece::{Block, DataBlock, BLOCK_LENGTH};
pub use piece_manager::PieceManager;
pub use progress::{DownloadProgress, DownloadState, ProgressConsumer};
pub use storage::BlockStore;
pub use swarm::{ClientConfig, Swarm, SwarmHandle};
pub use tracker::{DirectPeers, HttpTracker, PeerFinder, PeerInfo};
