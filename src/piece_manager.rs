use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{bail, ensure};

use crate::{
    bitfield::BitField,
    metainfo::Info,
    piece::{Block, DataBlock, Piece, BLOCK_LENGTH},
    storage::{BlockStore, StorageError},
};

/// Owns every [Piece], routes inbound blocks to them and persists verified
/// pieces through the [BlockStore].
///
/// `unfinished` and `finished` stay disjoint and together always cover
/// exactly the torrent's piece index space.
#[derive(Debug)]
pub struct PieceManager {
    num_pieces: usize,
    unfinished: BTreeMap<u32, Piece>,
    finished: BTreeSet<u32>,
    have: BitField,
    store: BlockStore,
    /// Snapshot of unfinished indexes the request stream is walking.
    cycle: VecDeque<u32>,
}

impl PieceManager {
    pub fn new(info: &Info, store: BlockStore) -> Self {
        let num_pieces = info.pieces.len();
        let piece_length = info.piece_length as u64;
        let total_length = info.total_size();
        let mut unfinished = BTreeMap::new();
        for (i, hash) in info.pieces.iter().enumerate() {
            let length = if i == num_pieces - 1 {
                (total_length - (num_pieces as u64 - 1) * piece_length) as u32
            } else {
                info.piece_length
            };
            unfinished.insert(i as u32, Piece::new(i as u32, *hash, length));
        }
        Self {
            num_pieces,
            unfinished,
            finished: BTreeSet::new(),
            have: BitField::empty(num_pieces),
            store,
            cycle: VecDeque::new(),
        }
    }

    /// Pull the next outstanding request.
    ///
    /// The stream walks unfinished pieces in ascending index order and stays
    /// on a piece until every one of its blocks arrived; per-piece queues
    /// recirculate, so unanswered requests come around again. Returns `None`
    /// only once the whole torrent is finished.
    pub fn next_request(&mut self) -> Option<Block> {
        loop {
            if self.unfinished.is_empty() {
                return None;
            }
            if self.cycle.is_empty() {
                self.cycle = self.unfinished.keys().copied().collect();
            }
            let index = *self.cycle.front()?;
            if let Some(piece) = self.unfinished.get_mut(&index) {
                if let Some(request) = piece.next_request() {
                    return Some(request);
                }
            }
            self.cycle.pop_front();
        }
    }

    /// Route one downloaded block. Returns the piece index when this block
    /// completed and verified a piece.
    pub async fn save_block(&mut self, block: DataBlock) -> Result<Option<u32>, StorageError> {
        let index = block.piece;
        if index as usize >= self.num_pieces {
            tracing::warn!("Dropping block for nonexistent piece {index}");
            return Ok(None);
        }
        if self.finished.contains(&index) {
            tracing::warn!("Dropping block for already finished piece {index}");
            return Ok(None);
        }
        let piece = self
            .unfinished
            .get_mut(&index)
            .expect("unfinished and finished cover the piece space");
        piece.save_block(block);
        if !piece.is_complete() {
            return Ok(None);
        }
        if piece.verify() {
            let piece = self.unfinished.remove(&index).unwrap();
            self.finished.insert(index);
            self.have.add(index as usize).unwrap();
            self.store.write_piece(&piece).await?;
            tracing::debug!(
                "Finished piece {index} ({}/{})",
                self.finished.len(),
                self.num_pieces
            );
            Ok(Some(index))
        } else {
            tracing::warn!("Piece {index} failed hash verification, resetting");
            piece.reset();
            Ok(None)
        }
    }

    /// Serve a block request from another peer out of the finished pieces.
    pub async fn get_block(&mut self, block: Block) -> anyhow::Result<DataBlock> {
        ensure!(block.length <= BLOCK_LENGTH, "oversized block request");
        if !self.has_piece(block.piece) {
            bail!("piece {} is not available", block.piece);
        }
        Ok(self.store.read_block(block).await?)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.finished.contains(&index)
    }

    pub fn is_complete(&self) -> bool {
        self.finished.len() == self.num_pieces
    }

    pub fn bitfield(&self) -> &BitField {
        &self.have
    }

    pub fn finished_pieces(&self) -> usize {
        self.finished.len()
    }

    pub fn total_pieces(&self) -> usize {
        self.num_pieces
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sha1::{Digest, Sha1};
    use tracing_test::traced_test;

    use crate::{
        metainfo::{Info, TorrentFile},
        piece::{Block, DataBlock},
        storage::BlockStore,
    };

    use super::PieceManager;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = <Sha1 as Digest>::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Two 3 byte files under one directory, piece length 4: piece 0 spans
    /// the file boundary, piece 1 is the 2 byte tail.
    fn two_file_info() -> Info {
        let mut info = Vec::new();
        info.extend_from_slice(b"d5:filesl");
        info.extend_from_slice(b"d6:lengthi3e4:pathl5:a.txtee");
        info.extend_from_slice(b"d6:lengthi3e4:pathl5:b.txtee");
        info.extend_from_slice(b"e4:name5:album12:piece lengthi4e6:pieces40:");
        info.extend_from_slice(&sha1_of(b"AAAA"));
        info.extend_from_slice(&sha1_of(b"BB"));
        info.extend_from_slice(b"e");

        let mut torrent = Vec::new();
        torrent.extend_from_slice(b"d8:announce9:http://t/4:info");
        torrent.extend_from_slice(&info);
        torrent.extend_from_slice(b"e");
        TorrentFile::from_bytes(&torrent).unwrap().info
    }

    async fn manager_in(dir: &std::path::Path) -> PieceManager {
        let info = two_file_info();
        let store = BlockStore::new(&info.output_files(dir), info.piece_length)
            .await
            .unwrap();
        PieceManager::new(&info, store)
    }

    #[tokio::test]
    async fn requests_walk_pieces_in_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path()).await;

        // the stream stays on piece 0 while it is unanswered
        assert_eq!(manager.next_request().unwrap().piece, 0);
        assert_eq!(manager.next_request().unwrap().piece, 0);

        let finished = manager
            .save_block(DataBlock::new(0, 0, Bytes::from_static(b"AAAA")))
            .await
            .unwrap();
        assert_eq!(finished, Some(0));

        let request = manager.next_request().unwrap();
        assert_eq!((request.piece, request.offset, request.length), (1, 0, 2));

        let finished = manager
            .save_block(DataBlock::new(1, 0, Bytes::from_static(b"BB")))
            .await
            .unwrap();
        assert_eq!(finished, Some(1));
        assert!(manager.is_complete());
        assert_eq!(manager.next_request(), None);

        assert_eq!(
            std::fs::read(dir.path().join("album/a.txt")).unwrap(),
            b"AAA"
        );
        assert_eq!(
            std::fs::read(dir.path().join("album/b.txt")).unwrap(),
            b"ABB"
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn save_block_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path()).await;

        let block = DataBlock::new(0, 0, Bytes::from_static(b"AAAA"));
        assert_eq!(manager.save_block(block.clone()).await.unwrap(), Some(0));
        assert_eq!(manager.save_block(block).await.unwrap(), None);
        assert_eq!(manager.finished_pieces(), 1);
        assert!(manager.has_piece(0));
        assert!(!manager.has_piece(1));
    }

    #[tokio::test]
    #[traced_test]
    async fn stray_blocks_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path()).await;
        assert_eq!(
            manager
                .save_block(DataBlock::new(9, 0, Bytes::from_static(b"AAAA")))
                .await
                .unwrap(),
            None
        );
        assert_eq!(manager.finished_pieces(), 0);
    }

    #[tokio::test]
    async fn failed_verification_resets_the_piece() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path()).await;

        assert_eq!(
            manager
                .save_block(DataBlock::new(0, 0, Bytes::from_static(b"XXXX")))
                .await
                .unwrap(),
            None
        );
        assert!(!manager.has_piece(0));
        // the piece went back to the stream with a regenerated queue
        let request = manager.next_request().unwrap();
        assert_eq!((request.piece, request.offset), (0, 0));

        assert_eq!(
            manager
                .save_block(DataBlock::new(0, 0, Bytes::from_static(b"AAAA")))
                .await
                .unwrap(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn serves_finished_blocks_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path()).await;
        let request = Block {
            piece: 0,
            offset: 0,
            length: 4,
        };
        assert!(manager.get_block(request).await.is_err());

        manager
            .save_block(DataBlock::new(0, 0, Bytes::from_static(b"AAAA")))
            .await
            .unwrap();
        let block = manager.get_block(request).await.unwrap();
        assert_eq!(block.block, Bytes::from_static(b"AAAA"));
    }
}
