use std::{io::SeekFrom, num::NonZeroUsize, path::PathBuf};

use bytes::BytesMut;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{
    metainfo::OutputFile,
    piece::{Block, DataBlock, Piece, PieceState},
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("span of {wanted} bytes at offset {offset} runs past the end of the torrent")]
    ShortRead { offset: u64, wanted: usize },
    #[error("piece {0} was not verified before persisting")]
    Unverified(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cache of opened file handles
#[derive(Debug)]
struct FileHandles {
    opened_files: lru::LruCache<usize, fs::File>,
}

impl FileHandles {
    fn new() -> Self {
        Self {
            opened_files: lru::LruCache::new(NonZeroUsize::new(10).unwrap()),
        }
    }
}

#[derive(Debug, Clone)]
struct StorageFile {
    offset: u64,
    length: u64,
    path: PathBuf,
}

impl StorageFile {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Maps the flat byte space of the torrent onto the output file table.
///
/// Construction materializes every file at its declared length, so reads
/// inside the byte space never come up short.
#[derive(Debug)]
pub struct BlockStore {
    files: Box<[StorageFile]>,
    piece_length: u64,
    total_length: u64,
    handles: FileHandles,
}

impl BlockStore {
    pub async fn new(output_files: &[OutputFile], piece_length: u32) -> Result<Self, StorageError> {
        let mut files = Vec::with_capacity(output_files.len());
        let mut offset = 0;
        for file in output_files {
            if let Some(parent) = file.path().parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(file.path())
                .await?;
            handle.set_len(file.length()).await?;
            files.push(StorageFile {
                offset,
                length: file.length(),
                path: file.path().clone(),
            });
            offset += file.length();
        }
        Ok(Self {
            files: files.into_boxed_slice(),
            piece_length: piece_length as u64,
            total_length: offset,
            handles: FileHandles::new(),
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Read one block out of the preallocated files, crossing file
    /// boundaries when the piece straddles them.
    pub async fn read_block(&mut self, block: Block) -> Result<DataBlock, StorageError> {
        let start = block.piece as u64 * self.piece_length + block.offset as u64;
        let mut bytes = BytesMut::zeroed(block.length as usize);
        self.read_span(start, &mut bytes).await?;
        Ok(DataBlock::new(block.piece, block.offset, bytes.freeze()))
    }

    /// Persist a verified piece, flushing each file as its last byte is
    /// written.
    pub async fn write_piece(&mut self, piece: &Piece) -> Result<(), StorageError> {
        if piece.state() != PieceState::Verified {
            return Err(StorageError::Unverified(piece.index()));
        }
        let start = piece.index() as u64 * self.piece_length;
        let data = piece.assemble();
        self.write_span(start, &data).await
    }

    async fn read_span(&mut self, start: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        let mut cursor = start;
        while !buf.is_empty() {
            let file_idx = self.file_at(cursor).ok_or(StorageError::ShortRead {
                offset: cursor,
                wanted: buf.len(),
            })?;
            let (file_offset, file_length) = {
                let file = &self.files[file_idx];
                (file.offset, file.length)
            };
            let within = cursor - file_offset;
            let n = std::cmp::min(buf.len() as u64, file_length - within) as usize;
            let file = self.handle(file_idx).await?;
            file.seek(SeekFrom::Start(within)).await?;
            file.read_exact(&mut buf[..n]).await?;
            cursor += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }

    async fn write_span(&mut self, start: u64, mut data: &[u8]) -> Result<(), StorageError> {
        let mut cursor = start;
        while !data.is_empty() {
            let file_idx = self.file_at(cursor).ok_or(StorageError::ShortRead {
                offset: cursor,
                wanted: data.len(),
            })?;
            let (file_offset, file_length) = {
                let file = &self.files[file_idx];
                (file.offset, file.length)
            };
            let within = cursor - file_offset;
            let n = std::cmp::min(data.len() as u64, file_length - within) as usize;
            let file = self.handle(file_idx).await?;
            file.seek(SeekFrom::Start(within)).await?;
            file.write_all(&data[..n]).await?;
            if within + n as u64 == file_length || n == data.len() {
                file.sync_data().await?;
            }
            cursor += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Index of the file containing the given absolute offset. Zero length
    /// files never contain anything.
    fn file_at(&self, offset: u64) -> Option<usize> {
        self.files
            .iter()
            .position(|file| offset >= file.offset && offset < file.end())
    }

    async fn handle(&mut self, file_idx: usize) -> Result<&mut fs::File, StorageError> {
        if !self.handles.opened_files.contains(&file_idx) {
            let path = self.files[file_idx].path.clone();
            tracing::debug!("Creating file handle: {}", path.display());
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .await?;
            self.handles.opened_files.put(file_idx, file);
        }
        Ok(self.handles.opened_files.get_mut(&file_idx).unwrap())
    }
}
