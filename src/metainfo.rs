use std::{
    fmt::Display,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use serde::{de::Visitor, Deserialize};
use sha1::{Digest, Sha1};

/// Parsed .torrent file. Only the keys the engine consumes are kept.
#[derive(Debug)]
pub struct TorrentFile {
    pub announce: String,
    pub info: Info,
}

impl bendy::decoding::FromBencode for TorrentFile {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        use bendy::decoding::Error;
        use bendy::decoding::FromBencode;
        use bendy::decoding::ResultExt;

        let mut announce = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some((tag, value)) = dict_dec.next_pair()? {
            match tag {
                b"announce" => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                b"info" => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {
                    tracing::trace!(
                        "Skipping .torrent file field: {}",
                        String::from_utf8_lossy(tag)
                    );
                }
            }
        }

        let announce = announce.ok_or_else(|| Error::missing_field("announce"))?;
        let info = info.ok_or_else(|| Error::missing_field("info"))?;

        Ok(Self { announce, info })
    }
}

impl TorrentFile {
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        bendy::decoding::FromBencode::from_bencode(bytes.as_ref())
            .map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }
}

/// Representation of a single file when [SizeDescriptor] variant is Files
#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeDescriptor {
    Files(Vec<File>),
    Length(u64),
}

/// Torrent output file that is normalized and safe against path attack
#[derive(Clone, Debug)]
pub struct OutputFile {
    length: u64,
    path: PathBuf,
}

impl OutputFile {
    pub fn new(length: u64, path: PathBuf) -> Self {
        Self { length, path }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Info dictionary is a unique descriptor of the particular torrent.
/// Sha1 hash of the raw info dictionary is the torrent's identity.
#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    #[serde(skip)]
    pub raw: Bytes,
    #[serde(flatten)]
    pub file_descriptor: SizeDescriptor,
    /// In the single file case the name of the file, in the multiple file
    /// case the name of the containing directory.
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: Hashes,
}

impl bendy::decoding::FromBencode for Info {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        let dict_dec = object.try_into_dictionary()?;
        let raw = Bytes::copy_from_slice(dict_dec.into_raw()?);

        let mut info: Info = serde_bencode::from_bytes(&raw)?;
        info.raw = raw;
        Ok(info)
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(
            f,
            "Pieces: {} x {} bytes, {} bytes total",
            self.pieces.len(),
            self.piece_length,
            self.total_size()
        )?;
        let output_files = self.output_files("");
        writeln!(f, "Files ({}):", output_files.len())?;
        for file in output_files {
            writeln!(f, "   {}: {} bytes", file.path.display(), file.length())?;
        }
        Ok(())
    }
}

impl Info {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bendy::decoding::FromBencode::from_bencode(bytes).map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn total_size(&self) -> u64 {
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files.iter().map(|f| f.length).sum(),
            SizeDescriptor::Length(length) => *length,
        }
    }

    pub fn output_files(&self, output_dir: impl AsRef<Path>) -> Vec<OutputFile> {
        let base = output_dir.as_ref().join(&self.name);
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files
                .iter()
                .map(|f| {
                    OutputFile::new(
                        f.length,
                        base.join(sanitize_path(PathBuf::from_iter(f.path.iter()))),
                    )
                })
                .collect(),
            SizeDescriptor::Length(length) => {
                vec![OutputFile::new(*length, base)]
            }
        }
    }

    pub fn hash(&self) -> [u8; 20] {
        let mut hasher = <Sha1 as Digest>::new();
        hasher.update(&self.raw);
        hasher.finalize().into()
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(self.hash())
    }
}

/// List of piece hashes
#[derive(Debug, Clone)]
pub struct Hashes(pub Arc<[[u8; 20]]>);

impl Hashes {
    pub fn get_hash(&self, piece: usize) -> Option<&[u8; 20]> {
        self.0.get(piece)
    }
}

impl Deref for Hashes {
    type Target = [[u8; 20]];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

struct HashesVisitor;

impl Visitor<'_> for HashesVisitor {
    type Value = Hashes;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("byte string with a length divisible by 20")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if v.len() % 20 != 0 {
            return Err(serde::de::Error::custom(
                "pieces payload is not a multiple of 20 bytes long",
            ));
        }
        let chunks = v
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().unwrap())
            .collect();
        Ok(Hashes(chunks))
    }
}

impl<'de> Deserialize<'de> for Hashes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_bytes(HashesVisitor)
    }
}

/// Prevent traversal attack on path by ignoring suspicious components
fn sanitize_path(path: PathBuf) -> PathBuf {
    use std::path::Component;
    let mut normalized_path = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) => {
                tracing::warn!("Path starts with prefix component");
            }
            Component::RootDir => {
                tracing::warn!("Path starts with root directory component");
            }
            Component::CurDir | Component::ParentDir => {
                tracing::warn!("Path contains relative directory component");
            }
            Component::Normal(component) => normalized_path.push(component),
        }
    }
    normalized_path
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use sha1::{Digest, Sha1};

    use super::TorrentFile;

    fn single_file_info(name: &str, length: u64, piece_length: u32, hashes: &[[u8; 20]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"d");
        out.extend_from_slice(format!("6:lengthi{length}e").as_bytes());
        out.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
        out.extend_from_slice(format!("12:piece lengthi{piece_length}e").as_bytes());
        out.extend_from_slice(format!("6:pieces{}:", hashes.len() * 20).as_bytes());
        for hash in hashes {
            out.extend_from_slice(hash);
        }
        out.extend_from_slice(b"e");
        out
    }

    fn multi_file_info(
        name: &str,
        files: &[(u64, &str)],
        piece_length: u32,
        hashes: &[[u8; 20]],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"d5:filesl");
        for (length, path) in files {
            out.extend_from_slice(
                format!("d6:lengthi{length}e4:pathl{}:{}ee", path.len(), path).as_bytes(),
            );
        }
        out.extend_from_slice(b"e");
        out.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
        out.extend_from_slice(format!("12:piece lengthi{piece_length}e").as_bytes());
        out.extend_from_slice(format!("6:pieces{}:", hashes.len() * 20).as_bytes());
        for hash in hashes {
            out.extend_from_slice(hash);
        }
        out.extend_from_slice(b"e");
        out
    }

    fn torrent_file(announce: &str, info: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"d");
        out.extend_from_slice(format!("8:announce{}:{}", announce.len(), announce).as_bytes());
        out.extend_from_slice(b"4:info");
        out.extend_from_slice(info);
        out.extend_from_slice(b"e");
        out
    }

    #[test]
    fn parse_single_file_torrent() {
        let hash = [0xAB; 20];
        let info = single_file_info("sample.bin", 92063, 32768, &[hash, hash, hash]);
        let bytes = torrent_file("http://tracker.local/announce", &info);

        let torrent = TorrentFile::from_bytes(&bytes).unwrap();
        assert_eq!(torrent.announce, "http://tracker.local/announce");
        assert_eq!(torrent.info.name, "sample.bin");
        assert_eq!(torrent.info.piece_length, 32768);
        assert_eq!(torrent.info.total_size(), 92063);
        assert_eq!(torrent.info.pieces.len(), 3);
        assert_eq!(torrent.info.pieces[1], hash);

        let files = torrent.info.output_files("downloads");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path(), &PathBuf::from("downloads/sample.bin"));
        assert_eq!(files[0].length(), 92063);
    }

    #[test]
    fn info_hash_covers_raw_dict() {
        let info = single_file_info("a", 1, 16384, &[[0; 20]]);
        let bytes = torrent_file("http://t/", &info);
        let torrent = TorrentFile::from_bytes(&bytes).unwrap();

        let mut hasher = <Sha1 as Digest>::new();
        hasher.update(&info);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(torrent.info.hash(), expected);
        assert_eq!(torrent.info.hex_hash(), hex::encode(expected));
    }

    #[test]
    fn parse_multi_file_torrent() {
        let info = multi_file_info("album", &[(3, "a.txt"), (3, "b.txt")], 4, &[[1; 20], [2; 20]]);
        let bytes = torrent_file("http://t/", &info);
        let torrent = TorrentFile::from_bytes(&bytes).unwrap();

        assert_eq!(torrent.info.total_size(), 6);
        let files = torrent.info.output_files("dl");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path(), &PathBuf::from("dl/album/a.txt"));
        assert_eq!(files[1].path(), &PathBuf::from("dl/album/b.txt"));
    }

    #[test]
    fn traversal_components_are_dropped() {
        let info = multi_file_info("x", &[(1, "evil")], 1, &[[0; 20]]);
        // splice a hostile path in by hand
        let bytes = torrent_file(
            "http://t/",
            &String::from_utf8(info)
                .unwrap()
                .replace("l4:evile", "l2:..4:evile")
                .into_bytes(),
        );
        let torrent = TorrentFile::from_bytes(&bytes).unwrap();
        let files = torrent.info.output_files("dl");
        assert_eq!(files[0].path(), &PathBuf::from("dl/x/evil"));
    }

    #[test]
    fn rejects_truncated_pieces() {
        let mut info = single_file_info("a", 1, 16384, &[[0; 20]]);
        // shrink the pieces payload to 19 bytes
        let pieces_pos = info.windows(9).position(|w| w == b"6:pieces2").unwrap();
        info.splice(pieces_pos..info.len() - 1, b"6:pieces3:abc".iter().copied());
        let bytes = torrent_file("http://t/", &info);
        assert!(TorrentFile::from_bytes(&bytes).is_err());
    }
}
