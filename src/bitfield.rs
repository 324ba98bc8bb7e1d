use anyhow::Context;

/// One bit per piece, MSB-first within each byte: piece `i` lives in byte
/// `i / 8` at mask `0x80 >> (i % 8)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField(pub Vec<u8>);

impl BitField {
    pub fn new(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn empty(pieces_amount: usize) -> Self {
        Self(vec![0; std::cmp::max(pieces_amount.div_ceil(8), 1)])
    }

    pub fn has(&self, piece: usize) -> bool {
        let Some(byte) = self.0.get(piece / 8) else {
            return false;
        };
        let position = (piece % 8) as u32;

        byte & 1u8.rotate_right(position + 1) != 0
    }

    pub fn add(&mut self, piece: usize) -> anyhow::Result<()> {
        let Some(byte) = self.0.get_mut(piece / 8) else {
            return Err(anyhow::anyhow!("piece {piece} does not exist"));
        };
        let position = (piece % 8) as u32;
        *byte |= 1u8.rotate_right(position + 1);
        Ok(())
    }

    /// Amount of set bits, padding included (padding must stay zero).
    pub fn num_set(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Iterator over indexes of the set bits.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, byte)| {
            (0..8u32).filter_map(move |position| {
                let piece_i = i * 8 + position as usize;
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask != 0).then_some(piece_i)
            })
        })
    }

    /// Make sure that the bitfield is appropriate for given pieces amount.
    /// Fails if there are any 1's after the end or it is too small or too
    /// large to fit given pieces.
    pub fn validate(&self, total_pieces: usize) -> anyhow::Result<()> {
        let bitfield_pieces = self.0.len() * 8;
        let leftover = bitfield_pieces
            .checked_sub(total_pieces)
            .context("bitfield has less capacity than needed")?;
        if leftover >= 8 {
            anyhow::bail!("bitfield is larger than needed")
        }
        for piece in (bitfield_pieces - leftover)..bitfield_pieces {
            anyhow::ensure!(!self.has(piece), "padding bit {piece} is set");
        }
        Ok(())
    }
}

impl From<Vec<u8>> for BitField {
    fn from(value: Vec<u8>) -> Self {
        BitField(value)
    }
}
