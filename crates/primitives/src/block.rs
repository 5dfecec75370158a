//! Block header and block types.

use hybridd_consensus::constants::WITNESS_SCALE_FACTOR;
use hybridd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder, TxFormat};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> [u8; HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.encode_into(&mut encoder);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Block signature; present (possibly empty) on stake networks.
    pub signature: Option<Vec<u8>>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// A block is proof-of-stake when its second transaction is a coinstake.
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions
            .get(1)
            .is_some_and(Transaction::is_coinstake)
    }

    pub fn format(&self) -> TxFormat {
        if self.signature.is_some() {
            TxFormat::Timestamped
        } else {
            TxFormat::Plain
        }
    }

    pub fn encode(&self, with_witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE + self.transactions.len() * 256);
        self.header.encode_into(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder, with_witness);
        }
        if let Some(signature) = &self.signature {
            encoder.write_var_bytes(signature);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8], format: TxFormat) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let count = decoder.read_varint()?;
        let mut transactions = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder, format)?);
        }
        let signature = match format {
            TxFormat::Plain => None,
            TxFormat::Timestamped => Some(decoder.read_var_bytes()?),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            transactions,
            signature,
        })
    }

    /// Serialized size without witness data.
    pub fn stripped_size(&self) -> usize {
        self.encode(false).len()
    }

    pub fn total_size(&self) -> usize {
        self.encode(true).len()
    }

    /// BIP141 block weight.
    pub fn weight(&self) -> u64 {
        let stripped = self.stripped_size() as u64;
        let total = self.total_size() as u64;
        stripped * (WITNESS_SCALE_FACTOR - 1) + total
    }
}
