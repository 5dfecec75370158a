//! Transactions with optional stake timestamps and segregated witness data.

use hybridd_consensus::money::Amount;
use hybridd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder, TxFormat};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

const WITNESS_MARKER: u8 = 0x00;
const WITNESS_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self::new(prevout, script_sig, sequence))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The zero-value, empty-script marker output used by stake transactions.
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self::new(value, script_pubkey))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    /// Present on stake networks, where every transaction is timestamped.
    pub time: Option<u32>,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// A coinstake spends a real output and marks itself with an empty first output.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    /// Sum of output values, `None` on overflow.
    pub fn total_out(&self) -> Option<Amount> {
        self.vout
            .iter()
            .try_fold(0i64, |acc, output| acc.checked_add(output.value))
    }

    pub fn encode(&self, with_witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(64 + self.vin.len() * 48 + self.vout.len() * 34);
        self.encode_into(&mut encoder, with_witness);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder, with_witness: bool) {
        let with_witness = with_witness && self.has_witness();
        encoder.write_i32_le(self.version);
        if let Some(time) = self.time {
            encoder.write_u32_le(time);
        }
        if with_witness {
            encoder.write_u8(WITNESS_MARKER);
            encoder.write_u8(WITNESS_FLAG);
        }
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        if with_witness {
            for input in &self.vin {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode(false))
    }

    pub fn wtxid(&self) -> Hash256 {
        sha256d(&self.encode(true))
    }

    pub fn base_size(&self) -> usize {
        self.encode(false).len()
    }

    pub fn total_size(&self) -> usize {
        self.encode(true).len()
    }

    pub fn decode_from(decoder: &mut Decoder, format: TxFormat) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let time = match format {
            TxFormat::Plain => None,
            TxFormat::Timestamped => Some(decoder.read_u32_le()?),
        };

        let mut input_count = decoder.read_varint()?;
        let mut with_witness = false;
        if input_count == 0 && decoder.peek_u8().is_some() {
            let flag = decoder.read_u8()?;
            if flag != WITNESS_FLAG {
                return Err(DecodeError::InvalidData("unknown transaction serialization flag"));
            }
            with_witness = true;
            input_count = decoder.read_varint()?;
        }

        let mut vin = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_varint()?;
        let mut vout = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }

        if with_witness {
            for input in vin.iter_mut() {
                let items = decoder.read_varint()?;
                for _ in 0..items {
                    input.witness.push(decoder.read_var_bytes()?);
                }
            }
            if vin.iter().all(|input| input.witness.is_empty()) {
                return Err(DecodeError::InvalidData("superfluous witness record"));
            }
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            time,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn decode(bytes: &[u8], format: TxFormat) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder, format)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }
}
