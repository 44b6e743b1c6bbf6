/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block database export/import file format.
//!
//! An exported database is a version header followed by one or more *sections*, each covering a
//! contiguous run of finalized blocks of one genesis era. Sections appear in non-decreasing
//! genesis index. All integers in the section layout are big-endian; the blocks themselves are
//! length-prefixed, versioned Borsh records in strictly ascending height order.
//!
//! The companion `blocks.idx` file is a line-oriented text index over exported chunk files,
//! sectioned by genesis hash; consecutive index sections sharing a genesis hash are merged on
//! read.

use std::io::{self, Read, Write};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::block::SignedBlock;
use crate::types::certificates::FinalizationEntry;
use crate::types::data_types::{BlockHash, BlockHeight};

/// The version of the container format written by this module.
pub const EXPORT_FORMAT_VERSION: u64 = 3;

/// The version prefix of each serialized block record.
const BLOCK_VERSION: u64 = 1;

/// Enumerates the ways reading or writing an exported block database can fail.
#[derive(Debug)]
pub enum ExportError {
    /// An underlying I/O operation failed.
    Io(io::Error),

    /// The version header names a format this module cannot read.
    UnsupportedVersion(u64),

    /// The input violates the section layout.
    Malformed(&'static str),
}

impl From<io::Error> for ExportError {
    fn from(value: io::Error) -> Self {
        ExportError::Io(value)
    }
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Io(err) => write!(f, "I/O error: {}", err),
            ExportError::UnsupportedVersion(version) => {
                write!(f, "Unsupported block database format version: {}", version)
            }
            ExportError::Malformed(what) => write!(f, "Malformed block database: {}", what),
        }
    }
}

/// Write `value` in most-significant-bit continuation encoding: seven value bits per byte, high
/// bit set on every byte except the last.
pub fn write_varint(out: &mut impl Write, mut value: u64) -> io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.write_all(&[byte])?;
            return Ok(());
        }
        out.write_all(&[byte | 0x80])?;
    }
}

/// Read a most-significant-bit continuation encoded integer.
pub fn read_varint(input: &mut impl Read) -> Result<u64, ExportError> {
    let mut value: u64 = 0;
    for shift in (0..).step_by(7) {
        if shift >= 64 {
            return Err(ExportError::Malformed("over-long varint"));
        }
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    Ok(value)
}

fn write_u64(out: &mut impl Write, value: u64) -> io::Result<()> {
    out.write_all(&value.to_be_bytes())
}

fn read_u64(input: &mut impl Read) -> Result<u64, ExportError> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_u32(input: &mut impl Read) -> Result<u32, ExportError> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

/// One section of an exported block database.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Section {
    /// Which genesis era the section's blocks belong to.
    pub genesis_index: u32,

    /// The protocol version of the era.
    pub protocol_version: u64,

    /// The genesis block hash of the era.
    pub genesis_hash: BlockHash,

    /// Height of the first block in the section.
    pub first_block_height: BlockHeight,

    /// The blocks of the section, in strictly ascending height order.
    pub blocks: Vec<SignedBlock>,

    /// Finalization records closing the section: zero or one entry (a finalization entry for the
    /// last block) in the current format.
    pub finalization_records: Vec<FinalizationEntry>,
}

/// Write the export format version header.
pub fn write_header(out: &mut impl Write) -> io::Result<()> {
    write_varint(out, EXPORT_FORMAT_VERSION)
}

/// Read and check the export format version header.
pub fn read_header(input: &mut impl Read) -> Result<(), ExportError> {
    let version = read_varint(input)?;
    if version != EXPORT_FORMAT_VERSION {
        return Err(ExportError::UnsupportedVersion(version));
    }
    Ok(())
}

/// Write one section.
///
/// The section length cannot be known before the variable-size regions are serialized, so the
/// body is assembled in memory first.
pub fn write_section(out: &mut impl Write, section: &Section) -> io::Result<()> {
    let mut blocks_region = Vec::new();
    for block in &section.blocks {
        let mut record = Vec::new();
        write_varint(&mut record, BLOCK_VERSION)?;
        block.serialize(&mut record)?;
        write_u64(&mut blocks_region, record.len() as u64)?;
        blocks_region.extend_from_slice(&record);
    }

    let mut finalization_region = Vec::new();
    for record in &section.finalization_records {
        let bytes = record.try_to_vec()?;
        write_u64(&mut finalization_region, bytes.len() as u64)?;
        finalization_region.extend_from_slice(&bytes);
    }

    // Fixed-size header fields: length (8) + genesis index (4) + protocol version (8) +
    // genesis hash (32) + first height (8) + block count (8) + blocks length (8) +
    // finalization count (8).
    let section_length =
        84 + blocks_region.len() as u64 + finalization_region.len() as u64;

    write_u64(out, section_length)?;
    out.write_all(&section.genesis_index.to_be_bytes())?;
    write_u64(out, section.protocol_version)?;
    out.write_all(&section.genesis_hash.bytes())?;
    write_u64(out, section.first_block_height.int())?;
    write_u64(out, section.blocks.len() as u64)?;
    write_u64(out, blocks_region.len() as u64)?;
    write_u64(out, section.finalization_records.len() as u64)?;
    out.write_all(&blocks_region)?;
    out.write_all(&finalization_region)?;
    Ok(())
}

/// Read one section, or `None` at a clean end of input.
pub fn read_section(input: &mut impl Read) -> Result<Option<Section>, ExportError> {
    let mut length_bytes = [0u8; 8];
    match input.read(&mut length_bytes)? {
        0 => return Ok(None),
        8 => {}
        n => {
            input.read_exact(&mut length_bytes[n..])?;
        }
    }
    let section_length = u64::from_be_bytes(length_bytes);
    if section_length < 84 {
        return Err(ExportError::Malformed("section shorter than its header"));
    }

    let genesis_index = read_u32(input)?;
    let protocol_version = read_u64(input)?;
    let mut genesis_hash = [0u8; 32];
    input.read_exact(&mut genesis_hash)?;
    let first_block_height = BlockHeight::new(read_u64(input)?);
    let block_count = read_u64(input)?;
    let blocks_length = read_u64(input)?;
    let finalization_count = read_u64(input)?;

    if 84 + blocks_length > section_length {
        return Err(ExportError::Malformed("block region exceeds section length"));
    }

    // Blocks occupy heights `first_block_height..` in order; the records themselves do not repeat
    // the height.
    let mut blocks = Vec::with_capacity(block_count.min(1024) as usize);
    let mut read_so_far: u64 = 0;
    for _ in 0..block_count {
        let record_length = read_u64(input)?;
        let mut record = vec![0u8; record_length as usize];
        input.read_exact(&mut record)?;
        read_so_far += 8 + record_length;

        let mut cursor = record.as_slice();
        let block_version = read_varint(&mut cursor)?;
        if block_version != BLOCK_VERSION {
            return Err(ExportError::Malformed("unsupported block record version"));
        }
        let block = SignedBlock::deserialize(&mut cursor)
            .map_err(|_| ExportError::Malformed("undecodable block record"))?;
        blocks.push(block);
    }
    if read_so_far != blocks_length {
        return Err(ExportError::Malformed("block region length mismatch"));
    }

    let mut finalization_records = Vec::with_capacity(finalization_count.min(1024) as usize);
    for _ in 0..finalization_count {
        let record_length = read_u64(input)?;
        let mut record = vec![0u8; record_length as usize];
        input.read_exact(&mut record)?;
        let entry = FinalizationEntry::deserialize(&mut record.as_slice())
            .map_err(|_| ExportError::Malformed("undecodable finalization record"))?;
        finalization_records.push(entry);
    }

    Ok(Some(Section {
        genesis_index,
        protocol_version,
        genesis_hash: BlockHash::new(genesis_hash),
        first_block_height,
        blocks,
        finalization_records,
    }))
}

/// Read every section of an exported database, checking that genesis indices never decrease.
pub fn read_sections(input: &mut impl Read) -> Result<Vec<Section>, ExportError> {
    read_header(input)?;
    let mut sections = Vec::new();
    let mut last_genesis_index: Option<u32> = None;
    while let Some(section) = read_section(input)? {
        if last_genesis_index.is_some_and(|last| section.genesis_index < last) {
            return Err(ExportError::Malformed("decreasing genesis index"));
        }
        last_genesis_index = Some(section.genesis_index);
        sections.push(section);
    }
    Ok(sections)
}

/// One chunk line of a `blocks.idx` file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IndexChunk {
    /// Name of the exported chunk file.
    pub filename: String,

    /// Genesis era of the chunk's blocks.
    pub genesis_index: u32,

    /// Height of the first block in the chunk.
    pub first_height: BlockHeight,

    /// Height of the last block in the chunk.
    pub last_height: BlockHeight,
}

/// One section of a `blocks.idx` file: a genesis hash and the chunks under it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IndexSection {
    /// The genesis hash heading the section.
    pub genesis_hash: BlockHash,

    /// The chunk lines of the section.
    pub chunks: Vec<IndexChunk>,
}

/// Render index sections into the `blocks.idx` line format.
pub fn render_index(sections: &[IndexSection]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&format!("# genesis hash {}\n", section.genesis_hash));
        for chunk in &section.chunks {
            out.push_str(&format!(
                "{},{},{},{}\n",
                chunk.filename, chunk.genesis_index, chunk.first_height, chunk.last_height
            ));
        }
    }
    out
}

/// Parse a `blocks.idx` file, merging consecutive sections that share a genesis hash.
pub fn parse_index(contents: &str) -> Result<Vec<IndexSection>, ExportError> {
    let mut sections: Vec<IndexSection> = Vec::new();
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(hex) = line.strip_prefix("# genesis hash ") {
            let genesis_hash =
                parse_hex_hash(hex.trim()).ok_or(ExportError::Malformed("bad genesis hash line"))?;
            match sections.last() {
                Some(last) if last.genesis_hash == genesis_hash => {
                    // Consecutive sections sharing a genesis hash are merged.
                }
                _ => sections.push(IndexSection {
                    genesis_hash,
                    chunks: Vec::new(),
                }),
            }
        } else {
            let section = sections
                .last_mut()
                .ok_or(ExportError::Malformed("chunk line before any section header"))?;
            let mut fields = line.split(',');
            let filename = fields
                .next()
                .ok_or(ExportError::Malformed("missing chunk filename"))?
                .to_owned();
            let genesis_index = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or(ExportError::Malformed("bad chunk genesis index"))?;
            let first_height = fields
                .next()
                .and_then(|f| f.parse().ok())
                .map(BlockHeight::new)
                .ok_or(ExportError::Malformed("bad chunk first height"))?;
            let last_height = fields
                .next()
                .and_then(|f| f.parse().ok())
                .map(BlockHeight::new)
                .ok_or(ExportError::Malformed("bad chunk last height"))?;
            if fields.next().is_some() {
                return Err(ExportError::Malformed("trailing fields on chunk line"));
            }
            section.chunks.push(IndexChunk {
                filename,
                genesis_index,
                first_height,
                last_height,
            });
        }
    }
    Ok(sections)
}

fn parse_hex_hash(hex: &str) -> Option<BlockHash> {
    if hex.len() != 64 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(BlockHash::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::certificates::{QuorumCertificate, SuccessorProof};
    use crate::types::data_types::*;

    fn block_at(round: u64, parent: BlockHash) -> SignedBlock {
        use crate::types::block::{BakedBlock, Transaction};

        let block = BakedBlock {
            round: Round::new(round),
            epoch: Epoch::new(0),
            timestamp: Timestamp::new(round * 1_000),
            baker: BakerId::new(round % 3),
            baker_key: VerifyingKeyBytes::new([7u8; 32]),
            block_nonce: VrfOutput::new([8u8; 32]),
            nonce_proof: VrfProofBytes::new([9u8; 80]),
            leader_proof: VrfProofBytes::new([10u8; 80]),
            parent,
            justify: QuorumCertificate::genesis(parent),
            timeout_certificate: None,
            finalization_entry: None,
            transactions: vec![Transaction::new(vec![round as u8])],
            state_hash: StateHash::new([11u8; 32]),
            outcomes_hash: StateHash::new([12u8; 32]),
        };
        SignedBlock::new(block, SignatureBytes::new([13u8; 64]))
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 3, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut bytes = Vec::new();
            write_varint(&mut bytes, value).unwrap();
            let decoded = read_varint(&mut bytes.as_slice()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn section_round_trip() {
        let genesis_hash = BlockHash::new([1u8; 32]);
        let b1 = block_at(1, genesis_hash);
        let b2 = block_at(2, b1.hash);
        let entry = FinalizationEntry {
            finalized_qc: QuorumCertificate {
                block: b1.hash,
                round: Round::new(1),
                epoch: Epoch::new(0),
                aggregate_signature: AggregateSignatureBytes::new([0u8; 48]),
                signatories: FinalizerSet::new(),
            },
            successor_qc: QuorumCertificate {
                block: b2.hash,
                round: Round::new(2),
                epoch: Epoch::new(0),
                aggregate_signature: AggregateSignatureBytes::new([0u8; 48]),
                signatories: FinalizerSet::new(),
            },
            successor_proof: SuccessorProof::new([3u8; 32]),
        };
        let section = Section {
            genesis_index: 0,
            protocol_version: 7,
            genesis_hash,
            first_block_height: BlockHeight::new(1),
            blocks: vec![b1, b2],
            finalization_records: vec![entry],
        };

        let mut bytes = Vec::new();
        write_header(&mut bytes).unwrap();
        write_section(&mut bytes, &section).unwrap();

        let sections = read_sections(&mut bytes.as_slice()).unwrap();
        assert_eq!(sections, vec![section]);
    }

    #[test]
    fn index_parse_merges_consecutive_sections() {
        let hash = BlockHash::new([0xabu8; 32]);
        let contents = format!(
            "# genesis hash {hash}\nchunk-0.dat,0,1,100\n# genesis hash {hash}\nchunk-1.dat,0,101,200\n"
        );
        let sections = parse_index(&contents).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].chunks.len(), 2);
        assert_eq!(sections[0].chunks[1].first_height, BlockHeight::new(101));

        let rendered = render_index(&sections);
        let reparsed = parse_index(&rendered).unwrap();
        assert_eq!(reparsed, sections);
    }
}
