// Block stream carried by 0x0707 messages

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::debug;

use super::message::MAX_MESSAGE_LENGTH;
use crate::IdeviceError;

/// `bv41`
const BLOCK_MAGIC: u32 = 0x6276_3431;
/// Room past the declared size, some senders undercount their last block
const OUTPUT_SLACK: usize = 100;

/// Decompresses `total:u32 | { "bv41" | uncompressed:u32 | compressed:u32 | bytes }*`
///
/// The compressed chunks are joined and decoded as one LZ4 block.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, IdeviceError> {
    if data.len() < 4 {
        return Err(IdeviceError::NotEnoughBytes(data.len(), 4));
    }
    let declared = LittleEndian::read_u32(data);
    if declared > MAX_MESSAGE_LENGTH {
        return Err(IdeviceError::DtxMessageTooLarge(declared));
    }
    let total = declared as usize;
    let mut rest = &data[4..];

    let mut compressed = Vec::new();
    while rest.len() >= 4 && BigEndian::read_u32(rest) == BLOCK_MAGIC {
        if rest.len() < 12 {
            return Err(IdeviceError::NotEnoughBytes(rest.len(), 12));
        }
        let size = LittleEndian::read_u32(&rest[8..]) as usize;
        let chunk = rest
            .get(12..12 + size)
            .ok_or(IdeviceError::NotEnoughBytes(rest.len() - 12, size))?;
        compressed.extend_from_slice(chunk);
        rest = &rest[12 + size..];
    }
    if !rest.is_empty() {
        debug!("{} trailing bytes after lz4 blocks", rest.len());
    }

    Ok(lz4_flex::block::decompress(&compressed, total + OUTPUT_SLACK)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(blocks: &[(&[u8], usize)], total: usize) -> Vec<u8> {
        let mut out = (total as u32).to_le_bytes().to_vec();
        for (compressed, uncompressed) in blocks {
            out.extend_from_slice(&BLOCK_MAGIC.to_be_bytes());
            out.extend_from_slice(&(*uncompressed as u32).to_le_bytes());
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(compressed);
        }
        out
    }

    #[test]
    fn single_block() {
        let plain = b"sysmon sysmon sysmon sysmon sysmon sysmon".repeat(4);
        let compressed = lz4_flex::block::compress(&plain);
        let data = wrap(&[(&compressed, plain.len())], plain.len());
        assert_eq!(decompress(&data).unwrap(), plain);
    }

    #[test]
    fn undercounted_total_still_decodes() {
        let plain = b"0123456789abcdef".repeat(8);
        let compressed = lz4_flex::block::compress(&plain);
        let data = wrap(&[(&compressed, plain.len())], plain.len() - 5);
        assert_eq!(decompress(&data).unwrap(), plain);
    }

    #[test]
    fn truncated_block() {
        let plain = b"abcdefabcdefabcdef".to_vec();
        let compressed = lz4_flex::block::compress(&plain);
        let mut data = wrap(&[(&compressed, plain.len())], plain.len());
        data.truncate(data.len() - 2);
        assert!(matches!(
            decompress(&data),
            Err(IdeviceError::NotEnoughBytes(_, _))
        ));
    }

    #[test]
    fn oversized_total_is_refused() {
        let data = wrap(&[(&[0x10, b'a'], 1)], u32::MAX as usize);
        assert!(matches!(
            decompress(&data),
            Err(IdeviceError::DtxMessageTooLarge(u32::MAX))
        ));
    }

    #[test]
    fn corrupt_block() {
        let data = wrap(&[(&[0xff, 0xff, 0xff], 64)], 64);
        assert!(matches!(decompress(&data), Err(IdeviceError::Lz4(_))));
    }
}
