use crc::{Crc, CRC_16_XMODEM};

/// CRC-16/CCITT as used by the bootloader: polynomial 0x1021, seed 0, MSB first,
/// no reflection and no final XOR.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the CRC over several spans as one continuous stream
pub fn crc16(spans: &[&[u8]]) -> u16 {
    let mut digest = CRC16.digest();
    for span in spans {
        digest.update(span);
    }
    digest.finalize()
}
