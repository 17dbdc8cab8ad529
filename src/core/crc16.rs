//! CRC-16/CCITT-FALSE
//!
//! Init `0xFFFF`, polynomial `0x1021`, MSB-first, no reflection, no final XOR.
//! Both the decoder and the encoder run it over the same range: start marker
//! through the last command body byte.

const POLYNOMIAL: u16 = 0x1021;
const INITIAL: u16 = 0xFFFF;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the checksum of `data`.
#[inline]
pub fn compute(data: &[u8]) -> u16 {
    data.iter().fold(INITIAL, |crc, &byte| {
        (crc << 8) ^ TABLE[(((crc >> 8) as u8) ^ byte) as usize]
    })
}
