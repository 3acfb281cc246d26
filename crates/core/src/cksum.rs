#![forbid(unsafe_code)]

/// Marker bit for a checksum filled in by hardware offload. The low 16
/// bits then carry the value the device reported.
pub const HW_CKSUM: u32 = 0x8000_0000;

/// Diagnostic rendering of a checksum field. Offloaded values show as
/// `hw(0xXXXX)` over the low 16 bits, software values as the full word.
pub fn format_checksum(raw: u32) -> String {
    if raw & HW_CKSUM != 0 {
        format!("hw(0x{:04x})", raw & 0xffff)
    } else {
        format!("0x{raw:08x}")
    }
}

/// RFC 1071 ones-complement sum over big-endian 16-bit words; an odd tail
/// byte pads with zero on the right.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [tail] = words.remainder() {
        sum += (*tail as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// True when `bytes` spans a region whose embedded checksum is intact;
/// the ones-complement sum of such a region folds to zero.
pub fn verify_checksum(bytes: &[u8]) -> bool {
    internet_checksum(bytes) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // the canonical dotted-header example; checksum 0xb861 lives at
    // offset 10
    const HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn offloaded_checksums_render_their_low_word() {
        assert_eq!(format_checksum(HW_CKSUM | 0x1234), "hw(0x1234)");
        assert_eq!(format_checksum(HW_CKSUM | 0x5555_1234), "hw(0x1234)");
        assert_eq!(format_checksum(HW_CKSUM), "hw(0x0000)");
    }

    #[test]
    fn software_checksums_render_the_full_word() {
        assert_eq!(format_checksum(0x1234), "0x00001234");
        assert_eq!(format_checksum(0x7fff_ffff), "0x7fffffff");
        assert_eq!(format_checksum(0), "0x00000000");
    }

    #[test]
    fn sum_matches_the_rfc_worked_example() {
        let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&bytes), 0x220d);
    }

    #[test]
    fn odd_length_pads_the_tail_byte() {
        assert_eq!(internet_checksum(&[0x01, 0x02, 0x03]), !0x0402u16);
        assert_eq!(internet_checksum(&[]), 0xffff);
    }

    #[test]
    fn computes_and_verifies_a_real_header() {
        let mut header = HEADER;
        header[10] = 0;
        header[11] = 0;
        assert_eq!(internet_checksum(&header), 0xb861);

        assert!(verify_checksum(&HEADER));
        let mut corrupted = HEADER;
        corrupted[3] ^= 0x01;
        assert!(!verify_checksum(&corrupted));
    }
}
