/// Internet checksum (RFC 1071) over `data`.
///
/// Words are paired low byte first and a trailing odd byte counts as a low
/// order contribution. The complemented sum is byte swapped on return, so the
/// value can be written straight into a big endian header field.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(*last as u32);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    (!(sum as u16)).swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::icmp;
    use pnet::packet::icmp::IcmpPacket;

    #[test]
    fn test_checksum_empty() {
        assert_eq!(checksum(&[]), 0xffff);
    }
    #[test]
    fn test_checksum_all_zero() {
        assert_eq!(checksum(&[0u8; 16]), 0xffff);
    }
    #[test]
    fn test_checksum_odd_length() {
        // trailing byte acts as the high byte of a network order word
        assert_eq!(checksum(&[0x01]), 0xfeff);
        assert_eq!(checksum(&[0x00, 0x01, 0x02]), !0x0201u16);
    }
    #[test]
    fn test_checksum_rfc1071_vector() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }
    #[test]
    fn test_checksum_carry_folding() {
        let data = [0xff; 10];
        assert_eq!(checksum(&data), 0x0000);
    }
    #[test]
    fn test_checksum_matches_pnet() {
        let mut buff = [0u8; 20];
        buff[0] = 8;
        for (i, b) in buff[4..].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        let packet = IcmpPacket::new(&buff).unwrap();
        assert_eq!(checksum(&buff), icmp::checksum(&packet));
    }
    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut buff = vec![8u8, 0, 0, 0, 0xd4, 0x31, 0x00, 0x07, 1, 2, 3, 4, 5, 6, 7, 8];
        let c = checksum(&buff);
        buff[2..4].copy_from_slice(&c.to_be_bytes());
        assert_eq!(checksum(&buff), 0);
    }
}
