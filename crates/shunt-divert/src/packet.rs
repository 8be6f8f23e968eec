use std::net::Ipv4Addr;

use thiserror::Error;

const IPV4_MIN_HEADER_LEN: usize = 20;
const TCP_MIN_HEADER_LEN: usize = 20;
const PROTO_TCP: u8 = 6;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("truncated IPv4 header: ihl claims {0} bytes")]
    BadHeaderLen(usize),
}

/// Addressing fields of an IPv4 TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlow {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IPv4 header length in bytes; the TCP header starts here.
    pub header_len: usize,
}

/// IP version nibble, if the buffer is non-empty.
pub fn ip_version(data: &[u8]) -> Option<u8> {
    data.first().map(|b| b >> 4)
}

/// True if the buffer holds an IPv4 packet carrying TCP.
pub fn is_ipv4_tcp(data: &[u8]) -> bool {
    ip_version(data) == Some(4) && data.len() >= IPV4_MIN_HEADER_LEN && data[9] == PROTO_TCP
}

/// Parse the addressing fields of an IPv4 TCP packet.
pub fn parse_tcp_flow(data: &[u8]) -> Result<TcpFlow, PacketError> {
    if data.len() < IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN,
            actual: data.len(),
        });
    }
    let header_len = ((data[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || data.len() < header_len + TCP_MIN_HEADER_LEN {
        return Err(PacketError::BadHeaderLen(header_len));
    }

    let src_addr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_addr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let tcp = &data[header_len..];
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);

    Ok(TcpFlow {
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        header_len,
    })
}

/// Point the packet at a new destination. Checksums are not touched; call
/// `update_checksums` once all fields are in place.
pub fn set_destination(data: &mut [u8], header_len: usize, addr: Ipv4Addr, port: u16) {
    data[16..20].copy_from_slice(&addr.octets());
    data[header_len + 2..header_len + 4].copy_from_slice(&port.to_be_bytes());
}

/// Rewrite the packet's source address and port.
pub fn set_source(data: &mut [u8], header_len: usize, addr: Ipv4Addr, port: u16) {
    data[12..16].copy_from_slice(&addr.octets());
    data[header_len..header_len + 2].copy_from_slice(&port.to_be_bytes());
}

/// Recompute the IPv4 header checksum and the TCP checksum (pseudo-header
/// included) after a rewrite.
pub fn update_checksums(data: &mut [u8], header_len: usize) {
    data[10] = 0;
    data[11] = 0;
    let ip_checksum = fold(sum_words(&data[..header_len]));
    data[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    let tcp_len = data.len() - header_len;
    data[header_len + 16] = 0;
    data[header_len + 17] = 0;
    let mut sum = sum_words(&data[12..20]); // source and destination addresses
    sum += u32::from(PROTO_TCP);
    sum += tcp_len as u32;
    sum += sum_words(&data[header_len..]);
    let tcp_checksum = fold(sum);
    data[header_len + 16..header_len + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
}

/// RFC 1071: fold the carries and take the one's complement.
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}


#[cfg(test)]
mod tests {
    use super::testutil::tcp_packet;
    use super::*;

    /// With a correct checksum in place the folded sum is 0xFFFF, so the
    /// complement from `fold` comes out zero.
    fn verify_ip_checksum(data: &[u8], header_len: usize) -> bool {
        fold(sum_words(&data[..header_len])) == 0
    }

    fn verify_tcp_checksum(data: &[u8], header_len: usize) -> bool {
        let tcp_len = data.len() - header_len;
        let mut sum = sum_words(&data[12..20]);
        sum += u32::from(PROTO_TCP);
        sum += tcp_len as u32;
        sum += sum_words(&data[header_len..]);
        fold(sum) == 0
    }

    #[test]
    fn test_parse_tcp_flow() {
        let data = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 99),
            52000,
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        );
        let flow = parse_tcp_flow(&data).unwrap();
        assert_eq!(flow.src_addr, Ipv4Addr::new(10, 0, 0, 99));
        assert_eq!(flow.dst_addr, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(flow.src_port, 52000);
        assert_eq!(flow.dst_port, 80);
        assert_eq!(flow.header_len, 20);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        assert!(matches!(
            parse_tcp_flow(&[0x45; 12]),
            Err(PacketError::TooShort { .. })
        ));
    }

    #[test]
    fn test_bogus_ihl_is_rejected() {
        let mut data = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 99),
            52000,
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        );
        data[0] = 0x4f; // ihl 60 bytes, longer than the buffer allows
        assert!(matches!(
            parse_tcp_flow(&data),
            Err(PacketError::BadHeaderLen(60))
        ));
    }

    #[test]
    fn test_is_ipv4_tcp() {
        let data = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 99),
            52000,
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        );
        assert!(is_ipv4_tcp(&data));

        let mut udp = data.clone();
        udp[9] = 17;
        assert!(!is_ipv4_tcp(&udp));

        let mut v6 = data;
        v6[0] = 0x60;
        assert!(!is_ipv4_tcp(&v6));
        assert_eq!(ip_version(&v6), Some(6));
    }

    #[test]
    fn test_builder_produces_valid_checksums() {
        let data = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 99),
            52000,
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        );
        assert!(verify_ip_checksum(&data, 20));
        assert!(verify_tcp_checksum(&data, 20));
    }

    #[test]
    fn test_destination_rewrite_keeps_checksums_valid() {
        let mut data = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 99),
            52000,
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        );
        set_destination(&mut data, 20, Ipv4Addr::new(10, 0, 0, 5), 40080);
        update_checksums(&mut data, 20);

        let flow = parse_tcp_flow(&data).unwrap();
        assert_eq!(flow.src_addr, Ipv4Addr::new(10, 0, 0, 99));
        assert_eq!(flow.src_port, 52000);
        assert_eq!(flow.dst_addr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(flow.dst_port, 40080);
        assert!(verify_ip_checksum(&data, 20));
        assert!(verify_tcp_checksum(&data, 20));
    }

    #[test]
    fn test_source_rewrite_keeps_checksums_valid() {
        let mut data = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 5),
            40080,
            Ipv4Addr::new(10, 0, 0, 99),
            52000,
        );
        set_source(&mut data, 20, Ipv4Addr::new(93, 184, 216, 34), 80);
        update_checksums(&mut data, 20);

        let flow = parse_tcp_flow(&data).unwrap();
        assert_eq!(flow.src_addr, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(flow.src_port, 80);
        assert_eq!(flow.dst_addr, Ipv4Addr::new(10, 0, 0, 99));
        assert_eq!(flow.dst_port, 52000);
        assert!(verify_ip_checksum(&data, 20));
        assert!(verify_tcp_checksum(&data, 20));
    }
}
