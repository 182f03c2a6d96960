//! HAProxy PROXY Protocol v2 chain parser (component A, §4.1/§6).
//!
//! Deployments may stack several PROXY-v2 hops in front of the proxy; only
//! the outermost header carries the *original* client tuple, inner headers
//! just refine the immediate hop and are discarded (§4.1 algorithm step 2).
//!
//! Grounded on `ppp::v2`, the same crate the teacher (`trakt_core`'s
//! `bedrock/client.rs::send_haproxy_info`) uses to *build* v2 headers; the
//! parsing side mirrors how `Ikaleio-geofront`'s `connection.rs` reads an
//! inbound v2 header off the wire with `ppp::HeaderResult::parse`.

use std::net::IpAddr;

use bytes::Bytes;

/// 12-byte fixed signature that prefixes every PROXY protocol v2 header.
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Outcome of walking a (possibly empty) chain of PROXY-v2 headers off the
/// front of a datagram.
#[derive(Debug, Clone)]
pub struct ParsedChain {
    /// Original client tuple from the outermost header, if any header was
    /// present at all.
    pub original: Option<(IpAddr, u16)>,
    /// Payload remaining after all headers were peeled off.
    pub payload: Bytes,
}

fn starts_with_signature(data: &[u8]) -> bool {
    data.len() >= SIGNATURE.len() && data[..SIGNATURE.len()] == SIGNATURE
}

/// Walks the chain of PROXY-v2 headers prefixing `data`, returning the
/// outermost original client tuple (if any) and the innermost payload.
///
/// Stops as soon as the remaining bytes no longer start with the
/// signature, or a header fails to parse (treating whatever is left as the
/// payload rather than erroring out — a malformed trailing header is not
/// our problem to solve, we just stop peeling).
pub fn parse_proxy_protocol_chain(data: &[u8]) -> ParsedChain {
    let mut remaining = data;
    let mut original: Option<(IpAddr, u16)> = None;

    while starts_with_signature(remaining) {
        match ppp::HeaderResult::parse(remaining) {
            ppp::HeaderResult::V2(Ok(header)) => {
                let header_len = header.len();
                if header_len == 0 || header_len > remaining.len() {
                    break;
                }
                let addrs = match &header.addresses {
                    ppp::v2::Addresses::IPv4(v4) => {
                        Some((IpAddr::V4(v4.source_address), v4.source_port))
                    }
                    ppp::v2::Addresses::IPv6(v6) => {
                        Some((IpAddr::V6(v6.source_address), v6.source_port))
                    }
                    _ => None,
                };
                if original.is_none() {
                    original = addrs;
                }
                remaining = &remaining[header_len..];
            }
            _ => break,
        }
    }

    ParsedChain {
        original,
        payload: Bytes::copy_from_slice(remaining),
    }
}

/// Builds a single PROXY protocol v2 header for an IPv4/UDP (DGRAM) hop.
///
/// Used by tests, and available for forwarding a header onward to another
/// hop should a future deployment need it.
pub fn build_ipv4_udp_header(
    source: std::net::SocketAddrV4,
    destination: std::net::SocketAddrV4,
) -> anyhow::Result<Vec<u8>> {
    let header = ppp::v2::Builder::with_addresses(
        ppp::v2::Version::Two | ppp::v2::Command::Proxy,
        ppp::v2::Protocol::Datagram,
        (source, destination),
    )
    .build()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn round_trips_ipv4_udp_header() {
        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 54321);
        let destination = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 19132);
        let mut bytes = build_ipv4_udp_header(source, destination).unwrap();
        bytes.extend_from_slice(b"PING");

        let chain = parse_proxy_protocol_chain(&bytes);
        let (ip, port) = chain.original.expect("header should have been parsed");
        assert_eq!(ip, IpAddr::V4(*source.ip()));
        assert_eq!(port, source.port());
        assert_eq!(&chain.payload[..], b"PING");
    }

    #[test]
    fn header_only_probe_yields_empty_payload() {
        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 54321);
        let destination = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 19132);
        let bytes = build_ipv4_udp_header(source, destination).unwrap();

        let chain = parse_proxy_protocol_chain(&bytes);
        assert!(chain.original.is_some());
        assert!(chain.payload.is_empty());
    }

    #[test]
    fn chain_of_two_headers_only_yields_outermost() {
        let outer_src = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 9000);
        let inner_src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1234);
        let destination = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 19132);

        let mut inner_header = build_ipv4_udp_header(inner_src, destination).unwrap();
        inner_header.extend_from_slice(b"DATA");
        let mut outer_header = build_ipv4_udp_header(outer_src, destination).unwrap();
        outer_header.extend_from_slice(&inner_header);

        let chain = parse_proxy_protocol_chain(&outer_header);
        let (ip, port) = chain.original.unwrap();
        assert_eq!(ip, IpAddr::V4(*outer_src.ip()));
        assert_eq!(port, outer_src.port());
        assert_eq!(&chain.payload[..], b"DATA");
    }

    #[test]
    fn strip_is_idempotent_on_single_layer_header() {
        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 54321);
        let destination = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 19132);
        let mut bytes = build_ipv4_udp_header(source, destination).unwrap();
        bytes.extend_from_slice(b"PING");

        let once = parse_proxy_protocol_chain(&bytes).payload;
        let twice = parse_proxy_protocol_chain(&once).payload;
        assert_eq!(once, twice);
    }

    #[test]
    fn plain_datagram_has_no_header() {
        let chain = parse_proxy_protocol_chain(b"plain bedrock datagram");
        assert!(chain.original.is_none());
        assert_eq!(&chain.payload[..], b"plain bedrock datagram");
    }
}
