//-
// Copyright (c) 2024, The Archiveopteryx Developers
//
// This file is part of Archiveopteryx.
//
// Archiveopteryx is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Archiveopteryx is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
// or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Archiveopteryx. If not, see <http://www.gnu.org/licenses/>.

//! The PROXY protocol v2 leader, as sent by haproxy and friends in front of
//! our IMAP and SMTP listeners.
//!
//! A listener feeds the first bytes of each connection through `decode`
//! before treating anything as protocol input. Only the binary v2 form is
//! understood; v1 text leaders fail the signature check and are passed
//! through as (invalid) protocol input.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use log::warn;

pub const SIGNATURE: &[u8; 12] = b"\r\n\r\n\x00\r\nQUIT\n";

const FAMILY_INET: u8 = 0x11;
const FAMILY_INET6: u8 = 0x21;
const FAMILY_UNIX: u8 = 0x31;

/// Outcome of inspecting the first bytes of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Leader {
    /// The signature does not match; the buffered bytes are ordinary
    /// protocol input.
    NotProxy,
    /// The buffer is a prefix of a possible leader; read more first.
    Incomplete,
    /// A valid leader was found spanning `consumed` bytes.
    Parsed { consumed: usize, command: Command },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// LOCAL: keep the real socket addresses.
    Local,
    /// PROXY with a (peer, self) address pair we understand.
    Proxy(SocketAddr, SocketAddr),
    /// PROXY over a family we don't handle; keep the socket addresses.
    UnknownFamily(u8),
}

/// Inspects the start of `buf` for a PROXY v2 leader.
///
/// Malformed leaders which nonetheless carry the full 12-byte signature are
/// reported as `NotProxy` after logging, matching the rule that we continue
/// with whatever the peer sent rather than hanging up.
pub fn decode(log_prefix: &impl std::fmt::Display, buf: &[u8]) -> Leader {
    if buf.len() < 16 {
        if SIGNATURE[..buf.len().min(12)] == buf[..buf.len().min(12)] {
            return Leader::Incomplete;
        }
        return Leader::NotProxy;
    }

    if &buf[..12] != SIGNATURE {
        return Leader::NotProxy;
    }

    let ver_cmd = buf[12];
    if ver_cmd & 0xf0 != 0x20 {
        warn!(
            "{} PROXY binary signature present, but version != 2",
            log_prefix,
        );
        return Leader::NotProxy;
    }

    let family = buf[13];
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let consumed = 16 + len;
    if buf.len() < consumed {
        return Leader::Incomplete;
    }

    let addr = &buf[16..consumed];
    let command = match ver_cmd & 0x0f {
        0x00 => Command::Local,
        0x01 => match family {
            FAMILY_INET if addr.len() >= 12 => {
                let peer = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(
                        addr[0], addr[1], addr[2], addr[3],
                    )),
                    u16::from_be_bytes([addr[8], addr[9]]),
                );
                let slf = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(
                        addr[4], addr[5], addr[6], addr[7],
                    )),
                    u16::from_be_bytes([addr[10], addr[11]]),
                );
                Command::Proxy(peer, slf)
            },
            FAMILY_INET6 if addr.len() >= 36 => {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&addr[0..16]);
                dst.copy_from_slice(&addr[16..32]);
                let peer = SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(src)),
                    u16::from_be_bytes([addr[32], addr[33]]),
                );
                let slf = SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(dst)),
                    u16::from_be_bytes([addr[34], addr[35]]),
                );
                Command::Proxy(peer, slf)
            },
            family => {
                // This includes AF_UNIX: the leader is consumed but the
                // socket addresses stand.
                warn!(
                    "{} PROXY using unsupported protocol {}, ignoring",
                    log_prefix, family,
                );
                Command::UnknownFamily(family)
            },
        },
        cmd => {
            warn!("{} PROXY unknown command {}, ignoring", log_prefix, cmd);
            Command::UnknownFamily(family)
        },
    };

    Leader::Parsed { consumed, command }
}

/// Encodes a PROXY v2 leader for the given (peer, self) pair.
///
/// The production server never sends these; tests and the proxying side of
/// test harnesses do.
pub fn encode(peer: SocketAddr, slf: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(52);
    out.extend_from_slice(SIGNATURE);
    out.push(0x21); // version 2, command PROXY

    match (peer, slf) {
        (SocketAddr::V4(p), SocketAddr::V4(s)) => {
            out.push(FAMILY_INET);
            out.extend_from_slice(&12u16.to_be_bytes());
            out.extend_from_slice(&p.ip().octets());
            out.extend_from_slice(&s.ip().octets());
            out.extend_from_slice(&p.port().to_be_bytes());
            out.extend_from_slice(&s.port().to_be_bytes());
        },
        (SocketAddr::V6(p), SocketAddr::V6(s)) => {
            out.push(FAMILY_INET6);
            out.extend_from_slice(&36u16.to_be_bytes());
            out.extend_from_slice(&p.ip().octets());
            out.extend_from_slice(&s.ip().octets());
            out.extend_from_slice(&p.port().to_be_bytes());
            out.extend_from_slice(&s.port().to_be_bytes());
        },
        _ => panic!("mixed address families"),
    }

    out
}

/// Encodes a LOCAL leader.
pub fn encode_local() -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(SIGNATURE);
    out.push(0x20); // version 2, command LOCAL
    out.push(0x00); // family UNSPEC
    out.extend_from_slice(&0u16.to_be_bytes());
    out
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn decode_str(buf: &[u8]) -> Leader {
        decode(&"test", buf)
    }

    #[test]
    fn ordinary_input_is_not_proxy() {
        assert_eq!(Leader::NotProxy, decode_str(b"EHLO mail.example.com\r\n"));
        assert_eq!(
            Leader::NotProxy,
            decode_str(b"A001 LOGIN user password\r\n"),
        );
        // A v1 text leader is not understood.
        assert_eq!(
            Leader::NotProxy,
            decode_str(b"PROXY TCP4 192.0.2.1 192.0.2.2 1234 143\r\n"),
        );
    }

    #[test]
    fn short_prefix_of_signature_is_incomplete() {
        assert_eq!(Leader::Incomplete, decode_str(b"\r\n\r\n"));
        assert_eq!(Leader::Incomplete, decode_str(b"\r\n\r\n\x00\r\nQUIT\n"));
    }

    #[test]
    fn crlf_line_is_not_mistaken_for_signature() {
        // "\r\nX" diverges from the signature at the third byte.
        assert_eq!(Leader::NotProxy, decode_str(b"\r\nX"));
    }

    #[test]
    fn local_leader() {
        assert_eq!(
            Leader::Parsed {
                consumed: 16,
                command: Command::Local,
            },
            decode_str(&encode_local()),
        );
    }

    #[test]
    fn wrong_version_is_ignored() {
        let mut buf = encode_local();
        buf[12] = 0x10;
        assert_eq!(Leader::NotProxy, decode_str(&buf));
    }

    #[test]
    fn unknown_family_is_consumed() {
        let mut buf = encode(
            "192.0.2.1:5000".parse().unwrap(),
            "192.0.2.2:143".parse().unwrap(),
        );
        buf[13] = FAMILY_UNIX;
        assert_eq!(
            Leader::Parsed {
                consumed: buf.len(),
                command: Command::UnknownFamily(FAMILY_UNIX),
            },
            decode_str(&buf),
        );
    }

    #[test]
    fn trailing_protocol_input_is_left_alone() {
        let mut buf = encode(
            "192.0.2.1:5000".parse().unwrap(),
            "192.0.2.2:143".parse().unwrap(),
        );
        let leader_len = buf.len();
        buf.extend_from_slice(b"EHLO client\r\n");
        assert_eq!(
            Leader::Parsed {
                consumed: leader_len,
                command: Command::Proxy(
                    "192.0.2.1:5000".parse().unwrap(),
                    "192.0.2.2:143".parse().unwrap(),
                ),
            },
            decode_str(&buf),
        );
    }

    proptest! {
        #[test]
        fn round_trip_v4(
            peer_ip in any::<u32>(),
            self_ip in any::<u32>(),
            peer_port in any::<u16>(),
            self_port in any::<u16>(),
        ) {
            let peer = SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(peer_ip)), peer_port);
            let slf = SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(self_ip)), self_port);
            let encoded = encode(peer, slf);
            prop_assert_eq!(
                Leader::Parsed {
                    consumed: encoded.len(),
                    command: Command::Proxy(peer, slf),
                },
                decode_str(&encoded),
            );
        }

        #[test]
        fn round_trip_v6(
            peer_ip in any::<u128>(),
            self_ip in any::<u128>(),
            peer_port in any::<u16>(),
            self_port in any::<u16>(),
        ) {
            let peer = SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(peer_ip)), peer_port);
            let slf = SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(self_ip)), self_port);
            let encoded = encode(peer, slf);
            prop_assert_eq!(
                Leader::Parsed {
                    consumed: encoded.len(),
                    command: Command::Proxy(peer, slf),
                },
                decode_str(&encoded),
            );
        }
    }
}
