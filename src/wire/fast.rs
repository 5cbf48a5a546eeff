use sha1::{Digest, Sha1};
use std::net::IpAddr;

/// Derives the allowed-fast set for one peer.
///
/// Deterministic SHA1 chain over the peer's masked address and the content
/// identifier, so both sides compute the same set without negotiation.
/// IPv4 addresses are masked to /24; IPv6 contributes its leading 4 bytes.
pub fn allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    piece_count: u32,
    set_size: usize,
) -> Vec<u32> {
    if piece_count == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(piece_count as usize);

    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], octets[3]]
        }
    };

    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&ip_bytes);
    seed.extend_from_slice(info_hash);

    let mut allowed = Vec::with_capacity(set_size);
    while allowed.len() < set_size {
        let mut hasher = Sha1::new();
        hasher.update(&seed);
        let digest = hasher.finalize();

        for chunk in digest.chunks(4) {
            if allowed.len() >= set_size {
                break;
            }
            let index =
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % piece_count;
            if !allowed.contains(&index) {
                allowed.push(index);
            }
        }

        seed = digest.to_vec();
    }

    allowed
}
