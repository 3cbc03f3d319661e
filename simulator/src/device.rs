use chrono::Utc;
use gateway::model::{HandshakeRequest, Metadata};
use rand::Rng;
use serde_json::json;

/// Locally administered unicast address, so simulated devices never collide
/// with real hardware.
pub fn random_mac(rng: &mut impl Rng) -> String {
    let mut octets: [u8; 6] = rng.gen();
    octets[0] = (octets[0] | 0x02) & 0xFE;
    octets
        .iter()
        .map(|o| format!("{:02X}", o))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn handshake(kind: &str, name: &str, mac: &str, ip: &str) -> HandshakeRequest {
    HandshakeRequest {
        action: "register".to_string(),
        time: Utc::now().timestamp_millis(),
        meta: Metadata {
            kind: kind.to_string(),
            name: name.to_string(),
            mac: mac.to_string(),
            ip: ip.to_string(),
        },
        data: json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::validate::normalize_mac;

    #[test]
    fn test_random_mac_is_valid_and_local() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mac = random_mac(&mut rng);
            assert_eq!(normalize_mac(&mac).unwrap(), mac);
            let first = u8::from_str_radix(&mac[..2], 16).unwrap();
            assert_eq!(first & 0x03, 0x02);
        }
    }
}
