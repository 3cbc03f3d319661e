use crate::errors::{Error, Result};
use crate::model::{DeviceConfig, HandshakeRequest};

const MAC_OCTETS: usize = 6;
const FREQ_MIN: i32 = 1;

/// Checks a hardware address and returns it in canonical `AA:BB:CC:DD:EE:FF` form
pub fn normalize_mac(mac: &str) -> Result<String> {
    let mac = mac.trim();
    if mac.is_empty() {
        return Err(Error::Validation("MAC address cannot be empty".to_string()));
    }

    let octets: Vec<&str> = mac.split(|c| c == ':' || c == '-').collect();
    let well_formed = octets.len() == MAC_OCTETS
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

    if !well_formed {
        return Err(Error::Validation(format!("Malformed MAC address {:?}", mac)));
    }

    Ok(octets.join(":").to_ascii_uppercase())
}

/// Validates a handshake and returns the device identity it carries
pub fn validate_handshake(request: &HandshakeRequest) -> Result<String> {
    normalize_mac(&request.meta.mac)
}

/// Validates configuration values before they are persisted or pushed
pub fn validate_config(config: &DeviceConfig) -> Result<()> {
    if config.collect_freq < FREQ_MIN {
        return Err(Error::Validation(format!(
            "Collect frequency {} must be at least {}",
            config.collect_freq, FREQ_MIN
        )));
    }

    if config.send_freq < FREQ_MIN {
        return Err(Error::Validation(format!(
            "Send frequency {} must be at least {}",
            config.send_freq, FREQ_MIN
        )));
    }

    Ok(())
}
