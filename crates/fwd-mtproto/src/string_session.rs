//! Exported session strings (`1` + urlsafe base64 of dc id, address, port
//! and the 256-byte auth key).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};

use fwd_core::{errors::Error, Result};

const VERSION: char = '1';
const AUTH_KEY_LEN: usize = 256;

const URL_SAFE_ANY_PADDING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decoded contents of a session string.
#[derive(Clone, PartialEq, Eq)]
pub struct StringSession {
    pub dc_id: i32,
    pub addr: SocketAddr,
    pub auth_key: [u8; AUTH_KEY_LEN],
}

impl std::fmt::Debug for StringSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringSession")
            .field("dc_id", &self.dc_id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidArgument(format!("invalid session string: {reason}"))
}

impl StringSession {
    pub fn decode(encoded: &str) -> Result<Self> {
        let body = encoded
            .trim()
            .strip_prefix(VERSION)
            .ok_or_else(|| invalid("unsupported version"))?;
        let bytes = URL_SAFE_ANY_PADDING
            .decode(body)
            .map_err(|e| invalid(&e.to_string()))?;

        let ip_len = match bytes.len() {
            n if n == 1 + 4 + 2 + AUTH_KEY_LEN => 4,
            n if n == 1 + 16 + 2 + AUTH_KEY_LEN => 16,
            _ => return Err(invalid("unexpected length")),
        };

        let ip = &bytes[1..1 + ip_len];
        let ip = if ip_len == 4 {
            IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(ip);
            IpAddr::V6(Ipv6Addr::from(octets))
        };
        let port = u16::from_be_bytes([bytes[1 + ip_len], bytes[2 + ip_len]]);
        let mut auth_key = [0u8; AUTH_KEY_LEN];
        auth_key.copy_from_slice(&bytes[3 + ip_len..]);

        Ok(Self {
            dc_id: i32::from(bytes[0]),
            addr: SocketAddr::new(ip, port),
            auth_key,
        })
    }
}
