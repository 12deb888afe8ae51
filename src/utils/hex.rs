use crate::error::{PathfinderError, Result};
use alloy::primitives::U256;

pub fn clean_hex(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x").unwrap_or(s)
}

/// Decode runtime bytecode from a hex dump. Embedded newlines are tolerated.
pub fn decode_code(raw: &str) -> Result<Vec<u8>> {
    let compact: String = clean_hex(raw)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(PathfinderError::EmptyCode);
    }
    hex::decode(&compact).map_err(|e| PathfinderError::InvalidHex(e.to_string()))
}

const RADIX_PREFIXES: [(&str, u64); 3] = [("0x", 16), ("#x", 16), ("#b", 2)];

/// Parses CLI numbers and z3 numeral output: `0x..`, `#x..`, `#b..` or decimal.
pub fn to_u256(raw: &str) -> Option<U256> {
    let raw = raw.trim();
    for (prefix, radix) in RADIX_PREFIXES {
        if let Some(digits) = raw.strip_prefix(prefix) {
            return U256::from_str_radix(digits, radix).ok();
        }
    }
    let decimal = !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit());
    decimal.then(|| U256::from_str_radix(raw, 10).ok()).flatten()
}

/// Big-endian immediate bytes as an integer. Empty immediates (PUSH0) are zero.
pub fn be_bytes_to_u256(bytes: &[u8]) -> U256 {
    if bytes.len() > 32 {
        return U256::from_be_slice(&bytes[bytes.len() - 32..]);
    }
    U256::from_be_slice(bytes)
}

/// Render a path as `0x0 -> 0x8 -> 0xa`.
pub fn format_path(path: &[usize]) -> String {
    path.iter()
        .map(|addr| format!("{addr:#x}"))
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_path() {
        assert_eq!(format_path(&[0, 8, 0x1a]), "0x0 -> 0x8 -> 0x1a");
        assert_eq!(format_path(&[]), "");
    }

    #[test]
    fn test_decode_code_accepts_prefix_and_newlines() {
        let code = decode_code("0x6000\n6000\n").unwrap();
        assert_eq!(code, vec![0x60, 0x00, 0x60, 0x00]);
    }

    #[test]
    fn test_decode_code_rejects_garbage_and_empty() {
        assert!(matches!(decode_code("zz"), Err(PathfinderError::InvalidHex(_))));
        assert!(matches!(decode_code("0x"), Err(PathfinderError::EmptyCode)));
    }

    #[test]
    fn test_to_u256_reads_z3_literals() {
        assert_eq!(to_u256("#x0005"), Some(U256::from(5)));
        assert_eq!(to_u256("#b101"), Some(U256::from(5)));
        assert_eq!(to_u256("17"), Some(U256::from(17)));
        assert_eq!(to_u256("(bvadd x y)"), None);
    }

    #[test]
    fn test_be_bytes_to_u256_handles_push0() {
        assert_eq!(be_bytes_to_u256(&[]), U256::ZERO);
        assert_eq!(be_bytes_to_u256(&[0x01, 0x00]), U256::from(256));
    }
}
