//! Minimal Solidity ABI encoding for the registry and token calls.
//!
//! Only the shapes the registry surface needs: `address`, `bytes32`,
//! `uint256` (limited to u128), `bool`, `string`, and one-dimensional
//! arrays of those in return data.

use crate::{RegistryError, Result};

const WORD: usize = 32;

/// Function selectors (first 4 bytes of keccak256 of the signature)
pub mod selector {
    /// `registerNodeWithId(bytes32,bytes32,uint256,string)`
    pub const REGISTER_NODE_WITH_ID: [u8; 4] = [0x89, 0xb8, 0xe1, 0x68];
    /// `isNodeRegistered(bytes32)`
    pub const IS_NODE_REGISTERED: [u8; 4] = [0x06, 0xd4, 0x90, 0x30];
    /// `nodes(bytes32)`
    pub const NODES: [u8; 4] = [0xd8, 0x6e, 0x69, 0x7d];
    /// `getActiveEndpoints()`
    pub const GET_ACTIVE_ENDPOINTS: [u8; 4] = [0x34, 0xa1, 0xff, 0x0b];
    /// ERC-20 `approve(address,uint256)`
    pub const APPROVE: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];
    /// ERC-20 `allowance(address,address)`
    pub const ALLOWANCE: [u8; 4] = [0xdd, 0x62, 0xed, 0x3e];
}

/// A call argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address([u8; 20]),
    Bytes32([u8; 32]),
    Uint(u128),
    String(String),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        matches!(self, Token::String(_))
    }
}

fn uint_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn static_word(token: &Token) -> [u8; WORD] {
    match token {
        Token::Address(addr) => {
            let mut word = [0u8; WORD];
            word[12..].copy_from_slice(addr);
            word
        }
        Token::Bytes32(b) => *b,
        Token::Uint(v) => uint_word(*v),
        Token::String(_) => [0u8; WORD],
    }
}

/// Selector followed by head/tail encoded arguments
pub fn encode_call(selector: [u8; 4], tokens: &[Token]) -> Vec<u8> {
    let head_len = tokens.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail: Vec<u8> = Vec::new();

    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            if let Token::String(s) = token {
                let bytes = s.as_bytes();
                tail.extend_from_slice(&uint_word(bytes.len() as u128));
                tail.extend_from_slice(bytes);
                let pad = (WORD - bytes.len() % WORD) % WORD;
                tail.extend(std::iter::repeat(0u8).take(pad));
            }
        } else {
            head.extend_from_slice(&static_word(token));
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector);
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

/// Parse a `0x`-prefixed 20-byte address
pub fn parse_address(s: &str) -> Result<[u8; 20]> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|_| RegistryError::InvalidAddress(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| RegistryError::InvalidAddress(s.to_string()))
}

/// Bounds-checked reader over ABI return data.
///
/// Offsets are byte offsets relative to this reader's base.
#[derive(Debug, Clone, Copy)]
pub struct AbiReader<'a> {
    data: &'a [u8],
}

impl<'a> AbiReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn word(&self, offset: usize) -> Result<&'a [u8]> {
        let end = offset
            .checked_add(WORD)
            .ok_or_else(|| RegistryError::Abi("offset overflow".to_string()))?;
        self.data
            .get(offset..end)
            .ok_or_else(|| RegistryError::Abi(format!("short return data at {}", offset)))
    }

    pub fn uint(&self, offset: usize) -> Result<u128> {
        let word = self.word(offset)?;
        if word[..16].iter().any(|b| *b != 0) {
            return Err(RegistryError::Abi("uint256 exceeds u128".to_string()));
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(buf))
    }

    fn usize_at(&self, offset: usize) -> Result<usize> {
        let v = self.uint(offset)?;
        usize::try_from(v).map_err(|_| RegistryError::Abi("length exceeds usize".to_string()))
    }

    pub fn bool(&self, offset: usize) -> Result<bool> {
        Ok(self.uint(offset)? != 0)
    }

    pub fn bytes32(&self, offset: usize) -> Result<[u8; 32]> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.word(offset)?);
        Ok(out)
    }

    /// Lowercase `0x` address
    pub fn address(&self, offset: usize) -> Result<String> {
        let word = self.word(offset)?;
        Ok(format!("0x{}", hex::encode(&word[12..])))
    }

    /// A `string` whose head word sits at `offset`
    pub fn string(&self, offset: usize) -> Result<String> {
        let ptr = self.usize_at(offset)?;
        let len = self.usize_at(ptr)?;
        let start = ptr + WORD;
        let bytes = self
            .data
            .get(start..start.saturating_add(len))
            .ok_or_else(|| RegistryError::Abi("string out of bounds".to_string()))?;
        String::from_utf8(bytes.to_vec()).map_err(|e| RegistryError::Abi(e.to_string()))
    }

    /// A dynamic array whose head word sits at `offset`; `item` is called
    /// with a reader based at the first element and the element's head offset.
    pub fn array<T>(
        &self,
        offset: usize,
        item: impl Fn(&AbiReader<'a>, usize) -> Result<T>,
    ) -> Result<Vec<T>> {
        let ptr = self.usize_at(offset)?;
        let len = self.usize_at(ptr)?;
        let base = ptr + WORD;
        if len.saturating_mul(WORD) > self.data.len().saturating_sub(base) {
            return Err(RegistryError::Abi(format!("array length {} out of bounds", len)));
        }
        let elements = AbiReader::new(&self.data[base..]);
        (0..len).map(|i| item(&elements, i * WORD)).collect()
    }
}

/// Decode a `0x` hex string from a JSON-RPC result
pub fn decode_hex_result(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| RegistryError::Abi(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_arguments() {
        let data = encode_call(selector::IS_NODE_REGISTERED, &[Token::Bytes32([7u8; 32])]);
        assert_eq!(&data[..4], &selector::IS_NODE_REGISTERED);
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[4..], &[7u8; 32]);
    }

    #[test]
    fn test_string_argument_layout() {
        let data = encode_call(
            selector::REGISTER_NODE_WITH_ID,
            &[
                Token::Bytes32([1u8; 32]),
                Token::Bytes32([2u8; 32]),
                Token::Uint(2048),
                Token::String("1.2.3.4:19370".to_string()),
            ],
        );
        let args = AbiReader::new(&data[4..]);
        assert_eq!(args.bytes32(0).unwrap(), [1u8; 32]);
        assert_eq!(args.uint(64).unwrap(), 2048);
        // head is 4 words, so the string starts right after it
        assert_eq!(args.uint(96).unwrap(), 128);
        assert_eq!(args.string(96).unwrap(), "1.2.3.4:19370");
        assert_eq!((data.len() - 4) % 32, 0);
    }

    #[test]
    fn test_address_word() {
        let addr = parse_address("0x00000000000000000000000000000000000000ff").unwrap();
        let data = encode_call(selector::APPROVE, &[Token::Address(addr), Token::Uint(5)]);
        let args = AbiReader::new(&data[4..]);
        assert_eq!(
            args.address(0).unwrap(),
            "0x00000000000000000000000000000000000000ff"
        );
        assert_eq!(args.uint(32).unwrap(), 5);
    }

    #[test]
    fn test_parse_address_rejects_bad_length() {
        assert!(parse_address("0x1234").is_err());
        assert!(parse_address("not hex").is_err());
    }

    #[test]
    fn test_string_array() {
        // a single string[] return value: ["ab", "c"]
        let mut data = Vec::new();
        data.extend_from_slice(&uint_word(32)); // head -> array
        data.extend_from_slice(&uint_word(2)); // length
        data.extend_from_slice(&uint_word(64)); // elem 0 offset
        data.extend_from_slice(&uint_word(128)); // elem 1 offset
        data.extend_from_slice(&uint_word(2));
        let mut s = [0u8; 32];
        s[..2].copy_from_slice(b"ab");
        data.extend_from_slice(&s);
        data.extend_from_slice(&uint_word(1));
        let mut s = [0u8; 32];
        s[0] = b'c';
        data.extend_from_slice(&s);

        let reader = AbiReader::new(&data);
        let out = reader.array(0, |r, off| r.string(off)).unwrap();
        assert_eq!(out, vec!["ab".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_truncated_data_is_error() {
        let reader = AbiReader::new(&[0u8; 10]);
        assert!(reader.uint(0).is_err());
        let mut data = uint_word(32).to_vec();
        data.extend_from_slice(&uint_word(1_000_000));
        assert!(AbiReader::new(&data).array(0, |r, off| r.uint(off)).is_err());
    }
}
