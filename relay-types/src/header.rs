//! The `x-mte-relay` protocol header.
//!
//! Format: `<client_id>,<pair_id>,<encode_type>,<url>,<headers>,<body>` where
//! the last four fields are `0` or `1`. A capability probe response carries
//! only the client id.

use std::fmt;

use crate::{ClientId, PairId, TypesError};

/// Name of the protocol header carried on every relayed request and response.
pub const RELAY_HEADER: &str = "x-mte-relay";

/// Name of the header carrying the encoded JSON object of protected headers.
pub const ENCRYPTED_HEADERS_HEADER: &str = "x-mte-relay-eh";

/// Codec mode of a relayed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeType {
    /// Whole-message encode/decode.
    Mte = 0,
    /// Chunked stream encryption with a fixed-size trailer.
    Mke = 1,
}

impl EncodeType {
    fn from_flag(flag: &str) -> Result<Self, TypesError> {
        match flag {
            "0" => Ok(Self::Mte),
            "1" => Ok(Self::Mke),
            other => Err(TypesError::InvalidHeader(format!(
                "unknown encode type '{}'",
                other
            ))),
        }
    }
}

/// Parsed `x-mte-relay` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHeader {
    /// Server-assigned client id.
    pub client_id: ClientId,
    /// Pair that encoded the payload; `None` on probe exchanges.
    pub pair_id: Option<PairId>,
    /// Codec mode of the body.
    pub encode_type: EncodeType,
    /// Route was encoded.
    pub url_encoded: bool,
    /// `x-mte-relay-eh` is present and encoded.
    pub headers_encoded: bool,
    /// Body was encoded.
    pub body_encoded: bool,
}

impl RelayHeader {
    /// Header for a handshake call that carries only the client id.
    pub fn probe(client_id: ClientId) -> Self {
        Self {
            client_id,
            pair_id: None,
            encode_type: EncodeType::Mte,
            url_encoded: false,
            headers_encoded: false,
            body_encoded: false,
        }
    }

    /// Header for a relayed request or response encoded with `pair_id`.
    pub fn relayed(client_id: ClientId, pair_id: PairId, encode_type: EncodeType) -> Self {
        Self {
            client_id,
            pair_id: Some(pair_id),
            encode_type,
            url_encoded: true,
            headers_encoded: true,
            body_encoded: true,
        }
    }

    /// Parse the header value.
    pub fn parse(value: &str) -> Result<Self, TypesError> {
        let fields: Vec<&str> = value.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [client_id] => Ok(Self::probe(ClientId::new(*client_id))),
            [client_id, pair_id, encode_type, url, headers, body] => {
                let pair_id = if pair_id.is_empty() {
                    None
                } else {
                    Some(PairId::new(*pair_id))
                };
                Ok(Self {
                    client_id: ClientId::new(*client_id),
                    pair_id,
                    encode_type: EncodeType::from_flag(encode_type)?,
                    url_encoded: parse_flag("url", url)?,
                    headers_encoded: parse_flag("headers", headers)?,
                    body_encoded: parse_flag("body", body)?,
                })
            }
            _ => Err(TypesError::InvalidHeader(format!(
                "expected 1 or 6 fields, got {}",
                fields.len()
            ))),
        }
    }
}

fn parse_flag(name: &str, flag: &str) -> Result<bool, TypesError> {
    match flag {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(TypesError::InvalidHeader(format!(
            "{} flag must be 0 or 1, got '{}'",
            name, other
        ))),
    }
}

impl fmt::Display for RelayHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pair_id = self.pair_id.as_ref().map(PairId::as_str).unwrap_or("");
        write!(
            f,
            "{},{},{},{},{},{}",
            self.client_id,
            pair_id,
            self.encode_type as u8,
            u8::from(self.url_encoded),
            u8::from(self.headers_encoded),
            u8::from(self.body_encoded)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_relayed_header() {
        let header = RelayHeader::relayed(ClientId::new("c1"), PairId::new("p1"), EncodeType::Mke);
        assert_eq!(header.to_string(), "c1,p1,1,1,1,1");
    }

    #[test]
    fn parses_what_it_formats() {
        let mut header =
            RelayHeader::relayed(ClientId::new("client"), PairId::new("pair"), EncodeType::Mte);
        header.body_encoded = false;
        let parsed = RelayHeader::parse(&header.to_string()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn single_field_is_probe_response() {
        let parsed = RelayHeader::parse("fresh-client").unwrap();
        assert_eq!(parsed.client_id.as_str(), "fresh-client");
        assert!(parsed.pair_id.is_none());
    }

    #[test]
    fn empty_pair_field_parses_as_none() {
        let parsed = RelayHeader::parse("c1,,0,0,0,0").unwrap();
        assert!(parsed.pair_id.is_none());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(RelayHeader::parse("a,b").is_err());
        assert!(RelayHeader::parse("a,b,0,1,1,1,extra").is_err());
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(RelayHeader::parse("c,p,2,1,1,1").is_err());
        assert!(RelayHeader::parse("c,p,0,yes,1,1").is_err());
    }
}
