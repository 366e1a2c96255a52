//! Pairing handshake payloads.
//!
//! The client posts a JSON array of [`PairOffer`]s and the server answers
//! with a JSON array of [`PairAnswer`]s. Field names are fixed by the
//! relay server. The client's encoder pairs with the server's decoder, so
//! `decoder_secret`/`decoder_nonce` seed the client encoder.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{PairId, TypesError};

/// One candidate pair offered by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairOffer {
    /// Id of the candidate pair.
    pub pair_id: PairId,
    /// Base64 KEM public key for the client encoder direction.
    pub encoder_public_key: String,
    /// Personalization string for the client encoder.
    #[serde(rename = "encoderPersonalizationStr")]
    pub encoder_personalization: String,
    /// Base64 KEM public key for the client decoder direction.
    pub decoder_public_key: String,
    /// Personalization string for the client decoder.
    #[serde(rename = "decoderPersonalizationStr")]
    pub decoder_personalization: String,
}

impl PairOffer {
    /// Build an offer, base64-encoding the raw public keys.
    pub fn new(
        pair_id: PairId,
        encoder_public_key: &[u8],
        encoder_personalization: String,
        decoder_public_key: &[u8],
        decoder_personalization: String,
    ) -> Self {
        Self {
            pair_id,
            encoder_public_key: STANDARD.encode(encoder_public_key),
            encoder_personalization,
            decoder_public_key: STANDARD.encode(decoder_public_key),
            decoder_personalization,
        }
    }

    /// Raw encoder public key.
    pub fn encoder_public_key_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(STANDARD.decode(&self.encoder_public_key)?)
    }

    /// Raw decoder public key.
    pub fn decoder_public_key_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(STANDARD.decode(&self.decoder_public_key)?)
    }
}

/// The server's answer for one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairAnswer {
    /// Pair being answered.
    pub pair_id: PairId,
    /// Base64 KEM ciphertext for the client encoder direction.
    pub decoder_secret: String,
    /// Decimal nonce for the client encoder direction.
    pub decoder_nonce: String,
    /// Base64 KEM ciphertext for the client decoder direction.
    pub encoder_secret: String,
    /// Decimal nonce for the client decoder direction.
    pub encoder_nonce: String,
}

impl PairAnswer {
    /// Encapsulated secret seeding the client encoder.
    pub fn decoder_secret_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(STANDARD.decode(&self.decoder_secret)?)
    }

    /// Encapsulated secret seeding the client decoder.
    pub fn encoder_secret_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(STANDARD.decode(&self.encoder_secret)?)
    }

    /// Nonce seeding the client encoder.
    pub fn decoder_nonce_value(&self) -> Result<u64, TypesError> {
        self.parse_nonce(&self.decoder_nonce)
    }

    /// Nonce seeding the client decoder.
    pub fn encoder_nonce_value(&self) -> Result<u64, TypesError> {
        self.parse_nonce(&self.encoder_nonce)
    }

    fn parse_nonce(&self, value: &str) -> Result<u64, TypesError> {
        value.trim().parse().map_err(|_| TypesError::InvalidNonce {
            pair_id: self.pair_id.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_uses_server_field_names() {
        let offer = PairOffer::new(
            PairId::new("p1"),
            &[1, 2, 3],
            "enc".into(),
            &[4, 5, 6],
            "dec".into(),
        );
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["pairId"], "p1");
        assert_eq!(json["encoderPublicKey"], "AQID");
        assert_eq!(json["encoderPersonalizationStr"], "enc");
        assert_eq!(json["decoderPublicKey"], "BAUG");
        assert_eq!(json["decoderPersonalizationStr"], "dec");
    }

    #[test]
    fn answer_parses_server_json() {
        let json = r#"[{"pairId":"p1","decoderSecret":"AQI=","decoderNonce":"42",
            "encoderSecret":"AwQ=","encoderNonce":"18446744073709551615"}]"#;
        let answers: Vec<PairAnswer> = serde_json::from_str(json).unwrap();
        let answer = &answers[0];
        assert_eq!(answer.pair_id.as_str(), "p1");
        assert_eq!(answer.decoder_secret_bytes().unwrap(), vec![1, 2]);
        assert_eq!(answer.encoder_secret_bytes().unwrap(), vec![3, 4]);
        assert_eq!(answer.decoder_nonce_value().unwrap(), 42);
        assert_eq!(answer.encoder_nonce_value().unwrap(), u64::MAX);
    }

    #[test]
    fn answer_rejects_non_numeric_nonce() {
        let answer = PairAnswer {
            pair_id: PairId::new("p1"),
            decoder_secret: String::new(),
            decoder_nonce: "abc".into(),
            encoder_secret: String::new(),
            encoder_nonce: "1".into(),
        };
        assert!(matches!(
            answer.decoder_nonce_value(),
            Err(TypesError::InvalidNonce { .. })
        ));
    }

    #[test]
    fn offer_public_keys_round_trip() {
        let offer = PairOffer::new(PairId::random(), &[9; 800], "e".into(), &[7; 800], "d".into());
        assert_eq!(offer.encoder_public_key_bytes().unwrap(), vec![9; 800]);
        assert_eq!(offer.decoder_public_key_bytes().unwrap(), vec![7; 800]);
    }
}
