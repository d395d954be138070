//! Transportable pairing codes
//!
//! A pairing code is the couple's identity, the partners' story metadata and
//! the pairing secret, serialized as JSON and encoded as unpadded base64url so
//! it survives QR codes, URLs and manual typing.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use duet_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Title used when the initiating device did not choose one
pub const DEFAULT_COVER_TITLE: &str = "Our Memories";

/// Codes older than this are still accepted but logged as stale
pub const STALE_AFTER_HOURS: i64 = 24;

/// Everything a joining device needs to materialise the couple locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    pub couple_id: String,
    pub partner_a_name: String,
    pub partner_b_name: String,
    #[serde(default = "default_cover_title")]
    pub cover_title: String,
    pub love_date: String,
    pub story_start: String,
    /// The one-time pairing secret
    pub pairing_token: String,
    /// Milliseconds since the Unix epoch at which the code was generated
    #[serde(default)]
    pub timestamp: i64,
}

fn default_cover_title() -> String {
    DEFAULT_COVER_TITLE.to_string()
}

impl PairingPayload {
    /// Build a payload stamped with the current time
    pub fn new(
        couple_id: impl Into<String>,
        partner_a_name: impl Into<String>,
        partner_b_name: impl Into<String>,
        cover_title: Option<String>,
        love_date: impl Into<String>,
        story_start: impl Into<String>,
        pairing_token: impl Into<String>,
    ) -> Self {
        Self {
            couple_id: couple_id.into(),
            partner_a_name: partner_a_name.into(),
            partner_b_name: partner_b_name.into(),
            cover_title: cover_title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(default_cover_title),
            love_date: love_date.into(),
            story_start: story_start.into(),
            pairing_token: pairing_token.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Whether the code was generated more than 24 hours before `now_ms`
    ///
    /// The timestamp comes from the code itself, so any value is tolerated.
    pub fn is_stale_at(&self, now_ms: i64) -> bool {
        let age_ms = now_ms.saturating_sub(self.timestamp);
        age_ms > Duration::hours(STALE_AFTER_HOURS).num_milliseconds()
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("coupleId", &self.couple_id),
            ("partnerAName", &self.partner_a_name),
            ("partnerBName", &self.partner_b_name),
            ("loveDate", &self.love_date),
            ("storyStart", &self.story_start),
            ("pairingToken", &self.pairing_token),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(invalid_format(format!("missing required field: {}", field)));
            }
        }
        Ok(())
    }
}

fn invalid_format<D: std::fmt::Display>(detail: D) -> Error {
    Error::validation(format!("Invalid pairing code format: {}", detail))
}

/// Encode a payload into a pairing code
pub fn encode(payload: &PairingPayload) -> Result<String> {
    payload.validate()?;
    let json = serde_json::to_vec(payload)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a pairing code
///
/// Whitespace from display grouping and trailing `=` padding are ignored.
pub fn decode(code: &str) -> Result<PairingPayload> {
    let compact: String = code
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_string();
    if compact.is_empty() {
        return Err(invalid_format("empty code"));
    }

    let bytes = URL_SAFE_NO_PAD.decode(compact.as_bytes()).map_err(invalid_format)?;
    let payload: PairingPayload = serde_json::from_slice(&bytes).map_err(invalid_format)?;
    payload.validate()?;

    if payload.is_stale_at(Utc::now().timestamp_millis()) {
        warn!(
            "Pairing code for couple {} is older than {} hours",
            payload.couple_id, STALE_AFTER_HOURS
        );
    }

    Ok(payload)
}

/// Group a code in blocks of four characters for reading aloud or typing
pub fn format_for_display(code: &str) -> String {
    code.chars()
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::mint_token;
    use base64::Engine as _;

    fn sample() -> PairingPayload {
        PairingPayload::new(
            "id_k3j4h5_1700000000000",
            "Maya",
            "Theo",
            Some("Us, Always".to_string()),
            "2021-02-14",
            "We met at a bookshop on a rainy Tuesday ☔",
            mint_token().unwrap().expose(),
        )
    }

    #[test]
    fn test_round_trip() {
        let payload = sample();
        let code = encode(&payload).unwrap();
        assert!(code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(decode(&code).unwrap(), payload);
    }

    #[test]
    fn test_display_grouping_decodes() {
        let payload = sample();
        let code = encode(&payload).unwrap();
        let display = format_for_display(&code);
        assert!(display.split(' ').all(|group| group.len() <= 4));
        assert_eq!(decode(&display).unwrap(), payload);
    }

    #[test]
    fn test_reads_padded_web_client_codes() {
        // Shape produced by the web client: padded base64url, camelCase keys
        let json = r#"{"coupleId":"c1","partnerAName":"A","partnerBName":"B","loveDate":"2020-01-01","storyStart":"once","pairingToken":"abc","timestamp":1700000000000}"#;
        let code = base64::engine::general_purpose::URL_SAFE.encode(json);
        let payload = decode(&code).unwrap();
        assert_eq!(payload.couple_id, "c1");
        assert_eq!(payload.cover_title, DEFAULT_COVER_TITLE);
        assert!(payload.is_stale_at(Utc::now().timestamp_millis()));
    }

    #[test]
    fn test_missing_field_is_invalid() {
        let json = r#"{"coupleId":"c1","partnerAName":"A","partnerBName":"B","loveDate":"2020-01-01","storyStart":"once"}"#;
        let code = URL_SAFE_NO_PAD.encode(json);
        assert!(matches!(decode(&code), Err(Error::Validation(_))));

        let json = r#"{"coupleId":"c1","partnerAName":"","partnerBName":"B","loveDate":"2020-01-01","storyStart":"once","pairingToken":"t"}"#;
        let code = URL_SAFE_NO_PAD.encode(json);
        assert!(matches!(decode(&code), Err(Error::Validation(_))));
    }

    #[test]
    fn test_malformed_codes() {
        assert!(matches!(decode(""), Err(Error::Validation(_))));
        assert!(matches!(decode("!!!not base64!!!"), Err(Error::Validation(_))));
        let not_json = URL_SAFE_NO_PAD.encode("hello");
        assert!(matches!(decode(&not_json), Err(Error::Validation(_))));
    }

    #[test]
    fn test_fresh_code_is_not_stale() {
        let payload = sample();
        assert!(!payload.is_stale_at(payload.timestamp + 1000));
        let day_later = payload.timestamp + Duration::hours(25).num_milliseconds();
        assert!(payload.is_stale_at(day_later));
    }

    #[test]
    fn test_extreme_timestamps_decode() {
        for timestamp in [i64::MIN, i64::MIN + 1, -1, i64::MAX] {
            let json = format!(
                r#"{{"coupleId":"c1","partnerAName":"A","partnerBName":"B","loveDate":"2020-01-01","storyStart":"once","pairingToken":"t","timestamp":{}}}"#,
                timestamp
            );
            let payload = decode(&URL_SAFE_NO_PAD.encode(json)).unwrap();
            assert_eq!(payload.timestamp, timestamp);
        }

        let ancient = PairingPayload {
            timestamp: i64::MIN,
            ..sample()
        };
        assert!(ancient.is_stale_at(i64::MAX));
        assert!(ancient.is_stale_at(0));

        let future = PairingPayload {
            timestamp: i64::MAX,
            ..sample()
        };
        assert!(!future.is_stale_at(i64::MIN));
        assert!(!future.is_stale_at(Utc::now().timestamp_millis()));
    }
}
