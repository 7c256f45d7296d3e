//! User identifiers and the roster record pushed to shard workers.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Stable identifier of an end user.
///
/// Users created by the web tier have numeric ids; anonymous and imported
/// users may carry an opaque string instead. A string in canonical decimal
/// form (digits only, no leading zero unless it is `"0"`) is normalised to
/// [`UserId::Numeric`], so the path segment `"42"` and the JSON number `42`
/// name the same user. `"042"` or `"+42"` stay opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum UserId {
    Numeric(u64),
    Named(String),
}

impl FromStr for UserId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let canonical = s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'));
        Ok(match s.parse::<u64>() {
            Ok(n) if canonical => UserId::Numeric(n),
            _ => UserId::Named(s.to_string()),
        })
    }
}

impl From<u64> for UserId {
    fn from(n: u64) -> Self {
        UserId::Numeric(n)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        match s.parse::<UserId>() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Numeric(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Numeric(n) => UserId::Numeric(n),
            Raw::Text(s) => UserId::from(s.as_str()),
        })
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Numeric(n) => write!(f, "{n}"),
            UserId::Named(s) => f.write_str(s),
        }
    }
}

/// One entry of a shard's user roster.
///
/// These are exactly the fields a worker needs to resume a user's engine;
/// everything else about the user stays in the web tier's database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub cloud_id: String,
    pub auth_token: String,
    #[serde(default)]
    pub developer_key: Option<String>,
    pub locale: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub storage_key: Option<String>,
    #[serde(default)]
    pub model_tag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_strings_normalise() {
        assert_eq!(UserId::from("42"), UserId::Numeric(42));
        assert_eq!(UserId::from("web-abcd"), UserId::Named("web-abcd".into()));
        assert_eq!(UserId::from("0"), UserId::Numeric(0));
    }

    #[test]
    fn non_canonical_numbers_stay_opaque() {
        for raw in ["007", "+7", "00", "-7", ""] {
            assert_eq!(UserId::from(raw), UserId::Named(raw.into()), "{raw:?}");
        }
        assert_ne!(UserId::from("007"), UserId::from("7"));
        // Too large for u64.
        assert_eq!(
            UserId::from("18446744073709551616"),
            UserId::Named("18446744073709551616".into())
        );
        assert_eq!(UserId::from("007").to_string(), "007");
    }

    #[test]
    fn json_shape_follows_variant() {
        assert_eq!(serde_json::to_string(&UserId::Numeric(7)).unwrap(), "7");
        assert_eq!(
            serde_json::to_string(&UserId::Named("x".into())).unwrap(),
            "\"x\""
        );

        let parsed: UserId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, UserId::Numeric(7));
        let parsed: UserId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(parsed, UserId::Numeric(7));
    }

    #[test]
    fn roster_record_defaults_optional_fields() {
        let rec: UserRecord = serde_json::from_str(
            r#"{"id": 1, "cloud_id": "101", "auth_token": "t", "locale": "en-US"}"#,
        )
        .unwrap();
        assert_eq!(rec.id, UserId::Numeric(1));
        assert!(rec.developer_key.is_none());
        assert!(rec.model_tag.is_none());
    }
}
