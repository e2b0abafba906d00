//! Serialization utilities for configuration types
//!
//! Durations in faultline configuration documents are written as integer
//! milliseconds (`timeout = 3000`), matching how operators usually express
//! command timeouts and retry waits.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Custom serialization module for Duration as milliseconds
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use faultline_common::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::*;

    /// Serde serialization result type
    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize a Duration as milliseconds, saturating at `u64::MAX`
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Deserialize milliseconds (u64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for serialization utilities

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        #[serde(with = "duration_millis")]
        timeout: Duration,
        name: String,
    }

    /// Tests that Duration serializes to milliseconds as u64
    #[test]
    fn test_duration_millis_serialize() {
        let data = TestStruct { timeout: Duration::from_millis(1500), name: "test".to_string() };

        let json = serde_json::to_string(&data).expect("Should serialize valid struct");
        assert!(json.contains("1500"), "Should contain milliseconds value");
    }

    /// Tests that milliseconds deserialize to Duration from a TOML document
    #[test]
    fn test_duration_millis_deserialize_toml() {
        let doc = "timeout = 2500\nname = \"cluster\"\n";
        let data: TestStruct = toml::from_str(doc).expect("Should deserialize valid TOML");

        assert_eq!(data.timeout, Duration::from_millis(2500));
        assert_eq!(data.name, "cluster");
    }

    #[test]
    fn test_duration_millis_saturates_huge_durations() {
        let data = TestStruct { timeout: Duration::MAX, name: "forever".to_string() };

        let json = serde_json::to_string(&data).expect("Should serialize");
        assert!(json.contains(&u64::MAX.to_string()));
    }

    #[test]
    fn test_duration_millis_deserialize_invalid_json() {
        let invalid_json = r#"{"timeout":"not_a_number","name":"test"}"#;
        let result: Result<TestStruct, _> = serde_json::from_str(invalid_json);
        assert!(result.is_err());
    }
}
