//! Serde helpers shared by the configuration sections

/// Timeouts written as seconds
///
/// Whole seconds are written as integers. Reading also accepts fractions
/// such as `connect_timeout = 0.5` for fast local networks.
pub mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Whole(u64),
        Fraction(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Seconds::deserialize(deserializer)? {
            Seconds::Whole(secs) => Ok(Duration::from_secs(secs)),
            Seconds::Fraction(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| D::Error::custom(format!("{} is not a valid number of seconds", secs))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        connect: Duration,
    }

    #[test]
    fn test_whole_seconds_stay_integers() {
        let timeouts = Timeouts {
            connect: Duration::from_secs(2),
        };
        assert_eq!(serde_json::to_string(&timeouts).unwrap(), r#"{"connect":2}"#);

        let timeouts: Timeouts = toml::from_str("connect = 10").unwrap();
        assert_eq!(timeouts.connect, Duration::from_secs(10));
    }

    #[test]
    fn test_fractional_seconds() {
        let timeouts: Timeouts = toml::from_str("connect = 0.5").unwrap();
        assert_eq!(timeouts.connect, Duration::from_millis(500));
        assert_eq!(
            serde_json::to_string(&timeouts).unwrap(),
            r#"{"connect":0.5}"#
        );
    }

    #[test]
    fn test_negative_seconds_rejected() {
        assert!(toml::from_str::<Timeouts>("connect = -1.5").is_err());
        assert!(toml::from_str::<Timeouts>("connect = -3").is_err());
    }
}
