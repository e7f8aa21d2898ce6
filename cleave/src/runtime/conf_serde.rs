//! Custom serde helpers for configuration fields.

pub mod level {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<Level>().map_err(serde::de::Error::custom)
    }
}

pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::duration")]
        d: Duration,
        #[serde(with = "super::level")]
        l: tracing::Level,
    }

    #[test]
    fn duration_and_level_round_trip() {
        let yaml = "d: 250ms\nl: debug\n";
        let w: Wrapper = serde_yaml_from(yaml);
        assert_eq!(w.d, Duration::from_millis(250));
        assert_eq!(w.l, tracing::Level::DEBUG);
    }

    fn serde_yaml_from(yaml: &str) -> Wrapper {
        use figment::providers::{Format, Yaml};
        use figment::Figment;
        Figment::from(Yaml::string(yaml)).extract().unwrap()
    }
}
