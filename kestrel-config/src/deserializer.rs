pub mod hhmm {
    use chrono::NaiveTime;
    use serde::de::{Deserialize, Deserializer, Error};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|err| Error::custom(format!("invalid wall-clock time '{raw}': {err}")))
    }
}
