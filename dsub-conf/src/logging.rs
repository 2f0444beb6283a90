use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// Where log records go and which of them are kept.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    #[serde(deserialize_with = "level")]
    pub level: slog::Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: To::Console, level: slog::Level::Info, dir: "/var/log/dsub".into(), file: "dsub.log".into() }
    }
}

impl Log {
    /// `dir/file`, or just `file` when no directory is set.
    pub fn filename(&self) -> String {
        match (self.dir.is_empty(), self.file.is_empty()) {
            (_, true) => String::new(),
            (true, false) => self.file.clone(),
            (false, false) => format!("{}/{}", self.dir.trim_end_matches(['/', '\\']), self.file),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

fn level<'de, D: Deserializer<'de>>(d: D) -> Result<slog::Level, D::Error> {
    let s = String::deserialize(d)?;
    slog::Level::from_str(&s).map_err(|_| de::Error::custom(format!("bad log level {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_joins_dir() {
        let mut log = Log::default();
        assert_eq!(log.filename(), "/var/log/dsub/dsub.log");
        log.dir = "".into();
        assert_eq!(log.filename(), "dsub.log");
        log.file = "".into();
        assert_eq!(log.filename(), "");
    }
}
