use crate::error::Error;
use quire_output::RenderSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Evaluator settings, read from YAML.
///
/// ```yaml
/// reset_before_render: true
/// render:
///   flush_left: true
///   check_tick_interval_ms: 100
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Clear a cell's previous output before evaluating it again.
    pub reset_before_render: bool,
    pub render: RenderSettings,
}

impl Settings {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let yaml = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_fields_use_defaults() {
        let settings = Settings::from_yaml("render:\n  flush_left: true\n").unwrap();
        assert_eq!(
            settings,
            Settings {
                reset_before_render: false,
                render: RenderSettings {
                    flush_left: true,
                    check_tick_interval_ms: 200,
                },
            }
        );
        assert_eq!(Settings::from_yaml("").unwrap(), Settings::default());
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(matches!(
            Settings::from_yaml("reset_before_render: sometimes"),
            Err(Error::Settings(_))
        ));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quire.yaml");
        tokio::fs::write(&path, "reset_before_render: true\n").await.unwrap();
        assert!(Settings::load(&path).await.unwrap().reset_before_render);
        assert!(matches!(
            Settings::load(dir.path().join("missing.yaml")).await,
            Err(Error::Io(_))
        ));
    }
}
