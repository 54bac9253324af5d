use std::time::Duration;

/// Opaque configuration passed, unmodified, to the provider.
pub type BackendConf = hashbrown::HashMap<String, String>;

/// Options for configuring state stores.
///
/// May be flattened into the command line of a binary, or deserialized
/// from a configuration file. Omitted fields use the defaults below.
#[derive(clap::Args, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StateStoreConf {
    /// Name of the registered provider used to create state stores.
    #[arg(
        long = "state-store-provider",
        default_value = crate::FILE_PROVIDER,
        env = "SPARROW_STATE_STORE_PROVIDER"
    )]
    pub provider: String,

    /// Period between maintenance passes over the loaded providers.
    ///
    /// Read once, when the maintenance task starts.
    #[arg(
        long = "state-maintenance-interval-ms",
        default_value = "60000",
        value_parser = parse_millis,
        env = "SPARROW_STATE_MAINTENANCE_INTERVAL_MS"
    )]
    #[serde(rename = "maintenance_interval_ms", with = "millis")]
    pub maintenance_interval: Duration,

    /// Minimum number of delta files since the last snapshot before
    /// maintenance writes a new snapshot.
    #[arg(
        long = "state-min-deltas-for-snapshot",
        default_value = "10",
        env = "SPARROW_STATE_MIN_DELTAS_FOR_SNAPSHOT"
    )]
    pub min_deltas_for_snapshot: usize,

    /// Minimum number of recent versions which must remain recoverable.
    #[arg(
        long = "state-min-versions-to-retain",
        default_value = "100",
        env = "SPARROW_STATE_MIN_VERSIONS_TO_RETAIN"
    )]
    pub min_versions_to_retain: usize,

    /// Maximum number of versions a provider keeps materialized in memory.
    #[arg(
        long = "state-max-versions-in-memory",
        default_value = "2",
        env = "SPARROW_STATE_MAX_VERSIONS_IN_MEMORY"
    )]
    pub max_versions_in_memory: usize,
}

impl Default for StateStoreConf {
    fn default() -> Self {
        Self {
            provider: crate::FILE_PROVIDER.to_owned(),
            maintenance_interval: Duration::from_secs(60),
            min_deltas_for_snapshot: 10,
            min_versions_to_retain: 100,
            max_versions_in_memory: 2,
        }
    }
}

impl StateStoreConf {
    pub fn with_provider(self, provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..self
        }
    }

    pub fn with_maintenance_interval(self, maintenance_interval: Duration) -> Self {
        Self {
            maintenance_interval,
            ..self
        }
    }
}

fn parse_millis(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse().map(Duration::from_millis)
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(clap::Parser, Debug)]
    struct TestCommand {
        #[command(flatten)]
        state: StateStoreConf,
    }

    #[test]
    fn test_command_line_defaults_match_default() {
        let command = TestCommand::try_parse_from(["test"]).unwrap();
        assert_eq!(command.state, StateStoreConf::default());
    }

    #[test]
    fn test_command_line_overrides() {
        let command = TestCommand::try_parse_from([
            "test",
            "--state-store-provider",
            "sled",
            "--state-maintenance-interval-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(command.state.provider, "sled");
        assert_eq!(
            command.state.maintenance_interval,
            Duration::from_millis(250)
        );
        assert_eq!(command.state.min_versions_to_retain, 100);
    }

    #[test]
    fn test_deserialize_partial_conf() {
        let conf: StateStoreConf = serde_json::from_str(
            r#"{ "maintenance_interval_ms": 1500, "min_deltas_for_snapshot": 3 }"#,
        )
        .unwrap();
        assert_eq!(
            conf,
            StateStoreConf {
                maintenance_interval: Duration::from_millis(1500),
                min_deltas_for_snapshot: 3,
                ..StateStoreConf::default()
            }
        );
    }
}
