//! Application state shared across handlers.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;

use tanksync_core::SyncCoordinator;

use crate::config::Config;

/// Shared application state.
pub struct AppState {
    /// The sync engine.
    pub coordinator: SyncCoordinator,
    /// Configuration the server was started with.
    pub config: Config,
    /// Friendly names by sensor id.
    pub aliases: HashMap<String, String>,
    /// When the server started.
    pub started_at: OffsetDateTime,
}

impl AppState {
    /// Create new application state.
    pub fn new(coordinator: SyncCoordinator, config: Config) -> Arc<Self> {
        let aliases = config
            .effective_sensors()
            .into_iter()
            .filter_map(|s| s.alias.map(|alias| (s.id, alias)))
            .collect();
        Arc::new(Self {
            coordinator,
            config,
            aliases,
            started_at: OffsetDateTime::now_utc(),
        })
    }

    /// Alias configured for a sensor.
    pub fn alias(&self, sensor_id: &str) -> Option<&str> {
        self.aliases.get(sensor_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use crate::simulator::TankSimulator;
    use tanksync_core::Sources;

    fn coordinator(config: &Config) -> SyncCoordinator {
        let simulator = Arc::new(TankSimulator::new(config.simulation.clone()));
        let sources = Sources::new(simulator.clone(), simulator.clone(), simulator);
        SyncCoordinator::new(sources, config.sync_config()).unwrap()
    }

    #[tokio::test]
    async fn test_app_state_aliases() {
        let mut config = Config::default();
        config.sensors = vec![
            SensorConfig {
                id: "tank-1/ph".to_string(),
                metric: None,
                alias: Some("Main pH".to_string()),
            },
            SensorConfig {
                id: "tank-1/oxygen".to_string(),
                metric: None,
                alias: None,
            },
        ];
        let state = AppState::new(coordinator(&config), config);

        assert_eq!(state.alias("tank-1/ph"), Some("Main pH"));
        assert_eq!(state.alias("tank-1/oxygen"), None);
        assert!(state.started_at <= OffsetDateTime::now_utc());
    }
}
