//! Alert log.
//!
//! Turns sync events into operator-facing log lines. Threshold crossings
//! into an alert level are logged at `warn` unless they happen during quiet
//! hours; recoveries and suppressed alerts are logged at `info`.

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tanksync_core::{EventReceiver, Level, SyncEvent, Thresholds};

use crate::config::AlertsConfig;

/// What the alert log did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Logged as an alert.
    Alert(String),
    /// Logged as informational.
    Info(String),
    /// An alert during quiet hours.
    Suppressed(String),
    /// Not of interest.
    Ignored,
}

/// Classifies sync events for the operator.
#[derive(Debug, Clone)]
pub struct AlertLog {
    enabled: bool,
    thresholds: Thresholds,
}

impl AlertLog {
    pub fn new(config: &AlertsConfig) -> Self {
        Self {
            enabled: config.enabled,
            thresholds: Thresholds::new(config.limits.clone()),
        }
    }

    /// Decide how to report one event.
    pub fn classify(&self, event: &SyncEvent) -> Notice {
        match event {
            SyncEvent::ThresholdCrossed {
                sensor_id,
                metric,
                level,
                value,
                timestamp,
            } => {
                if !self.enabled {
                    return Notice::Ignored;
                }
                let unit = metric.unit();
                match level {
                    Level::Normal => Notice::Info(format!(
                        "{} back to normal: {}{}",
                        sensor_id, value, unit
                    )),
                    _ => {
                        let message = format!(
                            "{} {} {:?}: {}{}",
                            sensor_id,
                            metric.label(),
                            level,
                            value,
                            unit
                        );
                        if self.thresholds.is_quiet(*timestamp) {
                            Notice::Suppressed(message)
                        } else {
                            Notice::Alert(message)
                        }
                    }
                }
            }
            SyncEvent::GapUnresolved {
                sensor_id,
                missing,
                error,
            } => Notice::Alert(format!(
                "{} is missing readings {}: {}",
                sensor_id, missing, error
            )),
            SyncEvent::Unauthorized { sensor_id, message } => Notice::Alert(format!(
                "{} needs re-authentication: {}",
                sensor_id, message
            )),
            SyncEvent::GapClosed { sensor_id, range } => {
                Notice::Info(format!("{} backfilled {}", sensor_id, range))
            }
            _ => Notice::Ignored,
        }
    }

    /// Log events until cancelled or the event channel closes.
    pub async fn run(self, mut events: EventReceiver, cancel: CancellationToken) {
        info!("Alert log started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => match self.classify(&event) {
                    Notice::Alert(message) => warn!(alert = true, "{}", message),
                    Notice::Info(message) => info!("{}", message),
                    Notice::Suppressed(message) => info!(quiet_hours = true, "{}", message),
                    Notice::Ignored => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    error!(skipped, "Alert log fell behind; events were dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Alert log stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanksync_core::{EventDispatcher, QuietHours, SequenceRange, Timestamp};
    use tanksync_types::Metric;

    const NOON: i64 = 12 * 3_600_000;
    const MIDNIGHT: i64 = 24 * 3_600_000;

    fn crossed(level: Level, at: i64) -> SyncEvent {
        SyncEvent::ThresholdCrossed {
            sensor_id: "tank-1/temperature".to_string(),
            metric: Metric::Temperature,
            level,
            value: 29.5,
            timestamp: Timestamp::from_millis(at),
        }
    }

    #[test]
    fn test_alert_outside_quiet_hours() {
        let log = AlertLog::new(&AlertsConfig::default());
        let Notice::Alert(message) = log.classify(&crossed(Level::High, NOON)) else {
            panic!("expected alert");
        };
        assert!(message.contains("tank-1/temperature"));
        assert!(message.contains("29.5°C"));
    }

    #[test]
    fn test_alert_suppressed_during_quiet_hours() {
        let log = AlertLog::new(&AlertsConfig::default());
        assert!(matches!(
            log.classify(&crossed(Level::High, MIDNIGHT)),
            Notice::Suppressed(_)
        ));

        let mut config = AlertsConfig::default();
        config.limits.quiet_hours = QuietHours {
            enabled: false,
            ..QuietHours::default()
        };
        let log = AlertLog::new(&config);
        assert!(matches!(
            log.classify(&crossed(Level::High, MIDNIGHT)),
            Notice::Alert(_)
        ));
    }

    #[test]
    fn test_recovery_and_disabled() {
        let log = AlertLog::new(&AlertsConfig::default());
        assert!(matches!(
            log.classify(&crossed(Level::Normal, NOON)),
            Notice::Info(_)
        ));

        let log = AlertLog::new(&AlertsConfig {
            enabled: false,
            ..AlertsConfig::default()
        });
        assert_eq!(log.classify(&crossed(Level::High, NOON)), Notice::Ignored);
    }

    #[test]
    fn test_sync_problems_always_alert() {
        let log = AlertLog::new(&AlertsConfig {
            enabled: false,
            ..AlertsConfig::default()
        });
        let event = SyncEvent::GapUnresolved {
            sensor_id: "tank-1/ph".to_string(),
            missing: SequenceRange::new(3, 5).unwrap(),
            error: "timeout".to_string(),
        };
        assert!(matches!(log.classify(&event), Notice::Alert(_)));
        let event = SyncEvent::StateChanged {
            sensor_id: "tank-1/ph".to_string(),
            state: tanksync_core::ConnectionState::Live,
        };
        assert_eq!(log.classify(&event), Notice::Ignored);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dispatcher = EventDispatcher::new(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            AlertLog::new(&AlertsConfig::default()).run(dispatcher.subscribe(), cancel.clone()),
        );
        dispatcher.send(crossed(Level::High, NOON));
        cancel.cancel();
        task.await.unwrap();
    }
}
