//! AlertManager: threshold rules over metrics samples
//!
//! Subscribes to the bus, evaluates a declarative rule list against every
//! MetricsSampled event, persists fired alerts, publishes them on the alert
//! channel, and suppresses repeats of the same (level, message) until the
//! alert is acknowledged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use droidfarm_core::alert::{Alert, AlertLevel};
use droidfarm_core::events::{EventBus, OrchestratorEvent};
use droidfarm_core::metrics::MetricsSnapshot;
use droidfarm_durable::{CreateAlert, DurableStore};
use droidfarm_live::{keys, LiveStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparator {
    fn holds(self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Gte => observed >= threshold,
            Self::Lt => observed < threshold,
            Self::Lte => observed <= threshold,
            Self::Eq => (observed - threshold).abs() < f64::EPSILON,
        }
    }
}

/// One declarative threshold rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Gauge name as understood by [`MetricsSnapshot::gauge`]
    pub gauge: String,
    pub comparator: Comparator,
    pub value: f64,
    /// Consecutive breaching samples before the rule fires
    pub for_samples: u32,
    pub level: AlertLevel,
    pub message: String,
}

impl AlertRule {
    pub fn new(
        gauge: impl Into<String>,
        comparator: Comparator,
        value: f64,
        level: AlertLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            gauge: gauge.into(),
            comparator,
            value,
            for_samples: 1,
            level,
            message: message.into(),
        }
    }

    pub fn with_duration(mut self, samples: u32) -> Self {
        self.for_samples = samples.max(1);
        self
    }
}

/// Rules a fresh deployment starts with
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "online_nodes",
            Comparator::Eq,
            0.0,
            AlertLevel::Critical,
            "no nodes online",
        )
        .with_duration(2),
        AlertRule::new(
            "devices_QUARANTINE",
            Comparator::Gt,
            0.0,
            AlertLevel::Warning,
            "devices in quarantine",
        ),
        AlertRule::new(
            "memory_percent",
            Comparator::Gt,
            90.0,
            AlertLevel::Critical,
            "orchestrator memory above 90%",
        )
        .with_duration(3),
    ]
}

pub struct AlertManager {
    durable: Arc<dyn DurableStore>,
    live: Arc<dyn LiveStore>,
    bus: EventBus,
    rules: Vec<AlertRule>,
    /// Breach streak per rule index
    streaks: Mutex<HashMap<usize, u32>>,
    /// Fired (level, message) pairs suppressed until acknowledged
    suppressed: Mutex<HashSet<(AlertLevel, String)>>,
}

impl AlertManager {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        live: Arc<dyn LiveStore>,
        bus: EventBus,
        rules: Vec<AlertRule>,
    ) -> Arc<Self> {
        Arc::new(Self {
            durable,
            live,
            bus,
            rules,
            streaks: Mutex::new(HashMap::new()),
            suppressed: Mutex::new(HashSet::new()),
        })
    }

    /// Consume MetricsSampled events until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Ok(OrchestratorEvent::MetricsSampled { snapshot }) => {
                            self.evaluate(&snapshot).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "alert manager lagged on bus events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("alert manager stopped");
    }

    /// Evaluate every rule against one sample
    pub async fn evaluate(&self, snapshot: &MetricsSnapshot) {
        let mut fired = Vec::new();
        {
            let mut streaks = self.streaks.lock();
            for (index, rule) in self.rules.iter().enumerate() {
                let Some(observed) = snapshot.gauge(&rule.gauge) else {
                    streaks.remove(&index);
                    continue;
                };
                if rule.comparator.holds(observed, rule.value) {
                    let streak = streaks.entry(index).or_insert(0);
                    *streak += 1;
                    if *streak >= rule.for_samples {
                        fired.push((rule.clone(), observed));
                    }
                } else {
                    streaks.remove(&index);
                }
            }
        }

        for (rule, observed) in fired {
            self.fire(rule, observed).await;
        }
    }

    async fn fire(&self, rule: AlertRule, observed: f64) {
        {
            let mut suppressed = self.suppressed.lock();
            if !suppressed.insert((rule.level, rule.message.clone())) {
                // Already fired and not yet acknowledged
                return;
            }
        }

        let alert = Alert::new(rule.level, rule.message.clone())
            .with_source("alert-manager")
            .with_data(serde_json::json!({
                "gauge": rule.gauge,
                "observed": observed,
                "threshold": rule.value,
            }));
        info!(level = %alert.level, message = %alert.message, observed, "alert fired");

        // Persistence and channel publish are fire-and-forget: an alert must
        // never block or fail the metrics path
        let durable = self.durable.clone();
        let record = CreateAlert {
            level: alert.level,
            message: alert.message.clone(),
            source: alert.source.clone(),
            data: alert.data.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = durable.insert_alert(record).await {
                warn!(error = %e, "alert persist failed");
            }
        });

        if let Ok(payload) = serde_json::to_string(&alert) {
            let live = self.live.clone();
            tokio::spawn(async move {
                if let Err(e) = live.publish(keys::CHANNEL_ALERTS, &payload).await {
                    debug!(error = %e, "alert channel publish failed");
                }
            });
        }

        self.bus.emit(OrchestratorEvent::AlertFired { alert });
    }

    /// Acknowledge clears suppression so the condition can fire again
    pub async fn acknowledge(&self, alert_id: i64, by: &str) -> bool {
        match self.durable.acknowledge_alert(alert_id, by).await {
            Ok(Some(row)) => {
                let level = match row.level.as_str() {
                    "critical" => AlertLevel::Critical,
                    "warning" => AlertLevel::Warning,
                    _ => AlertLevel::Info,
                };
                self.suppressed.lock().remove(&(level, row.message));
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(alert_id, error = %e, "acknowledge failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use droidfarm_durable::InMemoryDurableStore;
    use droidfarm_live::InMemoryLiveStore;

    fn snapshot_with(gauge_setup: impl Fn(&mut MetricsSnapshot)) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::empty(Utc::now());
        gauge_setup(&mut snapshot);
        snapshot
    }

    fn manager(rules: Vec<AlertRule>) -> (Arc<AlertManager>, Arc<InMemoryDurableStore>, EventBus) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let bus = EventBus::new();
        let alerts = AlertManager::new(
            durable.clone(),
            Arc::new(InMemoryLiveStore::new()),
            bus.clone(),
            rules,
        );
        (alerts, durable, bus)
    }

    #[tokio::test]
    async fn rule_fires_once_until_acknowledged() {
        let (alerts, durable, bus) = manager(vec![AlertRule::new(
            "devices_QUARANTINE",
            Comparator::Gt,
            0.0,
            AlertLevel::Warning,
            "devices in quarantine",
        )]);
        let mut rx = bus.subscribe();

        let bad = snapshot_with(|s| {
            s.devices_by_state.insert("QUARANTINE".into(), 2);
        });
        alerts.evaluate(&bad).await;
        alerts.evaluate(&bad).await;

        // one bus event, deduped second evaluation
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "alert:fired");
        assert!(rx.try_recv().is_err());

        // wait for the fire-and-forget persist
        tokio::task::yield_now().await;
        let active = durable.list_active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);

        // acknowledge, breach again -> fires again
        assert!(alerts.acknowledge(active[0].id, "operator").await);
        alerts.evaluate(&bad).await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind(), "alert:fired");
    }

    #[tokio::test]
    async fn duration_rules_need_consecutive_breaches() {
        let (alerts, _durable, bus) = manager(vec![AlertRule::new(
            "online_nodes",
            Comparator::Eq,
            0.0,
            AlertLevel::Critical,
            "no nodes online",
        )
        .with_duration(2)]);
        let mut rx = bus.subscribe();

        let empty = snapshot_with(|_| {});
        let healthy = snapshot_with(|s| s.online_nodes = 3);

        alerts.evaluate(&empty).await;
        assert!(rx.try_recv().is_err(), "first breach must not fire");

        alerts.evaluate(&healthy).await;
        alerts.evaluate(&empty).await;
        assert!(rx.try_recv().is_err(), "streak reset by healthy sample");

        alerts.evaluate(&empty).await;
        alerts.evaluate(&empty).await;
        assert_eq!(rx.recv().await.unwrap().kind(), "alert:fired");
    }
}
