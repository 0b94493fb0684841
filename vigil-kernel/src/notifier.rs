//! Notification dispatcher: drains the event queue, logs every event and
//! forwards the interesting ones to the optional webhook.

use tokio::task::JoinHandle;
use tracing::{info, warn};
use vigil_core::Event;

use crate::config::NotificationsConfig;
use crate::mesh::EventReceiver;

pub struct Notifier {
    config: NotificationsConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: NotificationsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Delivery filter, applied after logging.
    pub fn should_send(&self, event: &Event) -> bool {
        let min = self.config.min_level_to_send;
        match event {
            Event::StatusChanged(change) if change.probe.is_some() => {
                self.config.on_probe_change && (change.new_status >= min || change.old_status >= min)
            }
            Event::NewProbe { probe, .. } => self.config.on_probe_change && probe.status >= min,
            Event::RemovedProbe { .. } => self.config.on_probe_change,
            Event::StatusChanged(_) | Event::NodeUp { .. } | Event::NodeDown { .. } => self.config.on_node_change,
            Event::Info { .. } => true,
        }
    }

    fn dispatch(&self, event: Event) {
        info!(
            kind = kind(&event),
            severity = ?event.severity(),
            hostname = event.hostname().unwrap_or("-"),
            "{}",
            event.message()
        );

        if !self.config.http_enabled || !self.should_send(&event) {
            return;
        }
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "cannot encode notification");
                return;
            }
        };

        // One task per delivery so a slow endpoint never holds the queue.
        let client = self.client.clone();
        let url = self.config.http_url.clone();
        tokio::spawn(async move {
            let sent = client.post(&url).form(&[("Notification", payload)]).send().await;
            match sent.and_then(|r| r.error_for_status()) {
                Ok(_) => {}
                Err(e) => warn!(url = %url, error = %e, "webhook delivery failed"),
            }
        });
    }

    pub fn spawn(self, mut events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.dispatch(event);
            }
            info!("event queue closed, notifier stopped");
        })
    }
}

fn kind(event: &Event) -> &'static str {
    match event {
        Event::NewProbe { .. } => "new_probe",
        Event::RemovedProbe { .. } => "removed_probe",
        Event::StatusChanged(_) => "status_changed",
        Event::NodeUp { .. } => "node_up",
        Event::NodeDown { .. } => "node_down",
        Event::Info { .. } => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Form, routing::post, Router};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use vigil_core::{ProbeResult, StatusChange};

    fn change(probe: Option<&str>, old: i32, new: i32) -> Event {
        Event::StatusChanged(StatusChange {
            hostname: "web-1".into(),
            probe: probe.map(str::to_string),
            old_status: old,
            new_status: new,
            message: String::new(),
            probes_in_error: Vec::new(),
        })
    }

    #[test]
    fn test_filters() {
        let notifier = Notifier::new(NotificationsConfig {
            min_level_to_send: 200,
            on_node_change: false,
            ..NotificationsConfig::default()
        });

        assert!(notifier.should_send(&change(Some("disk"), 100, 300)));
        assert!(notifier.should_send(&change(Some("disk"), 300, 100)));
        assert!(!notifier.should_send(&change(Some("disk"), 100, 150)));
        assert!(!notifier.should_send(&change(None, 100, 300)));
        assert!(!notifier.should_send(&Event::NodeUp { uuid: "u".into(), hostname: "h".into() }));
        assert!(notifier.should_send(&Event::info("hello")));
        assert!(!notifier.should_send(&Event::NewProbe {
            hostname: "h".into(),
            probe: ProbeResult::new("p", 100, 0, "ok"),
        }));
    }

    #[tokio::test]
    async fn test_webhook_receives_form_field() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let app = Router::new().route(
            "/hook",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let tx = tx.clone();
                async move {
                    if let Some(body) = form.get("Notification") {
                        let _ = tx.send(body.clone());
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let notifier = Notifier::new(NotificationsConfig {
            http_enabled: true,
            http_url: format!("http://{addr}/hook"),
            ..NotificationsConfig::default()
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        notifier.spawn(events_rx);
        events_tx.send(Event::info("new client web-1")).unwrap();

        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let event: Event = serde_json::from_str(&body).unwrap();
        assert_eq!(event, Event::info("new client web-1"));
    }
}
