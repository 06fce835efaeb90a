//! Outbound HTTP lifecycle notifications.
//!
//! On each configured lifecycle event the server issues a GET whose query
//! string identifies the event and the connection.  A 2xx response accepts;
//! anything else rejects the RTMP command that triggered the notification.

use crate::config::NotifyConfig;
use reqwest::blocking::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification endpoint answered {status}")]
    Rejected { status: u16 },
}

/// The lifecycle events that can be announced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    OnOpen,
    OnClose,
    Publish,
    Unpublish,
    Play,
    Unplay,
    OnRecord,
    OnRecordDone,
}

impl NotifyEvent {
    fn call_name(&self) -> &'static str {
        match self {
            NotifyEvent::OnOpen => "onOpen",
            NotifyEvent::OnClose => "onClose",
            NotifyEvent::Publish => "publish",
            NotifyEvent::Unpublish => "unpublish",
            NotifyEvent::Play => "play",
            NotifyEvent::Unplay => "unplay",
            NotifyEvent::OnRecord => "onRecord",
            NotifyEvent::OnRecordDone => "onRecordDone",
        }
    }
}

pub struct Notifier {
    config: NotifyConfig,
    client: Client,
}

impl Notifier {
    pub fn new(config: NotifyConfig) -> Notifier {
        Notifier {
            config,
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    fn endpoint(&self, event: NotifyEvent) -> Option<&String> {
        match event {
            NotifyEvent::OnOpen => self.config.on_open.as_ref(),
            NotifyEvent::OnClose => self.config.on_close.as_ref(),
            NotifyEvent::Publish => self.config.publish.as_ref(),
            NotifyEvent::Unpublish => self.config.unpublish.as_ref(),
            NotifyEvent::Play => self.config.play.as_ref(),
            NotifyEvent::Unplay => self.config.unplay.as_ref(),
            NotifyEvent::OnRecord => self.config.on_record.as_ref(),
            NotifyEvent::OnRecordDone => self.config.on_record_done.as_ref(),
        }
    }

    /// Builds the query string for an event notification
    pub fn query_string(
        event: NotifyEvent,
        remote_addr: &str,
        app: &str,
        instance: &str,
        original_query: &str,
    ) -> String {
        let mut query = format!(
            "call={}&addr={}&app={}&inst={}",
            event.call_name(),
            remote_addr,
            app,
            instance
        );

        if event == NotifyEvent::OnOpen && !original_query.is_empty() {
            query.push('&');
            query.push_str(original_query);
        }

        query
    }

    /// Fires the notification if an endpoint is configured.  `Ok` means the
    /// triggering command may proceed.
    pub fn notify(
        &self,
        event: NotifyEvent,
        remote_addr: &str,
        app: &str,
        instance: &str,
        original_query: &str,
    ) -> Result<(), NotifyError> {
        let endpoint = match self.endpoint(event) {
            Some(endpoint) => endpoint,
            None => return Ok(()),
        };

        let query = Notifier::query_string(event, remote_addr, app, instance, original_query);
        let url = if endpoint.contains('?') {
            format!("{}&{}", endpoint, query)
        } else {
            format!("{}?{}", endpoint, query)
        };

        debug!(%url, "sending lifecycle notification");

        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_carries_the_event_and_identity() {
        let query = Notifier::query_string(
            NotifyEvent::Publish,
            "10.0.0.9:4455",
            "live",
            "_definst_",
            "",
        );

        assert_eq!(query, "call=publish&addr=10.0.0.9:4455&app=live&inst=_definst_");
    }

    #[test]
    fn on_open_appends_the_original_query() {
        let query = Notifier::query_string(
            NotifyEvent::OnOpen,
            "10.0.0.9:4455",
            "live",
            "studio",
            "token=abc",
        );

        assert_eq!(
            query,
            "call=onOpen&addr=10.0.0.9:4455&app=live&inst=studio&token=abc"
        );
    }

    #[test]
    fn unconfigured_endpoints_accept_without_a_request() {
        let notifier = Notifier::new(NotifyConfig::default());
        let result = notifier.notify(NotifyEvent::Publish, "addr", "app", "inst", "");
        assert!(result.is_ok());
    }
}
