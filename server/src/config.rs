//! Server configuration structures.  An external loader populates these;
//! the defaults match a stand-alone live relay.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub chunk_size: u32,
    pub window_ack_size: u32,
    pub peer_bandwidth: u32,
    pub notify: NotifyConfig,
    pub recorders: Vec<RecorderConfig>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            bind_address: "0.0.0.0:1935".to_string(),
            chunk_size: 4096,
            window_ack_size: 2_500_000,
            peer_bandwidth: 2_500_000,
            notify: NotifyConfig::default(),
            recorders: Vec::new(),
        }
    }
}

/// Webhook endpoints fired at connection and stream lifecycle points.
/// Absent entries disable the respective notification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub on_open: Option<String>,
    pub on_close: Option<String>,
    pub publish: Option<String>,
    pub unpublish: Option<String>,
    pub play: Option<String>,
    pub unplay: Option<String>,
    pub on_record: Option<String>,
    pub on_record_done: Option<String>,
}

/// One recorder started for every published stream
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub mode: String,
    pub directory: String,
    pub file_name: String,
    pub unique: bool,
    pub append: bool,
    pub max_duration: u32,
    pub max_size: u64,
    pub max_frames: u32,
}

impl Default for RecorderConfig {
    fn default() -> RecorderConfig {
        RecorderConfig {
            mode: "all".to_string(),
            directory: "dvr".to_string(),
            file_name: "${APPLICATION}-${INSTANCE}-${STREAM}".to_string(),
            unique: true,
            append: false,
            max_duration: 0,
            max_size: 0,
            max_frames: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_wire_parameters() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_address, "0.0.0.0:1935");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.window_ack_size, 2_500_000);
        assert_eq!(config.peer_bandwidth, 2_500_000);
        assert!(config.notify.on_open.is_none());
    }
}
