/// The configuration options that govern how a RTMP server session operates
#[derive(Clone)]
pub struct ServerSessionConfig {
    pub fms_version: String,
    pub chunk_size: u32,
    pub peer_bandwidth: u32,
    pub window_ack_size: u32,
}

impl ServerSessionConfig {
    pub fn new() -> ServerSessionConfig {
        ServerSessionConfig {
            fms_version: "FMS/5,0,3,3029".to_string(),
            chunk_size: 4096,
            peer_bandwidth: 2_500_000,
            window_ack_size: 2_500_000,
        }
    }
}

impl Default for ServerSessionConfig {
    fn default() -> ServerSessionConfig {
        ServerSessionConfig::new()
    }
}
