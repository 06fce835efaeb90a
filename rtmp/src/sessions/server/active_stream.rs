use super::PublishMode;

/// A message stream that was brought to life by a createStream command
#[derive(Debug)]
pub struct ActiveStream {
    pub current_state: StreamState,
}

#[derive(Debug)]
pub enum StreamState {
    Created,

    Publishing {
        stream_key: String,
        mode: PublishMode,
    },

    Playing {
        stream_key: String,
    },
}
