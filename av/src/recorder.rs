//! The media recorder lifecycle: Inactive -> Recording <-> Paused ->
//! Inactive, with a pluggable byte sink underneath a format remuxer.

use crate::events::{Dispatchable, EventDispatcher, EventListener};
use crate::format::{event_type, flv, mode, MediaStream, Remuxer, StreamEvent, StreamEventKind};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Recorder states
pub const STATE_INACTIVE: u32 = 0x00;
pub const STATE_RECORDING: u32 = 0x01;
pub const STATE_PAUSED: u32 = 0x02;

/// Recorder lifecycle event names
pub mod recorder_event {
    pub const START: &str = "start";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const STOP: &str = "stop";
    pub const ERROR: &str = "error";
}

/// What one recorder instance is allowed to do
#[derive(Debug, Clone, Default)]
pub struct MediaRecorderConstraints {
    pub mode: u32,
    pub directory: String,
    pub file_name: String,
    pub unique: bool,
    pub append: bool,
    pub chunks_per_segment: u32,
    pub segments_per_file: u32,
    pub max_duration: u32,
    pub max_size: u64,
    pub max_frames: u32,
}

/// Expands a file name template with the stream's identity
pub fn expand_template(template: &str, app: &str, instance: &str, stream: &str) -> String {
    template
        .replace("${APPLICATION}", app)
        .replace("${INSTANCE}", instance)
        .replace("${STREAM}", stream)
}

/// A recorder lifecycle event
pub struct RecorderEvent {
    pub kind: &'static str,
    pub error_name: Option<&'static str>,
    pub message: Option<String>,
    stopped: bool,
}

impl RecorderEvent {
    fn named(kind: &'static str) -> RecorderEvent {
        RecorderEvent {
            kind,
            error_name: None,
            message: None,
            stopped: false,
        }
    }

    fn error(name: &'static str, message: String) -> RecorderEvent {
        RecorderEvent {
            kind: recorder_event::ERROR,
            error_name: Some(name),
            message: Some(message),
            stopped: false,
        }
    }
}

impl Dispatchable for RecorderEvent {
    fn stop_propagation(&mut self) {
        self.stopped = true;
    }

    fn propagation_stopped(&self) -> bool {
        self.stopped
    }
}

/// The pluggable byte sink a recorder writes through
pub trait RecordSink: Send {
    fn open(&mut self, constraints: &MediaRecorderConstraints) -> io::Result<()>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn close(&mut self);
}

/// Writes to a file under the configured directory, expanding the unique
/// suffix when requested
pub struct FileSink {
    extension: &'static str,
    file: Option<File>,
}

impl FileSink {
    pub fn new(extension: &'static str) -> FileSink {
        FileSink {
            extension,
            file: None,
        }
    }
}

impl RecordSink for FileSink {
    fn open(&mut self, constraints: &MediaRecorderConstraints) -> io::Result<()> {
        std::fs::create_dir_all(&constraints.directory)?;

        let mut file_name = constraints.file_name.clone();
        if constraints.unique {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            file_name.push_str(&format!("-{}", now));
        }
        file_name.push('.');
        file_name.push_str(self.extension);

        let mut path = PathBuf::from(&constraints.directory);
        path.push(file_name);

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        if constraints.append {
            options.append(true);
        } else {
            options.truncate(true);
        }

        self.file = Some(options.open(path)?);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file {
            Some(ref mut file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no open file")),
        }
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// Records the attached stream as an FLV file.
///
/// The recorder rides on an FLV remuxer: every formatted tag that comes out
/// of it is written to the sink while the recorder is in the Recording
/// state.  A write failure stops the recorder.
pub struct FlvRecorder {
    constraints: MediaRecorderConstraints,
    remuxer: Arc<flv::Flv>,
    sink: Mutex<Box<dyn RecordSink>>,
    state: AtomicU32,
    events: EventDispatcher<RecorderEvent>,
    frames_written: AtomicU32,
    bytes_written: AtomicU64,
    source: Mutex<Option<Arc<MediaStream>>>,
}

impl FlvRecorder {
    pub fn new(
        constraints: MediaRecorderConstraints,
        sink: Box<dyn RecordSink>,
    ) -> Arc<FlvRecorder> {
        let remuxer = flv::Flv::new(constraints.mode);

        let recorder = Arc::new(FlvRecorder {
            constraints,
            remuxer,
            sink: Mutex::new(sink),
            state: AtomicU32::new(STATE_INACTIVE),
            events: EventDispatcher::new(),
            frames_written: AtomicU32::new(0),
            bytes_written: AtomicU64::new(0),
            source: Mutex::new(None),
        });

        // Every tag the remuxer forms goes through the sink while recording
        let weak = Arc::downgrade(&recorder);
        let tag_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(recorder), StreamEventKind::Packet(packet)) =
                    (weak.upgrade(), &event.kind)
                {
                    recorder.on_tag(&packet.payload);
                }
            },
            0,
        );

        recorder
            .remuxer
            .events()
            .add_event_listener(event_type::PACKET, tag_listener);

        recorder
    }

    pub fn events(&self) -> &EventDispatcher<RecorderEvent> {
        &self.events
    }

    pub fn ready_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Binds the stream to record.  The actual recording begins on `start`.
    pub fn set_source(&self, stream: Arc<MediaStream>) {
        *self.source.lock() = Some(stream);
    }

    /// Begins recording.  Only valid from the Inactive state.
    pub fn start(&self) {
        if self
            .state
            .compare_exchange(
                STATE_INACTIVE,
                STATE_RECORDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.dispatch_invalid_state("The recorder is not in the inactive state");
            return;
        }

        let stream = match self.source.lock().clone() {
            Some(stream) => stream,
            None => {
                self.state.store(STATE_INACTIVE, Ordering::Release);
                self.dispatch_invalid_state("No source stream is bound");
                return;
            }
        };

        {
            let mut sink = self.sink.lock();
            if let Err(error) = sink.open(&self.constraints) {
                self.state.store(STATE_INACTIVE, Ordering::Release);
                self.dispatch_error("NotReadableError", format!("failed to open sink: {}", error));
                return;
            }

            if !self.constraints.append {
                if let Err(error) = sink.write(&flv::header(self.constraints.mode)) {
                    self.state.store(STATE_INACTIVE, Ordering::Release);
                    self.dispatch_error("NotReadableError", format!("failed to write: {}", error));
                    return;
                }
            }
        }

        self.remuxer.clone().attach(&stream);

        let mut event = RecorderEvent::named(recorder_event::START);
        self.events.dispatch_event(recorder_event::START, &mut event);
    }

    /// Pauses recording.  Only valid from the Recording state.
    pub fn pause(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_INACTIVE => {
                self.dispatch_invalid_state("The recorder can't be paused while it's not active");
            }

            STATE_RECORDING => {
                self.state.store(STATE_PAUSED, Ordering::Release);
                let mut event = RecorderEvent::named(recorder_event::PAUSE);
                self.events.dispatch_event(recorder_event::PAUSE, &mut event);
            }

            _ => debug!("recorder is already paused"),
        }
    }

    /// Resumes recording.  Only valid from the Paused state.
    pub fn resume(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_INACTIVE => {
                self.dispatch_invalid_state("The recorder can't be resumed while it's not paused");
            }

            STATE_PAUSED => {
                self.state.store(STATE_RECORDING, Ordering::Release);
                let mut event = RecorderEvent::named(recorder_event::RESUME);
                self.events
                    .dispatch_event(recorder_event::RESUME, &mut event);
            }

            _ => debug!("recorder is already recording"),
        }
    }

    /// Stops recording, closes the sink, and unsubscribes from the stream.
    /// Valid from the Recording and Paused states.
    pub fn stop(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_INACTIVE => {
                self.dispatch_invalid_state("The recorder can't be stopped while it's not active");
            }

            _ => {
                self.state.store(STATE_INACTIVE, Ordering::Release);

                self.remuxer.close();
                self.sink.lock().close();

                let mut event = RecorderEvent::named(recorder_event::STOP);
                self.events.dispatch_event(recorder_event::STOP, &mut event);
            }
        }
    }

    fn on_tag(&self, data: &[u8]) {
        if self.state.load(Ordering::Acquire) != STATE_RECORDING {
            return;
        }

        if let Err(error) = self.sink.lock().write(data) {
            warn!(%error, "recorder failed to write");
            self.stop();
            return;
        }

        let frames = self.frames_written.fetch_add(1, Ordering::AcqRel) + 1;
        let bytes = self
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::AcqRel)
            + data.len() as u64;

        if (self.constraints.max_frames > 0 && frames >= self.constraints.max_frames)
            || (self.constraints.max_size > 0 && bytes >= self.constraints.max_size)
        {
            self.stop();
        }
    }

    fn dispatch_invalid_state(&self, message: &str) {
        self.dispatch_error("InvalidStateError", message.to_string());
    }

    fn dispatch_error(&self, name: &'static str, message: String) {
        let mut event = RecorderEvent::error(name, message);
        self.events.dispatch_event(recorder_event::ERROR, &mut event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// A sink capturing every write in memory
    struct MemorySink {
        data: Arc<PlMutex<Vec<u8>>>,
        fail_writes: bool,
    }

    impl RecordSink for MemorySink {
        fn open(&mut self, _constraints: &MediaRecorderConstraints) -> io::Result<()> {
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }

            self.data.lock().extend_from_slice(data);
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct Fixture {
        recorder: Arc<FlvRecorder>,
        written: Arc<PlMutex<Vec<u8>>>,
        events: Arc<PlMutex<Vec<String>>>,
    }

    fn fixture(fail_writes: bool) -> Fixture {
        let written: Arc<PlMutex<Vec<u8>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = MemorySink {
            data: written.clone(),
            fail_writes,
        };

        let constraints = MediaRecorderConstraints {
            mode: mode::ALL,
            ..MediaRecorderConstraints::default()
        };

        let recorder = FlvRecorder::new(constraints, Box::new(sink));
        recorder.set_source(MediaStream::new());

        let events: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        for kind in [
            recorder_event::START,
            recorder_event::PAUSE,
            recorder_event::RESUME,
            recorder_event::STOP,
            recorder_event::ERROR,
        ] {
            let log = events.clone();
            recorder.events().add_event_listener(
                kind,
                EventListener::new(
                    move |event: &mut RecorderEvent| {
                        let mut name = event.kind.to_string();
                        if let Some(error_name) = event.error_name {
                            name = format!("{}:{}", name, error_name);
                        }
                        log.lock().push(name);
                    },
                    0,
                ),
            );
        }

        Fixture {
            recorder,
            written,
            events,
        }
    }

    #[test]
    fn start_transitions_to_recording_and_writes_the_flv_header() {
        let fixture = fixture(false);

        fixture.recorder.start();
        assert_eq!(fixture.recorder.ready_state(), STATE_RECORDING);
        assert_eq!(fixture.events.lock().as_slice(), ["start"]);

        let written = fixture.written.lock();
        assert_eq!(&written[..3], b"FLV");
    }

    #[test]
    fn full_lifecycle_dispatches_named_events() {
        let fixture = fixture(false);

        fixture.recorder.start();
        fixture.recorder.pause();
        fixture.recorder.resume();
        fixture.recorder.stop();

        assert_eq!(
            fixture.events.lock().as_slice(),
            ["start", "pause", "resume", "stop"]
        );
        assert_eq!(fixture.recorder.ready_state(), STATE_INACTIVE);
    }

    #[test]
    fn start_while_paused_errors_and_leaves_state_paused() {
        let fixture = fixture(false);

        fixture.recorder.start();
        fixture.recorder.pause();
        fixture.recorder.start();

        assert_eq!(fixture.recorder.ready_state(), STATE_PAUSED);
        assert_eq!(
            fixture.events.lock().as_slice(),
            ["start", "pause", "error:InvalidStateError"]
        );
    }

    #[test]
    fn pause_and_resume_from_inactive_are_errors() {
        let fixture = fixture(false);

        fixture.recorder.pause();
        fixture.recorder.resume();
        fixture.recorder.stop();

        assert_eq!(
            fixture.events.lock().as_slice(),
            [
                "error:InvalidStateError",
                "error:InvalidStateError",
                "error:InvalidStateError"
            ]
        );
    }

    #[test]
    fn write_failure_stops_the_recorder() {
        let fixture = fixture(true);

        // The header write fails straight away, so start aborts
        fixture.recorder.start();
        assert_eq!(fixture.recorder.ready_state(), STATE_INACTIVE);
        assert_eq!(
            fixture.events.lock().as_slice(),
            ["error:NotReadableError"]
        );
    }

    #[test]
    fn template_expansion_fills_in_the_stream_identity() {
        let expanded = expand_template(
            "${APPLICATION}/${INSTANCE}/${STREAM}-archive",
            "live",
            "_definst_",
            "campfire",
        );

        assert_eq!(expanded, "live/_definst_/campfire-archive");
    }
}
