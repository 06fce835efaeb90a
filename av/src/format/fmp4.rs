//! Fragmented MP4 / CMAF remuxing: ISO-BMFF box writers plus the remuxer
//! that turns stream packets into init and media segments.

use super::{
    event_type, mode, MediaStream, MediaStreamTrack, Remuxer, StreamEvent, StreamEventKind,
    TrackKind, REMUX_INACTIVE, REMUX_PUMPING, REMUX_WAITING,
};
use crate::codec::DecoderConfig;
use crate::context::SampleFlags;
use crate::events::{EventDispatcher, EventListener};
use crate::info::Information;
use crate::packet::{Packet, PacketKind, Side};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Writes one box: big-endian u32 total size, 4 byte type, payload parts
pub fn atom(name: &[u8; 4], parts: &[&[u8]]) -> Vec<u8> {
    let total = 8 + parts.iter().map(|part| part.len()).sum::<usize>();

    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&(total as u32).to_be_bytes());
    data.extend_from_slice(name);
    for part in parts {
        data.extend_from_slice(part);
    }

    data
}

pub fn ftyp() -> Vec<u8> {
    atom(
        b"ftyp",
        &[&[
            0x69, 0x73, 0x6F, 0x6D, // major_brand: isom
            0x00, 0x00, 0x00, 0x01, // minor_version
            0x69, 0x73, 0x6F, 0x6D, // isom
            0x61, 0x76, 0x63, 0x31, // avc1
        ]],
    )
}

pub fn mvhd(info: &Information) -> Vec<u8> {
    let t = info.timescale;
    let d = info.duration;

    let mut data = vec![
        0x00, 0x00, 0x00, 0x00, // version(0) + flags
        0x00, 0x00, 0x00, 0x00, // creation_time
        0x00, 0x00, 0x00, 0x00, // modification_time
    ];
    data.extend_from_slice(&t.to_be_bytes());
    data.extend_from_slice(&d.to_be_bytes());
    data.extend_from_slice(&[
        0x00, 0x01, 0x00, 0x00, // preferred rate: 1.0
        0x01, 0x00, 0x00, 0x00, // preferred volume(1.0) + reserved
        0x00, 0x00, 0x00, 0x00, // reserved: 2 * 4 bytes
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x01, 0x00, 0x00, // ----begin composition matrix----
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x01, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x40, 0x00, 0x00, 0x00, // ----end composition matrix----
        0x00, 0x00, 0x00, 0x00, // ----begin pre_defined 6 * 4 bytes----
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, // ----end pre_defined----
        0xFF, 0xFF, 0xFF, 0xFF, // next_track_ID
    ]);

    atom(b"mvhd", &[&data])
}

pub fn tkhd(track_id: u32, width: u32, height: u32) -> Vec<u8> {
    let mut data = vec![
        0x00, 0x00, 0x00, 0x07, // version(0) + flags
        0x00, 0x00, 0x00, 0x00, // creation_time
        0x00, 0x00, 0x00, 0x00, // modification_time
    ];
    data.extend_from_slice(&track_id.to_be_bytes());
    data.extend_from_slice(&[
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // duration
        0x00, 0x00, 0x00, 0x00, // reserved: 2 * 4 bytes
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, // layer + alternate_group
        0x00, 0x00, 0x00, 0x00, // volume + reserved
        0x00, 0x01, 0x00, 0x00, // ----begin composition matrix----
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x01, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x40, 0x00, 0x00, 0x00, // ----end composition matrix----
    ]);
    data.extend_from_slice(&[(width >> 8) as u8, width as u8, 0x00, 0x00]);
    data.extend_from_slice(&[(height >> 8) as u8, height as u8, 0x00, 0x00]);

    atom(b"tkhd", &[&data])
}

pub fn mdhd(timescale: u32) -> Vec<u8> {
    let mut data = vec![
        0x00, 0x00, 0x00, 0x00, // version(0) + flags
        0x00, 0x00, 0x00, 0x00, // creation_time
        0x00, 0x00, 0x00, 0x00, // modification_time
    ];
    data.extend_from_slice(&timescale.to_be_bytes());
    data.extend_from_slice(&[
        0x00, 0x00, 0x00, 0x00, // duration
        0x55, 0xC4, // language: und
        0x00, 0x00, // pre_defined
    ]);

    atom(b"mdhd", &[&data])
}

pub fn hdlr(kind: TrackKind) -> Vec<u8> {
    let data: &[u8] = match kind {
        TrackKind::Audio => &[
            0x00, 0x00, 0x00, 0x00, // version(0) + flags
            0x00, 0x00, 0x00, 0x00, // pre_defined
            0x73, 0x6F, 0x75, 0x6E, // handler_type: 'soun'
            0x00, 0x00, 0x00, 0x00, // reserved: 3 * 4 bytes
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x53, 0x6F, 0x75, 0x6E, // name: SoundHandler
            0x64, 0x48, 0x61, 0x6E,
            0x64, 0x6C, 0x65, 0x72, 0x00,
        ],
        TrackKind::Video => &[
            0x00, 0x00, 0x00, 0x00, // version(0) + flags
            0x00, 0x00, 0x00, 0x00, // pre_defined
            0x76, 0x69, 0x64, 0x65, // handler_type: 'vide'
            0x00, 0x00, 0x00, 0x00, // reserved: 3 * 4 bytes
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x56, 0x69, 0x64, 0x65, // name: VideoHandler
            0x6F, 0x48, 0x61, 0x6E,
            0x64, 0x6C, 0x65, 0x72, 0x00,
        ],
    };

    atom(b"hdlr", &[data])
}

fn dinf() -> Vec<u8> {
    let dref = atom(
        b"dref",
        &[&[
            0x00, 0x00, 0x00, 0x00, // version(0) + flags
            0x00, 0x00, 0x00, 0x01, // entry_count
            0x00, 0x00, 0x00, 0x0C, // entry_size
            0x75, 0x72, 0x6C, 0x20, // type 'url '
            0x00, 0x00, 0x00, 0x01, // version(0) + flags
        ]],
    );

    atom(b"dinf", &[&dref])
}

const EMPTY_FULL_BOX: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 0];

fn stbl(stsd_entry: Vec<u8>) -> Vec<u8> {
    let stsd = atom(
        b"stsd",
        &[
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01], // entry_count 1
            &stsd_entry,
        ],
    );
    let stts = atom(b"stts", &[&EMPTY_FULL_BOX]);
    let stsc = atom(b"stsc", &[&EMPTY_FULL_BOX]);
    let stsz = atom(
        b"stsz",
        &[&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]], // sample_size + sample_count
    );
    let stco = atom(b"stco", &[&EMPTY_FULL_BOX]);

    atom(b"stbl", &[&stsd, &stts, &stsc, &stsz, &stco])
}

pub fn esds(config: &[u8]) -> Vec<u8> {
    let n = config.len() as u8;

    let mut data = vec![
        0x00, 0x00, 0x00, 0x00, // version(0) + flags
        0x03,     // ES descriptor
        0x17 + n, // length
        0x00, 0x01, // es_id
        0x00, // stream_priority
        0x04,     // decoder config descriptor
        0x0F + n, // length
        0x40,     // codec: mpeg4 audio
        0x15,     // stream_type: audio
        0x00, 0x00, 0x00, // buffer_size
        0x00, 0x00, 0x00, 0x00, // max_bitrate
        0x00, 0x00, 0x00, 0x00, // avg_bitrate
        0x05, // decoder specific descriptor
        n,
    ];
    data.extend_from_slice(config);

    atom(b"esds", &[&data, &[0x06, 0x01, 0x02]])
}

pub fn mp4a(channel_configuration: u8, sampling_frequency: u32, config: &[u8]) -> Vec<u8> {
    let r = sampling_frequency;

    let data = [
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x01, // reserved(2) + data_reference_index(2)
        0x00, 0x00, 0x00, 0x00, // reserved: 2 * 4 bytes
        0x00, 0x00, 0x00, 0x00,
        0x00, channel_configuration, // channel count
        0x00, 0x10, // sample size
        0x00, 0x00, 0x00, 0x00, // reserved
        (r >> 8) as u8, r as u8, // sample rate
        0x00, 0x00,
    ];

    atom(b"mp4a", &[&data, &esds(config)])
}

pub fn avc1(codec_width: u32, codec_height: u32, avcc: &[u8]) -> Vec<u8> {
    let w = codec_width;
    let h = codec_height;

    let data = [
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x01, // reserved(2) + data_reference_index(2)
        0x00, 0x00, 0x00, 0x00, // pre_defined(2) + reserved(2)
        0x00, 0x00, 0x00, 0x00, // pre_defined: 3 * 4 bytes
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        (w >> 8) as u8, w as u8, // width
        (h >> 8) as u8, h as u8, // height
        0x00, 0x48, 0x00, 0x00, // horizresolution
        0x00, 0x48, 0x00, 0x00, // vertresolution
        0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x01, // frame_count
        0x0A, // compressorname length
        0x6C, 0x6D, 0x6C, 0x2F, // compressorname: 32 bytes
        0x72, 0x65, 0x6D, 0x75,
        0x78, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00,
        0x00, 0x18, // depth
        0xFF, 0xFF, // pre_defined = -1
    ];

    let avcc_box = atom(b"avcC", &[avcc]);
    atom(b"avc1", &[&data, &avcc_box])
}

pub fn trex(track_id: u32) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x00, 0x00]; // version(0) + flags
    data.extend_from_slice(&track_id.to_be_bytes());
    data.extend_from_slice(&[
        0x00, 0x00, 0x00, 0x01, // default_sample_description_index
        0x00, 0x00, 0x00, 0x00, // default_sample_duration
        0x00, 0x00, 0x00, 0x00, // default_sample_size
        0x00, 0x01, 0x00, 0x01, // default_sample_flags
    ]);

    atom(b"trex", &[&data])
}

pub fn mfhd(sequence_number: u32) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x00, 0x00];
    data.extend_from_slice(&sequence_number.to_be_bytes());
    atom(b"mfhd", &[&data])
}

pub fn tfhd(track_id: u32) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x00, 0x00]; // version(0) + flags
    data.extend_from_slice(&track_id.to_be_bytes());
    atom(b"tfhd", &[&data])
}

pub fn tfdt(base_media_decode_time: u32) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x00, 0x00]; // version(0) + flags
    data.extend_from_slice(&base_media_decode_time.to_be_bytes());
    atom(b"tfdt", &[&data])
}

pub fn trun(
    sample_duration: u32,
    sample_size: u32,
    flags: SampleFlags,
    sample_composition_time_offset: u32,
) -> Vec<u8> {
    let mut data = vec![
        0x00, 0x00, 0x0F, 0x01, // version(0) + flags
        0x00, 0x00, 0x00, 0x01, // sample_count
        0x00, 0x00, 0x00, 0x79, // data_offset
    ];
    data.extend_from_slice(&sample_duration.to_be_bytes());
    data.extend_from_slice(&sample_size.to_be_bytes());
    data.push((flags.is_leading << 2) | flags.sample_depends_on);
    data.push(
        (flags.sample_is_depended_on << 6)
            | (flags.sample_has_redundancy << 4)
            | flags.is_non_sync,
    );
    data.extend_from_slice(&[0x00, 0x00]); // sample_degradation_priority
    data.extend_from_slice(&sample_composition_time_offset.to_be_bytes());

    atom(b"trun", &[&data])
}

pub fn sdtp(flags: SampleFlags) -> Vec<u8> {
    let data = [
        0x00,
        0x00,
        0x00,
        0x00, // version(0) + flags
        (flags.is_leading << 6)
            | (flags.sample_depends_on << 4)
            | (flags.sample_is_depended_on << 2)
            | flags.sample_has_redundancy,
    ];

    atom(b"sdtp", &[&data])
}

pub fn mdat(data: &[u8]) -> Vec<u8> {
    atom(b"mdat", &[data])
}

/// Producer reference time, prepended to low latency segments
pub fn prft(track_id: u32, media_time: u32) -> Vec<u8> {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ntp_seconds = wall.as_secs() + NTP_UNIX_OFFSET;
    let ntp_fraction = ((wall.subsec_nanos() as u64) << 32) / 1_000_000_000;
    let ntp = (ntp_seconds << 32) | ntp_fraction;

    let mut data = vec![0x00, 0x00, 0x00, 0x00]; // version(0) + flags
    data.extend_from_slice(&track_id.to_be_bytes());
    data.extend_from_slice(&ntp.to_be_bytes());
    data.extend_from_slice(&media_time.to_be_bytes());

    atom(b"prft", &[&data])
}

struct AttachState {
    source: Option<Arc<MediaStream>>,
    attached_sources: Vec<Arc<MediaStreamTrack>>,
    packet_listener: Option<Arc<EventListener<StreamEvent>>>,
    add_track_listener: Option<Arc<EventListener<StreamEvent>>>,
    remove_track_listener: Option<Arc<EventListener<StreamEvent>>>,
    error_listener: Option<Arc<EventListener<StreamEvent>>>,
    close_listener: Option<Arc<EventListener<StreamEvent>>>,
}

/// The fragmented MP4 remuxer.  With `low_latency` set it emits CMAF
/// chunks: every segment is a `prft` + `moof` + `mdat` triplet.
pub struct Fmp4 {
    mode: u32,
    low_latency: bool,
    out: Arc<MediaStream>,
    state: AtomicU32,
    time_base: AtomicU32,
    init_emitted: AtomicBool,
    attach_state: Mutex<AttachState>,
}

impl Fmp4 {
    pub fn new(mode: u32, low_latency: bool) -> Arc<Fmp4> {
        Arc::new(Fmp4 {
            mode,
            low_latency,
            out: MediaStream::new(),
            state: AtomicU32::new(REMUX_INACTIVE),
            time_base: AtomicU32::new(0),
            init_emitted: AtomicBool::new(false),
            attach_state: Mutex::new(AttachState {
                source: None,
                attached_sources: Vec::new(),
                packet_listener: None,
                add_track_listener: None,
                remove_track_listener: None,
                error_listener: None,
                close_listener: None,
            }),
        })
    }

    pub fn output(&self) -> &Arc<MediaStream> {
        &self.out
    }

    fn wants_track(&self, track: &MediaStreamTrack) -> bool {
        match track.kind() {
            TrackKind::Audio => (self.mode & mode::AUDIO) != 0,
            TrackKind::Video => (self.mode & mode::VIDEO) != 0,
        }
    }

    fn emit(&self, packet: Packet) {
        let mut event = StreamEvent::packet(Arc::new(packet));
        self.out.events().dispatch_event(event_type::PACKET, &mut event);
    }

    /// Builds the sample description entry for one track
    fn stsd_entry(track: &MediaStreamTrack) -> Option<Vec<u8>> {
        match track.source().decoder_config()? {
            DecoderConfig::Audio {
                channel_configuration,
                sampling_frequency,
                config,
            } => Some(mp4a(channel_configuration, sampling_frequency, &config)),

            DecoderConfig::Video { avcc } => {
                let info = track.source().information();
                let info = info.read();
                Some(avc1(info.codec_width, info.codec_height, &avcc))
            }
        }
    }

    fn trak(track: &MediaStreamTrack) -> Option<Vec<u8>> {
        let info = track.source().information();
        let (timescale, width, height) = {
            let info = info.read();
            (info.timescale, info.width, info.height)
        };

        let stsd_entry = Fmp4::stsd_entry(track)?;

        let xmhd = match track.kind() {
            TrackKind::Audio => atom(
                b"smhd",
                &[&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]],
            ),
            TrackKind::Video => atom(
                b"vmhd",
                &[&[
                    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                ]],
            ),
        };

        let minf = atom(b"minf", &[&xmhd, &dinf(), &stbl(stsd_entry)]);
        let mdia = atom(b"mdia", &[&mdhd(timescale), &hdlr(track.kind()), &minf]);
        Some(atom(
            b"trak",
            &[&tkhd(track.id() as u32, width, height), &mdia],
        ))
    }

    /// Emits ftyp + moov covering the given tracks
    fn generate_init_segment(&self, kind: PacketKind, tracks: &[Arc<MediaStreamTrack>]) {
        if tracks.is_empty() {
            return;
        }

        let info_snapshot = tracks[0].source().information().read().clone();

        let mut boxes: Vec<Vec<u8>> = vec![mvhd(&info_snapshot)];
        let mut trexs: Vec<Vec<u8>> = Vec::new();

        for track in tracks {
            match Fmp4::trak(track) {
                Some(trak_box) => {
                    boxes.push(trak_box);
                    trexs.push(trex(track.id() as u32));
                }
                None => {
                    debug!(id = track.id(), "track has no decoder config yet");
                    return;
                }
            }
        }

        let trex_refs: Vec<&[u8]> = trexs.iter().map(|b| b.as_slice()).collect();
        boxes.push(atom(b"mvex", &trex_refs));

        let box_refs: Vec<&[u8]> = boxes.iter().map(|b| b.as_slice()).collect();
        let moov = atom(b"moov", &box_refs);

        let mut payload = ftyp();
        payload.extend_from_slice(&moov);

        let mut segment = Packet::new(kind, Bytes::from(payload));
        segment.timestamp = 0;
        self.emit(segment);
    }

    /// Emits one moof + mdat pair for the packet on its track
    fn generate_segment(&self, track: &Arc<MediaStreamTrack>, packet: &Packet) {
        let (data, dts_abs, cts, keyframe) = match &packet.side {
            Side::Audio { dts, data, .. } => (data.clone(), *dts, 0, false),
            Side::Video {
                dts,
                cts,
                keyframe,
                data,
                ..
            } => (data.clone(), *dts, *cts, *keyframe),
            _ => return,
        };

        let ctx = track.source().context();
        let mut flags = ctx.flags;
        if track.kind() == TrackKind::Video {
            if keyframe {
                flags.sample_depends_on = 2;
                flags.sample_is_depended_on = 1;
            } else {
                flags.sample_depends_on = 1;
                flags.sample_is_depended_on = 0;
            }
        }

        let sequence_number = track.sn.fetch_add(1, Ordering::AcqRel) + 1;

        let time_base = self.time_base.load(Ordering::Acquire);
        let dts_rel = dts_abs.wrapping_sub(time_base);

        // Per-sample duration drift correction: the reference duration plus
        // however far this sample's decode time ran ahead of the decode
        // time accumulated so far
        let expected = track.timestamp.load(Ordering::Acquire);
        let duration = ctx
            .ref_sample_duration
            .wrapping_add(dts_rel.wrapping_sub(expected));
        track
            .timestamp
            .store(expected.wrapping_add(duration), Ordering::Release);

        let traf = atom(
            b"traf",
            &[
                &tfhd(track.id() as u32),
                &tfdt(dts_rel),
                &trun(duration, data.len() as u32, flags, cts),
                &sdtp(flags),
            ],
        );
        let moof = atom(b"moof", &[&mfhd(sequence_number), &traf]);

        let mut payload = Vec::new();
        if self.low_latency {
            payload.extend_from_slice(&prft(track.id() as u32, dts_rel));
        }
        payload.extend_from_slice(&moof);
        payload.extend_from_slice(&mdat(&data));

        let mut segment = packet.with_payload(Bytes::from(payload));
        segment.timestamp = packet.timestamp.wrapping_sub(time_base);
        self.emit(segment);
    }

    /// Emits the combined init segment once every needed info frame exists
    fn maybe_emit_combined_init(&self) {
        if self.init_emitted.load(Ordering::Acquire) {
            return;
        }

        let audios = self.out.audio_tracks();
        let audio_ready = (self.mode & mode::AUDIO) == 0
            || audios.is_empty()
            || audios[0].source().info_frame().is_some();

        if !audio_ready {
            return;
        }

        if self
            .init_emitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.generate_init_segment(PacketKind::Script, &self.out.get_tracks());
        }
    }

    fn on_packet(&self, packet: Arc<Packet>) {
        match packet.kind {
            PacketKind::Audio => self.on_audio_packet(packet),
            PacketKind::Video => self.on_video_packet(packet),
            PacketKind::Script => self.on_data_packet(packet),
        }
    }

    fn on_data_packet(&self, packet: Arc<Packet>) {
        if let Side::Script { key, .. } = &packet.side {
            self.out.set_data_frame(key, packet.clone());
        }
    }

    fn on_audio_packet(&self, packet: Arc<Packet>) {
        if packet.codec != "AAC" {
            error!(codec = packet.codec, "unrecognized audio codec");
            return;
        }

        let track = match self.out.audio_tracks().into_iter().next() {
            Some(track) => track,
            None => return,
        };

        let data_type = match &packet.side {
            Side::Audio { data_type, .. } => *data_type,
            _ => return,
        };

        match data_type {
            crate::codec::aac::SPECIFIC_CONFIG => {
                if (self.mode & mode::INTERLEAVED) == 0 {
                    self.generate_init_segment(PacketKind::Audio, &[track]);
                } else if self.state.load(Ordering::Acquire) == REMUX_PUMPING {
                    // The video keyframe arrived first; complete the
                    // combined init now that audio is describable
                    self.maybe_emit_combined_init();
                }
            }

            crate::codec::aac::RAW_FRAME_DATA => {
                // An audio-only remuxer anchors its time base on the first
                // raw audio frame
                if (self.mode & mode::VIDEO) == 0
                    && self
                        .state
                        .compare_exchange(
                            REMUX_WAITING,
                            REMUX_PUMPING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.time_base.store(packet.timestamp, Ordering::Release);
                }

                if track.source().info_frame().is_none()
                    || self.state.load(Ordering::Acquire) != REMUX_PUMPING
                {
                    return;
                }

                self.generate_segment(&track, &packet);
            }

            x => error!(data_type = x, "unrecognized AAC packet type"),
        }
    }

    fn on_video_packet(&self, packet: Arc<Packet>) {
        if packet.codec != "AVC" {
            error!(codec = packet.codec, "unrecognized video codec");
            return;
        }

        let track = match self.out.video_tracks().into_iter().next() {
            Some(track) => track,
            None => return,
        };

        let (data_type, keyframe) = match &packet.side {
            Side::Video {
                data_type,
                keyframe,
                ..
            } => (*data_type, *keyframe),
            _ => return,
        };

        match data_type {
            crate::codec::avc::SEQUENCE_HEADER => {
                if (self.mode & mode::INTERLEAVED) == 0 {
                    self.generate_init_segment(PacketKind::Video, &[track]);
                }
            }

            crate::codec::avc::NALU | crate::codec::avc::END_OF_SEQUENCE => {
                if data_type == crate::codec::avc::NALU {
                    if keyframe
                        && self
                            .state
                            .compare_exchange(
                                REMUX_WAITING,
                                REMUX_PUMPING,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    {
                        self.time_base.store(packet.timestamp, Ordering::Release);

                        if (self.mode & mode::INTERLEAVED) != 0 {
                            self.maybe_emit_combined_init();
                        }
                    }

                    if track.source().info_frame().is_none()
                        || self.state.load(Ordering::Acquire) != REMUX_PUMPING
                        || ((self.mode & mode::KEYFRAME) == mode::KEYFRAME && !keyframe)
                    {
                        return;
                    }
                }

                self.generate_segment(&track, &packet);
            }

            x => error!(data_type = x, "unrecognized AVC packet type"),
        }
    }

    fn on_add_track(
        &self,
        track: Arc<MediaStreamTrack>,
        packet_listener: Arc<EventListener<StreamEvent>>,
    ) {
        if !self.wants_track(&track) {
            return;
        }

        if self.out.attached(track.source()).is_none() {
            self.out.add_track(track.clone_track());
            track
                .source()
                .events()
                .add_event_listener(event_type::PACKET, packet_listener);
            self.attach_state.lock().attached_sources.push(track);
        }
    }

    fn on_remove_track(
        &self,
        track: Arc<MediaStreamTrack>,
        packet_listener: &Arc<EventListener<StreamEvent>>,
    ) {
        if let Some(attached) = self.out.attached(track.source()) {
            track
                .source()
                .events()
                .remove_event_listener(event_type::PACKET, packet_listener);
            self.out.remove_track(&attached);
        }
    }
}

impl Remuxer for Fmp4 {
    fn mode(&self) -> u32 {
        self.mode
    }

    fn events(&self) -> &EventDispatcher<StreamEvent> {
        self.out.events()
    }

    fn attach(self: Arc<Self>, stream: &Arc<MediaStream>) {
        self.state.store(REMUX_WAITING, Ordering::Release);

        let weak = Arc::downgrade(&self);
        let packet_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(fmp4), StreamEventKind::Packet(packet)) =
                    (weak.upgrade(), &event.kind)
                {
                    fmp4.on_packet(packet.clone());
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let add_listener = packet_listener.clone();
        let add_track_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(fmp4), StreamEventKind::AddTrack(track)) =
                    (weak.upgrade(), &event.kind)
                {
                    fmp4.on_add_track(track.clone(), add_listener.clone());
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let remove_listener = packet_listener.clone();
        let remove_track_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(fmp4), StreamEventKind::RemoveTrack(track)) =
                    (weak.upgrade(), &event.kind)
                {
                    fmp4.on_remove_track(track.clone(), &remove_listener);
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let error_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(fmp4), StreamEventKind::Error { name, message }) =
                    (weak.upgrade(), &event.kind)
                {
                    debug!(%name, %message, "source stream error");
                    fmp4.close();
                }
            },
            0,
        );

        let weak = Arc::downgrade(&self);
        let close_listener = EventListener::new(
            move |event: &mut StreamEvent| {
                if let (Some(fmp4), StreamEventKind::Close) = (weak.upgrade(), &event.kind) {
                    fmp4.close();
                }
            },
            0,
        );

        if let Some(metadata) = stream.get_data_frame("onMetaData") {
            self.out.set_data_frame("onMetaData", metadata);
        }

        for track in stream.get_tracks() {
            if !self.wants_track(&track) {
                continue;
            }

            let clone = track.clone_track();
            self.out.add_track(clone.clone());

            if track.source().info_frame().is_some() && (self.mode & mode::INTERLEAVED) == 0 {
                self.generate_init_segment(
                    match track.kind() {
                        TrackKind::Audio => PacketKind::Audio,
                        TrackKind::Video => PacketKind::Video,
                    },
                    &[clone],
                );
            }

            track
                .source()
                .events()
                .add_event_listener(event_type::PACKET, packet_listener.clone());
            self.attach_state.lock().attached_sources.push(track.clone());
        }

        stream
            .events()
            .add_event_listener(event_type::ADD_TRACK, add_track_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::REMOVE_TRACK, remove_track_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::PACKET, packet_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::ERROR, error_listener.clone());
        stream
            .events()
            .add_event_listener(event_type::CLOSE, close_listener.clone());

        let mut attach_state = self.attach_state.lock();
        attach_state.source = Some(stream.clone());
        attach_state.packet_listener = Some(packet_listener);
        attach_state.add_track_listener = Some(add_track_listener);
        attach_state.remove_track_listener = Some(remove_track_listener);
        attach_state.error_listener = Some(error_listener);
        attach_state.close_listener = Some(close_listener);
    }

    fn close(&self) {
        let previous = self.state.swap(REMUX_INACTIVE, Ordering::AcqRel);
        if previous != REMUX_WAITING && previous != REMUX_PUMPING {
            return;
        }

        let mut event = StreamEvent::close();
        self.out.events().dispatch_event(event_type::CLOSE, &mut event);

        let mut attach_state = self.attach_state.lock();
        if let Some(packet_listener) = attach_state.packet_listener.take() {
            for track in attach_state.attached_sources.drain(..) {
                track
                    .source()
                    .events()
                    .remove_event_listener(event_type::PACKET, &packet_listener);
            }

            if let Some(stream) = attach_state.source.take() {
                stream
                    .events()
                    .remove_event_listener(event_type::PACKET, &packet_listener);

                if let Some(listener) = attach_state.add_track_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::ADD_TRACK, &listener);
                }
                if let Some(listener) = attach_state.remove_track_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::REMOVE_TRACK, &listener);
                }
                if let Some(listener) = attach_state.error_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::ERROR, &listener);
                }
                if let Some(listener) = attach_state.close_listener.take() {
                    stream
                        .events()
                        .remove_event_listener(event_type::CLOSE, &listener);
                }
            }
        }
        drop(attach_state);

        self.out.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use parking_lot::Mutex as PlMutex;

    fn box_name(data: &[u8]) -> &[u8] {
        &data[4..8]
    }

    fn box_size(data: &[u8]) -> usize {
        u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize
    }

    /// Splits a concatenation of boxes into (name, full box bytes) pairs
    fn split_boxes(mut data: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut boxes = Vec::new();
        while !data.is_empty() {
            let size = box_size(data);
            let name = String::from_utf8(box_name(data).to_vec()).unwrap();
            boxes.push((name, data[..size].to_vec()));
            data = &data[size..];
        }
        boxes
    }

    #[test]
    fn atom_writes_size_type_then_payload() {
        let data = atom(b"ftyp", &[&[1, 2, 3]]);
        assert_eq!(data.len(), 11);
        assert_eq!(&data[0..4], &[0, 0, 0, 11]);
        assert_eq!(&data[4..8], b"ftyp");
        assert_eq!(&data[8..], &[1, 2, 3]);
    }

    #[test]
    fn trun_encodes_duration_size_flags_and_cts() {
        let flags = SampleFlags {
            is_leading: 0,
            sample_depends_on: 2,
            sample_is_depended_on: 1,
            sample_has_redundancy: 0,
            is_non_sync: 0,
        };

        let data = trun(3000, 1234, flags, 66);
        assert_eq!(box_name(&data), b"trun");

        // duration at offset 8+12, size next, then the two flag bytes
        assert_eq!(&data[20..24], &3000_u32.to_be_bytes());
        assert_eq!(&data[24..28], &1234_u32.to_be_bytes());
        assert_eq!(data[28], 0b0000_0010); // depends_on = 2
        assert_eq!(data[29], 0b0100_0000); // is_depended_on = 1
        assert_eq!(&data[32..36], &66_u32.to_be_bytes());
    }

    /// Parses a (moof, mdat) segment payload into its mfhd sequence number
    /// and tfdt base decode time
    fn parse_segment(payload: &[u8]) -> (u32, u32) {
        let boxes = split_boxes(payload);
        let moof = boxes
            .iter()
            .find(|(name, _)| name == "moof")
            .map(|(_, data)| data.clone())
            .expect("no moof in segment");

        let inner = split_boxes(&moof[8..]);
        let mfhd = &inner.iter().find(|(n, _)| n == "mfhd").unwrap().1;
        let sequence_number = u32::from_be_bytes([mfhd[12], mfhd[13], mfhd[14], mfhd[15]]);

        let traf = &inner.iter().find(|(n, _)| n == "traf").unwrap().1;
        let traf_inner = split_boxes(&traf[8..]);
        let tfdt = &traf_inner.iter().find(|(n, _)| n == "tfdt").unwrap().1;
        let base_time = u32::from_be_bytes([tfdt[12], tfdt[13], tfdt[14], tfdt[15]]);

        (sequence_number, base_time)
    }

    struct VideoFixture {
        fmp4: Arc<Fmp4>,
        source: Arc<dyn codec::TrackSource>,
        segments: Arc<PlMutex<Vec<Packet>>>,
    }

    /// A video-only remuxer attached to a stream with one AVC track whose
    /// source is fed packets directly
    fn video_fixture(mode_flags: u32) -> VideoFixture {
        let stream = MediaStream::new();
        let source = codec::new_source("AVC", stream.info().clone()).unwrap();
        let track = MediaStreamTrack::new(TrackKind::Video, source.clone());
        stream.add_track(track);

        let fmp4 = Fmp4::new(mode_flags, false);
        let segments: Arc<PlMutex<Vec<Packet>>> = Arc::new(PlMutex::new(Vec::new()));

        let sink = segments.clone();
        fmp4.out.events().add_event_listener(
            event_type::PACKET,
            EventListener::new(
                move |event: &mut StreamEvent| {
                    if let StreamEventKind::Packet(packet) = &event.kind {
                        sink.lock().push((**packet).clone());
                    }
                },
                0,
            ),
        );

        fmp4.clone().attach(&stream);
        VideoFixture {
            fmp4,
            source,
            segments,
        }
    }

    fn video_packet(
        source: &Arc<dyn codec::TrackSource>,
        timestamp: u32,
        keyframe: bool,
    ) -> Arc<Packet> {
        let frame_byte = if keyframe { 0x17 } else { 0x27 };
        let nal_header = if keyframe { 0x65 } else { 0x41 };
        let nalu = vec![nal_header, 0x01, 0x02, 0x03];

        let mut payload = vec![frame_byte, 0x01, 0x00, 0x00, 0x00];
        payload.extend((nalu.len() as u32).to_be_bytes());
        payload.extend(nalu);

        let mut packet = Packet::new(PacketKind::Video, Bytes::from(payload));
        packet.timestamp = timestamp;
        source.parse(&mut packet).unwrap();

        // A sequence header must already be parsed for segments to flow
        Arc::new(packet)
    }

    fn feed_sequence_header(source: &Arc<dyn codec::TrackSource>) {
        let payload = crate::testutil::avc_sequence_header_payload();
        let mut packet = Packet::new(PacketKind::Video, Bytes::from(payload));
        source.parse(&mut packet).unwrap();
    }

    #[test]
    fn keyframes_open_segments_with_expected_sequence_numbers_and_tfdt() {
        let fixture = video_fixture(mode::VIDEO | mode::KEYFRAME);
        feed_sequence_header(&fixture.source);

        // Keyframe at t=0, twenty inter frames, keyframe at t=2000.  In
        // keyframe mode only the two keyframes produce segments.
        fixture.source.sink(video_packet(&fixture.source, 0, true));
        for n in 1..21 {
            fixture
                .source
                .sink(video_packet(&fixture.source, n * 95, false));
        }
        fixture.source.sink(video_packet(&fixture.source, 2000, true));

        let segments = fixture.segments.lock();
        let media: Vec<&Packet> = segments
            .iter()
            .filter(|packet| packet.kind == PacketKind::Video)
            .collect();
        assert_eq!(media.len(), 2, "expected exactly two video segments");

        let (sequence1, tfdt1) = parse_segment(&media[0].payload);
        assert_eq!(sequence1, 1);
        assert_eq!(tfdt1, 0);

        let (sequence2, tfdt2) = parse_segment(&media[1].payload);
        assert_eq!(sequence2, 2);
        assert_eq!(tfdt2, 2000);

        drop(segments);
        fixture.fmp4.close();
    }

    #[test]
    fn frames_before_the_first_keyframe_are_dropped() {
        let fixture = video_fixture(mode::VIDEO);
        feed_sequence_header(&fixture.source);

        fixture.source.sink(video_packet(&fixture.source, 10, false));
        fixture.source.sink(video_packet(&fixture.source, 20, false));
        assert_eq!(
            fixture
                .segments
                .lock()
                .iter()
                .filter(|p| p.kind == PacketKind::Video)
                .count(),
            0
        );

        fixture.source.sink(video_packet(&fixture.source, 30, true));
        assert_eq!(
            fixture
                .segments
                .lock()
                .iter()
                .filter(|p| p.kind == PacketKind::Video)
                .count(),
            1
        );
    }

    #[test]
    fn segment_timestamps_are_rebased_on_the_first_keyframe() {
        let fixture = video_fixture(mode::VIDEO);
        feed_sequence_header(&fixture.source);

        fixture.source.sink(video_packet(&fixture.source, 5000, true));
        fixture.source.sink(video_packet(&fixture.source, 5040, false));

        let segments = fixture.segments.lock();
        let media: Vec<&Packet> = segments
            .iter()
            .filter(|packet| packet.kind == PacketKind::Video)
            .collect();

        assert_eq!(media[0].timestamp, 0);
        assert_eq!(media[1].timestamp, 40);
    }

    #[test]
    fn cmaf_segments_lead_with_a_prft_box() {
        let stream = MediaStream::new();
        let source = codec::new_source("AVC", stream.info().clone()).unwrap();
        let track = MediaStreamTrack::new(TrackKind::Video, source.clone());
        stream.add_track(track);

        let cmaf = Fmp4::new(mode::VIDEO, true);
        let segments: Arc<PlMutex<Vec<Packet>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = segments.clone();
        cmaf.out.events().add_event_listener(
            event_type::PACKET,
            EventListener::new(
                move |event: &mut StreamEvent| {
                    if let StreamEventKind::Packet(packet) = &event.kind {
                        sink.lock().push((**packet).clone());
                    }
                },
                0,
            ),
        );
        cmaf.clone().attach(&stream);

        feed_sequence_header(&source);
        source.sink(video_packet(&source, 0, true));

        let segments = segments.lock();
        let media: Vec<&Packet> = segments
            .iter()
            .filter(|packet| packet.kind == PacketKind::Video)
            .collect();
        assert_eq!(media.len(), 1);

        let names: Vec<String> = split_boxes(&media[0].payload)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["prft", "moof", "mdat"]);
    }
}
