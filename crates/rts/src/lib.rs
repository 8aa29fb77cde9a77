//! Binary trace stream for the kernel core.
//!
//! Kernel events (dispatches, life-cycle changes, thread queue activity,
//! watchdog expirations, lock hand-overs) are encoded as small binary
//! *records* and framed in HDLC packets so that any byte-oriented sink can
//! carry them. The decoder side ([`decode_frame`]) is provided so host tools
//! and tests can read the stream back.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

mod payload;

pub mod records;
pub mod system;

pub use payload::{make_format, PayloadBuilder, FMT_STR, FMT_U16, FMT_U32, FMT_U64, FMT_U8};
pub use system::SystemInfo;

/// Maximum payload length for a single record (excluding header/checksum).
const DEFAULT_MAX_RECORD_LEN: usize = 96;

const FLAG: u8 = 0x7E;
const ESC: u8 = 0x7D;
const ESC_XOR: u8 = 0x20;

/// Configuration for the tracer.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_record_len: usize,
    pub include_timestamp: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            include_timestamp: true,
        }
    }
}

/// A single trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub seq: u8,
    pub record_type: u8,
    pub timestamp: Option<u32>,
    pub payload: Vec<u8>,
}

/// Errors that can occur while emitting or decoding trace data.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    Checksum { expected: u8, found: u8 },
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

/// Backend trait that consumes HDLC framed bytes.
pub trait TraceBackend: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError>;
}

/// Simple backend that writes frames to any `Write` implementation.
pub struct WriterBackend<W: Write + Send + 'static> {
    writer: Arc<Mutex<W>>,
}

impl<W: Write + Send + 'static> WriterBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<W: Write + Send + 'static> TraceBackend for WriterBackend<W> {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.write_all(frame).map_err(TraceError::from)
    }
}

/// Backend that keeps every frame in memory.
///
/// Cloning the backend shares the buffer, so a test can hand one clone to the
/// tracer and inspect the other.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw frames captured so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decodes every captured frame, skipping none.
    pub fn records(&self, with_timestamp: bool) -> Result<Vec<TraceRecord>, TraceError> {
        self.frames()
            .iter()
            .map(|frame| decode_frame(frame, with_timestamp))
            .collect()
    }

    /// Record types in emission order.
    pub fn record_types(&self) -> Vec<u8> {
        self.records(false)
            .map(|records| records.into_iter().map(|r| r.record_type).collect())
            .unwrap_or_default()
    }
}

impl TraceBackend for MemoryBackend {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.to_vec());
        Ok(())
    }
}

/// HDLC frame encoder.
#[derive(Debug)]
pub struct Tracer<B: TraceBackend> {
    backend: B,
    cfg: TraceConfig,
    seq: u8,
    epoch: Instant,
}

#[derive(Clone)]
pub struct TracerHandle<B: TraceBackend> {
    inner: Arc<Mutex<Tracer<B>>>,
}

impl<B: TraceBackend> Tracer<B> {
    pub fn new(cfg: TraceConfig, backend: B) -> Self {
        Self {
            backend,
            cfg,
            seq: 0,
            epoch: Instant::now(),
        }
    }

    pub fn into_handle(self) -> TracerHandle<B> {
        TracerHandle {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    pub fn record(
        &mut self,
        record_type: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<TraceRecord, TraceError> {
        if payload.len() > self.cfg.max_record_len {
            return Err(TraceError::PayloadTooLarge(payload.len()));
        }

        let timestamp = (self.cfg.include_timestamp && with_timestamp)
            .then(|| micros(self.epoch.elapsed()));

        self.seq = self.seq.wrapping_add(1);
        let record = TraceRecord {
            seq: self.seq,
            record_type,
            timestamp,
            payload: payload.to_vec(),
        };

        let frame = encode_frame(&record);
        self.backend.write_frame(&frame)?;
        Ok(record)
    }
}

fn micros(elapsed: Duration) -> u32 {
    u32::try_from(elapsed.as_micros()).unwrap_or(u32::MAX)
}

fn push_escaped(dest: &mut Vec<u8>, byte: u8) {
    if byte == FLAG || byte == ESC {
        dest.push(ESC);
        dest.push(byte ^ ESC_XOR);
    } else {
        dest.push(byte);
    }
}

/// Encodes one record as an HDLC frame: escaped body, inverted additive
/// checksum, closing flag.
pub fn encode_frame(record: &TraceRecord) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(record.payload.len() + 8);
    let mut checksum: u8 = 0;

    let mut body = Vec::with_capacity(record.payload.len() + 6);
    body.push(record.seq);
    body.push(record.record_type);
    if let Some(ts) = record.timestamp {
        body.extend_from_slice(&ts.to_le_bytes());
    }
    body.extend_from_slice(&record.payload);

    for byte in body {
        checksum = checksum.wrapping_add(byte);
        push_escaped(&mut bytes, byte);
    }
    push_escaped(&mut bytes, !checksum);
    bytes.push(FLAG);
    bytes
}

/// Decodes a single HDLC frame produced by [`encode_frame`].
///
/// `with_timestamp` must match how the record was emitted; the stream does not
/// carry that bit.
pub fn decode_frame(frame: &[u8], with_timestamp: bool) -> Result<TraceRecord, TraceError> {
    let Some((&FLAG, escaped)) = frame.split_last() else {
        return Err(TraceError::Malformed("missing closing flag"));
    };

    let mut raw = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(&byte) = bytes.next() {
        match byte {
            ESC => match bytes.next() {
                Some(&next) => raw.push(next ^ ESC_XOR),
                None => return Err(TraceError::Malformed("dangling escape")),
            },
            FLAG => return Err(TraceError::Malformed("flag inside frame")),
            other => raw.push(other),
        }
    }

    let Some((&found, body)) = raw.split_last() else {
        return Err(TraceError::Malformed("empty frame"));
    };
    let expected = !body.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    if expected != found {
        return Err(TraceError::Checksum { expected, found });
    }

    let header = if with_timestamp { 6 } else { 2 };
    if body.len() < header {
        return Err(TraceError::Malformed("truncated header"));
    }
    let timestamp = with_timestamp
        .then(|| u32::from_le_bytes([body[2], body[3], body[4], body[5]]));

    Ok(TraceRecord {
        seq: body[0],
        record_type: body[1],
        timestamp,
        payload: body[header..].to_vec(),
    })
}

impl<B: TraceBackend + 'static> TracerHandle<B> {
    pub fn emit(&self, record_type: u8, payload: &[u8]) -> Result<TraceRecord, TraceError> {
        self.emit_internal(record_type, payload, false)
    }

    pub fn emit_with_timestamp(
        &self,
        record_type: u8,
        payload: &[u8],
    ) -> Result<TraceRecord, TraceError> {
        self.emit_internal(record_type, payload, true)
    }

    fn emit_internal(
        &self,
        record_type: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<TraceRecord, TraceError> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.record(record_type, payload, with_timestamp)
    }

    pub fn hook(&self) -> TraceHook {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |record_type, payload, with_timestamp| {
            let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard
                .record(record_type, payload, with_timestamp)
                .map(|_| ())
        })
    }
}

pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer() -> (Tracer<MemoryBackend>, MemoryBackend) {
        let backend = MemoryBackend::new();
        let cfg = TraceConfig {
            include_timestamp: false,
            ..TraceConfig::default()
        };
        (Tracer::new(cfg, backend.clone()), backend)
    }

    #[test]
    fn escapes_flag_and_escape_bytes() {
        let record = TraceRecord {
            seq: 1,
            record_type: FLAG,
            timestamp: None,
            payload: vec![ESC, 0x01],
        };
        let frame = encode_frame(&record);
        assert_eq!(&frame[..5], &[0x01, ESC, FLAG ^ ESC_XOR, ESC, ESC ^ ESC_XOR]);
        assert_eq!(*frame.last().expect("flag"), FLAG);
        assert_eq!(frame.iter().filter(|b| **b == FLAG).count(), 1);
    }

    #[test]
    fn memory_backend_reads_back_sequence() {
        let (mut tracer, backend) = tracer();
        tracer.record(records::task::CREATE, &[1, 2, 3], false).expect("record");
        tracer.record(records::task::DELETE, &[4], false).expect("record");

        let decoded = backend.records(false).expect("decode");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].seq, 1);
        assert_eq!(decoded[0].payload, vec![1, 2, 3]);
        assert_eq!(decoded[1].record_type, records::task::DELETE);
    }

    #[test]
    fn rejects_oversized_payload() {
        let (mut tracer, backend) = tracer();
        let payload = vec![0u8; DEFAULT_MAX_RECORD_LEN + 1];
        assert!(matches!(
            tracer.record(records::sched::NEXT, &payload, false),
            Err(TraceError::PayloadTooLarge(len)) if len == DEFAULT_MAX_RECORD_LEN + 1
        ));
        assert!(backend.frames().is_empty());
    }

    #[test]
    fn corrupted_frame_fails_checksum() {
        let (mut tracer, backend) = tracer();
        tracer.record(records::tq::ENQUEUE, &[9, 9], false).expect("record");
        let mut frame = backend.frames().remove(0);
        frame[2] ^= 0x01;
        assert!(matches!(
            decode_frame(&frame, false),
            Err(TraceError::Checksum { .. })
        ));
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("sink").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_backend_streams_frames_back_to_back() {
        let sink = SharedSink::default();
        let cfg = TraceConfig {
            include_timestamp: false,
            ..TraceConfig::default()
        };
        let mut tracer = Tracer::new(cfg, WriterBackend::new(sink.clone()));
        tracer.record(records::mutex::OBTAIN, &[1], false).expect("record");
        tracer.record(records::mutex::RELEASE, &[1], false).expect("record");

        let bytes = sink.0.lock().expect("sink").clone();
        let frames: Vec<&[u8]> = bytes.split_inclusive(|b| *b == FLAG).collect();
        assert_eq!(frames.len(), 2);
        let second = decode_frame(frames[1], false).expect("decode");
        assert_eq!(second.seq, 2);
        assert_eq!(second.record_type, records::mutex::RELEASE);
    }

    #[test]
    fn hook_shares_sequence_with_handle() {
        let backend = MemoryBackend::new();
        let handle = Tracer::new(TraceConfig::default(), backend.clone()).into_handle();
        let hook = handle.hook();
        hook(records::sched::IDLE, &[], false).expect("hook");
        let record = handle.emit(records::sched::NEXT, &[7]).expect("emit");
        assert_eq!(record.seq, 2);
        assert_eq!(backend.record_types(), vec![records::sched::IDLE, records::sched::NEXT]);
    }
}
