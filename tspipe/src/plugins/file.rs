//! File and standard stream input/output plugins.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use log::{debug, info, warn};

use tspipe_core::packet::{SYNC_BYTE, TS_PACKET_SIZE};
use tspipe_core::plugin::{InputPlugin, OutputPlugin};
use tspipe_core::TsPacket;

/// How many consecutive sync bytes confirm a re-synchronization.
const RESYNC_CHECK_PACKETS: usize = 5;

enum Source {
    Stdin(io::Stdin),
    File(BufReader<File>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Stdin(s) => s.read(buf),
            Source::File(f) => f.read(buf),
        }
    }
}

/// Input plugin reading TS packets from a file or standard input.
///
/// Reads are not guaranteed to be aligned on 188-byte boundaries; a
/// stash buffer accumulates raw bytes and the reader re-aligns on the
/// sync byte when the stream drifts.
pub struct FileInput {
    path: String,
    source: Option<Source>,
    stash: Vec<u8>,
}

impl FileInput {
    /// Create an input for a path; "-" reads standard input.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            source: None,
            stash: Vec::with_capacity(TS_PACKET_SIZE * 64),
        }
    }

    /// Find an offset such that `RESYNC_CHECK_PACKETS` packets in a row
    /// start with the sync byte.
    fn find_sync_offset(buf: &[u8]) -> Option<usize> {
        let need = TS_PACKET_SIZE * RESYNC_CHECK_PACKETS;
        if buf.len() < need {
            return None;
        }
        (0..TS_PACKET_SIZE.min(buf.len().saturating_sub(need) + 1)).find(|&start| {
            (0..RESYNC_CHECK_PACKETS).all(|k| buf[start + k * TS_PACKET_SIZE] == SYNC_BYTE)
        })
    }

    /// Re-align the stash on a packet boundary. Returns false when more
    /// data is needed.
    fn resync(&mut self) -> bool {
        if self.stash.first() == Some(&SYNC_BYTE) {
            return true;
        }
        match Self::find_sync_offset(&self.stash) {
            Some(offset) => {
                warn!("input resync: dropping {offset} bytes");
                self.stash.drain(..offset);
                true
            }
            None => {
                // Keep a packet's worth of tail to sync across reads.
                if self.stash.len() > TS_PACKET_SIZE - 1 {
                    let keep = self.stash.split_off(self.stash.len() - (TS_PACKET_SIZE - 1));
                    self.stash = keep;
                }
                false
            }
        }
    }
}

impl InputPlugin for FileInput {
    fn name(&self) -> &str {
        "file-input"
    }

    fn start(&mut self) -> bool {
        self.stash.clear();
        if self.path == "-" {
            self.source = Some(Source::Stdin(io::stdin()));
            debug!("reading TS from standard input");
            return true;
        }
        match File::open(&self.path) {
            Ok(f) => {
                self.source = Some(Source::File(BufReader::new(f)));
                debug!("reading TS from {}", self.path);
                true
            }
            Err(e) => {
                log::error!("cannot open {}: {e}", self.path);
                false
            }
        }
    }

    fn stop(&mut self) -> bool {
        self.source = None;
        true
    }

    fn receive(&mut self, buffer: &mut [TsPacket]) -> usize {
        if self.source.is_none() {
            return 0;
        }

        let mut chunk = [0u8; 32 * TS_PACKET_SIZE];
        loop {
            // Deliver whole aligned packets from the stash.
            if self.stash.first() == Some(&SYNC_BYTE) || self.resync() {
                let available = self.stash.len() / TS_PACKET_SIZE;
                if available > 0 {
                    let count = available.min(buffer.len());
                    for (i, pkt) in buffer.iter_mut().take(count).enumerate() {
                        let at = i * TS_PACKET_SIZE;
                        pkt.b.copy_from_slice(&self.stash[at..at + TS_PACKET_SIZE]);
                    }
                    self.stash.drain(..count * TS_PACKET_SIZE);
                    return count;
                }
            }

            match self.source.as_mut().unwrap().read(&mut chunk) {
                Ok(0) => {
                    if !self.stash.is_empty() {
                        debug!("discarding {} trailing bytes", self.stash.len());
                    }
                    return 0;
                }
                Ok(n) => self.stash.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("input error: {e}");
                    return 0;
                }
            }
        }
    }
}

enum Sink {
    Stdout(io::Stdout),
    File(BufWriter<File>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(s) => s.write(buf),
            Sink::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(s) => s.flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

/// Output plugin writing TS packets to a file or standard output.
pub struct FileOutput {
    path: String,
    sink: Option<Sink>,
    written: u64,
}

impl FileOutput {
    /// Create an output for a path; "-" writes standard output.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            sink: None,
            written: 0,
        }
    }
}

impl OutputPlugin for FileOutput {
    fn name(&self) -> &str {
        "file-output"
    }

    fn start(&mut self) -> bool {
        self.written = 0;
        if self.path == "-" {
            self.sink = Some(Sink::Stdout(io::stdout()));
            return true;
        }
        match File::create(&self.path) {
            Ok(f) => {
                self.sink = Some(Sink::File(BufWriter::new(f)));
                true
            }
            Err(e) => {
                log::error!("cannot create {}: {e}", self.path);
                false
            }
        }
    }

    fn stop(&mut self) -> bool {
        let flushed = match self.sink.as_mut() {
            Some(sink) => sink.flush().is_ok(),
            None => true,
        };
        info!("wrote {} packets", self.written);
        self.sink = None;
        flushed
    }

    fn send(&mut self, packets: &[TsPacket]) -> bool {
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        for pkt in packets {
            if let Err(e) = sink.write_all(&pkt.b) {
                log::error!("output error: {e}");
                return false;
            }
        }
        self.written += packets.len() as u64;
        true
    }

    fn bitrate_changed(&mut self, bitrate: u32) {
        debug!("output pacing rate now {bitrate} b/s");
    }
}
