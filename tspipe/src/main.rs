//! tspipe: transport stream processor.
//!
//! Streams 188-byte TS packets from an input through a chain of
//! processors into an output, all sharing one memory-resident packet
//! buffer.

use std::process::ExitCode;

use bytes::Bytes;
use clap::Parser;
use log::error;

mod logging;
mod monitor;
mod plugins;
mod signal;

use tspipe_core::executor::{Pipeline, PipelineConfig, DEFAULT_BUFFER_SIZE};
use tspipe_core::reporter::{Reporter, ReporterConfig, Severity};
use tspipe_core::scramble::{ControlWord, ScramblerConfig, ScramblerStage, ServiceRef};

use plugins::{FileInput, FileOutput, Nullify, PassThrough, PROCESSORS};

/// tspipe - transport stream processor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file path, or "-" for standard input
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Output file path, or "-" for standard output
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Processor to insert, in order (repeatable); see --list-processors
    #[arg(short = 'p', long = "processor")]
    processors: Vec<String>,

    /// Global packet buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    bufsize: usize,

    /// Spawn the progress monitor thread
    #[arg(long)]
    monitor: bool,

    /// List available processors and exit
    #[arg(long)]
    list_processors: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log synchronously instead of through the asynchronous queue
    #[arg(long)]
    sync_log: bool,

    /// High-water mark of the asynchronous log queue, in messages
    #[arg(long, default_value = "512")]
    log_queue: usize,

    /// Service to scramble: a service id (decimal or 0x-prefixed hex)
    /// or a service name from the SDT
    #[arg(long)]
    service: Option<String>,

    /// Fixed control word for the scrambler, 16 hexadecimal digits
    #[arg(long)]
    control_word: Option<String>,

    /// Crypto-period duration in seconds
    #[arg(long, default_value = "10")]
    cp_duration: u64,

    /// ECM PID bitrate in bits/second
    #[arg(long, default_value = "30000")]
    bitrate_ecm: u32,

    /// ECM PID (decimal or 0x-prefixed hex); allocated automatically
    /// when absent
    #[arg(long)]
    pid_ecm: Option<String>,

    /// Scramble one packet out of this many
    #[arg(long, default_value = "1")]
    partial_scrambling: u64,

    /// Insert CA descriptors at component level instead of program level
    #[arg(long)]
    component_level: bool,

    /// Pass through packets that are already scrambled
    #[arg(long)]
    ignore_scrambled: bool,

    /// Do not scramble audio components
    #[arg(long)]
    no_audio: bool,

    /// Do not scramble video components
    #[arg(long)]
    no_video: bool,

    /// Scramble subtitles components
    #[arg(long)]
    subtitles: bool,

    /// Keep the full 64-bit control word instead of reducing to 48 bits
    #[arg(long)]
    no_entropy_reduction: bool,

    /// DVB SimulCrypt Super_CAS_Id (decimal or 0x-prefixed hex)
    #[arg(long)]
    super_cas_id: Option<String>,

    /// Access criteria as hexadecimal digits
    #[arg(long)]
    access_criteria: Option<String>,

    /// CA descriptor private data as hexadecimal digits
    #[arg(long)]
    private_data: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logging(args.verbose);

    if args.list_processors {
        for (name, description) in PROCESSORS {
            println!("{name:12} {description}");
        }
        return ExitCode::SUCCESS;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}

fn run(args: &Args) -> Result<(), ()> {
    let reporter_thread = Reporter::new(ReporterConfig {
        queue_size: args.log_queue,
        synchronous: args.sync_log,
        max_severity: if args.verbose {
            Severity::Debug
        } else {
            Severity::Info
        },
    });

    let mut pipeline = Pipeline::new(PipelineConfig {
        buffer_size: args.bufsize,
    })
    .input(Box::new(FileInput::new(&args.input)))
    .output(Box::new(FileOutput::new(&args.output)))
    .reporter(reporter_thread.handle());

    for name in &args.processors {
        match name.as_str() {
            "pass" => pipeline = pipeline.processor(Box::new(PassThrough)),
            "null" => pipeline = pipeline.processor(Box::<Nullify>::default()),
            "scrambler" => {
                let config = scrambler_config(args)?;
                pipeline = pipeline.processor(Box::new(ScramblerStage::new(config, None)));
            }
            other => {
                error!("unknown processor \"{other}\", try --list-processors");
                return Err(());
            }
        }
    }

    let handle = match pipeline.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!("{e}");
            reporter_thread.shutdown();
            return Err(());
        }
    };

    signal::install();
    signal::spawn_watcher(handle.abort_handle());
    if args.monitor {
        let _ = monitor::spawn(handle.metrics_handle());
    }

    let result = handle.wait();
    reporter_thread.shutdown();
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{e}");
            Err(())
        }
    }
}

fn scrambler_config(args: &Args) -> Result<ScramblerConfig, ()> {
    let Some(service) = args.service.as_deref() else {
        error!("the scrambler requires --service");
        return Err(());
    };
    let service = match parse_u16(service) {
        Some(id) => ServiceRef::Id(id),
        None => ServiceRef::Name(service.to_string()),
    };

    let Some(cw) = args.control_word.as_deref() else {
        error!("the scrambler requires --control-word (no ECM generator is linked in)");
        return Err(());
    };
    let cw_bytes = parse_hex(cw).ok_or_else(|| {
        error!("invalid control word, specify 16 hexadecimal digits");
    })?;
    let fixed_cw: ControlWord = cw_bytes.as_slice().try_into().map_err(|_| {
        error!("invalid control word, specify 16 hexadecimal digits");
    })?;

    let ecm_pid = match args.pid_ecm.as_deref() {
        Some(s) => Some(parse_u16(s).filter(|&p| p < 0x1FFF).ok_or_else(|| {
            error!("invalid --pid-ecm value");
        })?),
        None => None,
    };
    let super_cas_id = match args.super_cas_id.as_deref() {
        Some(s) => parse_u32(s).ok_or_else(|| {
            error!("invalid --super-cas-id value");
        })?,
        None => 0,
    };
    let access_criteria = match args.access_criteria.as_deref() {
        Some(s) => Bytes::from(parse_hex(s).ok_or_else(|| {
            error!("invalid access criteria, specify an even number of hexadecimal digits");
        })?),
        None => Bytes::new(),
    };
    let ca_private_data = match args.private_data.as_deref() {
        Some(s) => Bytes::from(parse_hex(s).ok_or_else(|| {
            error!("invalid private data, specify an even number of hexadecimal digits");
        })?),
        None => Bytes::new(),
    };

    Ok(ScramblerConfig {
        service,
        component_level: args.component_level,
        scramble_audio: !args.no_audio,
        scramble_video: !args.no_video,
        scramble_subtitles: args.subtitles,
        synchronous_ecmg: false,
        ignore_scrambled: args.ignore_scrambled,
        super_cas_id,
        access_criteria,
        ca_private_data,
        cp_duration_ms: args.cp_duration * 1000,
        ecm_bitrate: args.bitrate_ecm,
        ecm_pid,
        partial_scrambling: args.partial_scrambling,
        fixed_cw: Some(fixed_cw),
        entropy: if args.no_entropy_reduction {
            tspipe_core::scramble::EntropyMode::FullCw
        } else {
            tspipe_core::scramble::EntropyMode::ReduceEntropy
        },
    })
}

/// Parse a decimal or 0x-prefixed hexadecimal integer.
fn parse_u32(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_u16(s: &str) -> Option<u16> {
    parse_u32(s).and_then(|v| u16::try_from(v).ok())
}

/// Parse an even-length string of hexadecimal digits.
fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if !s.is_ascii() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_u16("256"), Some(256));
        assert_eq!(parse_u16("0x100"), Some(0x100));
        assert_eq!(parse_u16("0x12345"), None);
        assert_eq!(parse_u32("0xFFFFFFFF"), Some(u32::MAX));
        assert_eq!(parse_hex("0123ab"), Some(vec![0x01, 0x23, 0xAB]));
        assert_eq!(parse_hex("123"), None);
        assert_eq!(parse_hex("zz"), None);
    }
}
