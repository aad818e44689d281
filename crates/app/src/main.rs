use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use num_complex::Complex32;

use prx_app::config::{parse_flex_spec, parse_group_spec, SourceConfig, MAX_FLEX_STREAMS, MAX_GROUPS};
use prx_app::source::{PolarisSource, TagValue};

#[derive(Parser, Debug)]
#[command(name = "polaris-rx")]
#[command(about = "Polaris digitizer receive pipeline")]
struct Cli {
    /// Control address of the radio
    #[arg(short = 'i', long)]
    ip: String,

    /// TCP port of the mnemonic application
    #[arg(long, default_value = "8081")]
    mne_port: u16,

    /// UDP port the IQ stream arrives on
    #[arg(short = 'r', long, default_value = "4991")]
    rec_port: u16,

    /// UDP port the flex FFT stream arrives on
    #[arg(short = 'x', long, default_value = "4992")]
    flex_port: u16,

    /// Source address of the radio's 10GbE streams
    #[arg(long)]
    stream_ip: String,

    /// Local fiber address the streams are sent to
    #[arg(long)]
    fiber_ip: String,

    /// Number of IQ output streams (0-8)
    #[arg(short = 'o', long, default_value = "0")]
    outputs: usize,

    /// Tuner group spec, repeatable:
    /// tuner=1,ddcs=2,freq=100e6,offset1=0,offset2=0,rate=1e6,atten=0[,preamp]
    #[arg(short = 'g', long = "group")]
    groups: Vec<String>,

    /// Flex stream spec, repeatable: source=0,rate=1,ave=4,size=1024[,no-complex]
    #[arg(short = 'f', long = "flex")]
    flex: Vec<String>,

    /// Put the tuners in independent operation mode
    #[arg(long)]
    independent: bool,

    /// Physical 10GbE output port (0-1)
    #[arg(short = 'p', long, default_value = "0")]
    phys_port: i32,

    /// Samples requested per pull
    #[arg(long, default_value = "8192")]
    chunk: usize,

    /// Print periodic statistics
    #[arg(long)]
    stats: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn build_config(cli: &Cli) -> Result<SourceConfig, String> {
    if cli.groups.len() > MAX_GROUPS {
        return Err(format!("at most {} tuner groups", MAX_GROUPS));
    }
    if cli.flex.len() > MAX_FLEX_STREAMS {
        return Err(format!("at most {} flex streams", MAX_FLEX_STREAMS));
    }

    let mut config = SourceConfig::new(&cli.ip, &cli.stream_ip, &cli.fiber_ip);
    config.mne_port = cli.mne_port;
    config.rec_port = cli.rec_port;
    config.flex_port = cli.flex_port;
    config.independent_operation = cli.independent;
    config.phys_port = cli.phys_port;
    config.num_groups = cli.groups.len().max(1);

    for spec in &cli.groups {
        config.groups.push(parse_group_spec(spec)?);
    }
    for (i, spec) in cli.flex.iter().enumerate() {
        config.flex_streams.push(parse_flex_spec(i as i32 + 1, spec)?);
    }
    config.num_flex_outputs = config.flex_streams.len();

    let available: usize = config.groups.iter().map(|g| g.num_ddcs as usize).sum();
    config.num_outputs = if cli.outputs > 0 {
        cli.outputs.min(available)
    } else {
        available
    };

    if config.num_outputs == 0 && config.num_flex_outputs == 0 {
        return Err(
            "no data streams enabled; configure at least one group DDC or one flex stream"
                .to_string(),
        );
    }
    Ok(config)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    if cli.verbose {
        log::info!("polaris-rx starting");
        log::info!("radio: {}:{}", config.ip, config.mne_port);
        log::info!(
            "outputs: {} IQ, {} flex",
            config.num_outputs,
            config.num_flex_outputs
        );
    }

    let mut source = PolarisSource::new(config.clone());
    if let Err(e) = source.start() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        flag.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl-C handler");

    let chunk = cli.chunk;
    let mut iq_bufs: Vec<Vec<Complex32>> = (0..config.num_outputs)
        .map(|_| vec![Complex32::new(0.0, 0.0); chunk])
        .collect();
    let mut flex_bufs: Vec<Vec<f32>> = (0..config.num_flex_outputs)
        .map(|_| vec![0.0f32; chunk])
        .collect();

    let mut total_iq: u64 = 0;
    let mut total_flex: u64 = 0;
    let mut total_tags: u64 = 0;
    let stats_start = Instant::now();
    let mut last_stats = Instant::now();

    while running.load(Ordering::SeqCst) {
        let mut iq_out: Vec<&mut [Complex32]> = iq_bufs.iter_mut().map(|b| &mut b[..]).collect();
        let mut flex_out: Vec<&mut [f32]> = flex_bufs.iter_mut().map(|b| &mut b[..]).collect();

        let verbose = cli.verbose;
        let mut tag_count = 0u64;
        let counts = source.work(
            chunk,
            &mut iq_out,
            &mut flex_out,
            &mut |stream, offset, key, value| {
                tag_count += 1;
                if verbose {
                    match value {
                        TagValue::Double(v) => {
                            log::info!("tag stream={} offset={} {}={}", stream, offset, key, v)
                        }
                        TagValue::Int(v) => {
                            log::info!("tag stream={} offset={} {}={}", stream, offset, key, v)
                        }
                    }
                }
            },
        );
        total_tags += tag_count;
        total_iq += counts.iq.iter().map(|&c| c as u64).sum::<u64>();
        total_flex += counts.flex.iter().map(|&c| c as u64).sum::<u64>();

        if cli.stats && last_stats.elapsed().as_secs() >= 5 {
            let elapsed = stats_start.elapsed().as_secs_f64();
            let iq_stats = source.iq_manager().map(|m| m.stats()).unwrap_or_default();
            eprintln!(
                "[{:.1}s] iq: {} flex: {} tags: {} lost: {} capped: {}",
                elapsed, total_iq, total_flex, total_tags, iq_stats.lost, iq_stats.capped,
            );
            last_stats = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    source.stop();
    if cli.stats {
        let elapsed = stats_start.elapsed().as_secs_f64();
        eprintln!(
            "done ({:.1}s): iq: {} flex: {} tags: {}",
            elapsed, total_iq, total_flex, total_tags,
        );
    }
}
