// Copyright 2025-2026 CEMAXECUTER LLC

//! Radio configuration: network endpoints, tuner groups, and flex FFT
//! streams, with the range checks the firmware enforces.

pub const MAX_OUTPUTS: usize = 8;
pub const MAX_GROUPS: usize = 4;
pub const MAX_FLEX_STREAMS: usize = 4;
pub const NUM_TUNERS: i32 = 4;
pub const DDC_PER_TUNER: i32 = 2;

pub const DEFAULT_MNE_PORT: u16 = 8081;

pub const MHZ_SCALE: f64 = 1_000_000.0;
pub const MIN_FREQ_MHZ: f64 = 2.0;
pub const MAX_FREQ_MHZ: f64 = 6200.0;
pub const MAX_DDC_OFFSET_HZ: f64 = 64_000_000.0;
pub const MIN_ATTEN: f64 = 0.0;
pub const MAX_ATTEN: f64 = 46.0;
pub const MIN_SAMP_RATE_MHZ: f64 = 0.000977;
pub const MAX_SAMP_RATE_MHZ: f64 = 128.0;

pub const HIGHEST_FLEX_SOURCE: i32 = 11;
pub const MIN_FLEX_SR: f64 = 0.033;
pub const MAX_FLEX_SR: f64 = 1000.0;
pub const MIN_FLEX_AVE: i32 = 1;
pub const MAX_FLEX_AVE: i32 = 1024;
pub const MIN_FLEX_SIZE_ADC: i32 = 32;
pub const MAX_FLEX_SIZE_ADC: i32 = 4096;
pub const MIN_FLEX_SIZE_DDC: i32 = 64;
pub const MAX_FLEX_SIZE_DDC: i32 = 8192;

/// One tuner group: a tuner, how many of its DDCs stream, and the RF
/// settings shared by the pair.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub tuner: i32,
    pub num_ddcs: i32,
    pub tuner_freq: f64,
    pub ddc_offset: [f64; 2],
    pub samp_rate: f64,
    pub atten: f64,
    pub preamp: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            tuner: -1,
            num_ddcs: 0,
            tuner_freq: 0.0,
            ddc_offset: [0.0, 0.0],
            samp_rate: 0.0,
            atten: 0.0,
            preamp: false,
        }
    }
}

/// One flex FFT stream and its DSP settings.
#[derive(Debug, Clone)]
pub struct FlexStreamConfig {
    pub stream_id: i32,
    pub source_id: i32,
    pub disable_complex: bool,
    pub sample_rate: f64,
    pub averaging: i32,
    pub fft_size: i32,
    pub enabled: bool,
}

impl FlexStreamConfig {
    pub fn with_id(stream_id: i32) -> Self {
        Self {
            stream_id,
            source_id: -1,
            disable_complex: false,
            sample_rate: MIN_FLEX_SR,
            averaging: MIN_FLEX_AVE,
            fft_size: MIN_FLEX_SIZE_DDC,
            enabled: false,
        }
    }

    /// Sources 0, 3, 6, 9 are the tuner ADCs; the rest are DDC taps.
    pub fn is_adc_stream(&self) -> bool {
        self.source_id % 3 == 0
    }

    /// Tuner feeding this stream (1..4).
    pub fn source_tuner(&self) -> i32 {
        self.source_id / 3 + 1
    }

    /// DDC within the tuner (0 for the ADC tap).
    pub fn source_ddc(&self) -> i32 {
        self.source_id % 3
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Control address of the radio.
    pub ip: String,
    /// UDP port the IQ stream arrives on.
    pub rec_port: u16,
    /// TCP port of the mnemonic application.
    pub mne_port: u16,
    /// UDP port the flex FFT stream arrives on.
    pub flex_port: u16,
    /// Source address of the radio's 10 GbE streams.
    pub stream_ip: String,
    /// Local fiber address the streams are sent to.
    pub fiber_ip: String,
    pub num_outputs: usize,
    pub num_groups: usize,
    pub num_flex_outputs: usize,
    pub independent_operation: bool,
    pub phys_port: i32,
    pub groups: Vec<GroupConfig>,
    pub flex_streams: Vec<FlexStreamConfig>,
}

impl SourceConfig {
    pub fn new(ip: &str, stream_ip: &str, fiber_ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            rec_port: 0,
            mne_port: DEFAULT_MNE_PORT,
            flex_port: 0,
            stream_ip: stream_ip.to_string(),
            fiber_ip: fiber_ip.to_string(),
            num_outputs: 0,
            num_groups: 1,
            num_flex_outputs: 0,
            independent_operation: false,
            phys_port: 0,
            groups: Vec::new(),
            flex_streams: Vec::new(),
        }
    }
}

pub fn is_power_of_two(x: i32) -> bool {
    x > 0 && x & (x - 1) == 0
}

/// Parse a `key=value` comma list describing one tuner group, e.g.
/// `tuner=1,ddcs=2,freq=100e6,offset1=0,rate=1e6,atten=10,preamp`.
pub fn parse_group_spec(spec: &str) -> Result<GroupConfig, String> {
    let mut group = GroupConfig::default();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some(("tuner", v)) => group.tuner = parse_num(v, "tuner")?,
            Some(("ddcs", v)) => group.num_ddcs = parse_num(v, "ddcs")?,
            Some(("freq", v)) => group.tuner_freq = parse_num(v, "freq")?,
            Some(("offset1", v)) => group.ddc_offset[0] = parse_num(v, "offset1")?,
            Some(("offset2", v)) => group.ddc_offset[1] = parse_num(v, "offset2")?,
            Some(("rate", v)) => group.samp_rate = parse_num(v, "rate")?,
            Some(("atten", v)) => group.atten = parse_num(v, "atten")?,
            None if part == "preamp" => group.preamp = true,
            _ => return Err(format!("unknown group option '{}'", part)),
        }
    }
    if !(1..=NUM_TUNERS).contains(&group.tuner) {
        return Err(format!("group tuner must be 1..{}", NUM_TUNERS));
    }
    if !(1..=DDC_PER_TUNER).contains(&group.num_ddcs) {
        return Err(format!("group ddcs must be 1..{}", DDC_PER_TUNER));
    }
    Ok(group)
}

/// Parse a `key=value` comma list describing one flex stream, e.g.
/// `source=0,rate=1,ave=4,size=1024,no-complex`.
pub fn parse_flex_spec(stream_id: i32, spec: &str) -> Result<FlexStreamConfig, String> {
    let mut flex = FlexStreamConfig::with_id(stream_id);
    flex.enabled = true;
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some(("source", v)) => flex.source_id = parse_num(v, "source")?,
            Some(("rate", v)) => flex.sample_rate = parse_num(v, "rate")?,
            Some(("ave", v)) => flex.averaging = parse_num(v, "ave")?,
            Some(("size", v)) => flex.fft_size = parse_num(v, "size")?,
            None if part == "no-complex" => flex.disable_complex = true,
            _ => return Err(format!("unknown flex option '{}'", part)),
        }
    }
    if !(0..=HIGHEST_FLEX_SOURCE).contains(&flex.source_id) {
        return Err(format!(
            "flex source must be 0..{}",
            HIGHEST_FLEX_SOURCE
        ));
    }
    Ok(flex)
}

fn parse_num<T: std::str::FromStr>(v: &str, name: &str) -> Result<T, String> {
    v.parse::<f64>()
        .map_err(|_| format!("bad value for {}: '{}'", name, v))
        .and_then(|f| {
            // Round-trip through f64 so scientific notation works for
            // integer fields too.
            format!("{}", f)
                .parse::<T>()
                .or_else(|_| v.parse::<T>())
                .map_err(|_| format!("bad value for {}: '{}'", name, v))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_specs_parse() {
        let g = parse_group_spec("tuner=2,ddcs=2,freq=100e6,offset1=-1e6,rate=5e6,atten=10,preamp")
            .unwrap();
        assert_eq!(g.tuner, 2);
        assert_eq!(g.num_ddcs, 2);
        assert_eq!(g.tuner_freq, 100e6);
        assert_eq!(g.ddc_offset[0], -1e6);
        assert_eq!(g.samp_rate, 5e6);
        assert_eq!(g.atten, 10.0);
        assert!(g.preamp);
    }

    #[test]
    fn group_spec_rejects_bad_input() {
        assert!(parse_group_spec("tuner=5,ddcs=1").is_err());
        assert!(parse_group_spec("tuner=1,ddcs=3").is_err());
        assert!(parse_group_spec("tuner=1,ddcs=1,bogus=7").is_err());
        assert!(parse_group_spec("ddcs=1").is_err());
    }

    #[test]
    fn flex_specs_parse() {
        let f = parse_flex_spec(1, "source=4,rate=10,ave=16,size=2048,no-complex").unwrap();
        assert_eq!(f.stream_id, 1);
        assert_eq!(f.source_id, 4);
        assert_eq!(f.sample_rate, 10.0);
        assert_eq!(f.averaging, 16);
        assert_eq!(f.fft_size, 2048);
        assert!(f.disable_complex);
        assert!(!f.is_adc_stream());
        assert_eq!(f.source_tuner(), 2);
        assert_eq!(f.source_ddc(), 1);
    }

    #[test]
    fn adc_sources_are_multiples_of_three() {
        for source in [0, 3, 6, 9] {
            let f = parse_flex_spec(1, &format!("source={}", source)).unwrap();
            assert!(f.is_adc_stream());
            assert_eq!(f.source_ddc(), 0);
        }
        assert!(parse_flex_spec(1, "source=12").is_err());
    }

    #[test]
    fn power_of_two_check() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(1024));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(-4));
        assert!(!is_power_of_two(12));
    }
}
