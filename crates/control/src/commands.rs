// Copyright 2025-2026 CEMAXECUTER LLC

//! Mnemonic formatters for the radio's ASCII control protocol.
//!
//! Frequencies and rates are given in MHz with fixed-point formatting,
//! matching what the firmware's parser expects.  Everything here is a
//! plain string builder; the pipeline never interprets these commands.

use std::fmt::Display;

pub const NUM_TUNERS: i32 = 4;
pub const DDC_PER_TUNER: i32 = 2;

/// Broadcast MAC used when programming stream endpoints.
pub const STREAM_MAC: &str = "FF:FF:FF:FF:FF:FF";

/// Query answered with `FXL <pct>%`.
pub const FLEX_LOAD_QUERY: &str = "FXL?";

/// Tune tuner and DDC to `freq_mhz`.
pub fn tuner_frequency(tuner: i32, ddc: i32, freq_mhz: f64) -> String {
    format!("FRQ{},{},{:.6};", tuner, ddc, freq_mhz)
}

/// Offset a DDC from its tuner's center by `offset_mhz`.
pub fn ddc_offset(tuner: i32, ddc: i32, offset_mhz: f64) -> String {
    format!("DDF{},{},{:.6};", tuner, ddc, offset_mhz)
}

/// Set the sample rate of a tuner/DDC pair.
pub fn sample_rate(tuner: i32, ddc: i32, rate_mhz: f64) -> String {
    format!("SPR{},{},{:.6};", tuner, ddc, rate_mhz)
}

/// Enable or disable the VITA-49 data stream of a tuner/DDC pair.
pub fn data_stream(tuner: i32, ddc: i32, enable: bool) -> String {
    format!("STE{},{},{};", tuner, ddc, enable as i32)
}

/// Set a tuner's attenuation, bracketed by channel selection.
pub fn attenuation(tuner: i32, atten: f64) -> String {
    format!("RCH{};ATN{};RCH0;", tuner, trim_float(atten))
}

/// Switch a tuner's preamp, bracketed by channel selection.
pub fn preamp(tuner: i32, on: bool) -> String {
    format!("RCH{};PAM{};RCH0;", tuner, on as i32)
}

/// Select which physical 10 GbE port a tuner/DDC streams from.
pub fn output_port(tuner: i32, ddc: i32, port: i32) -> String {
    format!("STO{},{},{};", tuner, ddc, port)
}

/// Enter or leave configuration mode.
pub fn config_mode(enable: bool) -> String {
    format!("CFG{};", enable as i32)
}

/// Program the source address of a tuner/DDC's data stream.
pub fn stream_source(tuner: i32, ddc: i32, addr: &str, port: u16, mac: &str) -> String {
    format!("#UDP{},{},{},{},{};", tuner, ddc, addr, port, mac)
}

/// Program the destination address of a tuner/DDC's data stream.
pub fn stream_dest(tuner: i32, ddc: i32, addr: &str, port: u16, mac: &str) -> String {
    format!("SIP{},{},{},{},{};", tuner, ddc, addr, port, mac)
}

/// Put every tuner into independent operation mode.
pub fn enable_independent_operation() -> String {
    "RCH1;DFM2;RCH2;DFM2;RCH3;DFM2;RCH4;DFM2;RCH0".to_string()
}

/// Gate all data streams: `hold` pauses output, release resumes it.
pub fn stream_gate(hold: bool) -> String {
    format!("SYN{}", hold as i32)
}

/// Disable the data streams of every tuner/DDC pair.
pub fn shutdown_streams() -> String {
    let mut s = String::new();
    for tuner in 1..=NUM_TUNERS {
        for ddc in 1..=DDC_PER_TUNER {
            s.push_str(&data_stream(tuner, ddc, false));
        }
    }
    s
}

/// Enable or disable one flex FFT stream.
pub fn flex_stream(stream_id: i32, enable: bool) -> String {
    format!("FSE{},{};", stream_id, enable as i32)
}

/// Program a flex stream's destination endpoint.
pub fn flex_dest(stream_id: i32, addr: &str, port: u16, mac: &str) -> String {
    format!("FIP{},{},{},{};", stream_id, addr, port, mac)
}

/// Set a flex stream's update rate in Hz.
pub fn flex_rate(stream_id: i32, rate_hz: f64) -> String {
    format!("FSR{},{:.3};", stream_id, rate_hz)
}

/// Set a flex stream's averaging constant.
pub fn flex_averaging(stream_id: i32, averages: i32) -> String {
    format!("FAV{},{};", stream_id, averages)
}

/// Bind a flex stream to its RF source and FFT size.
pub fn flex_config(stream_id: i32, source_id: i32, fft_size: i32) -> String {
    format!("FCF{},{},{};", stream_id, source_id, fft_size)
}

/// Disable every flex stream.
pub fn shutdown_flex(max_streams: i32) -> String {
    let mut s = String::new();
    for id in 1..=max_streams {
        s.push_str(&flex_stream(id, false));
    }
    s
}

fn trim_float(v: f64) -> impl Display {
    // Attenuation is whole dB in practice; print it without a tail of
    // zeros while keeping fractional settings intact.
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_match_the_wire_protocol() {
        assert_eq!(tuner_frequency(1, 2, 100.5), "FRQ1,2,100.500000;");
        assert_eq!(sample_rate(4, 1, 0.000977), "SPR4,1,0.000977;");
        assert_eq!(data_stream(2, 1, true), "STE2,1,1;");
        assert_eq!(data_stream(2, 1, false), "STE2,1,0;");
        assert_eq!(attenuation(3, 10.0), "RCH3;ATN10;RCH0;");
        assert_eq!(attenuation(3, 10.5), "RCH3;ATN10.5;RCH0;");
        assert_eq!(preamp(1, true), "RCH1;PAM1;RCH0;");
        assert_eq!(output_port(1, 1, 0), "STO1,1,0;");
        assert_eq!(config_mode(true), "CFG1;");
        assert_eq!(
            stream_dest(1, 1, "192.168.1.2", 4991, STREAM_MAC),
            "SIP1,1,192.168.1.2,4991,FF:FF:FF:FF:FF:FF;"
        );
        assert_eq!(stream_gate(true), "SYN1");
        assert_eq!(stream_gate(false), "SYN0");
    }

    #[test]
    fn shutdown_covers_every_pair() {
        let all = shutdown_streams();
        assert_eq!(all.matches("STE").count(), 8);
        assert!(all.contains("STE1,1,0;"));
        assert!(all.contains("STE4,2,0;"));
    }

    #[test]
    fn flex_formats() {
        assert_eq!(flex_stream(2, true), "FSE2,1;");
        assert_eq!(flex_rate(1, 10.0), "FSR1,10.000;");
        assert_eq!(flex_averaging(1, 16), "FAV1,16;");
        assert_eq!(flex_config(1, 3, 1024), "FCF1,3,1024;");
        assert_eq!(shutdown_flex(4).matches("FSE").count(), 4);
    }
}
