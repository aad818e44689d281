// Copyright 2025-2026 CEMAXECUTER LLC

//! The radio source facade.
//!
//! `PolarisSource` owns the control channel and both receive pipelines.
//! Configuration setters validate their ranges, mirror the value locally,
//! and emit the matching mnemonics; `work` is the dataflow host's pull
//! entry point, filling IQ and flex destination buffers once per tick and
//! reporting flex metadata transitions as item tags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use num_complex::Complex32;

use prx_capture::manager::{ComplexManager, ManagerConfig};
use prx_capture::NUM_STREAMS;
use prx_control::commands;
use prx_control::load::parse_flex_load;
use prx_control::{LoadMonitor, MnemonicClient};
use prx_flex::engine::FlexEngine;
use prx_flex::manager::{FlexManager, StreamChange};

use crate::config::{
    is_power_of_two, FlexStreamConfig, SourceConfig, DDC_PER_TUNER, HIGHEST_FLEX_SOURCE,
    MAX_ATTEN, MAX_DDC_OFFSET_HZ, MAX_FLEX_AVE, MAX_FLEX_SIZE_ADC, MAX_FLEX_SIZE_DDC,
    MAX_FLEX_SR, MAX_FLEX_STREAMS, MAX_FREQ_MHZ, MAX_SAMP_RATE_MHZ, MHZ_SCALE, MIN_ATTEN,
    MIN_FLEX_AVE, MIN_FLEX_SIZE_ADC, MIN_FLEX_SIZE_DDC, MIN_FLEX_SR, MIN_FREQ_MHZ,
    MIN_SAMP_RATE_MHZ, NUM_TUNERS,
};

/// Item-tag keys for flex metadata transitions.
pub const FLEX_RATE_TAG: &str = "flex_rate";
pub const FLEX_SIZE_TAG: &str = "flex_size";
pub const FLEX_REF_TAG: &str = "flex_rlvl";
pub const FLEX_AVE_TAG: &str = "flex_nave";
pub const FLEX_FREQ_TAG: &str = "flex_freq";

/// Deferred load checks fire no more often than this.
const LOAD_CHECK_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagValue {
    Double(f64),
    Int(i64),
}

/// Per-tick production counts, one per output stream.
#[derive(Debug, Default)]
pub struct WorkCounts {
    pub iq: Vec<usize>,
    pub flex: Vec<usize>,
}

pub struct PolarisSource {
    config: SourceConfig,
    client: Option<Arc<MnemonicClient>>,
    iq: Option<ComplexManager>,
    flex: Option<(FlexEngine, FlexManager)>,
    /// Stream IDs (1..8) subscribed for the IQ outputs, -1 padded.
    tuners: Vec<i32>,
    started: bool,
    setup_problem: bool,
    load_monitor: Arc<Mutex<LoadMonitor>>,
    load_check_pending: bool,
    load_check_requested: Option<Instant>,
    load_check_running: Arc<AtomicBool>,
    flex_items_written: Vec<u64>,
    iq_config: ManagerConfig,
}

impl PolarisSource {
    pub fn new(config: SourceConfig) -> Self {
        Self::with_manager_config(config, ManagerConfig::default())
    }

    /// Like `new`, with pipeline capacities injectable for tests.
    pub fn with_manager_config(config: SourceConfig, iq_config: ManagerConfig) -> Self {
        let client = match MnemonicClient::connect(&config.ip, config.mne_port) {
            Ok(c) => Some(Arc::new(c)),
            Err(e) => {
                log::error!("{}", e);
                log::error!("running disconnected; the source will produce no data");
                None
            }
        };
        let mut source = Self {
            tuners: vec![-1; NUM_STREAMS],
            flex_items_written: vec![0; config.num_flex_outputs],
            config,
            client,
            iq: None,
            flex: None,
            started: false,
            setup_problem: false,
            load_monitor: Arc::new(Mutex::new(LoadMonitor::new())),
            load_check_pending: false,
            load_check_requested: None,
            load_check_running: Arc::new(AtomicBool::new(false)),
            iq_config,
        };
        if source.client.is_some() {
            source.setup_radio();
        }
        source
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Send a command, logging rather than propagating failures: a
    /// misbehaving control link must not take the pipelines down.
    fn mne(&self, command: &str) {
        if let Some(client) = &self.client {
            if let Err(e) = client.send(command) {
                log::error!("{}", e);
            }
        }
    }

    /// Program stream endpoints and quiet every output, bracketed by
    /// configuration mode.
    fn setup_radio(&self) {
        log::info!("setting up the radio");
        self.mne(&commands::config_mode(true));
        for tuner in 1..=NUM_TUNERS {
            for ddc in 1..=DDC_PER_TUNER {
                self.mne(&commands::stream_source(
                    tuner,
                    ddc,
                    &self.config.stream_ip,
                    self.config.rec_port,
                    commands::STREAM_MAC,
                ));
                self.mne(&commands::stream_dest(
                    tuner,
                    ddc,
                    &self.config.fiber_ip,
                    self.config.rec_port,
                    commands::STREAM_MAC,
                ));
                self.mne(&commands::data_stream(tuner, ddc, false));
                self.mne(&commands::output_port(tuner, ddc, self.config.phys_port));
                if self.config.independent_operation {
                    self.mne(&commands::enable_independent_operation());
                }
            }
        }
        self.mne(&commands::config_mode(false));
        log::info!("radio setup complete");
    }

    /// Expand the groups into subscribed IQ stream IDs, skipping pairs a
    /// flex stream claimed with `disable_complex`.
    fn build_tuner_list(&self) -> Vec<i32> {
        let mut tuners = vec![-1; NUM_STREAMS];
        let mut index = 0;
        for group in self.config.groups.iter() {
            if group.tuner < 1 || group.tuner > NUM_TUNERS {
                continue;
            }
            for ddc in 1..=group.num_ddcs.min(DDC_PER_TUNER) {
                if !self.is_complex_enabled(group.tuner, ddc) {
                    continue;
                }
                if index < tuners.len() {
                    tuners[index] = (group.tuner - 1) * 2 + ddc;
                    index += 1;
                }
            }
        }
        tuners
    }

    /// A tuner/DDC pair streams IQ unless an enabled flex stream sourcing
    /// it asked for the complex output to be off.
    fn is_complex_enabled(&self, tuner: i32, ddc: i32) -> bool {
        !self.config.flex_streams.iter().any(|flex| {
            flex.enabled
                && flex.disable_complex
                && flex.source_tuner() == tuner
                && flex.source_ddc() == ddc
        })
    }

    fn check_flex_setup(&self) -> Result<(), String> {
        let streams = &self.config.flex_streams;
        for (i, a) in streams.iter().enumerate() {
            for b in streams.iter().skip(i + 1) {
                if a.source_id == b.source_id {
                    return Err(format!(
                        "flex streams {} and {} share a source; select unique source IDs",
                        a.stream_id, b.stream_id
                    ));
                }
            }
        }
        for flex in streams {
            let tuner = flex.source_tuner();
            let ddc = flex.source_ddc();
            let covered = self.config.groups.iter().any(|g| {
                g.tuner == tuner && (flex.is_adc_stream() || g.num_ddcs >= ddc)
            });
            if !covered {
                return Err(format!(
                    "missing RF control for flex stream {} using tuner {} {}; \
                     assign a group to that tuner with enough DDC outputs",
                    flex.stream_id,
                    tuner,
                    if flex.is_adc_stream() {
                        "ADC".to_string()
                    } else {
                        format!("DDC {}", ddc)
                    }
                ));
            }
        }
        Ok(())
    }

    /// Bring the pipelines up and enable streaming.
    pub fn start(&mut self) -> Result<(), String> {
        if self.client.is_none() {
            return Err("not connected to the radio".to_string());
        }
        if let Err(e) = self.check_flex_setup() {
            self.setup_problem = true;
            log::error!("{}", e);
            return Err(e);
        }

        if self.config.num_outputs > 0 {
            let manager =
                ComplexManager::with_config(&self.config.fiber_ip, self.config.rec_port, self.iq_config)?;
            self.tuners = self.build_tuner_list();
            manager.update_tuners(&self.tuners);
            self.iq = Some(manager);
        }

        if self.config.num_flex_outputs > 0 {
            let engine = FlexEngine::new(&self.config.fiber_ip, self.config.flex_port);
            let mut manager = FlexManager::new(engine.exchange());
            for flex in &self.config.flex_streams {
                if flex.enabled {
                    manager.add_stream(flex.stream_id as u32);
                    self.mne(&commands::flex_dest(
                        flex.stream_id,
                        &self.config.fiber_ip,
                        self.config.flex_port,
                        commands::STREAM_MAC,
                    ));
                    self.mne(&commands::flex_config(
                        flex.stream_id,
                        flex.source_id,
                        flex.fft_size,
                    ));
                    self.mne(&commands::flex_rate(flex.stream_id, flex.sample_rate));
                    self.mne(&commands::flex_averaging(flex.stream_id, flex.averaging));
                    self.mne(&commands::flex_stream(flex.stream_id, true));
                }
            }
            self.flex = Some((engine, manager));
            self.flex_items_written = vec![0; self.config.num_flex_outputs];
            self.schedule_load_check();
        }

        // Open the gate.
        self.mne(&commands::stream_gate(false));
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.mne(&commands::shutdown_streams());
        self.mne(&commands::shutdown_flex(MAX_FLEX_STREAMS as i32));
        if let Some(mut manager) = self.iq.take() {
            manager.stop();
        }
        if let Some((mut engine, _)) = self.flex.take() {
            engine.stop();
        }
        self.started = false;
    }

    /// The per-tick pull.  Fills up to `noutput_items` samples into each
    /// IQ and flex destination and emits an item tag per flex metadata
    /// transition through `add_tag(stream_index, sample_offset, key,
    /// value)`.
    pub fn work(
        &mut self,
        noutput_items: usize,
        iq_out: &mut [&mut [Complex32]],
        flex_out: &mut [&mut [f32]],
        add_tag: &mut dyn FnMut(usize, u64, &'static str, TagValue),
    ) -> WorkCounts {
        let mut counts = WorkCounts::default();
        if self.client.is_none() || self.setup_problem {
            counts.iq = vec![0; iq_out.len()];
            counts.flex = vec![0; flex_out.len()];
            return counts;
        }

        if let Some(manager) = &self.iq {
            let n = iq_out.len();
            let mut rates = vec![noutput_items; n];
            manager.fill_buffers(iq_out, &self.tuners[..n.min(self.tuners.len())], &mut rates);
            counts.iq = rates;
        }

        if let Some((_, manager)) = &mut self.flex {
            let n = flex_out.len();
            let mut amounts = vec![0usize; n];
            let mut changes: Vec<Vec<StreamChange>> = vec![Vec::new(); n];
            manager.copy_data(flex_out, noutput_items, &mut amounts, &mut changes);
            let base_index = self.config.num_outputs;
            for (i, stream_changes) in changes.iter().enumerate() {
                for change in stream_changes {
                    let offset = self.flex_items_written[i] + change.starting_sample as u64;
                    add_tag(base_index + i, offset, FLEX_RATE_TAG, TagValue::Double(change.sample_rate));
                    add_tag(base_index + i, offset, FLEX_SIZE_TAG, TagValue::Int(i64::from(change.fft_size)));
                    add_tag(base_index + i, offset, FLEX_REF_TAG, TagValue::Double(change.reference_level));
                    add_tag(base_index + i, offset, FLEX_AVE_TAG, TagValue::Double(change.num_averages));
                    add_tag(base_index + i, offset, FLEX_FREQ_TAG, TagValue::Double(change.frequency));
                }
            }
            for (i, amount) in amounts.iter().enumerate() {
                self.flex_items_written[i] += *amount as u64;
            }
            counts.flex = amounts;
        }
        if self.flex.is_some() {
            self.maybe_check_load();
        }

        counts
    }

    // Configuration setters.  Each validates, stores, and emits the
    // mnemonics; out-of-range updates are logged and ignored.

    pub fn update_tuner_freq(&mut self, freq_hz: f64, group: usize, ddc: i32) {
        // The gate brackets the whole retune, valid or not, unless the
        // tuners run independently.
        if !self.config.independent_operation {
            self.mne(&commands::stream_gate(true));
        }
        self.set_tuner_freq(freq_hz, group, ddc);
        if !self.config.independent_operation {
            self.mne(&commands::stream_gate(false));
        }
    }

    fn set_tuner_freq(&mut self, freq_hz: f64, group: usize, ddc: i32) {
        if group < 1 || group > self.config.groups.len() {
            return;
        }
        self.config.groups[group - 1].tuner_freq = freq_hz;
        let tuner = self.config.groups[group - 1].tuner;
        if tuner < 0 || freq_hz == 0.0 {
            return;
        }
        let freq_mhz = freq_hz / MHZ_SCALE;
        if !(MIN_FREQ_MHZ..=MAX_FREQ_MHZ).contains(&freq_mhz) {
            log::warn!(
                "select a frequency between {}MHz and {}MHz",
                MIN_FREQ_MHZ,
                MAX_FREQ_MHZ
            );
            return;
        }
        self.mne(&commands::tuner_frequency(tuner, ddc, freq_mhz));
    }

    pub fn update_ddc_offset(&mut self, offset_hz: f64, group: usize, ddc: i32) {
        if group < 1 || group > self.config.groups.len() {
            return;
        }
        if !(1..=DDC_PER_TUNER).contains(&ddc) {
            return;
        }
        self.config.groups[group - 1].ddc_offset[(ddc - 1) as usize] = offset_hz;
        let tuner = self.config.groups[group - 1].tuner;
        if tuner < 0 {
            return;
        }
        if offset_hz.abs() > MAX_DDC_OFFSET_HZ {
            log::warn!(
                "select a DDC offset between {}MHz and {}MHz",
                -MAX_DDC_OFFSET_HZ / MHZ_SCALE,
                MAX_DDC_OFFSET_HZ / MHZ_SCALE
            );
            return;
        }
        self.mne(&commands::ddc_offset(tuner, ddc, offset_hz / MHZ_SCALE));
    }

    pub fn update_samp_rate(&mut self, rate_hz: f64, group: usize, ddc: i32) {
        // The gate brackets the rate change unconditionally, valid or not.
        self.mne(&commands::stream_gate(true));
        self.set_samp_rate(rate_hz, group, ddc);
        self.mne(&commands::stream_gate(false));

        // A rate change on a tuner feeding a flex source can push the
        // FPGA load over the edge; verify soon.
        if group < 1 || group > self.config.groups.len() {
            return;
        }
        let tuner = self.config.groups[group - 1].tuner;
        let feeds_flex = self.config.flex_streams.iter().any(|f| {
            f.enabled && f.source_tuner() == tuner && f.source_ddc() == ddc
        });
        if feeds_flex && self.flex.is_some() {
            self.schedule_load_check();
        }
    }

    fn set_samp_rate(&mut self, rate_hz: f64, group: usize, ddc: i32) {
        if group < 1 || group > self.config.groups.len() {
            return;
        }
        if !(1..=DDC_PER_TUNER).contains(&ddc) {
            return;
        }
        self.config.groups[group - 1].samp_rate = rate_hz;
        let tuner = self.config.groups[group - 1].tuner;
        if tuner < 0 {
            return;
        }
        let rate_mhz = rate_hz / MHZ_SCALE;
        if !(MIN_SAMP_RATE_MHZ..=MAX_SAMP_RATE_MHZ).contains(&rate_mhz) {
            log::warn!(
                "select a sample rate between {}MHz and {}MHz",
                MIN_SAMP_RATE_MHZ,
                MAX_SAMP_RATE_MHZ
            );
            return;
        }
        self.mne(&commands::sample_rate(tuner, ddc, rate_mhz));
    }

    pub fn update_atten(&mut self, atten: f64, group: usize) {
        if group < 1 || group > self.config.groups.len() {
            return;
        }
        self.config.groups[group - 1].atten = atten;
        let tuner = self.config.groups[group - 1].tuner;
        if tuner < 0 {
            return;
        }
        if !(MIN_ATTEN..=MAX_ATTEN).contains(&atten) {
            log::warn!(
                "select an attenuation between {}dB and {}dB",
                MIN_ATTEN,
                MAX_ATTEN
            );
            return;
        }
        self.mne(&commands::attenuation(tuner, atten));
    }

    pub fn update_preamp(&mut self, on: bool, group: usize) {
        if group < 1 || group > self.config.groups.len() {
            return;
        }
        self.config.groups[group - 1].preamp = on;
        let tuner = self.config.groups[group - 1].tuner;
        if tuner > 0 {
            self.mne(&commands::preamp(tuner, on));
        }
    }

    /// Reassign a group's tuner and DDC count at runtime.  No two groups
    /// may drive the same tuner; a duplicate claim deactivates the prior
    /// owner and applies nothing.
    pub fn update_groups(&mut self, group: usize, tuner: i32, num_ddcs: i32) {
        if group < 1 || group > self.config.groups.len() {
            return;
        }
        if !(1..=NUM_TUNERS).contains(&tuner) {
            return;
        }
        let conflict = self
            .config
            .groups
            .iter()
            .position(|g| g.tuner == tuner)
            .filter(|&i| i + 1 != group);
        if let Some(i) = conflict {
            log::warn!(
                "no two groups may share a tuner; group {} is already set to tuner {}",
                i + 1,
                tuner
            );
            self.config.groups[i].tuner = -1;
            self.config.groups[i].num_ddcs = 0;
            self.tuners = self.build_tuner_list();
            return;
        }
        {
            let data = &mut self.config.groups[group - 1];
            data.tuner = tuner;
            data.num_ddcs = num_ddcs.clamp(0, DDC_PER_TUNER);
        }

        // Push each group's RF settings back out to its tuner.
        for g in 1..=self.config.groups.len() {
            let data = self.config.groups[g - 1].clone();
            if data.tuner < 1 {
                continue;
            }
            self.update_atten(data.atten, g);
            self.update_tuner_freq(data.tuner_freq, g, 1);
            self.update_tuner_freq(data.tuner_freq, g, 2);
            self.update_ddc_offset(data.ddc_offset[0], g, 1);
            self.update_ddc_offset(data.ddc_offset[1], g, 2);
            self.update_preamp(data.preamp, g);
        }

        self.start_active_groups();
    }

    /// Quiet every stream, re-enable the pairs the active groups own
    /// (minus flex `disable_complex` claims), and push the new
    /// subscription set to the demultiplexer.
    fn start_active_groups(&mut self) {
        self.mne(&commands::stream_gate(true));
        self.mne(&commands::shutdown_streams());
        for g in &self.config.groups {
            if g.tuner < 1 || g.num_ddcs < 1 {
                continue;
            }
            for ddc in 1..=g.num_ddcs.min(DDC_PER_TUNER) {
                if self.is_complex_enabled(g.tuner, ddc) {
                    self.mne(&commands::data_stream(g.tuner, ddc, true));
                }
            }
        }
        self.tuners = self.build_tuner_list();
        if let Some(manager) = &self.iq {
            manager.update_tuners(&self.tuners);
        }
        self.mne(&commands::stream_gate(false));
    }

    pub fn update_flex_stream(&mut self, stream_id: i32, source_id: i32, disable_complex: bool) {
        let Some(index) = self.flex_index(stream_id, "update_flex_stream") else {
            return;
        };
        if !(0..=HIGHEST_FLEX_SOURCE).contains(&source_id) {
            log::warn!(
                "invalid source_id {} to update_flex_stream; expected 0..{}",
                source_id,
                HIGHEST_FLEX_SOURCE
            );
            return;
        }
        {
            let flex = &mut self.config.flex_streams[index];
            flex.source_id = source_id;
            flex.disable_complex = if flex.is_adc_stream() {
                false
            } else {
                disable_complex
            };
        }
        let flex = self.config.flex_streams[index].clone();
        self.mne(&commands::flex_stream(stream_id, false));
        self.mne(&commands::flex_dest(
            stream_id,
            &self.config.fiber_ip,
            self.config.flex_port,
            commands::STREAM_MAC,
        ));
        self.mne(&commands::flex_config(stream_id, flex.source_id, flex.fft_size));
        if self.started {
            self.mne(&commands::flex_stream(stream_id, flex.enabled));
        }
        self.mne(&commands::data_stream(
            flex.source_tuner(),
            flex.source_ddc(),
            !flex.disable_complex,
        ));
        self.schedule_load_check();
    }

    pub fn update_flex_rate(&mut self, stream_id: i32, rate_hz: f64) {
        let Some(index) = self.flex_index(stream_id, "update_flex_rate") else {
            return;
        };
        if !(MIN_FLEX_SR..=MAX_FLEX_SR).contains(&rate_hz) {
            log::warn!(
                "invalid update rate {} to update_flex_rate; expected {}..{}",
                rate_hz,
                MIN_FLEX_SR,
                MAX_FLEX_SR
            );
            return;
        }
        self.config.flex_streams[index].sample_rate = rate_hz;
        let enabled = self.config.flex_streams[index].enabled;
        self.mne(&commands::flex_stream(stream_id, false));
        self.mne(&commands::flex_rate(stream_id, rate_hz));
        if self.started {
            self.mne(&commands::flex_stream(stream_id, enabled));
        }
        self.schedule_load_check();
    }

    pub fn update_flex_ave(&mut self, stream_id: i32, averages: i32) {
        let Some(index) = self.flex_index(stream_id, "update_flex_ave") else {
            return;
        };
        if !(MIN_FLEX_AVE..=MAX_FLEX_AVE).contains(&averages) {
            log::warn!(
                "invalid averaging constant {} to update_flex_ave; expected {}..{}",
                averages,
                MIN_FLEX_AVE,
                MAX_FLEX_AVE
            );
            return;
        }
        if !is_power_of_two(averages) {
            log::warn!(
                "invalid averaging constant {} to update_flex_ave; expected a power of two",
                averages
            );
        }
        self.config.flex_streams[index].averaging = averages;
        self.mne(&commands::flex_averaging(stream_id, averages));
        self.schedule_load_check();
    }

    pub fn update_flex_size(&mut self, stream_id: i32, fft_size: i32) {
        let Some(index) = self.flex_index(stream_id, "update_flex_size") else {
            return;
        };
        let (min, max) = if self.config.flex_streams[index].is_adc_stream() {
            (MIN_FLEX_SIZE_ADC, MAX_FLEX_SIZE_ADC)
        } else {
            (MIN_FLEX_SIZE_DDC, MAX_FLEX_SIZE_DDC)
        };
        if !(min..=max).contains(&fft_size) {
            log::warn!(
                "invalid size {} to update_flex_size; expected {}..{}",
                fft_size,
                min,
                max
            );
            return;
        }
        if !is_power_of_two(fft_size) {
            log::warn!(
                "invalid size {} to update_flex_size; expected a power of two",
                fft_size
            );
        }
        self.config.flex_streams[index].fft_size = fft_size;
        let flex = self.config.flex_streams[index].clone();
        self.mne(&commands::flex_stream(stream_id, false));
        self.mne(&commands::flex_config(stream_id, flex.source_id, flex.fft_size));
        if self.started {
            self.mne(&commands::flex_stream(stream_id, flex.enabled));
        }
        self.schedule_load_check();
    }

    fn flex_index(&self, stream_id: i32, caller: &str) -> Option<usize> {
        if stream_id <= 0 || stream_id > MAX_FLEX_STREAMS as i32 {
            log::warn!(
                "invalid stream_id {} to {}; expected 1..{}",
                stream_id,
                caller,
                MAX_FLEX_STREAMS
            );
            return None;
        }
        self.config
            .flex_streams
            .iter()
            .position(|f| f.stream_id == stream_id)
    }

    pub fn schedule_load_check(&mut self) {
        self.load_check_pending = true;
        self.load_check_requested = Some(Instant::now());
    }

    /// Fire a pending load check on a one-shot thread, at most once per
    /// interval and never concurrently.
    fn maybe_check_load(&mut self) {
        if !self.load_check_pending {
            return;
        }
        let Some(requested) = self.load_check_requested else {
            return;
        };
        if requested.elapsed() < LOAD_CHECK_INTERVAL {
            return;
        }
        if self.load_check_running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.load_check_pending = false;
        self.load_check_requested = Some(Instant::now());

        let Some(client) = self.client.clone() else {
            self.load_check_running.store(false, Ordering::Release);
            return;
        };
        let monitor = self.load_monitor.clone();
        let running = self.load_check_running.clone();
        std::thread::spawn(move || {
            match client.send_and_read(commands::FLEX_LOAD_QUERY, 1) {
                Ok(reply) => {
                    if !reply.is_empty() && parse_flex_load(&reply).is_none() {
                        log::debug!("unparseable FXL reply: {:?}", reply);
                    }
                    monitor.lock().unwrap().observe(&reply);
                }
                Err(e) => log::warn!("flex load query failed: {}", e),
            }
            running.store(false, Ordering::Release);
        });
    }

    pub fn flex_stream_config(&self, stream_id: i32) -> Option<&FlexStreamConfig> {
        self.config.flex_streams.iter().find(|f| f.stream_id == stream_id)
    }

    pub fn iq_manager(&self) -> Option<&ComplexManager> {
        self.iq.as_ref()
    }
}

impl Drop for PolarisSource {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
    }
}
