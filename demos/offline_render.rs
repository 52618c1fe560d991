//! Render one second of a 440 Hz tone through a two-device route and save it
//! as `offline_render.wav`.
//!
//! Run with `RUST_LOG=recall_graph=debug` to watch the splices and walks.

use recall_graph::{
    Behavior, BehaviorDef, BehaviorError, DeviceFlags, Engine, EngineConfig, Phase, Purpose,
    PurposeSet, RecallScope, Stage, StageContext, StageOutcome,
};
use std::error::Error;
use std::f32::consts::TAU;
use std::sync::Arc;

const SAMPLE_RATE: u32 = 44100;
const BLOCK: usize = 512;

struct Sine {
    freq: f32,
}

impl BehaviorDef for Sine {
    type State = f32;

    fn init_state(&self, _samplerate: u32, _buffer_size: usize) -> f32 {
        0.0
    }

    fn run_stage(&self, phase: &mut f32, cx: &StageContext<'_>) -> Result<StageOutcome, BehaviorError> {
        if cx.stage != Stage::Play || cx.phase != Phase::Pre {
            return Ok(StageOutcome::Continue);
        }
        let step = TAU * self.freq / cx.samplerate as f32;
        cx.with_buffer(0, |buf| {
            for sample in buf.iter_mut() {
                *sample = phase.sin();
                *phase = (*phase + step) % TAU;
            }
        });
        Ok(StageOutcome::Continue)
    }
}

struct Gain(f32);

impl BehaviorDef for Gain {
    type State = ();

    fn init_state(&self, _samplerate: u32, _buffer_size: usize) {}

    fn run_stage(&self, _state: &mut (), cx: &StageContext<'_>) -> Result<StageOutcome, BehaviorError> {
        if cx.stage == Stage::Play && cx.phase == Phase::Post {
            for index in 0..cx.segment_count() {
                cx.with_buffer(index, |buf| buf.iter_mut().for_each(|s| *s *= self.0));
            }
        }
        Ok(StageOutcome::Continue)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::default()
        .with_samplerate(SAMPLE_RATE)
        .with_buffer_size(BLOCK);
    let (mut engine, mut rt) = Engine::new(config);
    engine.register_behavior_factory("sine", || Arc::new(Sine { freq: 440.0 }) as Arc<dyn Behavior>);
    engine.register_behavior_factory("gain", || Arc::new(Gain(0.5)) as Arc<dyn Behavior>);

    let osc = engine.add_device(DeviceFlags::default().with_output_owns_recycling(true), 1, 1, 0)?;
    let amp = engine.add_device(DeviceFlags::default(), 1, 1, 1)?;
    let osc_out = engine.graph().device(osc)?.outputs[0];
    let amp_in = engine.graph().device(amp)?.inputs[0];
    let amp_out = engine.graph().device(amp)?.outputs[0];
    engine.set_link(amp_in, Some(osc_out))?;
    engine.add_template(osc_out, "sine", RecallScope::Play, PurposeSet::ALL)?;
    engine.add_template(amp_out, "gain", RecallScope::Play, PurposeSet::ALL)?;

    let group = engine.start(amp_out, Purpose::Playback)?;
    let mut samples = Vec::with_capacity(SAMPLE_RATE as usize);
    while samples.len() < SAMPLE_RATE as usize {
        rt.play(group)?;
        if let Some(block) = engine.read_signal(amp_out, group)? {
            samples.extend_from_slice(&block);
        }
    }
    samples.truncate(SAMPLE_RATE as usize);

    engine.cancel(group)?;
    rt.play_all();
    let garbage = engine.collect_garbage();
    println!("destroyed {:?}, {} events", garbage.destroyed, garbage.events.len());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create("offline_render.wav", spec)?;
    for &sample in &samples {
        writer.write_sample((sample * 32767.0) as i16)?;
    }
    writer.finalize()?;

    println!("Generated offline_render.wav: a 440 Hz tone at half scale");
    Ok(())
}
