mod common;

use std::sync::Arc;

use common::{frames, init_tracing, synthetic_speech, ModelDir};
use voxdec_core::acoustic::AcousticModel;
use voxdec_core::{Config, Decoder, LogMath};

/// (frame, best senone, best score) for every scored frame.
type Trace = Vec<(usize, usize, i32)>;

fn acoustic_model(config: &Config) -> AcousticModel {
    let mut config = config.clone();
    config.resolve_model_dir().expect("resolve model dir");
    let lmath = Arc::new(LogMath::new(1.0001).expect("logmath"));
    AcousticModel::new(&config, lmath).expect("acoustic model")
}

fn drain(acmod: &mut AcousticModel, trace: &mut Trace) {
    while let Some(s) = acmod.score() {
        trace.push((s.frame, s.best_senone, s.best_score));
    }
}

fn whole_trace(acmod: &mut AcousticModel, samples: &[i16]) -> Trace {
    let mut trace = Vec::new();
    acmod.start_utt().expect("start");
    let mut input = samples;
    acmod.process_raw(&mut input, true).expect("process whole");
    assert!(input.is_empty(), "whole-utterance call must consume everything");
    acmod.end_utt().expect("end");
    drain(acmod, &mut trace);
    trace
}

fn chunked_trace(acmod: &mut AcousticModel, samples: &[i16], chunk: usize) -> Trace {
    let mut trace = Vec::new();
    acmod.start_utt().expect("start");
    for piece in samples.chunks(chunk) {
        let mut input = piece;
        while !input.is_empty() {
            acmod.process_raw(&mut input, false).expect("process chunk");
            drain(acmod, &mut trace);
        }
    }
    acmod.end_utt().expect("end");
    drain(acmod, &mut trace);
    trace
}

#[test]
fn chunked_audio_scores_like_whole_buffer() {
    init_tracing();
    let model = ModelDir::audio_model();
    let mut acmod = acoustic_model(&model.base_config());
    let samples = synthetic_speech(24_000);

    let whole = whole_trace(&mut acmod, &samples);
    assert!(whole.len() >= 128, "only {} frames", whole.len());
    assert!(whole.iter().enumerate().all(|(i, &(f, _, _))| f == i));

    for chunk in [256, 2048, 401] {
        let chunked = chunked_trace(&mut acmod, &samples, chunk);
        assert_eq!(chunked.len(), whole.len(), "chunk={chunk}");
        assert_eq!(&chunked[..128], &whole[..128], "chunk={chunk}");
        assert_eq!(chunked, whole, "chunk={chunk}");
    }
}

#[test]
fn bounded_feature_buffer_preserves_frame_sequence() {
    init_tracing();
    let model = ModelDir::audio_model();
    let config = model
        .base_config()
        .with("fwdflat", false)
        .and_then(|c| c.with("featbuf", 4))
        .expect("bounded config");
    let mut acmod = acoustic_model(&config);
    assert!(!acmod.is_growable());
    let samples = synthetic_speech(16_000);

    let whole = whole_trace(&mut acmod, &samples);
    let chunked = chunked_trace(&mut acmod, &samples, 2048);
    assert_eq!(chunked, whole);
}

#[test]
fn bounded_buffer_stops_consuming_when_full() {
    let model = ModelDir::phone_model();
    let config = model
        .base_config()
        .with("fwdflat", false)
        .and_then(|c| c.with("featbuf", 4))
        .expect("bounded config");
    let mut acmod = acoustic_model(&config);
    let feats = frames(&[("SIL", 10)]);

    acmod.start_utt().expect("start");
    let mut input = feats.as_slice();
    let queued = acmod.process_features(&mut input, false).expect("process");
    assert_eq!(queued, 4);
    assert_eq!(input.len(), 6);
    assert_eq!(acmod.pending_frames(), 4);

    acmod.set_grow(true);
    acmod.process_features(&mut input, false).expect("process rest");
    assert!(input.is_empty());
    assert_eq!(acmod.pending_frames(), 10);
}

#[test]
fn decoder_hypothesis_is_independent_of_chunking() {
    init_tracing();
    let model = ModelDir::phone_model();
    let feats = frames(&[("SIL", 8), ("M", 6), ("AA", 6), ("M", 6), ("UW", 6), ("SIL", 8)]);

    let mut decoder = Decoder::new(model.grammar_config()).expect("decoder");
    decoder.start_utt(Some("whole")).expect("start");
    let searched = decoder.process_features(&feats, false, true).expect("process");
    assert_eq!(searched, feats.len());
    decoder.end_utt().expect("end");
    let whole = decoder.hypothesis().expect("hypothesis").expect("a hypothesis");
    let whole_segs: Vec<_> = decoder.seg_iter().expect("segments").collect();
    assert_eq!(whole.text, "ma moo");

    for chunk in [1, 5, 13] {
        decoder.start_utt(None).expect("start");
        for piece in feats.chunks(chunk) {
            decoder.process_features(piece, false, false).expect("process chunk");
        }
        decoder.end_utt().expect("end");
        let hyp = decoder.hypothesis().expect("hypothesis").expect("a hypothesis");
        assert_eq!(hyp.text, whole.text, "chunk={chunk}");
        assert_eq!(hyp.score, whole.score, "chunk={chunk}");
        let segs: Vec<_> = decoder.seg_iter().expect("segments").collect();
        assert_eq!(segs, whole_segs, "chunk={chunk}");
    }
}

#[test]
fn decoder_audio_in_256_sample_chunks_matches_single_call() {
    init_tracing();
    let model = ModelDir::audio_model();
    let samples = synthetic_speech(24_000);
    let mut decoder = Decoder::new(model.grammar_config()).expect("decoder");

    decoder.start_utt(None).expect("start");
    decoder.process_audio(&samples, false, true).expect("process whole");
    decoder.end_utt().expect("end");
    let whole = decoder.hypothesis().expect("hypothesis");
    let whole_frames = decoder.utt_time().frames;

    decoder.start_utt(None).expect("start");
    for piece in samples.chunks(256) {
        decoder.process_audio(piece, false, false).expect("process chunk");
    }
    decoder.end_utt().expect("end");
    assert_eq!(decoder.utt_time().frames, whole_frames);
    assert_eq!(decoder.hypothesis().expect("hypothesis"), whole.map(|h| voxdec_core::Hypothesis {
        uttid: "000000001".into(),
        ..h
    }));
}

#[test]
fn decode_raw_streams_a_reader() {
    let model = ModelDir::audio_model();
    let samples = synthetic_speech(8_000);
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let mut decoder = Decoder::new(model.grammar_config()).expect("decoder");

    let n = decoder
        .decode_raw(std::io::Cursor::new(bytes.clone()), Some("streamed"), None)
        .expect("decode streamed");
    assert_eq!(n, samples.len());
    let streamed = decoder.utt_time().frames;
    let streamed_hyp = decoder.hypothesis().expect("hypothesis").map(|h| h.text);

    let n = decoder
        .decode_raw(std::io::Cursor::new(bytes), Some("bounded"), Some(4_000))
        .expect("decode bounded");
    assert_eq!(n, 4_000);
    assert!(decoder.utt_time().frames < streamed);
    assert_eq!(decoder.uttid(), "bounded");

    let n = decoder
        .decode_raw(
            std::io::Cursor::new(samples.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>()),
            Some("again"),
            Some(samples.len()),
        )
        .expect("decode whole");
    assert_eq!(n, samples.len());
    assert_eq!(decoder.utt_time().frames, streamed);
    assert_eq!(decoder.hypothesis().expect("hypothesis").map(|h| h.text), streamed_hyp);
}

#[test]
fn decode_wav_matches_raw_decoding() {
    let model = ModelDir::audio_model();
    let samples = synthetic_speech(8_000);
    let path = model.path("utt.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    for &s in &samples {
        writer.write_sample(s).expect("write sample");
    }
    writer.finalize().expect("finalize wav");

    let mut decoder = Decoder::new(model.grammar_config()).expect("decoder");
    assert_eq!(decoder.decode_wav(&path, Some("wav")).expect("decode wav"), samples.len());
    let wav_frames = decoder.utt_time().frames;
    let wav_hyp = decoder.hypothesis().expect("hypothesis").map(|h| h.text);

    decoder.start_utt(Some("raw")).expect("start");
    decoder.process_audio(&samples, false, true).expect("process");
    decoder.end_utt().expect("end");
    assert_eq!(decoder.utt_time().frames, wav_frames);
    assert_eq!(decoder.hypothesis().expect("hypothesis").map(|h| h.text), wav_hyp);
}
