use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dominant_speaker::{binomial_coefficient, speech_activity_score, Conference};

fn bench_binomial(c: &mut Criterion) {
    c.bench_function("binomial_coefficient_50_25", |b| {
        b.iter(|| black_box(binomial_coefficient(black_box(50), black_box(25))));
    });
}

fn bench_speech_activity_score(c: &mut Criterion) {
    c.bench_function("speech_activity_score_immediate", |b| {
        b.iter(|| black_box(speech_activity_score(black_box(6), 13, 0.5, 0.78)));
    });
}

fn bench_level_ingress(c: &mut Criterion) {
    let conference = Conference::new();
    let mut ssrc = 0u32;
    c.bench_function("conference_level_changed_8_speakers", |b| {
        b.iter(|| {
            ssrc = (ssrc + 1) % 8;
            conference.level_changed(black_box(ssrc), black_box(96));
        });
    });
}

criterion_group!(
    benches,
    bench_binomial,
    bench_speech_activity_score,
    bench_level_ingress,
);
criterion_main!(benches);
