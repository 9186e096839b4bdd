use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use image::{DynamicImage, Rgb, RgbImage};
use medsight_utils::{encode_png_base64, rgb_to_chw, standardize_in_place};
use std::hint::black_box;

fn gradient(size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
}

fn bench_chw_standardize(c: &mut Criterion) {
    let mut group = c.benchmark_group("rgb_to_chw_standardize");
    for size in [224u32, 512, 1024] {
        let img = gradient(size);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}x{size}")),
            &img,
            |b, img| {
                b.iter(|| {
                    let mut chw = rgb_to_chw(black_box(img));
                    standardize_in_place(&mut chw)
                });
            },
        );
    }
    group.finish();
}

fn bench_png_base64(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_png_base64");
    for size in [224u32, 512] {
        let img = DynamicImage::ImageRgb8(gradient(size));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}x{size}")),
            &img,
            |b, img| b.iter(|| encode_png_base64(black_box(img))),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_chw_standardize, bench_png_base64);
criterion_main!(benches);
