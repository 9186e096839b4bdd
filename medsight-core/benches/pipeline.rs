use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use medsight_core::{
    ActivationMaps, CpuPreprocessor, ExplainabilityEngine, MaskCompositor, ModelKind,
    OverlayStyle, Preprocessor,
};
use ndarray::{Array2, Array3};

const SIZES: [(u32, u32); 2] = [(512, 512), (1024, 1024)];

fn synthetic_scan(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let v = ((x ^ y) % 256) as u8;
        Rgb([v, v / 2, 255 - v])
    })
}

fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("encoding synthetic scan should succeed");
    cursor.into_inner()
}

fn benchmark_preprocess(c: &mut Criterion) {
    let preprocessor = CpuPreprocessor::default();
    let mut group = c.benchmark_group("preprocess_upload");
    for (width, height) in SIZES {
        let bytes = png_bytes(&synthetic_scan(width, height));
        for kind in [ModelKind::Segmentation, ModelKind::Classification] {
            group.bench_with_input(
                BenchmarkId::new(format!("{kind:?}"), format!("{width}x{height}")),
                &bytes,
                |b, bytes| {
                    b.iter(|| {
                        preprocessor
                            .normalize(black_box(bytes), kind)
                            .expect("preprocessing should succeed");
                    });
                },
            );
        }
    }
    group.finish();
}

fn benchmark_composite(c: &mut Criterion) {
    let compositor = MaskCompositor::new(OverlayStyle::default());
    let mut group = c.benchmark_group("composite_masks");
    for (width, height) in SIZES {
        let image = synthetic_scan(width, height);
        // Low-resolution masks exercise the nearest-neighbour resample path.
        let masks: Vec<Array2<bool>> = (0..3)
            .map(|i| Array2::from_shape_fn((256, 256), |(y, x)| (x + y * i) % 7 == 0))
            .collect();
        let scores = vec![0.9, 0.7, 0.5];
        group.bench_function(BenchmarkId::from_parameter(format!("{width}x{height}")), |b| {
            b.iter(|| {
                compositor
                    .composite(black_box(&image), &masks, &scores)
                    .expect("compositing should succeed");
            });
        });
    }
    group.finish();
}

fn benchmark_heatmap(c: &mut Criterion) {
    let explainer = ExplainabilityEngine::default();
    let preprocessor = CpuPreprocessor::default();
    let input = preprocessor
        .normalize_image(
            &DynamicImage::ImageRgb8(synthetic_scan(640, 640)),
            ModelKind::Classification,
        )
        .expect("preprocessing should succeed");
    let maps = ActivationMaps {
        activations: Array3::from_shape_fn((64, 14, 14), |(c, y, x)| ((c + x * y) % 5) as f32),
        gradients: Array3::from_shape_fn((64, 14, 14), |(c, _, _)| c as f32 / 64.0 - 0.3),
    };
    c.bench_function("grad_cam_render", |b| {
        b.iter(|| {
            explainer
                .render_heatmap(black_box(&maps), &input)
                .expect("heatmap rendering should succeed");
        });
    });
}

criterion_group!(
    benches,
    benchmark_preprocess,
    benchmark_composite,
    benchmark_heatmap
);
criterion_main!(benches);
