#![allow(dead_code)]

use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use medsight_core::{
    ActivationMaps, ClassificationEngine, ClassificationOutput, Engine, ModelDescriptor,
    ModelKind, ModelLoader, NormalizedTensor, Prompts, SegmentationEngine, SegmentationOutput,
};
use medsight_utils::config::{ModelSettings, ServiceSettings};
use ndarray::{Array2, Array3};

pub const SEG_ID: &str = "seg";
pub const VIT_ID: &str = "vit";

/// Segmenter returning two fixed 2x2 masks and recording the prompts it receives.
#[derive(Default)]
pub struct FakeSegmenter {
    pub seen: Arc<Mutex<Vec<Prompts>>>,
}

impl SegmentationEngine for FakeSegmenter {
    fn segment(
        &mut self,
        _input: &NormalizedTensor,
        prompts: &Prompts,
    ) -> anyhow::Result<SegmentationOutput> {
        self.seen.lock().unwrap().push(prompts.clone());
        let a = Array2::from_shape_vec((2, 2), vec![true, false, false, true]).unwrap();
        let b = Array2::from_shape_vec((2, 2), vec![false, true, false, false]).unwrap();
        Ok(SegmentationOutput {
            masks: vec![a, b],
            scores: vec![0.9, 0.6],
            logits: Vec::new(),
        })
    }
}

/// Classifier with a fixed positive probability and a deterministic activation map.
pub struct FakeClassifier {
    pub p_positive: f32,
}

impl ClassificationEngine for FakeClassifier {
    fn classify(&mut self, _input: &NormalizedTensor) -> anyhow::Result<ClassificationOutput> {
        Ok(ClassificationOutput {
            probabilities: [1.0 - self.p_positive, self.p_positive],
        })
    }

    fn class_activation(
        &mut self,
        _input: &NormalizedTensor,
        _target_class: usize,
    ) -> anyhow::Result<ActivationMaps> {
        let mut activations = Array3::zeros((2, 14, 14));
        activations[(0, 3, 4)] = 5.0;
        activations[(1, 10, 9)] = 2.0;
        Ok(ActivationMaps {
            activations,
            gradients: Array3::from_elem((2, 14, 14), 0.25),
        })
    }
}

pub struct PanickingSegmenter;

impl SegmentationEngine for PanickingSegmenter {
    fn segment(&mut self, _: &NormalizedTensor, _: &Prompts) -> anyhow::Result<SegmentationOutput> {
        panic!("engine exploded")
    }
}

/// One-shot latch shared between a test and a blocked engine.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

/// Segmenter that signals when it starts and blocks until the gate opens.
pub struct GatedSegmenter {
    pub gate: Gate,
    pub started: mpsc::Sender<()>,
}

impl SegmentationEngine for GatedSegmenter {
    fn segment(&mut self, _: &NormalizedTensor, _: &Prompts) -> anyhow::Result<SegmentationOutput> {
        let _ = self.started.send(());
        self.gate.wait();
        Ok(SegmentationOutput::default())
    }
}

type BuildFn = dyn Fn(&ModelDescriptor) -> anyhow::Result<Engine> + Send + Sync;

/// Loader backed by a closure that counts its calls and can be slowed down.
pub struct FnLoader {
    pub calls: AtomicUsize,
    pub delay: Duration,
    build: Box<BuildFn>,
}

impl FnLoader {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(&ModelDescriptor) -> anyhow::Result<Engine> + Send + Sync + 'static,
    {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            build: Box::new(build),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelLoader for FnLoader {
    fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<Engine> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        (self.build)(descriptor)
    }
}

/// [`FakeSegmenter`] for segmentation models, [`FakeClassifier`] for classification models.
pub fn fake_engine(descriptor: &ModelDescriptor, p_positive: f32) -> anyhow::Result<Engine> {
    Ok(match descriptor.kind {
        ModelKind::Segmentation => Engine::Segmentation(Box::new(FakeSegmenter::default())),
        ModelKind::Classification => {
            Engine::Classification(Box::new(FakeClassifier { p_positive }))
        }
    })
}

pub fn fake_loader(p_positive: f32) -> FnLoader {
    FnLoader::new(move |descriptor| fake_engine(descriptor, p_positive))
}

/// Loader whose loads always fail with a missing-weights error.
pub fn failing_loader() -> FnLoader {
    FnLoader::new(|descriptor| {
        anyhow::bail!(
            "weights file {} not found",
            descriptor.weights_location.display()
        )
    })
}

/// Settings with one segmentation and one classification model.
pub fn test_settings() -> ServiceSettings {
    let mut settings = ServiceSettings::default();
    settings.checkpoints_dir = "checkpoints".into();
    settings.models = vec![
        ModelSettings::new(SEG_ID, ModelKind::Segmentation, "seg.onnx"),
        ModelSettings::new(VIT_ID, ModelKind::Classification, "vit.onnx"),
    ];
    settings.default_model = Some(SEG_ID.to_string());
    settings.classification_model = Some(VIT_ID.to_string());
    settings.workers.request_timeout_secs = 10;
    settings
}

pub fn test_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 13 % 256) as u8, (y * 29 % 256) as u8, ((x + y) % 256) as u8])
    })
}

pub fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut bytes, format)
        .unwrap();
    bytes.into_inner()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    encode(&test_image(width, height), ImageFormat::Png)
}
