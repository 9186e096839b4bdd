mod common;

use std::{
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use common::{FnLoader, Gate, GatedSegmenter, SEG_ID, png, test_settings};
use medsight_core::{
    AnalysisError, AnalysisRequest, Engine, InferenceDispatcher, ModelRegistry, NormalizedTensor,
    Prompts, SegmentationEngine, SegmentationOutput, WorkerPool,
};

/// Segmenter that counts calls which start while another call is still running.
struct OverlapCounter {
    busy: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl SegmentationEngine for OverlapCounter {
    fn segment(&mut self, _: &NormalizedTensor, _: &Prompts) -> anyhow::Result<SegmentationOutput> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(20));
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
        Ok(SegmentationOutput::default())
    }
}
use medsight_utils::config::WorkerSettings;

fn gated_pool(queue_depth: usize) -> (WorkerPool, Gate, mpsc::Receiver<()>) {
    let gate = Gate::default();
    let (started, started_rx) = mpsc::channel();
    let loader = FnLoader::new({
        let gate = gate.clone();
        move |_| {
            Ok(Engine::Segmentation(Box::new(GatedSegmenter {
                gate: gate.clone(),
                started: started.clone(),
            })))
        }
    });
    let settings = test_settings();
    let registry = Arc::new(ModelRegistry::from_settings(&settings, Arc::new(loader)));
    let dispatcher = Arc::new(InferenceDispatcher::new(registry, &settings));
    let workers = WorkerSettings {
        workers: 1,
        queue_depth,
        request_timeout_secs: 10,
    };
    let pool = WorkerPool::new(dispatcher, &workers).unwrap();
    (pool, gate, started_rx)
}

fn request() -> AnalysisRequest {
    AnalysisRequest::new(png(8, 8), "scan.png", SEG_ID)
}

#[test]
fn full_queue_fails_fast() {
    let (pool, gate, started) = gated_pool(1);

    let running = pool.submit(request()).unwrap();
    started.recv_timeout(Duration::from_secs(5)).unwrap();
    let queued = pool.submit(request()).unwrap();
    assert_eq!(pool.queued(), 1);

    let rejected = pool.submit(request()).unwrap_err();
    assert!(matches!(rejected, AnalysisError::ServiceOverloaded(_)));
    assert_eq!(rejected.category().http_status(), 503);
    assert!(rejected.category().is_retryable());

    gate.open();
    assert!(running.wait().is_ok());
    assert!(queued.wait().is_ok());
}

#[test]
fn slow_inference_times_out_and_worker_recovers() {
    let (pool, gate, started) = gated_pool(2);

    let pending = pool.submit(request()).unwrap();
    started.recv_timeout(Duration::from_secs(5)).unwrap();
    match pending.wait_timeout(Duration::from_millis(50)) {
        Err(AnalysisError::InferenceFailure { model_id, source }) => {
            assert_eq!(model_id, SEG_ID);
            assert!(source.to_string().contains("timed out"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    gate.open();
    assert!(pool.analyze(request()).is_ok());
}

#[test]
fn timed_out_queued_job_is_skipped() {
    let (pool, gate, started) = gated_pool(2);

    let running = pool.submit(request()).unwrap();
    started.recv_timeout(Duration::from_secs(5)).unwrap();
    let abandoned = pool.submit(request()).unwrap();
    assert!(abandoned.wait_timeout(Duration::from_millis(50)).is_err());

    gate.open();
    assert!(running.wait().is_ok());
    assert!(pool.analyze(request()).is_ok());
    // Single worker, FIFO: only the last request reached the engine after the first.
    assert_eq!(started.try_iter().count(), 1);
}

#[test]
fn concurrent_workers_share_one_engine_serially() {
    let busy = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = FnLoader::new({
        let (overlaps, calls) = (Arc::clone(&overlaps), Arc::clone(&calls));
        move |_| {
            Ok(Engine::Segmentation(Box::new(OverlapCounter {
                busy: Arc::clone(&busy),
                overlaps: Arc::clone(&overlaps),
                calls: Arc::clone(&calls),
            })))
        }
    });
    let settings = test_settings();
    let registry = Arc::new(ModelRegistry::from_settings(&settings, Arc::new(loader)));
    let dispatcher = Arc::new(InferenceDispatcher::new(registry, &settings));
    let workers = WorkerSettings {
        workers: 4,
        queue_depth: 8,
        request_timeout_secs: 10,
    };
    let pool = WorkerPool::new(dispatcher, &workers).unwrap();

    let pending: Vec<_> = (0..6).map(|_| pool.submit(request()).unwrap()).collect();
    for job in pending {
        assert!(job.wait().is_ok());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn invalid_pool_settings_are_rejected() {
    let settings = test_settings();
    let registry = Arc::new(ModelRegistry::from_settings(
        &settings,
        Arc::new(common::fake_loader(0.5)),
    ));
    let dispatcher = Arc::new(InferenceDispatcher::new(registry, &settings));
    let no_workers = WorkerSettings {
        workers: 0,
        ..WorkerSettings::default()
    };
    assert!(WorkerPool::new(Arc::clone(&dispatcher), &no_workers).is_err());
    let no_queue = WorkerSettings {
        queue_depth: 0,
        ..WorkerSettings::default()
    };
    assert!(WorkerPool::new(dispatcher, &no_queue).is_err());
}
