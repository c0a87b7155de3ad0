//! Separation service with thread pool for concurrent jobs
//!
//! The service owns a rayon thread pool sized by `workers`. Each submitted
//! job runs every stage on a single pool thread; the pool size therefore
//! bounds how many jobs hold buffers at once. The model backend is loaded
//! once and shared read-only by all jobs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;

use unmix_core::stft::StftProcessor;

use crate::backend::{create_backend, SeparationBackend};
use crate::config::SeparationConfig;
use crate::error::{ErrorKind, Result, SeparationError};
use crate::job::{CancelToken, Job, JobId, JobResponse, ProgressCallback, SeparationRequest};
use crate::runner::ModelRunner;

/// Read-only state shared by every job
pub struct PipelineContext {
    pub config: SeparationConfig,
    pub runner: ModelRunner,
    pub stft: StftProcessor,
}

impl PipelineContext {
    /// Validate the configuration and plan the transform
    pub fn new(mut config: SeparationConfig, backend: Arc<dyn SeparationBackend>) -> Result<Self> {
        config.validate();
        let stft = StftProcessor::new(config.transform.window_size, config.transform.hop_size)
            .map_err(|e| SeparationError::InvalidConfig(e.to_string()))?;
        let runner = ModelRunner::new(backend, config.model.chunk_frames);
        Ok(Self { config, runner, stft })
    }
}

/// Main entry point for stem separation
///
/// Example usage:
/// ```ignore
/// let service = SeparationService::new()?;
/// let request = SeparationRequest::new(bytes, "song.mp3", StemSet::vocal_split());
/// let response = service.run(request, None);
/// ```
pub struct SeparationService {
    context: Arc<PipelineContext>,
    /// Thread pool for concurrent jobs
    thread_pool: rayon::ThreadPool,
    next_id: AtomicU64,
}

impl SeparationService {
    /// Create a service with the default config
    pub fn new() -> Result<Self> {
        Self::with_config(SeparationConfig::default())
    }

    /// Create a service, building the configured backend
    pub fn with_config(mut config: SeparationConfig) -> Result<Self> {
        config.validate();
        let backend = create_backend(&config.model)?;
        Self::with_backend(config, backend)
    }

    /// Create a service around an already constructed backend
    pub fn with_backend(config: SeparationConfig, backend: Arc<dyn SeparationBackend>) -> Result<Self> {
        let context = PipelineContext::new(config, backend)?;
        let workers = context.config.workers;

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("unmix-job-{}", i))
            .build()
            .map_err(|e| SeparationError::Internal(format!("Failed to create job thread pool: {}", e)))?;

        log::info!(
            "SeparationService ready: {} backend, {} workers, STFT {}/{}",
            context.runner.backend().name(),
            workers,
            context.stft.window_size(),
            context.stft.hop_size()
        );

        Ok(Self {
            context: Arc::new(context),
            thread_pool,
            next_id: AtomicU64::new(1),
        })
    }

    /// Get current configuration
    pub fn config(&self) -> &SeparationConfig {
        &self.context.config
    }

    /// Backend name and chunking, for logs and diagnostics
    pub fn backend_info(&self) -> String {
        let runner = &self.context.runner;
        format!(
            "{} (chunks of {} frames, {} context)",
            runner.backend().name(),
            runner.chunk_frames(),
            runner.context_frames()
        )
    }

    /// Queue a request on the pool
    ///
    /// Returns immediately; the handle delivers the response and can cancel
    /// the job at its next stage or chunk boundary.
    pub fn submit(&self, request: SeparationRequest, progress: Option<ProgressCallback>) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelToken::new();
        let (response_tx, response_rx) = channel();

        log::info!("Job {} submitted: {:?}", id, request);

        let context = Arc::clone(&self.context);
        let job_cancel = cancel.clone();
        self.thread_pool.spawn(move || {
            let mut job = Job::new(id, request, job_cancel, progress);
            let response = job.execute(&context);
            drop(job);
            let _ = response_tx.send(response);
        });

        JobHandle {
            id,
            cancel,
            receiver: response_rx,
        }
    }

    /// Run a request to completion on the pool, blocking the caller
    pub fn run(&self, request: SeparationRequest, progress: Option<ProgressCallback>) -> JobResponse {
        self.submit(request, progress).wait()
    }
}

/// Caller-side handle to a submitted job
pub struct JobHandle {
    id: JobId,
    cancel: CancelToken,
    receiver: Receiver<JobResponse>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the job reaches a terminal state
    pub fn wait(self) -> JobResponse {
        self.receiver.recv().unwrap_or_else(|_| lost_worker(self.id))
    }

    /// Response if the job has finished, without blocking
    pub fn try_result(&self) -> Option<JobResponse> {
        match self.receiver.try_recv() {
            Ok(response) => Some(response),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(lost_worker(self.id)),
        }
    }
}

/// Response for a job whose worker went away without answering
fn lost_worker(job_id: JobId) -> JobResponse {
    JobResponse::Failure {
        job_id,
        error_kind: ErrorKind::Internal,
        message: "job worker terminated without a response".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChunkMasks, SpectralBackend, SpectrogramChunk};
    use crate::job::{JobProgress, JobStatus};
    use crate::stem::{Stem, StemSet};
    use crate::test_support::sine_wav;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn status_log() -> (ProgressCallback, Arc<Mutex<Vec<JobStatus>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: ProgressCallback = Arc::new(move |p: JobProgress| {
            let mut statuses = sink.lock().unwrap();
            if statuses.last() != Some(&p.status) {
                statuses.push(p.status);
            }
        });
        (callback, log)
    }

    #[test]
    fn test_ten_second_sine_scenario() {
        let service = SeparationService::with_backend(SeparationConfig::default(), Arc::new(SpectralBackend::new())).unwrap();
        let hop = service.config().transform.hop_size as i64;
        let request = SeparationRequest::new(sine_wav(440.0, 10.0, 44100, 1), "sine.wav", StemSet::vocal_split());

        let response = service.run(request, None);
        let JobResponse::Success { stems, .. } = response else {
            panic!("expected success, got {:?}", response);
        };
        assert_eq!(stems.keys().copied().collect::<Vec<_>>(), vec![Stem::Vocals, Stem::Instrumental]);

        for (stem, bytes) in &stems {
            let reader = hound::WavReader::new(Cursor::new(bytes.as_slice())).unwrap();
            let spec = reader.spec();
            assert_eq!(spec.sample_rate, 44100, "{}", stem);
            assert_eq!(spec.channels, 2, "{}", stem);
            let frames = reader.duration() as i64;
            assert!((frames - 441_000).abs() <= hop, "{} has {} frames", stem, frames);
        }
    }

    #[test]
    fn test_duration_boundary_fails_before_decoding() {
        let mut config = SeparationConfig::default();
        config.limits.max_duration_secs = 1.0;
        let service = SeparationService::with_backend(config, Arc::new(SpectralBackend::new())).unwrap();
        let (callback, statuses) = status_log();

        let request = SeparationRequest::new(sine_wav(440.0, 2.0, 8000, 1), "long.wav", StemSet::vocal_split());
        let response = service.run(request, Some(callback));

        assert_eq!(response.error_kind(), Some(ErrorKind::ResourceExceeded));
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![JobStatus::Failed(ErrorKind::ResourceExceeded)]
        );
    }

    /// Cancels its own job on the first chunk
    struct CancellingBackend {
        cancel: Mutex<Option<CancelToken>>,
        chunks: AtomicUsize,
    }

    impl SeparationBackend for CancellingBackend {
        fn estimate(&self, chunk: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks> {
            self.chunks.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = self.cancel.lock().unwrap().as_ref() {
                token.cancel();
            }
            Ok(stems.iter().map(|s| (s, ndarray::Array3::from_elem(chunk.shape(), 0.5))).collect())
        }

        fn name(&self) -> &'static str {
            "Cancelling"
        }
    }

    #[test]
    fn test_cancel_during_separation_stops_within_one_chunk() {
        let backend = Arc::new(CancellingBackend {
            cancel: Mutex::new(None),
            chunks: AtomicUsize::new(0),
        });
        let mut config = SeparationConfig::default();
        config.audio.sample_rate = 8000;
        config.transform.window_size = 1024;
        config.transform.hop_size = 256;
        config.model.chunk_frames = 16;
        let ctx = PipelineContext::new(config, backend.clone()).unwrap();

        let cancel = CancelToken::new();
        *backend.cancel.lock().unwrap() = Some(cancel.clone());

        let request = SeparationRequest::new(sine_wav(440.0, 3.0, 8000, 2), "take.wav", StemSet::vocal_split());
        let mut job = Job::new(1, request, cancel, None);
        let response = job.execute(&ctx);

        assert_eq!(response.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(backend.chunks.load(Ordering::SeqCst), 1);
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(
            &job.history()[job.history().len() - 2..],
            &[JobStatus::Separating, JobStatus::Cancelled]
        );
        assert!(!job.holds_buffers());
    }

    #[test]
    fn test_handle_cancel_before_run() {
        let mut config = SeparationConfig::default();
        config.workers = 1;
        let service = SeparationService::with_backend(config, Arc::new(SpectralBackend::new())).unwrap();

        // Occupy the only worker so the second job is still queued when cancelled
        let (gate_tx, gate_rx) = channel::<()>();
        service.thread_pool.spawn(move || {
            let _ = gate_rx.recv();
        });

        let request = SeparationRequest::new(sine_wav(440.0, 0.5, 8000, 1), "a.wav", StemSet::vocal_split());
        let handle = service.submit(request, None);
        handle.cancel();
        assert!(handle.try_result().is_none());
        gate_tx.send(()).unwrap();

        assert_eq!(handle.wait().error_kind(), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn test_job_ids_increase() {
        let service = SeparationService::with_backend(SeparationConfig::default(), Arc::new(SpectralBackend::new())).unwrap();
        let first = service.submit(SeparationRequest::new(Vec::new(), "a.wav", StemSet::vocal_split()), None);
        let second = service.submit(SeparationRequest::new(Vec::new(), "b.wav", StemSet::vocal_split()), None);
        assert!(second.id() > first.id());
        assert_eq!(first.wait().job_id(), 1);
        assert_eq!(second.wait().job_id(), 2);
    }

    #[test]
    fn test_all_stems() {
        let mut config = SeparationConfig::default();
        config.audio.sample_rate = 16000;
        config.transform.window_size = 1024;
        config.transform.hop_size = 256;
        let service = SeparationService::with_backend(config, Arc::new(SpectralBackend::new())).unwrap();

        let stems: StemSet = Stem::ALL.into_iter().collect();
        let request = SeparationRequest::new(sine_wav(220.0, 1.0, 22050, 2), "mix.wav", stems);
        let response = service.run(request, None);
        let JobResponse::Success { stems, .. } = response else {
            panic!("expected success, got {:?}", response);
        };
        assert_eq!(stems.len(), 4);
        for bytes in stems.values() {
            let reader = hound::WavReader::new(Cursor::new(bytes.as_slice())).unwrap();
            assert_eq!(reader.spec().sample_rate, 16000);
            assert!((reader.duration() as i64 - 16000).abs() <= 256);
        }
    }

    #[test]
    fn test_backend_info() {
        let service = SeparationService::with_backend(SeparationConfig::default(), Arc::new(SpectralBackend::new())).unwrap();
        assert!(service.backend_info().starts_with("Spectral"));
    }
}
