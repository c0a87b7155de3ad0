//! Separation jobs
//!
//! A [`Job`] carries one request through the pipeline:
//!
//! ```text
//! Queued ─▶ Decoding ─▶ Transforming ─▶ Separating ─▶ Reconstructing ─▶ Encoding ─▶ Done
//!    │          │            │               │               │              │
//!    └──────────┴────────────┴───────┬───────┴───────────────┴──────────────┘
//!                                    ▼
//!                       Failed(kind)  /  Cancelled
//! ```
//!
//! Request limits are checked while the job is still Queued, so an
//! oversized or over-long upload fails without ever entering Decoding.
//! Every buffer is owned by the job and released as soon as the next stage
//! has consumed it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use unmix_core::codec::{self, AudioFormat, DecodeLimits};
use unmix_core::resample;
use unmix_core::stft::Spectrogram;
use unmix_core::AudioBuffer;

use crate::error::{ErrorKind, Result, SeparationError};
use crate::mixing::{self, MaskSet};
use crate::service::PipelineContext;
use crate::stem::{Stem, StemSet};

/// Identifier assigned by the service at submission
pub type JobId = u64;

/// Cooperative cancellation flag shared between a job and its handle
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next stage or chunk boundary
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SeparationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Pipeline state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Decoding,
    Transforming,
    Separating,
    Reconstructing,
    Encoding,
    Done,
    Failed(ErrorKind),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed(_) | JobStatus::Cancelled)
    }

    /// The stage that follows this one on success
    fn successor(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Queued => Some(JobStatus::Decoding),
            JobStatus::Decoding => Some(JobStatus::Transforming),
            JobStatus::Transforming => Some(JobStatus::Separating),
            JobStatus::Separating => Some(JobStatus::Reconstructing),
            JobStatus::Reconstructing => Some(JobStatus::Encoding),
            JobStatus::Encoding => Some(JobStatus::Done),
            JobStatus::Done | JobStatus::Failed(_) | JobStatus::Cancelled => None,
        }
    }

    /// Whether `next` is a legal transition from this state
    ///
    /// Stages advance strictly one at a time. Failed and Cancelled are
    /// reachable from any non-terminal state; terminal states never change.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed(_) | JobStatus::Cancelled => true,
            next => self.successor() == Some(next),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Decoding => "Decoding",
            JobStatus::Transforming => "Transforming",
            JobStatus::Separating => "Separating",
            JobStatus::Reconstructing => "Reconstructing",
            JobStatus::Encoding => "Encoding",
            JobStatus::Done => "Done",
            JobStatus::Failed(_) => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Failed(kind) => write!(f, "Failed({})", kind),
            other => f.write_str(other.display_name()),
        }
    }
}

/// One separation request as handed over by the caller
#[derive(Clone)]
pub struct SeparationRequest {
    /// Raw uploaded file
    pub audio_bytes: Vec<u8>,
    /// Filename the upload was declared with; its extension selects the container
    pub declared_filename: String,
    pub requested_stems: StemSet,
    /// Per-request duration limit, tightened against the configured one
    pub max_duration_secs: Option<f64>,
}

impl SeparationRequest {
    pub fn new(audio_bytes: Vec<u8>, declared_filename: impl Into<String>, requested_stems: StemSet) -> Self {
        Self {
            audio_bytes,
            declared_filename: declared_filename.into(),
            requested_stems,
            max_duration_secs: None,
        }
    }

    pub fn with_max_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = Some(secs);
        self
    }
}

impl std::fmt::Debug for SeparationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeparationRequest")
            .field("audio_bytes", &format_args!("{} bytes", self.audio_bytes.len()))
            .field("declared_filename", &self.declared_filename)
            .field("requested_stems", &self.requested_stems)
            .field("max_duration_secs", &self.max_duration_secs)
            .finish()
    }
}

/// Outcome delivered to the caller
///
/// A job either returns every requested stem or none of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum JobResponse {
    Success {
        job_id: JobId,
        /// Encoded audio per stem
        stems: BTreeMap<Stem, Vec<u8>>,
    },
    Failure {
        job_id: JobId,
        error_kind: ErrorKind,
        message: String,
    },
}

impl JobResponse {
    fn failure(job_id: JobId, error: &SeparationError) -> Self {
        JobResponse::Failure {
            job_id,
            error_kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            JobResponse::Success { job_id, .. } | JobResponse::Failure { job_id, .. } => *job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResponse::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobResponse::Success { .. } => None,
            JobResponse::Failure { error_kind, .. } => Some(*error_kind),
        }
    }
}

/// Progress report sent on every transition and after every chunk
#[derive(Debug, Clone)]
pub struct JobProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Progress within the current stage (0.0 to 1.0)
    pub progress: f32,
    /// Human-readable status message
    pub message: String,
}

/// Callback for job progress (uses Arc for cloneability)
pub type ProgressCallback = Arc<dyn Fn(JobProgress) + Send + Sync>;

/// A request moving through the pipeline
///
/// Mutated only by the worker executing it. Stage inputs are held in
/// `Option`s and taken by the stage that consumes them.
pub struct Job {
    id: JobId,
    declared_filename: String,
    stems: StemSet,
    max_duration_secs: Option<f64>,
    status: JobStatus,
    history: Vec<JobStatus>,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,

    input_bytes: Option<Arc<[u8]>>,
    input: Option<AudioBuffer>,
    spectrogram: Option<Spectrogram>,
    masks: Option<MaskSet>,
    stem_audio: Option<BTreeMap<Stem, AudioBuffer>>,
    outputs: BTreeMap<Stem, Vec<u8>>,
}

impl Job {
    pub fn new(
        id: JobId,
        request: SeparationRequest,
        cancel: CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            id,
            declared_filename: request.declared_filename,
            stems: request.requested_stems,
            max_duration_secs: request.max_duration_secs,
            status: JobStatus::Queued,
            history: vec![JobStatus::Queued],
            cancel,
            progress,
            input_bytes: Some(request.audio_bytes.into()),
            input: None,
            spectrogram: None,
            masks: None,
            stem_audio: None,
            outputs: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Every state the job has been in, in order
    pub fn history(&self) -> &[JobStatus] {
        &self.history
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether any input, intermediate or output buffer is still allocated
    pub fn holds_buffers(&self) -> bool {
        self.input_bytes.is_some()
            || self.input.is_some()
            || self.spectrogram.is_some()
            || self.masks.is_some()
            || self.stem_audio.is_some()
            || !self.outputs.is_empty()
    }

    /// Run the job to a terminal state
    pub fn execute(&mut self, ctx: &PipelineContext) -> JobResponse {
        if self.status.is_terminal() {
            return JobResponse::failure(
                self.id,
                &SeparationError::Internal(format!("job {} already finished", self.id)),
            );
        }

        match self.run_stages(ctx) {
            Ok(()) => {
                let stems = std::mem::take(&mut self.outputs);
                self.release();
                self.finish(JobStatus::Done, "Separation complete");
                log::info!("Job {}: done, {} stems", self.id, stems.len());
                JobResponse::Success {
                    job_id: self.id,
                    stems,
                }
            }
            Err(SeparationError::Cancelled) => {
                self.release();
                self.finish(JobStatus::Cancelled, "Job cancelled");
                log::info!("Job {}: cancelled", self.id);
                JobResponse::failure(self.id, &SeparationError::Cancelled)
            }
            Err(error) => {
                self.release();
                let kind = error.kind();
                self.finish(JobStatus::Failed(kind), &error.to_string());
                log::error!("Job {}: failed in {}: {}", self.id, self.last_stage(), error);
                JobResponse::failure(self.id, &error)
            }
        }
    }

    fn run_stages(&mut self, ctx: &PipelineContext) -> Result<()> {
        let (format, max_duration) = self.validate(ctx)?;

        self.advance(JobStatus::Decoding, "Decoding audio")?;
        self.decode(ctx, format, max_duration)?;

        self.advance(JobStatus::Transforming, "Computing spectrogram")?;
        self.transform(ctx)?;

        self.advance(JobStatus::Separating, "Estimating stem masks")?;
        self.separate(ctx)?;

        self.advance(JobStatus::Reconstructing, "Reconstructing stems")?;
        self.reconstruct(ctx)?;

        self.advance(JobStatus::Encoding, "Encoding stems")?;
        self.encode(ctx)
    }

    /// Request limits, checked before any decoding work
    ///
    /// Order: file size, container, non-empty upload, stems, then the
    /// declared duration read from the container headers.
    fn validate(&self, ctx: &PipelineContext) -> Result<(AudioFormat, f64)> {
        self.cancel.check()?;
        let limits = &ctx.config.limits;
        let bytes = self.input_bytes.as_ref().ok_or_else(|| missing("upload bytes"))?;

        if bytes.len() as u64 > limits.max_file_bytes {
            return Err(SeparationError::ResourceExceeded(format!(
                "upload is {} bytes, limit is {}",
                bytes.len(),
                limits.max_file_bytes
            )));
        }

        let format = AudioFormat::from_filename(&self.declared_filename)
            .map_err(|e| SeparationError::InvalidRequest(e.to_string()))?;

        if bytes.is_empty() {
            return Err(SeparationError::from_decode(unmix_core::AudioError::Corrupt(
                "upload is empty".to_string(),
            )));
        }

        if self.stems.is_empty() {
            return Err(SeparationError::InvalidRequest("no stems requested".to_string()));
        }

        let max_duration = match self.max_duration_secs {
            Some(secs) if !secs.is_finite() || secs <= 0.0 => {
                return Err(SeparationError::InvalidRequest(format!(
                    "invalid duration limit {}",
                    secs
                )));
            }
            Some(secs) => secs.min(limits.max_duration_secs),
            None => limits.max_duration_secs,
        };

        let info = codec::probe(Arc::clone(bytes), format).map_err(SeparationError::from_decode)?;
        if let Some(duration) = info.duration_secs() {
            if duration > max_duration {
                return Err(SeparationError::ResourceExceeded(format!(
                    "duration {:.1}s exceeds limit of {:.1}s",
                    duration, max_duration
                )));
            }
        }

        log::info!(
            "Job {}: accepted {} ({}, {} Hz, {} ch, {} stems)",
            self.id,
            self.declared_filename,
            format,
            info.sample_rate,
            info.channels,
            self.stems.len()
        );
        Ok((format, max_duration))
    }

    fn decode(&mut self, ctx: &PipelineContext, format: AudioFormat, max_duration: f64) -> Result<()> {
        let bytes = self.input_bytes.take().ok_or_else(|| missing("upload bytes"))?;
        let limits = DecodeLimits {
            max_duration_secs: Some(max_duration),
        };
        let decoded = codec::decode(bytes, format, limits).map_err(SeparationError::from_decode)?;
        self.cancel.check()?;

        let audio = &ctx.config.audio;
        let conformed = resample::conform(decoded, audio.sample_rate, audio.layout)
            .map_err(|e| SeparationError::Internal(format!("conform failed: {}", e)))?;
        log::info!(
            "Job {}: decoded {:.2}s ({} frames)",
            self.id,
            conformed.duration_secs(),
            conformed.frames()
        );
        self.input = Some(conformed);
        Ok(())
    }

    fn transform(&mut self, ctx: &PipelineContext) -> Result<()> {
        let input = self.input.take().ok_or_else(|| missing("decoded audio"))?;
        let spectrogram = ctx
            .stft
            .forward(&input)
            .map_err(|e| SeparationError::Internal(format!("forward transform failed: {}", e)))?;
        drop(input);

        let (channels, frames, bins) = spectrogram.shape();
        log::info!("Job {}: spectrogram {}x{}x{}", self.id, channels, frames, bins);
        self.spectrogram = Some(spectrogram);
        Ok(())
    }

    fn separate(&mut self, ctx: &PipelineContext) -> Result<()> {
        let spectrogram = self.spectrogram.as_ref().ok_or_else(|| missing("spectrogram"))?;
        let masks = ctx
            .runner
            .separate_with(spectrogram, &self.stems, &self.cancel, |done, total| {
                self.report(
                    JobStatus::Separating,
                    done as f32 / total.max(1) as f32,
                    format!("Chunk {}/{}", done, total),
                );
            })?;
        self.masks = Some(masks);
        Ok(())
    }

    fn reconstruct(&mut self, ctx: &PipelineContext) -> Result<()> {
        let spectrogram = self.spectrogram.take().ok_or_else(|| missing("spectrogram"))?;
        let masks = self.masks.take().ok_or_else(|| missing("masks"))?;
        let audio = mixing::reconstruct(&spectrogram, masks, &ctx.stft, &self.cancel)?;
        drop(spectrogram);
        self.stem_audio = Some(audio);
        Ok(())
    }

    fn encode(&mut self, ctx: &PipelineContext) -> Result<()> {
        let audio = self.stem_audio.take().ok_or_else(|| missing("stem audio"))?;
        let total = audio.len();
        for (index, (stem, buffer)) in audio.into_iter().enumerate() {
            self.cancel.check()?;
            let bytes = codec::encode(&buffer, ctx.config.output).map_err(SeparationError::Encode)?;
            log::debug!("Job {}: encoded {} ({} bytes)", self.id, stem, bytes.len());
            self.outputs.insert(stem, bytes);
            self.report(
                JobStatus::Encoding,
                (index + 1) as f32 / total as f32,
                format!("Encoded {}", stem.display_name()),
            );
        }
        Ok(())
    }

    /// Move to the next stage, failing on an illegal transition
    fn advance(&mut self, next: JobStatus, message: &str) -> Result<()> {
        self.cancel.check()?;
        if !self.status.can_transition_to(next) {
            return Err(SeparationError::Internal(format!(
                "illegal transition {} -> {}",
                self.status, next
            )));
        }
        log::info!("Job {}: {} -> {}", self.id, self.status, next);
        self.status = next;
        self.history.push(next);
        self.report(next, 0.0, message.to_string());
        Ok(())
    }

    /// Enter a terminal state
    fn finish(&mut self, terminal: JobStatus, message: &str) {
        if self.status.can_transition_to(terminal) {
            self.status = terminal;
            self.history.push(terminal);
            self.report(terminal, 1.0, message.to_string());
        }
    }

    /// Last non-terminal stage the job reached
    fn last_stage(&self) -> JobStatus {
        self.history
            .iter()
            .rev()
            .find(|s| !s.is_terminal())
            .copied()
            .unwrap_or(JobStatus::Queued)
    }

    fn release(&mut self) {
        self.input_bytes = None;
        self.input = None;
        self.spectrogram = None;
        self.masks = None;
        self.stem_audio = None;
        self.outputs.clear();
    }

    fn report(&self, status: JobStatus, progress: f32, message: String) {
        if let Some(cb) = &self.progress {
            cb(JobProgress {
                job_id: self.id,
                status,
                progress,
                message,
            });
        }
    }
}

fn missing(what: &str) -> SeparationError {
    SeparationError::Internal(format!("{} not available for this stage", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChunkMasks, SeparationBackend, SpectralBackend, SpectrogramChunk};
    use crate::config::SeparationConfig;
    use crate::test_support::sine_wav;
    use ndarray::Array3;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn small_config() -> SeparationConfig {
        let mut config = SeparationConfig::default();
        config.audio.sample_rate = 8000;
        config.transform.window_size = 512;
        config.transform.hop_size = 128;
        config.model.chunk_frames = 16;
        config
    }

    fn context(config: SeparationConfig, backend: Arc<dyn SeparationBackend>) -> PipelineContext {
        PipelineContext::new(config, backend).unwrap()
    }

    fn request(bytes: Vec<u8>, name: &str) -> SeparationRequest {
        SeparationRequest::new(bytes, name, StemSet::vocal_split())
    }

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<JobProgress>>>) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));
        (callback, reports)
    }

    #[test]
    fn test_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Decoding));
        assert!(!Queued.can_transition_to(Transforming));
        assert!(!Separating.can_transition_to(Decoding));
        assert!(Encoding.can_transition_to(Done));
        assert!(Queued.can_transition_to(Failed(ErrorKind::ResourceExceeded)));
        assert!(Separating.can_transition_to(Cancelled));
        assert!(!Done.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Failed(ErrorKind::Internal)));
        assert!(!Queued.can_transition_to(Queued));
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(SeparationError::Cancelled)));
    }

    #[test]
    fn test_full_run_reports_every_transition() {
        let ctx = context(small_config(), Arc::new(SpectralBackend::new()));
        let (callback, reports) = recorder();
        let mut job = Job::new(
            1,
            request(sine_wav(440.0, 1.0, 8000, 1), "tone.wav"),
            CancelToken::new(),
            Some(callback),
        );

        let response = job.execute(&ctx);
        assert!(response.is_success(), "{:?}", response.error_kind());
        assert_eq!(
            job.history(),
            &[
                JobStatus::Queued,
                JobStatus::Decoding,
                JobStatus::Transforming,
                JobStatus::Separating,
                JobStatus::Reconstructing,
                JobStatus::Encoding,
                JobStatus::Done,
            ]
        );
        assert!(!job.holds_buffers());

        let reports = reports.lock().unwrap();
        let mut seen: Vec<JobStatus> = Vec::new();
        for report in reports.iter() {
            if seen.last() != Some(&report.status) {
                seen.push(report.status);
            }
        }
        assert_eq!(seen, job.history()[1..].to_vec());
        assert!(reports
            .iter()
            .any(|r| r.status == JobStatus::Separating && r.message.starts_with("Chunk")));
    }

    #[test]
    fn test_size_limit_rejected_while_queued() {
        let mut config = small_config();
        config.limits.max_file_bytes = 1024;
        let ctx = context(config, Arc::new(SpectralBackend::new()));
        let mut job = Job::new(2, request(sine_wav(440.0, 1.0, 8000, 1), "tone.wav"), CancelToken::new(), None);

        let response = job.execute(&ctx);
        assert_eq!(response.error_kind(), Some(ErrorKind::ResourceExceeded));
        assert_eq!(
            job.history(),
            &[JobStatus::Queued, JobStatus::Failed(ErrorKind::ResourceExceeded)]
        );
    }

    #[test]
    fn test_request_validation_kinds() {
        let ctx = context(small_config(), Arc::new(SpectralBackend::new()));
        let wav = sine_wav(440.0, 0.2, 8000, 1);

        let mut job = Job::new(3, request(wav.clone(), "tone.ogg"), CancelToken::new(), None);
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::InvalidRequest));

        let mut job = Job::new(
            4,
            SeparationRequest::new(wav.clone(), "tone.wav", StemSet::new()),
            CancelToken::new(),
            None,
        );
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::InvalidRequest));

        let mut job = Job::new(5, request(Vec::new(), "tone.wav"), CancelToken::new(), None);
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::DecodeError));

        let garbage: Vec<u8> = (0..4096u32).map(|i| (i % 200) as u8).collect();
        let mut job = Job::new(6, request(garbage, "tone.mp3"), CancelToken::new(), None);
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::DecodeError));
        assert_eq!(job.history()[0], JobStatus::Queued);
        assert!(!job.history().contains(&JobStatus::Decoding));

        let mut job = Job::new(7, request(wav, "tone.wav").with_max_duration(f64::NAN), CancelToken::new(), None);
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::InvalidRequest));
    }

    #[test]
    fn test_non_finite_input_is_decode_error() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..8000 {
                let value = if i == 1000 { f32::INFINITY } else { (i as f32 * 0.05).sin() * 0.5 };
                writer.write_sample(value).unwrap();
            }
            writer.finalize().unwrap();
        }

        let ctx = context(small_config(), Arc::new(SpectralBackend::new()));
        let mut job = Job::new(12, request(cursor.into_inner(), "float.wav"), CancelToken::new(), None);
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::DecodeError));
        assert_eq!(
            job.history(),
            &[
                JobStatus::Queued,
                JobStatus::Decoding,
                JobStatus::Failed(ErrorKind::DecodeError)
            ]
        );
        assert!(!job.holds_buffers());
    }

    #[test]
    fn test_request_limit_tighter_than_config() {
        let ctx = context(small_config(), Arc::new(SpectralBackend::new()));
        let mut job = Job::new(
            8,
            request(sine_wav(440.0, 1.0, 8000, 1), "tone.wav").with_max_duration(0.5),
            CancelToken::new(),
            None,
        );
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::ResourceExceeded));
        assert_eq!(job.status(), JobStatus::Failed(ErrorKind::ResourceExceeded));
        assert!(!job.holds_buffers());
    }

    #[test]
    fn test_cancel_before_start() {
        let ctx = context(small_config(), Arc::new(SpectralBackend::new()));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut job = Job::new(9, request(sine_wav(440.0, 0.5, 8000, 1), "tone.wav"), cancel, None);

        let response = job.execute(&ctx);
        assert_eq!(response.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(job.history(), &[JobStatus::Queued, JobStatus::Cancelled]);
        assert!(!job.holds_buffers());
    }

    #[test]
    fn test_model_failure_is_terminal_without_output() {
        struct Broken(AtomicUsize);
        impl SeparationBackend for Broken {
            fn estimate(&self, chunk: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(stems.iter().map(|s| (s, Array3::from_elem(chunk.shape(), f32::NAN))).collect())
            }
            fn name(&self) -> &'static str {
                "Broken"
            }
        }

        let backend = Arc::new(Broken(AtomicUsize::new(0)));
        let ctx = context(small_config(), backend.clone());
        let mut job = Job::new(10, request(sine_wav(440.0, 0.5, 8000, 2), "tone.wav"), CancelToken::new(), None);

        let response = job.execute(&ctx);
        assert_eq!(response.error_kind(), Some(ErrorKind::ModelError));
        assert_eq!(job.status(), JobStatus::Failed(ErrorKind::ModelError));
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
        assert!(!job.holds_buffers());
    }

    #[test]
    fn test_execute_twice_is_rejected() {
        let ctx = context(small_config(), Arc::new(SpectralBackend::new()));
        let mut job = Job::new(11, request(Vec::new(), "x.wav"), CancelToken::new(), None);
        job.execute(&ctx);
        let history = job.history().to_vec();
        assert_eq!(job.execute(&ctx).error_kind(), Some(ErrorKind::Internal));
        assert_eq!(job.history(), history.as_slice());
    }

    #[test]
    fn test_response_serializes() {
        let response = JobResponse::Failure {
            job_id: 3,
            error_kind: ErrorKind::DecodeError,
            message: "bad".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"result\":\"failure\""));
        assert!(json.contains("\"error_kind\":\"DecodeError\""));
        let back: JobResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);

        let mut stems = BTreeMap::new();
        stems.insert(Stem::Vocals, vec![1u8, 2]);
        let json = serde_json::to_string(&JobResponse::Success { job_id: 1, stems }).unwrap();
        assert!(json.contains("\"vocals\":[1,2]"));
    }
}
