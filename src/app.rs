//! Application orchestration
//!
//! [`LiveApp`] owns the shared backend resources (frame heap, state
//! database, re-emit signal), wires the six stages into a chain of
//! connections and drives their hosts from a single supervising loop:
//!
//! ```text
//! CameraSource -> FaceDetector -> FaceMarker -> FaceAligner -> FaceModifier -> StreamOutput
//! ```
//!
//! The source connection accepts any number of producers; the camera is
//! producer 0.

use crate::backend::{
    BackendDb, Connection, ProducerId, ReemitSignal, StageHost, StageWorker, WeakHeap, WorkerFactory,
};
use crate::config::{AppConfig, UserDataPaths};
use crate::error::Result;
use crate::stages::models::{
    BoxCutter, BrightRegionDetector, FaceCutter, FaceDetect, FaceEditor, FaceLandmarker, FrameCapture,
    FrameSink, IntensityEditor, NullSink, RectMarker, SyntheticCapture,
};
use crate::stages::{
    camera_source, face_aligner, face_detector, face_marker, face_modifier, stream_output, CameraSourceWorker,
    FaceAlignerWorker, FaceDetectorWorker, FaceMarkerWorker, FaceModifierWorker, StageDeps, StreamOutputWorker,
};
use std::sync::Arc;
use std::time::Duration;

pub type CaptureFactory = Arc<dyn Fn() -> Box<dyn FrameCapture> + Send + Sync>;
pub type DetectorFactory = Arc<dyn Fn() -> Box<dyn FaceDetect> + Send + Sync>;
pub type MarkerFactory = Arc<dyn Fn() -> Box<dyn FaceLandmarker> + Send + Sync>;
pub type CutterFactory = Arc<dyn Fn() -> Box<dyn FaceCutter> + Send + Sync>;
pub type EditorFactory = Arc<dyn Fn() -> Box<dyn FaceEditor> + Send + Sync>;
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn FrameSink> + Send + Sync>;

/// Model constructors for every stage. Each (re)start of a stage builds
/// fresh instances.
#[derive(Clone)]
pub struct StageModels {
    pub capture: CaptureFactory,
    pub detectors: Vec<(String, DetectorFactory)>,
    pub markers: Vec<(String, MarkerFactory)>,
    pub cutter: CutterFactory,
    pub editor: EditorFactory,
    pub sink: SinkFactory,
}

impl StageModels {
    /// The built-in headless models.
    pub fn builtin() -> Self {
        Self {
            capture: Arc::new(|| Box::new(SyntheticCapture::new()) as Box<dyn FrameCapture>),
            detectors: vec![(
                "bright_region".to_string(),
                Arc::new(|| Box::new(BrightRegionDetector) as Box<dyn FaceDetect>) as DetectorFactory,
            )],
            markers: vec![(
                "rect".to_string(),
                Arc::new(|| Box::new(RectMarker) as Box<dyn FaceLandmarker>) as MarkerFactory,
            )],
            cutter: Arc::new(|| Box::new(BoxCutter) as Box<dyn FaceCutter>),
            editor: Arc::new(|| Box::new(IntensityEditor) as Box<dyn FaceEditor>),
            sink: Arc::new(|| Box::new(NullSink) as Box<dyn FrameSink>),
        }
    }

    /// Replace the output sink.
    pub fn with_sink<S>(mut self, make: impl Fn() -> S + Send + Sync + 'static) -> Self
    where
        S: FrameSink + 'static,
    {
        self.sink = Arc::new(move || Box::new(make()) as Box<dyn FrameSink>);
        self
    }

    fn detector_names(&self) -> Vec<String> {
        self.detectors.iter().map(|(n, _)| n.clone()).collect()
    }

    fn marker_names(&self) -> Vec<String> {
        self.markers.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl std::fmt::Debug for StageModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageModels")
            .field("detectors", &self.detector_names())
            .field("markers", &self.marker_names())
            .finish_non_exhaustive()
    }
}

/// Connections between consecutive stages.
#[derive(Debug, Clone)]
struct Links {
    sources: Connection,
    detected: Connection,
    marked: Connection,
    aligned: Connection,
    modified: Connection,
}

impl Links {
    fn new() -> Self {
        Self {
            sources: Connection::new("multi_sources"),
            detected: Connection::new("face_detector_out"),
            marked: Connection::new("face_marker_out"),
            aligned: Connection::new("face_aligner_out"),
            modified: Connection::new("face_modifier_out"),
        }
    }
}

/// The running application.
pub struct LiveApp {
    config: AppConfig,
    paths: UserDataPaths,
    models: StageModels,
    heap: Arc<WeakHeap>,
    db: BackendDb,
    reemit: ReemitSignal,
    links: Links,
    hosts: Vec<StageHost>,
}

impl LiveApp {
    /// Create the backend resources and all stage hosts. Nothing is started
    /// until [`LiveApp::initialize`].
    pub fn new(config: AppConfig, paths: UserDataPaths, models: StageModels) -> Result<Self> {
        paths.ensure_dirs()?;
        let db = BackendDb::open_with_interval(paths.states_file(), config.db_flush_interval())?;
        let heap = Arc::new(WeakHeap::new(config.heap_size_bytes()));
        tracing::info!(
            "Backend ready: heap {} MiB, states {:?}",
            config.heap_size_mb,
            paths.states_file()
        );

        let mut app = Self {
            config,
            paths,
            models,
            heap,
            db,
            reemit: ReemitSignal::new(),
            links: Links::new(),
            hosts: Vec::new(),
        };
        app.hosts = app.build_hosts()?;
        Ok(app)
    }

    fn build_hosts(&self) -> Result<Vec<StageHost>> {
        let deps = StageDeps {
            heap: self.heap.clone(),
            reemit: self.reemit.clone(),
            timing: self.config.worker_timing(),
        };
        let links = &self.links;
        let models = &self.models;
        let max_restarts = self.config.max_restarts;

        let camera: WorkerFactory = {
            let (deps, capture, out) = (deps.clone(), models.capture.clone(), links.sources.clone());
            Box::new(move || {
                Ok(Box::new(CameraSourceWorker::new(&deps, capture(), out.clone(), ProducerId(0))) as Box<dyn StageWorker>)
            })
        };
        let detector: WorkerFactory = {
            let (deps, detectors) = (deps.clone(), models.detectors.clone());
            let (input, output) = (links.sources.clone(), links.detected.clone());
            Box::new(move || {
                let built = detectors.iter().map(|(n, make)| (n.clone(), make())).collect();
                Ok(Box::new(FaceDetectorWorker::new(&deps, built, input.clone(), output.clone())) as Box<dyn StageWorker>)
            })
        };
        let marker: WorkerFactory = {
            let (deps, markers) = (deps.clone(), models.markers.clone());
            let (input, output) = (links.detected.clone(), links.marked.clone());
            Box::new(move || {
                let built = markers.iter().map(|(n, make)| (n.clone(), make())).collect();
                Ok(Box::new(FaceMarkerWorker::new(&deps, built, input.clone(), output.clone())) as Box<dyn StageWorker>)
            })
        };
        let aligner: WorkerFactory = {
            let (deps, cutter) = (deps.clone(), models.cutter.clone());
            let (input, output) = (links.marked.clone(), links.aligned.clone());
            Box::new(move || {
                Ok(Box::new(FaceAlignerWorker::new(&deps, cutter(), input.clone(), output.clone())) as Box<dyn StageWorker>)
            })
        };
        let modifier: WorkerFactory = {
            let (deps, editor) = (deps.clone(), models.editor.clone());
            let (input, output) = (links.aligned.clone(), links.modified.clone());
            Box::new(move || {
                Ok(Box::new(FaceModifierWorker::new(&deps, editor(), input.clone(), output.clone())) as Box<dyn StageWorker>)
            })
        };
        let output: WorkerFactory = {
            let (deps, sink, input) = (deps.clone(), models.sink.clone(), links.modified.clone());
            let dir = self.paths.output_sequence_dir();
            Box::new(move || {
                Ok(Box::new(StreamOutputWorker::new(&deps, sink(), input.clone(), dir.clone())) as Box<dyn StageWorker>)
            })
        };

        let resolutions = (models.capture)().resolutions();
        let db = &self.db;
        Ok(vec![
            StageHost::new(camera_source::NAME, camera_source::schema(&resolutions)?, db.clone(), camera, max_restarts),
            StageHost::new(
                face_detector::NAME,
                face_detector::schema(&models.detector_names())?,
                db.clone(),
                detector,
                max_restarts,
            ),
            StageHost::new(
                face_marker::NAME,
                face_marker::schema(&models.marker_names())?,
                db.clone(),
                marker,
                max_restarts,
            ),
            StageHost::new(face_aligner::NAME, face_aligner::schema()?, db.clone(), aligner, max_restarts),
            StageHost::new(face_modifier::NAME, face_modifier::schema()?, db.clone(), modifier, max_restarts),
            StageHost::new(stream_output::NAME, stream_output::schema()?, db.clone(), output, max_restarts),
        ])
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn paths(&self) -> &UserDataPaths {
        &self.paths
    }

    pub fn heap(&self) -> &Arc<WeakHeap> {
        &self.heap
    }

    pub fn db(&self) -> &BackendDb {
        &self.db
    }

    pub fn reemit_signal(&self) -> &ReemitSignal {
        &self.reemit
    }

    /// Input of the detector. Extra producers may write here with their own
    /// [`ProducerId`].
    pub fn source_connection(&self) -> &Connection {
        &self.links.sources
    }

    /// Hosts in pipeline order.
    pub fn hosts(&self) -> &[StageHost] {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Option<&StageHost> {
        self.hosts.iter().find(|h| h.name() == name)
    }

    pub fn host_mut(&mut self, name: &str) -> Option<&mut StageHost> {
        self.hosts.iter_mut().find(|h| h.name() == name)
    }

    pub fn all_started(&self) -> bool {
        self.hosts.iter().all(StageHost::is_started)
    }

    pub fn all_stopped(&self) -> bool {
        self.hosts.iter().all(StageHost::is_stopped)
    }

    /// One pass of the supervising loop. Never blocks on stage work.
    pub fn process_messages(&mut self) {
        self.db.process_pending();
        for host in &mut self.hosts {
            host.process_messages();
        }
        self.reemit.deliver();
    }

    /// Start every stage that was running when the app last shut down.
    pub fn initialize(&mut self) -> Result<()> {
        for host in &mut self.hosts {
            host.restore_on_off_state()?;
        }
        Ok(())
    }

    /// Stop every stage, remembering which ones were running, and write the
    /// state database out. Blocks until all stages report stopped.
    pub fn finalize(&mut self) -> Result<()> {
        tracing::info!("Stopping all stages");
        for i in 0..self.hosts.len() {
            while self.hosts[i].status().is_transient() {
                self.pump_once();
            }
            self.hosts[i].save_on_off_state();
            self.hosts[i].stop();
        }
        while !self.all_stopped() {
            self.pump_once();
        }
        self.db.finish_pending_jobs()
    }

    /// Drop all persisted stage settings. Running stages keep their
    /// current values until restarted.
    pub fn clear_backend_db(&self) {
        tracing::info!("Clearing stage settings");
        self.db.clear();
    }

    /// Stop everything, rebuild the stages and start them again.
    pub fn reinitialize(&mut self) -> Result<()> {
        self.finalize()?;
        self.rebuild()?;
        self.initialize()
    }

    /// Like [`LiveApp::reinitialize`], but every stage comes back with
    /// default settings.
    pub fn reset_settings(&mut self) -> Result<()> {
        self.finalize()?;
        self.clear_backend_db();
        self.rebuild()?;
        self.initialize()
    }

    fn rebuild(&mut self) -> Result<()> {
        self.hosts.clear();
        self.links = Links::new();
        self.hosts = self.build_hosts()?;
        Ok(())
    }

    fn pump_once(&mut self) {
        self.process_messages();
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl std::fmt::Debug for LiveApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveApp")
            .field("root", &self.paths.root())
            .field("hosts", &self.hosts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StageStatus;
    use crate::stages::models::CollectingSink;
    use std::time::Instant;
    use tempfile::TempDir;

    fn test_config() -> AppConfig {
        AppConfig {
            heap_size_mb: 64,
            read_timeout_ms: 1,
            db_flush_interval_ms: 10,
            ..AppConfig::default()
        }
    }

    fn pump_until(app: &mut LiveApp, timeout: Duration, mut done: impl FnMut(&LiveApp) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            app.process_messages();
            if done(app) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_hosts_in_pipeline_order() {
        let dir = TempDir::new().unwrap();
        let app = LiveApp::new(test_config(), UserDataPaths::new(dir.path()), StageModels::builtin()).unwrap();
        let names: Vec<&str> = app.hosts().iter().map(StageHost::name).collect();
        assert_eq!(
            names,
            vec![
                camera_source::NAME,
                face_detector::NAME,
                face_marker::NAME,
                face_aligner::NAME,
                face_modifier::NAME,
                stream_output::NAME
            ]
        );
        assert!(app.all_stopped());
        assert!(dir.path().join("output_sequence").is_dir());
    }

    #[test]
    fn test_initialize_runs_frames_to_the_sink() {
        let dir = TempDir::new().unwrap();
        let sink = CollectingSink::new();
        let shared = sink.clone();
        let models = StageModels::builtin().with_sink(move || shared.clone());
        let mut app = LiveApp::new(test_config(), UserDataPaths::new(dir.path()), models).unwrap();

        app.initialize().unwrap();
        assert!(pump_until(&mut app, Duration::from_secs(10), |a| a.all_started()));
        assert!(pump_until(&mut app, Duration::from_secs(10), |_| sink.len() >= 3));

        app.finalize().unwrap();
        assert!(app.all_stopped());
        assert_eq!(app.db().get::<bool>("CameraSource:on_off"), Some(true));
    }

    #[test]
    fn test_stopped_stage_stays_stopped_after_reinitialize() {
        let dir = TempDir::new().unwrap();
        let mut app = LiveApp::new(test_config(), UserDataPaths::new(dir.path()), StageModels::builtin()).unwrap();
        app.initialize().unwrap();
        assert!(pump_until(&mut app, Duration::from_secs(10), |a| a.all_started()));

        app.host_mut(face_modifier::NAME).unwrap().stop();
        assert!(pump_until(&mut app, Duration::from_secs(10), |a| {
            a.host(face_modifier::NAME).is_some_and(StageHost::is_stopped)
        }));

        app.reinitialize().unwrap();
        assert!(pump_until(&mut app, Duration::from_secs(10), |a| {
            a.host(face_aligner::NAME).is_some_and(StageHost::is_started)
        }));
        assert_eq!(
            app.host(face_modifier::NAME).map(StageHost::status),
            Some(StageStatus::Stopped)
        );
        app.finalize().unwrap();
    }

    #[test]
    fn test_reset_settings_restores_defaults() {
        let dir = TempDir::new().unwrap();
        let mut app = LiveApp::new(test_config(), UserDataPaths::new(dir.path()), StageModels::builtin()).unwrap();
        app.initialize().unwrap();
        assert!(pump_until(&mut app, Duration::from_secs(10), |a| a.all_started()));

        app.host_mut(face_detector::NAME)
            .unwrap()
            .sheet_mut()
            .set_number("threshold", 0.9)
            .unwrap();
        assert!(pump_until(&mut app, Duration::from_secs(10), |a| {
            a.host(face_detector::NAME).and_then(|h| h.sheet().number("threshold")) == Some(0.9)
        }));

        app.reset_settings().unwrap();
        assert!(pump_until(&mut app, Duration::from_secs(10), |a| a.all_started()));
        let threshold = app.host(face_detector::NAME).and_then(|h| h.sheet().number("threshold"));
        assert_eq!(threshold, Some(0.5));
        app.finalize().unwrap();
    }
}
