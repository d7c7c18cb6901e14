//! Stage workers and factories with scripted behaviour

use facefilter_live::backend::{StageContext, StageWorker, WorkerFactory};
use facefilter_live::control::{NumberConfig, SheetSchema};
use facefilter_live::error::{LiveError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One `gain` number field, 0..10, default 1.
pub fn gain_schema() -> SheetSchema {
    SheetSchema::builder()
        .number("gain", NumberConfig::new(0.0, 10.0, 0.5), 1.0)
        .build()
        .expect("valid schema")
}

/// Worker that idles; panics on the next tick once `crash` is set.
pub struct IdleWorker {
    crash: Arc<AtomicBool>,
}

impl StageWorker for IdleWorker {
    fn on_start(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut StageContext<'_>) {
        if self.crash.swap(false, Ordering::SeqCst) {
            panic!("scripted crash");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Factory of [`IdleWorker`]s sharing one crash switch. Counts builds.
pub fn idle_factory(crash: Arc<AtomicBool>, builds: Arc<AtomicUsize>) -> WorkerFactory {
    Box::new(move || {
        builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(IdleWorker { crash: crash.clone() }) as Box<dyn StageWorker>)
    })
}

/// Worker whose start always fails.
pub struct FailingWorker;

impl StageWorker for FailingWorker {
    fn on_start(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
        Err(LiveError::stage("Failing", "model file missing"))
    }

    fn on_tick(&mut self, _ctx: &mut StageContext<'_>) {}
}

pub fn failing_factory() -> WorkerFactory {
    Box::new(|| Ok(Box::new(FailingWorker) as Box<dyn StageWorker>))
}
