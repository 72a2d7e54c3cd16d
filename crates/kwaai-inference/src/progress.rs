//! Progress reporting (spec §6, §9): a `ProgressEvent` stream surfaced to
//! callers during `load()`, plus the progress-adapter decorator pattern —
//! a bound closure that wraps a shard-load function so a fixed
//! percentage range can be reported without threading progress state
//! through every call site.

/// Named phase a `load()` is currently in (spec §4.9 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Init,
    ParseManifest,
    IntegrityCheck,
    BuildTensorIndex,
    LoadEmbeddings,
    LoadLayers,
    LoadFinalWeights,
    Complete,
}

impl ProgressStage {
    /// The `[start, end]` percentage range this stage owns (spec §4.9:
    /// manifest 0-5%, embeddings preamble to 10%, shards within a phase
    /// 10-80%, layers 80-85%, final weights 85-100%).
    pub fn range(self) -> (f32, f32) {
        match self {
            ProgressStage::Init => (0.0, 0.0),
            ProgressStage::ParseManifest => (0.0, 5.0),
            ProgressStage::IntegrityCheck => (5.0, 8.0),
            ProgressStage::BuildTensorIndex => (8.0, 10.0),
            ProgressStage::LoadEmbeddings => (10.0, 80.0),
            ProgressStage::LoadLayers => (80.0, 85.0),
            ProgressStage::LoadFinalWeights => (85.0, 100.0),
            ProgressStage::Complete => (100.0, 100.0),
        }
    }
}

/// One progress update.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    /// Overall percentage, 0.0-100.0.
    pub percent: f32,
    pub message: Option<String>,
}

/// Callback signature a `load()` caller supplies (spec §6 external
/// interfaces: `onProgress`).
pub type ProgressCallback<'a> = dyn Fn(ProgressEvent) + Send + Sync + 'a;

/// Reports progress within a stage's fixed percentage range, linearly
/// interpolating `completed / total` into `[start, end]`. Bound once per
/// stage and handed to the loop that drives that stage's work (spec §9
/// "progress adapter as a bound closure").
pub struct ProgressReporter<'a> {
    callback: &'a ProgressCallback<'a>,
    stage: ProgressStage,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(callback: &'a ProgressCallback<'a>, stage: ProgressStage) -> Self {
        Self { callback, stage }
    }

    /// Report the stage as fully done, without interpolation (used for
    /// stages whose range is a single point, e.g. `BuildTensorIndex`).
    pub fn done(&self, message: impl Into<String>) {
        let (_, end) = self.stage.range();
        (self.callback)(ProgressEvent {
            stage: self.stage,
            percent: end,
            message: Some(message.into()),
        });
    }

    /// Report fractional progress (`completed` of `total` units) within
    /// this stage's range.
    pub fn fraction(&self, completed: usize, total: usize) {
        let (start, end) = self.stage.range();
        let fraction = if total == 0 { 1.0 } else { completed as f32 / total as f32 };
        let percent = start + (end - start) * fraction.clamp(0.0, 1.0);
        (self.callback)(ProgressEvent {
            stage: self.stage,
            percent,
            message: None,
        });
    }

    /// Wrap an async shard-loading closure so every call also reports
    /// fractional progress against `total` — the "progress adapter"
    /// decorator (spec §9), letting `LoadLayers` report 10-80% across
    /// however many shard reads the layer loop performs without each call
    /// site computing the percentage itself.
    pub fn decorate<F, Fut, T>(&'a self, total: usize, f: F) -> impl Fn(usize) -> Fut + 'a
    where
        F: Fn(usize) -> Fut + 'a,
        Fut: std::future::Future<Output = T> + 'a,
    {
        move |index: usize| {
            self.fraction(index, total);
            f(index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fraction_interpolates_within_stage_range() {
        let events = Mutex::new(Vec::new());
        let callback: &ProgressCallback = &|e: ProgressEvent| events.lock().unwrap().push(e.percent);
        let reporter = ProgressReporter::new(callback, ProgressStage::LoadLayers);
        reporter.fraction(0, 10);
        reporter.fraction(5, 10);
        reporter.fraction(10, 10);
        let recorded = events.into_inner().unwrap();
        assert_eq!(recorded, vec![80.0, 82.5, 85.0]);
    }

    #[test]
    fn zero_total_reports_end_of_range() {
        let events = Mutex::new(Vec::new());
        let callback: &ProgressCallback = &|e: ProgressEvent| events.lock().unwrap().push(e.percent);
        let reporter = ProgressReporter::new(callback, ProgressStage::ParseManifest);
        reporter.fraction(0, 0);
        assert_eq!(events.into_inner().unwrap(), vec![5.0]);
    }

    #[tokio::test]
    async fn decorate_reports_progress_around_wrapped_call() {
        let events = Mutex::new(Vec::new());
        let callback: &ProgressCallback = &|e: ProgressEvent| events.lock().unwrap().push(e.percent);
        let reporter = ProgressReporter::new(callback, ProgressStage::LoadLayers);
        let load_shard = |index: usize| async move { index * 2 };
        let wrapped = reporter.decorate(4, load_shard);
        let result = wrapped(2).await;
        assert_eq!(result, 4);
        assert_eq!(events.into_inner().unwrap(), vec![82.5]);
    }
}
