// ========================================================================================
//
//                         THE LD BATCH PIPELINE: WINDOW -> WORKERS -> WRITER
//
// ========================================================================================
//
// One genotype stream is wrapped in a sliding window and drained by a fixed pool of OS
// threads. Each worker computes the LD block of the record it was handed against every
// buffered neighbour within `max_distance` and sends it over a bounded channel to a single
// writer thread, the only owner of the `LdMatrixWriter`.

use crate::config::LdSettings;
use crate::container::VariantGenotypes;
use crate::registry::{RegistryError, VariantRegistry};
use crate::window::{
    BufferedGenotypeWindow, GenotypeRecord, GenotypeStream, RecordFilter, StreamError,
    WindowError, WindowSettings,
};
use ahash::AHashSet;
use crate::writer::{LdMatrixSummary, LdMatrixWriter};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use std::error::Error;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Variance below this is treated as a monomorphic site.
const MIN_VARIANCE: f64 = 1e-12;

/// A clonable error so the first failure of any thread can be stored once and handed back
/// to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    Config(String),
    Window(String),
    Compute(String),
    Writer(String),
    Io(String),
    Panicked(String),
    /// A task stopped because a sibling failed or the group was cancelled.
    Cancelled,
    /// The run exceeded its wall-clock budget. Running threads are asked to stop but are
    /// not killed.
    Timeout(Duration),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "Invalid settings: {e}"),
            PipelineError::Window(e) => write!(f, "Genotype window error: {e}"),
            PipelineError::Compute(e) => write!(f, "Computation error: {e}"),
            PipelineError::Writer(e) => write!(f, "LD matrix writer error: {e}"),
            PipelineError::Io(e) => write!(f, "I/O error: {e}"),
            PipelineError::Panicked(name) => write!(f, "Thread '{name}' panicked"),
            PipelineError::Cancelled => write!(f, "The run was cancelled"),
            PipelineError::Timeout(budget) => {
                write!(f, "The run did not finish within {budget:?}")
            }
        }
    }
}
impl Error for PipelineError {}

impl From<WindowError> for PipelineError {
    fn from(e: WindowError) -> Self {
        PipelineError::Window(e.to_string())
    }
}

impl From<RegistryError> for PipelineError {
    fn from(e: RegistryError) -> Self {
        PipelineError::Compute(e.to_string())
    }
}

// ========================================================================================
//                                 Structured task group
// ========================================================================================

/// A shared stop flag. Cancelling is cooperative: tasks check it between records.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A group of named OS threads sharing one [`CancellationToken`]. The first task to fail
/// cancels its siblings and its error is what [`TaskGroup::join`] reports.
#[derive(Debug)]
pub struct TaskGroup {
    token: CancellationToken,
    first_error: Arc<Mutex<Option<PipelineError>>>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            token: CancellationToken::new(),
            first_error: Arc::new(Mutex::new(None)),
            done_tx,
            done_rx,
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&CancellationToken) -> Result<(), PipelineError> + Send + 'static,
    {
        let name = name.into();
        let completion = Completion {
            name: name.clone(),
            token: self.token.clone(),
            first_error: Arc::clone(&self.first_error),
            done: self.done_tx.clone(),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = task(&completion.token) {
                    completion.fail(e);
                }
            })
            .map_err(|e| PipelineError::Io(format!("failed to spawn thread {name}: {e}")))?;
        self.handles.push(handle);
        Ok(())
    }

    /// Waits until every task has finished or `timeout` has elapsed. On timeout the group
    /// is cancelled and `PipelineError::Timeout` returned while stragglers wind down on
    /// their own.
    pub fn join(self, timeout: Duration) -> Result<(), PipelineError> {
        let Self {
            token,
            first_error,
            done_tx,
            done_rx,
            handles,
        } = self;
        drop(done_tx);

        let deadline = Instant::now().checked_add(timeout);
        let mut finished = 0usize;
        while finished < handles.len() {
            let outcome = match deadline {
                Some(deadline) => done_rx.recv_deadline(deadline),
                None => done_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match outcome {
                Ok(()) => finished += 1,
                Err(RecvTimeoutError::Timeout) => {
                    token.cancel();
                    warn!(
                        "{} of {} threads still running after {timeout:?}; cancelling",
                        handles.len() - finished,
                        handles.len()
                    );
                    return Err(PipelineError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                record_error(&first_error, PipelineError::Panicked(name));
            }
        }
        let error = first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// Signals completion even when the task unwinds.
struct Completion {
    name: String,
    token: CancellationToken,
    first_error: Arc<Mutex<Option<PipelineError>>>,
    done: Sender<()>,
}

impl Completion {
    fn fail(&self, error: PipelineError) {
        if error != PipelineError::Cancelled {
            debug!("Task {} failed: {error}", self.name);
        }
        record_error(&self.first_error, error);
        self.token.cancel();
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if thread::panicking() {
            self.fail(PipelineError::Panicked(self.name.clone()));
        }
        let _ = self.done.send(());
    }
}

/// Keeps the first real failure. A `Cancelled` placeholder gives way to the error that
/// caused the cancellation.
fn record_error(slot: &Mutex<Option<PipelineError>>, error: PipelineError) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    let replace = match slot.as_ref() {
        None => true,
        Some(PipelineError::Cancelled) => error != PipelineError::Cancelled,
        Some(_) => false,
    };
    if replace {
        *slot = Some(error);
    }
}

// ========================================================================================
//                                  LD computation
// ========================================================================================

/// A record carrying per-sample dosages. Missing samples are `NaN`.
pub trait DosageRecord: GenotypeRecord {
    fn dosages(&self) -> &[f32];

    fn alias(&self) -> Option<&str> {
        None
    }

    fn minor_allele_frequency(&self) -> Option<f64>;
}

impl DosageRecord for VariantGenotypes {
    fn dosages(&self) -> &[f32] {
        &self.dosages
    }

    fn alias(&self) -> Option<&str> {
        self.info.alias.as_deref()
    }

    fn minor_allele_frequency(&self) -> Option<f64> {
        VariantGenotypes::minor_allele_frequency(self)
    }
}

/// Squared Pearson correlation over the samples observed in both variants. `None` when
/// fewer than two samples overlap or either variant is constant over them.
pub fn r_squared(x: &[f32], y: &[f32]) -> Option<f64> {
    let (mut n, mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0f64, 0.0, 0.0, 0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        if a.is_nan() || b.is_nan() {
            continue;
        }
        let (a, b) = (f64::from(a), f64::from(b));
        n += 1.0;
        sx += a;
        sy += b;
        sxx += a * a;
        syy += b * b;
        sxy += a * b;
    }
    if n < 2.0 {
        return None;
    }
    let var_x = sxx - sx * sx / n;
    let var_y = syy - sy * sy / n;
    if var_x <= MIN_VARIANCE * n || var_y <= MIN_VARIANCE * n {
        return None;
    }
    let cov = sxy - sx * sy / n;
    Some((cov * cov / (var_x * var_y)).clamp(0.0, 1.0))
}

/// Passes each variant id through once. Later records reusing an id (placeholder ids
/// such as ".", split multi-allelic sites) are dropped, since the matrix is keyed by id.
struct UniqueIds<S> {
    inner: S,
    seen: AHashSet<String>,
    skipped: usize,
}

impl<S> UniqueIds<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            seen: AHashSet::new(),
            skipped: 0,
        }
    }
}

impl<S: GenotypeStream> GenotypeStream for UniqueIds<S> {
    type Record = S::Record;

    fn next_record(&mut self) -> Result<Option<S::Record>, StreamError> {
        while let Some(record) = self.inner.next_record()? {
            if self.seen.insert(record.variant_id().to_string()) {
                return Ok(Some(record));
            }
            if self.skipped == 0 {
                warn!(
                    "Variant id {} occurs more than once (again at {}:{}); keeping only the first record of each id",
                    record.variant_id(),
                    record.contig(),
                    record.position()
                );
            } else {
                debug!(
                    "Skipping duplicate variant id {} at {}:{}",
                    record.variant_id(),
                    record.contig(),
                    record.position()
                );
            }
            self.skipped += 1;
        }
        Ok(None)
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    fn record_count(&self) -> usize {
        self.inner.record_count().saturating_sub(self.skipped)
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if self.skipped > 0 {
            warn!("Skipped {} records with duplicate variant ids", self.skipped);
        }
        self.inner.close()
    }
}

#[derive(Debug)]
struct LdBlock {
    source: u32,
    partners: Vec<u32>,
    r2: Vec<f64>,
}

/// Totals of one [`compute_ld_matrix`] run.
#[derive(Debug, Clone)]
pub struct LdRunSummary {
    pub variants: usize,
    pub blocks: usize,
    pub pairs: u64,
    pub elapsed: Duration,
    pub matrix: LdMatrixSummary,
}

#[derive(Debug)]
struct WriterOutcome {
    blocks: usize,
    pairs: u64,
    matrix: LdMatrixSummary,
}

fn create_progress_bar(len: Option<u64>, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(len, draw_target);
    let template = if len.is_some() {
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}"
    } else {
        "\n> [{elapsed_precise}] {spinner} {pos} variants {msg}"
    };
    pb.set_style(
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());
    pb
}

/// Computes the LD matrix of every record of `stream` against its neighbours within
/// `settings.max_distance` and writes it to `destination`.
///
/// The matrix file is closed (footer and header written) once the writer thread has
/// drained the channel, also when a worker fails. A timeout returns before that point.
pub fn compute_ld_matrix<S>(
    stream: S,
    destination: &Path,
    settings: &LdSettings,
) -> Result<LdRunSummary, PipelineError>
where
    S: GenotypeStream + 'static,
    S::Record: DosageRecord + 'static,
{
    settings
        .validate()
        .map_err(|e| PipelineError::Config(e.to_string()))?;
    let started = Instant::now();
    info!(
        "Computing LD within {} bp (r² >= {}) on {} threads into {}",
        settings.max_distance,
        settings.min_r2,
        settings.threads,
        destination.display()
    );

    let progress = create_progress_bar(stream.len_hint().map(|n| n as u64), "Computing LD...");
    let stream = UniqueIds::new(stream);
    let window_settings = WindowSettings::new(settings.max_distance, settings.max_distance)
        .with_loading_factor(settings.loading_factor)
        .with_batch_size(settings.batch_size);
    let window = if settings.min_allele_frequency > 0.0 {
        let min_maf = settings.min_allele_frequency;
        let filter: RecordFilter<S::Record> = Box::new(move |record: &S::Record| {
            record
                .minor_allele_frequency()
                .is_some_and(|maf| maf >= min_maf)
        });
        BufferedGenotypeWindow::with_filter(stream, window_settings, filter)
    } else {
        BufferedGenotypeWindow::new(stream, window_settings)
    }?;
    let window = Arc::new(window);

    let registry = Arc::new(VariantRegistry::new());
    let writer = LdMatrixWriter::create(destination, Arc::clone(&registry))
        .map_err(|e| PipelineError::Writer(e.to_string()))?;

    let (block_tx, block_rx) = bounded::<LdBlock>(settings.channel_bound.max(1));
    let (outcome_tx, outcome_rx) = bounded::<WriterOutcome>(1);

    let mut group = TaskGroup::new();
    group.spawn("ld-writer", move |_| {
        write_blocks(writer, block_rx, &outcome_tx)
    })?;
    for worker in 0..settings.threads {
        let window = Arc::clone(&window);
        let registry = Arc::clone(&registry);
        let block_tx = block_tx.clone();
        let progress = progress.clone();
        let max_distance = settings.max_distance;
        let min_r2 = settings.min_r2;
        group.spawn(format!("ld-worker-{worker}"), move |token| {
            compute_blocks(
                &window,
                &registry,
                &block_tx,
                token,
                &progress,
                max_distance,
                min_r2,
            )
        })?;
    }
    drop(block_tx);

    let joined = group.join(settings.timeout());
    if !matches!(joined, Err(PipelineError::Timeout(_))) {
        if let Err(e) = window.close() {
            warn!("Failed to close the genotype stream: {e}");
        }
    }
    if let Err(e) = joined {
        progress.abandon_with_message("LD computation failed");
        return Err(e);
    }

    let outcome = outcome_rx
        .try_recv()
        .map_err(|_| PipelineError::Writer("the writer thread reported no result".to_string()))?;
    progress.finish_with_message("LD computation complete.");

    let summary = LdRunSummary {
        variants: window.delivered(),
        blocks: outcome.blocks,
        pairs: outcome.pairs,
        elapsed: started.elapsed(),
        matrix: outcome.matrix,
    };
    info!(
        "LD matrix {} holds {} blocks and {} pairs over {} variants ({:.2?})",
        summary.matrix.path.display(),
        summary.blocks,
        summary.pairs,
        summary.variants,
        summary.elapsed
    );
    Ok(summary)
}

fn compute_blocks<S>(
    window: &BufferedGenotypeWindow<S>,
    registry: &VariantRegistry,
    block_tx: &Sender<LdBlock>,
    token: &CancellationToken,
    progress: &ProgressBar,
    max_distance: u32,
    min_r2: f64,
) -> Result<(), PipelineError>
where
    S: GenotypeStream,
    S::Record: DosageRecord,
{
    while !token.is_cancelled() {
        let Some(item) = window.next()? else {
            return Ok(());
        };
        window.release_contigs_before(item.contig());
        let position = item.position();
        let neighbours = window.records_in_range(
            item.contig(),
            position.saturating_sub(max_distance),
            position.saturating_add(max_distance),
        )?;

        let source = registry.ordinal(item.variant_id(), item.alias())?;
        let mut partners = Vec::new();
        let mut r2 = Vec::new();
        for neighbour in &neighbours {
            if Arc::ptr_eq(neighbour, item.record()) {
                continue;
            }
            let Some(value) = r_squared(item.dosages(), neighbour.dosages()) else {
                continue;
            };
            if value >= min_r2 {
                partners.push(registry.ordinal(neighbour.variant_id(), neighbour.alias())?);
                r2.push(value);
            }
        }
        drop(item);

        block_tx
            .send(LdBlock {
                source,
                partners,
                r2,
            })
            .map_err(|_| PipelineError::Cancelled)?;
        progress.inc(1);
    }
    Err(PipelineError::Cancelled)
}

fn write_blocks(
    mut writer: LdMatrixWriter,
    block_rx: Receiver<LdBlock>,
    outcome_tx: &Sender<WriterOutcome>,
) -> Result<(), PipelineError> {
    let mut blocks = 0usize;
    let mut pairs = 0u64;
    let mut failure = None;
    for block in block_rx.iter() {
        match writer.add_block(block.source, &block.partners, &block.r2) {
            Ok(true) => {
                blocks += 1;
                pairs += block.partners.len() as u64;
            }
            Ok(false) => {}
            Err(e) => {
                failure = Some(PipelineError::Writer(e.to_string()));
                break;
            }
        }
    }
    drop(block_rx);

    let closed = writer.close();
    if let Some(failure) = failure {
        return Err(failure);
    }
    let matrix = closed.map_err(|e| PipelineError::Writer(e.to_string()))?;
    outcome_tx
        .send(WriterOutcome {
            blocks,
            pairs,
            matrix,
        })
        .map_err(|_| PipelineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::LdMatrixReader;
    use crate::window::{StreamError, VecStream};
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    #[derive(Debug)]
    struct Dosages {
        contig: String,
        position: u32,
        id: String,
        values: Vec<f32>,
    }

    impl Dosages {
        fn new(id: &str, position: u32, values: &[f32]) -> Self {
            Self {
                contig: "1".to_string(),
                position,
                id: id.to_string(),
                values: values.to_vec(),
            }
        }

        fn on_contig(mut self, contig: &str) -> Self {
            self.contig = contig.to_string();
            self
        }
    }

    impl GenotypeRecord for Dosages {
        fn contig(&self) -> &str {
            &self.contig
        }

        fn position(&self) -> u32 {
            self.position
        }

        fn variant_id(&self) -> &str {
            &self.id
        }
    }

    impl DosageRecord for Dosages {
        fn dosages(&self) -> &[f32] {
            &self.values
        }

        fn minor_allele_frequency(&self) -> Option<f64> {
            let observed: Vec<f64> = self
                .values
                .iter()
                .filter(|v| !v.is_nan())
                .map(|&v| f64::from(v))
                .collect();
            if observed.is_empty() {
                return None;
            }
            let frequency = observed.iter().sum::<f64>() / (2.0 * observed.len() as f64);
            Some(frequency.min(1.0 - frequency))
        }
    }

    fn settings(threads: usize) -> LdSettings {
        LdSettings {
            max_distance: 1_000,
            min_r2: 0.05,
            threads,
            ..LdSettings::default()
        }
    }

    #[test]
    fn r_squared_handles_sign_and_missing_samples() {
        let x = [0.0, 1.0, 2.0, 1.0];
        assert_abs_diff_eq!(r_squared(&x, &x).unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            r_squared(&x, &[2.0, 1.0, 0.0, 1.0]).unwrap(),
            1.0,
            epsilon = 1e-12
        );
        // The NaN sample is dropped from both vectors.
        assert_abs_diff_eq!(
            r_squared(&[0.0, 1.0, 2.0, 5.0], &[0.0, 1.0, 2.0, f32::NAN]).unwrap(),
            1.0,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            r_squared(&[0.0, 0.0, 1.0, 1.0], &[0.0, 1.0, 0.0, 1.0]).unwrap(),
            0.0,
            epsilon = 1e-12
        );
        assert!(r_squared(&[1.0, 1.0, 1.0], &[0.0, 1.0, 2.0]).is_none());
        assert!(r_squared(&[1.0], &[2.0]).is_none());
    }

    #[test]
    fn neighbours_within_distance_are_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chr1.tld");
        let stream = VecStream::new([
            Dosages::new("a", 100, &[0.0, 1.0, 2.0, 1.0]),
            Dosages::new("b", 600, &[2.0, 1.0, 0.0, 1.0]),
            Dosages::new("c", 900, &[0.0, 0.0, 1.0, 1.0]),
            Dosages::new("far", 50_000, &[0.0, 1.0, 2.0, 1.0]),
        ]);

        let summary = compute_ld_matrix(stream, &path, &settings(3)).unwrap();
        assert_eq!(summary.variants, 4);

        let reader = LdMatrixReader::open(&path).unwrap();
        let a = reader.get_r2("a").unwrap().unwrap();
        assert_abs_diff_eq!(a["b"], 1.0, epsilon = 1e-9);
        assert!(a.contains_key("c"));
        assert!(!a.contains_key("far"));
        let c = reader.get_r2("c").unwrap().unwrap();
        assert_abs_diff_eq!(c["a"], a["c"], epsilon = 1e-12);
        assert!(reader.variant_ids().iter().any(|id| id == "far"));
        assert!(!reader.contains("far"));
        assert!(reader.get_r2("far").unwrap().is_none());
        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.pairs, 6);
    }

    #[test]
    fn allele_frequency_filter_drops_rare_variants() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("maf.tld");
        let stream = VecStream::new([
            Dosages::new("common", 10, &[0.0, 1.0, 2.0, 1.0]),
            Dosages::new("rare", 20, &[0.0, 0.0, 0.0, 1.0]),
            Dosages::new("common2", 30, &[0.0, 1.0, 2.0, 2.0]),
        ]);
        let settings = LdSettings {
            min_allele_frequency: 0.2,
            ..settings(2)
        };

        compute_ld_matrix(stream, &path, &settings).unwrap();
        let reader = LdMatrixReader::open(&path).unwrap();
        assert!(!reader.variant_ids().iter().any(|id| id == "rare"));
        assert!(reader.get_r2("common").unwrap().unwrap().contains_key("common2"));
    }

    #[test]
    fn repeated_variant_ids_keep_the_first_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.tld");
        let stream = VecStream::new([
            Dosages::new("rs1", 10, &[0.0, 1.0, 2.0, 1.0]),
            Dosages::new(".", 20, &[2.0, 1.0, 0.0, 1.0]),
            Dosages::new(".", 30, &[0.0, 0.0, 1.0, 1.0]),
            Dosages::new("rs4", 40, &[1.0, 2.0, 0.0, 0.0]),
        ]);
        let settings = LdSettings {
            max_distance: 100,
            min_r2: 0.0,
            ..settings(2)
        };

        let summary = compute_ld_matrix(stream, &path, &settings).unwrap();
        assert_eq!(summary.variants, 3);
        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.pairs, 6);

        let reader = LdMatrixReader::open(&path).unwrap();
        let rs1 = reader.get_r2("rs1").unwrap().unwrap();
        assert_eq!(rs1.len(), 2);
        // The first "." mirrors rs1 exactly; the second would not.
        assert_abs_diff_eq!(rs1["."], 1.0, epsilon = 1e-9);
        let placeholder = reader.get_r2(".").unwrap().unwrap();
        assert!(!placeholder.contains_key("."));
        assert_eq!(placeholder.len(), 2);
    }

    #[test]
    fn pairs_never_cross_contigs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genome.tld");
        let n = 50u32;
        // Every contig carries the same positions and dosages.
        let records = ["1", "2", "3"].into_iter().flat_map(|contig| {
            (1..=n).map(move |i| {
                let values: Vec<f32> = (0..6u32).map(|j| ((i + j * j) % 3) as f32).collect();
                Dosages::new(&format!("{contig}:{i}"), i * 100, &values).on_contig(contig)
            })
        });
        let settings = LdSettings {
            max_distance: 1_000,
            min_r2: 0.0,
            batch_size: 4,
            ..settings(3)
        };

        let summary = compute_ld_matrix(VecStream::new(records), &path, &settings).unwrap();
        assert_eq!(summary.variants, 150);
        assert_eq!(summary.blocks, 150);
        // Ten neighbours on each side, fewer near the contig ends.
        assert_eq!(summary.pairs, 3 * 2 * (1..=10).map(|d| u64::from(n - d)).sum::<u64>());

        let reader = LdMatrixReader::open(&path).unwrap();
        for contig in ["1", "2", "3"] {
            for i in 1..=n {
                let partners = reader.get_r2(&format!("{contig}:{i}")).unwrap().unwrap();
                let expected = (i - 1).min(10) + (n - i).min(10);
                assert_eq!(partners.len(), expected as usize);
                let prefix = format!("{contig}:");
                assert!(partners.keys().all(|id| id.starts_with(&prefix)));
            }
        }
    }

    struct FailingStream {
        inner: VecStream<Dosages>,
        fail_after: usize,
    }

    impl GenotypeStream for FailingStream {
        type Record = Dosages;

        fn next_record(&mut self) -> Result<Option<Dosages>, StreamError> {
            if self.inner.record_count() == self.fail_after {
                return Err(StreamError::Malformed {
                    source_name: "failing".to_string(),
                    index: self.fail_after,
                    message: "corrupt record".to_string(),
                });
            }
            self.inner.next_record()
        }

        fn is_finished(&self) -> bool {
            self.inner.is_finished()
        }

        fn record_count(&self) -> usize {
            self.inner.record_count()
        }

        fn close(&mut self) -> Result<(), StreamError> {
            self.inner.close()
        }
    }

    #[test]
    fn stream_failure_is_reported_and_matrix_still_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failed.tld");
        let records = (0..50).map(|i| Dosages::new(&format!("v{i}"), i * 10, &[0.0, 1.0, 2.0]));
        let stream = FailingStream {
            inner: VecStream::new(records),
            fail_after: 20,
        };
        let settings = LdSettings {
            batch_size: 4,
            ..settings(4)
        };

        let error = compute_ld_matrix(stream, &path, &settings).unwrap_err();
        assert!(matches!(error, PipelineError::Window(ref m) if m.contains("corrupt record")));
        assert!(LdMatrixReader::open(&path).is_ok());
    }

    #[test]
    fn first_failure_cancels_siblings() {
        let mut group = TaskGroup::new();
        group
            .spawn("failing", |_| Err(PipelineError::Compute("boom".to_string())))
            .unwrap();
        for i in 0..3 {
            group
                .spawn(format!("looping-{i}"), |token| {
                    while !token.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(PipelineError::Cancelled)
                })
                .unwrap();
        }
        assert_eq!(group.len(), 4);
        assert_eq!(
            group.join(Duration::from_secs(30)),
            Err(PipelineError::Compute("boom".to_string()))
        );
    }

    #[test]
    fn panicking_task_is_reported() {
        let mut group = TaskGroup::new();
        group
            .spawn("panicking", |_| -> Result<(), PipelineError> { panic!("worker bug") })
            .unwrap();
        assert_eq!(
            group.join(Duration::from_secs(30)),
            Err(PipelineError::Panicked("panicking".to_string()))
        );
    }

    #[test]
    fn join_times_out_without_waiting_for_stragglers() {
        let mut group = TaskGroup::new();
        let token = group.token().clone();
        group
            .spawn("slow", |token| {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
            .unwrap();

        let started = Instant::now();
        assert_eq!(
            group.join(Duration::from_millis(50)),
            Err(PipelineError::Timeout(Duration::from_millis(50)))
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(token.is_cancelled());
    }
}
