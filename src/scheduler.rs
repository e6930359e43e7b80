use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use crossbeam_channel::tick;
use tracing::{error, info, warn};

use crate::{
    drive::DriveClient,
    executor::Executor,
    filter::PathFilter,
    reconcile::{plan_cross, plan_local_changes, plan_refresh},
    replica::SharedReplica,
    scanner::{ScanError, check_remote, scan_local, scan_remote},
    snapshot::SnapshotWriter,
    watcher::{Debouncer, LocalWatcher},
};

const TICK: Duration = Duration::from_secs(1);
const MAX_AUTH_FAILURES: u32 = 3;

/// Exponential backoff applied to refresh scheduling after an
/// integrity-gate failure: 2x the interval on the first failure,
/// doubling up to 8x, reset by the next good refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshBackoff {
    multiplier: u32,
}

impl RefreshBackoff {
    pub fn new() -> Self {
        Self { multiplier: 1 }
    }

    pub fn note_failure(&mut self) {
        self.multiplier = (self.multiplier * 2).clamp(2, 8);
    }

    pub fn reset(&mut self) {
        self.multiplier = 1;
    }

    pub fn delay(&self, interval: Duration) -> Duration {
        interval * self.multiplier
    }

    pub fn is_backing_off(&self) -> bool {
        self.multiplier > 1
    }
}

pub struct SchedulerConfig {
    pub check_period: Duration,
    pub refresh_period: Duration,
    pub debounce: Duration,
    pub max_workers: usize,
}

/// Drives the three periodic jobs: the per-tick watcher drain, the
/// cheap remote change-check, and the full refresh, with one refresh in
/// flight at most.
pub struct Scheduler {
    client: Arc<dyn DriveClient>,
    root: PathBuf,
    filter: Arc<PathFilter>,
    local: SharedReplica,
    remote: SharedReplica,
    executor: Executor,
    watcher: LocalWatcher,
    debouncer: Debouncer,
    snapshots: SnapshotWriter,
    cancel: Arc<AtomicBool>,
    config: SchedulerConfig,
    backoff: RefreshBackoff,
    /// Counts recorded at the last successful refresh, compared by the
    /// cheap change-check.
    last_counts: Option<(u64, u64)>,
    auth_failures: u32,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn DriveClient>,
        root: PathBuf,
        filter: Arc<PathFilter>,
        local: SharedReplica,
        remote: SharedReplica,
        executor: Executor,
        watcher: LocalWatcher,
        debouncer: Debouncer,
        snapshots: SnapshotWriter,
        cancel: Arc<AtomicBool>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            client,
            root,
            filter,
            local,
            remote,
            executor,
            watcher,
            debouncer,
            snapshots,
            cancel,
            config,
            backoff: RefreshBackoff::new(),
            last_counts: None,
            auth_failures: 0,
        }
    }

    /// First full pass: scan both sides, swap the replicas live, then
    /// converge with a cross-side plan.
    pub fn initial_sync(&mut self) -> Result<()> {
        info!("performing initial synchronization");
        let candidate = match scan_remote(&*self.client, &self.filter, self.config.max_workers) {
            Ok(candidate) => candidate,
            Err(err) => bail!("initial remote scan failed: {err}"),
        };
        let local_tree = scan_local(&self.root, &self.filter);

        self.snapshots.write("local-before", &local_tree);
        self.snapshots.write("remote-before", &self.remote.read());
        self.snapshots.write("remote-candidate", &candidate);

        self.last_counts = Some((
            candidate.declared_file_count.unwrap_or(0),
            candidate.trash_count.unwrap_or(0),
        ));
        self.local.swap(local_tree);
        self.remote.swap(candidate);

        let plan = {
            let local = self.local.read();
            let remote = self.remote.read();
            plan_cross(&local, &remote)
        };
        info!(actions = plan.len(), "initial plan computed");
        let summary = self.executor.run(plan);
        info!(
            applied = summary.applied,
            failed = summary.failed,
            "initial synchronization finished"
        );

        self.snapshots.write("local-after", &self.local.read());
        self.snapshots.write("remote-after", &self.remote.read());
        Ok(())
    }

    /// Cooperative main loop; returns on cancellation or after repeated
    /// authentication failures.
    pub fn run(&mut self) -> Result<()> {
        let ticker = tick(TICK.min(self.config.debounce));
        let mut next_check = Instant::now() + self.config.check_period;
        let mut next_refresh = Instant::now() + self.config.refresh_period;
        let mut refresh_requested = false;
        let mut earliest_refresh = Instant::now();

        loop {
            let _ = ticker.recv();
            if self.cancel.load(Ordering::SeqCst) {
                info!("shutdown requested, leaving scheduler loop");
                return Ok(());
            }

            self.drain_watcher();

            let now = Instant::now();
            if now >= next_check {
                next_check = now + self.config.check_period;
                if self.change_check() {
                    refresh_requested = true;
                }
                if self.auth_failures >= MAX_AUTH_FAILURES {
                    bail!("giving up after {MAX_AUTH_FAILURES} authentication failures");
                }
            }

            if now >= next_refresh {
                // Coalesces with any pending check-triggered request.
                refresh_requested = true;
            }

            if refresh_requested && now >= earliest_refresh {
                refresh_requested = false;
                match self.run_refresh() {
                    Ok(()) => {
                        self.backoff.reset();
                        next_refresh = Instant::now() + self.config.refresh_period;
                        earliest_refresh = Instant::now();
                    }
                    Err(ScanError::Inconsistent { declared, counted }) => {
                        self.backoff.note_failure();
                        let delay = self.backoff.delay(self.config.refresh_period);
                        warn!(
                            declared,
                            counted,
                            retry_in_secs = delay.as_secs(),
                            "refresh discarded by integrity gate, backing off"
                        );
                        next_refresh = Instant::now() + delay;
                        earliest_refresh = next_refresh;
                    }
                    Err(ScanError::Drive(err)) => {
                        if err.is_auth() {
                            self.auth_failures += 1;
                            error!(error = %err, "refresh failed to authenticate");
                            if self.auth_failures >= MAX_AUTH_FAILURES {
                                bail!(
                                    "giving up after {MAX_AUTH_FAILURES} authentication failures"
                                );
                            }
                        } else {
                            warn!(error = %err, "refresh failed, will retry on schedule");
                        }
                        next_refresh = Instant::now() + self.config.refresh_period;
                    }
                }
            }
        }
    }

    /// Pulls raw watcher events through the debouncer and executes a
    /// minimal plan for whatever was released this tick.
    pub fn drain_watcher(&mut self) {
        let now = Instant::now();
        for raw in self.watcher.drain() {
            self.debouncer.ingest(raw, now);
        }
        let records = self.debouncer.release(Instant::now(), &self.filter);
        if records.is_empty() {
            return;
        }

        info!(records = records.len(), "local changes released by debouncer");
        let plan = {
            let local = self.local.read();
            let remote = self.remote.read();
            plan_local_changes(&self.root, &records, &local, &remote)
        };
        if plan.is_empty() {
            return;
        }
        let summary = self.executor.run(plan);
        if summary.failed > 0 {
            warn!(failed = summary.failed, "some local-change actions failed");
        }
    }

    /// Cheap poll: true when the root counts moved since the last good
    /// refresh and a full refresh should happen now.
    fn change_check(&mut self) -> bool {
        match check_remote(&*self.client) {
            Ok(counts) => {
                self.auth_failures = 0;
                match self.last_counts {
                    Some(last) if last == counts => false,
                    Some(last) => {
                        info!(
                            files = counts.0,
                            trash = counts.1,
                            last_files = last.0,
                            last_trash = last.1,
                            "remote drift detected"
                        );
                        true
                    }
                    None => true,
                }
            }
            Err(err) if err.is_auth() => {
                self.auth_failures += 1;
                error!(error = %err, "change-check failed to authenticate");
                false
            }
            Err(err) => {
                warn!(error = %err, "change-check failed");
                false
            }
        }
    }

    /// Full refresh: build and gate a candidate, learn structural
    /// changes against the previous remote tree, swap, mirror the
    /// changes locally, then converge the rest cross-side.
    pub fn run_refresh(&mut self) -> Result<(), ScanError> {
        info!("starting remote refresh");
        let candidate = scan_remote(&*self.client, &self.filter, self.config.max_workers)?;

        let local_tree = scan_local(&self.root, &self.filter);

        self.snapshots.write("local-before", &self.local.read());
        self.snapshots.write("remote-before", &self.remote.read());
        self.snapshots.write("remote-candidate", &candidate);

        self.last_counts = Some((
            candidate.declared_file_count.unwrap_or(0),
            candidate.trash_count.unwrap_or(0),
        ));
        self.local.swap(local_tree);

        let structural = {
            let live = self.remote.read();
            let local = self.local.read();
            plan_refresh(&live, &candidate, &local)
        };

        // Swap before executing: the remote half of each move pair is
        // already reality on the drive and settles as an index no-op.
        self.remote.swap(candidate);

        if !structural.is_empty() {
            info!(actions = structural.len(), "applying remote structural changes");
            self.executor.run(structural);
        }

        let convergence = {
            let local = self.local.read();
            let remote = self.remote.read();
            plan_cross(&local, &remote)
        };
        if !convergence.is_empty() {
            info!(actions = convergence.len(), "applying convergence plan");
            self.executor.run(convergence);
        }

        self.snapshots.write("local-after", &self.local.read());
        self.snapshots.write("remote-after", &self.remote.read());
        info!("refresh complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::MemoryDrive;
    use crate::executor::ExecutorOptions;
    use crate::replica::Replica;
    use crate::suppress::SuppressionSet;
    use std::fs;

    fn build(dir: &tempfile::TempDir, drive: MemoryDrive) -> Scheduler {
        let root = dir.path().join("sync");
        fs::create_dir_all(&root).unwrap();
        let filter = Arc::new(PathFilter::new(&[], &[]).unwrap());
        let local = SharedReplica::new(Replica::new());
        let remote = SharedReplica::new(Replica::new());
        let suppression = SuppressionSet::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let client: Arc<dyn DriveClient> = Arc::new(drive);
        let executor = Executor::new(
            client.clone(),
            root.clone(),
            local.clone(),
            remote.clone(),
            suppression.clone(),
            cancel.clone(),
            ExecutorOptions {
                max_workers: 4,
                retry_delay: Duration::from_millis(5),
                ..ExecutorOptions::default()
            },
        );
        let watcher = LocalWatcher::start(&root).unwrap();
        let debouncer = Debouncer::new(Duration::from_secs(10), suppression.clone());
        let snapshots = SnapshotWriter::new(&dir.path().join("state")).unwrap();

        Scheduler::new(
            client,
            root,
            filter,
            local,
            remote,
            executor,
            watcher,
            debouncer,
            snapshots,
            cancel,
            SchedulerConfig {
                check_period: Duration::from_secs(20),
                refresh_period: Duration::from_secs(90),
                debounce: Duration::from_secs(10),
                max_workers: 4,
            },
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = RefreshBackoff::new();
        let interval = Duration::from_secs(90);
        assert_eq!(backoff.delay(interval), interval);
        backoff.note_failure();
        assert_eq!(backoff.delay(interval), interval * 2);
        backoff.note_failure();
        assert_eq!(backoff.delay(interval), interval * 4);
        backoff.note_failure();
        assert_eq!(backoff.delay(interval), interval * 8);
        backoff.note_failure();
        assert_eq!(backoff.delay(interval), interval * 8);
        backoff.reset();
        assert!(!backoff.is_backing_off());
    }

    #[test]
    fn initial_sync_converges_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let drive = MemoryDrive::new();
        drive.add_file("music/song.mp3", 900, 1_700_000_000);
        let mut scheduler = build(&dir, drive.clone());

        fs::create_dir_all(scheduler.root.join("docs")).unwrap();
        fs::write(scheduler.root.join("docs/a.txt"), b"hello").unwrap();

        scheduler.initial_sync().unwrap();

        // Remote gained the local file, local gained the remote one.
        assert!(scheduler.remote.read().contains("docs/a.txt"));
        assert!(scheduler.root.join("music/song.mp3").exists());
        assert_eq!(drive.file_count(), 2);
        assert!(dir.path().join("state/local-after.txt").exists());
    }

    #[test]
    fn inconsistent_refresh_leaves_live_replica_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let drive = MemoryDrive::new();
        drive.add_file("keep.txt", 10, 1_700_000_000);
        let mut scheduler = build(&dir, drive.clone());
        scheduler.initial_sync().unwrap();
        let before = scheduler.remote.read().dump();

        drive.add_file("extra.txt", 5, 1_700_000_100);
        drive.override_declared_count(100);
        let err = scheduler.run_refresh().unwrap_err();
        assert!(matches!(err, ScanError::Inconsistent { declared: 100, .. }));
        assert_eq!(scheduler.remote.read().dump(), before);
        assert!(!scheduler.root.join("extra.txt").exists());
    }

    #[test]
    fn refresh_mirrors_remote_rename_locally() {
        let dir = tempfile::tempdir().unwrap();
        let drive = MemoryDrive::new();
        let handle = drive.add_file("docs/old.pdf", 500, 1_700_000_000);
        let mut scheduler = build(&dir, drive.clone());
        scheduler.initial_sync().unwrap();
        assert!(scheduler.root.join("docs/old.pdf").exists());

        let docs = drive.add_folder("docs");
        drive.rename(&handle, &docs, "new.pdf").unwrap();
        scheduler.run_refresh().unwrap();

        assert!(!scheduler.root.join("docs/old.pdf").exists());
        assert!(scheduler.root.join("docs/new.pdf").exists());
        assert!(scheduler.remote.read().contains("docs/new.pdf"));
        assert!(scheduler.local.read().contains("docs/new.pdf"));
        // The rename arrived as a move, not a fresh transfer.
        assert_eq!(drive.file_count(), 1);
    }

    #[test]
    fn refresh_mirrors_remote_deletion_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let drive = MemoryDrive::new();
        drive.add_file("X/a", 1, 1_700_000_000);
        drive.add_file("X/b", 2, 1_700_000_100);
        let mut scheduler = build(&dir, drive.clone());
        scheduler.initial_sync().unwrap();
        assert!(scheduler.root.join("X/a").exists());

        let folder = drive.add_folder("X");
        drive.delete(&folder).unwrap();
        scheduler.run_refresh().unwrap();

        assert!(!scheduler.root.join("X").exists());
        assert!(!scheduler.local.read().contains("X/a"));
        assert!(!scheduler.remote.read().contains("X"));
    }

    #[test]
    fn change_check_spots_drift() {
        let dir = tempfile::tempdir().unwrap();
        let drive = MemoryDrive::new();
        drive.add_file("a.txt", 1, 1_700_000_000);
        let mut scheduler = build(&dir, drive.clone());
        scheduler.initial_sync().unwrap();

        assert!(!scheduler.change_check());
        drive.add_file("b.txt", 2, 1_700_000_100);
        assert!(scheduler.change_check());
        drive.remove_handle(&drive.add_file("b.txt", 2, 1_700_000_100));
        drive.set_trash_count(1);
        assert!(scheduler.change_check());
    }
}
