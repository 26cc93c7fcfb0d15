use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use tokio::time::MissedTickBehavior;

use crate::auth::{Authenticator, LoginPrompt};
use crate::diff;
use crate::error::WatchError;
use crate::notifier::{format_changes, Notifier};
use crate::repository::SnapshotRepository;
use crate::utils::portal::Portal;

#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing new. The baseline may still have been refreshed.
    NoChanges,
    Notified { count: usize, bootstrap: bool },
    /// The cycle stopped early; the baseline is untouched.
    Skipped(WatchError),
}

/// Everything one check needs. Cycles borrow it mutably, so two can never overlap.
pub struct Monitor {
    auth: Authenticator,
    portal: Box<dyn Portal>,
    prompt: Box<dyn LoginPrompt>,
    repository: Box<dyn SnapshotRepository>,
    notifier: Box<dyn Notifier>,
}

impl Monitor {
    pub fn new(
        auth: Authenticator,
        portal: Box<dyn Portal>,
        prompt: Box<dyn LoginPrompt>,
        repository: Box<dyn SnapshotRepository>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            auth,
            portal,
            prompt,
            repository,
            notifier,
        }
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        match self.check().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Check skipped: {e}");
                CycleOutcome::Skipped(e)
            }
        }
    }

    async fn check(&mut self) -> Result<CycleOutcome, WatchError> {
        self.auth
            .ensure_session(self.portal.as_mut(), self.prompt.as_mut())
            .await?;

        let current = self.portal.fetch_grades().await?;
        info!("Fetched {} grade(s)", current.len());
        let baseline = self.repository.latest()?;

        if current.is_empty() && !baseline.is_empty() {
            warn!(
                "Portal returned no grades but {} are stored; keeping the stored ones",
                baseline.len()
            );
            return Ok(CycleOutcome::NoChanges);
        }

        let changes = diff::detect(&current, &baseline);
        if changes.is_empty() {
            info!("No new grades");
            if !diff::is_covered(&current, &baseline) || current.summary() != baseline.summary() {
                self.repository.commit(&current)?;
            }
            return Ok(CycleOutcome::NoChanges);
        }

        info!("{} grade change(s) detected", changes.len());
        self.notifier.send(&format_changes(&changes)).await?;
        // A crash before this line re-sends the same message next time, never drops it.
        self.repository.commit(&current)?;

        Ok(CycleOutcome::Notified {
            count: changes.len(),
            bootstrap: changes.bootstrap,
        })
    }

    /// Runs a check every `interval` until Ctrl-C. Each check finishes before the
    /// next tick is awaited; ticks missed meanwhile are not replayed.
    pub async fn run_forever(&mut self, interval: Duration, jitter: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!("Checking grades every {} minute(s)", interval.as_secs() / 60);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => break,
            }

            let delay = random_delay(jitter);
            if !delay.is_zero() {
                debug!("Waiting {}s before checking", delay.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut shutdown => break,
                }
            }

            tokio::select! {
                outcome = self.run_cycle() => match outcome {
                    CycleOutcome::Notified { count, bootstrap: true } => info!("Baseline of {count} grade(s) recorded"),
                    CycleOutcome::Notified { count, .. } => info!("Notified {count} change(s)"),
                    other => debug!("Check finished: {other:?}"),
                },
                _ = &mut shutdown => break,
            }
        }
        info!("Stopped");
    }
}

fn random_delay(jitter: Duration) -> Duration {
    let max = jitter.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::auth::tests::{credential, FakePortal, FakePrompt};
    use crate::auth::AuthSettings;
    use crate::models::{GradeRecord, GradeSnapshot};
    use crate::notifier::tests::RecordingNotifier;
    use crate::repository::{HistoryLogRepository, LatestFileRepository};
    use crate::session_store::SessionStore;

    type Grades = Arc<Mutex<Option<Result<GradeSnapshot, String>>>>;

    fn snapshot(rows: &[(&str, &str)]) -> GradeSnapshot {
        GradeSnapshot::new(
            rows.iter().map(|(c, r)| GradeRecord::new(*c, *r)).collect(),
            Vec::new(),
        )
    }

    fn set(grades: &Grades, value: Result<GradeSnapshot, String>) {
        *grades.lock().unwrap() = Some(value);
    }

    fn monitor(dir: &Path, notifier: &RecordingNotifier, grades: &Grades) -> Monitor {
        let repository = LatestFileRepository::new(dir.join("grades.json"));
        monitor_with(dir, notifier, grades, Box::new(repository))
    }

    fn monitor_with(
        dir: &Path,
        notifier: &RecordingNotifier,
        grades: &Grades,
        repository: Box<dyn SnapshotRepository>,
    ) -> Monitor {
        let store = SessionStore::new(dir.join("cookies.json"));
        store.save(&credential("good")).unwrap();
        let portal = FakePortal {
            valid_tokens: vec!["good".into()],
            grades: Arc::clone(grades),
            ..FakePortal::default()
        };
        let mut prompt = FakePrompt::with(None);
        prompt.attended = false;

        Monitor::new(
            Authenticator::new(store, AuthSettings::default()),
            Box::new(portal),
            Box::new(prompt),
            repository,
            Box::new(notifier.clone()),
        )
    }

    fn stored(dir: &Path) -> GradeSnapshot {
        LatestFileRepository::new(dir.join("grades.json")).latest().unwrap()
    }

    #[tokio::test]
    async fn first_run_announces_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        set(&grades, Ok(snapshot(&[("Calculus", "88"), ("Physics", "91")])));
        let mut monitor = monitor(dir.path(), &notifier, &grades);

        let outcome = monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Notified { count: 2, bootstrap: true }));
        assert_eq!(notifier.sent.lock().unwrap()[0].title, "成绩监控已启动");
        assert_eq!(stored(dir.path()).len(), 2);

        let outcome = monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::NoChanges));
        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_notification_keeps_baseline_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        set(&grades, Ok(snapshot(&[("Calculus", "88")])));
        let mut monitor = monitor(dir.path(), &notifier, &grades);
        monitor.run_cycle().await;

        set(&grades, Ok(snapshot(&[("Calculus", "90")])));
        notifier.fail.store(true, Ordering::SeqCst);
        let outcome = monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Skipped(WatchError::NotifyFailed(_))));
        assert_eq!(stored(dir.path()).records()[0].result_text(), "88");

        notifier.fail.store(false, Ordering::SeqCst);
        let outcome = monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Notified { count: 1, bootstrap: false }));
        let sent = notifier.sent.lock().unwrap();
        assert!(sent[1].body.contains("成绩：90（原成绩：88）"));
        assert_eq!(stored(dir.path()).records()[0].result_text(), "90");
    }

    #[tokio::test]
    async fn schema_mismatch_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        set(&grades, Err("grade table not found".into()));
        let mut monitor = monitor(dir.path(), &notifier, &grades);

        let outcome = monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Skipped(WatchError::ParseSchemaMismatch(_))));
        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("grades.json").exists());
    }

    #[tokio::test]
    async fn empty_fetch_does_not_wipe_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        set(&grades, Ok(snapshot(&[("Calculus", "88")])));
        let mut monitor = monitor(dir.path(), &notifier, &grades);
        monitor.run_cycle().await;

        set(&grades, Ok(GradeSnapshot::empty()));
        assert!(matches!(monitor.run_cycle().await, CycleOutcome::NoChanges));
        assert_eq!(stored(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn unchanged_results_refresh_other_fields_silently() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        set(&grades, Ok(snapshot(&[("Calculus", "88")])));
        let mut monitor = monitor(dir.path(), &notifier, &grades);
        monitor.run_cycle().await;

        let mut record = GradeRecord::new("Calculus", "88");
        record.grade_point = Some("3.7".into());
        set(&grades, Ok(GradeSnapshot::new(vec![record], Vec::new())));
        assert!(matches!(monitor.run_cycle().await, CycleOutcome::NoChanges));
        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(stored(dir.path()).records()[0].grade_point.as_deref(), Some("3.7"));
    }

    #[tokio::test]
    async fn missing_session_skips_unattended_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        let mut monitor = monitor(dir.path(), &notifier, &grades);
        SessionStore::new(dir.path().join("cookies.json")).clear().unwrap();

        let outcome = monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Skipped(WatchError::CredentialUnavailable)));
        assert!(!dir.path().join("grades.json").exists());
    }

    fn history_monitor(dir: &Path, notifier: &RecordingNotifier, grades: &Grades) -> Monitor {
        let repository = HistoryLogRepository::new(dir.join("grades.jsonl"));
        monitor_with(dir, notifier, grades, Box::new(repository))
    }

    fn history_lines(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("grades.jsonl")).unwrap().lines().count()
    }

    fn termed(term: &str, result: &str) -> GradeRecord {
        let mut record = GradeRecord::new("Calculus", result);
        record.term = Some(term.into());
        record
    }

    #[tokio::test]
    async fn history_policy_announces_retaken_course_once() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        set(
            &grades,
            Ok(GradeSnapshot::new(vec![termed("2022-1", "55"), termed("2023-1", "80")], Vec::new())),
        );
        let mut monitor = history_monitor(dir.path(), &notifier, &grades);

        assert!(matches!(monitor.run_cycle().await, CycleOutcome::Notified { count: 2, bootstrap: true }));
        for _ in 0..3 {
            assert!(matches!(monitor.run_cycle().await, CycleOutcome::NoChanges));
        }
        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(history_lines(dir.path()), 1);
    }

    #[tokio::test]
    async fn history_policy_ignores_reordered_listing() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();
        let grades = Grades::default();
        set(&grades, Ok(snapshot(&[("Calculus", "88")])));
        let mut monitor = history_monitor(dir.path(), &notifier, &grades);
        monitor.run_cycle().await;

        set(&grades, Ok(snapshot(&[("Physics", "91"), ("Calculus", "88")])));
        for _ in 0..5 {
            monitor.run_cycle().await;
        }
        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(history_lines(dir.path()), 2);
    }

    #[test]
    fn jitter_stays_in_range() {
        assert_eq!(random_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..50 {
            assert!(random_delay(Duration::from_secs(2)) <= Duration::from_secs(2));
        }
    }
}
