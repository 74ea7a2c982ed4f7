mod postgres;

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use dbprobe_core::records::ConnectionRecord;

pub use postgres::{PostgresHandle, PostgresProber};

#[derive(Clone, Debug, thiserror::Error)]
#[error("{user_message} ({detail})")]
pub struct ConnectionError {
    pub user_message: String,
    pub detail: String,
}

impl ConnectionError {
    pub fn new(user_message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            detail: detail.into(),
        }
    }
}

/// Driver seam: establish a handle from a connection string, then probe it.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    type Handle: Send;

    async fn open(&self, target: &str) -> Result<Self::Handle, ConnectionError>;
    async fn ping(&self, handle: &mut Self::Handle) -> Result<(), ConnectionError>;
    async fn close(&self, handle: Self::Handle);
}

#[derive(Clone, Debug)]
pub enum ProbeOutcome {
    Reachable,
    ConnectFailed(ConnectionError),
    PingFailed(ConnectionError),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable)
    }
}

#[derive(Clone, Debug)]
pub struct ProbeReport {
    /// Position of the record in the input.
    pub index: usize,
    pub target: String,
    pub outcome: ProbeOutcome,
    pub elapsed: Duration,
}

/// Receives one report per record, in input order.
pub trait OutcomeSink {
    fn report(&mut self, report: &ProbeReport);
}

impl OutcomeSink for Vec<ProbeReport> {
    fn report(&mut self, report: &ProbeReport) {
        self.push(report.clone());
    }
}

pub struct Checker<P> {
    prober: Arc<P>,
    workers: usize,
}

impl<P> Checker<P>
where
    P: Prober + 'static,
{
    pub fn new(prober: P) -> Self {
        Self {
            prober: Arc::new(prober),
            workers: 1,
        }
    }

    /// Number of targets probed at once. Zero is treated as one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub async fn run(&self, records: Vec<ConnectionRecord>, sink: &mut dyn OutcomeSink) {
        tracing::info!(
            records = records.len(),
            workers = self.workers,
            "Checking connectivity"
        );
        if self.workers == 1 {
            self.run_sequential(records, sink).await;
        } else {
            self.run_pooled(records, sink).await;
        }
    }

    async fn run_sequential(&self, records: Vec<ConnectionRecord>, sink: &mut dyn OutcomeSink) {
        for (index, record) in records.iter().enumerate() {
            let report = probe_record(self.prober.as_ref(), index, record).await;
            sink.report(&report);
        }
    }

    async fn run_pooled(&self, records: Vec<ConnectionRecord>, sink: &mut dyn OutcomeSink) {
        let total = records.len();
        let (job_tx, job_rx) = async_channel::bounded::<(usize, ConnectionRecord)>(self.workers);
        let (result_tx, result_rx) = async_channel::unbounded::<ProbeReport>();

        for _ in 0..self.workers {
            let prober = self.prober.clone();
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                while let Ok((index, record)) = job_rx.recv().await {
                    let report = probe_record(prober.as_ref(), index, &record).await;
                    if result_tx.send(report).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(result_tx);

        tokio::spawn(async move {
            for job in records.into_iter().enumerate() {
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
        });

        // Workers finish out of order; hold reports until their turn comes.
        let mut pending = BTreeMap::new();
        let mut next = 0;
        while let Ok(report) = result_rx.recv().await {
            pending.insert(report.index, report);
            while let Some(report) = pending.remove(&next) {
                sink.report(&report);
                next += 1;
            }
        }

        if next < total {
            tracing::warn!(
                missing = total - next - pending.len(),
                "Some probes never reported back"
            );
            for report in pending.into_values() {
                sink.report(&report);
            }
        }
    }
}

async fn probe_record<P>(prober: &P, index: usize, record: &ConnectionRecord) -> ProbeReport
where
    P: Prober + ?Sized,
{
    let target = record.target_url();
    let started = Instant::now();
    tracing::debug!(index, host = %record.host, port = %record.port, "Probing target");

    let outcome = match prober.open(&target).await {
        Ok(mut handle) => {
            let outcome = match prober.ping(&mut handle).await {
                Ok(()) => ProbeOutcome::Reachable,
                Err(err) => ProbeOutcome::PingFailed(err),
            };
            prober.close(handle).await;
            outcome
        }
        Err(err) => ProbeOutcome::ConnectFailed(err),
    };

    let elapsed = started.elapsed();
    tracing::debug!(index, reachable = outcome.is_reachable(), ?elapsed, "Probe finished");
    ProbeReport {
        index,
        target,
        outcome,
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct FakeProber {
        refuse: Vec<&'static str>,
        silent: Vec<&'static str>,
        slow: Vec<&'static str>,
        attempts: Mutex<Vec<String>>,
        closed: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    fn host_of(target: &str) -> &str {
        let rest = target.split_once('@').map(|(_, rest)| rest).unwrap_or(target);
        rest.split(':').next().unwrap_or(rest)
    }

    struct FakeHandle {
        host: String,
    }

    #[async_trait::async_trait]
    impl Prober for FakeProber {
        type Handle = FakeHandle;

        async fn open(&self, target: &str) -> Result<FakeHandle, ConnectionError> {
            let host = host_of(target).to_string();
            self.attempts.lock().unwrap().push(host.clone());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if self.slow.contains(&host.as_str()) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.refuse.contains(&host.as_str()) {
                return Err(ConnectionError::new(
                    "Unable to reach the database host (connection refused).",
                    "connection refused",
                ));
            }
            Ok(FakeHandle { host })
        }

        async fn ping(&self, handle: &mut FakeHandle) -> Result<(), ConnectionError> {
            if self.silent.contains(&handle.host.as_str()) {
                return Err(ConnectionError::new("Liveness check failed.", "broken pipe"));
            }
            Ok(())
        }

        async fn close(&self, _handle: FakeHandle) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn records(hosts: &[&str]) -> Vec<ConnectionRecord> {
        hosts
            .iter()
            .map(|host| ConnectionRecord::new("u", "p", *host, "5432", "db"))
            .collect()
    }

    fn hosts(reports: &[ProbeReport]) -> Vec<&str> {
        reports.iter().map(|report| host_of(&report.target)).collect()
    }

    #[tokio::test]
    async fn reports_every_record_in_order() {
        let checker = Checker::new(FakeProber::default());
        let mut reports = Vec::new();
        checker.run(records(&["a", "b", "c", "d"]), &mut reports).await;

        assert_eq!(hosts(&reports), ["a", "b", "c", "d"]);
        assert!(reports.iter().all(|report| report.outcome.is_reachable()));
        let indices: Vec<_> = reports.iter().map(|report| report.index).collect();
        assert_eq!(indices, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn connect_failure_does_not_stop_the_run() {
        let prober = FakeProber {
            refuse: vec!["b"],
            ..FakeProber::default()
        };
        let checker = Checker::new(prober);
        let mut reports = Vec::new();
        checker.run(records(&["a", "b", "c"]), &mut reports).await;

        assert_eq!(reports.len(), 3);
        assert!(reports[0].outcome.is_reachable());
        assert!(matches!(reports[1].outcome, ProbeOutcome::ConnectFailed(_)));
        assert!(reports[2].outcome.is_reachable());
        assert_eq!(*checker.prober.attempts.lock().unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn ping_failure_is_reported_and_handle_released() {
        let prober = FakeProber {
            silent: vec!["a"],
            ..FakeProber::default()
        };
        let checker = Checker::new(prober);
        let mut reports = Vec::new();
        checker.run(records(&["a", "b"]), &mut reports).await;

        match &reports[0].outcome {
            ProbeOutcome::PingFailed(err) => assert_eq!(err.detail, "broken pipe"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(reports[1].outcome.is_reachable());
        assert_eq!(checker.prober.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_run_never_overlaps_attempts() {
        let prober = FakeProber {
            slow: vec!["a", "c"],
            ..FakeProber::default()
        };
        let checker = Checker::new(prober);
        let mut reports = Vec::new();
        checker.run(records(&["a", "b", "c"]), &mut reports).await;

        assert_eq!(checker.prober.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_input_reports_nothing() {
        let checker = Checker::new(FakeProber::default()).with_workers(3);
        let mut reports = Vec::new();
        checker.run(Vec::new(), &mut reports).await;
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn pooled_run_keeps_input_order() {
        let prober = FakeProber {
            slow: vec!["a", "c"],
            refuse: vec!["d"],
            ..FakeProber::default()
        };
        let checker = Checker::new(prober).with_workers(3);
        let mut reports = Vec::new();
        checker
            .run(records(&["a", "b", "c", "d", "e"]), &mut reports)
            .await;

        assert_eq!(hosts(&reports), ["a", "b", "c", "d", "e"]);
        assert!(matches!(reports[3].outcome, ProbeOutcome::ConnectFailed(_)));
        assert!(checker.prober.peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn zero_workers_means_one() {
        let checker = Checker::new(FakeProber::default()).with_workers(0);
        assert_eq!(checker.workers, 1);
    }
}
