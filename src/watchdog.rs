//! Jitter watchdog.
//!
//! A plain OS thread, outside the event loops it audits, that wakes up every `period` and
//! checks how long it actually slept. A wake-up later than `threshold` means the whole
//! process was stalled (CPU starvation, swapping, a paused VM) and every latency recorded
//! meanwhile is inflated.
use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::error::EngineError;

pub struct JitterWatchdog {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl JitterWatchdog {
    /// Starts the watchdog thread. `on_anomaly` runs on that thread for every late wake-up.
    pub fn spawn<F>(
        period: Duration,
        threshold: Duration,
        on_anomaly: F,
    ) -> Result<Self, EngineError>
    where
        F: Fn(EngineError) + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("jitter-watchdog".into())
            .spawn(move || {
                let mut last = Instant::now();
                loop {
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // explicit stop or the watchdog handle was dropped
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            tracing::debug!("Terminating jitter watchdog");
                            return;
                        }
                    }
                    let now = Instant::now();
                    let delay = now - last;
                    if delay > threshold {
                        let error = EngineError::SchedulingAnomaly { delay, threshold };
                        tracing::error!("{error}");
                        on_anomaly(error);
                    }
                    last = now;
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Signals the thread and waits for it to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Jitter watchdog panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for JitterWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn stops_cleanly() {
        let mut watchdog =
            JitterWatchdog::spawn(Duration::from_millis(10), Duration::from_secs(10), |_| {})
                .unwrap();
        assert!(watchdog.is_running());
        let begin = Instant::now();
        watchdog.stop();
        watchdog.stop();
        assert!(!watchdog.is_running());
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn reports_overrun_beyond_threshold() {
        let anomalies = Arc::new(Mutex::new(Vec::new()));
        let sink = anomalies.clone();
        // A zero threshold makes every wake-up late.
        let mut watchdog = JitterWatchdog::spawn(
            Duration::from_millis(10),
            Duration::ZERO,
            move |e| sink.lock().unwrap().push(e),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        watchdog.stop();
        let anomalies = anomalies.lock().unwrap();
        assert!(!anomalies.is_empty());
        match &anomalies[0] {
            EngineError::SchedulingAnomaly { delay, threshold } => {
                assert!(*delay >= Duration::from_millis(10));
                assert_eq!(*threshold, Duration::ZERO);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn quiet_when_on_time() {
        let anomalies = Arc::new(Mutex::new(0));
        let sink = anomalies.clone();
        let mut watchdog = JitterWatchdog::spawn(
            Duration::from_millis(5),
            Duration::from_secs(5),
            move |_| *sink.lock().unwrap() += 1,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        watchdog.stop();
        assert_eq!(*anomalies.lock().unwrap(), 0);
    }
}
