//! Deterministic sandbox runner for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::error::SandboxError;
use super::execution::SandboxResult;
use super::request::SandboxInvocation;
use super::SandboxRunner;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Result(SandboxResult),
    LaunchFailure(String),
    Panic(String),
}

/// Replays queued responses, then repeats the fallback.
#[derive(Debug)]
pub struct ScriptedSandbox {
    queue: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    delay: Option<Duration>,
    calls: Mutex<Vec<SandboxInvocation>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new(fallback: Scripted) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Always succeed with `{"ok": true, "result": result}`.
    pub fn passing(result: serde_json::Value) -> Self {
        Self::new(Scripted::Result(SandboxResult::success(result)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, response: Scripted) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(response);
        }
    }

    pub fn calls(&self) -> Vec<SandboxInvocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Highest number of concurrent `run` calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next(&self) -> Scripted {
        self.queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl SandboxRunner for ScriptedSandbox {
    async fn run(&self, invocation: SandboxInvocation) -> Result<SandboxResult, SandboxError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.next();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match response {
            Scripted::Result(result) => Ok(result),
            Scripted::LaunchFailure(reason) => Err(SandboxError::CrashedOnLaunch { reason }),
            Scripted::Panic(msg) => panic!("{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxErrorKind;

    fn inv() -> SandboxInvocation {
        SandboxInvocation::new("/tmp/c", "m.py", "execute")
    }

    #[tokio::test]
    async fn replays_queue_then_fallback() {
        let sandbox = ScriptedSandbox::passing(serde_json::json!(1));
        sandbox.push(Scripted::Result(SandboxResult::failure(
            SandboxErrorKind::RuntimeError,
            "boom",
        )));
        sandbox.push(Scripted::LaunchFailure("no python".into()));

        assert!(!sandbox.run(inv()).await.unwrap().ok);
        assert!(matches!(
            sandbox.run(inv()).await,
            Err(SandboxError::CrashedOnLaunch { .. })
        ));
        assert!(sandbox.run(inv()).await.unwrap().ok);
        assert_eq!(sandbox.calls().len(), 3);
    }

    #[tokio::test]
    async fn tracks_peak_concurrency() {
        let sandbox = std::sync::Arc::new(
            ScriptedSandbox::passing(serde_json::json!(null)).with_delay(Duration::from_millis(50)),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = sandbox.clone();
                tokio::spawn(async move { s.run(inv()).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(sandbox.peak_concurrency() >= 2);
    }
}
