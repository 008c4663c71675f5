use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How long to wait for a freshly started service to bind its listener.
/// Policy carried by the plan file, not constants baked into call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryBudget {
    pub settle_secs: u64,
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl RetryBudget {
    pub fn container_default() -> Self {
        Self {
            settle_secs: 40,
            max_attempts: 10,
            interval_secs: 5,
        }
    }

    pub fn compose_default() -> Self {
        Self {
            settle_secs: 30,
            max_attempts: 15,
            interval_secs: 5,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Upper bound on verification time; must sit strictly below the run
    /// deadline (enforced by plan validation).
    pub fn worst_case(&self) -> Duration {
        self.settle() + self.interval() * self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Ready,
    Unready(String),
}

/// One synchronous readiness check against a service endpoint.
pub trait Probe {
    fn check(&mut self) -> ProbeStatus;
    fn describe(&self) -> String;
}

pub struct HttpProbe {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP probe client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl Probe for HttpProbe {
    fn check(&mut self) -> ProbeStatus {
        match self.client.get(&self.url).send() {
            Ok(response) if response.status().is_success() => ProbeStatus::Ready,
            Ok(response) => ProbeStatus::Unready(format!("status {}", response.status())),
            Err(err) => ProbeStatus::Unready(err.to_string()),
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Blocking-wait seam so verification logic is testable without sleeping.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Ready { attempts: u32 },
    Failed { attempts: u32, last_error: String },
}

/// Poll `probe` until it reports ready or the budget is exhausted.
///
/// Returns immediately after a successful probe; a never-ready endpoint is
/// probed exactly `max_attempts` times with one interval wait between
/// consecutive attempts and none after the last.
pub fn await_healthy(
    probe: &mut dyn Probe,
    budget: &RetryBudget,
    sleeper: &mut dyn Sleeper,
) -> HealthOutcome {
    let endpoint = probe.describe();
    if !budget.settle().is_zero() {
        debug!(%endpoint, settle_secs = budget.settle_secs, "Waiting for service to settle");
        sleeper.sleep(budget.settle());
    }

    let mut last_error = String::from("no probe attempted");
    for attempt in 1..=budget.max_attempts {
        match probe.check() {
            ProbeStatus::Ready => {
                info!(%endpoint, attempt, "Service is ready");
                return HealthOutcome::Ready { attempts: attempt };
            }
            ProbeStatus::Unready(reason) => {
                debug!(%endpoint, attempt, %reason, "Service not ready yet");
                last_error = reason;
            }
        }
        if attempt < budget.max_attempts {
            sleeper.sleep(budget.interval());
        }
    }

    HealthOutcome::Failed {
        attempts: budget.max_attempts,
        last_error,
    }
}
