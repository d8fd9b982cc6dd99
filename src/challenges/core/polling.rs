//! Bounded polling loop that waits out a challenge page.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};

use super::markers::MarkerScan;
use super::types::ChallengeEngineError;

/// Something that can report which challenge markers a page shows right now.
#[async_trait]
pub trait PageProbe: Send {
    async fn scan(&mut self) -> Result<MarkerScan, ChallengeEngineError>;
}

/// Timing knobs for [`poll_challenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Wait before the first scan so the page can render.
    pub settle_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    /// Extra wait after the markers disappear, letting the redirect land.
    pub post_clear_delay: Duration,
}

impl PollSettings {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            post_clear_delay: Duration::from_secs(2),
        }
    }
}

/// Tagged result of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No marker after the settle delay.
    NoChallenge,
    Cleared { elapsed: Duration },
    /// The error marker appeared; carries its visible text.
    Failed { message: String },
    TimedOut { elapsed: Duration },
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::NoChallenge | PollOutcome::Cleared { .. })
    }

    pub fn into_result(self) -> Result<(), ChallengeEngineError> {
        match self {
            PollOutcome::NoChallenge | PollOutcome::Cleared { .. } => Ok(()),
            PollOutcome::Failed { message } => Err(ChallengeEngineError::Failed(message)),
            PollOutcome::TimedOut { elapsed } => {
                Err(ChallengeEngineError::Timeout(elapsed.as_secs_f64()))
            }
        }
    }
}

/// Poll `probe` until the challenge clears, fails, or the deadline passes.
///
/// A scan that is unavailable (page mid-navigation) counts as "still
/// challenging" so a redirect between challenge and target never reads as
/// success or failure. Hard probe errors propagate.
pub async fn poll_challenge<P>(
    probe: &mut P,
    settings: &PollSettings,
) -> Result<PollOutcome, ChallengeEngineError>
where
    P: PageProbe + ?Sized,
{
    if !settings.settle_delay.is_zero() {
        sleep(settings.settle_delay).await;
    }

    let first = probe.scan().await?;
    if first.available && !first.is_challenge() {
        log::debug!("no challenge markers after settle delay");
        return Ok(PollOutcome::NoChallenge);
    }

    let started = Instant::now();
    let deadline = started + settings.timeout;
    let mut scan = first;

    loop {
        if scan.available {
            if !scan.is_challenge() {
                if !settings.post_clear_delay.is_zero() {
                    sleep(settings.post_clear_delay).await;
                }
                return Ok(PollOutcome::Cleared {
                    elapsed: started.elapsed(),
                });
            }
            if scan.has_error() {
                let message = scan
                    .error_text
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| "challenge error marker present".into());
                return Ok(PollOutcome::Failed { message });
            }
            log::debug!("challenge markers still present: {:?}", scan.present);
        }

        if Instant::now() + settings.interval > deadline {
            return Ok(PollOutcome::TimedOut {
                elapsed: started.elapsed(),
            });
        }
        sleep(settings.interval).await;
        scan = probe.scan().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedProbe {
        scans: VecDeque<MarkerScan>,
        calls: usize,
    }

    impl ScriptedProbe {
        fn new(scans: Vec<MarkerScan>) -> Self {
            Self {
                scans: scans.into(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl PageProbe for ScriptedProbe {
        async fn scan(&mut self) -> Result<MarkerScan, ChallengeEngineError> {
            self.calls += 1;
            // The last scripted scan repeats forever.
            if self.scans.len() > 1 {
                Ok(self.scans.pop_front().unwrap_or_default())
            } else {
                Ok(self.scans.front().cloned().unwrap_or_default())
            }
        }
    }

    fn markers(present: &[&str]) -> MarkerScan {
        MarkerScan {
            available: true,
            present: present.iter().map(|m| m.to_string()).collect(),
            error_text: None,
        }
    }

    fn fast(timeout_ms: u64) -> PollSettings {
        PollSettings {
            settle_delay: Duration::ZERO,
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(timeout_ms),
            post_clear_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn returns_immediately_without_markers() {
        let mut probe = ScriptedProbe::new(vec![markers(&[])]);
        let outcome = poll_challenge(&mut probe, &fast(100)).await.unwrap();
        assert_eq!(outcome, PollOutcome::NoChallenge);
        assert_eq!(probe.calls, 1);
    }

    #[tokio::test]
    async fn waits_until_markers_clear() {
        let mut probe = ScriptedProbe::new(vec![
            markers(&["#cf-please-wait"]),
            MarkerScan::unavailable(),
            markers(&["#challenge-running"]),
            markers(&[]),
        ]);
        let outcome = poll_challenge(&mut probe, &fast(1_000)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Cleared { .. }));
        assert_eq!(probe.calls, 4);
    }

    #[tokio::test]
    async fn fails_fast_on_error_marker() {
        let mut failing = markers(&["#challenge-form", "#challenge-error-title"]);
        failing.error_text = Some("Sorry, you have been blocked".into());
        let mut probe = ScriptedProbe::new(vec![markers(&["#challenge-form"]), failing]);

        let outcome = poll_challenge(&mut probe, &fast(1_000)).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Failed {
                message: "Sorry, you have been blocked".into()
            }
        );
        assert!(matches!(
            outcome.into_result(),
            Err(ChallengeEngineError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn times_out_when_markers_persist() {
        let mut probe = ScriptedProbe::new(vec![markers(&["#cf-content"])]);
        let outcome = poll_challenge(&mut probe, &fast(40)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert!(probe.calls > 1);
        assert!(matches!(
            outcome.into_result(),
            Err(ChallengeEngineError::Timeout(_))
        ));
    }
}
