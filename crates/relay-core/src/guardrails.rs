use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use relay_types::GuardrailsVerdict;

use crate::RuntimeError;

/// Creates a single-verdict guardrails channel. The resolver side is handed to
/// whatever performs the asynchronous check; the gate is passed to the
/// orchestrator, which awaits the verdict before running any action.
pub fn guardrails_channel() -> (GuardrailsResolver, GuardrailsGate) {
    let (tx, rx) = watch::channel(None);
    (GuardrailsResolver { tx }, GuardrailsGate { rx })
}

pub struct GuardrailsResolver {
    tx: watch::Sender<Option<GuardrailsVerdict>>,
}

impl GuardrailsResolver {
    /// Records the verdict. Only the first call has any effect.
    pub fn resolve(&self, verdict: GuardrailsVerdict) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(verdict);
            true
        })
    }
}

#[derive(Clone)]
pub struct GuardrailsGate {
    rx: watch::Receiver<Option<GuardrailsVerdict>>,
}

impl GuardrailsGate {
    /// Resolves immediately with `verdict`.
    pub fn ready(verdict: GuardrailsVerdict) -> Self {
        let (_, rx) = watch::channel(Some(verdict));
        Self { rx }
    }

    pub async fn verdict(&self, cancel: &CancellationToken) -> Result<GuardrailsVerdict, RuntimeError> {
        let mut rx = self.rx.clone();
        let immediate = { rx.borrow_and_update().clone() };
        if let Some(verdict) = immediate {
            return Ok(verdict);
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::cancelled()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RuntimeError::unknown("guardrails check ended without a verdict"));
                    }
                    let updated = { rx.borrow_and_update().clone() };
                    if let Some(verdict) = updated {
                        return Ok(verdict);
                    }
                }
            }
        }
    }
}
