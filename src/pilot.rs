use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::actions::{self, Action};
use crate::device::{CaptureOptions, DeviceBackend, ScreenCapture, Session, SessionRegistry};
use crate::error::DriveError;
use crate::predict::{ConversationHandle, Predictor};

/// Loop tuning knobs.
#[derive(Clone, Debug)]
pub struct PilotConfig {
    /// Predict-act-observe cycles allowed per run before a forced stop.
    pub max_iterations: u32,
    /// Pause after each applied action so the UI finishes transitioning
    /// before the next capture.
    pub settle: Duration,
    /// Pause after provisioning a fresh device so it finishes booting
    /// before the first capture.
    pub creation_settle: Duration,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            settle: Duration::from_millis(1000),
            creation_settle: Duration::from_millis(3000),
        }
    }
}

/// What one completed cycle did. Kept only for the duration of the run.
#[derive(Clone, Debug)]
struct IterationRecord {
    index: u32,
    /// `None` when the proposed action was malformed and skipped.
    action: Option<Action>,
    screen: String,
}

/// Raw output of the control loop, before evaluation. `success` is false
/// only when the loop stopped on a mid-run prediction failure.
#[derive(Clone, Debug)]
struct LoopResult {
    success: bool,
    session_id: String,
    message: String,
    iterations: u32,
}

/// Outcome classification produced by [`evaluate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub success: bool,
    pub reason: String,
}

/// Final, evaluated result of one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub success: bool,
    pub session_id: String,
    pub message: String,
    pub iterations: u32,
    pub reason: String,
}

/// Optional sink for the screens observed during a run.
#[async_trait]
pub trait CaptureStore: Send + Sync {
    /// `iteration` is `None` for the bootstrap screen, `Some(index)` for
    /// the screen observed after that cycle's action.
    async fn save(
        &self,
        run_id: &str,
        iteration: Option<u32>,
        capture: &ScreenCapture,
    ) -> anyhow::Result<()>;
}

/// Writes each capture of a run under `<base>/<run_id>/`.
pub struct DiskCaptureStore {
    base_dir: PathBuf,
}

impl DiskCaptureStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base_dir: base.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CaptureStore for DiskCaptureStore {
    async fn save(
        &self,
        run_id: &str,
        iteration: Option<u32>,
        capture: &ScreenCapture,
    ) -> anyhow::Result<()> {
        // Only inline data URIs can be materialized locally; URL-form
        // captures stay with the backend.
        let Some(b64) = capture.uri.split("base64,").nth(1) else {
            return Ok(());
        };
        let png = B64.decode(b64)?;
        let dir = self.base_dir.join(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let name = match iteration {
            Some(i) => format!("step_{i:03}.png"),
            None => "start.png".to_string(),
        };
        tokio::fs::write(dir.join(name), &png).await?;
        Ok(())
    }
}

/// Drives a remote device toward a natural-language goal by alternating
/// prediction turns with injected device input.
pub struct Pilot<D, P>
where
    D: DeviceBackend,
    P: Predictor,
{
    device: D,
    predictor: P,
    registry: SessionRegistry,
    cfg: PilotConfig,
    capture_store: Option<Arc<dyn CaptureStore>>,
}

impl<D, P> Pilot<D, P>
where
    D: DeviceBackend,
    P: Predictor,
{
    pub fn new(device: D, predictor: P, cfg: PilotConfig) -> Self {
        Self {
            device,
            predictor,
            registry: SessionRegistry::new(),
            cfg,
            capture_store: None,
        }
    }

    /// Share a registry across pilots instead of this pilot's own.
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_capture_store(mut self, store: Arc<dyn CaptureStore>) -> Self {
        self.capture_store = Some(store);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Run against a fresh device with the configured iteration budget.
    pub async fn run(&self, instruction: &str) -> Result<RunOutcome, DriveError> {
        self.run_with(instruction, None, None).await
    }

    /// Run against an existing session and/or an explicit budget.
    pub async fn run_with(
        &self,
        instruction: &str,
        session_id: Option<&str>,
        max_iterations: Option<u32>,
    ) -> Result<RunOutcome, DriveError> {
        let run_id = nanoid!();
        let budget = max_iterations.unwrap_or(self.cfg.max_iterations);
        info!(run = %run_id, budget, "starting run");

        let (session, first_screen) = self.bootstrap(session_id).await?;
        self.offer_capture(&run_id, None, &first_screen).await;

        let result = self
            .drive(&run_id, instruction, &session, first_screen, budget)
            .await?;
        let verdict = evaluate(result.success, result.iterations, &result.message);
        let message = if verdict.success {
            format!("Run completed successfully: {}", result.message)
        } else {
            format!("Run failed: {}", result.message)
        };
        info!(
            run = %run_id,
            success = verdict.success,
            iterations = result.iterations,
            reason = %verdict.reason,
            "run finished"
        );
        Ok(RunOutcome {
            run_id,
            success: verdict.success,
            session_id: result.session_id,
            message,
            iterations: result.iterations,
            reason: verdict.reason,
        })
    }

    async fn bootstrap(
        &self,
        session_id: Option<&str>,
    ) -> Result<(Session, ScreenCapture), DriveError> {
        let session = match session_id {
            None => {
                info!("provisioning device session");
                let session = self
                    .device
                    .create_session()
                    .await
                    .map_err(|e| DriveError::SessionCreation(e.to_string()))?;
                info!(session = %session.id, "session ready");
                // Let the device finish booting before the first capture.
                sleep(self.cfg.creation_settle).await;
                session
            }
            Some(id) => match self.registry.lookup(id).await {
                Some(session) => session,
                None => self
                    .device
                    .resolve_session(id)
                    .await
                    .map_err(|e| DriveError::SessionNotFound(format!("{id}: {e}")))?,
            },
        };
        self.registry.register(session.clone()).await;

        let screen = self
            .device
            .capture(&session.id, CaptureOptions::default())
            .await
            .map_err(|e| DriveError::Capture(e.to_string()))?;
        Ok((session, screen))
    }

    async fn drive(
        &self,
        run_id: &str,
        instruction: &str,
        session: &Session,
        first_screen: ScreenCapture,
        budget: u32,
    ) -> Result<LoopResult, DriveError> {
        let mut screen = first_screen;
        let mut conversation: Option<ConversationHandle> = None;
        let mut last_messages: Vec<String> = Vec::new();
        let mut records: Vec<IterationRecord> = Vec::new();

        while (records.len() as u32) < budget {
            let prediction = match self
                .predictor
                .predict(instruction, &screen, conversation.as_ref())
                .await
            {
                Ok(prediction) => prediction,
                // No action has run yet on a failed opening turn; there is
                // no partial progress to report.
                Err(err) if conversation.is_none() => return Err(err),
                Err(err) => {
                    warn!(run = %run_id, %err, "prediction failed mid-run, stopping");
                    return Ok(LoopResult {
                        success: false,
                        session_id: session.id.clone(),
                        message: final_message(&last_messages, records.len() as u32),
                        iterations: records.len() as u32,
                    });
                }
            };
            last_messages = prediction.messages.clone();

            let Some(call) = prediction.calls.first() else {
                info!(run = %run_id, "no further actions proposed, task finished");
                break;
            };

            // Only the first proposed action runs. Acting on the rest would
            // desynchronize the screen from what the service believes it
            // looks like after one call.
            let action = match call.action.decode() {
                Ok(action) => {
                    info!(
                        run = %run_id,
                        iteration = records.len() as u32 + 1,
                        kind = action.kind(),
                        "executing action"
                    );
                    let outcome = actions::apply(&self.device, &session.id, &action).await;
                    debug!(run = %run_id, ?outcome, "action outcome");
                    Some(action)
                }
                Err(err) => {
                    warn!(run = %run_id, %err, "skipping malformed action");
                    None
                }
            };

            sleep(self.cfg.settle).await;

            match self
                .device
                .capture(&session.id, CaptureOptions::default())
                .await
            {
                Ok(next) => {
                    self.offer_capture(run_id, Some(records.len() as u32), &next)
                        .await;
                    screen = next;
                }
                Err(err) => {
                    warn!(run = %run_id, %err, "capture failed, reusing previous screen");
                }
            }

            conversation = prediction.continuation();
            let record = IterationRecord {
                index: records.len() as u32,
                action,
                screen: screen.id.clone(),
            };
            debug!(
                run = %run_id,
                index = record.index,
                action = ?record.action.as_ref().map(Action::kind),
                screen = %record.screen,
                "iteration recorded"
            );
            records.push(record);
        }

        Ok(LoopResult {
            success: true,
            session_id: session.id.clone(),
            message: final_message(&last_messages, records.len() as u32),
            iterations: records.len() as u32,
        })
    }

    async fn offer_capture(&self, run_id: &str, iteration: Option<u32>, capture: &ScreenCapture) {
        if let Some(store) = &self.capture_store {
            if let Err(err) = store.save(run_id, iteration, capture).await {
                debug!(run = %run_id, %err, "capture store rejected screen");
            }
        }
    }
}

fn final_message(last_messages: &[String], iterations: u32) -> String {
    if last_messages.is_empty() {
        format!("Completed {iterations} iterations")
    } else {
        last_messages.join(" ")
    }
}

/// Iteration count at which a run is assumed to have been legitimately
/// involved rather than stuck. A fixed heuristic threshold, not derived
/// from the configured budget.
const HEAVY_USE_ITERATIONS: u32 = 8;

const FAILURE_CUES: [&str; 3] = ["error", "failed", "unable"];
const SUCCESS_CUES: [&str; 4] = ["complete", "success", "done", "finished"];

/// Classify a finished loop.
///
/// A lexical heuristic over the final message plus the iteration count. It
/// never inspects the screens themselves, so the verdict is advisory, not
/// verified. Failure cues outrank success cues: a message like "failed to
/// complete" must read as failure.
pub fn evaluate(loop_succeeded: bool, iterations: u32, message: &str) -> Verdict {
    if !loop_succeeded {
        return Verdict {
            success: false,
            reason: "control loop error".into(),
        };
    }
    if iterations == 0 {
        return Verdict {
            success: false,
            reason: "no actions executed - task may not have been understood".into(),
        };
    }
    let lower = message.to_lowercase();
    if FAILURE_CUES.iter().any(|cue| lower.contains(cue)) {
        return Verdict {
            success: false,
            reason: "task failed based on error indicators in the final message".into(),
        };
    }
    if SUCCESS_CUES.iter().any(|cue| lower.contains(cue)) {
        return Verdict {
            success: true,
            reason: "task appears to have completed successfully based on the final message"
                .into(),
        };
    }
    if iterations >= HEAVY_USE_ITERATIONS {
        return Verdict {
            success: true,
            reason: format!("task used {iterations} iterations and completed without errors"),
        };
    }
    Verdict {
        success: true,
        reason: format!("task completed {iterations} action(s) successfully"),
    }
}
