use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Deserialize;

/// Everything one tick of the controller observes on the page.
/// Produced by the probes in `dom.rs`, consumed by `brain.rs`.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub message: Option<MessageSnapshot>,
    pub controls: ControlsState,
    pub generating: bool,
    pub long_running: LongRunningSighting,
}

/// The last chat message as extracted by the message probe.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageSnapshot {
    pub text: String,
    pub author: MessageAuthor,
    /// Text of the last few block-level elements (paragraphs / list items)
    /// inside the message, checked separately for completion phrases.
    #[serde(default)]
    pub recent_blocks: Vec<String>,
}

/// Author role of the extracted message. The probe walks up from the
/// candidate node to the nearest explicit role marker; anything other than a
/// confident `Assistant` means the controller must not continue this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAuthor {
    Assistant,
    User,
    Unknown,
}

/// Visibility/enabled state of the text-entry surface and the send control.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ControlsState {
    #[serde(default)]
    pub entry: SurfaceState,
    #[serde(default)]
    pub submit: SurfaceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceState {
    Enabled,
    Disabled,
    /// No matching visible element could be located at all.
    #[default]
    Missing,
}

/// What the extended-processing probe saw this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LongRunningSighting {
    /// No labeled processing container near the last message.
    #[default]
    Absent,
    /// Container present with an active progress indicator or a Details
    /// disclosure control.
    Active,
    /// Container present but no active indicator.
    Quiet,
}

/// Outcome of one tick's assessment.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue { reason: ContinueReason },
    Hold(Hold),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueReason {
    /// Fast path: stable poll counter reached with the input ready.
    Stable,
    /// Wall-clock fallback: unchanged long enough that readiness is waived.
    LongStable,
}

impl ContinueReason {
    pub fn status(&self) -> &'static str {
        match self {
            ContinueReason::Stable => "Continuing...",
            ContinueReason::LongStable => "Long stable, continuing...",
        }
    }
}

/// Why a tick took no action. Gating outcomes, not errors; each maps to a
/// short status line on the control panel.
#[derive(Debug, Clone, PartialEq)]
pub enum Hold {
    Disabled,
    AwaitingResponse,
    CoolingDown { remaining: Duration },
    LongRunning,
    NoMessage,
    NotAssistantMessage,
    Unstable { repeats: u32 },
    Generating,
    InputNotReady,
    Complete,
    BudgetExhausted { max: u32 },
}

impl Hold {
    pub fn status(&self) -> String {
        match self {
            Hold::Disabled => "Inactive".into(),
            Hold::AwaitingResponse => "Waiting for response...".into(),
            Hold::CoolingDown { remaining } => {
                format!("Cooling down ({}s)", remaining.as_secs().max(1))
            }
            Hold::LongRunning => "Extended processing, wait".into(),
            Hold::NoMessage => "No message found".into(),
            Hold::NotAssistantMessage => "Last message is not the assistant's".into(),
            Hold::Unstable { repeats: 0 } => "Monitoring...".into(),
            Hold::Unstable { repeats } => {
                format!("Content stable ({}/{})", repeats, STABLE_POLLS)
            }
            Hold::Generating => "Response still generating".into(),
            Hold::InputNotReady => "Input not ready".into(),
            Hold::Complete => "Message complete".into(),
            Hold::BudgetExhausted { max } => format!("Max continues ({}) reached", max),
        }
    }
}

/// The literal synthesized into the input surface for every continuation.
pub const CONTINUE_PROMPT: &str = "continue";

/// Controller tick cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive unchanged polls required by the fast stability path.
pub const STABLE_POLLS: u32 = 3;
/// Wall-clock fallback: unchanged this long counts as stable even if the
/// poll counter never reached its threshold.
pub const STABLE_WALLCLOCK: Duration = Duration::from_secs(10);
/// Minimum spacing between continuation attempts.
pub const COOLDOWN: Duration = Duration::from_secs(10);
/// Post-click settle window during which readiness is not evaluated.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(5);
/// How long the extended-processing state outlives its last visible
/// indicator, to absorb UI flicker between processing phases.
pub const LONG_RUNNING_GRACE: Duration = Duration::from_secs(10);
/// Pause between writing the input surface and clicking send.
pub const CLICK_DELAY: Duration = Duration::from_millis(100);

/// Messages shorter than this are judged "continue" without further rules.
pub const MIN_MESSAGE_CHARS: usize = 10;

pub const DEFAULT_MAX_CONTINUES: u32 = 7;
pub const MAX_CONTINUES_RANGE: RangeInclusive<u32> = 1..=100;
