use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use tracing::debug;

use crate::types::{
    COOLDOWN, ContinueReason, ControlsState, Decision, Hold, LONG_RUNNING_GRACE,
    LongRunningSighting, MIN_MESSAGE_CHARS, MessageAuthor, Observation, SETTLE_WINDOW,
    STABLE_POLLS, STABLE_WALLCLOCK, SurfaceState,
};

/// Completion phrases matched case-insensitively against the message text.
const ENGLISH_COMPLETION_PHRASES: &[&str] = &[
    "that covers everything",
    "no additional",
    "we are at an impasse",
    "there is no more",
    "there is no further",
    "no further",
    "we've provided the complete",
    "we\u{2019}ve provided the complete",
    "we have reached",
    "there is no remaining",
    "no remaining",
    "that concludes",
    "have addressed all",
    "have covered all",
    "is there anything else you'd like to know",
    "is there anything else you would like to know",
    "if you have any more questions",
    "if you have any other questions",
    "hope this helps",
    "let me know if you need",
    "feel free to ask",
];

/// Completion phrases matched verbatim; case folding does not apply.
const CHINESE_COMPLETION_PHRASES: &[&str] = &[
    "全文完",
    "已完成全部",
    "如果还有其他需求",
    "已无更多",
    "以上即为全",
    "没有更多",
    "完全结束",
    "全部结束",
    "全部内容",
    "没有更多后续对话内容",
    "所有内容",
    "已全部",
    "以上即为原文的完整",
];

/// Last-line shapes that indicate structurally unfinished output: a
/// numbered-list item, a bullet item, a markdown table row, a lone closing
/// brace. Open code fences are handled by fence parity, not a line pattern,
/// so a closing fence on the last line is not misread as a continuation.
fn continuation_line_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^\d+\s*[).\-]",
            r"^\s*[-*\u{2022}]\s+",
            r"^\s*\|.*\|\s*$",
            r"^\s*\}",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("continuation pattern is valid"))
        .collect()
    })
}

/// How many trailing block elements are scanned for completion phrases.
const RECENT_BLOCK_WINDOW: usize = 3;

/// The completeness heuristic. Evaluated only on stabilized text; `true`
/// means the response looks cut short and a continuation should be sent.
///
/// Fixed priority chain, first match wins:
/// 1. empty text: stop; non-empty but very short: continue
/// 2. last non-blank line matches a continuation-in-progress shape
/// 3. unterminated code fence anywhere in the text
/// 4. a completion phrase in the full text or the trailing blocks: stop
/// 5. stylistic tail signals, defaulting to "assume incomplete"
pub fn should_continue(text: &str, recent_blocks: &[String]) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.chars().count() < MIN_MESSAGE_CHARS {
        return true;
    }

    if let Some(line) = trimmed.lines().rev().find(|l| !l.trim().is_empty()) {
        if continuation_line_patterns().iter().any(|re| re.is_match(line)) {
            debug!(line, "last line looks mid-structure");
            return true;
        }
    }

    if trimmed.matches("```").count() % 2 == 1 {
        debug!("unterminated code fence");
        return true;
    }

    if contains_completion_phrase(trimmed) {
        return false;
    }
    let tail_blocks = recent_blocks.len().saturating_sub(RECENT_BLOCK_WINDOW);
    if recent_blocks[tail_blocks..]
        .iter()
        .any(|block| contains_completion_phrase(block))
    {
        return false;
    }

    tail_suggests_more(trimmed)
}

fn contains_completion_phrase(text: &str) -> bool {
    if CHINESE_COMPLETION_PHRASES.iter().any(|p| text.contains(p)) {
        return true;
    }
    let lower = text.to_lowercase();
    ENGLISH_COMPLETION_PHRASES.iter().any(|p| lower.contains(p))
}

const TERMINAL_PUNCTUATION: &[char] = &[
    '.', '!', '?', '。', '！', '？', '"', '”', '\'', '’', '」', '』', ')', '）',
];

/// Characters a final paragraph may reasonably end on when it wraps up.
const SHORT_TAIL_PARAGRAPH_CHARS: usize = 120;

fn tail_suggests_more(text: &str) -> bool {
    let tail = text.trim_end();

    if ends_with_continuation_marker(tail) {
        return true;
    }
    if tail.ends_with("```") {
        return false;
    }
    if !tail.ends_with(TERMINAL_PUNCTUATION) {
        return true;
    }

    // Punctuated ending: a short closing paragraph reads as a wrap-up.
    let last_paragraph = tail.rsplit("\n\n").next().unwrap_or(tail).trim();
    if last_paragraph.chars().count() <= SHORT_TAIL_PARAGRAPH_CHARS {
        return false;
    }

    true
}

fn ends_with_continuation_marker(tail: &str) -> bool {
    if tail.ends_with("...") || tail.ends_with('…') {
        return true;
    }
    let lower = tail.to_lowercase();
    lower.ends_with("to be continued")
        || lower.ends_with("to be continued)")
        || tail.ends_with("未完待续")
}

/// Per-session decision state: the stability tracker, the attempt budget,
/// the cooldown/settle windows and the extended-processing grace timestamp.
/// Pure with respect to time (`now` is always passed in) so every transition
/// is testable without a browser or real timers.
pub struct Monitor {
    enabled: bool,
    attempts_made: u32,
    attempts_max: u32,
    last_text: Option<String>,
    last_change: Option<Instant>,
    stable_repeats: u32,
    cooldown_until: Option<Instant>,
    waiting_until: Option<Instant>,
    long_running_seen: Option<Instant>,
}

impl Monitor {
    pub fn new(attempts_max: u32) -> Self {
        Self {
            enabled: false,
            attempts_made: 0,
            attempts_max,
            last_text: None,
            last_change: None,
            stable_repeats: 0,
            cooldown_until: None,
            waiting_until: None,
            long_running_seen: None,
        }
    }

    /// Arm or disarm monitoring. A false-to-true transition starts a fresh
    /// session: the attempt counter, stability tracker and rate-limit
    /// windows all reset.
    pub fn set_enabled(&mut self, on: bool) {
        if on && !self.enabled {
            self.attempts_made = 0;
            self.stable_repeats = 0;
            self.last_text = None;
            self.last_change = None;
            self.cooldown_until = None;
            self.waiting_until = None;
        }
        self.enabled = on;
    }

    pub fn set_max(&mut self, attempts_max: u32) {
        self.attempts_max = attempts_max;
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn stable_repeats(&self) -> u32 {
        self.stable_repeats
    }

    /// Record that an attempt is being initiated. The counter moves before
    /// delivery is confirmed; it tracks attempts-initiated by design.
    pub fn begin_attempt(&mut self, now: Instant) -> u32 {
        self.attempts_made += 1;
        self.cooldown_until = Some(now + COOLDOWN);
        self.stable_repeats = 0;
        self.attempts_made
    }

    /// Open the post-click settle window.
    pub fn mark_waiting(&mut self, now: Instant) {
        self.waiting_until = Some(now + SETTLE_WINDOW);
    }

    /// Refresh the extended-processing timestamp (used by the emitter-side
    /// recheck, which bypasses `assess`).
    pub fn note_long_running(&mut self, now: Instant) {
        self.long_running_seen = Some(now);
    }

    /// One tick of the controller state machine. Strict evaluation order:
    /// arming -> settle window -> cooldown -> extended processing ->
    /// message read -> author -> stability -> generation -> readiness ->
    /// completeness -> budget.
    pub fn assess(&mut self, obs: &Observation, now: Instant) -> Decision {
        if !self.enabled {
            return Decision::Hold(Hold::Disabled);
        }

        if let Some(until) = self.waiting_until {
            if now < until {
                return Decision::Hold(Hold::AwaitingResponse);
            }
            self.waiting_until = None;
        }

        if let Some(until) = self.cooldown_until {
            if now < until {
                return Decision::Hold(Hold::CoolingDown {
                    remaining: until - now,
                });
            }
            self.cooldown_until = None;
        }

        if self.long_running_active(obs.long_running, now) {
            return Decision::Hold(Hold::LongRunning);
        }

        let Some(message) = obs.message.as_ref() else {
            return Decision::Hold(Hold::NoMessage);
        };
        if message.author != MessageAuthor::Assistant {
            return Decision::Hold(Hold::NotAssistantMessage);
        }

        if self.last_text.as_deref() != Some(message.text.as_str()) {
            self.last_text = Some(message.text.clone());
            self.last_change = Some(now);
            self.stable_repeats = 0;
            return Decision::Hold(Hold::Unstable { repeats: 0 });
        }
        self.stable_repeats += 1;

        let stable_fast = self.stable_repeats >= STABLE_POLLS;
        let stable_slow = self
            .last_change
            .is_some_and(|changed| now.saturating_duration_since(changed) >= STABLE_WALLCLOCK);
        if !stable_fast && !stable_slow {
            return Decision::Hold(Hold::Unstable {
                repeats: self.stable_repeats,
            });
        }

        if generation_in_progress(obs) {
            return Decision::Hold(Hold::Generating);
        }

        // The wall-clock path waives readiness: a UI that stopped emitting
        // change events may also be sitting on a stale disabled state.
        if !input_ready(&obs.controls) && !stable_slow {
            return Decision::Hold(Hold::InputNotReady);
        }

        if !should_continue(&message.text, &message.recent_blocks) {
            return Decision::Hold(Hold::Complete);
        }

        if self.attempts_made >= self.attempts_max {
            return Decision::Hold(Hold::BudgetExhausted {
                max: self.attempts_max,
            });
        }

        let reason = if stable_fast && input_ready(&obs.controls) {
            ContinueReason::Stable
        } else {
            ContinueReason::LongStable
        };
        Decision::Continue { reason }
    }

    fn long_running_active(&mut self, sighting: LongRunningSighting, now: Instant) -> bool {
        match sighting {
            LongRunningSighting::Active => {
                self.long_running_seen = Some(now);
                true
            }
            LongRunningSighting::Quiet => {
                if let Some(seen) = self.long_running_seen {
                    if now.saturating_duration_since(seen) < LONG_RUNNING_GRACE {
                        return true;
                    }
                    self.long_running_seen = None;
                }
                false
            }
            LongRunningSighting::Absent => {
                self.long_running_seen = None;
                false
            }
        }
    }
}

/// Input-readiness policy over the raw surface states, in priority order:
/// a present text entry decides by itself; with no entry, the submit
/// control decides; with neither locatable, fail open so the controller
/// cannot deadlock on a page it does not understand.
fn input_ready(controls: &ControlsState) -> bool {
    match controls.entry {
        SurfaceState::Enabled => true,
        SurfaceState::Disabled => false,
        SurfaceState::Missing => !matches!(controls.submit, SurfaceState::Disabled),
    }
}

/// A visible streaming affordance, or entry and submit disabled together —
/// the combined signal is more reliable than either alone because some UIs
/// leave stale disabled states on buttons after streaming ends.
fn generation_in_progress(obs: &Observation) -> bool {
    obs.generating
        || (obs.controls.entry == SurfaceState::Disabled
            && obs.controls.submit == SurfaceState::Disabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageSnapshot;
    use std::time::Duration;

    fn eligible_obs(text: &str) -> Observation {
        Observation {
            message: Some(MessageSnapshot {
                text: text.to_string(),
                author: MessageAuthor::Assistant,
                recent_blocks: Vec::new(),
            }),
            controls: ControlsState {
                entry: SurfaceState::Enabled,
                submit: SurfaceState::Enabled,
            },
            generating: false,
            long_running: LongRunningSighting::Absent,
        }
    }

    /// Feed the same text until the fast stability path is satisfied,
    /// returning the decision of the final tick.
    fn stabilize(monitor: &mut Monitor, obs: &Observation, start: Instant) -> Decision {
        let mut decision = Decision::Hold(Hold::NoMessage);
        for i in 0..=STABLE_POLLS {
            decision = monitor.assess(obs, start + Duration::from_secs(i as u64));
        }
        decision
    }

    #[test]
    fn test_numbered_list_tail_continues() {
        assert!(should_continue("Step 1.\nStep 2.\n3.", &[]));
    }

    #[test]
    fn test_bullet_tail_continues() {
        assert!(should_continue("Here are the options:\n* alpha\n* beta", &[]));
        assert!(should_continue("Shopping list:\n- milk\n- eggs", &[]));
    }

    #[test]
    fn test_table_row_tail_continues() {
        assert!(should_continue(
            "Comparison so far:\n| name | size |\n| foo | 12 |",
            &[]
        ));
    }

    #[test]
    fn test_closing_brace_tail_continues() {
        assert!(should_continue("fn main() {\n    run();\n}", &[]));
    }

    #[test]
    fn test_unterminated_fence_continues() {
        assert!(should_continue(
            "hope this helps\n```rust\nlet x = 1;",
            &[]
        ));
    }

    #[test]
    fn test_closed_fence_tail_is_complete() {
        assert!(!should_continue(
            "A full example follows.\n\n```rust\nlet x = 1;\n```",
            &[]
        ));
    }

    #[test]
    fn test_english_phrase_is_complete() {
        assert!(!should_continue(
            "...and that covers everything you need.",
            &[]
        ));
        assert!(!should_continue("Hope This Helps, and good luck.", &[]));
    }

    #[test]
    fn test_chinese_phrase_is_complete() {
        assert!(!should_continue("第三章:结尾。\n\n全文完", &[]));
    }

    #[test]
    fn test_phrase_in_recent_block_is_complete() {
        let blocks = vec![
            "First paragraph of many".to_string(),
            "That concludes our discussion.".to_string(),
        ];
        assert!(!should_continue(
            "A long answer whose own tail is bland but whose last paragraph wraps up, \
             and which keeps going for a while so the short-paragraph rule cannot \
             decide on its own, because this single closing paragraph runs well past \
             the window",
            &blocks
        ));
    }

    #[test]
    fn test_ellipsis_tail_continues() {
        assert!(should_continue("And then the story went on...", &[]));
        assert!(should_continue("第二部分开始了……", &[]));
    }

    #[test]
    fn test_unpunctuated_tail_continues() {
        assert!(should_continue("The next step is to configure the", &[]));
    }

    #[test]
    fn test_short_wrapup_is_complete() {
        assert!(!should_continue("All of the steps are finished now.", &[]));
    }

    #[test]
    fn test_empty_text_stops_and_short_text_continues() {
        assert!(!should_continue("", &[]));
        assert!(!should_continue("   \n  ", &[]));
        assert!(should_continue("And so", &[]));
    }

    #[test]
    fn test_stability_counter() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let obs = eligible_obs("The next step is to configure the");
        let t0 = Instant::now();

        assert_eq!(
            monitor.assess(&obs, t0),
            Decision::Hold(Hold::Unstable { repeats: 0 })
        );
        monitor.assess(&obs, t0 + Duration::from_secs(1));
        monitor.assess(&obs, t0 + Duration::from_secs(2));
        assert_eq!(monitor.stable_repeats(), 2);

        let decision = monitor.assess(&obs, t0 + Duration::from_secs(3));
        assert!(matches!(decision, Decision::Continue { .. }));
    }

    #[test]
    fn test_text_change_resets_stability() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let t0 = Instant::now();
        let first = eligible_obs("Streaming has begun and");
        monitor.assess(&first, t0);
        monitor.assess(&first, t0 + Duration::from_secs(1));
        monitor.assess(&first, t0 + Duration::from_secs(2));
        assert_eq!(monitor.stable_repeats(), 2);

        let second = eligible_obs("Streaming has begun and more arrived");
        assert_eq!(
            monitor.assess(&second, t0 + Duration::from_secs(3)),
            Decision::Hold(Hold::Unstable { repeats: 0 })
        );
        assert_eq!(monitor.stable_repeats(), 0);
    }

    #[test]
    fn test_wallclock_fallback_waives_readiness() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let mut obs = eligible_obs("The next step is to configure the");
        obs.controls.entry = SurfaceState::Disabled;
        obs.controls.submit = SurfaceState::Enabled;
        let t0 = Instant::now();

        monitor.assess(&obs, t0);
        monitor.assess(&obs, t0 + Duration::from_secs(1));
        // Fast path satisfied but input not ready: held.
        monitor.assess(&obs, t0 + Duration::from_secs(2));
        assert_eq!(
            monitor.assess(&obs, t0 + Duration::from_secs(3)),
            Decision::Hold(Hold::InputNotReady)
        );

        // Past the wall-clock threshold the same state may continue.
        let decision = monitor.assess(&obs, t0 + Duration::from_secs(11));
        assert_eq!(
            decision,
            Decision::Continue {
                reason: ContinueReason::LongStable
            }
        );
    }

    #[test]
    fn test_attempt_budget_and_toggle_reset() {
        let mut monitor = Monitor::new(3);
        monitor.set_enabled(true);
        let obs = eligible_obs("The next step is to configure the");
        let t0 = Instant::now();

        let mut now = t0;
        for _ in 0..3 {
            let decision = stabilize(&mut monitor, &obs, now);
            assert!(matches!(decision, Decision::Continue { .. }));
            monitor.begin_attempt(now + Duration::from_secs(STABLE_POLLS as u64));
            // Step past the cooldown before the next round.
            now += Duration::from_secs(30);
        }
        assert_eq!(monitor.attempts_made(), 3);

        let decision = stabilize(&mut monitor, &obs, now);
        assert_eq!(decision, Decision::Hold(Hold::BudgetExhausted { max: 3 }));

        monitor.set_enabled(false);
        monitor.set_enabled(true);
        assert_eq!(monitor.attempts_made(), 0);
        let decision = stabilize(&mut monitor, &obs, now + Duration::from_secs(60));
        assert!(matches!(decision, Decision::Continue { .. }));
    }

    #[test]
    fn test_cooldown_blocks_then_releases() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let obs = eligible_obs("The next step is to configure the");
        let t0 = Instant::now();

        let decision = stabilize(&mut monitor, &obs, t0);
        assert!(matches!(decision, Decision::Continue { .. }));
        let emitted_at = t0 + Duration::from_secs(STABLE_POLLS as u64);
        monitor.begin_attempt(emitted_at);

        assert!(matches!(
            monitor.assess(&obs, emitted_at + Duration::from_secs(5)),
            Decision::Hold(Hold::CoolingDown { .. })
        ));

        // 11s later: cooldown over, and the text has been unchanged for more
        // than the wall-clock threshold, so the fallback path emits.
        let decision = monitor.assess(&obs, emitted_at + Duration::from_secs(11));
        assert!(matches!(decision, Decision::Continue { .. }));
    }

    #[test]
    fn test_settle_window_blocks_assessment() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let obs = eligible_obs("The next step is to configure the");
        let t0 = Instant::now();
        monitor.mark_waiting(t0);

        assert_eq!(
            monitor.assess(&obs, t0 + Duration::from_secs(2)),
            Decision::Hold(Hold::AwaitingResponse)
        );
        // Window elapsed: the tick proceeds to normal evaluation.
        assert_eq!(
            monitor.assess(&obs, t0 + Duration::from_secs(6)),
            Decision::Hold(Hold::Unstable { repeats: 0 })
        );
    }

    #[test]
    fn test_long_running_grace_window() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let t0 = Instant::now();

        let mut obs = eligible_obs("The next step is to configure the");
        obs.long_running = LongRunningSighting::Active;
        assert_eq!(monitor.assess(&obs, t0), Decision::Hold(Hold::LongRunning));

        // Indicator gone 3s later: still suppressed by the grace window.
        obs.long_running = LongRunningSighting::Quiet;
        assert_eq!(
            monitor.assess(&obs, t0 + Duration::from_secs(3)),
            Decision::Hold(Hold::LongRunning)
        );

        // 11s after last sighting the grace window has elapsed.
        assert_eq!(
            monitor.assess(&obs, t0 + Duration::from_secs(11)),
            Decision::Hold(Hold::Unstable { repeats: 0 })
        );
    }

    #[test]
    fn test_container_disappearing_clears_grace_immediately() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let t0 = Instant::now();

        let mut obs = eligible_obs("The next step is to configure the");
        obs.long_running = LongRunningSighting::Active;
        monitor.assess(&obs, t0);

        obs.long_running = LongRunningSighting::Absent;
        assert_eq!(
            monitor.assess(&obs, t0 + Duration::from_secs(1)),
            Decision::Hold(Hold::Unstable { repeats: 0 })
        );
    }

    #[test]
    fn test_generation_indicator_gates_continuation() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let mut obs = eligible_obs("The next step is to configure the");
        obs.generating = true;
        let t0 = Instant::now();

        assert_eq!(
            stabilize(&mut monitor, &obs, t0),
            Decision::Hold(Hold::Generating)
        );
    }

    #[test]
    fn test_combined_disabled_signal_counts_as_generating() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let mut obs = eligible_obs("The next step is to configure the");
        obs.controls.entry = SurfaceState::Disabled;
        obs.controls.submit = SurfaceState::Disabled;
        let t0 = Instant::now();

        assert_eq!(
            stabilize(&mut monitor, &obs, t0),
            Decision::Hold(Hold::Generating)
        );
    }

    #[test]
    fn test_missing_surfaces_fail_open() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let mut obs = eligible_obs("The next step is to configure the");
        obs.controls.entry = SurfaceState::Missing;
        obs.controls.submit = SurfaceState::Missing;
        let t0 = Instant::now();

        assert!(matches!(
            stabilize(&mut monitor, &obs, t0),
            Decision::Continue { .. }
        ));
    }

    #[test]
    fn test_non_assistant_message_is_skipped() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let mut obs = eligible_obs("The next step is to configure the");
        obs.message.as_mut().unwrap().author = MessageAuthor::User;
        let t0 = Instant::now();

        assert_eq!(
            monitor.assess(&obs, t0),
            Decision::Hold(Hold::NotAssistantMessage)
        );
    }

    #[test]
    fn test_complete_message_is_not_continued() {
        let mut monitor = Monitor::new(7);
        monitor.set_enabled(true);
        let obs = eligible_obs("...and that covers everything you need.");
        let t0 = Instant::now();

        assert_eq!(
            stabilize(&mut monitor, &obs, t0),
            Decision::Hold(Hold::Complete)
        );
    }

    #[test]
    fn test_disabled_monitor_never_acts() {
        let mut monitor = Monitor::new(7);
        let obs = eligible_obs("The next step is to configure the");
        assert_eq!(
            monitor.assess(&obs, Instant::now()),
            Decision::Hold(Hold::Disabled)
        );
    }
}
