use anyhow::{Result, anyhow};
use headless_chrome::Tab;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use crate::types::{
    ControlsState, LongRunningSighting, MessageAuthor, MessageSnapshot, Observation,
};

/// JavaScript injected into the page to extract the last chat message.
/// NON-DESTRUCTIVE: reads the DOM without modifying styles or layout.
///
/// The probe:
///   1. Prefers elements carrying an explicit assistant role attribute,
///      falling back through generic message-content selectors.
///   2. Resolves the author with a single authoritative role check: an
///      enclosing user-role container or a "You said" turn label wins,
///      then the nearest explicit role marker, else "unknown".
///   3. Returns the message text plus the text of its last few visible
///      block elements.
const MESSAGE_JS: &str = r#"
(() => {
  const visible = el => el && el.offsetParent !== null;

  const roleOf = el => {
    const enclosingUser = el.parentElement &&
      el.parentElement.closest('[data-message-author-role="user"]');
    if (enclosingUser) return 'user';
    const turn = el.closest('[data-testid^="conversation-turn"], article');
    if (turn) {
      const label = turn.querySelector('h5.sr-only');
      if (label && label.textContent.includes('You said')) return 'user';
    }
    const owner = el.closest('[data-message-author-role]');
    if (!owner) return 'unknown';
    return owner.getAttribute('data-message-author-role') === 'assistant'
      ? 'assistant' : 'user';
  };

  let candidates = Array.from(
    document.querySelectorAll('[data-message-author-role="assistant"]')
  ).filter(el => visible(el) && el.textContent.trim().length > 0);

  if (candidates.length === 0) {
    const fallbacks = ['div.agent-turn', 'div.markdown', '.prose', 'article .prose'];
    for (const sel of fallbacks) {
      candidates = Array.from(document.querySelectorAll(sel))
        .filter(el => visible(el) && el.textContent.trim().length > 0);
      if (candidates.length > 0) break;
    }
  }
  if (candidates.length === 0) return JSON.stringify({ found: false });

  const last = candidates[candidates.length - 1];
  const blocks = Array.from(last.querySelectorAll('p, li'))
    .filter(el => visible(el) && el.textContent.trim().length > 0)
    .slice(-3)
    .map(el => el.textContent.trim());

  return JSON.stringify({
    found: true,
    author: roleOf(last),
    text: last.textContent || '',
    recent_blocks: blocks,
  });
})()
"#;

/// Reports the enabled/disabled/missing state of the text-entry surface and
/// of the send control, independently. A disabled marker on any visible
/// entry (or on an enclosing disabled container) counts as disabled.
const CONTROLS_JS: &str = r#"
(() => {
  const visible = el => el && el.offsetParent !== null;
  const disabledAttr = el =>
    el.disabled || el.getAttribute('disabled') === 'true' ||
    el.getAttribute('aria-disabled') === 'true';

  const entries = [
    ...document.querySelectorAll('#prompt-textarea'),
    ...document.querySelectorAll('textarea'),
    ...document.querySelectorAll('[contenteditable="true"]'),
  ].filter(visible);

  let entry = 'missing';
  if (entries.length > 0) {
    entry = 'enabled';
    for (const el of entries) {
      if (disabledAttr(el) || el.closest('div[disabled]')) {
        entry = 'disabled';
        break;
      }
    }
  }

  const buttons = Array.from(document.querySelectorAll(
    'button[data-testid="send-button"], form button[type="submit"], button.absolute'
  )).filter(visible);
  let submit = 'missing';
  if (buttons.length > 0) {
    submit = buttons.some(b => !b.disabled) ? 'enabled' : 'disabled';
  }

  return JSON.stringify({ entry, submit });
})()
"#;

/// True when any recognized streaming/loading affordance is visible.
const GENERATION_JS: &str = r#"
(() => {
  const visible = el => el && el.offsetParent !== null;
  const indicators = [
    '.result-streaming', '.loading', '.animate-pulse', '.animate-spin',
    '[data-state="loading"]', '[role="progressbar"]',
    '.text-token-text-streaming', '.text-message.loading',
    '.text-token-streaming', '.text-cursor', '.result-thinking',
    '.blinking-cursor', '.animate-blink',
  ];
  const busy = indicators.some(sel =>
    Array.from(document.querySelectorAll(sel)).some(visible));
  return JSON.stringify({ busy });
})()
"#;

/// Locates the labeled extended-processing container and classifies it:
/// "active" while it shows a progress indicator or a Details disclosure,
/// "quiet" when the container is present without either, "absent" when no
/// such container exists.
const LONG_RUNNING_JS: &str = r#"
(() => {
  const visible = el => el && el.offsetParent !== null;
  const HEADER = 'Request for o1 pro mode';
  const containers = Array.from(document.querySelectorAll(
    '.inline-flex.flex-col.items-start.justify-start.rounded-2xl'
  )).filter(visible);

  let sighting = 'absent';
  for (const container of containers) {
    const header =
      container.querySelector('.text-token-text-primary')?.textContent?.trim() ||
      container.querySelector('.font-medium')?.textContent?.trim() ||
      container.querySelector('.text-token-text-secondary')?.textContent?.trim();
    if (header !== HEADER) continue;
    sighting = 'quiet';
    if (container.querySelector('div[style*="height: 8px"]')) {
      sighting = 'active';
      break;
    }
    const details = Array.from(container.querySelectorAll('button'))
      .find(b => (b.textContent || '').trim() === 'Details');
    if (details) {
      sighting = 'active';
      break;
    }
  }
  return JSON.stringify({ sighting });
})()
"#;

#[derive(Debug, Deserialize)]
struct MessageProbe {
    found: bool,
    #[serde(default)]
    author: Option<MessageAuthor>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    recent_blocks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenerationProbe {
    busy: bool,
}

#[derive(Debug, Deserialize)]
struct LongRunningProbe {
    sighting: LongRunningSighting,
}

/// Run every probe and assemble the tick's observation. Each probe degrades
/// to a safe default on an unexpected page shape: no message, surfaces
/// missing (which fails open downstream), not generating, not in extended
/// processing. The loop itself never fails on a probe.
pub fn observe(tab: &Arc<Tab>) -> Observation {
    let message = match eval_json::<MessageProbe>(tab, MESSAGE_JS) {
        Ok(probe) if probe.found => Some(MessageSnapshot {
            text: probe.text.unwrap_or_default(),
            author: probe.author.unwrap_or(MessageAuthor::Unknown),
            recent_blocks: probe.recent_blocks,
        }),
        Ok(_) => None,
        Err(e) => {
            debug!("message probe failed: {e:#}");
            None
        }
    };

    let controls = eval_json::<ControlsState>(tab, CONTROLS_JS).unwrap_or_else(|e| {
        debug!("controls probe failed: {e:#}");
        ControlsState::default()
    });

    let generating = eval_json::<GenerationProbe>(tab, GENERATION_JS)
        .map(|probe| probe.busy)
        .unwrap_or_else(|e| {
            debug!("generation probe failed: {e:#}");
            false
        });

    let long_running = probe_long_running(tab);

    Observation {
        message,
        controls,
        generating,
        long_running,
    }
}

/// Standalone extended-processing probe, also used by the emitter path for
/// its final recheck before acting.
pub fn probe_long_running(tab: &Arc<Tab>) -> LongRunningSighting {
    eval_json::<LongRunningProbe>(tab, LONG_RUNNING_JS)
        .map(|probe| probe.sighting)
        .unwrap_or_else(|e| {
            debug!("long-running probe failed: {e:#}");
            LongRunningSighting::Absent
        })
}

/// Evaluate a probe that returns a JSON string and parse it.
pub(crate) fn eval_json<T: DeserializeOwned>(tab: &Arc<Tab>, js: &str) -> Result<T> {
    let result = tab.evaluate(js, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| anyhow!("probe returned no string"))?;
    Ok(serde_json::from_str(&raw)?)
}
