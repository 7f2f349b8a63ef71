use anyhow::Result;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dom::eval_json;
use crate::types::{CLICK_DELAY, CONTINUE_PROMPT};

/// Text-entry surface probe order. First visible, enabled match wins.
pub const INPUT_SURFACE_SELECTORS: [&str; 6] = [
    "#prompt-textarea",
    "[role=\"textbox\"]",
    ".ProseMirror",
    "[contenteditable=\"true\"]",
    "form textarea",
    "textarea",
];

/// Send-control probe order, tried before the proximity fallback.
pub const SEND_BUTTON_SELECTORS: [&str; 7] = [
    "button[data-testid=\"send-button\"]",
    "button.absolute.p-1",
    "button[type=\"submit\"]",
    "form button:last-of-type",
    "button.chat-send-button",
    "button[aria-label=\"Send message\"]",
    "button svg[data-testid=\"send-button\"]",
];

/// The browser stays open this long with no DevTools traffic; the toggle
/// can sit off for extended periods, so the window is generous.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Persistent browser session. Created once, reused for the whole run.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
}

impl BrowserSession {
    /// Attach to an already-running Chrome on the DevTools port, falling
    /// back to launching one with a local profile directory.
    pub fn launch(attach_url: &str) -> Result<Self> {
        info!("attempting to attach to Chrome at {attach_url}");
        if let Ok(browser) = Browser::connect(attach_url.to_string()) {
            info!("attached to existing Chrome");
            let tab = {
                let tabs_lock = browser.get_tabs();
                let tabs = tabs_lock.lock().unwrap();
                match tabs.first() {
                    Some(t) => t.clone(),
                    None => browser.new_tab()?,
                }
            };
            return Ok(Self {
                _browser: browser,
                tab,
            });
        }

        warn!("could not attach, launching a new Chrome");

        let profile = std::env::current_dir()?.join("continuer_profile");
        std::fs::create_dir_all(&profile)?;

        let options = LaunchOptions {
            headless: false,
            user_data_dir: Some(profile),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
            ..Default::default()
        };

        let browser = Browser::new(options)?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    pub fn navigate(&self, url: &str) -> Result<()> {
        self.tab.navigate_to(url)?;
        self.tab.wait_for_element("body")?;
        Ok(())
    }
}

/// How a continuation delivery ended. Lookup misses are reported, not
/// raised: the attempt counter has already moved by the time this runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// No visible, enabled text-entry surface could be located.
    InputMissing,
    /// The text was placed but no send control could be located.
    SendMissing,
    /// The send control was clicked.
    Clicked,
}

#[derive(Debug, Deserialize)]
struct SetInputResult {
    placed: bool,
    #[serde(default)]
    surface: String,
}

#[derive(Debug, Deserialize)]
struct ClickResult {
    clicked: bool,
    #[serde(default)]
    fallback: bool,
}

/// Write the continue prompt into the first usable input surface and, after
/// a short pause, click the send control. The pause lets the host page's
/// own input handlers observe the synthetic events before submission.
pub fn send_continue(tab: &Arc<Tab>) -> Result<EmitOutcome> {
    let placed: SetInputResult = eval_json(tab, &set_input_js())?;
    if !placed.placed {
        return Ok(EmitOutcome::InputMissing);
    }
    debug!(surface = %placed.surface, "continue prompt placed");

    std::thread::sleep(CLICK_DELAY);

    let click: ClickResult = eval_json(tab, &click_send_js())?;
    if !click.clicked {
        return Ok(EmitOutcome::SendMissing);
    }
    if click.fallback {
        debug!("send control found by proximity fallback");
    }
    Ok(EmitOutcome::Clicked)
}

/// Finds the input surface by priority, writes the prompt with the
/// surface-appropriate technique (the native value setter for textareas so
/// frameworks tracking the property see the change), raises the
/// input/change events the page needs, and tags the field so the click
/// probe can measure proximity from it.
const SET_INPUT_TEMPLATE: &str = r#"
(() => {
  const visible = el => el && el.offsetParent !== null;
  const SELECTORS = __SELECTORS__;

  let field = null;
  for (const sel of SELECTORS) {
    const el = document.querySelector(sel);
    if (visible(el) && !el.disabled && el.getAttribute('disabled') !== 'true') {
      field = el;
      break;
    }
  }
  if (!field) return JSON.stringify({ placed: false, surface: '' });

  if (field.tagName === 'TEXTAREA') {
    const setter = Object.getOwnPropertyDescriptor(
      window.HTMLTextAreaElement.prototype, 'value'
    ).set;
    setter.call(field, __PROMPT__);
  } else {
    field.textContent = __PROMPT__;
  }

  field.dispatchEvent(new Event('input', { bubbles: true }));
  field.dispatchEvent(new Event('change', { bubbles: true }));
  field.focus();
  field.setAttribute('data-continuer-field', '1');

  return JSON.stringify({ placed: true, surface: field.tagName.toLowerCase() });
})()
"#;

/// Tries the named send-control selectors first (unwrapping svg matches to
/// their button), then falls back to the enabled button nearest the tagged
/// input field by Euclidean distance between bounding boxes.
const CLICK_SEND_TEMPLATE: &str = r#"
(() => {
  const visible = el => el && el.offsetParent !== null;
  const SELECTORS = __SELECTORS__;

  let button = null;
  let fallback = false;
  for (const sel of SELECTORS) {
    for (const el of document.querySelectorAll(sel)) {
      const candidate = el.tagName.toLowerCase() === 'svg' ? el.closest('button') : el;
      if (candidate && visible(candidate) && !candidate.disabled) {
        button = candidate;
        break;
      }
    }
    if (button) break;
  }

  if (!button) {
    const field = document.querySelector('[data-continuer-field]');
    if (field) {
      const anchor = field.getBoundingClientRect();
      const buttons = Array.from(document.querySelectorAll('button'))
        .filter(b => visible(b) && !b.disabled);
      buttons.sort((a, b) => {
        const ra = a.getBoundingClientRect();
        const rb = b.getBoundingClientRect();
        const da = Math.hypot(ra.left - anchor.right, ra.top - anchor.top);
        const db = Math.hypot(rb.left - anchor.right, rb.top - anchor.top);
        return da - db;
      });
      button = buttons[0] || null;
      fallback = button !== null;
    }
  }

  if (!button) return JSON.stringify({ clicked: false, fallback: false });
  button.click();
  return JSON.stringify({ clicked: true, fallback });
})()
"#;

fn set_input_js() -> String {
    SET_INPUT_TEMPLATE
        .replace("__SELECTORS__", &selector_array(&INPUT_SURFACE_SELECTORS))
        .replace(
            "__PROMPT__",
            &serde_json::to_string(CONTINUE_PROMPT).expect("prompt literal serializes"),
        )
}

fn click_send_js() -> String {
    CLICK_SEND_TEMPLATE.replace("__SELECTORS__", &selector_array(&SEND_BUTTON_SELECTORS))
}

fn selector_array(selectors: &[&str]) -> String {
    serde_json::to_string(selectors).expect("selector list serializes")
}
