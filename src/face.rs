use anyhow::{Result, bail};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::prefs;

/// Events streamed to the panel via SSE.
#[derive(Clone, Debug)]
pub enum PanelEvent {
    Status { message: String },
    Counter { made: u32, max: u32 },
    Enabled { on: bool },
}

impl PanelEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            PanelEvent::Status { message } => Event::default()
                .event("status")
                .data(json!({ "message": message }).to_string()),
            PanelEvent::Counter { made, max } => Event::default()
                .event("counter")
                .data(json!({ "made": made, "max": max }).to_string()),
            PanelEvent::Enabled { on } => Event::default()
                .event("enabled")
                .data(json!({ "on": on }).to_string()),
        }
    }
}

/// Shared between the panel handlers, the hotkey thread and the controller
/// loop. The store and status are only held across short synchronous
/// sections, so a plain mutex suffices.
pub struct AppState {
    store: Mutex<prefs::Store>,
    last_status: Mutex<String>,
    pub event_tx: broadcast::Sender<PanelEvent>,
}

impl AppState {
    fn new(store: prefs::Store) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            store: Mutex::new(store),
            last_status: Mutex::new(String::new()),
            event_tx,
        }
    }

    /// (enabled, attempt cap) as of this instant.
    pub fn snapshot(&self) -> (bool, u32) {
        let store = self.store.lock().unwrap();
        (store.enabled(), store.max_continues())
    }

    /// Push a status line to the panel, skipping consecutive duplicates.
    pub fn publish_status(&self, message: impl Into<String>) {
        let message = message.into();
        let mut last = self.last_status.lock().unwrap();
        if *last == message {
            return;
        }
        *last = message.clone();
        let _ = self.event_tx.send(PanelEvent::Status { message });
    }

    /// Persist an initiated attempt and refresh the panel counter.
    pub fn record_attempt(&self, made: u32) {
        let max = {
            let mut store = self.store.lock().unwrap();
            store.record_attempt(made);
            if let Err(e) = store.save() {
                warn!("failed to persist attempt counter: {e:#}");
            }
            store.max_continues()
        };
        let _ = self.event_tx.send(PanelEvent::Counter { made, max });
    }

    pub fn set_enabled(&self, on: bool) -> bool {
        let (fresh_session, max) = {
            let mut store = self.store.lock().unwrap();
            let fresh = store.set_enabled(on);
            if let Err(e) = store.save() {
                warn!("failed to persist toggle: {e:#}");
            }
            (fresh, store.max_continues())
        };
        let _ = self.event_tx.send(PanelEvent::Enabled { on });
        if fresh_session {
            let _ = self.event_tx.send(PanelEvent::Counter { made: 0, max });
        }
        on
    }

    pub fn toggle(&self) -> bool {
        let on = !self.store.lock().unwrap().enabled();
        self.set_enabled(on)
    }

    /// Change the cap. Refused while monitoring is armed, matching the
    /// panel input's disabled state.
    pub fn set_max(&self, value: u32) -> u32 {
        let (made, max) = {
            let mut store = self.store.lock().unwrap();
            if store.enabled() {
                return store.max_continues();
            }
            let max = store.set_max(value);
            if let Err(e) = store.save() {
                warn!("failed to persist cap: {e:#}");
            }
            (store.continues(), max)
        };
        let _ = self.event_tx.send(PanelEvent::Counter { made, max });
        max
    }

    fn state_json(&self) -> serde_json::Value {
        let store = self.store.lock().unwrap();
        json!({
            "enabled": store.enabled(),
            "continues": store.continues(),
            "max_continues": store.max_continues(),
        })
    }
}

#[derive(Deserialize)]
struct TogglePayload {
    on: bool,
}

#[derive(Deserialize)]
struct MaxPayload {
    value: u32,
}

/// Start the panel server on localhost. Returns the shared state handle.
pub async fn start_server(store: prefs::Store) -> Result<Arc<AppState>> {
    let state = Arc::new(AppState::new(store));

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/state", get(state_handler))
        .route("/toggle", post(toggle_handler))
        .route("/max", post(max_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        )
        .with_state(state.clone());

    // Try port 3000, fall back to 3001-3009 if in use.
    let mut listener = None;
    let mut port = 3000;
    for p in 3000..3010 {
        match tokio::net::TcpListener::bind(format!("127.0.0.1:{}", p)).await {
            Ok(l) => {
                listener = Some(l);
                port = p;
                break;
            }
            Err(_) => continue,
        }
    }
    let Some(listener) = listener else {
        bail!("could not bind any port in 3000-3009; is another continuer running?");
    };

    info!("control panel at http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("panel server stopped: {e:#}");
        }
    });

    Ok(state)
}

/// Register Alt+C as a global toggle. Hotkey support is best-effort: on a
/// headless host registration fails and the panel remains the only control.
pub fn spawn_hotkey_listener(state: Arc<AppState>) {
    let manager = match GlobalHotKeyManager::new() {
        Ok(m) => m,
        Err(e) => {
            warn!("global hotkey unavailable: {e}");
            return;
        }
    };
    let hotkey = HotKey::new(Some(Modifiers::ALT), Code::KeyC);
    if let Err(e) = manager.register(hotkey) {
        warn!("could not register Alt+C: {e}");
        return;
    }
    // The manager must outlive the process or the registration is dropped.
    std::mem::forget(manager);

    std::thread::spawn(move || {
        let receiver = GlobalHotKeyEvent::receiver();
        while let Ok(event) = receiver.recv() {
            if event.state == HotKeyState::Pressed {
                let on = state.toggle();
                info!(enabled = on, "hotkey toggle");
            }
        }
    });
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.state_json())
}

async fn toggle_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TogglePayload>,
) -> Json<serde_json::Value> {
    let on = state.set_enabled(payload.on);
    info!(enabled = on, "panel toggle");
    Json(json!({ "enabled": on }))
}

async fn max_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MaxPayload>,
) -> Json<serde_json::Value> {
    let max = state.set_max(payload.value);
    Json(json!({ "max_continues": max }))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<PanelEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Auto Continuer</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    align-items: center;
    justify-content: center;
  }
  .card {
    background: #111118;
    border: 1px solid #222;
    border-radius: 12px;
    padding: 28px 32px;
    width: 320px;
    display: flex;
    flex-direction: column;
    align-items: center;
    gap: 14px;
    transition: border-color 0.3s ease;
  }
  .card.active { border-color: #19c37d; }
  h1 { font-size: 18px; font-weight: 600; color: #fff; }
  .row {
    width: 100%;
    display: flex;
    align-items: center;
    justify-content: space-between;
    font-size: 13px;
  }
  .row input[type="number"] {
    width: 60px;
    background: #0a0a0f;
    border: 1px solid #333;
    border-radius: 6px;
    color: #fff;
    padding: 4px 8px;
    font-size: 13px;
  }
  .row input[type="number"]:disabled { opacity: 0.4; }
  .switch { position: relative; display: inline-block; width: 46px; height: 24px; }
  .switch input { opacity: 0; width: 0; height: 0; }
  .slider {
    position: absolute;
    cursor: pointer;
    inset: 0;
    background: #444;
    border-radius: 24px;
    transition: .3s;
  }
  .slider:before {
    content: "";
    position: absolute;
    height: 18px; width: 18px;
    left: 3px; bottom: 3px;
    background: #fff;
    border-radius: 50%;
    transition: .3s;
  }
  input:checked + .slider { background: #19c37d; }
  input:checked + .slider:before { transform: translateX(22px); }
  #status { font-size: 13px; color: #9ca3af; min-height: 18px; }
  #counter { font-size: 12px; color: #6b7280; }
  .hint { font-size: 11px; color: #4b5563; }
</style>
</head>
<body>
  <div class="card" id="card">
    <h1>Auto Continue</h1>
    <div class="row">
      <span>Max continues</span>
      <input type="number" id="max" min="1" max="100" step="1" value="7" />
    </div>
    <label class="switch">
      <input type="checkbox" id="toggle" />
      <span class="slider"></span>
    </label>
    <div id="status">Inactive</div>
    <div id="counter">Continues: 0/7</div>
    <div class="hint">Alt+C toggles from anywhere</div>
  </div>
<script>
  const card = document.getElementById('card');
  const toggle = document.getElementById('toggle');
  const maxInput = document.getElementById('max');
  const status = document.getElementById('status');
  const counter = document.getElementById('counter');

  function applyEnabled(on) {
    toggle.checked = on;
    maxInput.disabled = on;
    card.className = on ? 'card active' : 'card';
    if (!on) status.textContent = 'Inactive';
  }

  fetch('/state').then(r => r.json()).then(s => {
    applyEnabled(s.enabled);
    maxInput.value = s.max_continues;
    counter.textContent = 'Continues: ' + s.continues + '/' + s.max_continues;
  });

  toggle.addEventListener('change', async () => {
    await fetch('/toggle', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({on: toggle.checked}),
    });
    applyEnabled(toggle.checked);
  });

  maxInput.addEventListener('change', async () => {
    let value = parseInt(maxInput.value, 10) || 1;
    value = Math.min(100, Math.max(1, value));
    maxInput.value = value;
    await fetch('/max', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({value}),
    });
  });

  const es = new EventSource('/events');
  es.addEventListener('status', e => {
    status.textContent = JSON.parse(e.data).message;
  });
  es.addEventListener('counter', e => {
    const d = JSON.parse(e.data);
    counter.textContent = 'Continues: ' + d.made + '/' + d.max;
  });
  es.addEventListener('enabled', e => {
    applyEnabled(JSON.parse(e.data).on);
  });
</script>
</body>
</html>
"##;
