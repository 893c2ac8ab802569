//! Scripted in-memory browser for tests and demos.
//!
//! Pages are addressed by URL and carry a few observable traits (blank,
//! error, overlay, fill colour) plus named links. Failures can be queued per
//! operation to exercise retry and recovery paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{Capability, CapabilityError, CapabilityResult, prompts};
use crate::regression::Bitmap;

/// A page in the mock site
#[derive(Debug, Clone)]
pub struct MockPage {
    pub blank: bool,
    pub error: bool,
    /// A dismissable overlay covers the page
    pub overlay: bool,
    /// Background colour of the rendered screenshot
    pub color: [u8; 4],
    /// Tap description -> destination URL
    pub links: HashMap<String, String>,
    /// Answers to free-form boolean questions
    pub answers: HashMap<String, bool>,
}

impl Default for MockPage {
    fn default() -> Self {
        Self {
            blank: false,
            error: false,
            overlay: false,
            color: [240, 240, 240, 255],
            links: HashMap::new(),
            answers: HashMap::new(),
        }
    }
}

impl MockPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color(mut self, color: [u8; 4]) -> Self {
        self.color = color;
        self
    }

    pub fn blank(mut self) -> Self {
        self.blank = true;
        self
    }

    pub fn error(mut self) -> Self {
        self.error = true;
        self
    }

    pub fn overlay(mut self) -> Self {
        self.overlay = true;
        self
    }

    /// Add a link reachable by tapping `description`
    pub fn link(mut self, description: impl Into<String>, url: impl Into<String>) -> Self {
        self.links.insert(description.into(), url.into());
        self
    }

    pub fn answer(mut self, prompt: impl Into<String>, value: bool) -> Self {
        self.answers.insert(prompt.into(), value);
        self
    }
}

#[derive(Debug, Default)]
struct BrowserState {
    pages: HashMap<String, MockPage>,
    history: Vec<String>,
    failures: HashMap<&'static str, VecDeque<CapabilityError>>,
    calls: Vec<String>,
    unresponsive: bool,
    hidden: HashSet<String>,
}

/// Mock implementation of [`Capability`]
#[derive(Debug)]
pub struct MockBrowser {
    state: Mutex<BrowserState>,
    width: u32,
    height: u32,
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowser {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrowserState::default()),
            width: 64,
            height: 48,
        }
    }

    /// Screenshot dimensions
    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn page(self, url: impl Into<String>, page: MockPage) -> Self {
        self.with_state(|s| {
            s.pages.insert(url.into(), page);
        });
        self
    }

    /// Open `url` without recording a call
    pub fn start_at(self, url: impl Into<String>) -> Self {
        self.with_state(|s| s.history.push(url.into()));
        self
    }

    /// Queue `count` failures with `message` for operation `op`
    /// (`navigate`, `current_url`, `go_back`, `tap`, `query_boolean`,
    /// `query_structured`, `wait_for_condition`, `screenshot`)
    pub fn fail_next(&self, op: &'static str, message: &str, count: usize) {
        self.with_state(|s| {
            let queue = s.failures.entry(op).or_default();
            for _ in 0..count {
                queue.push_back(CapabilityError::Failed(message.to_string()));
            }
        });
    }

    /// Make responsiveness checks fail until the next navigation
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.with_state(|s| s.unresponsive = unresponsive);
    }

    /// Hide an element from visibility checks until something scrolls
    pub fn hide_element(&self, description: &str) {
        self.with_state(|s| {
            s.hidden.insert(description.to_string());
        });
    }

    /// Replace a page (e.g. to simulate a visual change between runs)
    pub fn replace_page(&self, url: &str, page: MockPage) {
        self.with_state(|s| {
            s.pages.insert(url.to_string(), page);
        });
    }

    /// Every call received, as `op` or `op:argument`
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| c.as_str() == op || c.starts_with(&format!("{}:", op)))
                .count()
        })
    }

    pub fn current(&self) -> Option<String> {
        self.with_state(|s| s.history.last().cloned())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BrowserState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Record the call and pop a queued failure, if any
    fn enter(&self, op: &'static str, arg: Option<&str>) -> CapabilityResult<()> {
        self.with_state(|s| {
            s.calls.push(match arg {
                Some(a) => format!("{}:{}", op, a),
                None => op.to_string(),
            });
            match s.failures.get_mut(op).and_then(|q| q.pop_front()) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn current_page(state: &BrowserState) -> Option<MockPage> {
        state
            .history
            .last()
            .and_then(|url| state.pages.get(url))
            .cloned()
    }
}

#[async_trait]
impl Capability for MockBrowser {
    async fn navigate(&self, url: &str) -> CapabilityResult<()> {
        self.enter("navigate", Some(url))?;
        self.with_state(|s| {
            s.history.push(url.to_string());
            s.unresponsive = false;
        });
        Ok(())
    }

    async fn current_url(&self) -> CapabilityResult<String> {
        self.enter("current_url", None)?;
        self.with_state(|s| s.history.last().cloned())
            .ok_or_else(|| CapabilityError::Failed("no page loaded".to_string()))
    }

    async fn go_back(&self) -> CapabilityResult<()> {
        self.enter("go_back", None)?;
        self.with_state(|s| {
            if s.history.len() > 1 {
                s.history.pop();
                Ok(())
            } else {
                Err(CapabilityError::Failed("navigation history is empty".to_string()))
            }
        })
    }

    async fn tap(&self, description: &str) -> CapabilityResult<()> {
        self.enter("tap", Some(description))?;
        self.with_state(|s| {
            if description == prompts::SCROLL_DOWN {
                s.hidden.clear();
                return Ok(());
            }
            let url = s.history.last().cloned();
            let page = url.as_ref().and_then(|u| s.pages.get_mut(u));
            let Some(page) = page else {
                return Err(CapabilityError::Failed("element not found: no page loaded".to_string()));
            };
            if description == prompts::DISMISS_OVERLAY {
                page.overlay = false;
                return Ok(());
            }
            match page.links.get(description).cloned() {
                Some(target) => {
                    s.history.push(target);
                    Ok(())
                }
                None if description.ends_with("menu expander") => Ok(()),
                None => Err(CapabilityError::Failed(format!(
                    "element not found: {}",
                    description
                ))),
            }
        })
    }

    async fn query_boolean(&self, prompt: &str) -> CapabilityResult<bool> {
        self.enter("query_boolean", Some(prompt))?;
        self.with_state(|s| {
            let page = Self::current_page(s).unwrap_or_default();
            let answer = match prompt {
                p if p == prompts::RESPONSIVE => !s.unresponsive,
                p if p == prompts::BLANK_PAGE => page.blank,
                p if p == prompts::ERROR_PAGE => page.error,
                p if p == prompts::OVERLAY_PRESENT => page.overlay,
                p => match page.answers.get(p) {
                    Some(answer) => *answer,
                    None => !s.hidden.iter().any(|h| prompts::element_visible(h) == p),
                },
            };
            Ok(answer)
        })
    }

    async fn query_structured(&self, prompt: &str) -> CapabilityResult<serde_json::Value> {
        self.enter("query_structured", Some(prompt))?;
        let url = self.current().unwrap_or_default();
        Ok(serde_json::json!({ "url": url, "prompt": prompt }))
    }

    async fn wait_for_condition(&self, prompt: &str, timeout: Duration) -> CapabilityResult<()> {
        self.enter("wait_for_condition", Some(prompt))?;
        if self.with_state(|s| s.unresponsive) {
            return Err(CapabilityError::Timeout(timeout));
        }
        Ok(())
    }

    async fn screenshot(&self) -> CapabilityResult<Vec<u8>> {
        self.enter("screenshot", None)?;
        let page = self.with_state(|s| Self::current_page(s)).unwrap_or_default();
        let mut bitmap = Bitmap::with_color(self.width, self.height, page.color);
        if !page.blank {
            bitmap.draw_rect(4, 4, self.width / 2, self.height / 4, [40, 40, 40, 255]);
        }
        bitmap
            .to_png()
            .map_err(|e| CapabilityError::Failed(format!("screenshot encode failed: {}", e)))
    }
}
