//! Chromium-backed tab driver.
//!
//! Scanner, annotator and executor are injected JavaScript evaluated over CDP;
//! they re-walk the same selector list so the numbered ids line up between the
//! scan, the markers drawn on the page and the action dispatch.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;

use crate::agent::{AgentError, TabDriver};
use crate::protocol::{ActionCommand, ExecutionOutcome, InteractableElement, PageInfo, TabId};

#[derive(Clone)]
pub struct ChromiumConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None }
    }
}

/// Single-tab driver over a launched Chromium instance.
pub struct ChromiumTabs {
    page: Page,
    _browser: OxideBrowser,
    tab_id: TabId,
}

impl ChromiumTabs {
    pub async fn launch(cfg: ChromiumConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run to avoid ProcessSingleton profile lock
        // conflicts when Chromium is restarted rapidly.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("tabpilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        // Non-zero viewport, otherwise screenshots can fail with 0-width errors.
        let _ = page.execute(viewport_override()?).await;
        Ok(Self { page, _browser: browser, tab_id: TabId(1) })
    }

    /// Point the controlled tab at a starting page before handing the driver
    /// to the controller.
    pub async fn open(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn eval_json(&self, js: String) -> Result<Value> {
        let eval = EvaluateParams::builder()
            .expression(js)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        let resp = self.page.execute(eval).await?;
        if let Some(exc) = &resp.result.exception_details {
            bail!("page script threw: {}", exc.text);
        }
        resp.result
            .result
            .value
            .clone()
            .context("page script returned no value")
    }

    async fn screenshot_b64(&self, force_viewport: bool) -> Result<String> {
        if force_viewport {
            let _ = self.page.execute(viewport_override()?).await;
            sleep(Duration::from_millis(50)).await;
        }
        let bytes = self
            .page
            .screenshot(ScreenshotParamsBuilder::default().build())
            .await?;
        Ok(STANDARD.encode(bytes))
    }

    fn check_tab(&self, tab: TabId) -> Result<(), AgentError> {
        if tab != self.tab_id {
            return Err(AgentError::TabNotFound(tab));
        }
        Ok(())
    }
}

fn viewport_override() -> Result<SetDeviceMetricsOverrideParams> {
    SetDeviceMetricsOverrideParams::builder()
        .width(1280)
        .height(800)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| anyhow::anyhow!(e))
}

#[async_trait]
impl TabDriver for ChromiumTabs {
    async fn active_tab(&self) -> Result<Option<TabId>, AgentError> {
        Ok(Some(self.tab_id))
    }

    async fn tab_exists(&self, tab: TabId) -> Result<bool, AgentError> {
        if tab != self.tab_id {
            return Ok(false);
        }
        Ok(self.page.url().await.is_ok())
    }

    async fn page_info(&self, tab: TabId) -> Result<PageInfo, AgentError> {
        self.check_tab(tab)?;
        let v = self
            .eval_json(PAGE_INFO_JS.to_string())
            .await
            .map_err(|e| AgentError::ScanFailed(e.to_string()))?;
        serde_json::from_value(v).map_err(|e| AgentError::ScanFailed(e.to_string()))
    }

    async fn scan(&self, tab: TabId) -> Result<Vec<InteractableElement>, AgentError> {
        self.check_tab(tab)?;
        let v = self
            .eval_json(format!("({SCAN_FN})()"))
            .await
            .map_err(|e| AgentError::ScanFailed(e.to_string()))?;
        serde_json::from_value(v).map_err(|e| AgentError::ScanFailed(e.to_string()))
    }

    async fn capture(&self, tab: TabId, explicit_window: bool) -> Result<String, AgentError> {
        self.check_tab(tab)?;
        self.screenshot_b64(explicit_window)
            .await
            .map_err(|e| AgentError::CaptureFailed(e.to_string()))
    }

    async fn annotate(
        &self,
        tab: TabId,
        elements: &[InteractableElement],
    ) -> Result<usize, AgentError> {
        self.check_tab(tab)?;
        let els = serde_json::to_string(elements)
            .map_err(|e| AgentError::ScanFailed(e.to_string()))?;
        let v = self
            .eval_json(format!("({ANNOTATE_FN})({els})"))
            .await
            .map_err(|e| AgentError::ScanFailed(e.to_string()))?;
        v.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| AgentError::ScanFailed("annotator returned no count".into()))
    }

    async fn clear_annotations(&self, tab: TabId) -> Result<(), AgentError> {
        self.check_tab(tab)?;
        self.eval_json(CLEAR_ANNOTATIONS_JS.to_string())
            .await
            .map(|_| ())
            .map_err(|e| AgentError::ScanFailed(e.to_string()))
    }

    async fn execute(
        &self,
        tab: TabId,
        command: &ActionCommand,
    ) -> Result<ExecutionOutcome, AgentError> {
        self.check_tab(tab)?;
        let cmd = command.to_json().to_string();
        let v = self
            .eval_json(format!("({EXECUTE_FN})({cmd})"))
            .await
            .map_err(|e| AgentError::ExecutionFailed(e.to_string()))?;
        serde_json::from_value(v).map_err(|e| AgentError::ExecutionFailed(e.to_string()))
    }

    async fn navigate(&self, tab: TabId, url: &str) -> Result<(), AgentError> {
        self.check_tab(tab)?;
        self.page
            .goto(url)
            .await
            .map_err(|e| AgentError::ExecutionFailed(e.to_string()))?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }
}

// ========================= Injected scripts =========================

const PAGE_INFO_JS: &str =
    r#"JSON.parse(JSON.stringify({ title: document.title, url: location.href }))"#;

// The scanner and the executor walk the same selector list in document order
// so the executor can find element N by counting.
const SCAN_FN: &str = r#"function () {
  const SELECTOR = 'a, button, input:not([type="hidden"]), textarea, select, [role="button"], [role="link"], [role="checkbox"], [role="radio"], [role="textbox"], [role="combobox"], [role="menuitem"], [role="tab"], [onclick]';
  const KEPT_ATTRS = ['id', 'name', 'class', 'placeholder', 'aria-label', 'role', 'type', 'href', 'title'];
  const results = [];
  let nextId = 1;
  for (const el of document.querySelectorAll(SELECTOR)) {
    if (el.offsetWidth <= 0 || el.offsetHeight <= 0) continue;
    const rect = el.getBoundingClientRect();
    if (rect.bottom < 0 || rect.top > window.innerHeight) continue;
    if (rect.right < 0 || rect.left > window.innerWidth) continue;
    if (rect.width <= 5 || rect.height <= 5) continue;
    const attributes = {};
    for (const name of KEPT_ATTRS) {
      const value = el.getAttribute(name);
      if (value) attributes[name] = value;
    }
    const label = el.getAttribute('aria-label')
      || (el.innerText ? el.innerText.trim().slice(0, 100) : '')
      || el.getAttribute('title')
      || el.getAttribute('placeholder')
      || null;
    results.push({
      id: nextId++,
      tag: el.tagName.toLowerCase(),
      text: label,
      attributes,
      x: Math.round(rect.left),
      y: Math.round(rect.top),
      width: Math.round(rect.width),
      height: Math.round(rect.height),
    });
  }
  return results;
}"#;

const ANNOTATE_FN: &str = r#"function (elements) {
  const CONTAINER_ID = 'tabpilot-annotation-container';
  const previous = document.getElementById(CONTAINER_ID);
  if (previous) previous.remove();
  const container = document.createElement('div');
  container.id = CONTAINER_ID;
  container.style.cssText = 'position:fixed;inset:0;pointer-events:none;z-index:2147483647;';
  for (const el of elements) {
    const box = document.createElement('div');
    box.style.cssText = 'position:fixed;border:2px solid red;box-sizing:border-box;'
      + 'left:' + el.x + 'px;top:' + el.y + 'px;width:' + el.width + 'px;height:' + el.height + 'px;';
    const label = document.createElement('span');
    label.textContent = String(el.id);
    label.style.cssText = 'position:absolute;top:-2px;left:-2px;background:red;color:white;'
      + 'font:bold 12px sans-serif;padding:0 3px;';
    box.appendChild(label);
    container.appendChild(box);
  }
  document.body.appendChild(container);
  return elements.length;
}"#;

const CLEAR_ANNOTATIONS_JS: &str = r#"(function () {
  const container = document.getElementById('tabpilot-annotation-container');
  if (container) container.remove();
  return true;
})()"#;

const EXECUTE_FN: &str = r#"function (command) {
  const SELECTOR = 'a, button, input:not([type="hidden"]), textarea, select, [role="button"], [role="link"], [role="checkbox"], [role="radio"], [role="textbox"], [role="combobox"], [role="menuitem"], [role="tab"], [onclick]';
  const findByScanId = (wanted) => {
    let nextId = 1;
    for (const el of document.querySelectorAll(SELECTOR)) {
      if (el.offsetWidth <= 0 || el.offsetHeight <= 0) continue;
      const rect = el.getBoundingClientRect();
      if (rect.bottom < 0 || rect.top > window.innerHeight) continue;
      if (rect.right < 0 || rect.left > window.innerWidth) continue;
      if (rect.width <= 5 || rect.height <= 5) continue;
      if (nextId === wanted) return el;
      nextId++;
    }
    return null;
  };
  try {
    if (command.action === 'click') {
      const el = findByScanId(command.elementId);
      if (!el) return { success: false, message: 'element ' + command.elementId + ' not found' };
      el.click();
      return { success: true, message: 'Clicked element ' + command.elementId };
    }
    if (command.action === 'input') {
      const el = findByScanId(command.elementId);
      if (!el) return { success: false, message: 'element ' + command.elementId + ' not found' };
      el.focus();
      el.value = command.text;
      el.dispatchEvent(new Event('input', { bubbles: true }));
      el.dispatchEvent(new Event('change', { bubbles: true }));
      el.blur();
      return { success: true, message: 'Typed into element ' + command.elementId };
    }
    if (command.action === 'scroll') {
      const step = window.innerHeight * 0.8;
      window.scrollBy(0, command.direction === 'up' ? -step : step);
      return { success: true, message: 'Scrolled ' + (command.direction === 'up' ? 'up' : 'down') };
    }
    return { success: false, message: 'unsupported action: ' + command.action };
  } catch (err) {
    return { success: false, message: String(err) };
  }
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    const INTERACTIVE_SELECTOR: &str = r#"a, button, input:not([type="hidden"]), textarea, select, [role="button"], [role="link"], [role="checkbox"], [role="radio"], [role="textbox"], [role="combobox"], [role="menuitem"], [role="tab"], [onclick]"#;

    #[test]
    fn scanner_and_executor_share_the_selector() {
        assert!(SCAN_FN.contains(INTERACTIVE_SELECTOR));
        assert!(EXECUTE_FN.contains(INTERACTIVE_SELECTOR));
    }

    #[test]
    fn injected_wrappers_are_well_formed() {
        for script in [SCAN_FN, ANNOTATE_FN, EXECUTE_FN] {
            assert!(script.starts_with("function"));
            assert_eq!(
                script.matches('{').count(),
                script.matches('}').count(),
                "unbalanced braces"
            );
        }
    }
}
