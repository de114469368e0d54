//! Chrome-backed [`SignupDriver`]
//!
//! `headless_chrome` is synchronous; every DevTools call runs on a
//! blocking thread so attempts never stall the runtime.

use crate::config::{BrowserOptions, url_path};
use crate::driver::{
    Credentials, DriverFactory, SessionArtifacts, SignupDriver, cookie_header, extract_token,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_STEP: Duration = Duration::from_millis(250);
const WINDOW_SIZE: (u32, u32) = (1280, 900);
/// Keep the DevTools socket open while the page sits idle during the
/// mail wait.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(600);

/// Launches one Chrome process per attempt.
#[derive(Debug, Clone)]
pub struct ChromeDriverFactory {
    options: BrowserOptions,
}

impl ChromeDriverFactory {
    #[must_use]
    pub const fn new(options: BrowserOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl DriverFactory for ChromeDriverFactory {
    async fn launch(&self) -> Result<Box<dyn SignupDriver>> {
        let driver = ChromeDriver::launch(self.options.clone()).await?;
        Ok(Box::new(driver))
    }
}

pub struct ChromeDriver {
    options: BrowserOptions,
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
    /// Body of the first response whose URL matched the token marker.
    token_body: Arc<Mutex<Option<String>>>,
    credentials: Option<Credentials>,
}

impl ChromeDriver {
    /// Start Chrome and open the tab the flow runs in.
    ///
    /// # Errors
    ///
    /// [`Error::BrowserNotFound`] when no executable can be located,
    /// [`Error::Browser`] for any other launch failure.
    pub async fn launch(options: BrowserOptions) -> Result<Self> {
        let executable = resolve_executable(options.chrome_path.as_ref())?;
        info!(
            "Launching Chrome {} (headless: {})",
            executable.display(),
            options.headless
        );

        let headless = options.headless;
        let default_timeout = options.navigation_timeout;
        let marker = options.token_response_match.clone();
        let token_body = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&token_body);

        let (browser, tab) = tokio::task::spawn_blocking(move || {
            let args: Vec<OsString> = [
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--no-sandbox",
                "--disable-software-rasterizer",
                "--disable-extensions",
            ]
            .into_iter()
            .map(OsString::from)
            .collect();

            let launch_options = LaunchOptionsBuilder::default()
                .headless(headless)
                .path(Some(executable))
                .window_size(Some(WINDOW_SIZE))
                .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
                .args(args.iter().map(OsString::as_os_str).collect())
                .build()
                .map_err(|e| Error::Browser(format!("Invalid launch options: {e}")))?;

            let browser = Browser::new(launch_options)
                .map_err(|e| Error::Browser(format!("Launch failed: {e}")))?;
            let tab = browser
                .new_tab()
                .map_err(|e| Error::Browser(format!("Failed to open tab: {e}")))?;
            tab.set_default_timeout(default_timeout);

            tab.register_response_handling(
                "token-capture",
                Box::new(move |params, fetch_body| {
                    let url = &params.response.url;
                    if !url.contains(&marker) {
                        return;
                    }
                    let Ok(mut slot) = captured.lock() else {
                        return;
                    };
                    if slot.is_some() {
                        return;
                    }
                    match fetch_body() {
                        Ok(body) => {
                            info!("Captured token response from {}", url);
                            *slot = Some(body.body);
                        }
                        Err(e) => debug!("Token response body unavailable: {}", e),
                    }
                }),
            )
            .map_err(|e| Error::Browser(format!("Failed to watch responses: {e}")))?;

            Ok::<_, Error>((browser, tab))
        })
        .await
        .map_err(|e| Error::Browser(format!("Launch task failed: {e}")))??;

        Ok(Self {
            options,
            browser: Some(browser),
            tab: Some(tab),
            token_body,
            credentials: None,
        })
    }

    /// Run `f` against the tab on a blocking thread.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self
            .tab
            .clone()
            .ok_or_else(|| Error::Browser("Browser session already closed".into()))?;
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| Error::Browser(format!("Browser task failed: {e}")))?
    }

    /// Click the visible element whose text is exactly `text`. When
    /// several match, `nth_of_many` picks which one.
    async fn click_text(&self, text: &str, nth_of_many: usize) -> Result<()> {
        let script = click_text_script(text, nth_of_many);
        let text = text.to_string();
        let timeout = self.options.element_timeout;

        self.blocking(move |tab| {
            let deadline = Instant::now() + timeout;
            loop {
                let clicked = tab
                    .evaluate(&script, false)
                    .map_err(|e| Error::Browser(format!("Script failed: {e}")))?
                    .value
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if clicked > 0 {
                    debug!("Clicked '{}' ({} matches)", text, clicked);
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(Error::Ui(format!("No clickable '{text}' element")));
                }
                std::thread::sleep(POLL_STEP);
            }
        })
        .await
    }

    async fn fill(&self, selector: &str, value: &str, what: &'static str) -> Result<()> {
        let selector = selector.to_string();
        let value = value.to_string();
        let timeout = self.options.element_timeout;

        self.blocking(move |tab| {
            let element = tab
                .wait_for_element_with_custom_timeout(&selector, timeout)
                .map_err(|e| Error::Ui(format!("{what} field '{selector}' not found: {e}")))?;
            element
                .type_into(&value)
                .map_err(|e| Error::Browser(format!("Typing into {what} field failed: {e}")))?;
            Ok(())
        })
        .await
    }

    /// Visible text of the configured error element, if any.
    async fn error_text(&self) -> Result<Option<String>> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); \
             return el && el.offsetParent !== null ? el.innerText.trim() : null; }})()",
            js_string(&self.options.selectors.error_message)
        );
        self.blocking(move |tab| {
            let text = tab
                .evaluate(&script, false)
                .map_err(|e| Error::Browser(format!("Script failed: {e}")))?
                .value
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|t| !t.is_empty());
            Ok(text)
        })
        .await
    }

    async fn wait_for_token(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let captured = self.token_body.lock().ok().and_then(|slot| slot.clone());
            if captured.is_some() {
                return captured;
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }
}

#[async_trait]
impl SignupDriver for ChromeDriver {
    async fn submit_email(&mut self, credentials: &Credentials) -> Result<()> {
        self.credentials = Some(credentials.clone());
        let url = self.options.signup_url.clone();
        info!("Opening {} for {}", url, credentials.email);

        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .and_then(Tab::wait_until_navigated)
                .map_err(|e| Error::NavigationTimeout(format!("Loading {url} failed: {e}")))?;
            Ok(())
        })
        .await?;

        self.fill(&self.options.selectors.email_input, &credentials.email, "Email")
            .await?;
        self.click_text(&self.options.selectors.send_code_text, 0)
            .await
    }

    async fn await_code_prompt(&mut self) -> Result<()> {
        let selector = self.options.selectors.code_input.clone();
        let timeout = self.options.element_timeout;
        self.blocking(move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)
                .map_err(|e| Error::Ui(format!("Code field '{selector}' never appeared: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn submit_code(&mut self, code: &str) -> Result<()> {
        let password = self
            .credentials
            .as_ref()
            .map(|c| c.password.clone())
            .ok_or_else(|| Error::Ui("Code submitted before the email step".into()))?;

        self.fill(&self.options.selectors.code_input, code, "Code")
            .await?;
        self.fill(&self.options.selectors.password_input, &password, "Password")
            .await?;
        // The page header carries a second "Sign Up" control.
        self.click_text(&self.options.selectors.signup_text, 1)
            .await?;

        let signup_url = self.options.signup_url.clone();
        let timeout = self.options.navigation_timeout;
        let left = self
            .blocking(move |tab| {
                let deadline = Instant::now() + timeout;
                loop {
                    let url = tab.get_url();
                    if !on_page(&url, &signup_url) {
                        return Ok(Some(url));
                    }
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(POLL_STEP);
                }
            })
            .await?;

        if let Some(url) = left {
            info!("Signup submitted, page moved to {}", url);
            return Ok(());
        }
        match self.error_text().await? {
            Some(text) => Err(Error::Ui(format!("Signup rejected: {text}"))),
            None => Err(Error::NavigationTimeout(format!(
                "Still on the signup page after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn extract_session(&mut self) -> Result<SessionArtifacts> {
        let retries = self.options.token_capture_retries;
        let timeout = self.options.navigation_timeout;

        let mut body = self.wait_for_token(timeout).await;
        let mut reloads = 0;
        while body.is_none() && reloads < retries {
            reloads += 1;
            warn!(
                "Token response not seen yet, reloading ({}/{})",
                reloads, retries
            );
            let reloaded = self
                .blocking(|tab| {
                    tab.reload(false, None)
                        .and_then(Tab::wait_until_navigated)
                        .map_err(|e| Error::NavigationTimeout(format!("Reload failed: {e}")))?;
                    Ok(())
                })
                .await;
            if let Err(e) = reloaded {
                warn!("Reload {} failed: {}", reloads, e);
            }
            body = self.wait_for_token(timeout).await;
        }

        let body = body.ok_or_else(|| {
            Error::Ui(format!(
                "No '{}' response after {} reloads",
                self.options.token_response_match, retries
            ))
        })?;
        let token = extract_token(&body)
            .ok_or_else(|| Error::Ui("Token response carried no token".into()))?;

        let cookie = self
            .blocking(|tab| {
                // Every cookie in the browser, not only the current page's.
                let cookies = tab
                    .call_method(Network::GetAllCookies(None))
                    .map_err(|e| Error::Browser(format!("Reading cookies failed: {e}")))?
                    .cookies;
                Ok(browser_cookie_header(&cookies))
            })
            .await?;

        debug!("Session token length {}", token.len());
        Ok(SessionArtifacts { token, cookie })
    }

    async fn close(&mut self) {
        let tab = self.tab.take();
        let browser = self.browser.take();
        if tab.is_none() && browser.is_none() {
            return;
        }
        let closed = tokio::task::spawn_blocking(move || {
            if let Some(tab) = tab {
                tab.close(false).ok();
            }
            drop(browser);
        })
        .await;
        if let Err(e) = closed {
            warn!("Closing browser failed: {}", e);
        }
    }
}

fn resolve_executable(configured: Option<&PathBuf>) -> Result<PathBuf> {
    match configured {
        Some(path) if path.exists() => Ok(path.clone()),
        Some(path) => Err(Error::BrowserNotFound(format!(
            "CHROME_PATH {} does not exist",
            path.display()
        ))),
        None => headless_chrome::browser::default_executable().map_err(Error::BrowserNotFound),
    }
}

fn browser_cookie_header(cookies: &[Network::Cookie]) -> String {
    cookie_header(cookies.iter().map(|c| (c.name.as_str(), c.value.as_str())))
}

/// Is `current` at `page`'s path or below it? Query and fragment are
/// ignored, as is a trailing slash.
fn on_page(current: &str, page: &str) -> bool {
    let current = url_path(current).trim_end_matches('/');
    let page = url_path(page).trim_end_matches('/');
    current
        .strip_prefix(page)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn click_text_script(text: &str, nth_of_many: usize) -> String {
    format!(
        r#"(() => {{
  const wanted = {wanted};
  const nodes = Array.from(document.querySelectorAll('button, a, [role="button"], span, div'))
    .filter(el => el.offsetParent !== null && (el.innerText || '').trim() === wanted);
  const leaves = nodes.filter(el => !nodes.some(other => other !== el && el.contains(other)));
  if (leaves.length === 0) return 0;
  const target = leaves.length > {nth} ? leaves[{nth}] : leaves[0];
  target.click();
  return leaves.length;
}})()"#,
        wanted = js_string(text),
        nth = nth_of_many,
    )
}
