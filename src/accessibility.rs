//! Accessibility permission oracle.
//!
//! The tap can only be created while the OS trusts this process with
//! input interception. `is_trusted` answers the instantaneous question;
//! `AccessibilityWatcher` polls it on a background thread and reports
//! every change edge to a registered callback, which is how the daemon
//! learns to start or stop the tap. There is no push notification API for
//! Accessibility trust, so polling is the only option.
//!
//! `Prompter` wraps the system permission dialog. The dialog is shown at
//! most once per cooldown window so a retry loop cannot spam the user.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll cadence for trust changes.
const POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Minimum spacing between permission prompts.
const PROMPT_COOLDOWN: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Raw FFI
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod ffi {
    use std::ffi::c_void;

    pub type CFDictionaryRef = *const c_void;
    pub type CFStringRef = *const c_void;

    #[link(name = "ApplicationServices", kind = "framework")]
    extern "C" {
        /// Returns true if this process has been granted Accessibility permission.
        pub fn AXIsProcessTrusted() -> bool;

        /// Like AXIsProcessTrusted, but with options. Passing the prompt
        /// option asks the OS to show its permission dialog.
        pub fn AXIsProcessTrustedWithOptions(options: CFDictionaryRef) -> bool;

        /// Dictionary key requesting the system permission prompt.
        pub static kAXTrustedCheckOptionPrompt: CFStringRef;
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        pub fn CFDictionaryCreate(
            allocator: *mut c_void,
            keys: *const *const c_void,
            values: *const *const c_void,
            num_values: isize,
            key_callbacks: *const c_void,
            value_callbacks: *const c_void,
        ) -> CFDictionaryRef;

        pub fn CFRelease(cf: *const c_void);

        pub static kCFBooleanTrue: *const c_void;
        pub static kCFTypeDictionaryKeyCallBacks: c_void;
        pub static kCFTypeDictionaryValueCallBacks: c_void;
    }
}

/// True if the OS currently trusts this process to intercept input.
#[cfg(target_os = "macos")]
pub fn is_trusted() -> bool {
    unsafe { ffi::AXIsProcessTrusted() }
}

/// Opens System Settings at the Privacy & Security > Accessibility pane.
#[cfg(target_os = "macos")]
pub fn open_settings() {
    use std::process::Command;

    let result = Command::new("open")
        .arg("x-apple.systempreferences:com.apple.preference.security?Privacy_Accessibility")
        .spawn();
    if let Err(err) = result {
        log::warn!("accessibility: failed to open System Settings: {err}");
    }
}

// ---------------------------------------------------------------------------
// Permission prompt, rate limited
// ---------------------------------------------------------------------------

/// Shows the system Accessibility permission dialog, at most once per
/// cooldown window. Also registers the process in the Accessibility list
/// on first launch, which the dialog alone does as a side effect.
#[derive(Debug, Default)]
pub struct Prompter {
    last_prompt: Option<Instant>,
}

impl Prompter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cooldown check, separated from the OS call for testability.
    fn should_prompt(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_prompt {
            if now.duration_since(last) < PROMPT_COOLDOWN {
                return false;
            }
        }
        self.last_prompt = Some(now);
        true
    }

    /// Requests the system dialog unless one was shown within the cooldown.
    #[cfg(target_os = "macos")]
    pub fn request(&mut self) {
        if !self.should_prompt(Instant::now()) {
            log::debug!("accessibility: prompt suppressed by cooldown");
            return;
        }

        unsafe {
            let keys = [ffi::kAXTrustedCheckOptionPrompt];
            let values = [ffi::kCFBooleanTrue];
            let options = ffi::CFDictionaryCreate(
                std::ptr::null_mut(),
                keys.as_ptr(),
                values.as_ptr(),
                1,
                &ffi::kCFTypeDictionaryKeyCallBacks,
                &ffi::kCFTypeDictionaryValueCallBacks,
            );
            if options.is_null() {
                log::warn!("accessibility: could not build prompt options");
                return;
            }
            ffi::AXIsProcessTrustedWithOptions(options);
            ffi::CFRelease(options);
        }
        log::info!("accessibility: permission prompt requested");
    }
}

// ---------------------------------------------------------------------------
// Trust watcher
// ---------------------------------------------------------------------------

/// Polls the trust state on a background thread and invokes a callback on
/// every change edge. The previous state starts out `false`, matching a
/// process that has not been granted anything yet, so a callback fires on
/// startup when permission is already present.
pub struct AccessibilityWatcher {
    interval: Duration,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AccessibilityWatcher {
    pub fn new() -> Self {
        Self::with_interval(POLL_INTERVAL)
    }

    /// Same watcher with a custom poll cadence. Used by tests.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            stop_tx: None,
            thread: None,
        }
    }

    /// Starts polling `AXIsProcessTrusted`. Idempotent.
    #[cfg(target_os = "macos")]
    pub fn start<C>(&mut self, on_change: C)
    where
        C: FnMut(bool) + Send + 'static,
    {
        self.start_with_probe(is_trusted, on_change);
    }

    /// Starts polling an arbitrary trust probe. The probe runs once per
    /// interval; `on_change` runs only when the answer differs from the
    /// previous one.
    pub fn start_with_probe<P, C>(&mut self, probe: P, mut on_change: C)
    where
        P: Fn() -> bool + Send + 'static,
        C: FnMut(bool) + Send + 'static,
    {
        if self.thread.is_some() {
            log::debug!("accessibility: watcher already running, ignoring start");
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.interval;

        let thread = thread::spawn(move || {
            let mut last = false;
            loop {
                let trusted = probe();
                if trusted != last {
                    log::info!(
                        "accessibility: permission {}",
                        if trusted { "granted" } else { "revoked" }
                    );
                    last = trusted;
                    on_change(trusted);
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    // Stop requested, or the watcher was dropped.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
    }

    /// Stops polling and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Default for AccessibilityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AccessibilityWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn prompt_cooldown_blocks_rapid_reprompts() {
        let mut prompter = Prompter::new();
        let t0 = Instant::now();

        assert!(prompter.should_prompt(t0));
        assert!(!prompter.should_prompt(t0 + Duration::from_secs(3)));
        assert!(prompter.should_prompt(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn watcher_reports_each_edge_once() {
        let trusted = Arc::new(AtomicBool::new(false));
        let edges: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

        let mut watcher = AccessibilityWatcher::with_interval(Duration::from_millis(5));
        {
            let trusted = Arc::clone(&trusted);
            let edges = Arc::clone(&edges);
            watcher.start_with_probe(
                move || trusted.load(Ordering::SeqCst),
                move |state| edges.lock().unwrap().push(state),
            );
        }

        // Untrusted at startup: no edge.
        thread::sleep(Duration::from_millis(50));
        assert!(edges.lock().unwrap().is_empty());

        trusted.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        trusted.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        watcher.stop();

        assert_eq!(*edges.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn watcher_fires_on_startup_when_already_trusted() {
        let edges: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

        let mut watcher = AccessibilityWatcher::with_interval(Duration::from_millis(5));
        {
            let edges = Arc::clone(&edges);
            watcher.start_with_probe(|| true, move |state| edges.lock().unwrap().push(state));
        }
        thread::sleep(Duration::from_millis(50));
        watcher.stop();

        assert_eq!(*edges.lock().unwrap(), vec![true]);
    }

    #[test]
    fn stop_on_unstarted_watcher_is_noop() {
        let mut watcher = AccessibilityWatcher::new();
        watcher.stop();
    }
}
