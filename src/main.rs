//! midflick -- Fn+click to middle-click remapper for macOS.
//!
//! Entry point and daemon lifecycle. Wires the accessibility watcher to
//! the event tap: permission granted starts interception, permission
//! revoked stops it. Runs headless; all reporting goes through the logger.

// On other platforms only the pure state machine compiles, so reachability
// analysis flags the rest.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod accessibility;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod error;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod inject;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod session;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod tap;

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(target_os = "macos")]
fn main() {
    use std::sync::{Arc, Mutex};

    init_logger();
    log::info!("midflick v{}", env!("CARGO_PKG_VERSION"));

    // Launched without permission: ask once and point the user at the
    // right Settings pane. The watcher picks up the grant when it lands.
    if !accessibility::is_trusted() {
        log::warn!(
            "accessibility permission not granted; \
             enable midflick in System Settings > Privacy & Security > Accessibility"
        );
        let mut prompter = accessibility::Prompter::new();
        prompter.request();
        accessibility::open_settings();
    }

    let tap = Arc::new(Mutex::new(tap::EventTap::new()));
    let mut watcher = accessibility::AccessibilityWatcher::new();
    {
        let tap = Arc::clone(&tap);
        watcher.start(move |trusted| {
            let mut tap = tap.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if trusted {
                // A failed start is reported and left alone; the next
                // permission edge retries it.
                if let Err(err) = tap.start() {
                    log::error!("could not start interception: {err}");
                }
            } else {
                tap.stop();
                log::info!("interception stopped until permission returns");
            }
        });
    }

    // Everything from here on happens on the watcher and tap threads.
    loop {
        std::thread::park();
    }
}

#[cfg(not(target_os = "macos"))]
fn main() {
    init_logger();
    log::error!("midflick only runs on macOS; CGEventTap has no equivalent here");
    std::process::exit(1);
}
