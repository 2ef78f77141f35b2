use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ShutdownPolicy;

use super::ConnectionSupervisor;
use super::Slot;
use super::open::close_slot;

/// Close the handle once `trigger` resolves, bounded by `policy.grace`.
///
/// Returns the exit code the process should use: 0 for a clean close, 1 when
/// the grace period expired or closing failed. When `policy.exit_process` is
/// set the process exits with that code instead of returning.
pub async fn shutdown_on<T>(
    supervisor: Arc<ConnectionSupervisor>,
    policy: ShutdownPolicy,
    trigger: T,
) -> i32
where
    T: Future<Output = &'static str>,
{
    let reason = trigger.await;
    info!(
        reason,
        grace_ms = u64::try_from(policy.grace.as_millis()).unwrap_or(u64::MAX),
        "shutting down sqlite supervisor"
    );
    let code = match supervisor.shutdown_with_timeout(policy.grace).await {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "sqlite supervisor did not shut down cleanly");
            1
        }
    };
    if policy.exit_process {
        std::process::exit(code);
    }
    code
}

/// Spawn a task that shuts the supervisor down on Ctrl-C or SIGTERM.
#[must_use]
pub fn spawn_shutdown_listener(
    supervisor: Arc<ConnectionSupervisor>,
    policy: ShutdownPolicy,
) -> JoinHandle<i32> {
    tokio::spawn(shutdown_on(supervisor, policy, wait_for_signal()))
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            }
        }
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM; waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}

/// Chain a panic hook that closes the handle if nobody is holding it.
///
/// The slot is left vacant, not shut down: panics caught by the runtime (a
/// failed spawned task) are recoverable, and the next `acquire` reopens the
/// store. The hook never waits; when a lease is outstanding the handle is
/// left to `SQLite`'s own cleanup at process exit.
pub fn install_panic_hook(supervisor: &ConnectionSupervisor) {
    let (slot, counters) = supervisor.shared_parts();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        if let Ok(mut guard) = slot.try_lock() {
            close_slot(&mut guard, Slot::Vacant, &counters, "panic");
        }
        previous(panic_info);
    }));
}
