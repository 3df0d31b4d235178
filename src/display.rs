//! Remote VNC display management.
//!
//! Runs over an established [`RemoteHost`]: makes sure TigerVNC and the
//! chosen desktop are installed, picks a free display slot, starts the
//! server bound to localhost, and kills it again on teardown.
//!
//! Slot selection probes `/tmp/.X{n}-lock` on the remote. Two workers
//! probing the same host at the same moment can pick the same slot; the
//! loser's `vncserver` start then fails and that worker aborts startup.
//!
//! Every server this crate starts gets a lease file under
//! `~/.vnc/byoc/{n}.session` holding the owning session id. The worker
//! rewrites it every [`LEASE_REFRESH`]. Before claiming a slot, a worker kills
//! servers whose lease names its own session (a previous run) or has not been
//! refreshed for [`LEASE_STALE_MINUTES`] (a worker that died without
//! teardown). Displays with a fresh lease belong to another live session and
//! are left running.

use std::time::Duration;

use crate::events::DesktopEnvironment;
use crate::ssh::{ExecOutput, RemoteHost, SshError};

pub const FIRST_SLOT: u8 = 1;
pub const LAST_SLOT: u8 = 99;
pub const GEOMETRY: &str = "1920x1080";
pub const DEPTH: u8 = 24;

/// How often a running worker rewrites its display lease.
pub const LEASE_REFRESH: Duration = Duration::from_secs(15);
/// A lease older than this is treated as abandoned.
pub const LEASE_STALE_MINUTES: u32 = 2;

/// A claimed X display number on the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySlot(pub u8);

impl DisplaySlot {
    /// TCP port the VNC server for this slot listens on.
    pub fn port(&self) -> u16 {
        5900 + self.0 as u16
    }
}

impl std::fmt::Display for DisplaySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error("{step} failed (exit {status:?}): {output}")]
    Command {
        step: &'static str,
        status: Option<u32>,
        output: String,
    },
    #[error("no free display slot in 1..=99")]
    NoFreeSlot,
}

fn command_failed(step: &'static str, out: &ExecOutput) -> DisplayError {
    DisplayError::Command {
        step,
        status: out.exit_status,
        output: out.combined().trim().to_string(),
    }
}

fn desktop_packages(desktop: DesktopEnvironment) -> &'static str {
    match desktop {
        DesktopEnvironment::Xfce => "xfce4 xfce4-goodies",
        DesktopEnvironment::Lxde => "lxde-core lxterminal",
    }
}

fn session_command(desktop: DesktopEnvironment) -> &'static str {
    match desktop {
        DesktopEnvironment::Xfce => "startxfce4",
        DesktopEnvironment::Lxde => "startlxde",
    }
}

/// Shell prefix that elevates when the login user is not root. `sudo -n`
/// fails instead of prompting, so a missing sudoers entry surfaces as an
/// install error rather than a hang.
const SUDO: &str = r#"$( [ "$(id -u)" -eq 0 ] || echo "sudo -n" )"#;

pub fn install_command(desktop: DesktopEnvironment) -> String {
    format!(
        "export DEBIAN_FRONTEND=noninteractive; \
         {SUDO} apt-get update -q && \
         {SUDO} apt-get install -y -q tigervnc-standalone-server tigervnc-common dbus-x11 {}",
        desktop_packages(desktop)
    )
}

pub fn xstartup_command(desktop: DesktopEnvironment) -> String {
    format!(
        "mkdir -p ~/.vnc && cat > ~/.vnc/xstartup <<'EOF'\n\
         #!/bin/sh\n\
         unset SESSION_MANAGER\n\
         unset DBUS_SESSION_BUS_ADDRESS\n\
         exec dbus-launch --exit-with-session {}\n\
         EOF\n\
         chmod +x ~/.vnc/xstartup",
        session_command(desktop)
    )
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn lease_path(slot: DisplaySlot) -> String {
    format!("\"$HOME\"/.vnc/byoc/{}.session", slot.0)
}

/// Kill servers left behind by an earlier run: those leased to
/// `session_id` itself and those whose lease went stale.
fn reclaim_leases_command(session_id: &str) -> String {
    format!(
        r#"for f in "$HOME"/.vnc/byoc/*.session; do
  [ -e "$f" ] || continue
  n=$(basename "$f" .session)
  owner=$(cat "$f" 2>/dev/null)
  if [ "$owner" = {owner} ] || [ -z "$(find "$f" -mmin -{LEASE_STALE_MINUTES} 2>/dev/null)" ]; then
    vncserver -kill ":$n" >/dev/null 2>&1 || true
    rm -f "$f"
  fi
done"#,
        owner = shell_quote(session_id)
    )
}

/// Removes lock files whose owning server is gone, so a crashed server
/// does not permanently hold its slot.
const CLEAN_DEAD_LOCKS: &str = r#"for f in /tmp/.X*-lock; do
  [ -e "$f" ] || continue
  pid=$(tr -d ' ' < "$f" 2>/dev/null)
  if [ -n "$pid" ] && ! kill -0 "$pid" 2>/dev/null; then
    n=${f#/tmp/.X}; n=${n%-lock}
    vncserver -kill ":$n" >/dev/null 2>&1 || true
    rm -f "$f" "/tmp/.X11-unix/X$n" 2>/dev/null || true
  fi
done"#;

/// Stray-server cleanup run before probing for a free slot.
pub fn reclaim_command(session_id: &str) -> String {
    format!("{}\n{CLEAN_DEAD_LOCKS}\ntrue", reclaim_leases_command(session_id))
}

/// Write (or refresh) the lease for `slot`.
pub fn lease_command(slot: DisplaySlot, session_id: &str) -> String {
    format!(
        "mkdir -p \"$HOME\"/.vnc/byoc && printf '%s\\n' {} > {}",
        shell_quote(session_id),
        lease_path(slot)
    )
}

pub fn probe_command() -> String {
    format!(
        "for n in $(seq {FIRST_SLOT} {LAST_SLOT}); do \
         if [ ! -e /tmp/.X$n-lock ]; then echo $n; exit 0; fi; done; exit 1"
    )
}

pub fn start_command(slot: DisplaySlot) -> String {
    format!(
        "vncserver {slot} -localhost yes -SecurityTypes None -geometry {GEOMETRY} -depth {DEPTH}"
    )
}

/// Kill the server on `slot` and drop its lease, keeping the kill's status.
pub fn kill_command(slot: DisplaySlot) -> String {
    format!(
        "vncserver -kill {slot}; rc=$?; rm -f {}; exit $rc",
        lease_path(slot)
    )
}

/// Ensure the VNC server and desktop are installed and `xstartup` is in
/// place. Cheap when the host is already provisioned.
pub async fn provision(remote: &dyn RemoteHost, desktop: DesktopEnvironment) -> Result<(), DisplayError> {
    let check = remote.exec("command -v vncserver").await?;
    if check.success() {
        tracing::debug!("vncserver already installed");
    } else {
        tracing::info!(desktop = %desktop, "installing vnc server and desktop packages");
        let out = remote.exec(&install_command(desktop)).await?;
        if !out.success() {
            return Err(command_failed("package install", &out));
        }
    }

    let out = remote.exec(&xstartup_command(desktop)).await?;
    if !out.success() {
        return Err(command_failed("write xstartup", &out));
    }
    Ok(())
}

/// Reclaim stray servers, claim the first free slot, start the server on
/// it, and lease it to `session_id`.
pub async fn start(remote: &dyn RemoteHost, session_id: &str) -> Result<DisplaySlot, DisplayError> {
    let cleanup = remote.exec(&reclaim_command(session_id)).await?;
    if !cleanup.success() {
        tracing::warn!(output = %cleanup.combined().trim(), "stray display cleanup reported errors");
    }

    let probe = remote.exec(&probe_command()).await?;
    let slot = probe
        .stdout
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|n| (FIRST_SLOT..=LAST_SLOT).contains(n))
        .map(DisplaySlot)
        .ok_or(DisplayError::NoFreeSlot)?;

    let out = remote.exec(&start_command(slot)).await?;
    let already_running = out.combined().contains("already running");
    if !out.success() && !already_running {
        return Err(command_failed("vncserver start", &out));
    }
    tracing::info!(display = %slot, port = slot.port(), "display server started");

    renew_lease(remote, slot, session_id).await;
    Ok(slot)
}

/// Rewrite the lease for `slot`. A failed write is logged; the next
/// refresh tries again.
pub async fn renew_lease(remote: &dyn RemoteHost, slot: DisplaySlot, session_id: &str) {
    match remote.exec(&lease_command(slot, session_id)).await {
        Ok(out) if out.success() => {}
        Ok(out) => tracing::warn!(
            display = %slot,
            output = %out.combined().trim(),
            "display lease write failed"
        ),
        Err(e) => tracing::warn!(display = %slot, error = %e, "display lease write failed"),
    }
}

/// Kill the server on `slot`. Failures are logged; teardown keeps going.
pub async fn stop(remote: &dyn RemoteHost, slot: DisplaySlot) {
    match remote.exec(&kill_command(slot)).await {
        Ok(out) if out.success() => tracing::info!(display = %slot, "display server stopped"),
        Ok(out) => tracing::warn!(
            display = %slot,
            output = %out.combined().trim(),
            "vncserver -kill reported failure"
        ),
        Err(e) => tracing::warn!(display = %slot, error = %e, "failed to kill display server"),
    }
}
