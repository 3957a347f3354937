use std::fmt;
use std::time::Duration;

use crate::error::VmError;
use crate::transport::{GuestCommand, Transport};
use crate::vmx::GuestDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Stopped,
    Running,
    Suspended,
    Paused,
}

impl PowerState {
    /// Map the REST API's `power_state` strings.
    pub fn from_api(s: &str) -> Option<Self> {
        match s {
            "poweredOn" => Some(Self::Running),
            "poweredOff" => Some(Self::Stopped),
            "suspended" => Some(Self::Suspended),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Paused => "paused",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerVerb {
    Start,
    /// Hard power-off.
    Stop,
    /// Graceful guest shutdown.
    Shutdown,
    Suspend,
    Pause,
    Unpause,
}

impl PowerVerb {
    pub fn parse(s: &str) -> Result<Self, VmError> {
        match s {
            "start" | "on" => Ok(Self::Start),
            "stop" | "off" => Ok(Self::Stop),
            "shutdown" => Ok(Self::Shutdown),
            "suspend" => Ok(Self::Suspend),
            "pause" => Ok(Self::Pause),
            "unpause" => Ok(Self::Unpause),
            other => Err(VmError::InvalidArgument {
                message: format!(
                    "unknown power verb \"{other}\" (expected start, stop, shutdown, suspend, pause or unpause)"
                ),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Suspend => "suspend",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
        }
    }

    /// Verbs after which the guest is expected to become executable again.
    pub fn wakes_guest(self) -> bool {
        matches!(self, Self::Start | Self::Unpause)
    }

    /// Decide what `self` means for a guest currently in `state`.
    pub fn plan(self, state: PowerState) -> Result<Transition, VmError> {
        use PowerState::*;
        let outcome = match (self, state) {
            (Self::Start, Stopped | Suspended) => Transition::Apply,
            (Self::Start, Running) => Transition::AlreadySatisfied,
            (Self::Stop, Running | Paused | Suspended) => Transition::Apply,
            (Self::Shutdown, Running) => Transition::Apply,
            (Self::Stop | Self::Shutdown, Stopped) => Transition::AlreadySatisfied,
            (Self::Suspend, Running) => Transition::Apply,
            (Self::Suspend, Suspended) => Transition::AlreadySatisfied,
            (Self::Pause, Running) => Transition::Apply,
            (Self::Pause, Paused) => Transition::AlreadySatisfied,
            (Self::Unpause, Paused) => Transition::Apply,
            (Self::Unpause, Running) => Transition::AlreadySatisfied,
            _ => {
                return Err(VmError::InvalidTransition {
                    verb: self.name().into(),
                    state: state.to_string(),
                });
            }
        };
        Ok(outcome)
    }
}

impl fmt::Display for PowerVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    AlreadySatisfied,
}

// ── readiness ───────────────────────────────────────────────

/// Bounded retry budget for the readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub num_tries: u32,
    pub sleep: Duration,
    pub interactive: bool,
}

/// Run a trivial command in the guest. Any transport failure counts as "not ready".
pub async fn can_run_programs(
    transport: &dyn Transport,
    vm: &GuestDescriptor,
    interactive: bool,
) -> bool {
    let probe = GuestCommand {
        program: vm.interpreter.clone(),
        args: vm.guest_os.script_args("exit 0"),
        interactive,
    };
    match transport.run_in_guest(vm, &probe).await {
        Ok(out) => out.exit_code == 0,
        Err(e) => {
            tracing::debug!(vm = %vm.nickname, error = %e, "readiness probe failed");
            false
        }
    }
}

/// Probe up to `num_tries` times, sleeping between attempts. Returns the
/// number of attempts used, or `ReadinessTimeout` once the budget is spent.
pub async fn wait_until_ready(
    transport: &dyn Transport,
    vm: &GuestDescriptor,
    readiness: Readiness,
) -> Result<u32, VmError> {
    for attempt in 1..=readiness.num_tries {
        tracing::debug!(vm = %vm.nickname, attempt, of = readiness.num_tries, "probing guest");
        if can_run_programs(transport, vm, readiness.interactive).await {
            tracing::info!(vm = %vm.nickname, attempt, "guest ready");
            return Ok(attempt);
        }
        if attempt < readiness.num_tries && !readiness.sleep.is_zero() {
            tokio::time::sleep(readiness.sleep).await;
        }
    }
    Err(VmError::ReadinessTimeout {
        vm: vm.nickname.clone(),
        attempts: readiness.num_tries,
    })
}

/// Apply `verb` if the current state calls for it. Transport failures
/// propagate immediately. For waking verbs, `wait` adds the readiness wait.
pub async fn set_power(
    transport: &dyn Transport,
    vm: &GuestDescriptor,
    verb: PowerVerb,
    wait: Option<Readiness>,
) -> Result<PowerState, VmError> {
    let state = transport.power_state(vm).await?;
    match verb.plan(state)? {
        Transition::AlreadySatisfied => {
            tracing::debug!(vm = %vm.nickname, %verb, %state, "power verb already satisfied");
        }
        Transition::Apply => {
            tracing::info!(vm = %vm.nickname, %verb, from = %state, "changing power state");
            transport.set_power(vm, verb).await?;
        }
    }
    if let (true, Some(readiness)) = (verb.wakes_guest(), wait) {
        wait_until_ready(transport, vm, readiness).await?;
    }
    transport.power_state(vm).await
}

/// Bring a guest to running (unpausing if paused) and wait until it can run programs.
pub async fn ensure_ready(
    transport: &dyn Transport,
    vm: &GuestDescriptor,
    readiness: Readiness,
) -> Result<u32, VmError> {
    let state = transport.power_state(vm).await?;
    let verb = match state {
        PowerState::Paused => PowerVerb::Unpause,
        _ => PowerVerb::Start,
    };
    if verb.plan(state)? == Transition::Apply {
        tracing::info!(vm = %vm.nickname, %verb, "powering guest on");
        transport.set_power(vm, verb).await?;
    }
    wait_until_ready(transport, vm, readiness).await
}
