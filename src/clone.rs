use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::SystemTime;

use crate::cleanup::CleanupGuard;
use crate::config::CloneConfig;
use crate::error::VmError;
use crate::platform::HostPlatform;
use crate::power::{PowerState, PowerVerb};
use crate::registry::Registry;
use crate::transport::{CloneRequest, Transport};
use crate::vmx::GuestDescriptor;

/// Candidate names tried before giving up with `CloneCollision`.
pub const MAX_NAME_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOptions {
    pub full: bool,
    pub snapshot: Option<String>,
    /// Take a `snapshot_<timestamp>` snapshot of the source and clone from it.
    pub fresh_snapshot: bool,
    /// Shut a running source down before cloning.
    pub stop_source: bool,
    pub dir_suffix: &'static str,
}

impl CloneOptions {
    pub fn from_config(config: &CloneConfig, platform: HostPlatform) -> Self {
        Self {
            full: config.full,
            snapshot: config.snapshot.clone(),
            fresh_snapshot: config.fresh_snapshot,
            stop_source: config.stop_source,
            dir_suffix: platform.vm_dir_suffix(),
        }
    }
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            full: false,
            snapshot: None,
            fresh_snapshot: false,
            stop_source: true,
            dir_suffix: "",
        }
    }
}

/// A planned or created clone. Owned by the operation that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneDescriptor {
    pub source: GuestDescriptor,
    pub nickname: String,
    pub target_dir: PathBuf,
    pub vmx_path: PathBuf,
    pub full: bool,
    pub snapshot: Option<String>,
}

impl CloneDescriptor {
    fn at(source: &GuestDescriptor, parent: &Path, name: &str, opts: &CloneOptions) -> Self {
        let target_dir = parent.join(format!("{name}{}", opts.dir_suffix));
        Self {
            source: source.clone(),
            nickname: name.to_string(),
            vmx_path: target_dir.join(format!("{name}.vmx")),
            target_dir,
            full: opts.full,
            snapshot: opts.snapshot.clone(),
        }
    }
}

// ── naming ──────────────────────────────────────────────────

/// `YYYYMMDDHHMMSS` in UTC for a unix timestamp.
pub fn compact_timestamp(unix_secs: u64) -> String {
    let days = (unix_secs / 86_400) as i64;
    let rem = unix_secs % 86_400;

    // days since 1970-01-01 → civil date (proleptic Gregorian)
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era = (day_of_era - day_of_era / 1_460 + day_of_era / 36_524
        - day_of_era / 146_096)
        / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * month_index + 2) / 5 + 1;
    let month = if month_index < 10 { month_index + 3 } else { month_index - 9 };
    let year = year_of_era + era * 400 + i64::from(month <= 2);

    format!(
        "{year:04}{month:02}{day:02}{:02}{:02}{:02}",
        rem / 3_600,
        (rem % 3_600) / 60,
        rem % 60
    )
}

pub fn now_stamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    compact_timestamp(secs)
}

/// Pick a clone name `<source>_clone_<stamp>[_<n>]` next to the source's
/// bundle whose directory and `.vmx` do not exist yet.
pub fn plan_clone(
    source: &GuestDescriptor,
    stamp: &str,
    opts: &CloneOptions,
    exists: impl Fn(&Path) -> bool,
) -> Result<CloneDescriptor, VmError> {
    let parent = source.bundle_dir().parent().unwrap_or(Path::new("."));
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = match attempt {
            0 => format!("{}_clone_{stamp}", source.nickname),
            n => format!("{}_clone_{stamp}_{n}", source.nickname),
        };
        let plan = CloneDescriptor::at(source, parent, &name, opts);
        if !exists(&plan.target_dir) && !exists(&plan.vmx_path) {
            return Ok(plan);
        }
        tracing::debug!(name, "clone name taken");
    }
    Err(VmError::CloneCollision {
        source_vm: source.nickname.clone(),
        attempts: MAX_NAME_ATTEMPTS,
    })
}

/// Plan a persistent clone with a caller-chosen name, optionally in `where_dir`.
pub fn plan_named_clone(
    source: &GuestDescriptor,
    name: &str,
    where_dir: Option<&Path>,
    opts: &CloneOptions,
) -> Result<CloneDescriptor, VmError> {
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(VmError::InvalidArgument {
            message: format!("invalid clone name \"{name}\""),
        });
    }
    let parent = match where_dir {
        Some(dir) => dir,
        None => source.bundle_dir().parent().unwrap_or(Path::new(".")),
    };
    let plan = CloneDescriptor::at(source, parent, name, opts);
    if plan.target_dir.exists() {
        return Err(VmError::InvalidArgument {
            message: format!("{} already exists", plan.target_dir.display()),
        });
    }
    Ok(plan)
}

// ── lifecycle ───────────────────────────────────────────────

/// Get the source into a cloneable state. Returns the snapshot to clone from.
pub async fn prepare_source(
    transport: &dyn Transport,
    source: &GuestDescriptor,
    opts: &CloneOptions,
) -> Result<Option<String>, VmError> {
    if opts.stop_source && transport.power_state(source).await? != PowerState::Stopped {
        tracing::info!(vm = %source.nickname, "shutting source down before cloning");
        transport.set_power(source, PowerVerb::Shutdown).await?;
    }
    if opts.fresh_snapshot {
        let name = format!("snapshot_{}", now_stamp());
        tracing::info!(vm = %source.nickname, snapshot = %name, "creating snapshot");
        transport.snapshot(source, &name).await?;
        return Ok(Some(name));
    }
    Ok(opts.snapshot.clone())
}

/// Create the planned clone. If the transport fails partway, whatever it
/// left behind is torn down (and counted) before the error is returned.
/// On success the caller arms teardown before resolving.
pub async fn create(
    transport: &Arc<dyn Transport>,
    plan: &CloneDescriptor,
    failures: &Arc<AtomicUsize>,
) -> Result<(), VmError> {
    std::fs::create_dir_all(&plan.target_dir).map_err(|source| VmError::Io {
        context: format!("creating {}", plan.target_dir.display()),
        source,
    })?;

    let request = CloneRequest {
        destination: plan.vmx_path.clone(),
        name: plan.nickname.clone(),
        full: plan.full,
        snapshot: plan.snapshot.clone(),
    };
    tracing::info!(
        source = %plan.source.nickname,
        clone = %plan.nickname,
        full = plan.full,
        snapshot = ?plan.snapshot,
        "cloning"
    );
    let Err(e) = transport.clone_guest(&plan.source, &request).await else {
        return Ok(());
    };

    tracing::warn!(clone = %plan.nickname, error = %e, "clone failed, removing partial clone");
    if plan.vmx_path.exists() {
        let partial = GuestDescriptor::from_values(&plan.vmx_path, &BTreeMap::new());
        teardown_guard(transport, &partial, &plan.target_dir, failures)
            .run()
            .await;
    } else {
        let target_dir = plan.target_dir.clone();
        CleanupGuard::new(
            format!("clone {}", plan.nickname),
            failures.clone(),
            move || async move { remove_target_dir(&target_dir) },
        )
        .run()
        .await;
    }
    Err(e)
}

/// Resolve a freshly created clone, arming teardown first so that a failed
/// lookup still releases it.
pub async fn resolve_created(
    transport: &Arc<dyn Transport>,
    registry: &Registry,
    plan: &CloneDescriptor,
    failures: &Arc<AtomicUsize>,
) -> Result<(GuestDescriptor, CleanupGuard), VmError> {
    let provisional = GuestDescriptor::from_values(&plan.vmx_path, &BTreeMap::new());
    match registry
        .resolve_by_path_remote(&plan.vmx_path, transport.as_ref())
        .await
    {
        Ok(clone) => {
            let guard = teardown_guard(transport, &clone, &plan.target_dir, failures);
            Ok((clone, guard))
        }
        Err(e) => {
            teardown_guard(transport, &provisional, &plan.target_dir, failures)
                .run()
                .await;
            Err(e)
        }
    }
}

/// Guard that tears the clone down when run or dropped.
pub fn teardown_guard(
    transport: &Arc<dyn Transport>,
    clone: &GuestDescriptor,
    target_dir: &Path,
    failures: &Arc<AtomicUsize>,
) -> CleanupGuard {
    let transport = transport.clone();
    let clone = clone.clone();
    let target_dir = target_dir.to_path_buf();
    CleanupGuard::new(
        format!("clone {}", clone.nickname),
        failures.clone(),
        move || async move { teardown(transport.as_ref(), &clone, &target_dir).await },
    )
}

/// Power off and delete a clone. Never fails; returns warnings for whatever
/// could not be released.
pub async fn teardown(
    transport: &dyn Transport,
    clone: &GuestDescriptor,
    target_dir: &Path,
) -> Vec<String> {
    let mut warnings = Vec::new();

    match transport.set_power(clone, PowerVerb::Stop).await {
        Ok(()) => tracing::debug!(vm = %clone.nickname, "clone powered off"),
        // Usually "not running"; deletion below reports anything real.
        Err(e) => tracing::debug!(vm = %clone.nickname, error = %e, "power-off before delete"),
    }

    if let Err(e) = transport.delete_guest(clone).await {
        warnings.push(format!("deleting {}: {e}", clone.path.display()));
    }

    warnings.extend(remove_target_dir(target_dir));

    if warnings.is_empty() {
        tracing::info!(vm = %clone.nickname, "clone deleted");
    }
    warnings
}

fn remove_target_dir(target_dir: &Path) -> Vec<String> {
    if !target_dir.exists() {
        return Vec::new();
    }
    match std::fs::remove_dir_all(target_dir) {
        Ok(()) => Vec::new(),
        Err(e) => vec![format!("removing {}: {e}", target_dir.display())],
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn source() -> GuestDescriptor {
        GuestDescriptor::from_values(Path::new("/vms/builder/builder.vmx"), &BTreeMap::new())
    }

    #[test]
    fn timestamps() {
        assert_eq!(compact_timestamp(0), "19700101000000");
        assert_eq!(compact_timestamp(951_782_400), "20000229000000");
        assert_eq!(compact_timestamp(1_700_000_000), "20231114221320");
    }

    #[test]
    fn clone_sits_next_to_source_bundle() {
        let plan = plan_clone(&source(), "20240101000000", &CloneOptions::default(), |_| false)
            .unwrap();
        assert_eq!(plan.nickname, "builder_clone_20240101000000");
        assert_eq!(
            plan.vmx_path,
            PathBuf::from("/vms/builder_clone_20240101000000/builder_clone_20240101000000.vmx")
        );
    }

    #[test]
    fn bundle_suffix_applied() {
        let opts = CloneOptions {
            dir_suffix: ".vmwarevm",
            ..CloneOptions::default()
        };
        let plan = plan_clone(&source(), "1", &opts, |_| false).unwrap();
        assert_eq!(
            plan.target_dir,
            PathBuf::from("/vms/builder_clone_1.vmwarevm")
        );
    }

    #[test]
    fn collision_regenerates_name() {
        let taken = PathBuf::from("/vms/builder_clone_1");
        let plan = plan_clone(&source(), "1", &CloneOptions::default(), |p| p == taken).unwrap();
        assert_eq!(plan.nickname, "builder_clone_1_1");
    }

    #[test]
    fn persistent_collision_fails_explicitly() {
        let err = plan_clone(&source(), "1", &CloneOptions::default(), |_| true).unwrap_err();
        assert!(matches!(
            err,
            VmError::CloneCollision {
                attempts: MAX_NAME_ATTEMPTS,
                ..
            }
        ));
    }

    #[test]
    fn named_clone_validation() {
        let opts = CloneOptions::default();
        assert!(plan_named_clone(&source(), "a/b", None, &opts).is_err());
        let plan = plan_named_clone(&source(), "golden", Some(Path::new("/other")), &opts).unwrap();
        assert_eq!(plan.vmx_path, PathBuf::from("/other/golden/golden.vmx"));
    }
}
