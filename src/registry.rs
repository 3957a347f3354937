use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::OnceCell;
use walkdir::WalkDir;

use crate::error::VmError;
use crate::transport::{GuestListing, Transport};
use crate::vmx::GuestDescriptor;

/// Maps VM identifiers to descriptors. The local inventory (every `.vmx`
/// under `vm_dir`) is scanned once and cached; the remote inventory is
/// queried through the transport when the local one has no match.
pub struct Registry {
    vm_dir: PathBuf,
    local: OnceCell<Vec<GuestDescriptor>>,
}

impl Registry {
    pub fn new(vm_dir: impl Into<PathBuf>) -> Self {
        Self {
            vm_dir: vm_dir.into(),
            local: OnceCell::new(),
        }
    }

    pub fn vm_dir(&self) -> &Path {
        &self.vm_dir
    }

    pub async fn local_inventory(&self) -> Result<&[GuestDescriptor], VmError> {
        let guests = self
            .local
            .get_or_try_init(|| async { scan_vm_dir(&self.vm_dir) })
            .await?;
        Ok(guests.as_slice())
    }

    pub async fn resolve(
        &self,
        identifier: &str,
        transport: &dyn Transport,
    ) -> Result<GuestDescriptor, VmError> {
        let as_path = Path::new(identifier);
        if is_vmx(as_path) && as_path.is_file() {
            return GuestDescriptor::load(as_path);
        }

        if let Some(found) = self
            .local_inventory()
            .await?
            .iter()
            .find(|d| d.matches(identifier))
        {
            tracing::debug!(identifier, path = %found.path.display(), "resolved locally");
            return Ok(found.clone());
        }

        let listings = match transport.list_guests().await {
            Ok(listings) => listings,
            Err(VmError::RemoteSessionRequired { .. }) => {
                return Err(VmError::Resolution {
                    identifier: identifier.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let found = listings
            .into_iter()
            .find(|l| listing_matches(l, identifier))
            .ok_or_else(|| VmError::Resolution {
                identifier: identifier.to_string(),
            })?;
        tracing::debug!(identifier, path = %found.path.display(), "resolved remotely");
        Ok(descriptor_for_listing(found))
    }

    /// Re-resolve a guest that was just created at `path` (a clone). The
    /// local cache never has it; the remote inventory supplies its id. When
    /// the remote inventory is unavailable or has not picked the guest up
    /// yet, the descriptor is read straight from the file.
    pub async fn resolve_by_path_remote(
        &self,
        path: &Path,
        transport: &dyn Transport,
    ) -> Result<GuestDescriptor, VmError> {
        match transport.list_guests().await {
            Ok(listings) => {
                if let Some(found) = listings.into_iter().find(|l| l.path == path) {
                    return Ok(descriptor_for_listing(found));
                }
                tracing::debug!(path = %path.display(), "new guest not in remote inventory yet");
            }
            Err(VmError::RemoteSessionRequired { .. }) => {}
            Err(e) => return Err(e),
        }
        GuestDescriptor::load(path)
    }

    /// Local scan merged with whatever the transport lists. Remote ids are
    /// attached to local entries with the same path. A failing listing only
    /// costs the remote half.
    pub async fn list(&self, transport: &dyn Transport) -> Result<Vec<GuestDescriptor>, VmError> {
        let mut guests = self.local_inventory().await?.to_vec();
        let listings = match transport.list_guests().await {
            Ok(listings) => listings,
            Err(VmError::RemoteSessionRequired { .. }) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "guest listing failed, showing local inventory only");
                Vec::new()
            }
        };
        for listing in listings {
            match guests.iter_mut().find(|g| g.path == listing.path) {
                Some(known) => {
                    if listing.id.is_some() {
                        known.remote_id = listing.id;
                    }
                }
                None => guests.push(descriptor_for_listing(listing)),
            }
        }
        Ok(guests)
    }
}

fn is_vmx(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("vmx"))
}

fn listing_matches(listing: &GuestListing, identifier: &str) -> bool {
    listing.id.as_deref() == Some(identifier)
        || listing.path == Path::new(identifier)
        || listing.nickname() == identifier
}

/// Descriptor for a listed guest; falls back to path-derived fields when the
/// `.vmx` is not readable from here.
fn descriptor_for_listing(listing: GuestListing) -> GuestDescriptor {
    let mut descriptor = GuestDescriptor::load(&listing.path).unwrap_or_else(|e| {
        tracing::debug!(path = %listing.path.display(), error = %e, "descriptor not readable");
        GuestDescriptor::from_values(&listing.path, &BTreeMap::new())
    });
    descriptor.remote_id = listing.id;
    descriptor
}

fn scan_vm_dir(vm_dir: &Path) -> Result<Vec<GuestDescriptor>, VmError> {
    if !vm_dir.is_dir() {
        tracing::debug!(vm_dir = %vm_dir.display(), "vm_dir does not exist");
        return Ok(Vec::new());
    }
    let mut guests = Vec::new();
    for entry in WalkDir::new(vm_dir).follow_links(true) {
        let entry = entry.map_err(|e| VmError::Io {
            context: format!("scanning {}", vm_dir.display()),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() || !is_vmx(entry.path()) {
            continue;
        }
        match GuestDescriptor::load(entry.path()) {
            Ok(descriptor) => guests.push(descriptor),
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable descriptor");
            }
        }
    }
    guests.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(vm_dir = %vm_dir.display(), count = guests.len(), "scanned local inventory");
    Ok(guests)
}
