use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::LauncherError;

/// Archive formats the launcher can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
}

const ZIP_MAGIC: [&[u8]; 2] = [b"PK\x03\x04", b"PK\x05\x06"];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// Sniff the archive type from its leading bytes.
pub fn detect(path: &Path) -> Result<ArchiveKind, LauncherError> {
    let mut header = Vec::with_capacity(512);
    File::open(path)
        .and_then(|f| f.take(512).read_to_end(&mut header))
        .map_err(|source| LauncherError::Io {
            context: format!("reading archive header {}", path.display()),
            source,
        })?;

    if ZIP_MAGIC.iter().any(|magic| header.starts_with(magic)) {
        return Ok(ArchiveKind::Zip);
    }
    let tar_end = TAR_MAGIC_OFFSET + TAR_MAGIC.len();
    if header.len() >= tar_end && &header[TAR_MAGIC_OFFSET..tar_end] == TAR_MAGIC {
        return Ok(ArchiveKind::Tar);
    }
    Err(LauncherError::UnknownArchive {
        path: path.display().to_string(),
    })
}

/// Unpack `archive` into `dest`, creating `dest` if needed.
pub fn unpack(archive: &Path, dest: &Path) -> Result<ArchiveKind, LauncherError> {
    let kind = detect(archive)?;
    std::fs::create_dir_all(dest).map_err(|source| LauncherError::Io {
        context: format!("creating {}", dest.display()),
        source,
    })?;

    let file = File::open(archive).map_err(|source| LauncherError::Io {
        context: format!("opening {}", archive.display()),
        source,
    })?;

    match kind {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)?;
            zip.extract(dest)?;
        }
        ArchiveKind::Tar => {
            tar::Archive::new(file)
                .unpack(dest)
                .map_err(|source| LauncherError::Io {
                    context: format!("unpacking {}", archive.display()),
                    source,
                })?;
        }
    }
    Ok(kind)
}
