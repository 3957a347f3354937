use std::fs::File;
use std::io;
use std::path::Path;

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::error::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    Zip,
}

impl ArchiveFormat {
    pub fn parse(s: &str) -> Result<Self, VmError> {
        match s {
            "tar" => Ok(Self::Tar),
            "zip" => Ok(Self::Zip),
            other => Err(VmError::InvalidArgument {
                message: format!("unknown archive format \"{other}\""),
            }),
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Tar => "package.tar",
            Self::Zip => "package.zip",
        }
    }
}

/// Pack the contents of `dir` (not `dir` itself) into `dest`.
pub fn create(dir: &Path, dest: &Path, format: ArchiveFormat) -> Result<(), VmError> {
    let context = || format!("archiving {} into {}", dir.display(), dest.display());
    let file = File::create(dest).map_err(|source| VmError::Io {
        context: context(),
        source,
    })?;
    let result = match format {
        ArchiveFormat::Tar => write_tar(dir, file),
        ArchiveFormat::Zip => write_zip(dir, file),
    };
    result.map_err(|source| VmError::Io {
        context: context(),
        source,
    })?;
    tracing::debug!(dir = %dir.display(), archive = %dest.display(), ?format, "packed workload");
    Ok(())
}

fn write_tar(dir: &Path, file: File) -> io::Result<()> {
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(true);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.sync_all()
}

fn write_zip(dir: &Path, file: File) -> io::Result<()> {
    let mut zip = zip::ZipWriter::new(file);
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace('\\', "/");
        let options = SimpleFileOptions::default().unix_permissions(mode_of(entry.path())?);
        if entry.file_type().is_dir() {
            zip.add_directory(format!("{rel}/"), options)
                .map_err(io::Error::other)?;
        } else {
            zip.start_file(rel, options).map_err(io::Error::other)?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
        }
    }
    zip.finish().map_err(io::Error::other)?;
    Ok(())
}

#[cfg(unix)]
fn mode_of(path: &Path) -> io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(path: &Path) -> io::Result<u32> {
    Ok(if std::fs::metadata(path)?.is_dir() { 0o755 } else { 0o644 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(root: &Path) {
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin/run.sh"), "#!/bin/sh\necho hi\n").unwrap();
        std::fs::write(root.join("data.txt"), "payload").unwrap();
    }

    #[test]
    fn parse_formats() {
        assert_eq!(ArchiveFormat::parse("tar").unwrap(), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::parse("zip").unwrap(), ArchiveFormat::Zip);
        assert!(ArchiveFormat::parse("7z").is_err());
    }

    #[test]
    fn zip_unpacks_with_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        sample_tree(&src);
        let archive = dir.path().join("package.zip");
        create(&src, &archive, ArchiveFormat::Zip).unwrap();

        let out = dir.path().join("out");
        let kind = vmdrive_launcher::unpack::unpack(&archive, &out).unwrap();
        assert_eq!(kind, vmdrive_launcher::ArchiveKind::Zip);
        assert_eq!(std::fs::read_to_string(out.join("data.txt")).unwrap(), "payload");
        assert!(out.join("bin/run.sh").is_file());
    }

    #[test]
    fn tar_unpacks_with_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        sample_tree(&src);
        let archive = dir.path().join("package.tar");
        create(&src, &archive, ArchiveFormat::Tar).unwrap();

        let out = dir.path().join("out");
        let kind = vmdrive_launcher::unpack::unpack(&archive, &out).unwrap();
        assert_eq!(kind, vmdrive_launcher::ArchiveKind::Tar);
        assert_eq!(
            std::fs::read_to_string(out.join("bin/run.sh")).unwrap(),
            "#!/bin/sh\necho hi\n"
        );
    }
}
