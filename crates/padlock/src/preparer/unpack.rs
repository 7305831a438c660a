use crate::types::SDistFormat;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

/// Unpacks a source distribution archive into `target`, returning the
/// directory holding the project (archives conventionally wrap everything in
/// a single `name-version/` directory).
pub fn unpack_sdist(
    archive: &Path,
    format: SDistFormat,
    target: &Path,
) -> io::Result<PathBuf> {
    fs_err::create_dir_all(target)?;
    match format {
        SDistFormat::Zip => unpack_zip(archive, target)?,
        SDistFormat::TarGz => {
            let file = fs_err::File::open(archive)?;
            unpack_tar(flate2::read::GzDecoder::new(file), target)?;
        }
        SDistFormat::Tar => {
            let file = fs_err::File::open(archive)?;
            unpack_tar(file, target)?;
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported sdist format {}", other.extension()),
            ))
        }
    }
    Ok(source_root(target))
}

fn unpack_zip(archive: &Path, target: &Path) -> io::Result<()> {
    let file = fs_err::File::open(archive)?;
    let mut archive = zip::ZipArchive::new(file.into_parts().0)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    archive
        .extract(target)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn unpack_tar(reader: impl Read, target: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.unpack(target)
}

/// When the target holds exactly one directory, that directory is the source
/// root; otherwise the target itself is.
fn source_root(target: &Path) -> PathBuf {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(target)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .collect();
    if entries.len() == 1 && entries[0].is_dir() {
        entries.remove(0)
    } else {
        target.to_path_buf()
    }
}

/// Reads the `METADATA` bytes of a wheel without unpacking the rest.
pub fn wheel_metadata_bytes(wheel: impl Read + Seek) -> io::Result<Vec<u8>> {
    let mut archive =
        zip::ZipArchive::new(wheel).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let entry_name = archive
        .file_names()
        .filter(|name| name.ends_with(".dist-info/METADATA") && name.matches('/').count() == 1)
        .map(|name| name.to_string())
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "wheel has no .dist-info/METADATA")
        })?;
    let mut entry = archive
        .by_name(&entry_name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut blob = Vec::new();
    entry.read_to_end(&mut blob)?;
    Ok(blob)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn make_tar_gz(dir: &Path) -> PathBuf {
        let archive_path = dir.join("demo-0.0.1.tar.gz");
        let file = fs_err::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        let content = b"[project]\nname = \"demo\"\nversion = \"0.0.1\"\n";
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "demo-0.0.1/pyproject.toml", content.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        archive_path
    }

    fn make_wheel(dir: &Path) -> PathBuf {
        let wheel_path = dir.join("demo-0.0.1-py3-none-any.whl");
        let file = fs_err::File::create(&wheel_path).unwrap();
        let mut writer = zip::ZipWriter::new(file.into_parts().0);
        writer
            .start_file("demo-0.0.1.dist-info/METADATA", zip::write::FileOptions::default())
            .unwrap();
        writer
            .write_all(b"Metadata-Version: 2.1\nName: demo\nVersion: 0.0.1\n")
            .unwrap();
        writer.finish().unwrap();
        wheel_path
    }

    #[test]
    fn test_unpack_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_tar_gz(dir.path());
        let root = unpack_sdist(&archive, SDistFormat::TarGz, &dir.path().join("out")).unwrap();
        assert!(root.ends_with("demo-0.0.1"));
        assert!(root.join("pyproject.toml").is_file());
    }

    #[test]
    fn test_wheel_metadata_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let wheel = make_wheel(dir.path());
        let file = fs_err::File::open(&wheel).unwrap();
        let blob = wheel_metadata_bytes(file.into_parts().0).unwrap();
        assert!(String::from_utf8_lossy(&blob).contains("Name: demo"));
    }
}
