//! Bundling host paths into tar archives

use std::{fs, io, path::Path};

use flate2::{write::GzEncoder, Compression};
use tar::{Builder, EntryType, Header};

/// Tar a host file or directory for upload into a container.
///
/// Ownership is normalized to root (uid/gid 0) with mode 0755 for
/// directories and 0644 for files, so extracted content does not carry
/// host-side user ids into the container.
pub(crate) fn bundle(
    path: &Path,
    arcname: &str,
) -> io::Result<Vec<u8>> {
    let mut archive = Builder::new(Vec::new());
    if fs::metadata(path)?.is_dir() {
        append_dir(&mut archive, path, Path::new(arcname))?;
    } else {
        let data = fs::read(path)?;
        let mut header = file_header(data.len() as u64);
        archive.append_data(&mut header, arcname, &data[..])?;
    }
    archive.into_inner()
}

fn append_dir(
    archive: &mut Builder<Vec<u8>>,
    dir: &Path,
    prefix: &Path,
) -> io::Result<()> {
    let mut header = dir_header();
    archive.append_data(&mut header, prefix, &[][..])?;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = prefix.join(entry.file_name());
        if entry.metadata()?.is_dir() {
            append_dir(archive, &entry.path(), &name)?;
        } else {
            let data = fs::read(entry.path())?;
            let mut header = file_header(data.len() as u64);
            archive.append_data(&mut header, &name, &data[..])?;
        }
    }
    Ok(())
}

fn file_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn dir_header() -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Tar and gzip a directory's contents as an image build context
pub(crate) fn dir_gz(path: &Path) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = Builder::new(encoder);
    archive.append_dir_all(".", path)?;
    let encoder = archive.into_inner()?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pocketdock-tarball-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entries_of(bytes: &[u8]) -> BTreeMap<String, (u32, u64, u64, Vec<u8>)> {
        use std::io::Read;
        let mut archive = tar::Archive::new(bytes);
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap();
            let uid = entry.header().uid().unwrap();
            let gid = entry.header().gid().unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(path, (mode, uid, gid, data));
        }
        out
    }

    #[test]
    fn bundles_single_file_with_normalized_ownership() {
        let dir = scratch_dir("file");
        let src = dir.join("script.sh");
        fs::write(&src, b"echo hi\n").unwrap();

        let bytes = bundle(&src, "renamed.sh").unwrap();
        let entries = entries_of(&bytes);

        let (mode, uid, gid, data) = &entries["renamed.sh"];
        assert_eq!(*mode, 0o644);
        assert_eq!((*uid, *gid), (0, 0));
        assert_eq!(data, b"echo hi\n");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bundles_directory_tree_recursively() {
        let dir = scratch_dir("tree");
        fs::create_dir_all(dir.join("src/nested")).unwrap();
        fs::write(dir.join("src/top.txt"), b"top").unwrap();
        fs::write(dir.join("src/nested/deep.txt"), b"deep").unwrap();

        let bytes = bundle(&dir.join("src"), "payload").unwrap();
        let entries = entries_of(&bytes);

        assert_eq!(entries["payload"].0, 0o755);
        assert_eq!(entries["payload/nested"].0, 0o755);
        assert_eq!(entries["payload/top.txt"].3, b"top");
        assert_eq!(entries["payload/nested/deep.txt"].3, b"deep");
        for (mode, uid, gid, _) in entries.values() {
            assert!(*mode == 0o644 || *mode == 0o755);
            assert_eq!((*uid, *gid), (0, 0));
        }

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn build_context_is_gzipped() {
        let dir = scratch_dir("ctx");
        fs::write(dir.join("Dockerfile"), b"FROM scratch\n").unwrap();

        let bytes = dir_gz(&dir).unwrap();
        // gzip magic
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
