//! Filesystem layer export.
//!
//! The image root is written as a single tar layer. Entries are sorted,
//! carry mtime 0 and are owned by uid 0 / gid 0, so identical trees export
//! to identical bytes.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// The exported layer of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// File name inside the image directory.
    pub file: String,
    /// SHA-256 of the layer file, hex encoded.
    pub digest: String,
    /// Layer file size in bytes.
    pub size: u64,
    /// Whether the layer is gzip compressed.
    pub compressed: bool,
}

/// Writes `rootfs` as a tar layer into `dest_dir`.
///
/// # Errors
///
/// Returns an error if the tree cannot be read or the layer written.
pub fn export_layer(rootfs: &Path, dest_dir: &Path, compress: bool) -> io::Result<LayerInfo> {
    let file_name = if compress { "layer.tar.gz" } else { "layer.tar" };
    let path = dest_dir.join(file_name);
    let out = BufWriter::new(File::create(&path)?);

    if compress {
        let encoder = GzEncoder::new(out, Compression::default());
        let encoder = write_tar(rootfs, encoder)?;
        encoder.finish()?.flush()?;
    } else {
        write_tar(rootfs, out)?.flush()?;
    }

    Ok(LayerInfo {
        file: file_name.to_string(),
        digest: file_digest(&path)?,
        size: fs::metadata(&path)?.len(),
        compressed: compress,
    })
}

fn file_digest(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn write_tar<W: Write>(rootfs: &Path, writer: W) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);

    for entry in WalkDir::new(rootfs).follow_links(false).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(rootfs)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let meta = entry.path().symlink_metadata()?;

        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_mode(meta.permissions().mode() & 0o7777);

        if meta.file_type().is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            let target = fs::read_link(entry.path())?;
            builder.append_link(&mut header, relative, target)?;
        } else if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, relative, io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            builder.append_data(&mut header, relative, File::open(entry.path())?)?;
        }
    }

    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn sample_root(root: &Path) {
        fs::create_dir_all(root.join("app/models")).unwrap();
        fs::write(root.join("app/models/model.tar.gz"), b"weights").unwrap();
        fs::set_permissions(root.join("app/models/model.tar.gz"), fs::Permissions::from_mode(0o660)).unwrap();
        std::os::unix::fs::symlink("models/model.tar.gz", root.join("app/latest")).unwrap();
    }

    #[test]
    fn test_export_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("rootfs");
        sample_root(&root);

        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        let first = export_layer(&root, &a, true).unwrap();
        let second = export_layer(&root, &b, true).unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.file, "layer.tar.gz");
    }

    #[test]
    fn test_entries_owned_by_group_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("rootfs");
        sample_root(&root);

        let info = export_layer(&root, tmp.path(), true).unwrap();
        let file = File::open(tmp.path().join(&info.file)).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));

        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.gid().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            seen.push((
                entry.path().unwrap().display().to_string(),
                header.mode().unwrap() & 0o777,
            ));
        }

        assert!(seen.contains(&("app/models/model.tar.gz".to_string(), 0o660)));
        assert!(seen.iter().any(|(p, _)| p == "app/latest"));
    }

    #[test]
    fn test_uncompressed_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("rootfs");
        sample_root(&root);

        let info = export_layer(&root, tmp.path(), false).unwrap();
        assert_eq!(info.file, "layer.tar");
        assert!(!info.compressed);
        assert_eq!(info.size, fs::metadata(tmp.path().join("layer.tar")).unwrap().len());
    }
}
