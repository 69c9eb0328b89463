//! Startup content for the in-memory backend.
//!
//! Every top-level entry of the seed directory becomes a root: `.car` files
//! are imported block by block, other files and directories are added as
//! UnixFS content.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use cidgate_core::{Cid, ContentPath, MemoryBackend};

/// Load everything under `dir` and return each root with the entry it came
/// from.
pub fn seed_dir(backend: &MemoryBackend, dir: &Path) -> Result<Vec<(String, Cid)>> {
    let mut seeded = Vec::new();
    for entry in read_sorted(dir)? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.extension().is_some_and(|ext| ext == "car") {
            let archive = fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let roots = backend
                .import_car(&archive)
                .with_context(|| format!("failed to import {}", path.display()))?;
            seeded.extend(roots.into_iter().map(|root| (name.clone(), root)));
        } else {
            seeded.push((name, add_path(backend, &path)?));
        }
    }
    Ok(seeded)
}

/// Register static DNS link records.
pub fn apply_dnslink(backend: &MemoryBackend, records: &[(String, String)]) -> Result<()> {
    for (host, target) in records {
        let path = ContentPath::parse(target)
            .with_context(|| format!("invalid DNS link target for {host}"))?;
        backend.set_dnslink(host, path);
    }
    Ok(())
}

fn add_path(backend: &MemoryBackend, path: &Path) -> Result<Cid> {
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if meta.is_dir() {
        let mut children = Vec::new();
        for entry in read_sorted(path)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            children.push((name, add_path(backend, &entry.path())?));
        }
        return Ok(backend.add_directory(children));
    }
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(backend.add_file(data))
}

fn read_sorted(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list {}", dir.display()))?;
    entries.sort_by_key(fs::DirEntry::file_name);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use cidgate_core::{ExportStream, GatewayBackend, ImmutablePath};
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_should_seed_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("site")).unwrap();
        fs::write(dir.path().join("site").join("index.html"), "<p>hi</p>").unwrap();

        let backend = MemoryBackend::new();
        let seeded = seed_dir(&backend, dir.path()).unwrap();
        assert_eq!(seeded.len(), 2);
        assert_eq!(seeded[0].0, "hello.txt");
        assert_eq!(seeded[1].0, "site");

        let site = ContentPath::parse(&format!("/object/{}/index.html", seeded[1].1)).unwrap();
        let site = ImmutablePath::try_from(site).unwrap();
        let (_, data) = backend.get_block(&site).await.unwrap();
        assert_eq!(&data[..], b"<p>hi</p>");
    }

    #[tokio::test]
    async fn test_should_import_car_archives() {
        let source = MemoryBackend::new();
        let file = source.add_file("from a car");
        let (_, export) = source.get_car(&ImmutablePath::from(file)).await.unwrap();
        let ExportStream {
            mut reader,
            done: _done,
            cancel: _cancel,
        } = export;
        let mut archive = Vec::new();
        reader.read_to_end(&mut archive).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("content.car"), &archive).unwrap();

        let backend = MemoryBackend::new();
        let seeded = seed_dir(&backend, dir.path()).unwrap();
        assert_eq!(seeded, vec![("content.car".to_owned(), file)]);
        let (_, data) = backend.get_block(&ImmutablePath::from(file)).await.unwrap();
        assert_eq!(&data[..], b"from a car");
    }

    #[test]
    fn test_should_register_dnslink_records() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("x");
        let records = vec![("example.com".to_owned(), format!("/object/{file}"))];
        apply_dnslink(&backend, &records).unwrap();

        let bad = vec![("example.com".to_owned(), "not-a-path".to_owned())];
        assert!(apply_dnslink(&backend, &bad).is_err());
    }
}
