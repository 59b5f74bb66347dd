//! End-to-end create/extract roundtrips across codecs and edge shapes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use partar::{resolve, Algorithm, ArchiveOption, Composer, Level};
use rand::RngCore;
use tempfile::tempdir;

// ---------- helpers ----------

fn create_tree(root: &Path) {
    let mut rng = rand::thread_rng();
    fs::create_dir_all(root.join("nested/deeper")).unwrap();
    fs::create_dir(root.join("emptydir")).unwrap();

    let mut buf = vec![0u8; 4096];
    for name in ["a.bin", "nested/b.bin", "nested/deeper/c.bin"] {
        rng.fill_bytes(&mut buf);
        fs::write(root.join(name), &buf).unwrap();
    }
    fs::write(root.join("empty"), b"").unwrap();
    fs::write(root.join("file with spaces.txt"), b"spaced").unwrap();
    fs::write(root.join("ünïcødé.txt"), "délicieux".as_bytes()).unwrap();
    std::os::unix::fs::symlink("a.bin", root.join("link1")).unwrap();
    std::os::unix::fs::symlink("nested/deeper/../b.bin", root.join("rel link ünïcødé")).unwrap();

    fs::set_permissions(root.join("a.bin"), fs::Permissions::from_mode(0o751)).unwrap();
    fs::set_permissions(root.join("nested"), fs::Permissions::from_mode(0o750)).unwrap();
}

/// Collects path -> (kind, detail) for every entry under `root`, where the
/// detail is file content + mode, a symlink target, or a directory mode.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, (char, Vec<u8>, u32)> {
    let mut out = BTreeMap::new();
    fn visit(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, (char, Vec<u8>, u32)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            let meta = fs::symlink_metadata(&path).unwrap();
            let mode = meta.permissions().mode() & 0o7777;
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&path).unwrap();
                out.insert(rel, ('l', target.as_os_str().as_encoded_bytes().to_vec(), 0));
            } else if meta.is_dir() {
                out.insert(rel.clone(), ('d', Vec::new(), mode));
                visit(root, &path, out);
            } else {
                out.insert(rel, ('f', fs::read(&path).unwrap(), mode));
            }
        }
    }
    visit(root, root, &mut out);
    out
}

fn assert_trees_equal(src: &Path, dst: &Path) {
    let src_snap = snapshot(src);
    let dst_snap = snapshot(dst);
    assert_eq!(
        src_snap.keys().collect::<Vec<_>>(),
        dst_snap.keys().collect::<Vec<_>>(),
        "tree shapes differ"
    );
    for (path, expected) in &src_snap {
        assert_eq!(expected, &dst_snap[path], "mismatch at {:?}", path);
    }
}

fn roundtrip(create_opts: &[ArchiveOption], extract_opts: &[ArchiveOption]) {
    let src = tempdir().unwrap();
    let tree = src.path().join("tree");
    fs::create_dir(&tree).unwrap();
    create_tree(&tree);

    let work = tempdir().unwrap();
    let archive_path = work.path().join("out.tar");
    let sink = File::create(&archive_path).unwrap();
    let mut composer = Composer::new(sink, create_opts).unwrap();
    composer.add(&tree, "").unwrap();
    composer.close().unwrap();

    let out = tempdir().unwrap();
    let source = File::open(&archive_path).unwrap();
    resolve(source, out.path(), extract_opts).unwrap();

    assert_trees_equal(&tree, &out.path().join("tree"));
}

// ---------- roundtrips ----------

#[test]
fn roundtrip_plain() {
    roundtrip(&[], &[]);
}

#[test]
fn roundtrip_gzip_best() {
    let compression = ArchiveOption::Compression(Algorithm::Gzip);
    roundtrip(
        &[compression, ArchiveOption::CompressionLevel(Level::Best)],
        &[compression],
    );
}

#[test]
fn roundtrip_lz4() {
    let compression = ArchiveOption::Compression(Algorithm::Lz4);
    roundtrip(&[compression], &[compression]);
}

#[test]
fn roundtrip_small_queue() {
    roundtrip(
        &[ArchiveOption::ReadAhead(0)],
        &[ArchiveOption::ReadAhead(0), ArchiveOption::Thread(1)],
    );
}

#[test]
fn gzip_stream_has_magic_bytes() {
    let src = tempdir().unwrap();
    fs::write(src.path().join("x"), b"body").unwrap();

    let work = tempdir().unwrap();
    let archive_path = work.path().join("out.tar.gz");
    let sink = File::create(&archive_path).unwrap();
    let mut composer =
        Composer::new(sink, &[ArchiveOption::Compression(Algorithm::Gzip)]).unwrap();
    composer.add(src.path().join("x"), "").unwrap();
    composer.close().unwrap();

    let data = fs::read(&archive_path).unwrap();
    assert_eq!(&data[..2], &[0x1f, 0x8b]);
}

// ---------- naming ----------

#[test]
fn single_file_is_added_under_prefix() {
    let src = tempdir().unwrap();
    let file = src.path().join("b.txt");
    fs::write(&file, b"hello\nworld").unwrap();

    let mut composer = Composer::new(Vec::new(), &[]).unwrap();
    composer.add(&file, "prefix").unwrap();
    let data = composer.close().unwrap();

    let mut archive = tar::Archive::new(&data[..]);
    let mut entries: Vec<(PathBuf, Vec<u8>)> = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().into_owned();
        let mut body = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut body).unwrap();
        entries.push((path, body));
    }
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, Path::new("prefix/b.txt"));
    assert_eq!(entries[0].1, b"hello\nworld");
}

#[test]
fn subtree_names_include_the_root() {
    let src = tempdir().unwrap();
    let tree = src.path().join("dir");
    fs::create_dir(&tree).unwrap();
    fs::write(tree.join("f"), b"x").unwrap();

    let mut composer = Composer::new(Vec::new(), &[]).unwrap();
    composer.add(&tree, "base").unwrap();
    let data = composer.close().unwrap();

    let mut archive = tar::Archive::new(&data[..]);
    let names: Vec<PathBuf> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().into_owned())
        .collect();
    assert_eq!(names, vec![PathBuf::from("base/dir"), PathBuf::from("base/dir/f")]);
}

// ---------- metadata fidelity ----------

#[test]
fn subsecond_mtime_survives() {
    let src = tempdir().unwrap();
    let file = src.path().join("timed");
    fs::write(&file, b"tick").unwrap();
    let stamp = SystemTime::UNIX_EPOCH + Duration::new(1_600_000_000, 123_456_789);
    File::options()
        .write(true)
        .open(&file)
        .unwrap()
        .set_times(fs::FileTimes::new().set_modified(stamp))
        .unwrap();

    let mut composer = Composer::new(Vec::new(), &[]).unwrap();
    composer.add(&file, "").unwrap();
    let data = composer.close().unwrap();

    let out = tempdir().unwrap();
    resolve(&data[..], out.path(), &[]).unwrap();

    let meta = fs::metadata(out.path().join("timed")).unwrap();
    assert_eq!(meta.mtime(), 1_600_000_000);
    assert_eq!(meta.mtime_nsec(), 123_456_789);
}

#[test]
fn symlink_target_survives() {
    let src = tempdir().unwrap();
    let tree = src.path().join("tree");
    fs::create_dir(&tree).unwrap();
    fs::write(tree.join("file1"), b"data").unwrap();
    std::os::unix::fs::symlink("file1", tree.join("link1")).unwrap();

    let mut composer = Composer::new(Vec::new(), &[]).unwrap();
    composer.add(&tree, "").unwrap();
    let data = composer.close().unwrap();

    let out = tempdir().unwrap();
    resolve(&data[..], out.path(), &[]).unwrap();

    let target = fs::read_link(out.path().join("tree/link1")).unwrap();
    assert_eq!(target, Path::new("file1"));
}

#[test]
fn empty_dir_and_empty_file() {
    let src = tempdir().unwrap();
    let tree = src.path().join("tree");
    fs::create_dir_all(tree.join("hollow")).unwrap();
    fs::write(tree.join("zero"), b"").unwrap();

    let mut composer = Composer::new(Vec::new(), &[]).unwrap();
    composer.add(&tree, "").unwrap();
    let data = composer.close().unwrap();

    let out = tempdir().unwrap();
    resolve(&data[..], out.path(), &[]).unwrap();

    assert!(out.path().join("tree/hollow").is_dir());
    let zero = fs::metadata(out.path().join("tree/zero")).unwrap();
    assert!(zero.is_file());
    assert_eq!(zero.len(), 0);
}

#[test]
fn restrictive_dir_mode_applies_after_children() {
    let src = tempdir().unwrap();
    let tree = src.path().join("tree");
    fs::create_dir_all(tree.join("locked/inner")).unwrap();
    fs::write(tree.join("locked/inner/f"), b"deep").unwrap();
    fs::write(tree.join("locked/g"), b"shallow").unwrap();
    // No write bit anywhere: child writes would fail if the recorded
    // modes were applied before the bodies.
    fs::set_permissions(tree.join("locked/inner"), fs::Permissions::from_mode(0o500)).unwrap();
    fs::set_permissions(tree.join("locked"), fs::Permissions::from_mode(0o500)).unwrap();

    let mut composer = Composer::new(Vec::new(), &[]).unwrap();
    composer.add(&tree, "").unwrap();
    let data = composer.close().unwrap();

    let out = tempdir().unwrap();
    resolve(&data[..], out.path(), &[]).unwrap();

    let locked = out.path().join("tree/locked");
    assert_eq!(fs::metadata(&locked).unwrap().permissions().mode() & 0o7777, 0o500);
    assert_eq!(
        fs::metadata(locked.join("inner")).unwrap().permissions().mode() & 0o7777,
        0o500
    );
    assert_eq!(fs::read(locked.join("inner/f")).unwrap(), b"deep");
    assert_eq!(fs::read(locked.join("g")).unwrap(), b"shallow");

    // Restore write bits so temp cleanup can unlink the fixtures.
    for dir in [
        tree.join("locked/inner"),
        tree.join("locked"),
        locked.join("inner"),
        locked,
    ] {
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

// ---------- threshold ----------

#[test]
fn threshold_splits_buffered_and_inline() {
    let src = tempdir().unwrap();
    let tree = src.path().join("tree");
    fs::create_dir(&tree).unwrap();
    let mut rng = rand::thread_rng();
    let mut small = vec![0u8; 500];
    rng.fill_bytes(&mut small);
    let mut at_threshold = vec![0u8; 1024];
    rng.fill_bytes(&mut at_threshold);
    let mut big = vec![0u8; 3 << 20];
    rng.fill_bytes(&mut big);
    fs::write(tree.join("small.bin"), &small).unwrap();
    fs::write(tree.join("exact.bin"), &at_threshold).unwrap();
    fs::write(tree.join("big.bin"), &big).unwrap();

    let mut composer = Composer::new(Vec::new(), &[]).unwrap();
    composer.add(&tree, "").unwrap();
    let data = composer.close().unwrap();

    let out = tempdir().unwrap();
    resolve(&data[..], out.path(), &[ArchiveOption::Threshold(1024)]).unwrap();

    assert_eq!(fs::read(out.path().join("tree/small.bin")).unwrap(), small);
    assert_eq!(fs::read(out.path().join("tree/exact.bin")).unwrap(), at_threshold);
    assert_eq!(fs::read(out.path().join("tree/big.bin")).unwrap(), big);
}
