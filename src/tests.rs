use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::functions::get_hash::hash_bytes;
use crate::installer::LocalInstaller;
use crate::remote::RemoteInstaller;
use crate::structures::{
  InstallLocation, Part, PatchIndex, PatchSource, PatchSourceKey, ProgressEvent, Repository,
  TargetFile, TargetStreamMode, VerifyState,
};
use crate::traits::RawChunkCodec;
use crate::verifier_builder::VerifierBuilder;
use crate::CancellationToken;

fn pattern(seed: u8, len: usize) -> Vec<u8> {
  (0..len).map(|offset| seed.wrapping_add(offset as u8)).collect()
}

struct Fixture {
  index: PatchIndex,
  game_root: PathBuf,
  patch_dir: PathBuf,
  index_path: PathBuf,
}

/// Two target files fed by two patch sources, with every part's bytes laid
/// out in both the sources and the targets.
fn fixture(dir: &Path) -> Fixture {
  let part_bytes = [pattern(1, 64), pattern(2, 64), pattern(3, 32), pattern(4, 64)];
  let part = |source_index: u16, target_offset: u64, source_offset: u64, bytes: &[u8]| Part {
    source_index,
    target_offset,
    length: bytes.len() as u32,
    source_offset,
    source_size: bytes.len() as u32,
    hash: hash_bytes(bytes),
  };
  let index = PatchIndex {
    expansion_version: 0,
    targets: vec![
      TargetFile {
        relative_path: "game/data0.dat".to_string(),
        file_size: 128,
        parts: vec![
          part(0, 0, 0, &part_bytes[0]),
          part(1, 64, 0, &part_bytes[1]),
        ],
      },
      TargetFile {
        relative_path: "game/data1.dat".to_string(),
        file_size: 96,
        parts: vec![
          part(0, 0, 64, &part_bytes[2]),
          part(1, 32, 64, &part_bytes[3]),
        ],
      },
    ],
    sources: vec!["base.patch".to_string(), "ex.patch".to_string()],
  };
  index.validate().unwrap();

  let game_root = dir.join("game-root");
  let patch_dir = dir.join("patches");
  std::fs::create_dir_all(game_root.join("game")).unwrap();
  std::fs::create_dir_all(&patch_dir).unwrap();

  std::fs::write(patch_dir.join("base.patch"), [part_bytes[0].clone(), part_bytes[2].clone()].concat()).unwrap();
  std::fs::write(patch_dir.join("ex.patch"), [part_bytes[1].clone(), part_bytes[3].clone()].concat()).unwrap();
  std::fs::write(game_root.join("game/data0.dat"), [part_bytes[0].clone(), part_bytes[1].clone()].concat()).unwrap();
  std::fs::write(game_root.join("game/data1.dat"), [part_bytes[2].clone(), part_bytes[3].clone()].concat()).unwrap();

  let index_path = dir.join("test.patch.index");
  let mut file = std::fs::File::create(&index_path).unwrap();
  index.encode(&mut file).unwrap();

  Fixture { index, game_root, patch_dir, index_path }
}

fn corrupt(path: &Path, offset: u64, len: usize) {
  use std::io::{Seek, SeekFrom, Write};
  let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
  file.seek(SeekFrom::Start(offset)).unwrap();
  file.write_all(&vec![0xAA; len]).unwrap();
}

fn local_installer(index: &PatchIndex) -> LocalInstaller {
  LocalInstaller::new(Arc::new(index.clone()), Duration::ZERO, Arc::new(RawChunkCodec))
}

#[tokio::test]
async fn verify_is_idempotent_without_intervening_writes() {
  let dir = tempfile::tempdir().unwrap();
  let fixture = fixture(dir.path());
  corrupt(&fixture.game_root.join("game/data0.dat"), 70, 8);

  let cancel = CancellationToken::new();
  let mut installer = local_installer(&fixture.index);
  installer.set_target_streams(&fixture.game_root, TargetStreamMode::ReadOnly).await.unwrap();

  installer.verify(true, 2, &cancel).await.unwrap();
  let first = installer.missing_parts_per_target();
  installer.verify(true, 2, &cancel).await.unwrap();
  let second = installer.missing_parts_per_target();

  assert_eq!(first, vec![vec![1], vec![]]);
  assert_eq!(first, second);
}

#[tokio::test]
async fn missing_target_file_reports_all_its_parts() {
  let dir = tempfile::tempdir().unwrap();
  let fixture = fixture(dir.path());
  std::fs::remove_file(fixture.game_root.join("game/data1.dat")).unwrap();

  let cancel = CancellationToken::new();
  let mut installer = local_installer(&fixture.index);
  installer.set_target_streams(&fixture.game_root, TargetStreamMode::ReadOnly).await.unwrap();
  installer.verify(true, 1, &cancel).await.unwrap();

  assert_eq!(installer.missing_parts_per_target(), vec![vec![], vec![0, 1]]);
  assert_eq!(installer.missing_parts_per_source(), vec![vec![(1, 0)], vec![(1, 1)]]);
}

#[tokio::test]
async fn two_corrupted_parts_from_two_sources_repair_in_one_cycle() {
  let dir = tempfile::tempdir().unwrap();
  let fixture = fixture(dir.path());
  // One part per source, in different target files.
  corrupt(&fixture.game_root.join("game/data0.dat"), 0, 16);
  corrupt(&fixture.game_root.join("game/data1.dat"), 40, 16);

  let remote = RemoteInstaller::start_in_process(Arc::new(RawChunkCodec)).await.unwrap();
  let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
  let seen = events.clone();
  let subscription = remote.subscribe_progress(Arc::new(move |event| {
    seen.lock().unwrap().push(event);
  }));

  remote.construct_from_index(&fixture.index, Duration::ZERO).await.unwrap();
  remote.set_target_streams(&fixture.game_root, TargetStreamMode::ReadOnly).await.unwrap();
  remote.verify_files(true, 2).await.unwrap();
  assert_eq!(remote.missing_parts_per_target().await.unwrap(), vec![vec![0], vec![1]]);

  remote.set_target_streams(&fixture.game_root, TargetStreamMode::ReadWriteMissing).await.unwrap();
  let per_source = remote.missing_parts_per_source().await.unwrap();
  assert_eq!(per_source, vec![vec![(0, 0)], vec![(1, 1)]]);
  for (source_index, parts) in per_source.iter().enumerate() {
    if parts.is_empty() {
      continue;
    }
    let location = InstallLocation::Local(fixture.patch_dir.join(&fixture.index.sources[source_index]));
    remote.queue_install(source_index as u16, &location, 4).await.unwrap();
  }
  remote.install(4).await.unwrap();

  remote.set_target_streams(&fixture.game_root, TargetStreamMode::ReadOnly).await.unwrap();
  remote.verify_files(false, 2).await.unwrap();
  assert_eq!(remote.missing_parts_per_target().await.unwrap(), vec![Vec::<u32>::new(), Vec::new()]);

  drop(subscription);
  remote.shutdown().await.unwrap();

  assert!(events.lock().unwrap().iter().any(|event| matches!(event, ProgressEvent::Verify { .. })));
  assert!(events.lock().unwrap().iter().any(|event| matches!(event, ProgressEvent::Install { .. })));
}

#[tokio::test]
async fn orchestrated_repair_converges_and_reverifies() {
  let dir = tempfile::tempdir().unwrap();
  let fixture = fixture(dir.path());
  corrupt(&fixture.game_root.join("game/data0.dat"), 0, 16);
  corrupt(&fixture.game_root.join("game/data0.dat"), 100, 8);

  let mut builder = VerifierBuilder::new();
  builder.set_game_root(fixture.game_root.clone());
  for name in &fixture.index.sources {
    builder.register_source(
      PatchSourceKey { repository: Repository::BaseGame, file_name: name.clone() },
      PatchSource { local_file: Some(fixture.patch_dir.join(name)), uri: None },
    );
  }
  let verifier = builder.build().unwrap();

  assert_eq!(verifier.repair_index_file(&fixture.index_path).await, VerifyState::Done);
  assert_eq!(verifier.progress().num_broken_files(), 0);
  assert!(verifier.progress().attempt() >= 2); // repaired, then re-verified

  let restored = std::fs::read(fixture.game_root.join("game/data0.dat")).unwrap();
  assert_eq!(&restored[..16], &pattern(1, 64)[..16]);
  assert_eq!(&restored[100..108], &pattern(2, 64)[36..44]);
}

#[tokio::test]
async fn unresolvable_source_exhausts_exactly_five_attempts() {
  let dir = tempfile::tempdir().unwrap();
  let fixture = fixture(dir.path());
  corrupt(&fixture.game_root.join("game/data1.dat"), 0, 8);

  let mut builder = VerifierBuilder::new();
  builder.set_game_root(fixture.game_root.clone());
  for name in &fixture.index.sources {
    builder.register_source(
      PatchSourceKey { repository: Repository::BaseGame, file_name: name.clone() },
      PatchSource { local_file: Some(fixture.patch_dir.join("gone").join(name)), uri: None },
    );
  }
  let verifier = builder.build().unwrap();

  assert_eq!(verifier.repair_index_file(&fixture.index_path).await, VerifyState::Error);
  assert_eq!(verifier.progress().attempt(), 5);
  assert!(matches!(verifier.take_last_error(), Some(crate::structures::Error::Install(_))));
}

#[tokio::test]
async fn verify_only_reports_broken_files_and_writes_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let fixture = fixture(dir.path());
  corrupt(&fixture.game_root.join("game/data1.dat"), 0, 8);
  let before = std::fs::read(fixture.game_root.join("game/data1.dat")).unwrap();

  let operation = crate::operations::IndexOperation {
    index_path: fixture.index_path.clone(),
    game_root: fixture.game_root.clone(),
    patch_dir: Some(fixture.patch_dir.clone()),
    patch_base_url: None,
    worker_executable: None,
    concurrency: 2,
  };
  let broken = crate::operations::verify_from_index_file(&operation).await.unwrap();

  assert_eq!(broken, 1);
  assert_eq!(std::fs::read(fixture.game_root.join("game/data1.dat")).unwrap(), before);
}

#[tokio::test]
async fn cancelled_verify_surfaces_as_cancelled() {
  let dir = tempfile::tempdir().unwrap();
  let fixture = fixture(dir.path());

  let cancel = CancellationToken::new();
  cancel.cancel();
  let mut installer = local_installer(&fixture.index);
  installer.set_target_streams(&fixture.game_root, TargetStreamMode::ReadOnly).await.unwrap();

  let result = installer.verify(true, 2, &cancel).await;
  assert!(matches!(result, Err(crate::structures::Error::Cancelled)));
}
