use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use indexed_patcher::operations::{repair_from_index_file, verify_from_index_file, IndexOperation};
use indexed_patcher::{Error, RawChunkCodec};

fn usage() {
  println!("usage:");
  println!("  indexed-patcher index-verify <index file> <game root> [patch dir or base uri]");
  println!("  indexed-patcher index-repair <index file> <game root> <patch dir or base uri>");
  println!("  indexed-patcher index-rpc <parent pid> <channel name>");
}

fn operation(args: &[String]) -> Result<IndexOperation, Error> {
  if args.len() < 2 {
    return Err(Error::None("an index file and a game root are required".to_string()));
  }
  let mut operation = IndexOperation {
    index_path: PathBuf::from(&args[0]),
    game_root: PathBuf::from(&args[1]),
    patch_dir: None,
    patch_base_url: None,
    worker_executable: std::env::current_exe().ok(),
    concurrency: 0,
  };
  if let Some(patches) = args.get(2) {
    if patches.starts_with("http://") || patches.starts_with("https://") {
      operation.patch_base_url = Some(patches.clone());
    } else {
      operation.patch_dir = Some(PathBuf::from(patches));
    }
  }
  Ok(operation)
}

async fn dispatch(args: &[String]) -> Result<i32, Error> {
  match args.first().map(String::as_str) {
    Some("index-verify") => {
      let broken = verify_from_index_file(&operation(&args[1..])?).await?;
      println!("{} broken files", broken);
      Ok(if broken == 0 { 0 } else { 1 })
    },
    Some("index-repair") => {
      if args.len() < 4 {
        return Err(Error::None("an index file, a game root and a patch location are required".to_string()));
      }
      repair_from_index_file(&operation(&args[1..])?).await?;
      println!("repair complete");
      Ok(0)
    },
    #[cfg(unix)]
    Some("index-rpc") => {
      let parent_pid = args.get(1)
        .and_then(|pid| pid.parse::<u32>().ok())
        .ok_or_else(|| Error::None("a numeric parent pid is required".to_string()))?;
      let channel_name = args.get(2)
        .ok_or_else(|| Error::None("a channel name is required".to_string()))?;
      indexed_patcher::run_worker(channel_name, Some(parent_pid), Arc::new(RawChunkCodec)).await?;
      Ok(0)
    },
    Some("help") => {
      usage();
      Ok(0)
    },
    _ => {
      usage();
      Ok(2)
    },
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args: Vec<String> = std::env::args().skip(1).collect();
  let code = match dispatch(&args).await {
    Ok(code) => code,
    Err(error) => {
      eprintln!("error: {}", error);
      1
    },
  };
  std::process::exit(code);
}
