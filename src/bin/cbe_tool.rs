//! Host-facing command line front end for the engine: format a fresh image,
//! then read, write and sync against it. Not part of the request engine
//! core; a thin adapter kept behind the `cli` feature so embedders linking
//! the library directly never pull in clap.

use std::io::{Read, Write};
use std::path::PathBuf;

use cbe::collab::ref_impls::{AesGcmSivCipher, FileBackend, Sha256Hasher};
use cbe::{Block, Config, Library, Request};
use clap::{Parser, Subcommand};

/// A fixed demo key; the engine never manages key material itself (key
/// rotation and hierarchy are explicitly out of scope), so `cbe-tool` just
/// picks one constant key for every image it opens.
const DEMO_KEY: [u8; 32] = [0x5a; 32];

type Engine = Library<FileBackend, AesGcmSivCipher, Sha256Hasher>;

#[derive(Debug, Parser)]
#[clap(name = "cbe-tool")]
#[clap(about = "Format, read, write and sync a Consistent Block Encrypter image.", long_about = None)]
struct Cli {
    /// Path to the backing block image.
    #[clap(long, global = true, value_parser)]
    image: Option<PathBuf>,

    /// Optional TOML config file overriding sync/secure intervals.
    #[clap(long, value_parser)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a fresh image and write its initial superblock.
    Format {
        /// Branching factor of the virtual block device tree.
        #[clap(long, default_value_t = 64)]
        vbd_degree: usize,
        /// Number of internal levels above the leaf layer.
        #[clap(long, default_value_t = 2)]
        vbd_height: usize,
        /// Addressable virtual leaf count.
        #[clap(long, default_value_t = 1 << 20)]
        vbd_leaves: u64,
        /// Physical PBAs held in the free pool.
        #[clap(long, default_value_t = 4096)]
        free_pool_size: u64,
    },
    /// Print the open image's addressable size and dirty/sealing state.
    Stat,
    /// Read one or more virtual blocks and print them to stdout.
    Read {
        vba: u64,
        #[clap(default_value_t = 1)]
        count: u32,
    },
    /// Write virtual blocks from stdin (or a file with `--from`).
    Write {
        vba: u64,
        #[clap(default_value_t = 1)]
        count: u32,
        #[clap(long, value_parser)]
        from: Option<PathBuf>,
    },
    /// Force a generation seal and wait for it to finish.
    Sync,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)?;
            Ok(Config::from_toml_str(&text)?)
        }
        None => Ok(Config::default()),
    }
}

fn open_engine(image: &PathBuf, config: Config, block_count: u64) -> anyhow::Result<Engine> {
    let backend = FileBackend::open(image, block_count)?;
    let cipher = AesGcmSivCipher::new(DEMO_KEY);
    let hasher = Sha256Hasher;
    Ok(Library::open(backend, cipher, hasher, config, 0)?)
}

/// Drive `engine` to quiescence: keep calling `execute` until it stops
/// reporting progress, the way every module's own step-driven protocol
/// expects its caller to pump it.
fn run_to_quiescence(engine: &mut Engine) -> anyhow::Result<()> {
    let mut now = 0u64;
    loop {
        let progressed = engine.execute(now)?;
        now += 1;
        if !progressed {
            break;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let image = cli.image.clone().unwrap_or_else(|| PathBuf::from("cbe.img"));
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Format { vbd_degree, vbd_height, vbd_leaves, free_pool_size } => {
            // SB_SLOTS + zero leaf + vbd_height shared nodes + free tree
            // infrastructure + the pool itself, rounded up generously.
            let block_count = 8 + vbd_height as u64 + free_pool_size + 256;
            let backend = FileBackend::open(&image, block_count)?;
            let cipher = AesGcmSivCipher::new(DEMO_KEY);
            let hasher = Sha256Hasher;
            Library::format(backend, cipher, hasher, config, vbd_degree, vbd_height, vbd_leaves, free_pool_size, 0)?;
            log::info!("formatted {} ({} blocks)", image.display(), block_count);
            Ok(())
        }
        Commands::Stat => {
            // block_count is only used by format(); re-derive it from the
            // file the image already is.
            let block_count = std::fs::metadata(&image)?.len() / cbe::types::BLOCK_SIZE as u64;
            let engine = open_engine(&image, config, block_count)?;
            println!("max_vba: {}", engine.max_vba().0);
            println!("cache_dirty: {}", engine.cache_dirty());
            println!("sealing_generation: {}", engine.is_sealing_generation());
            Ok(())
        }
        Commands::Read { vba, count } => {
            let block_count = std::fs::metadata(&image)?.len() / cbe::types::BLOCK_SIZE as u64;
            let mut engine = open_engine(&image, config, block_count)?;
            let tag = 1;
            engine.submit_client_request(Request::read(cbe::types::Vba(vba), count, tag), None)?;
            run_to_quiescence(&mut engine)?;
            let (success, data) = engine.drop_completed_client_request(tag)?;
            if !success {
                anyhow::bail!("read failed");
            }
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for block in data.into_iter().flatten() {
                out.write_all(block.as_slice())?;
            }
            Ok(())
        }
        Commands::Write { vba, count, from } => {
            let block_count = std::fs::metadata(&image)?.len() / cbe::types::BLOCK_SIZE as u64;
            let mut engine = open_engine(&image, config, block_count)?;

            let mut bytes = Vec::new();
            match from {
                Some(path) => {
                    std::fs::File::open(path)?.read_to_end(&mut bytes)?;
                }
                None => {
                    std::io::stdin().read_to_end(&mut bytes)?;
                }
            }
            let needed = count as usize * cbe::types::BLOCK_SIZE;
            bytes.resize(needed, 0);
            let blocks: Vec<Block> = bytes
                .chunks_exact(cbe::types::BLOCK_SIZE)
                .map(|chunk| {
                    let mut b = Block::zeroed();
                    b.as_mut_slice().copy_from_slice(chunk);
                    b
                })
                .collect();

            let tag = 1;
            engine.submit_client_request(Request::write(cbe::types::Vba(vba), count, tag), Some(blocks))?;
            run_to_quiescence(&mut engine)?;
            let (success, _) = engine.drop_completed_client_request(tag)?;
            if !success {
                anyhow::bail!("write failed");
            }
            Ok(())
        }
        Commands::Sync => {
            let block_count = std::fs::metadata(&image)?.len() / cbe::types::BLOCK_SIZE as u64;
            let mut engine = open_engine(&image, config, block_count)?;
            let tag = 1;
            engine.submit_client_request(Request::sync(tag), None)?;
            run_to_quiescence(&mut engine)?;
            engine.drop_completed_client_request(tag)?;
            log::info!("synced");
            Ok(())
        }
    }
}
