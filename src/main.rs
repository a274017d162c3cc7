//! `metabench` — metadata benchmark driver.
//!
//! Formats (optionally) and mounts an image standalone, then measures one
//! metadata workload:
//!
//! ```text
//! metabench -M create -C 1000 disk.img
//! metabench --format -M mkdir -C 500 -S 64 -B 4096 -E sync disk.img
//! ```
//!
//! Recognised options: `-M {open_close|readdir|unlink|create|rename|
//! mkdir|rmdir}`, `-C count`, `-S size_MB`, `-B block_bytes` (multiple of
//! 4096), `-E {libaio|sync}`, `-Q qdepth` (non-zero), `-R` (random), `-D`
//! (direct), `-W` (write), `--format`.

use std::process::exit;
use std::time::Instant;

use nvfs::drivers::file::FileDisk;
use nvfs::drivers::ClusterDevice;
use nvfs::fs::layout::{FormatParams, CLUSTER_SIZE};
use nvfs::fs::mount::format;
use nvfs::{FileSystem, IoResult, MountParams};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MetaMode {
    Nothing,
    OpenClose,
    Readdir,
    Unlink,
    Create,
    Rename,
    Mkdir,
    Rmdir,
}

struct Args {
    prog: String,
    mode: MetaMode,
    count: u32,
    file_size_mb: u64,
    block_size: usize,
    qdepth: u32,
    random: bool,
    direct: bool,
    write: bool,
    do_format: bool,
    image: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            prog: String::from("metabench"),
            mode: MetaMode::Nothing,
            count: 1000,
            file_size_mb: 64,
            block_size: CLUSTER_SIZE,
            qdepth: 64,
            random: false,
            direct: false,
            write: false,
            do_format: false,
            image: None,
        }
    }
}

fn usage(prog: &str) {
    eprintln!("usage: {prog} [options] <image>");
    eprintln!("  -M <mode>   open_close | readdir | unlink | create | rename | mkdir | rmdir");
    eprintln!("  -C <count>  repetitions of the metadata operation");
    eprintln!("  -S <MB>     file size in MB");
    eprintln!("  -B <bytes>  block size, multiple of 4096");
    eprintln!("  -E <engine> libaio | sync");
    eprintln!("  -Q <depth>  queue depth, non-zero");
    eprintln!("  -R          random access");
    eprintln!("  -D          direct I/O");
    eprintln!("  -W          write workload");
    eprintln!("  --format    format the image before mounting");
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args();
    args.prog = iter.next().unwrap_or_else(|| String::from("metabench"));

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-M" => {
                let mode = iter.next().ok_or("-M needs an argument")?;
                args.mode = match mode.as_str() {
                    "open_close" => MetaMode::OpenClose,
                    "readdir" => MetaMode::Readdir,
                    "unlink" => MetaMode::Unlink,
                    "create" => MetaMode::Create,
                    "rename" => MetaMode::Rename,
                    "mkdir" => MetaMode::Mkdir,
                    "rmdir" => MetaMode::Rmdir,
                    other => return Err(format!("invalid metadata mode `{other}`")),
                };
            }
            "-C" => {
                args.count = iter
                    .next()
                    .ok_or("-C needs an argument")?
                    .parse()
                    .map_err(|_| "invalid count")?;
            }
            "-S" => {
                args.file_size_mb = iter
                    .next()
                    .ok_or("-S needs an argument")?
                    .parse()
                    .map_err(|_| "invalid file size")?;
            }
            "-B" => {
                args.block_size = iter
                    .next()
                    .ok_or("-B needs an argument")?
                    .parse()
                    .map_err(|_| "invalid block size")?;
                if args.block_size % CLUSTER_SIZE != 0 {
                    return Err(format!(
                        "block size ({}) is not aligned with 4KB",
                        args.block_size
                    ));
                }
            }
            "-E" => {
                let engine = iter.next().ok_or("-E needs an argument")?;
                if engine != "libaio" && engine != "sync" {
                    return Err(format!("invalid ioengine type `{engine}`"));
                }
            }
            "-Q" => {
                args.qdepth = iter
                    .next()
                    .ok_or("-Q needs an argument")?
                    .parse()
                    .map_err(|_| "invalid queue depth")?;
                if args.qdepth == 0 {
                    return Err(String::from("queue depth must be non-zero"));
                }
            }
            "-R" => args.random = true,
            "-D" => args.direct = true,
            "-W" => args.write = true,
            "--format" => args.do_format = true,
            "-h" | "--help" => {
                usage(&args.prog);
                exit(0);
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option `{other}`"));
            }
            other => args.image = Some(String::from(other)),
        }
    }
    Ok(args)
}

fn run_meta_workload(fs: &mut FileSystem, mode: MetaMode, count: u32) -> IoResult<()> {
    fs.mkdir("/bench", 0o755)?;

    let started = Instant::now();
    match mode {
        MetaMode::Create => {
            for i in 0..count {
                fs.create_file(&format!("/bench/f{i}"), 0o644)?;
            }
        }
        MetaMode::OpenClose => {
            fs.create_file("/bench/target", 0o644)?;
            for _ in 0..count {
                let fd = fs.open_file("/bench/target", 0)?;
                fs.close_file(fd)?;
            }
        }
        MetaMode::Readdir => {
            for i in 0..64.min(count) {
                fs.create_file(&format!("/bench/f{i}"), 0o644)?;
            }
            for _ in 0..count {
                fs.readdir_path("/bench")?;
            }
        }
        MetaMode::Unlink => {
            for i in 0..count {
                fs.create_file(&format!("/bench/f{i}"), 0o644)?;
            }
            for i in 0..count {
                fs.unlink(&format!("/bench/f{i}"))?;
            }
        }
        MetaMode::Rename => {
            for i in 0..count {
                fs.create_file(&format!("/bench/f{i}"), 0o644)?;
            }
            for i in 0..count {
                fs.rename(&format!("/bench/f{i}"), &format!("/bench/g{i}"))?;
            }
        }
        MetaMode::Mkdir => {
            for i in 0..count {
                fs.mkdir(&format!("/bench/d{i}"), 0o755)?;
            }
        }
        MetaMode::Rmdir => {
            for i in 0..count {
                fs.mkdir(&format!("/bench/d{i}"), 0o755)?;
            }
            for i in 0..count {
                fs.rmdir(&format!("/bench/d{i}"))?;
            }
        }
        MetaMode::Nothing => {}
    }
    let elapsed = started.elapsed();
    fs.sync()?;

    let ops = count.max(1) as f64;
    println!(
        "{mode:?}: {count} ops in {:.3}s, {:.0} ops/s",
        elapsed.as_secs_f64(),
        ops / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

fn run(args: &Args) -> IoResult<()> {
    let image = args.image.as_deref().expect("image checked in main");

    let dev = if args.do_format {
        let clusters = (args.file_size_mb.max(16) * 1024 * 1024 / CLUSTER_SIZE as u64).max(4096);
        let mut dev = FileDisk::create(image, clusters)?;
        let params = FormatParams {
            clusters_per_bg: 1024,
            inodes_per_bg: 256,
        };
        format(&mut dev, &params)?;
        dev
    } else {
        FileDisk::open(image)?
    };
    println!(
        "image: {} clusters; io: block={}B qdepth={} random={} direct={} write={}",
        dev.total_clusters(),
        args.block_size,
        args.qdepth,
        args.random,
        args.direct,
        args.write
    );

    let mut fs = FileSystem::mount(Box::new(dev), MountParams::standalone(), None)?;
    let result = run_meta_workload(&mut fs, args.mode, args.count);
    fs.umount()?;
    result
}

fn main() {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            usage("metabench");
            exit(2);
        }
    };

    if args.image.is_none() {
        usage(&args.prog);
        exit(2);
    }

    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        exit(1);
    }
}
