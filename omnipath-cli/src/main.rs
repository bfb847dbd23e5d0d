//! Command line surface over the omnipath library.
use clap::{Parser, Subcommand};
use omnipath::{AnyPath, CopyOptions, OpenOptions, SyncOptions};
use std::io::Write;

#[derive(Parser)]
#[command(name = "omnipath", version, about = "work with fs/s3/http/stdio paths")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory or glob pattern
    Ls {
        path: String,
        /// Recurse into directories
        #[arg(short, long)]
        recursive: bool,
        /// Print size and mtime alongside names
        #[arg(short, long)]
        long: bool,
    },
    /// Copy a file or directory
    Cp {
        src: String,
        dst: String,
        /// Copy directories recursively
        #[arg(short, long)]
        recursive: bool,
    },
    /// Move a file or directory
    Mv { src: String, dst: String },
    /// Remove a file or directory
    Rm {
        path: String,
        /// Required to remove directories
        #[arg(short, long)]
        recursive: bool,
        /// Ignore missing paths
        #[arg(long)]
        missing_ok: bool,
    },
    /// Mirror a directory onto a destination, skipping unchanged files
    Sync {
        src: String,
        dst: String,
        /// Copy even when the destination looks identical
        #[arg(short, long)]
        force: bool,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Create an empty file or update its timestamps
    Touch { path: String },
    /// Write file contents to stdout
    Cat { path: String },
    /// Print the md5 checksum
    Md5sum { path: String },
    /// Print the size in bytes
    Size { path: String },
    /// Print the modification time in unix seconds
    Mtime { path: String },
    /// Print the full stat result
    Stat { path: String },
    /// Print the version
    Version,
}

fn is_pattern(path: &str) -> bool {
    path.chars().any(|c| matches!(c, '*' | '?' | '[' | '{'))
}

fn run(command: Command) -> omnipath::Result<()> {
    match command {
        Command::Ls {
            path,
            recursive,
            long,
        } => {
            let print = |name: &str, stat: &omnipath::StatResult| {
                if long {
                    println!("{:>12}  {:>12.0}  {}", stat.size, stat.mtime, name);
                } else {
                    println!("{name}");
                }
            };
            if is_pattern(&path) {
                for entry in omnipath::glob(&path, recursive, false)? {
                    let entry = entry?;
                    print(&entry.path, &entry.stat);
                }
                return Ok(());
            }
            let target = AnyPath::new(&path)?;
            if recursive && target.is_dir()? {
                for entry in target.scan(false, false)? {
                    let entry = entry?;
                    print(&entry.path, &entry.stat);
                }
            } else if target.is_dir()? {
                for entry in target.scandir()? {
                    let entry = entry?;
                    print(&entry.name, &entry.stat);
                }
            } else {
                print(target.as_str(), &target.stat(true)?);
            }
            Ok(())
        }
        Command::Cp {
            src,
            dst,
            recursive,
        } => {
            let src = AnyPath::new(&src)?;
            let dst = AnyPath::new(&dst)?;
            if src.is_dir()? {
                if !recursive {
                    return Err(omnipath::Error::IsADirectory {
                        path: src.as_str().to_string(),
                    });
                }
                omnipath::sync(&src, &dst, &SyncOptions::default().force(true))?;
            } else {
                omnipath::copy(&src, &dst, &CopyOptions::default())?;
            }
            Ok(())
        }
        Command::Mv { src, dst } => {
            omnipath::move_path(&AnyPath::new(&src)?, &AnyPath::new(&dst)?, true)
        }
        Command::Rm {
            path,
            recursive,
            missing_ok,
        } => {
            let target = AnyPath::new(&path)?;
            if target.is_dir()? && !recursive {
                return Err(omnipath::Error::IsADirectory {
                    path: target.as_str().to_string(),
                });
            }
            target.remove(missing_ok)
        }
        Command::Sync { src, dst, force } => {
            let copied = omnipath::sync(
                &AnyPath::new(&src)?,
                &AnyPath::new(&dst)?,
                &SyncOptions::default().force(force),
            )?;
            eprintln!("{copied} file(s) copied");
            Ok(())
        }
        Command::Mkdir { path } => AnyPath::new(&path)?.mkdir(false),
        Command::Touch { path } => AnyPath::new(&path)?.touch(),
        Command::Cat { path } => {
            let mut handle = AnyPath::new(&path)?.open("rb", &OpenOptions::default())?;
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            let mut buffer = vec![0u8; 256 * 1024];
            loop {
                let count = handle.readinto(&mut buffer)?;
                if count == 0 {
                    break;
                }
                lock.write_all(&buffer[..count]).map_err(|err| {
                    omnipath::error::translate_fs_error(err, "stdout")
                })?;
            }
            handle.close()
        }
        Command::Md5sum { path } => {
            println!("{}", AnyPath::new(&path)?.md5()?);
            Ok(())
        }
        Command::Size { path } => {
            println!("{}", AnyPath::new(&path)?.stat(true)?.size);
            Ok(())
        }
        Command::Mtime { path } => {
            println!("{}", AnyPath::new(&path)?.stat(true)?.mtime);
            Ok(())
        }
        Command::Stat { path } => {
            let target = AnyPath::new(&path)?;
            let stat = target.stat(true)?;
            println!("path: {}", target.as_str());
            println!("size: {}", stat.size);
            println!("mtime: {}", stat.mtime);
            println!("ctime: {}", stat.ctime);
            println!("type: {}", if stat.is_dir { "directory" } else { "file" });
            for (key, value) in &stat.extra {
                println!("{key}: {value}");
            }
            Ok(())
        }
        Command::Version => {
            println!("omnipath {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli.command) {
        tracing::error!("{err}");
        eprintln!("omnipath: {err}");
        std::process::exit(1);
    }
}
