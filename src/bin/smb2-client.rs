//! Command line client over the blocking facade

use clap::{Parser, Subcommand};
use smb2_engine::client::{FileType, OpenFlags, SmbUrl};
use smb2_engine::connection::{Context, ContextConfig};
use std::io::{self, Read, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "smb2-client")]
#[command(about = "SMB2/3 client", long_about = None)]
struct Args {
    /// Password, when the URL does not carry one
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a directory: smb://[user@]host/share/dir
    Ls { url: String },

    /// Write a file to stdout
    Cat { url: String },

    /// Show size, type and times of a file or directory
    Stat { url: String },

    /// Upload a local file (stdin when omitted)
    Put {
        url: String,
        local: Option<PathBuf>,
    },

    /// Delete a file
    Rm { url: String },

    /// Create a directory
    Mkdir { url: String },

    /// List the shares of a server: smb://[user@]host
    Shares { url: String },
}

impl Commands {
    fn url(&self) -> &str {
        match self {
            Commands::Ls { url }
            | Commands::Cat { url }
            | Commands::Stat { url }
            | Commands::Put { url, .. }
            | Commands::Rm { url }
            | Commands::Mkdir { url }
            | Commands::Shares { url } => url,
        }
    }
}

fn connect(url: &SmbUrl, share: &str, password: Option<&str>) -> smb2_engine::Result<Context> {
    let mut config = url.apply(ContextConfig::new());
    if let (None, Some(password)) = (&url.password, password) {
        config.password = password.to_string();
    }
    let mut ctx = Context::new(config);
    ctx.connect_share(&url.server, share, None)?;
    tracing::info!(server = %url.server, share, dialect = format_args!("0x{:04x}", ctx.dialect()), "connected");
    Ok(ctx)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let url = SmbUrl::parse(args.command.url())?;
    let password = args.password.as_deref();

    if let Commands::Shares { .. } = args.command {
        let mut ctx = connect(&url, "IPC$", password)?;
        for share in ctx.share_enum()? {
            println!("{:<20} {:#010x}  {}", share.name, share.share_type, share.remark);
        }
        ctx.disconnect_share()?;
        return Ok(());
    }

    if url.share.is_empty() {
        return Err(format!("{}: no share in URL", args.command.url()).into());
    }
    let mut ctx = connect(&url, &url.share, password)?;
    let path = url.path.as_str();

    match &args.command {
        Commands::Ls { .. } => {
            let dir = ctx.opendir(path)?;
            for entry in dir.entries() {
                let kind = match entry.stat.file_type {
                    FileType::Directory => 'd',
                    FileType::Link => 'l',
                    FileType::File => '-',
                };
                println!("{} {:>12}  {}", kind, entry.stat.size, entry.name);
            }
        }
        Commands::Cat { .. } => {
            let fh = ctx.open(path, OpenFlags::READ)?;
            let mut buf = vec![0u8; 64 * 1024];
            let mut out = io::stdout().lock();
            loop {
                let n = ctx.read(&fh, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            ctx.close(&fh)?;
        }
        Commands::Stat { .. } => {
            let st = ctx.stat(path)?;
            println!("type:  {:?}", st.file_type);
            println!("size:  {}", st.size);
            println!("links: {}", st.nlink);
            println!("inode: {}", st.ino);
            if let Some(mtime) = st.modified() {
                println!("mtime: {}", mtime.to_rfc3339());
            }
        }
        Commands::Put { local, .. } => {
            let mut data = Vec::new();
            match local {
                Some(local) => data = std::fs::read(local)?,
                None => {
                    io::stdin().read_to_end(&mut data)?;
                }
            }
            let fh = ctx.open(
                path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            )?;
            let mut written = 0;
            while written < data.len() {
                written += ctx.write(&fh, &data[written..])?;
            }
            ctx.close(&fh)?;
            tracing::info!(bytes = written, "uploaded");
        }
        Commands::Rm { .. } => ctx.unlink(path)?,
        Commands::Mkdir { .. } => ctx.mkdir(path)?,
        Commands::Shares { .. } => {}
    }

    ctx.disconnect_share()?;
    Ok(())
}
