use anyhow::Context;
use clap::Parser;
use iorap_prefetcherd::server::{run_pipe_transport, run_socket_transport};
use iorap_prefetcherd::SessionManager;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::{Arc, Mutex};

/// Run the readahead daemon, which prefetches files on command from an
/// orchestrator over a pipe or an `AF_UNIX` socket.
#[derive(Parser, Debug)]
#[command(name = "iorap-prefetcherd")]
struct Args {
    /// Input FD (default stdin). Ignored when `--socket-path` is given.
    #[arg(long = "input-fd", visible_alias = "if")]
    input_fd: Option<RawFd>,

    /// Listen on this `AF_UNIX` socket path instead of reading a pipe.
    #[arg(long = "socket-path")]
    socket_path: Option<std::path::PathBuf>,

    /// Set verbosity (default off).
    #[arg(long, short)]
    verbose: bool,

    /// Wait for a keystroke before continuing (default off); useful for
    /// attaching a debugger.
    #[arg(long, short)]
    wait: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if args.wait {
        eprintln!("Self pid: {}", std::process::id());
        eprintln!("Press enter to continue...");
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
    }

    let manager = Arc::new(Mutex::new(SessionManager::new()));

    match args.socket_path {
        Some(path) => {
            let listener = std::os::unix::net::UnixListener::bind(&path)
                .with_context(|| format!("binding socket at {}", path.display()))?;
            log::info!("listening on {}", path.display());
            // A fresh session lives for the lifetime of one connection; the
            // orchestrator reconnects if it needs to talk to a restarted
            // helper.
            let (socket, _addr) = listener.accept().context("accepting connection")?;
            run_socket_transport(socket, manager);
        }
        None => {
            let fd = args.input_fd.unwrap_or(libc::STDIN_FILENO);
            let file = unsafe { std::fs::File::from_raw_fd(fd) };
            run_pipe_transport(file, manager);
        }
    }

    Ok(())
}
