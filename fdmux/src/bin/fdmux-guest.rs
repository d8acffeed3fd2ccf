//! fdmux guest proxy — dials the host's vsock listener with bounded
//! backoff, seeds the first handle over the guest rendezvous socket,
//! and multiplexes descriptors for in-guest clients.
#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("fdmux-guest only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    guest::run()
}

#[cfg(target_os = "linux")]
mod guest {
    use std::path::PathBuf;

    use anyhow::{Context, Result};
    use clap::Parser;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    #[derive(Parser)]
    #[command(name = "fdmux-guest", version, about = "Guest-side descriptor multiplexing proxy")]
    struct Cli {
        /// Vsock CID of the host.
        #[arg(long, default_value_t = libc::VMADDR_CID_HOST)]
        cid: u32,

        /// Vsock port the host proxy listens on.
        #[arg(long, default_value_t = fdmux::MUX_PORT)]
        port: u32,

        /// Rendezvous socket served for the first local client.
        #[arg(long, default_value = fdmux::GUEST_RENDEZVOUS_PATH)]
        rendezvous: PathBuf,

        /// Host-side rendezvous path named in the seeding request.
        #[arg(long, default_value = fdmux::HOST_RENDEZVOUS_PATH)]
        peer_rendezvous: String,

        /// Mount a remote-file bridge at this directory.
        #[arg(long)]
        mount: Option<PathBuf>,
    }

    pub(crate) fn run() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive("fdmux=info".parse()?))
            .init();
        let cli = Cli::parse();

        let transport =
            fdmux::vsock_connect(cli.cid, cli.port).context("connect vsock transport")?;

        let mut proxy = fdmux::Proxy::new(transport, fdmux::Side::Guest)?;
        let _bridge = match cli.mount {
            Some(dir) => Some(
                fdmux::Bridge::mount(dir, proxy.handle()).context("mount remote-file bridge")?,
            ),
            None => None,
        };

        let seeded = fdmux::seed_initial_handle(&mut proxy, &cli.rendezvous, &cli.peer_rendezvous)?;
        let control = proxy.handle();
        let worker = std::thread::spawn(move || proxy.run());

        // A rejected seed is a startup failure, not something to run past.
        if let Ok(Err(errno)) = seeded.recv() {
            control.shutdown();
            let _ = worker.join();
            anyhow::bail!("rendezvous seeding failed (errno {errno})");
        }

        match worker.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("proxy thread panicked"),
        }
        info!("proxy stopped");
        Ok(())
    }
}
