//! fdmux host proxy — accepts the guest's vsock transport and
//! multiplexes descriptors for local clients. The first handle is
//! seeded by the guest; this side serves the resulting connect request
//! against the host rendezvous path.
#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("fdmux-host only runs on a Linux host");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    host::run()
}

#[cfg(target_os = "linux")]
mod host {
    use std::path::PathBuf;

    use anyhow::{Context, Result};
    use clap::Parser;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    #[derive(Parser)]
    #[command(name = "fdmux-host", version, about = "Host-side descriptor multiplexing proxy")]
    struct Cli {
        /// Vsock port to listen on for the guest transport.
        #[arg(long, default_value_t = fdmux::MUX_PORT)]
        port: u32,

        /// Mount a remote-file bridge at this directory.
        #[arg(long)]
        mount: Option<PathBuf>,
    }

    pub(crate) fn run() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive("fdmux=info".parse()?))
            .init();
        let cli = Cli::parse();

        let listener = fdmux::vsock_listen(cli.port).context("bind vsock transport")?;
        info!(port = cli.port, "waiting for guest transport");
        let transport = fdmux::vsock_accept(&listener).context("accept vsock transport")?;

        let mut proxy = fdmux::Proxy::new(transport, fdmux::Side::Host)?;
        let _bridge = match cli.mount {
            Some(dir) => Some(
                fdmux::Bridge::mount(dir, proxy.handle()).context("mount remote-file bridge")?,
            ),
            None => None,
        };

        proxy.run()?;
        info!("proxy stopped");
        Ok(())
    }
}
