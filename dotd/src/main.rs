mod cli;
mod daemon;
mod pidfile;

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{Context, Result};
use dotd_core::dispatch::Dispatcher;
use dotd_core::lookup::lookup_pin;
use dotd_core::reactor::{Reactor, Registration};
use dotd_core::server::Server;
use dotd_core::tls::TlsContext;
use dotd_core::upstream::UpstreamSet;
use nix::sys::signal::{SigHandler, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::Config;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = match Config::parse(std::env::args()) {
        Ok(config) => config,
        Err(err) => {
            // --help and --version come through here as clap "errors".
            if let Some(clap_err) = err.downcast_ref::<clap::Error>() {
                if matches!(
                    clap_err.kind(),
                    clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
                ) {
                    let _ = clap_err.print();
                    return ExitCode::SUCCESS;
                }
            }
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<()> {
    if let Some(addr) = config.lookup {
        let result = lookup_pin(&addr, &config.ciphers, config.timeout)
            .with_context(|| format!("pin lookup against {addr} failed"))?;
        println!("hostname: {}", result.common_name);
        println!("pin: {}", result.pin);
        return Ok(());
    }

    if config.daemonise {
        daemon::daemonise().context("unable to daemonise")?;
    }
    let _pid_file = config
        .pid_file
        .as_deref()
        .map(pidfile::PidFile::create)
        .transpose()?;

    // Writes to an upstream that reset the connection must surface as
    // errors, not kill the process.
    #[allow(unsafe_code)]
    unsafe {
        nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .context("cannot ignore SIGPIPE")?;
    }

    let reactor = Reactor::new();
    let context = Rc::new(TlsContext::new(&config.ciphers).context("cannot build TLS context")?);
    let upstreams = Rc::new(UpstreamSet::new(config.upstreams, config.timeout));
    let dispatcher = Dispatcher::new(
        reactor.clone(),
        upstreams,
        context,
        config.max_connections,
    );

    let mut server = Server::new(reactor.clone(), dispatcher);
    for addr in &config.servers {
        server
            .add_listener(addr)
            .with_context(|| format!("cannot listen on {addr}"))?;
    }

    install_shutdown_handler(&reactor, server)?;

    info!("forwarding DNS over TLS");
    reactor.run();
    info!("all queries drained, exiting");
    Ok(())
}

/// Route SIGINT/SIGTERM through a signalfd on the reactor. The handler
/// drops the server, which unregisters the ingress sockets; the loop then
/// drains whatever queries are still in flight and run() returns.
fn install_shutdown_handler(reactor: &Reactor, server: Server) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("cannot block signals")?;

    let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("cannot create signalfd")?;
    let raw_fd = signal_fd.as_raw_fd();

    let server_slot = Rc::new(RefCell::new(Some(server)));
    let signal_fd = Rc::new(RefCell::new(signal_fd));
    let registration: Rc<RefCell<Option<Registration>>> = Rc::new(RefCell::new(None));

    let registration_in = registration.clone();
    let token = reactor.register_read(
        raw_fd,
        Rc::new(move |_fd| {
            let _ = signal_fd.borrow_mut().read_signal();
            info!("shutdown requested, draining in-flight queries");
            server_slot.borrow_mut().take();
            registration_in.borrow_mut().take();
        }),
        None,
    );
    *registration.borrow_mut() = Some(token);
    Ok(())
}
