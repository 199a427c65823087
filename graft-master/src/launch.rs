//! Launching a remote process and accepting its connection

use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;

use graft_config::SessionConfig;
use graft_ipc::format_address;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{GraftError, GraftResult};
use crate::peer::{ChildPeer, OutputEcho, PeerProcess};

/// Port used to discover the interface that routes to a remote host
const REMOTE_SHELL_PORT: u16 = 22;

/// Spawn the remote described by `config` and wait for it to connect back
pub async fn launch(config: &SessionConfig, echo: OutputEcho) -> GraftResult<(TcpStream, ChildPeer)> {
    let bind_ip = match config.host.as_deref() {
        Some(host) => local_address_towards(host).await?,
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    let listener = TcpListener::bind((bind_ip, 0))
        .await
        .map_err(|e| GraftError::Launch(format!("failed to bind listener on {}: {}", bind_ip, e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| GraftError::Launch(e.to_string()))?;
    let address = format_address(local);

    let mut command = build_command(config, &address);
    command
        .stdin(Stdio::null())
        .stdout(match echo {
            OutputEcho::Discard => Stdio::null(),
            _ => Stdio::piped(),
        })
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    info!(executable = %config.executable, %address, "Launching remote");
    let child = command
        .spawn()
        .map_err(|e| GraftError::Launch(format!("failed to start '{}': {}", config.executable, e)))?;
    let mut peer = ChildPeer::new(child, echo);
    debug!(pid = ?peer.id(), "Remote started");

    let stream = accept(&listener, &mut peer, config).await?;
    Ok((stream, peer))
}

/// The command line that starts the remote, wrapped in the remote shell
/// when a host is configured
pub fn build_command(config: &SessionConfig, address: &str) -> Command {
    let arguments = config.expand_arguments(address);
    match config.remote_target() {
        Some(target) => {
            let mut command = Command::new(&config.remote_shell);
            command.arg(target).arg(&config.executable).args(arguments);
            command
        }
        None => {
            let mut command = Command::new(&config.executable);
            command.args(arguments);
            command
        }
    }
}

/// Accept the remote's connection, giving up if it dies or takes too long
async fn accept(
    listener: &TcpListener,
    peer: &mut ChildPeer,
    config: &SessionConfig,
) -> GraftResult<TcpStream> {
    let deadline = Instant::now() + config.connect_timeout;
    loop {
        match tokio::time::timeout(config.poll_interval, listener.accept()).await {
            Ok(Ok((stream, from))) => {
                debug!(%from, "Remote connected");
                stream
                    .set_nodelay(true)
                    .map_err(|e| GraftError::Launch(e.to_string()))?;
                return Ok(stream);
            }
            Ok(Err(e)) => return Err(GraftError::Launch(format!("accept failed: {}", e))),
            Err(_) => {
                if let Some(status) = peer.try_exit_status() {
                    return Err(GraftError::RemoteDied { status });
                }
                if Instant::now() >= deadline {
                    peer.kill().await;
                    return Err(GraftError::Launch(format!(
                        "remote did not connect within {:?}",
                        config.connect_timeout
                    )));
                }
            }
        }
    }
}

/// Local interface address used to reach `host`
async fn local_address_towards(host: &str) -> GraftResult<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| GraftError::Launch(e.to_string()))?;
    socket
        .connect((host, REMOTE_SHELL_PORT))
        .await
        .map_err(|e| GraftError::Launch(format!("cannot route to {}: {}", host, e)))?;
    socket
        .local_addr()
        .map(|addr| addr.ip())
        .map_err(|e| GraftError::Launch(e.to_string()))
}
