pub mod logging;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::common::HostDialer;
use crate::config::Config;
use crate::netstack::{open_device, DeviceOptions, Stack, StackOptions, TunDevice};
use crate::proxy::LocalForward;
use crate::router::{AddressPolicy, ForwardTable, Router, TcpRouter, UdpRouter};

/// Gateway process: device, stack, routers and local forwards.
pub struct App {
    config: Config,
    policy: Arc<AddressPolicy>,
    forwards: Arc<ForwardTable>,
    notify_parent: bool,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let policy = Arc::new(config.address_policy()?);
        let forwards = Arc::new(config.forward_table()?);
        info!(policy = %policy, forwards = forwards.len(), "policy loaded");
        for spec in forwards.local_specs().iter().chain(forwards.remote_specs()) {
            info!(direction = spec.direction.as_str(), forward = %spec, "forward configured");
        }
        Ok(Self {
            config,
            policy,
            forwards,
            notify_parent: false,
        })
    }

    /// Send SIGWINCH to the parent once the gateway is up.
    pub fn with_notify_parent(mut self, notify: bool) -> Self {
        self.notify_parent = notify;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attach to the configured device and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let options = DeviceOptions {
            name: self.config.stack.interface.clone(),
            netns: self.config.stack.netns.clone(),
            mtu: self.config.stack.mtu,
        };
        let device: Arc<dyn TunDevice> = Arc::from(
            open_device(&options)
                .with_context(|| format!("failed to open tun device '{}'", options.name))?,
        );
        self.run_with_device(device, shutdown_signal()).await
    }

    /// Serve on an already opened device until `shutdown` completes or the
    /// packet loop stops.
    pub async fn run_with_device<F>(self, device: Arc<dyn TunDevice>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mtu = self.config.stack.mtu.unwrap_or_else(|| device.mtu());
        let (stack, outbound) = Stack::new(StackOptions::from_config(&self.config.stack, mtu)?);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut listeners = Vec::new();
        for spec in self.forwards.local_specs() {
            listeners.push(LocalForward::bind(spec.clone()).await?);
        }

        let dialer = Arc::new(HostDialer::new(self.config.dialer.clone())?);
        let router = Arc::new(Router::new(
            self.policy.clone(),
            self.forwards.clone(),
            dialer,
            tracker.clone(),
        ));
        stack.set_tcp_handler(Arc::new(TcpRouter::new(router.clone())));
        stack.set_udp_handler(Arc::new(UdpRouter::new(router)));

        let mut stack_task = tokio::spawn(stack.clone().run(device, outbound, cancel.clone()));
        let listener_tasks: Vec<_> = listeners
            .into_iter()
            .map(|l| tokio::spawn(l.run(stack.clone(), tracker.clone(), cancel.clone())))
            .collect();

        info!(pid = std::process::id(), mtu, "nsgate started");
        if self.notify_parent {
            notify_parent();
        }

        tokio::pin!(shutdown);
        let stack_result = tokio::select! {
            _ = &mut shutdown => None,
            res = &mut stack_task => Some(res),
        };

        // 先复位所有流，packet loop 退出前会把 RST 写到设备
        stack.shutdown();
        cancel.cancel();
        let stack_result = match stack_result {
            Some(res) => res,
            None => stack_task.await,
        };
        for task in listener_tasks {
            let _ = task.await;
        }

        tracker.close();
        let grace = self.config.shutdown_grace();
        let pending = tracker.len();
        if pending > 0 {
            info!(flows = pending, grace_secs = grace.as_secs(), "waiting for flows");
        }
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(flows = tracker.len(), "grace period elapsed, abandoning flows");
        }

        match stack_result {
            Ok(Ok(())) => {
                info!("nsgate stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "packet loop failed");
                Err(e)
            }
            Err(e) => Err(anyhow::anyhow!("packet loop panicked: {}", e)),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = term.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received CTRL+C, shutting down");
    }
}

#[cfg(target_os = "linux")]
fn notify_parent() {
    let ppid = unsafe { libc::getppid() };
    let ret = unsafe { libc::kill(ppid, libc::SIGWINCH) };
    if ret < 0 {
        warn!(ppid, error = %std::io::Error::last_os_error(), "failed to notify parent");
    } else {
        info!(ppid, "parent notified");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_parent() {
    warn!("--notify-parent is only supported on linux");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = Config::default();
        config.forwards.remote.push("not-a-forward".into());
        assert!(App::new(config).is_err());
    }

    #[test]
    fn defaults() {
        let app = App::new(Config::default()).unwrap();
        assert_eq!(app.config().shutdown_grace(), std::time::Duration::from_secs(5));
        assert!(!app.notify_parent);
        assert!(app.with_notify_parent(true).notify_parent);
    }
}
