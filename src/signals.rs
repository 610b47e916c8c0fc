// src/signals.rs
//! OS signal handling for the entrypoint.
//!
//! SIGINT, SIGTERM and SIGQUIT request shutdown; SIGHUP requests an immediate
//! guide refresh.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Shutdown,
    Refresh,
}

#[cfg(unix)]
pub struct SignalListener {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    pub async fn recv(&mut self) -> ControlSignal {
        tokio::select! {
            _ = self.sigint.recv() => ControlSignal::Shutdown,
            _ = self.sigterm.recv() => ControlSignal::Shutdown,
            _ = self.sigquit.recv() => ControlSignal::Shutdown,
            _ = self.sighup.recv() => ControlSignal::Refresh,
        }
    }
}

#[cfg(not(unix))]
pub struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> ControlSignal {
        let _ = tokio::signal::ctrl_c().await;
        ControlSignal::Shutdown
    }
}
