//! The single duplex channel to the broker process.

use std::{path::PathBuf, process::Stdio, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot},
    time::timeout,
};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use crate::{
    error::BridgeError,
    framing::{read_frame, write_frame},
    manifest::ResolvedHost,
    pending::CommandSink,
    protocol::{self, Inbound, OutboundFrame},
};

const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    Clean,
    Error(String),
}

impl Disconnect {
    pub fn describe(&self) -> String {
        match self {
            Disconnect::Clean => "native application connection closed".to_string(),
            Disconnect::Error(reason) => {
                format!("error in native application connection: {reason}")
            }
        }
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    Message(Inbound),
    /// Sent exactly once, always last.
    Closed(Disconnect),
}

/// Fire-and-forget command writer. Cloning shares the channel.
#[derive(Clone)]
pub struct BrokerLink {
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl CommandSink for BrokerLink {
    fn send(&self, frame: OutboundFrame) {
        let kind = frame.command.kind();
        if self.out_tx.send(frame).is_err() {
            tracing::debug!(
                target = "sso_bridge::link",
                command = %kind,
                "broker link closed; command dropped"
            );
        }
    }
}

impl BrokerLink {
    /// Runs the link over an arbitrary byte stream pair.
    pub fn from_io<R, W>(
        reader: R,
        writer: W,
        max_frame_bytes: usize,
    ) -> (Self, mpsc::Receiver<LinkEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (write_failed_tx, write_failed_rx) = oneshot::channel();

        tokio::spawn(run_writer(writer, out_rx, write_failed_tx));
        tokio::spawn(run_reader(
            reader,
            max_frame_bytes,
            events_tx,
            write_failed_rx,
        ));

        (Self { out_tx }, events_rx)
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    write_failed: oneshot::Sender<String>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = out_rx.recv().await {
        let result = match protocol::encode(&frame) {
            Ok(body) => write_frame(&mut writer, &body).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            let _ = write_failed.send(error.to_string());
            return;
        }
    }
}

async fn run_reader<R>(
    mut reader: R,
    max_frame_bytes: usize,
    events_tx: mpsc::Sender<LinkEvent>,
    mut write_failed: oneshot::Receiver<String>,
) where
    R: AsyncRead + Unpin,
{
    let disconnect = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame_bytes) => frame,
            failed = &mut write_failed => match failed {
                Ok(reason) => break Disconnect::Error(reason),
                // Every link handle was dropped locally.
                Err(_) => break Disconnect::Clean,
            },
        };

        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => break Disconnect::Clean,
            Err(error) => break Disconnect::Error(error.to_string()),
        };

        match protocol::decode(&body) {
            Ok(inbound) => {
                if events_tx.send(LinkEvent::Message(inbound)).await.is_err() {
                    return;
                }
            }
            Err(BridgeError::Protocol(reason)) => {
                tracing::warn!(
                    target = "sso_bridge::link",
                    reason = %reason,
                    "ignoring broker frame"
                );
            }
            Err(error) => break Disconnect::Error(error.to_string()),
        }
    };

    let _ = events_tx.send(LinkEvent::Closed(disconnect)).await;
}

/// How to start the broker process.
#[derive(Debug, Clone)]
pub struct BrokerLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl BrokerLaunch {
    /// Mirrors the arguments a browser hands a native host: the manifest
    /// path and the calling extension's id.
    pub fn from_manifest(host: &ResolvedHost, extension_id: &str) -> Self {
        Self {
            program: host.executable.clone(),
            args: vec![
                host.manifest_path.display().to_string(),
                extension_id.to_string(),
            ],
        }
    }
}

/// A running broker child process.
#[derive(Debug)]
pub struct BrokerProcess {
    child: Child,
}

impl BrokerProcess {
    pub fn spawn(
        launch: &BrokerLaunch,
        max_frame_bytes: usize,
    ) -> Result<(Self, BrokerLink, mpsc::Receiver<LinkEvent>)> {
        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start broker {}", launch.program.display()))?;

        let stdin = child.stdin.take().context("broker stdin unavailable")?;
        let stdout = child.stdout.take().context("broker stdout unavailable")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target = "sso_bridge::broker", "{line}");
                }
            });
        }

        tracing::info!(
            target = "sso_bridge::link",
            program = %launch.program.display(),
            pid = child.id(),
            "started broker"
        );
        let (link, events) = BrokerLink::from_io(stdout, stdin, max_frame_bytes);
        Ok((Self { child }, link, events))
    }

    /// SIGTERM, then SIGKILL if the broker is still around after `grace`.
    pub async fn terminate(mut self, grace: Duration) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill().await;
        }

        if timeout(grace, self.child.wait()).await.is_err() {
            let _ = self.child.kill().await;
            let _ = self.child.wait().await;
        }
        Ok(())
    }
}
