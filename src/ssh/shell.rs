//! Shell channel
//!
//! A PTY session channel running a login shell or a single command. Output
//! (stdout and stderr) is forwarded to the consumer as it arrives; input and
//! resizes go through a command queue to the task owning the channel.

use std::sync::Arc;

use bytes::Bytes;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::SshError;
use super::session::Session;

/// Called once when the remote side ends the shell
pub type ExitCallback = Box<dyn FnOnce(Option<u32>) + Send>;

/// Commands for the channel owner task
#[derive(Debug)]
pub enum ShellCommand {
    Data(Vec<u8>),
    Resize(u32, u32),
    Close,
}

/// What to run and how
#[derive(Debug, Clone)]
pub struct ShellOptions {
    /// Command to `exec` instead of a login shell
    pub exec: Option<String>,
    /// Line typed into the shell right after it starts
    pub run_line: Option<String>,
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            exec: None,
            run_line: None,
            term: "xterm-256color".into(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Hand output to the consumer; `false` once it is gone or `stop` fires.
async fn deliver(output: &mpsc::Sender<Bytes>, data: &[u8], stop: &CancellationToken) -> bool {
    tokio::select! {
        sent = output.send(Bytes::copy_from_slice(data)) => sent.is_ok(),
        _ = stop.cancelled() => false,
    }
}

/// A running shell on an authenticated session
pub struct Shell {
    session: Arc<Session>,
    cmd_tx: mpsc::Sender<ShellCommand>,
    stop: CancellationToken,
    worker: Option<JoinHandle<()>>,
    exit_callback: Arc<parking_lot::Mutex<Option<ExitCallback>>>,
}

impl Shell {
    /// Open the channel, request a PTY and start the shell (or `exec`).
    pub async fn open(
        session: Session,
        options: ShellOptions,
        output: mpsc::Sender<Bytes>,
        exit_callback: Option<ExitCallback>,
    ) -> Result<Self, SshError> {
        let channel = {
            let opened = match session.transport().await {
                Ok(mut t) => t.open_session_channel().await,
                Err(e) => Err(e),
            };
            match opened {
                Ok(channel) => channel,
                Err(e) => {
                    session.set_error(format!("Could not open channel. {}", e));
                    return Err(e);
                }
            }
        };

        let started = async {
            channel
                .request_pty(false, &options.term, options.cols, options.rows, 0, 0, &[])
                .await?;
            match options.exec.as_deref().filter(|c| !c.is_empty()) {
                Some(command) => channel.exec(false, command).await?,
                None => channel.request_shell(false).await?,
            }
            if let Some(line) = options.run_line.as_deref().filter(|l| !l.is_empty()) {
                debug!("Writing run line to shell");
                channel.data(format!("{}\n", line).as_bytes()).await?;
            }
            Ok::<(), russh::Error>(())
        }
        .await;

        if let Err(e) = started {
            session.set_error(format!("Could not request shell. {}", e));
            let _ = channel.close().await;
            return Err(SshError::ChannelError(e.to_string()));
        }

        info!(
            "Shell started for session {} ({})",
            session.id(),
            options.exec.as_deref().unwrap_or("login shell")
        );

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(1024);
        let exit_callback = Arc::new(parking_lot::Mutex::new(exit_callback));
        let callback = exit_callback.clone();
        let sid = session.id().to_string();
        let mut channel = channel;
        let stop = CancellationToken::new();
        let worker_stop = stop.clone();

        let worker = tokio::spawn(async move {
            let mut exit_status = None;

            loop {
                tokio::select! {
                    _ = worker_stop.cancelled() => {
                        let _ = channel.eof().await;
                        break;
                    }

                    Some(cmd) = cmd_rx.recv() => {
                        match cmd {
                            ShellCommand::Data(data) => {
                                if let Err(e) = channel.data(&data[..]).await {
                                    error!("Failed to write to shell of session {}: {}", sid, e);
                                    break;
                                }
                            }
                            ShellCommand::Resize(cols, rows) => {
                                if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                    error!("Failed to resize PTY: {}", e);
                                } else {
                                    debug!("PTY resized to {}x{} for session {}", cols, rows, sid);
                                }
                            }
                            ShellCommand::Close => {
                                let _ = channel.eof().await;
                                break;
                            }
                        }
                    }

                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data })
                            | Some(ChannelMsg::ExtendedData { data, .. }) => {
                                if !deliver(&output, &data, &worker_stop).await {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                                exit_status = Some(status);
                            }
                            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                            Some(_) => {}
                        }
                    }
                }
            }

            let _ = channel.close().await;
            info!("Shell of session {} ended (exit status {:?})", sid, exit_status);

            if let Some(cb) = callback.lock().take() {
                cb(exit_status);
            }
        });

        Ok(Self {
            session: Arc::new(session),
            cmd_tx,
            stop,
            worker: Some(worker),
            exit_callback,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.cmd_tx
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::ChannelError("Shell is closed".into()))
    }

    /// Resize the remote PTY; ignored once the shell has ended.
    pub async fn set_size(&self, cols: u32, rows: u32) {
        let _ = self.cmd_tx.send(ShellCommand::Resize(cols, rows)).await;
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop the shell without running the exit callback, wait for the
    /// worker, then close the session.
    pub async fn free(mut self) {
        self.exit_callback.lock().take();
        self.stop.cancel();
        let _ = self.cmd_tx.try_send(ShellCommand::Close);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Shell worker failed: {}", e);
            }
        }
        self.session.disconnect().await;
    }
}
