use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{ConnectionController, ControllerError, Notice};
use crate::codec::ExchangeCode;
use crate::protocol::{CredentialSender, SendError};
use crate::session::SessionSnapshot;
use crate::store::{StateStore, StoredConnection};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("session driver stopped")]
    Stopped,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Initiate(Reply<Result<ExchangeCode, ControllerError>>),
    SubmitOffer {
        code: String,
        reply: Reply<Result<ExchangeCode, ControllerError>>,
    },
    SubmitAnswer {
        code: String,
        reply: Reply<Result<(), ControllerError>>,
    },
    SendCredential {
        value: String,
        reply: Reply<Result<(), DriverError>>,
    },
    Reconnect(Reply<()>),
    Teardown(Reply<()>),
    Snapshot(Reply<SessionSnapshot>),
}

/// Runs a controller on its own task. Commands and transport events are
/// handled strictly one at a time.
pub struct SessionDriver {
    controller: ConnectionController,
    commands: mpsc::UnboundedReceiver<Command>,
    sender: CredentialSender,
}

impl SessionDriver {
    pub fn spawn(controller: ConnectionController) -> SessionHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let notices = controller.notice_sender();
        let store = controller.store();
        let sender = controller.credential_sender();
        let driver = SessionDriver {
            controller,
            commands,
            sender,
        };
        let task = tokio::spawn(driver.run());
        SessionHandle {
            commands: tx,
            notices,
            store,
            task,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.execute(command).await;
                }
                Some(event) = self.controller.next_event() => {
                    trace!(target: "pastelink::driver", ?event, "session event");
                    self.controller.handle_event(event).await;
                }
            }
        }
        debug!(target: "pastelink::driver", "all handles dropped; shutting down");
        self.controller.teardown().await;
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Initiate(reply) => {
                let _ = reply.send(self.controller.initiate().await);
            }
            Command::SubmitOffer { code, reply } => {
                let _ = reply.send(self.controller.submit_offer(&code).await);
            }
            Command::SubmitAnswer { code, reply } => {
                let _ = reply.send(self.controller.submit_answer(&code).await);
            }
            Command::SendCredential { value, reply } => {
                if let Err(err) = self.controller.claim_credential_send() {
                    let _ = reply.send(Err(err.into()));
                    return;
                }
                // the retry loop waits on the channel watch, not on this loop
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = reply.send(sender.send(&value).await.map_err(DriverError::from));
                });
            }
            Command::Reconnect(reply) => {
                self.controller.reconnect().await;
                let _ = reply.send(());
            }
            Command::Teardown(reply) => {
                self.controller.teardown().await;
                let _ = reply.send(());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.controller.snapshot());
            }
        }
    }
}

/// Front end to a running [`SessionDriver`].
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<Notice>,
    store: Arc<dyn StateStore>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| DriverError::Stopped)?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    pub async fn initiate(&self) -> Result<ExchangeCode, DriverError> {
        Ok(self.request(Command::Initiate).await??)
    }

    pub async fn submit_offer(&self, code: &str) -> Result<ExchangeCode, DriverError> {
        let code = code.to_string();
        Ok(self
            .request(|reply| Command::SubmitOffer { code, reply })
            .await??)
    }

    pub async fn submit_answer(&self, code: &str) -> Result<(), DriverError> {
        let code = code.to_string();
        Ok(self
            .request(|reply| Command::SubmitAnswer { code, reply })
            .await??)
    }

    /// Sends the credential over the session's data channel, waiting for the
    /// channel within the configured retry budget. Only a sender may send, and
    /// only once per attempt; a failed send is not retried.
    pub async fn send_credential(&self, value: &str) -> Result<(), DriverError> {
        let value = value.to_string();
        self.request(|reply| Command::SendCredential { value, reply })
            .await?
    }

    pub async fn reconnect(&self) -> Result<(), DriverError> {
        self.request(Command::Reconnect).await
    }

    pub async fn teardown(&self) -> Result<(), DriverError> {
        self.request(Command::Teardown).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, DriverError> {
        self.request(Command::Snapshot).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn connection_info(&self) -> Result<StoredConnection, DriverError> {
        self.store
            .connection_info()
            .await
            .map_err(|err| DriverError::Controller(err.into()))
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Stops the driver and waits for it to release the session.
    pub async fn shutdown(self) {
        let SessionHandle { commands, task, .. } = self;
        drop(commands);
        let _ = task.await;
    }
}
