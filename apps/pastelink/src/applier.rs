//! Applying a received credential to its target.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use copypasta::{ClipboardContext, ClipboardProvider};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::session::Role;
use crate::store::{StateStore, StoreError};

const APPLY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome of a successful apply. `toggle_disabled` and `warning` are
/// informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub toggle_disabled: bool,
    pub warning: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("no target found for the credential: {0}")]
    ApplierNotFound(String),
    #[error("password filling is only available for receivers")]
    NotReceiver,
    #[error("no password available")]
    NoCredential,
    #[error("failed to apply credential: {0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait CredentialApplier: Send + Sync {
    async fn apply_credential(&self, value: &str) -> Result<ApplyReport, ApplyError>;
}

/// Applies the stored credential. Only a receiver holding a credential may
/// fill; a missing target gets one more try after a short pause. The
/// credential is forgotten once applied.
pub async fn fill_credential(
    store: &dyn StateStore,
    applier: &dyn CredentialApplier,
) -> Result<ApplyReport, ApplyError> {
    let info = store.connection_info().await?;
    if info.role != Some(Role::Receiver) {
        return Err(ApplyError::NotReceiver);
    }
    let value = store.credential().await?.ok_or(ApplyError::NoCredential)?;

    let report = match applier.apply_credential(&value).await {
        Err(ApplyError::ApplierNotFound(reason)) => {
            warn!(target: "pastelink::applier", %reason, "target not ready; retrying once");
            sleep(APPLY_RETRY_DELAY).await;
            applier.apply_credential(&value).await?
        }
        other => other?,
    };
    store.clear_credential().await?;
    info!(
        target: "pastelink::applier",
        toggle_disabled = report.toggle_disabled,
        "credential applied"
    );
    Ok(report)
}

/// Places the credential on the system clipboard.
#[derive(Debug, Default)]
pub struct ClipboardApplier;

#[async_trait]
impl CredentialApplier for ClipboardApplier {
    async fn apply_credential(&self, value: &str) -> Result<ApplyReport, ApplyError> {
        let mut clipboard = ClipboardContext::new()
            .map_err(|err| ApplyError::ApplierNotFound(format!("clipboard unavailable: {err}")))?;
        clipboard
            .set_contents(value.to_owned())
            .map_err(|err| ApplyError::Failed(err.to_string()))?;
        Ok(ApplyReport {
            toggle_disabled: false,
            warning: Some("the credential stays on the clipboard until it is overwritten".into()),
        })
    }
}

/// Prints the credential on stdout, for headless machines and pipes.
#[derive(Debug, Default)]
pub struct StdoutApplier;

#[async_trait]
impl CredentialApplier for StdoutApplier {
    async fn apply_credential(&self, value: &str) -> Result<ApplyReport, ApplyError> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{value}")
            .and_then(|_| stdout.flush())
            .map_err(|err| ApplyError::Failed(err.to_string()))?;
        Ok(ApplyReport::default())
    }
}
